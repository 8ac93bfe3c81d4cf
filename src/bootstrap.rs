//! Staging of the companion bootstrap scripts.
//!
//! The companion process needs two scripts on disk at launch time: the
//! environment-check script run during the probe, and the server script that
//! implements the companion side of the wire protocol. Reference copies of
//! both are embedded in the crate; they are staged into a temp directory that
//! lives as long as the session.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::error::Result;

/// Embedded environment-check script (probe mode, no socket).
pub const CHECK_SCRIPT_SOURCE: &str = include_str!("../resources/py/pyCheck.py");

/// Embedded companion server script (args: `pyServer.py PORT [debug]`).
pub const SERVER_SCRIPT_SOURCE: &str = include_str!("../resources/py/pyServer.py");

/// Bootstrap scripts written to a temp directory.
///
/// Dropping this removes the directory, so it must outlive the companion
/// process; [`crate::supervisor::LaunchConfig`] carries it for that reason.
#[derive(Debug)]
pub struct StagedScripts {
    // Held for its Drop: deletes the staged files.
    _dir: TempDir,
    check_script: PathBuf,
    server_script: PathBuf,
}

impl StagedScripts {
    /// Stage the embedded reference scripts.
    pub fn stage_embedded() -> Result<StagedScripts> {
        Self::stage(CHECK_SCRIPT_SOURCE, SERVER_SCRIPT_SOURCE)
    }

    /// Stage caller-supplied script sources.
    pub fn stage(check_source: &str, server_source: &str) -> Result<StagedScripts> {
        let dir = tempfile::Builder::new().prefix("pybridge-py-").tempdir()?;
        let check_script = dir.path().join("pyCheck.py");
        let server_script = dir.path().join("pyServer.py");
        fs::write(&check_script, check_source)?;
        fs::write(&server_script, server_source)?;
        log::debug!("staged bootstrap scripts in {}", dir.path().display());
        Ok(StagedScripts {
            _dir: dir,
            check_script,
            server_script,
        })
    }

    /// Path of the staged environment-check script.
    pub fn check_script(&self) -> &Path {
        &self.check_script
    }

    /// Path of the staged server script.
    pub fn server_script(&self) -> &Path {
        &self.server_script
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_files_exist_and_hold_sources() {
        let staged = StagedScripts::stage("# check", "# server").unwrap();
        assert_eq!(std::fs::read_to_string(staged.check_script()).unwrap(), "# check");
        assert_eq!(
            std::fs::read_to_string(staged.server_script()).unwrap(),
            "# server"
        );
    }

    #[test]
    fn drop_removes_the_staging_directory() {
        let staged = StagedScripts::stage("a", "b").unwrap();
        let check = staged.check_script().to_path_buf();
        drop(staged);
        assert!(!check.exists());
    }

    #[test]
    fn embedded_scripts_are_non_empty() {
        assert!(CHECK_SCRIPT_SOURCE.contains("import"));
        assert!(SERVER_SCRIPT_SOURCE.contains("pid_response"));
    }
}
