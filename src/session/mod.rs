//! The session: single-occupancy access to one companion process.
//!
//! A [`Session`] owns a [`Supervisor`] and hands out [`SessionGuard`]s, one
//! client at a time, through the re-entrant [`TicketLock`]. All protocol
//! traffic flows through a guard, so two clients can never interleave
//! command/ack pairs on the shared stream.

pub mod probe;
mod ticket;

pub use ticket::{ClientId, TicketLock};

use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value as Json;

use crate::codec::{self, csv};
use crate::error::{PyBridgeError, Result};
use crate::protocol::{
    self, Command, DebugBufferAck, FrameMeta, ImageAck, ScriptOutput, ValueEncoding,
    VariableIsSetAck, VariableTypeAck, VariableValueAck,
};
use crate::schema::{FrameSchema, Row, VariableKind};
use crate::supervisor::{LaunchConfig, Launcher, PythonLauncher, Supervisor, TeardownHandle};

#[derive(Debug)]
struct SessionInner {
    supervisor: Mutex<Supervisor>,
    // Teardown state lives outside the supervisor mutex: a command round
    // trip holds the supervisor across a read with no timeout, and shutdown
    // must be able to kill a wedged companion anyway.
    teardown: TeardownHandle,
    lock: TicketLock,
}

/// Handle to a running companion session. Cheap to clone; all clones share
/// the one companion process.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Probe the environment, launch the companion, and complete the
    /// handshake.
    pub fn initialize(config: LaunchConfig) -> Result<Session> {
        Session::initialize_with(config, &mut PythonLauncher)
    }

    /// As [`initialize`](Session::initialize), with a caller-supplied
    /// launcher (an externally managed companion, or a test double).
    pub fn initialize_with(config: LaunchConfig, launcher: &mut dyn Launcher) -> Result<Session> {
        let supervisor = Supervisor::start(config, launcher)?;
        let teardown = supervisor.teardown_handle()?;
        Ok(Session {
            inner: Arc::new(SessionInner {
                supervisor: Mutex::new(supervisor),
                teardown,
                lock: TicketLock::new(),
            }),
        })
    }

    /// PID the companion reported in the handshake.
    pub fn companion_pid(&self) -> Option<u32> {
        self.lock_supervisor().companion_pid()
    }

    /// Block until `client` holds the session, then return a guard. The
    /// holder may acquire again without deadlocking.
    pub fn acquire(&self, client: ClientId) -> SessionGuard<'_> {
        self.inner.lock.acquire(client);
        SessionGuard {
            session: self,
            client,
        }
    }

    /// Release one level of `client`'s hold. Guards do this on drop; calling
    /// it for a non-holder is a no-op.
    pub fn release(&self, client: ClientId) {
        self.inner.lock.release(client);
    }

    /// Tear the companion down. Safe to call repeatedly, concurrently, and
    /// from exit hooks — including while another thread is blocked in a
    /// command round trip against a wedged companion.
    pub fn shutdown(&self) {
        // Never wait for the supervisor: a command in flight holds it for an
        // unbounded time. If it is busy, the teardown handle kills the
        // companion and shuts the socket down, which also unblocks the
        // in-flight reader.
        match self.inner.supervisor.try_lock() {
            Ok(mut sup) => sup.shutdown(),
            Err(TryLockError::Poisoned(sup)) => sup.into_inner().shutdown(),
            Err(TryLockError::WouldBlock) => self.inner.teardown.shutdown(),
        }
    }

    /// Register a Ctrl-C handler that shuts the companion down before the
    /// process exits.
    pub fn install_exit_hook(&self) -> Result<()> {
        let session = self.clone();
        ctrlc::set_handler(move || {
            log::info!("interrupt received, shutting companion down");
            session.shutdown();
            std::process::exit(130);
        })
        .map_err(|e| PyBridgeError::Io(std::io::Error::other(e)))
    }

    fn lock_supervisor(&self) -> std::sync::MutexGuard<'_, Supervisor> {
        self.inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive access to the session for one client. Dropping the guard
/// releases one level of the hold.
#[derive(Debug)]
pub struct SessionGuard<'a> {
    session: &'a Session,
    client: ClientId,
}

impl SessionGuard<'_> {
    /// The client this guard belongs to.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Push a batch of rows into the companion as the frame `frame_name`.
    pub fn push_rows(&self, frame_name: &str, schema: &FrameSchema, rows: &[Row]) -> Result<()> {
        let body = csv::encode_rows(schema, rows)?;
        let command = Command::AcceptRows {
            num_rows: rows.len(),
            row_meta: FrameMeta::from_schema(frame_name, schema),
            debug: protocol::debug_flag(),
        };

        let mut sup = self.session.lock_supervisor();
        let stream = sup.stream_mut()?;
        codec::write_frame(stream, &command.to_wire()?)?;
        if !rows.is_empty() {
            codec::write_frame(stream, body.as_bytes())?;
        }
        let ack = protocol::parse_ack(&codec::read_frame(stream)?)?;
        protocol::expect_ok_unit(ack).map_err(as_transfer_error)
    }

    /// Pull the named frame back: its schema and all of its rows.
    pub fn pull_frame(
        &self,
        frame_name: &str,
        include_index: bool,
    ) -> Result<(FrameSchema, Vec<Row>)> {
        let command = Command::GetFrame {
            frame_name: frame_name.to_string(),
            include_index,
            debug: protocol::debug_flag(),
        };

        let mut sup = self.session.lock_supervisor();
        let stream = sup.stream_mut()?;
        codec::write_frame(stream, &command.to_wire()?)?;

        let header = protocol::expect_row_meta(protocol::parse_ack(&codec::read_frame(stream)?)?)
            .map_err(as_transfer_error)?;
        protocol::check_echo("frame", frame_name, &header.frame_name)?;
        let schema = FrameMeta {
            frame_name: header.frame_name,
            fields: header.fields,
        }
        .to_schema()?;

        let body = codec::read_frame(stream)?;
        let text = String::from_utf8(body)
            .map_err(|e| PyBridgeError::MalformedRowData(format!("body is not UTF-8: {e}")))?;
        let rows = csv::decode_rows(&text, &schema, header.num_rows)?;
        Ok((schema, rows))
    }

    /// Execute a script in the companion. A trailing newline is appended if
    /// missing so the final statement always terminates.
    ///
    /// Library chatter is filtered from stderr: when every non-empty stderr
    /// line carries the warning marker the stderr is reported empty (and the
    /// warnings logged), so spurious warnings do not read as failure.
    pub fn execute_script(&self, script: &str) -> Result<ScriptOutput> {
        let mut script = script.to_string();
        if !script.ends_with('\n') {
            script.push('\n');
        }
        let mut output: ScriptOutput = self.round_trip(Command::ExecuteScript {
            script,
            debug: protocol::debug_flag(),
        })?;
        if !output.stderr.is_empty() && is_benign_warnings(&output.stderr) {
            log::warn!("companion warnings:\n{}", output.stderr);
            output.stderr.clear();
        }
        Ok(output)
    }

    /// Whether `variable_name` is set in the companion environment.
    pub fn variable_is_set(&self, variable_name: &str) -> Result<bool> {
        let ack: VariableIsSetAck = self.round_trip(Command::VariableIsSet {
            variable_name: variable_name.to_string(),
            debug: protocol::debug_flag(),
        })?;
        protocol::check_echo("variable", variable_name, &ack.variable_name)?;
        Ok(ack.variable_exists)
    }

    /// Classify a companion variable.
    pub fn variable_kind(&self, variable_name: &str) -> Result<VariableKind> {
        let ack: VariableTypeAck = self.round_trip(Command::GetVariableType {
            variable_name: variable_name.to_string(),
            debug: protocol::debug_flag(),
        })?;
        protocol::check_echo("variable", variable_name, &ack.variable_name)?;
        Ok(VariableKind::parse(&ack.type_name))
    }

    /// Fetch a variable's value in the requested encoding. Pickled values
    /// arrive base64-wrapped; this returns the wire string either way.
    pub fn variable_value(
        &self,
        variable_name: &str,
        encoding: ValueEncoding,
    ) -> Result<String> {
        let ack: VariableValueAck = self.round_trip(Command::GetVariableValue {
            variable_name: variable_name.to_string(),
            variable_encoding: encoding,
            debug: protocol::debug_flag(),
        })?;
        protocol::check_echo("variable", variable_name, &ack.variable_name)?;
        Ok(ack.variable_value)
    }

    /// Fetch a figure variable as decoded PNG bytes.
    pub fn image(&self, variable_name: &str) -> Result<Vec<u8>> {
        let ack: ImageAck = self.round_trip(Command::GetImage {
            variable_name: variable_name.to_string(),
            debug: protocol::debug_flag(),
        })?;
        protocol::check_echo("variable", variable_name, &ack.variable_name)?;
        if ack.encoding == "base64" {
            BASE64
                .decode(ack.image_data.as_bytes())
                .map_err(|e| PyBridgeError::Transfer(format!("bad image base64: {e}")))
        } else {
            Ok(ack.image_data.into_bytes())
        }
    }

    /// Drain the companion's captured stdout/stderr buffers.
    pub fn debug_buffers(&self) -> Result<DebugBufferAck> {
        self.round_trip(Command::GetDebugBuffer)
    }

    /// One command frame out, one ack frame back, decoded as `T`.
    fn round_trip<T: serde::de::DeserializeOwned>(&self, command: Command) -> Result<T> {
        let mut sup = self.session.lock_supervisor();
        let stream = sup.stream_mut()?;
        codec::write_frame(stream, &command.to_wire()?)?;
        let ack: Json = protocol::parse_ack(&codec::read_frame(stream)?)?;
        protocol::expect_ok(ack)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.session.release(self.client);
    }
}

/// Bulk row rejections surface as transfer errors rather than generic
/// companion errors.
fn as_transfer_error(e: PyBridgeError) -> PyBridgeError {
    match e {
        PyBridgeError::Companion(msg) => PyBridgeError::Transfer(msg),
        other => other,
    }
}

/// True when every non-empty line of `stderr` carries the warning marker.
fn is_benign_warnings(stderr: &str) -> bool {
    stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        .all(|line| line.contains(protocol::BENIGN_WARNING_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_warning_lines_are_benign() {
        let text = "Warning: deprecated call\n  FutureWarning: soon\n";
        assert!(is_benign_warnings(text));
    }

    #[test]
    fn a_real_error_line_is_not_benign() {
        let text = "Warning: deprecated call\nTraceback (most recent call last):\n";
        assert!(!is_benign_warnings(text));
    }

    #[test]
    fn blank_lines_are_ignored_when_filtering() {
        assert!(is_benign_warnings("\n\nWarning: x\n\n"));
    }
}
