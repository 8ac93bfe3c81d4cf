//! Crate-wide error taxonomy.
//!
//! Every failure surfaced by this crate is one of these variants. Lower-level
//! I/O and parse errors are wrapped rather than leaked, and any error text
//! supplied by the companion process is carried verbatim. Nothing in this
//! crate retries transparently; retry policy belongs to the caller.

use thiserror::Error;

/// Errors produced by the session, protocol, and supervisor layers.
#[derive(Debug, Error)]
pub enum PyBridgeError {
    /// The Python environment is missing required libraries or capabilities.
    ///
    /// `details` is the combined output of the environment-check script,
    /// verbatim. This is the primary diagnostic for "environment not usable"
    /// and is fatal to session initialization.
    #[error("python environment unusable:\n{details}")]
    EnvironmentUnavailable {
        /// Combined probe output, exactly as captured.
        details: String,
    },

    /// The companion process could not be launched or never connected back.
    #[error("failed to start companion process: {0}")]
    ProcessStart(String),

    /// The companion connected but did not complete the PID handshake.
    #[error("startup handshake failed: {0}")]
    Handshake(String),

    /// A bulk row push or pull was rejected by the companion.
    #[error("row transfer failed: {0}")]
    Transfer(String),

    /// A response identified a different variable or frame than requested.
    ///
    /// Always fatal: it means the request/response stream has desynchronized.
    #[error("companion answered for the wrong {kind}: requested `{expected}`, got `{got}`")]
    ProtocolMismatch {
        /// What kind of name mismatched ("frame" or "variable").
        kind: &'static str,
        /// The name sent in the request.
        expected: String,
        /// The name echoed back by the companion.
        got: String,
    },

    /// CSV row data could not be decoded against the expected schema.
    #[error("malformed row data: {0}")]
    MalformedRowData(String),

    /// The peer closed the stream in the middle of a length-prefixed frame.
    #[error("stream closed mid-frame")]
    TruncatedStream,

    /// No live session exists (never initialized, or already shut down).
    #[error("no live companion session")]
    SessionUnavailable,

    /// The companion returned a non-ok acknowledgement; text is verbatim.
    #[error("companion error: {0}")]
    Companion(String),

    /// A column type the wire protocol cannot represent (serializable or
    /// binary storage). These fail fast rather than silently stringify.
    #[error("unsupported column type `{ty}` for field `{name}`")]
    UnsupportedColumn {
        /// Column name from the engine schema.
        name: String,
        /// Engine type name.
        ty: String,
    },

    /// Socket or process I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding of a command/ack failed.
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PyBridgeError>;
