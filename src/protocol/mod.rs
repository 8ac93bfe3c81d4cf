//! Command/acknowledgement message shapes for the companion protocol.
//!
//! Every request is a JSON map with a `command` discriminator; every
//! acknowledgement is a JSON map with a `response` discriminator:
//!
//! - `ok` — success, with command-specific payload fields
//! - `row_meta` — a frame header (schema + row count)
//! - `pid_response` — the startup handshake
//! - anything else — an error, with the text in `error_message`
//!
//! Commands are modeled as a tagged enum so a missing field is a compile-time
//! impossibility on the send side; acknowledgement payloads are decoded into
//! per-command structs after the discriminator has been matched.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{PyBridgeError, Result};
use crate::schema::{Column, ColumnType, FrameSchema};

/// Sentinel written for a date column with no engine format configured.
const DATE_FORMAT_NONE: &str = "none";

/// Marker the companion puts in stderr for non-fatal library warnings.
pub const BENIGN_WARNING_MARKER: &str = "Warning:";

// ─── Requests ──────────────────────────────────────────────────────────────

/// Encoding requested for `get_variable_value`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ValueEncoding {
    /// Plain `str()` form.
    #[serde(rename = "string")]
    Plain,
    /// Pickled (and base64-wrapped on Python 3) form.
    #[serde(rename = "pickled")]
    Pickled,
}

/// A request to the companion process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Push rows: this header frame is followed by one CSV body frame when
    /// `num_rows > 0`.
    AcceptRows {
        /// Number of rows in the body frame.
        num_rows: usize,
        /// Schema of the pushed frame.
        row_meta: FrameMeta,
        /// Echo companion debug output.
        debug: bool,
    },
    /// Pull a named frame back as a header plus CSV body.
    GetFrame {
        /// Companion-side frame variable name.
        frame_name: String,
        /// Include the frame's row index as a leading field.
        include_index: bool,
        /// Echo companion debug output.
        debug: bool,
    },
    /// Execute a script; stdout/stderr are captured and returned.
    ExecuteScript {
        /// Script text, newline-terminated.
        script: String,
        /// Echo companion debug output.
        debug: bool,
    },
    /// Ask whether a variable is set.
    VariableIsSet {
        /// Variable to check.
        variable_name: String,
        /// Echo companion debug output.
        debug: bool,
    },
    /// Ask for a variable's classification.
    GetVariableType {
        /// Variable to classify.
        variable_name: String,
        /// Echo companion debug output.
        debug: bool,
    },
    /// Fetch a variable's value in string or pickled form.
    GetVariableValue {
        /// Variable to fetch.
        variable_name: String,
        /// Requested encoding.
        variable_encoding: ValueEncoding,
        /// Echo companion debug output.
        debug: bool,
    },
    /// Fetch a figure variable as PNG data.
    GetImage {
        /// Variable holding the figure.
        variable_name: String,
        /// Echo companion debug output.
        debug: bool,
    },
    /// Drain and reset the companion's captured stdout/stderr buffers.
    GetDebugBuffer,
    /// Ask the companion to exit.
    Shutdown,
}

impl Command {
    /// Serialize to the JSON wire form, logging the command at debug level.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("sending command: {}", String::from_utf8_lossy(&bytes));
        }
        Ok(bytes)
    }
}

/// The per-command debug flag mirrors whether debug logging is enabled.
pub fn debug_flag() -> bool {
    log::log_enabled!(log::Level::Debug)
}

// ─── Frame metadata ────────────────────────────────────────────────────────

/// JSON schema header for a named frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameMeta {
    /// Frame variable name.
    pub frame_name: String,
    /// Ordered field list.
    pub fields: Vec<FieldSpec>,
}

/// One field in a [`FrameMeta`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldSpec {
    /// Field name.
    pub name: String,
    /// Wire type discriminator.
    #[serde(rename = "type")]
    pub field_type: WireType,
    /// Only present for date fields; `"none"` when no format is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_format: Option<String>,
}

/// The four wire-level field types. Anything else in a header is a protocol
/// violation and fails decoding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WireType {
    /// Floating-point number.
    Number,
    /// UTF-8 text.
    String,
    /// Boolean.
    Boolean,
    /// Epoch-millis date.
    Date,
}

impl FrameMeta {
    /// Build the wire header for a schema.
    pub fn from_schema(frame_name: &str, schema: &FrameSchema) -> FrameMeta {
        let fields = schema
            .columns()
            .iter()
            .map(|col| match &col.column_type {
                ColumnType::Number => FieldSpec {
                    name: col.name.clone(),
                    field_type: WireType::Number,
                    date_format: None,
                },
                ColumnType::String => FieldSpec {
                    name: col.name.clone(),
                    field_type: WireType::String,
                    date_format: None,
                },
                ColumnType::Boolean => FieldSpec {
                    name: col.name.clone(),
                    field_type: WireType::Boolean,
                    date_format: None,
                },
                ColumnType::Date { format } => FieldSpec {
                    name: col.name.clone(),
                    field_type: WireType::Date,
                    date_format: Some(
                        format.clone().unwrap_or_else(|| DATE_FORMAT_NONE.to_string()),
                    ),
                },
            })
            .collect();
        FrameMeta {
            frame_name: frame_name.to_string(),
            fields,
        }
    }

    /// Convert a received header back into a schema.
    pub fn to_schema(&self) -> Result<FrameSchema> {
        let columns = self
            .fields
            .iter()
            .map(|f| {
                let column_type = match f.field_type {
                    WireType::Number => ColumnType::Number,
                    WireType::String => ColumnType::String,
                    WireType::Boolean => ColumnType::Boolean,
                    WireType::Date => ColumnType::Date {
                        format: f
                            .date_format
                            .clone()
                            .filter(|fmt| fmt != DATE_FORMAT_NONE),
                    },
                };
                Column::new(f.name.clone(), column_type)
            })
            .collect();
        FrameSchema::new(columns)
    }
}

// ─── Acknowledgements ──────────────────────────────────────────────────────

/// Payload of an `ok` ack to `execute_script`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ScriptOutput {
    /// Captured stdout.
    #[serde(rename = "script_out")]
    pub stdout: String,
    /// Captured stderr. Empty means success.
    #[serde(rename = "script_error")]
    pub stderr: String,
}

/// Payload of an `ok` ack to `variable_is_set`.
#[derive(Debug, Deserialize)]
pub struct VariableIsSetAck {
    /// Echoed variable name, validated against the request.
    pub variable_name: String,
    /// Whether the variable exists.
    pub variable_exists: bool,
}

/// Payload of an `ok` ack to `get_variable_type`.
#[derive(Debug, Deserialize)]
pub struct VariableTypeAck {
    /// Echoed variable name, validated against the request.
    pub variable_name: String,
    /// Companion-side classification string.
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Payload of an `ok` ack to `get_variable_value`.
#[derive(Debug, Deserialize)]
pub struct VariableValueAck {
    /// Echoed variable name, validated against the request.
    pub variable_name: String,
    /// Value in the requested encoding.
    pub variable_value: String,
}

/// Payload of an `ok` ack to `get_image`.
#[derive(Debug, Deserialize)]
pub struct ImageAck {
    /// Echoed variable name, validated against the request.
    pub variable_name: String,
    /// `base64` or `string`.
    pub encoding: String,
    /// PNG data in the named encoding.
    pub image_data: String,
}

/// Payload of an `ok` ack to `get_debug_buffer`.
#[derive(Debug, Deserialize)]
pub struct DebugBufferAck {
    /// Companion stdout buffer contents.
    #[serde(default)]
    pub std_out: String,
    /// Companion stderr buffer contents.
    #[serde(default)]
    pub std_err: String,
}

/// A `row_meta` frame header ack (response to `get_frame`).
#[derive(Debug, Deserialize)]
pub struct FrameHeaderAck {
    /// Echoed frame name, validated against the request.
    pub frame_name: String,
    /// Field list.
    pub fields: Vec<FieldSpec>,
    /// Number of rows in the following CSV body frame.
    pub num_rows: usize,
}

/// Parse raw ack bytes into a JSON map.
pub fn parse_ack(bytes: &[u8]) -> Result<Json> {
    Ok(serde_json::from_slice(bytes)?)
}

fn response_discriminator(ack: &Json) -> Result<&str> {
    ack.get("response")
        .and_then(Json::as_str)
        .ok_or_else(|| PyBridgeError::Handshake("ack carries no response field".into()))
}

fn error_text(ack: &Json) -> String {
    ack.get("error_message")
        .and_then(Json::as_str)
        .unwrap_or("companion supplied no error message")
        .to_string()
}

/// Match an `ok` ack and decode its payload, or surface the companion's
/// error text.
pub fn expect_ok<T: serde::de::DeserializeOwned>(ack: Json) -> Result<T> {
    match response_discriminator(&ack)? {
        "ok" => Ok(serde_json::from_value(ack)?),
        _ => Err(PyBridgeError::Companion(error_text(&ack))),
    }
}

/// Match a bare `ok` ack with no payload of interest.
pub fn expect_ok_unit(ack: Json) -> Result<()> {
    match response_discriminator(&ack)? {
        "ok" => Ok(()),
        _ => Err(PyBridgeError::Companion(error_text(&ack))),
    }
}

/// Match a `row_meta` header ack.
pub fn expect_row_meta(ack: Json) -> Result<FrameHeaderAck> {
    match response_discriminator(&ack)? {
        "row_meta" => Ok(serde_json::from_value(ack)?),
        "ok" => Err(PyBridgeError::Companion(
            "expected a row_meta header, got a bare ok".into(),
        )),
        _ => Err(PyBridgeError::Companion(error_text(&ack))),
    }
}

/// Match the startup `pid_response` handshake ack.
pub fn expect_pid(ack: Json) -> Result<u32> {
    match response_discriminator(&ack)
        .map_err(|_| PyBridgeError::Handshake("first frame carries no response field".into()))?
    {
        "pid_response" => ack
            .get("pid")
            .and_then(Json::as_u64)
            .map(|pid| pid as u32)
            .ok_or_else(|| PyBridgeError::Handshake("pid_response carries no pid".into())),
        other => Err(PyBridgeError::Handshake(format!(
            "expected pid_response, got `{other}`"
        ))),
    }
}

/// Validate a name echoed back by the companion against the request.
pub fn check_echo(kind: &'static str, expected: &str, got: &str) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(PyBridgeError::ProtocolMismatch {
            kind,
            expected: expected.to_string(),
            got: got.to_string(),
        })
    }
}
