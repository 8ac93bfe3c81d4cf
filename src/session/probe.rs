//! Output-shape discovery: run a script against synthetic input and see
//! what the named output variable turns out to be.
//!
//! Used before any real data flows, so a caller can size its downstream
//! plumbing for a frame schema, an image, or a plain value.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{PyBridgeError, Result};
use crate::schema::{ColumnType, FrameSchema, Row, Value, VariableKind};
use crate::session::SessionGuard;

/// Fixed seed so repeated probes see identical synthetic data.
const PROBE_SEED: u64 = 1;

/// How many synthetic rows a probe pushes.
pub const PROBE_ROW_COUNT: usize = 100;

/// What the probed output variable turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbedOutput {
    /// A data frame with this schema.
    Frame(FrameSchema),
    /// A figure; fetch it with `get_image`.
    Image,
    /// A plain value; fetch it as a string.
    Scalar,
}

/// Input side of a probe: the frame the script expects to find.
#[derive(Debug, Clone)]
pub struct ProbeInput<'a> {
    /// Name the script reads the frame under.
    pub frame_name: &'a str,
    /// Schema of the synthetic rows to push.
    pub schema: &'a FrameSchema,
}

/// Run `script` against synthetic input and classify `output_variable`.
///
/// Fails if the script errors or never sets the output variable.
pub fn discover_output_shape(
    guard: &SessionGuard<'_>,
    script: &str,
    input: Option<ProbeInput<'_>>,
    output_variable: &str,
) -> Result<ProbedOutput> {
    if let Some(input) = input {
        let rows = synthetic_rows(input.schema, PROBE_ROW_COUNT);
        guard.push_rows(input.frame_name, input.schema, &rows)?;
    }

    let output = guard.execute_script(script)?;
    if !output.stderr.is_empty() {
        return Err(PyBridgeError::Companion(output.stderr));
    }
    if !guard.variable_is_set(output_variable)? {
        return Err(PyBridgeError::Companion(format!(
            "script did not set the output variable `{output_variable}`"
        )));
    }

    match guard.variable_kind(output_variable)? {
        VariableKind::DataFrame => {
            let (schema, _) = guard.pull_frame(output_variable, false)?;
            Ok(ProbedOutput::Frame(schema))
        }
        VariableKind::Image => Ok(ProbedOutput::Image),
        VariableKind::String | VariableKind::Unknown => Ok(ProbedOutput::Scalar),
    }
}

/// Deterministic synthetic rows conforming to `schema`.
pub fn synthetic_rows(schema: &FrameSchema, count: usize) -> Vec<Row> {
    let mut rng = StdRng::seed_from_u64(PROBE_SEED);
    let now = Utc::now().timestamp_millis();
    (0..count)
        .map(|_| {
            schema
                .columns()
                .iter()
                .map(|col| match &col.column_type {
                    ColumnType::Number => Value::Number(rng.random::<f64>() * 100.0),
                    ColumnType::Boolean => Value::Bool(rng.random_bool(0.5)),
                    ColumnType::Date { .. } => {
                        Value::Date(now + (rng.random::<f64>() * 100_000.0) as i64)
                    }
                    ColumnType::String => Value::Text(
                        if rng.random_bool(0.5) { "value1" } else { "value2" }.to_string(),
                    ),
                })
                .collect()
        })
        .collect()
}
