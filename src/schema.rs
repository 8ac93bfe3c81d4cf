//! Tabular data model exchanged with the companion process.
//!
//! A [`FrameSchema`] is the structural contract for one named tabular object:
//! an ordered list of uniquely named, typed columns. Column order is
//! significant for the CSV body encoding; the JSON header carries names so
//! order does not matter there.

use crate::error::{PyBridgeError, Result};

/// Semantic type of a column as the wire protocol knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    /// Floating-point number (also carries engine integers and big numbers).
    Number,
    /// UTF-8 text.
    String,
    /// Boolean.
    Boolean,
    /// Date/timestamp as milliseconds since the Unix epoch, with an optional
    /// engine-side format string that rides along in the schema header.
    Date {
        /// Engine display format, if one was configured.
        format: Option<String>,
    },
}

impl ColumnType {
    /// Wire discriminator for this type (`number`, `string`, ...).
    pub fn wire_name(&self) -> &'static str {
        match self {
            ColumnType::Number => "number",
            ColumnType::String => "string",
            ColumnType::Boolean => "boolean",
            ColumnType::Date { .. } => "date",
        }
    }
}

/// Column types as the host engine describes them.
///
/// The engine's type system is wider than the wire protocol's; see
/// [`ColumnType::from_engine`] for the collapse rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    /// Floating point.
    Number,
    /// Integer.
    Integer,
    /// Arbitrary-precision number.
    BigNumber,
    /// Text.
    String,
    /// Date.
    Date,
    /// Timestamp.
    Timestamp,
    /// Boolean.
    Boolean,
    /// Opaque serialized object — not transferable.
    Serializable,
    /// Raw binary — not transferable.
    Binary,
}

impl EngineType {
    fn name(self) -> &'static str {
        match self {
            EngineType::Number => "number",
            EngineType::Integer => "integer",
            EngineType::BigNumber => "bignumber",
            EngineType::String => "string",
            EngineType::Date => "date",
            EngineType::Timestamp => "timestamp",
            EngineType::Boolean => "boolean",
            EngineType::Serializable => "serializable",
            EngineType::Binary => "binary",
        }
    }
}

impl ColumnType {
    /// Map an engine column type onto the wire type system.
    ///
    /// Number/integer/bignumber collapse to [`ColumnType::Number`],
    /// date/timestamp to [`ColumnType::Date`]. Serializable and binary
    /// columns cannot be expressed on the wire and fail fast.
    pub fn from_engine(
        name: &str,
        engine_type: EngineType,
        date_format: Option<String>,
    ) -> Result<ColumnType> {
        match engine_type {
            EngineType::Number | EngineType::Integer | EngineType::BigNumber => {
                Ok(ColumnType::Number)
            }
            EngineType::Date | EngineType::Timestamp => Ok(ColumnType::Date {
                format: date_format,
            }),
            EngineType::Boolean => Ok(ColumnType::Boolean),
            EngineType::String => Ok(ColumnType::String),
            EngineType::Serializable | EngineType::Binary => {
                Err(PyBridgeError::UnsupportedColumn {
                    name: name.to_string(),
                    ty: engine_type.name().to_string(),
                })
            }
        }
    }
}

/// One named, typed column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name. Unique within a schema.
    pub name: String,
    /// Semantic type.
    pub column_type: ColumnType,
}

impl Column {
    /// Create a column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered sequence of uniquely named columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSchema {
    columns: Vec<Column>,
}

impl FrameSchema {
    /// Build a schema, validating that column names are non-empty and unique.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        for (i, col) in columns.iter().enumerate() {
            if col.name.is_empty() {
                return Err(PyBridgeError::MalformedRowData(format!(
                    "column {i} has an empty name"
                )));
            }
            if columns[..i].iter().any(|c| c.name == col.name) {
                return Err(PyBridgeError::MalformedRowData(format!(
                    "duplicate column name `{}`",
                    col.name
                )));
            }
        }
        Ok(Self { columns })
    }

    /// The columns, in order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// True when the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One cell value. `Null` is encoded on the wire as a bare `?` sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Missing value.
    Null,
    /// Numeric cell.
    Number(f64),
    /// Text cell.
    Text(String),
    /// Boolean cell.
    Bool(bool),
    /// Date cell as milliseconds since the Unix epoch.
    Date(i64),
}

/// One row: a fixed-arity tuple conforming to a [`FrameSchema`].
pub type Row = Vec<Value>;

/// Classification of a companion-side variable.
///
/// Resolved per query and never cached — companion state can change between
/// calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    /// A pandas data frame; convertible to rows.
    DataFrame,
    /// A matplotlib figure; retrievable as PNG bytes.
    Image,
    /// A plain string.
    String,
    /// Anything else; retrievable only in string form.
    Unknown,
}

impl VariableKind {
    /// Parse the companion's `type` field. Unrecognized values classify as
    /// [`VariableKind::Unknown`].
    pub fn parse(s: &str) -> VariableKind {
        match s.to_ascii_lowercase().as_str() {
            "dataframe" => VariableKind::DataFrame,
            "image" => VariableKind::Image,
            "string" => VariableKind::String,
            _ => VariableKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_rejects_duplicate_names() {
        let result = FrameSchema::new(vec![
            Column::new("a", ColumnType::Number),
            Column::new("a", ColumnType::String),
        ]);
        assert!(matches!(result, Err(PyBridgeError::MalformedRowData(_))));
    }

    #[test]
    fn schema_rejects_empty_names() {
        let result = FrameSchema::new(vec![Column::new("", ColumnType::Number)]);
        assert!(result.is_err());
    }

    #[test]
    fn engine_numeric_types_collapse_to_number() {
        for ty in [EngineType::Number, EngineType::Integer, EngineType::BigNumber] {
            let mapped = ColumnType::from_engine("n", ty, None).unwrap();
            assert_eq!(mapped, ColumnType::Number);
        }
    }

    #[test]
    fn engine_temporal_types_collapse_to_date() {
        let mapped =
            ColumnType::from_engine("d", EngineType::Timestamp, Some("yyyy-MM-dd".into()))
                .unwrap();
        assert_eq!(
            mapped,
            ColumnType::Date {
                format: Some("yyyy-MM-dd".into())
            }
        );
    }

    #[test]
    fn serializable_and_binary_fail_fast() {
        for ty in [EngineType::Serializable, EngineType::Binary] {
            let result = ColumnType::from_engine("blob", ty, None);
            assert!(matches!(
                result,
                Err(PyBridgeError::UnsupportedColumn { .. })
            ));
        }
    }

    #[test]
    fn variable_kind_parses_case_insensitively() {
        assert_eq!(VariableKind::parse("DataFrame"), VariableKind::DataFrame);
        assert_eq!(VariableKind::parse("image"), VariableKind::Image);
        assert_eq!(VariableKind::parse("STRING"), VariableKind::String);
        assert_eq!(VariableKind::parse("ndarray"), VariableKind::Unknown);
    }
}
