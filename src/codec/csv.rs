//! Bulk row codec: the CSV dialect used for tabular payloads.
//!
//! The dialect is not RFC 4180. Values are single-quote wrapped and
//! backslash-escaped, nulls are a bare `?` sentinel, and lines are joined
//! with the reserved `#||#` delimiter instead of a newline — cell values may
//! legitimately contain embedded CR/LF, which would otherwise corrupt row
//! boundaries. Raw CR/LF arriving from the companion are stashed as `<cr>` /
//! `<lf>` placeholder tokens around tokenization and restored afterwards.
//!
//! Cell encodings: null → `?`, number → decimal text, date → epoch millis,
//! boolean → `1`/`0`, text → quoted per [`quote`].

use chrono::NaiveDateTime;

use crate::error::{PyBridgeError, Result};
use crate::schema::{ColumnType, FrameSchema, Row, Value};

/// Reserved multi-character line delimiter.
pub const ROW_DELIMITER: &str = "#||#";

/// Null sentinel.
pub const MISSING_VALUE: &str = "?";

/// Datetime literal format the companion may use for date cells.
const COMPANION_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

const STASH_LF: &str = "<lf>";
const STASH_CR: &str = "<cr>";

/// Characters that trigger backslash escaping.
const ESCAPED_CHARS: [char; 8] = ['\\', '\'', '\t', '\n', '\r', '"', '%', '\u{1E}'];

/// Encode a batch of rows conforming to `schema`.
///
/// The first line is the comma-joined, individually quoted column names;
/// each subsequent line is one row. Lines are joined with [`ROW_DELIMITER`].
pub fn encode_rows(schema: &FrameSchema, rows: &[Row]) -> Result<String> {
    let mut lines = Vec::with_capacity(rows.len() + 1);

    let header: Vec<String> = schema.columns().iter().map(|c| quote(&c.name)).collect();
    lines.push(header.join(","));

    for (row_idx, row) in rows.iter().enumerate() {
        if row.len() != schema.len() {
            return Err(PyBridgeError::MalformedRowData(format!(
                "row {row_idx} has {} cells, schema has {} columns",
                row.len(),
                schema.len()
            )));
        }
        let mut cells = Vec::with_capacity(row.len());
        for (col, value) in schema.columns().iter().zip(row) {
            cells.push(encode_cell(&col.name, &col.column_type, value)?);
        }
        lines.push(cells.join(","));
    }

    Ok(lines.join(ROW_DELIMITER))
}

fn encode_cell(name: &str, column_type: &ColumnType, value: &Value) -> Result<String> {
    let cell = match (column_type, value) {
        (_, Value::Null) => MISSING_VALUE.to_string(),
        (ColumnType::Number, Value::Number(n)) => n.to_string(),
        (ColumnType::Boolean, Value::Bool(b)) => if *b { "1" } else { "0" }.to_string(),
        (ColumnType::Date { .. }, Value::Date(millis)) => millis.to_string(),
        (ColumnType::String, Value::Text(s)) => quote(s),
        (expected, got) => {
            return Err(PyBridgeError::MalformedRowData(format!(
                "column `{name}` expects {} but cell holds {got:?}",
                expected.wire_name()
            )))
        }
    };
    Ok(cell)
}

/// Decode `row_count` rows of CSV produced by the companion (or by
/// [`encode_rows`]) against `schema`.
///
/// The placeholder restore is unconditional, matching the companion's
/// encoding: a string cell whose literal text contains `<lf>`/`<cr>` decodes
/// to the control characters those tokens stand for.
pub fn decode_rows(text: &str, schema: &FrameSchema, row_count: usize) -> Result<Vec<Row>> {
    let mut lines = text.split(ROW_DELIMITER).filter(|l| !l.is_empty());

    let header = lines
        .next()
        .ok_or_else(|| PyBridgeError::MalformedRowData("empty CSV payload".into()))?;
    check_header(header, schema)?;

    let mut rows = Vec::with_capacity(row_count);
    for line in lines {
        // Stash raw CR/LF so embedded newlines cannot break tokenization;
        // restored below for string cells only.
        let stashed = line.replace('\n', STASH_LF).replace('\r', STASH_CR);
        let tokens = parse_line(&stashed)?;
        if tokens.len() != schema.len() {
            return Err(PyBridgeError::MalformedRowData(format!(
                "row {} has {} cells, schema has {} columns",
                rows.len(),
                tokens.len(),
                schema.len()
            )));
        }

        let mut row = Vec::with_capacity(schema.len());
        for (col, token) in schema.columns().iter().zip(tokens) {
            row.push(decode_cell(&col.name, &col.column_type, &token)?);
        }
        rows.push(row);
    }

    if rows.len() != row_count {
        return Err(PyBridgeError::MalformedRowData(format!(
            "expected {row_count} rows, decoded {}",
            rows.len()
        )));
    }
    Ok(rows)
}

fn check_header(header: &str, schema: &FrameSchema) -> Result<()> {
    let names = parse_line(header)?;
    if names.len() != schema.len() {
        return Err(PyBridgeError::MalformedRowData(format!(
            "header has {} columns, schema has {}",
            names.len(),
            schema.len()
        )));
    }
    for (token, col) in names.iter().zip(schema.columns()) {
        if token.text != col.name {
            return Err(PyBridgeError::MalformedRowData(format!(
                "header column `{}` does not match schema column `{}`",
                token.text, col.name
            )));
        }
    }
    Ok(())
}

fn decode_cell(name: &str, column_type: &ColumnType, token: &Token) -> Result<Value> {
    // A bare `?` is null; a quoted `'?'` is the literal one-character string.
    if !token.quoted && token.text == MISSING_VALUE {
        return Ok(Value::Null);
    }

    let value = match column_type {
        ColumnType::Number => Value::Number(token.text.parse::<f64>().map_err(|_| {
            PyBridgeError::MalformedRowData(format!(
                "column `{name}`: `{}` is not a number",
                token.text
            ))
        })?),
        ColumnType::Boolean => Value::Bool(matches!(
            token.text.to_ascii_lowercase().as_str(),
            "true" | "1"
        )),
        ColumnType::Date { .. } => Value::Date(parse_date_millis(name, &token.text)?),
        ColumnType::String => Value::Text(
            token
                .text
                .replace(STASH_LF, "\n")
                .replace(STASH_CR, "\r"),
        ),
    };
    Ok(value)
}

/// Date cells arrive either as epoch-millis integers (our own encoding) or
/// as `yyyy-MM-dd HH:mm:ss.SSS` literals (pandas output).
fn parse_date_millis(name: &str, text: &str) -> Result<i64> {
    if let Ok(millis) = text.parse::<i64>() {
        return Ok(millis);
    }
    NaiveDateTime::parse_from_str(text, COMPANION_DATE_FORMAT)
        .map(|dt| dt.and_utc().timestamp_millis())
        .map_err(|_| {
            PyBridgeError::MalformedRowData(format!("column `{name}`: `{text}` is not a date"))
        })
}

/// Quote a string cell for the wire.
///
/// The value is backslash-escaped for ``\ ' \t \n \r " % \x1E`` and then
/// wrapped in single quotes if any escaping occurred OR it contains one of
/// `{ } , ? space` or is empty.
pub fn quote(s: &str) -> String {
    let escaped = s.contains(ESCAPED_CHARS);
    let body = if escaped { backquote(s) } else { s.to_string() };

    let wrap = escaped
        || body.is_empty()
        || body.contains(['{', '}', ',', '?', ' ']);
    if wrap {
        format!("'{body}'")
    } else {
        body
    }
}

fn backquote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if ESCAPED_CHARS.contains(&c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// A parsed cell token. `quoted` distinguishes a literal `'?'` from the
/// bare null sentinel.
#[derive(Debug, PartialEq, Eq)]
struct Token {
    text: String,
    quoted: bool,
}

/// Tokenize one CSV line of the dialect: comma-separated, single-quote
/// wrapped, backslash-escaped.
fn parse_line(line: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        let mut text = String::new();
        let mut quoted = false;

        if let Some(&'\'') = chars.peek() {
            // Quoted field: consume up to the closing quote.
            chars.next();
            quoted = true;
            loop {
                match chars.next() {
                    Some('\\') => text.push(unescape(chars.next().ok_or_else(|| {
                        PyBridgeError::MalformedRowData("dangling escape at end of line".into())
                    })?)),
                    Some('\'') => break,
                    Some(c) => text.push(c),
                    None => {
                        return Err(PyBridgeError::MalformedRowData(
                            "unterminated quoted value".into(),
                        ))
                    }
                }
            }
            // Only a separator (or end of line) may follow a closing quote.
            match chars.next() {
                None => {
                    tokens.push(Token { text, quoted });
                    break;
                }
                Some(',') => {}
                Some(c) => {
                    return Err(PyBridgeError::MalformedRowData(format!(
                        "unexpected `{c}` after closing quote"
                    )))
                }
            }
        } else {
            // Bare field: read to the next separator.
            let mut terminated = false;
            for c in chars.by_ref() {
                match c {
                    ',' => {
                        terminated = true;
                        break;
                    }
                    '\\' => {
                        // Tolerated outside quotes for companion leniency.
                        text.push('\\');
                    }
                    c => text.push(c),
                }
            }
            if !terminated {
                tokens.push(Token { text, quoted });
                break;
            }
        }

        tokens.push(Token { text, quoted });
    }

    Ok(tokens)
}

fn unescape(c: char) -> char {
    match c {
        't' => '\t',
        'n' => '\n',
        'r' => '\r',
        c => c,
    }
}
