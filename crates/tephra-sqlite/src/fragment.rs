//! Templated SQL fragments with typed interpolation modes.
//!
//! A fragment is built from literal chunks and interpolated JSON values.
//! The mode of each value is taken from the tag at the head of the chunk
//! that follows it:
//!
//! - no tag: ordinary `?` bind
//! - `ID`: quoted identifier, spliced into the SQL text
//! - `LIT`: the value's literal text, spliced verbatim
//! - `JSON`: the value's JSON encoding, bound as text
//!
//! A tag only counts when the chunk's leading uppercase run equals it and
//! the run is not followed by another word character, so `IDs`, `JSONs`,
//! and `LITs` stay plain text.

use rusqlite::types::Value;
use serde_json::Value as Json;
use tephra_core::{Result, TephraError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Id,
    Lit,
    Json,
}

/// A piece of SQL plus the values bound to its `?` placeholders.
///
/// Every connection and prepared-statement operation accepts a fragment
/// (or anything `Into<SqlFragment>`: a plain `&str`, or a `(sql, binds)`
/// pair).
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    sql: String,
    binds: Vec<Value>,
}

impl SqlFragment {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            binds: Vec::new(),
        }
    }

    pub fn with_binds(sql: impl Into<String>, binds: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            binds,
        }
    }

    /// Build a fragment from literal chunks `s0..sN` and values `v1..vN`.
    ///
    /// `chunks.len()` must be `values.len() + 1`; value `i` sits between
    /// `chunks[i]` and `chunks[i + 1]`, and takes its mode from the tag
    /// consumed off the head of `chunks[i + 1]`.
    pub fn interpolate(chunks: &[&str], values: &[Json]) -> Result<Self> {
        if chunks.len() != values.len() + 1 {
            return Err(TephraError::Config(format!(
                "sql template needs {} chunks for {} values, got {}",
                values.len() + 1,
                values.len(),
                chunks.len()
            )));
        }

        let mut sql = String::from(chunks[0]);
        let mut binds = Vec::new();

        for (value, chunk) in values.iter().zip(&chunks[1..]) {
            let (tag, rest) = split_tag(chunk);
            match tag {
                Some(Tag::Id) => sql.push_str(&quote_id(&text_form(value))),
                Some(Tag::Lit) => sql.push_str(&text_form(value)),
                Some(Tag::Json) => {
                    sql.push('?');
                    let text = serde_json::to_string(value)
                        .map_err(|e| TephraError::Serialization(e.to_string()))?;
                    binds.push(Value::Text(text));
                }
                None => {
                    sql.push('?');
                    binds.push(bind_value(value)?);
                }
            }
            sql.push_str(rest);
        }

        Ok(Self { sql, binds })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn binds(&self) -> &[Value] {
        &self.binds
    }

    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.sql, self.binds)
    }
}

impl From<&str> for SqlFragment {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for SqlFragment {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

impl From<(String, Vec<Value>)> for SqlFragment {
    fn from((sql, binds): (String, Vec<Value>)) -> Self {
        Self::with_binds(sql, binds)
    }
}

impl From<(&str, Vec<Value>)> for SqlFragment {
    fn from((sql, binds): (&str, Vec<Value>)) -> Self {
        Self::with_binds(sql, binds)
    }
}

/// Split a known tag off the head of a chunk.
///
/// The tag is the leading `[A-Z]+` run when it equals `ID`, `LIT`, or
/// `JSON` and the character after the run (if any) is not a word
/// character.
fn split_tag(chunk: &str) -> (Option<Tag>, &str) {
    let run_len = chunk
        .bytes()
        .take_while(|b| b.is_ascii_uppercase())
        .count();
    let tag = match &chunk[..run_len] {
        "ID" => Tag::Id,
        "LIT" => Tag::Lit,
        "JSON" => Tag::Json,
        _ => return (None, chunk),
    };
    let rest = &chunk[run_len..];
    let at_boundary = rest
        .chars()
        .next()
        .map_or(true, |c| !(c.is_ascii_alphanumeric() || c == '_'));
    if at_boundary {
        (Some(tag), rest)
    } else {
        (None, chunk)
    }
}

/// Quote an identifier: wrap in double quotes, doubling embedded quotes.
pub fn quote_id(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Scalar-to-SQL-literal conversion, for debugging and literal splicing.
///
/// Booleans become `1`/`0`, numbers decimal text, strings single-quoted
/// with embedded quotes doubled, null `NULL`.
pub fn val_to_sql(value: &Json) -> String {
    match value {
        Json::Null => "NULL".to_string(),
        Json::Bool(true) => "1".to_string(),
        Json::Bool(false) => "0".to_string(),
        Json::Number(n) => n.to_string(),
        Json::String(s) => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('\'');
            for c in s.chars() {
                if c == '\'' {
                    out.push('\'');
                }
                out.push(c);
            }
            out.push('\'');
            out
        }
        other => {
            let text = other.to_string();
            val_to_sql(&Json::String(text))
        }
    }
}

/// The plain text form of a value, used for `ID` and `LIT` splicing.
fn text_form(value: &Json) -> String {
    match value {
        Json::Null => "null".to_string(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => n.to_string(),
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Convert a JSON value to a SQLite bind value.
///
/// Arrays and objects bind as their JSON text.
fn bind_value(value: &Json) -> Result<Value> {
    Ok(match value {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Integer(i64::from(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else if let Some(f) = n.as_f64() {
                Value::Real(f)
            } else {
                return Err(TephraError::Serialization(format!(
                    "number out of range: {n}"
                )));
            }
        }
        Json::String(s) => Value::Text(s.clone()),
        other => Value::Text(
            serde_json::to_string(other).map_err(|e| TephraError::Serialization(e.to_string()))?,
        ),
    })
}
