//! Template filters available to chart authors
//!
//! - `toyaml`: Serialize a value as YAML (no trailing newline)
//! - `nindent`: Newline followed by the value indented by N spaces
//! - `b64enc` / `b64dec`: Base64 encode/decode
//! - `quote`: Wrap in double quotes, escaping as JSON does
//! - `required`: Fail rendering with a message if the value is missing or empty

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{Error, ErrorKind, Value};

/// Usage: `{{ Values.resources | toyaml | nindent(4) }}`
pub fn toyaml(value: Value) -> Result<String, Error> {
    if value.is_undefined() || value.is_none() {
        return Ok(String::new());
    }
    serde_yaml::to_string(&value)
        .map(|s| s.trim_end_matches('\n').to_string())
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("toyaml: {e}")))
}

/// Usage: `{{ block | nindent(8) }}`
pub fn nindent(value: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    let body = value
        .lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{pad}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("\n{body}")
}

/// Usage: `{{ Values.password | b64enc }}`
pub fn b64enc(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

/// Usage: `{{ Values.encoded | b64dec }}`
pub fn b64dec(value: &str) -> Result<String, Error> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("b64dec: {e}")))?;
    String::from_utf8(bytes).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("b64dec produced invalid UTF-8: {e}"),
        )
    })
}

/// Usage: `{{ Values.name | quote }}`
pub fn quote(value: Value) -> String {
    let raw = if value.is_undefined() || value.is_none() {
        String::new()
    } else {
        value.to_string()
    };
    serde_json::Value::String(raw).to_string()
}

/// Usage: `{{ Values.host | required("host is required") }}`
pub fn required(value: Value, message: Option<String>) -> Result<Value, Error> {
    let missing = value.is_undefined()
        || value.is_none()
        || value.as_str().map(str::is_empty).unwrap_or(false);
    if missing {
        Err(Error::new(
            ErrorKind::UndefinedError,
            message.unwrap_or_else(|| "required value is missing".to_string()),
        ))
    } else {
        Ok(value)
    }
}
