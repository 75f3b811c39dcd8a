//! Kubernetes-oriented template filters

use base64::Engine as _;
use minijinja::{Error, ErrorKind, Value};
use sha2::{Digest, Sha256};

fn invalid(message: impl std::fmt::Display) -> Error {
    Error::new(ErrorKind::InvalidOperation, message.to_string())
}

fn to_json(value: &Value) -> Result<serde_json::Value, Error> {
    serde_json::to_value(value).map_err(invalid)
}

/// Convert a value to YAML
///
/// Usage: {{ values.resources | toyaml }}
pub fn toyaml(value: Value) -> Result<String, Error> {
    let yaml = serde_yaml::to_string(&to_json(&value)?).map_err(invalid)?;
    Ok(yaml.trim_start_matches("---\n").trim_end().to_string())
}

/// Convert a value to compact JSON
///
/// Usage: {{ values.config | tojson }}
pub fn tojson(value: Value) -> Result<String, Error> {
    serde_json::to_string(&to_json(&value)?).map_err(invalid)
}

#[must_use]
pub fn b64encode(value: String) -> String {
    base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
}

pub fn b64decode(value: String) -> Result<String, Error> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value.as_bytes())
        .map_err(|e| invalid(format!("base64 decode error: {}", e)))?;

    String::from_utf8(decoded).map_err(|e| invalid(format!("UTF-8 decode error: {}", e)))
}

/// Hex-encoded SHA-256 digest, handy for checksum annotations
///
/// Usage: {{ values.config | tojson | sha256 }}
#[must_use]
pub fn sha256(value: String) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Quote a value with double quotes
///
/// Usage: {{ values.name | quote }}
#[must_use]
pub fn quote(value: Value) -> String {
    let s = match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    };
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Indent every non-empty line and prefix a newline
///
/// Usage: {{ values.labels | toyaml | nindent(4) }}
#[must_use]
pub fn nindent(value: String, spaces: usize) -> String {
    format!("\n{}", indent(value, spaces))
}

/// Indent every non-empty line
#[must_use]
pub fn indent(value: String, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    value
        .lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{}{}", pad, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fail rendering when a value is undefined, none or an empty string
///
/// Usage: {{ values.image.tag | required("image.tag is required") }}
pub fn required(value: Value, message: Option<String>) -> Result<Value, Error> {
    let missing = value.is_undefined() || value.is_none();
    let empty = value.as_str().is_some_and(str::is_empty);

    if missing || empty {
        let default = if missing {
            "required value is missing"
        } else {
            "required value is empty"
        };
        return Err(invalid(message.unwrap_or_else(|| default.to_string())));
    }
    Ok(value)
}

/// Truncate to at most `length` characters
///
/// Usage: {{ release.name | trunc(63) }}
#[must_use]
pub fn trunc(value: String, length: usize) -> String {
    value.chars().take(length).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toyaml() {
        let value = Value::from_serialize(serde_json::json!({
            "name": "test",
            "port": 8080
        }));
        let yaml = toyaml(value).unwrap();
        assert!(yaml.contains("name: test"));
        assert!(yaml.contains("port: 8080"));
        assert!(!yaml.ends_with('\n'));
    }

    #[test]
    fn test_b64encode_decode() {
        let encoded = b64encode("hello world".to_string());
        assert_eq!(encoded, "aGVsbG8gd29ybGQ=");
        assert_eq!(b64decode(encoded).unwrap(), "hello world");
        assert!(b64decode("%%%".to_string()).is_err());
    }

    #[test]
    fn test_sha256() {
        assert_eq!(
            sha256("abc".to_string()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote(Value::from("test")), "\"test\"");
        assert_eq!(quote(Value::from("say \"hi\"")), "\"say \\\"hi\\\"\"");
        assert_eq!(quote(Value::from(3)), "\"3\"");
    }

    #[test]
    fn test_nindent() {
        assert_eq!(nindent("line1\nline2".to_string(), 4), "\n    line1\n    line2");
        assert_eq!(indent("a\n\nb".to_string(), 2), "  a\n\n  b");
    }

    #[test]
    fn test_required() {
        assert!(required(Value::from("test"), None).is_ok());
        assert!(required(Value::UNDEFINED, None).is_err());
        assert!(required(Value::from(""), None).is_err());

        let err = required(Value::UNDEFINED, Some("tag is required".into())).unwrap_err();
        assert!(err.to_string().contains("tag is required"));
    }

    #[test]
    fn test_trunc() {
        assert_eq!(trunc("abcdef".to_string(), 3), "abc");
        assert_eq!(trunc("ab".to_string(), 3), "ab");
    }
}
