//! Boundary validation of inbound field maps and key names.
//!
//! Every operation's fields are checked against its schema before any
//! storage or remote access. The typed getters convert the loosely-typed
//! values a dispatcher delivers (strings for everything, or JSON-native
//! values) into the types the operations need.

use crate::{KmsError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Untyped fields as delivered by the dispatcher.
pub type FieldMap = serde_json::Map<String, Value>;

/// Maximum allowed length for key names.
const MAX_NAME_LENGTH: usize = 255;

/// Validates a key alias.
///
/// Rejects:
/// - Empty names
/// - Excessive length (>255 characters)
/// - `/`, which would escape the key's storage path
/// - Control characters
///
/// # Example
///
/// ```
/// use gcpkms::validation::validate_key_name;
///
/// assert!(validate_key_name("my-key").is_ok());
/// assert!(validate_key_name("prod.payments_v2").is_ok());
///
/// assert!(validate_key_name("").is_err());
/// assert!(validate_key_name("../config").is_err());
/// ```
pub fn validate_key_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(KmsError::Validation("key name cannot be empty".to_string()));
    }

    if name.len() > MAX_NAME_LENGTH {
        return Err(KmsError::Validation(format!(
            "key name exceeds maximum length of {} characters",
            MAX_NAME_LENGTH
        )));
    }

    if name.contains('/') {
        return Err(KmsError::Validation(
            "key name cannot contain '/'".to_string(),
        ));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(KmsError::Validation(
            "key name contains control characters".to_string(),
        ));
    }

    Ok(())
}

/// Fails if `fields` contains a name absent from `schema`.
///
/// Offending names are reported sorted.
pub fn validate_fields(schema: &[&str], fields: &FieldMap) -> Result<()> {
    let mut unknown: Vec<String> = fields
        .keys()
        .filter(|k| !schema.contains(&k.as_str()))
        .cloned()
        .collect();

    if unknown.is_empty() {
        return Ok(());
    }

    unknown.sort();
    Err(KmsError::UnknownFields(unknown))
}

/// Typed read access to a validated field map.
pub struct Fields<'a> {
    raw: &'a FieldMap,
}

impl<'a> Fields<'a> {
    /// Wraps a field map.
    pub fn new(raw: &'a FieldMap) -> Self {
        Self { raw }
    }

    fn get(&self, name: &str) -> Option<&'a Value> {
        self.raw.get(name).filter(|v| !v.is_null())
    }

    /// Reads a string field. Numbers and booleans are stringified.
    pub fn string(&self, name: &str) -> Result<Option<String>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(_) => Err(invalid(name, "expected a string")),
        }
    }

    /// Reads a required string field.
    pub fn required_string(&self, name: &str) -> Result<String> {
        match self.string(name)? {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(KmsError::MissingFields(vec![name.to_string()])),
        }
    }

    /// Reads an integer field. Numeric strings are accepted.
    pub fn int(&self, name: &str) -> Result<Option<i64>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| invalid(name, "expected an integer")),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid(name, "expected an integer")),
            Some(_) => Err(invalid(name, "expected an integer")),
        }
    }

    /// Reads a key version. Missing, zero and negative values mean "unset".
    pub fn version(&self, name: &str) -> Result<u64> {
        Ok(self.int(name)?.map(|v| u64::try_from(v).unwrap_or(0)).unwrap_or(0))
    }

    /// Reads a boolean field. "true"/"false" strings are accepted.
    pub fn bool(&self, name: &str) -> Result<Option<bool>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                _ => Err(invalid(name, "expected a boolean")),
            },
            Some(_) => Err(invalid(name, "expected a boolean")),
        }
    }

    /// Reads a list of strings from a JSON array or a comma-separated string.
    pub fn comma_list(&self, name: &str) -> Result<Option<Vec<String>>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect(),
            )),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.trim().to_string()),
                    _ => Err(invalid(name, "expected a list of strings")),
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(_) => Err(invalid(name, "expected a list of strings")),
        }
    }

    /// Reads a string map from a JSON object or `k=v,k2=v2` text.
    pub fn key_values(&self, name: &str) -> Result<Option<BTreeMap<String, String>>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Object(obj)) => obj
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => Ok((k.clone(), s.clone())),
                    _ => Err(invalid(name, "expected string values")),
                })
                .collect::<Result<BTreeMap<_, _>>>()
                .map(Some),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|pair| {
                    pair.split_once('=')
                        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                        .ok_or_else(|| invalid(name, "expected key=value pairs"))
                })
                .collect::<Result<BTreeMap<_, _>>>()
                .map(Some),
            Some(_) => Err(invalid(name, "expected a map")),
        }
    }

    /// Reads a duration in whole seconds, or with an `s`, `m`, `h` or `d`
    /// suffix (`"86400"`, `"72h"`, `"30d"`).
    pub fn duration(&self, name: &str) -> Result<Option<Duration>> {
        let raw = match self.string(name)? {
            Some(s) if !s.trim().is_empty() => s,
            _ => return Ok(None),
        };
        let raw = raw.trim();

        let (digits, unit) = match raw.char_indices().last() {
            Some((i, c)) if c.is_ascii_alphabetic() => (&raw[..i], c),
            _ => (raw, 's'),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| invalid(name, "expected a duration such as 86400s or 72h"))?;
        let secs = match unit {
            's' => Some(value),
            'm' => value.checked_mul(60),
            'h' => value.checked_mul(60 * 60),
            'd' => value.checked_mul(24 * 60 * 60),
            _ => return Err(invalid(name, "unknown duration unit")),
        }
        .ok_or_else(|| invalid(name, "duration out of range"))?;

        Ok(Some(Duration::from_secs(secs)))
    }
}

/// Decodes a standard base64 value of the named field.
pub fn decode_base64(name: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value.trim())
        .map_err(|e| invalid(name, &format!("failed to base64 decode: {}", e)))
}

fn invalid(name: &str, reason: &str) -> KmsError {
    KmsError::Validation(format!("invalid value for {}: {}", name, reason))
}
