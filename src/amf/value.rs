//! AMF value representation
//!
//! A small dynamic value type covering the AMF0 types RTMP command traffic
//! actually uses. Accessors return `Option` so command parsing can probe
//! loosely-typed encoder output without panicking.

use std::collections::HashMap;

/// A decoded AMF0 value
#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    /// Null (marker 0x05)
    Null,
    /// Undefined (marker 0x06)
    Undefined,
    /// Boolean (marker 0x01)
    Boolean(bool),
    /// IEEE 754 double (marker 0x00)
    Number(f64),
    /// UTF-8 string (markers 0x02 and 0x0C)
    String(String),
    /// Anonymous object (marker 0x03)
    Object(HashMap<String, AmfValue>),
    /// ECMA array, associative (marker 0x08)
    EcmaArray(HashMap<String, AmfValue>),
    /// Strict array, dense (marker 0x0A)
    Array(Vec<AmfValue>),
    /// Date as milliseconds since epoch (marker 0x0B); timezone discarded
    Date(f64),
}

impl AmfValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Object-like access: anonymous objects and ECMA arrays both qualify.
    pub fn as_object(&self) -> Option<&HashMap<String, AmfValue>> {
        match self {
            AmfValue::Object(m) | AmfValue::EcmaArray(m) => Some(m),
            _ => None,
        }
    }

    /// Get a property from an object-like value
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_object()?.get(key)
    }

    /// Get a string property from an object-like value
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Get a numeric property from an object-like value
    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }

    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, AmfValue::Null | AmfValue::Undefined)
    }

    /// Build an anonymous object from key/value pairs
    pub fn object<const N: usize>(pairs: [(&str, AmfValue); N]) -> Self {
        AmfValue::Object(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }
}

impl From<f64> for AmfValue {
    fn from(v: f64) -> Self {
        AmfValue::Number(v)
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_access() {
        let obj = AmfValue::object([
            ("app", AmfValue::from("live")),
            ("objectEncoding", AmfValue::from(0.0)),
        ]);

        assert_eq!(obj.get_str("app"), Some("live"));
        assert_eq!(obj.get_number("objectEncoding"), Some(0.0));
        assert!(obj.get("missing").is_none());
    }

    #[test]
    fn test_ecma_array_is_object_like() {
        let mut m = HashMap::new();
        m.insert("width".to_string(), AmfValue::Number(1920.0));
        let arr = AmfValue::EcmaArray(m);

        assert_eq!(arr.get_number("width"), Some(1920.0));
    }
}
