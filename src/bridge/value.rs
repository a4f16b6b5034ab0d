//! Tagged union for everything that crosses the native/script boundary.
//!
//! Native code never inspects a Lua value directly. Values are converted
//! into [`Value`] first and matched on their tag; conversions that do not
//! fit fail with [`Error::BridgeConversion`].

use std::fmt;

use super::handle::HandleId;
use crate::error::{Error, Result};

/// A value shared between native code and plugin scripts.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absence of a value (`nil`).
    Nil,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// Double precision float.
    Double(f64),
    /// UTF-8 text without embedded NUL.
    Text(String),
    /// Ordered list, exposed to scripts as a 1-based array.
    Sequence(Vec<Value>),
    /// Opaque native object, identified through the handle table.
    Handle(HandleId),
}

impl Value {
    /// Name of the variant, used in conversion errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Double(_) => "double",
            Self::Text(_) => "text",
            Self::Sequence(_) => "sequence",
            Self::Handle(_) => "handle",
        }
    }

    /// True for [`Value::Nil`].
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Borrow the text payload, if this is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Validate text for crossing into the script engine.
    pub(crate) fn check_text(text: &str) -> Result<()> {
        if text.contains('\0') {
            return Err(Error::BridgeConversion(
                "text contains an embedded NUL".into(),
            ));
        }
        Ok(())
    }

    /// Decode script bytes into text, rejecting NUL and invalid UTF-8.
    pub(crate) fn text_from_bytes(bytes: &[u8]) -> Result<String> {
        if bytes.contains(&0) {
            return Err(Error::BridgeConversion(
                "text contains an embedded NUL".into(),
            ));
        }
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| Error::BridgeConversion(format!("text is not valid UTF-8: {e}")))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::Text(s) => f.write_str(s),
            Self::Sequence(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Handle(id) => write!(f, "handle#{}", id.0),
        }
    }
}

// ============================================================================
// Native -> Value
// ============================================================================

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<HandleId> for Value {
    fn from(v: HandleId) -> Self {
        Self::Handle(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::Sequence(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Nil, Into::into)
    }
}

// ============================================================================
// Value -> Native
// ============================================================================

fn mismatch(expected: &str, got: &Value) -> Error {
    Error::BridgeConversion(format!("expected {expected}, got {}", got.type_name()))
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Bool(b) => Ok(b),
            other => Err(mismatch("bool", &other)),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Int(i) => Ok(i),
            other => Err(mismatch("int", &other)),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Double(d) => Ok(d),
            #[allow(clippy::cast_precision_loss)]
            Value::Int(i) => Ok(i as f64),
            other => Err(mismatch("double", &other)),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Text(s) => Ok(s),
            other => Err(mismatch("text", &other)),
        }
    }
}

impl TryFrom<Value> for HandleId {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Handle(id) => Ok(id),
            other => Err(mismatch("handle", &other)),
        }
    }
}

impl TryFrom<Value> for Vec<String> {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self> {
        match v {
            Value::Sequence(items) => items.into_iter().map(String::try_from).collect(),
            other => Err(mismatch("sequence", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_round_trip() {
        assert!(bool::try_from(Value::from(true)).unwrap());
        assert_eq!(i64::try_from(Value::from(-42_i64)).unwrap(), -42);
        assert_eq!(String::try_from(Value::from("x")).unwrap(), "x");
        let list = vec!["a".to_string(), "b".to_string()];
        assert_eq!(Vec::<String>::try_from(Value::from(list.clone())).unwrap(), list);
    }

    #[test]
    fn test_int_widens_to_double() {
        assert_eq!(f64::try_from(Value::Int(3)).unwrap(), 3.0);
    }

    #[test]
    fn test_tag_mismatch_is_conversion_error() {
        let err = bool::try_from(Value::Text("yes".into())).unwrap_err();
        assert!(matches!(err, Error::BridgeConversion(_)));
        assert!(err.to_string().contains("expected bool"));
    }

    #[test]
    fn test_option_maps_to_nil() {
        assert!(Value::from(None::<String>).is_nil());
        assert_eq!(Value::from(Some("t")), Value::Text("t".into()));
    }

    #[test]
    fn test_text_checks() {
        assert!(Value::check_text("plain").is_ok());
        assert!(Value::check_text("a\0b").is_err());
        assert!(Value::text_from_bytes(b"ok").is_ok());
        assert!(Value::text_from_bytes(b"a\0b").is_err());
        assert!(Value::text_from_bytes(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_display() {
        let v = Value::Sequence(vec![Value::Int(1), Value::Text("a".into())]);
        assert_eq!(v.to_string(), "[1, a]");
    }
}
