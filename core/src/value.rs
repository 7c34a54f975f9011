use std::fmt;

use serde::{Deserialize, Serialize};

/// Fully evaluated program result, detached from any heap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Number(f64),
    Nil,
    List(Vec<Value>),
    Bytes(Vec<u8>),
    /// Functions, closures, system objects: anything with no printable form.
    Opaque(String),
}

impl Value {
    /// Text view of a list of character codes or a byte array.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            Value::List(items) if !items.is_empty() => {
                let mut bytes = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Number(n) if n.fract() == 0.0 && (0.0..=255.0).contains(n) => bytes.push(*n as u8),
                        _ => return None,
                    }
                }
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => None,
        }
    }
}

pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::Nil => f.write_str("nil"),
            Value::Bytes(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Opaque(what) => write!(f, "<{}>", what),
        }
    }
}
