//! Wire representation of command failures.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// An error as it crosses the protocol boundary.
///
/// The engine keeps one canonical error type internally; at the boundary an
/// error becomes either a short name string or a structured `{name, args}`
/// object, selected by the `use_raw_error_objects` configuration toggle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl WireError {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self { name: name.into(), args }
    }

    /// Encode for the wire. `raw` selects the structured object form.
    pub fn encode(&self, raw: bool) -> Value {
        if raw {
            json!({"name": self.name, "args": self.args})
        } else {
            Value::String(self.name.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_and_object_encodings() {
        let err = WireError::new("notAllowed", vec![json!("roomJoin"), json!("lobby")]);
        assert_eq!(err.encode(false), json!("notAllowed"));
        assert_eq!(
            err.encode(true),
            json!({"name": "notAllowed", "args": ["roomJoin", "lobby"]})
        );
    }
}
