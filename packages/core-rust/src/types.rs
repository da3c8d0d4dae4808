use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Argument and parameter value passed between managed functions.
///
/// Supports all JSON-compatible types plus binary data. A function's return
/// value becomes the argument of its continuation, and management tooling
/// supplies parameters in string form that are parsed into a `Value` according
/// to the function's declared [`ParameterType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// JSON null.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON integer (signed 64-bit).
    Int(i64),
    /// JSON floating-point (64-bit IEEE 754).
    Float(f64),
    /// JSON string (UTF-8).
    String(String),
    /// Binary data (not directly representable in JSON).
    Bytes(Vec<u8>),
    /// JSON array (ordered sequence of values).
    Array(Vec<Value>),
    /// JSON object. Uses `BTreeMap` for deterministic ordering.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the string slice if this is a `Value::String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer if this is a `Value::Int`.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the boolean if this is a `Value::Bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// ParameterType
// ---------------------------------------------------------------------------

/// Declared parameter type of a managed function.
///
/// Used by introspection and by invoke-by-name, which receives the parameter
/// as a string and must turn it into a [`Value`] before invoking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParameterType {
    String,
    Int,
    Float,
    Bool,
    /// Arbitrary JSON document.
    Json,
}

/// Errors from parsing a string-encoded parameter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParameterError {
    #[error("expected {expected} parameter but got {input:?}")]
    Invalid {
        expected: ParameterType,
        input: String,
    },
    #[error("malformed JSON parameter: {reason}")]
    Json { reason: String },
}

impl ParameterType {
    /// Parses a string-encoded parameter into a value of this type.
    ///
    /// # Errors
    ///
    /// Returns `ParameterError` if the input does not parse as this type.
    pub fn parse(self, input: &str) -> Result<Value, ParameterError> {
        let invalid = || ParameterError::Invalid {
            expected: self,
            input: input.to_string(),
        };
        match self {
            ParameterType::String => Ok(Value::String(input.to_string())),
            ParameterType::Int => input.trim().parse().map(Value::Int).map_err(|_| invalid()),
            ParameterType::Float => input
                .trim()
                .parse()
                .map(Value::Float)
                .map_err(|_| invalid()),
            ParameterType::Bool => input
                .trim()
                .parse()
                .map(Value::Bool)
                .map_err(|_| invalid()),
            ParameterType::Json => serde_json::from_str::<serde_json::Value>(input)
                .map(Value::from)
                .map_err(|e| ParameterError::Json {
                    reason: e.to_string(),
                }),
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterType::String => "string",
            ParameterType::Int => "int",
            ParameterType::Float => "float",
            ParameterType::Bool => "bool",
            ParameterType::Json => "json",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! id_type {
    (
        $(#[$meta:meta])*
        $name:ident, $prefix:expr
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }
    };
}

id_type!(
    /// Identifies one `ProcessState` for the lifetime of an office floor.
    ProcessId, "process"
);

id_type!(
    /// Identifies one `ThreadState` within its office floor.
    ThreadId, "thread"
);

id_type!(
    /// Identifies one scheduled job.
    JobId, "job"
);

id_type!(
    /// Identifies one managed-object instance binding within a scope.
    ManagedObjectId, "mo"
);

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parses_scalar_parameters() {
        assert_eq!(ParameterType::Int.parse(" 42 ").unwrap(), Value::Int(42));
        assert_eq!(ParameterType::Bool.parse("true").unwrap(), Value::Bool(true));
        assert_eq!(
            ParameterType::String.parse(" keep spaces ").unwrap(),
            Value::String(" keep spaces ".to_string())
        );
        assert_eq!(ParameterType::Float.parse("1.5").unwrap(), Value::Float(1.5));
    }

    #[test]
    fn rejects_malformed_parameters() {
        let err = ParameterType::Int.parse("forty-two").unwrap_err();
        assert!(matches!(
            err,
            ParameterError::Invalid {
                expected: ParameterType::Int,
                ..
            }
        ));
        assert!(matches!(
            ParameterType::Json.parse("{not json").unwrap_err(),
            ParameterError::Json { .. }
        ));
    }

    #[test]
    fn parses_json_into_nested_values() {
        let value = ParameterType::Json
            .parse(r#"{"name":"desk","tags":["a",1]}"#)
            .unwrap();
        let Value::Map(map) = value else {
            panic!("expected map");
        };
        assert_eq!(map.get("name"), Some(&Value::String("desk".to_string())));
        assert_eq!(
            map.get("tags"),
            Some(&Value::Array(vec![Value::String("a".to_string()), Value::Int(1)]))
        );
    }

    #[test]
    fn ids_display_with_prefix() {
        assert_eq!(ProcessId(7).to_string(), "process-7");
        assert_eq!(ThreadId(3).to_string(), "thread-3");
    }

    proptest! {
        #[test]
        fn any_i64_parses_as_int(n in any::<i64>()) {
            prop_assert_eq!(ParameterType::Int.parse(&n.to_string()).unwrap(), Value::Int(n));
        }

        #[test]
        fn any_string_parses_as_string(s in ".*") {
            prop_assert_eq!(ParameterType::String.parse(&s).unwrap(), Value::String(s.clone()));
        }
    }
}
