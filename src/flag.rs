use log::warn;
use serde::{Deserialize, Serialize};

const FLOAT_TO_INT_MAX: f64 = 9007199254740991_f64;

/// A remotely evaluated flag value.
///
/// The remote service sends values as plain JSON scalars, so this deserializes untagged. Numbers
/// that fit an `i64` are kept as integers; anything else numeric becomes a float.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Json(serde_json::Value),
}

impl From<bool> for FlagValue {
    fn from(b: bool) -> FlagValue {
        FlagValue::Bool(b)
    }
}

impl From<i64> for FlagValue {
    fn from(i: i64) -> FlagValue {
        FlagValue::Int(i)
    }
}

impl From<f64> for FlagValue {
    fn from(f: f64) -> FlagValue {
        FlagValue::Float(f)
    }
}

impl From<&str> for FlagValue {
    fn from(s: &str) -> FlagValue {
        FlagValue::Str(s.to_string())
    }
}

impl From<String> for FlagValue {
    fn from(s: String) -> FlagValue {
        FlagValue::Str(s)
    }
}

impl FlagValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => {
                warn!("flag value is not bool but {:?}", self);
                None
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::Str(s) => Some(s),
            _ => {
                warn!("flag value is not a string but {:?}", self);
                None
            }
        }
    }

    /// Integers are returned as-is; floats are truncated only while they still hold integer
    /// precision (|f| <= 2^53 - 1).
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FlagValue::Int(i) => Some(*i),
            FlagValue::Float(f) if f.abs() <= FLOAT_TO_INT_MAX => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FlagValue::Float(f) => Some(*f),
            FlagValue::Int(i) => Some(*i as f64),
            _ => {
                warn!("flag value is not numeric but {:?}", self);
                None
            }
        }
    }

    pub fn as_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FlagValue::Bool(b) => Value::from(*b),
            FlagValue::Int(i) => Value::from(*i),
            FlagValue::Float(f) => Value::from(*f),
            FlagValue::Str(s) => Value::from(s.as_str()),
            FlagValue::Json(v) => v.clone(),
        }
    }
}

/// The evaluated state of a single flag for the current environment.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagState {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<FlagValue>,
}

impl FlagState {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            value: None,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, value: impl Into<FlagValue>) -> Self {
        self.value = Some(value.into());
        self
    }
}
