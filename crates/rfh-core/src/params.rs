//! Typed access to the JSON arguments of an RPC call.
//!
//! Clients send either named arguments (`{"handle": 3}`) or positional ones
//! (`[3, true]`). Extraction failures surface as
//! [`CoreError::InvalidParams`] with the offending parameter named.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::errors::CoreError;
use crate::types::Handle;

/// Arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Value);

impl Params {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// No arguments.
    pub fn empty() -> Self {
        Self(Value::Null)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    fn named(&self, name: &str) -> Option<&Value> {
        match &self.0 {
            Value::Object(map) => map.get(name).filter(|v| !v.is_null()),
            _ => None,
        }
    }

    /// Named argument that must be present.
    pub fn required<T: DeserializeOwned>(&self, name: &str) -> Result<T, CoreError> {
        let value = self
            .named(name)
            .ok_or_else(|| CoreError::InvalidParams(format!("missing parameter '{name}'")))?;
        decode(name, value)
    }

    /// Named argument that may be absent or `null`.
    pub fn optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, CoreError> {
        self.named(name).map(|v| decode(name, v)).transpose()
    }

    /// Named argument holding a registry handle.
    pub fn handle(&self, name: &str) -> Result<Handle, CoreError> {
        self.required::<Handle>(name)
    }

    /// Positional argument that must be present.
    pub fn required_at<T: DeserializeOwned>(&self, index: usize) -> Result<T, CoreError> {
        let value = match &self.0 {
            Value::Array(items) => items.get(index).filter(|v| !v.is_null()),
            _ => None,
        };
        let label = format!("#{index}");
        let value = value
            .ok_or_else(|| CoreError::InvalidParams(format!("missing parameter {label}")))?;
        decode(&label, value)
    }

    /// Named arguments as a map (empty for positional or absent arguments).
    pub fn as_map(&self) -> Map<String, Value> {
        match &self.0 {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        }
    }
}

impl From<Value> for Params {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

fn decode<T: DeserializeOwned>(name: &str, value: &Value) -> Result<T, CoreError> {
    T::deserialize(value)
        .map_err(|e| CoreError::InvalidParams(format!("parameter '{name}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_named_params() {
        let params = Params::new(json!({"handle": 4, "autoConnect": true, "label": null}));
        assert_eq!(params.handle("handle").unwrap(), Handle::new(4));
        assert!(params.required::<bool>("autoConnect").unwrap());
        assert_eq!(params.optional::<String>("label").unwrap(), None);
        assert_eq!(params.optional::<u32>("missing").unwrap(), None);
    }

    #[test]
    fn test_missing_and_mistyped() {
        let params = Params::new(json!({"handle": "four"}));
        let err = params.handle("handle").unwrap_err();
        assert!(matches!(err, CoreError::InvalidParams(ref m) if m.contains("'handle'")));

        let err = params.required::<u32>("timeout").unwrap_err();
        assert_eq!(err.to_string(), "invalid params: missing parameter 'timeout'");
    }

    #[test]
    fn test_positional_params() {
        let params = Params::new(json!([7, "ab:cd"]));
        assert_eq!(params.required_at::<u32>(0).unwrap(), 7);
        assert_eq!(params.required_at::<String>(1).unwrap(), "ab:cd");
        assert!(params.required_at::<u32>(2).is_err());
        assert!(params.required::<u32>("x").is_err());
    }

    #[test]
    fn test_empty_params() {
        let params = Params::empty();
        assert!(params.as_map().is_empty());
        assert_eq!(params.optional::<u32>("max").unwrap(), None);
    }
}
