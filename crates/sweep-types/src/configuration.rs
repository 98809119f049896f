//! Parameter values and the immutable configurations built from them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A concrete value drawn from one parameter's domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl ParameterValue {
    /// Convert a JSON scalar into a parameter value. Arrays, objects and
    /// `null` have no parameter representation.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::Bool(v) => serde_json::Value::from(*v),
            Self::Text(v) => serde_json::Value::from(v.as_str()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Canonical, order-independent identity of a [`Configuration`].
///
/// Two configurations with the same parameter mapping always produce the
/// same key, whatever order their parameters were inserted in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigKey(String);

impl ConfigKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One concrete assignment of a value to every search parameter.
///
/// Parameters are held sorted by name, so serialization is canonical and
/// equality ignores construction order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    values: BTreeMap<String, ParameterValue>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ParameterValue>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The dedup key: the configuration serialized with keys in sorted order.
    pub fn key(&self) -> ConfigKey {
        let body = self
            .values
            .iter()
            .map(|(name, value)| {
                format!(
                    "{}:{}",
                    serde_json::Value::from(name.as_str()),
                    value.to_json()
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        ConfigKey(format!("{{{body}}}"))
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_insertion_order() {
        let a = Configuration::new()
            .with("universe", "TOP3000")
            .with("delay", 1)
            .with("maxTrade", "ON");
        let b = Configuration::new()
            .with("maxTrade", "ON")
            .with("delay", 1)
            .with("universe", "TOP3000");

        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().as_str(), r#"{"delay":1,"maxTrade":"ON","universe":"TOP3000"}"#);
    }

    #[test]
    fn key_distinguishes_values() {
        let a = Configuration::new().with("delay", 0);
        let b = Configuration::new().with("delay", 1);
        let c = Configuration::new().with("delay", "1");
        assert_ne!(a.key(), b.key());
        assert_ne!(b.key(), c.key());
    }

    #[test]
    fn serializes_as_plain_object() {
        let config = Configuration::new().with("delay", 1).with("universe", "TOP500");
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"delay":1,"universe":"TOP500"}"#);

        let back: Configuration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.get("delay"), Some(&ParameterValue::Int(1)));
    }

    #[test]
    fn from_json_scalars() {
        assert_eq!(
            ParameterValue::from_json(&serde_json::json!(1)),
            Some(ParameterValue::Int(1))
        );
        assert_eq!(
            ParameterValue::from_json(&serde_json::json!(0.08)),
            Some(ParameterValue::Float(0.08))
        );
        assert_eq!(
            ParameterValue::from_json(&serde_json::json!("SUBINDUSTRY")),
            Some(ParameterValue::Text("SUBINDUSTRY".into()))
        );
        assert_eq!(ParameterValue::from_json(&serde_json::json!(null)), None);
    }

    #[test]
    fn display_is_sorted() {
        let config = Configuration::from_pairs([("b", 2i64), ("a", 1i64)]);
        assert_eq!(config.to_string(), "a=1, b=2");
    }
}
