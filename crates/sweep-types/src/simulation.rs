//! Alpha documents sent to the evaluation backend and the results it returns.

use serde::{Deserialize, Serialize};

use crate::configuration::Configuration;
use crate::errors::{SweepError, SweepResult};

/// Outcome of a single backend check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warning,
    Pending,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub result: CheckStatus,
}

/// In-sample statistics of a finished simulation.
///
/// Every numeric field is optional; the scorer decides which ones it needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InSampleStats {
    #[serde(default)]
    pub sharpe: Option<f64>,
    #[serde(default)]
    pub fitness: Option<f64>,
    #[serde(default)]
    pub turnover: Option<f64>,
    #[serde(default)]
    pub returns: Option<f64>,
    #[serde(default)]
    pub drawdown: Option<f64>,
    #[serde(default)]
    pub checks: Vec<Check>,
}

impl InSampleStats {
    /// Names of the checks reporting `status`, in backend order.
    pub fn check_names(&self, status: &CheckStatus) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|c| &c.result == status)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Raw answer of the evaluation backend for one configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    /// Identifier of the alpha produced by the simulation.
    pub id: String,
    #[serde(rename = "is", default)]
    pub insample: InSampleStats,
}

/// The base alpha submitted for every trial, with a configuration's
/// parameters written into its `settings` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlphaDocument(serde_json::Value);

impl AlphaDocument {
    pub fn new(value: serde_json::Value) -> SweepResult<Self> {
        if !value.get("settings").is_some_and(|s| s.is_object()) {
            return Err(SweepError::Config(
                "alpha document has no 'settings' object".to_string(),
            ));
        }
        Ok(Self(value))
    }

    pub fn from_json_str(s: &str) -> SweepResult<Self> {
        Self::new(serde_json::from_str(s)?)
    }

    pub fn settings(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.0.get("settings").and_then(|s| s.as_object())
    }

    /// A setting that is present and not `null`.
    pub fn setting(&self, name: &str) -> Option<&serde_json::Value> {
        self.settings()?.get(name).filter(|v| !v.is_null())
    }

    pub fn region(&self) -> Option<&str> {
        self.setting("region").and_then(|v| v.as_str())
    }

    /// The expression text of a regular alpha.
    pub fn expression(&self) -> Option<&str> {
        self.0.get("regular").and_then(|v| v.as_str())
    }

    /// A fresh copy of the document with every parameter of `configuration`
    /// written into `settings`. The base document is left untouched.
    pub fn apply(&self, configuration: &Configuration) -> serde_json::Value {
        let mut doc = self.0.clone();
        if let Some(settings) = doc.get_mut("settings").and_then(|s| s.as_object_mut()) {
            for (name, value) in configuration.iter() {
                settings.insert(name.to_string(), value.to_json());
            }
        }
        doc
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }
}
