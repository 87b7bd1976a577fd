use super::types::ParameterRef;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Deploy-time parameter values keyed by module, then by parameter name.
///
/// On disk this is a JSON object: `{"Module": {"name": value}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentParameters(BTreeMap<String, BTreeMap<String, Value>>);

impl DeploymentParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("parameters must be a JSON object keyed by module name")
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read parameters file {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("failed to parse parameters file {}", path.display()))
    }

    pub fn get(&self, module: &str, name: &str) -> Option<&Value> {
        self.0.get(module).and_then(|values| values.get(name))
    }

    pub fn insert(&mut self, module: &str, name: &str, value: Value) {
        self.0
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    /// Supplied value, else the declared default.
    pub fn resolve(&self, parameter: &ParameterRef) -> Option<Value> {
        self.get(&parameter.module, &parameter.name)
            .cloned()
            .or_else(|| parameter.default.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reference(default: Option<Value>) -> ParameterRef {
        ParameterRef {
            module: "Apollo".into(),
            name: "name".into(),
            default,
        }
    }

    #[test]
    fn supplied_value_wins_over_default() {
        let parameters =
            DeploymentParameters::from_json_str(r#"{"Apollo": {"name": "Saturn V"}}"#).unwrap();

        assert_eq!(
            parameters.resolve(&reference(Some(json!("Falcon")))),
            Some(json!("Saturn V"))
        );
    }

    #[test]
    fn default_used_when_value_missing() {
        let mut parameters = DeploymentParameters::new();
        parameters.insert("Other", "name", json!("ignored"));

        assert_eq!(parameters.resolve(&reference(Some(json!(7)))), Some(json!(7)));
        assert_eq!(parameters.resolve(&reference(None)), None);
    }

    #[test]
    fn rejects_non_object_documents() {
        assert!(DeploymentParameters::from_json_str("[1, 2]").is_err());
    }

    #[test]
    fn reads_parameters_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"Apollo": {"name": "Saturn V"}}"#).unwrap();

        let parameters = DeploymentParameters::from_json_file(&path).unwrap();
        assert_eq!(parameters.get("Apollo", "name"), Some(&json!("Saturn V")));
    }
}
