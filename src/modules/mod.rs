//! Pluggable automation modules.
//!
//! A module is a unit of automation logic resolved by string id. The
//! engine knows nothing about a module's internals: it resolves a
//! [`ModuleFactory`] from the registry, creates a fresh [`Module`]
//! instance for the job, restores its checkpoint when resuming, and
//! drains the result records the module pushes onto its output channel.

pub mod builtin;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

pub use registry::ModuleRegistry;

use crate::engine::context::JobContext;
use crate::engine::job::JsonMap;
use crate::error::ModuleError;

/// Declared input parameter of a module.
#[derive(Debug, Clone, Serialize)]
pub struct InputSpec {
    pub id: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl InputSpec {
    /// A required input with no default.
    pub fn required(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            required: true,
            default: None,
            description: None,
        }
    }

    /// An optional input with a default value.
    pub fn optional(id: impl Into<String>, default: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            required: false,
            default: Some(default),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Static description of a module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub inputs: Vec<InputSpec>,
}

impl ModuleManifest {
    /// Validate and normalize caller inputs against the declared specs.
    ///
    /// Applies defaults for absent optional inputs and rejects absent
    /// required ones. Inputs the manifest does not declare pass through
    /// untouched.
    pub fn validate_inputs(&self, inputs: &JsonMap) -> Result<JsonMap, ModuleError> {
        let mut validated = inputs.clone();

        for spec in &self.inputs {
            if validated.contains_key(&spec.id) {
                continue;
            }
            if let Some(default) = &spec.default {
                validated.insert(spec.id.clone(), default.clone());
            } else if spec.required {
                return Err(ModuleError::InvalidInputs {
                    module: self.id.clone(),
                    reason: format!("required input missing: {}", spec.id),
                });
            }
        }

        Ok(validated)
    }
}

/// One execution instance of a module.
///
/// `run` pushes result records onto `out` as they are produced; the
/// execution task drains and persists them. Implementations must poll
/// `ctx.is_cancelled()` at reasonable intervals and may return early
/// once it is set — no forced-interrupt signal is delivered otherwise.
#[async_trait]
pub trait Module: Send {
    /// Restore checkpoint state. Called once, before `run`, when the job
    /// is resumed with a persisted checkpoint.
    fn restore(&mut self, _checkpoint: &JsonMap) {}

    /// Execute the module's main task.
    async fn run(
        &mut self,
        ctx: Arc<JobContext>,
        inputs: JsonMap,
        settings: JsonMap,
        out: mpsc::Sender<serde_json::Value>,
    ) -> Result<(), ModuleError>;
}

/// Creates fresh [`Module`] instances for a registered id.
pub trait ModuleFactory: Send + Sync {
    /// The id this module is registered under.
    fn id(&self) -> &str;

    /// Static module description.
    fn manifest(&self) -> ModuleManifest;

    /// Create a new instance for one job.
    fn create(&self) -> Box<dyn Module>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest() -> ModuleManifest {
        ModuleManifest {
            id: "scrape".to_string(),
            name: "Scrape".to_string(),
            version: "0.1.0".to_string(),
            description: String::new(),
            inputs: vec![
                InputSpec::required("url"),
                InputSpec::optional("depth", json!(1)),
            ],
        }
    }

    #[test]
    fn validate_applies_defaults() {
        let mut inputs = JsonMap::new();
        inputs.insert("url".into(), json!("https://example.com"));

        let validated = manifest().validate_inputs(&inputs).unwrap();
        assert_eq!(validated["url"], json!("https://example.com"));
        assert_eq!(validated["depth"], json!(1));
    }

    #[test]
    fn validate_rejects_missing_required() {
        let err = manifest().validate_inputs(&JsonMap::new()).unwrap_err();
        match err {
            ModuleError::InvalidInputs { module, reason } => {
                assert_eq!(module, "scrape");
                assert!(reason.contains("url"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn validate_passes_undeclared_inputs_through() {
        let mut inputs = JsonMap::new();
        inputs.insert("url".into(), json!("https://example.com"));
        inputs.insert("extra".into(), json!(true));

        let validated = manifest().validate_inputs(&inputs).unwrap();
        assert_eq!(validated["extra"], json!(true));
    }
}
