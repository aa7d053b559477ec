//! Echo module — yields its input back as a single result.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use crate::engine::context::JobContext;
use crate::engine::job::{JsonMap, LogLevel};
use crate::error::ModuleError;
use crate::modules::{InputSpec, Module, ModuleFactory, ModuleManifest};

pub struct EchoModule;

#[async_trait]
impl Module for EchoModule {
    async fn run(
        &mut self,
        ctx: Arc<JobContext>,
        inputs: JsonMap,
        _settings: JsonMap,
        out: mpsc::Sender<serde_json::Value>,
    ) -> Result<(), ModuleError> {
        let text = inputs
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        ctx.log(LogLevel::Info, format!("Echoing: {text}")).await?;

        if ctx.is_cancelled() {
            return Ok(());
        }

        out.send(json!({"data": text}))
            .await
            .map_err(|_| ModuleError::Failed("result channel closed".to_string()))?;
        Ok(())
    }
}

pub struct EchoFactory;

impl ModuleFactory for EchoFactory {
    fn id(&self) -> &str {
        "echo"
    }

    fn manifest(&self) -> ModuleManifest {
        ModuleManifest {
            id: "echo".to_string(),
            name: "Echo".to_string(),
            version: "0.1.0".to_string(),
            description: "Yields its text input back as a single result".to_string(),
            inputs: vec![InputSpec::required("text")],
        }
    }

    fn create(&self) -> Box<dyn Module> {
        Box::new(EchoModule)
    }
}
