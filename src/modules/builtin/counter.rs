//! Counter module — emits a sequence of numbers with checkpointing.
//!
//! Demonstrates the full module contract: cooperative cancellation,
//! periodic checkpoints, and incremental results. Resuming picks up from
//! the last checkpointed position.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use crate::engine::context::JobContext;
use crate::engine::job::{JsonMap, LogLevel};
use crate::error::ModuleError;
use crate::modules::{InputSpec, Module, ModuleFactory, ModuleManifest};

pub struct CounterModule {
    next: u64,
}

impl CounterModule {
    pub fn new() -> Self {
        Self { next: 1 }
    }
}

impl Default for CounterModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for CounterModule {
    fn restore(&mut self, checkpoint: &JsonMap) {
        if let Some(progress) = checkpoint.get("progress").and_then(|v| v.as_u64()) {
            self.next = progress + 1;
        }
    }

    async fn run(
        &mut self,
        ctx: Arc<JobContext>,
        inputs: JsonMap,
        settings: JsonMap,
        out: mpsc::Sender<serde_json::Value>,
    ) -> Result<(), ModuleError> {
        let count = inputs.get("count").and_then(|v| v.as_u64()).unwrap_or(10);
        let delay_ms = settings
            .get("delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        if self.next > 1 {
            ctx.log(LogLevel::Info, format!("Resuming at {}", self.next))
                .await?;
        }

        while self.next <= count {
            if ctx.is_cancelled() {
                ctx.log(LogLevel::Info, "Cancellation observed, returning early")
                    .await?;
                return Ok(());
            }

            out.send(json!({"n": self.next}))
                .await
                .map_err(|_| ModuleError::Failed("result channel closed".to_string()))?;

            let mut cp = JsonMap::new();
            cp.insert("progress".into(), json!(self.next));
            ctx.save_checkpoint(&cp).await?;

            self.next += 1;
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        Ok(())
    }
}

pub struct CounterFactory;

impl ModuleFactory for CounterFactory {
    fn id(&self) -> &str {
        "counter"
    }

    fn manifest(&self) -> ModuleManifest {
        ModuleManifest {
            id: "counter".to_string(),
            name: "Counter".to_string(),
            version: "0.1.0".to_string(),
            description: "Emits numbers 1..=count, checkpointing each step".to_string(),
            inputs: vec![
                InputSpec::optional("count", json!(10))
                    .with_description("How many numbers to emit"),
            ],
        }
    }

    fn create(&self) -> Box<dyn Module> {
        Box::new(CounterModule::new())
    }
}
