//! Module registry keyed by module id.
//!
//! Population happens by in-process registration at startup; the engine
//! resolves ids through this registry and never inspects module
//! internals.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::ModuleError;
use crate::modules::{ModuleFactory, ModuleManifest};

/// Registry of available module factories.
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Arc<dyn ModuleFactory>>>,
}

impl ModuleRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
        }
    }

    /// Register a module factory under its own id.
    pub async fn register(&self, factory: Arc<dyn ModuleFactory>) {
        let id = factory.id().to_string();
        self.modules.write().await.insert(id.clone(), factory);
        tracing::debug!("Registered module: {}", id);
    }

    /// Register a factory (sync version for startup wiring).
    pub fn register_sync(&self, factory: Arc<dyn ModuleFactory>) {
        if let Ok(mut modules) = self.modules.try_write() {
            let id = factory.id().to_string();
            modules.insert(id.clone(), factory);
            tracing::debug!("Registered module: {}", id);
        }
    }

    /// Unregister a module.
    pub async fn unregister(&self, id: &str) -> Option<Arc<dyn ModuleFactory>> {
        self.modules.write().await.remove(id)
    }

    /// Resolve a module id to its factory.
    pub async fn resolve(&self, id: &str) -> Result<Arc<dyn ModuleFactory>, ModuleError> {
        self.modules
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ModuleError::NotFound { id: id.to_string() })
    }

    /// Check if a module id is registered.
    pub async fn has(&self, id: &str) -> bool {
        self.modules.read().await.contains_key(id)
    }

    /// Manifests of all registered modules, sorted by id.
    pub async fn list(&self) -> Vec<ModuleManifest> {
        let mut manifests: Vec<ModuleManifest> = self
            .modules
            .read()
            .await
            .values()
            .map(|f| f.manifest())
            .collect();
        manifests.sort_by(|a, b| a.id.cmp(&b.id));
        manifests
    }

    /// Number of registered modules.
    pub fn count(&self) -> usize {
        self.modules.try_read().map(|m| m.len()).unwrap_or(0)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
