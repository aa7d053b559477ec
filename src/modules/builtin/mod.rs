//! Built-in modules registered at startup.

pub mod counter;
pub mod echo;

pub use counter::CounterFactory;
pub use echo::EchoFactory;

use crate::modules::ModuleRegistry;

/// Register every built-in module.
pub fn register_builtin(registry: &ModuleRegistry) {
    registry.register_sync(std::sync::Arc::new(EchoFactory));
    registry.register_sync(std::sync::Arc::new(CounterFactory));
}
