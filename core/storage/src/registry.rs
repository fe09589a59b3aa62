//! Store registry for resolving a durable store from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::KeyValueStore;
use lexisync_common::{Error, Result};

/// Factory function type for creating stores.
pub type StoreFactory = Box<dyn Fn(Value) -> Result<Arc<dyn KeyValueStore>> + Send + Sync>;

/// Registry for key-value store factories.
///
/// Allows the host to pick a store by name and configuration, e.g. from a
/// config file, without the engine knowing the concrete type.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Store '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a store by name and configuration.
    ///
    /// # Errors
    /// - Store not registered
    /// - Configuration invalid for the store
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn KeyValueStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Store '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered store names.
    pub fn stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in stores.
pub fn create_default_registry() -> StoreRegistry {
    let mut registry = StoreRegistry::new();

    // Register memory store (for testing)
    registry
        .register(
            "memory",
            Box::new(|_config| Ok(Arc::new(crate::memory::MemoryStore::new()))),
        )
        .expect("Failed to register memory store");

    // Register local filesystem store
    registry
        .register(
            "local",
            Box::new(|config| {
                let root = config.get("root").and_then(|v| v.as_str()).ok_or_else(|| {
                    Error::InvalidInput("Local store requires a 'root' path".to_string())
                })?;
                Ok(Arc::new(crate::local::FileStore::new(root)?))
            }),
        )
        .expect("Failed to register local store");

    registry
}
