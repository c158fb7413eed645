//! Registry for translators and adapters
//!
//! Translators are keyed by `(type, type_version)`, adapters by backend
//! name. Last registration wins; lookups return `None` and callers surface
//! the miss at the point of use.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::Adapter;
use crate::translator::Translator;

#[derive(Default)]
pub struct Registry {
    translators: HashMap<(String, String), Arc<dyn Translator>>,
    adapters: HashMap<String, Arc<dyn Adapter>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a translator for an intent type and version.
    pub fn register_translator(
        &mut self,
        kind: impl Into<String>,
        kind_version: impl Into<String>,
        translator: Arc<dyn Translator>,
    ) {
        self.translators
            .insert((kind.into(), kind_version.into()), translator);
    }

    pub fn translator(&self, kind: &str, kind_version: &str) -> Option<Arc<dyn Translator>> {
        self.translators
            .get(&(kind.to_string(), kind_version.to_string()))
            .cloned()
    }

    /// Register an adapter under its own name.
    pub fn register_adapter(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(name).cloned()
    }

    /// Registered `(type, type_version)` pairs.
    pub fn list_translators(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.translators.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Registered backend names.
    pub fn list_adapters(&self) -> Vec<String> {
        let mut names: Vec<_> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}
