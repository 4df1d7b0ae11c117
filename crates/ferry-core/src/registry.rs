//! Registry of plugins: one per model type, exactly one of them the pivot.

use crate::capability::{Deserializer, Serializer, Transformer};
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// The capabilities one model type brings.
#[derive(Clone)]
pub struct Plugin {
    name: String,
    deserializer: Arc<dyn Deserializer>,
    serializer: Arc<dyn Serializer>,
    /// `None` only for the pivot plugin.
    transformer: Option<Arc<dyn Transformer>>,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("extensions", &self.deserializer.file_extensions())
            .field("output_extension", &self.serializer.file_extension())
            .field(
                "transformer",
                &self.transformer.as_ref().map(|t| t.name().to_string()),
            )
            .finish()
    }
}

impl Plugin {
    /// A non-pivot plugin: it reaches the pivot through `transformer`.
    pub fn new(
        name: impl Into<String>,
        deserializer: impl Deserializer + 'static,
        serializer: impl Serializer + 'static,
        transformer: impl Transformer + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            deserializer: Arc::new(deserializer),
            serializer: Arc::new(serializer),
            transformer: Some(Arc::new(transformer)),
        }
    }

    /// The pivot plugin. It needs no transformer.
    pub fn pivot(
        name: impl Into<String>,
        deserializer: impl Deserializer + 'static,
        serializer: impl Serializer + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            deserializer: Arc::new(deserializer),
            serializer: Arc::new(serializer),
            transformer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_pivot(&self) -> bool {
        self.transformer.is_none()
    }

    pub fn deserializer(&self) -> &Arc<dyn Deserializer> {
        &self.deserializer
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn transformer(&self) -> Option<&Arc<dyn Transformer>> {
        self.transformer.as_ref()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("plugin '{0}' is already registered")]
    Duplicate(String),

    #[error("cannot register '{new}' as pivot, '{existing}' already is")]
    SecondPivot { existing: String, new: String },
}

/// Plugins indexed by lowercased name, in registration order.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: IndexMap<String, Plugin>,
    pivot: Option<String>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .field("pivot", &self.pivot)
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Plugin) -> Result<(), RegistryError> {
        let key = plugin.name.to_lowercase();
        if self.plugins.contains_key(&key) {
            return Err(RegistryError::Duplicate(plugin.name));
        }
        if plugin.is_pivot() {
            if let Some(existing) = &self.pivot {
                return Err(RegistryError::SecondPivot {
                    existing: existing.clone(),
                    new: plugin.name,
                });
            }
            self.pivot = Some(key.clone());
        }
        tracing::debug!(plugin = %plugin.name, pivot = plugin.is_pivot(), "registered plugin");
        self.plugins.insert(key, plugin);
        Ok(())
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&Plugin> {
        self.plugins.get(&name.to_lowercase())
    }

    pub fn pivot(&self) -> Option<&Plugin> {
        self.pivot.as_ref().and_then(|key| self.plugins.get(key))
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Plugin> {
        self.plugins.values()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
