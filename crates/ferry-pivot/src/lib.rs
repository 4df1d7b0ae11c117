//! Feature-tree pivot representation for Ferry.
//!
//! The pivot is a [`FeatureTree`] stored as `*.tree.json`. Other model types
//! reach it through a transformer. Enable them via feature flags.
//!
//! # Features
//!
//! - `outline` (default) - flat YAML outline (`*.outline.yaml`) with a
//!   bidirectional transformer

use ferry_core::{Plugin, PluginRegistry, RegistryError};

mod tree;

#[cfg(feature = "outline")]
mod outline;

pub use tree::{Constraint, Feature, FeatureTree, Group, TREE_EXTENSION, TreeDeserializer, TreeSerializer};

#[cfg(feature = "outline")]
pub use outline::{
    OUTLINE_EXTENSION, Outline, OutlineDeserializer, OutlineNode, OutlineSerializer,
    OutlineTransformer,
};

/// Type name of the pivot plugin.
pub const PIVOT_NAME: &str = "tree";

/// Register the pivot and all enabled plugins with the registry.
pub fn register_all(registry: &mut PluginRegistry) -> Result<(), RegistryError> {
    registry.register(Plugin::pivot(PIVOT_NAME, TreeDeserializer, TreeSerializer))?;

    #[cfg(feature = "outline")]
    registry.register(Plugin::new(
        "outline",
        OutlineDeserializer,
        OutlineSerializer,
        OutlineTransformer,
    ))?;

    Ok(())
}
