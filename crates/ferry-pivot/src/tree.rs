//! The pivot representation: a feature tree with cross-tree constraints.
//!
//! Stored as pretty JSON in `*.tree.json` files.

use ferry_core::{
    BoxedModel, CancellationToken, CapabilityError, Deserializer, Model, Serializer,
    downcast_model,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::path::Path;

pub const TREE_EXTENSION: &str = ".tree.json";

/// How the children of a feature relate to each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Group {
    /// Each child is selected according to its own `optional` flag.
    #[default]
    And,
    /// At least one child.
    Or,
    /// Exactly one child.
    Alternative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "is_and")]
    pub group: Group,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Feature>,
}

fn is_and(group: &Group) -> bool {
    *group == Group::And
}

impl Feature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
            group: Group::And,
            children: Vec::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_group(mut self, group: Group) -> Self {
        self.group = group;
        self
    }

    pub fn with_child(mut self, child: Feature) -> Self {
        self.children.push(child);
        self
    }

    /// This feature and all its descendants.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Feature::count).sum::<usize>()
    }

    /// Depth-first, parents before children.
    pub fn walk(&self) -> Vec<&Feature> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }
}

/// A cross-tree constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Constraint {
    /// Selecting `feature` requires every feature in `requires`.
    Implies { feature: String, requires: Vec<String> },
    /// `a` and `b` are mutually exclusive.
    Excludes { a: String, b: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTree {
    pub name: String,
    pub root: Feature,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
}

impl FeatureTree {
    pub fn new(name: impl Into<String>, root: Feature) -> Self {
        Self {
            name: name.into(),
            root,
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn feature_count(&self) -> usize {
        self.root.count()
    }
}

impl Model for FeatureTree {
    fn element_count(&self) -> usize {
        self.feature_count()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Reads `*.tree.json`.
pub struct TreeDeserializer;

impl Deserializer for TreeDeserializer {
    fn file_extensions(&self) -> Vec<String> {
        vec![TREE_EXTENSION.to_string()]
    }

    fn deserialize_from_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<BoxedModel, CapabilityError> {
        let data = std::fs::read(path)?;
        cancel.checkpoint()?;
        let tree: FeatureTree = serde_json::from_slice(&data).map_err(|e| {
            CapabilityError::Deserialization(format!("Invalid feature tree JSON: {}", e))
        })?;
        Ok(Box::new(tree))
    }
}

/// Writes `*.tree.json`.
pub struct TreeSerializer;

impl Serializer for TreeSerializer {
    fn file_extension(&self) -> String {
        TREE_EXTENSION.to_string()
    }

    fn serialize_to_file(
        &self,
        model: &dyn Model,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), CapabilityError> {
        let tree = downcast_model::<FeatureTree>(model)?;
        let data = serde_json::to_vec_pretty(tree).map_err(|e| {
            CapabilityError::Serialization(format!("JSON serialization failed: {}", e))
        })?;
        cancel.checkpoint()?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

/// Small tree with one alternative group and one constraint.
#[cfg(test)]
pub(crate) fn sample_car() -> FeatureTree {
    FeatureTree::new(
        "car",
        Feature::new("Car")
            .with_child(
                Feature::new("Engine")
                    .with_group(Group::Alternative)
                    .with_child(Feature::new("Electric"))
                    .with_child(Feature::new("Gas")),
            )
            .with_child(Feature::new("Radio").optional()),
    )
    .with_constraint(Constraint::Excludes {
        a: "Electric".into(),
        b: "Radio".into(),
    })
}
