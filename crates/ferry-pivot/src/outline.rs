//! Outline: a flat YAML listing of features with parent references.
//!
//! Groups and constraints that the outline cannot nest are kept as side
//! tables: `one_of` / `any_of` member lists and pairwise `requires` /
//! `excludes` rules.

use crate::tree::{Constraint, Feature, FeatureTree, Group};
use ferry_core::{
    BoxedModel, CancellationToken, CapabilityError, Deserializer, EventKind, Model, Serializer,
    TransformContext, Transformer, downcast_model,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::path::Path;

pub const OUTLINE_EXTENSION: &str = ".outline.yaml";

/// Deepest feature nesting an outline may describe. A tree this deep still
/// fits within serde_json's recursion limit when written and read back.
pub const MAX_DEPTH: usize = 48;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub name: String,
    /// Parents are listed before their children.
    pub nodes: Vec<OutlineNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub one_of: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<[String; 2]>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<[String; 2]>,
}

impl Model for Outline {
    fn element_count(&self) -> usize {
        self.nodes.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct OutlineDeserializer;

impl Deserializer for OutlineDeserializer {
    fn file_extensions(&self) -> Vec<String> {
        vec![OUTLINE_EXTENSION.to_string()]
    }

    fn deserialize_from_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<BoxedModel, CapabilityError> {
        let data = std::fs::read(path)?;
        cancel.checkpoint()?;
        let outline: Outline = serde_yaml::from_slice(&data)
            .map_err(|e| CapabilityError::Deserialization(format!("Invalid outline YAML: {}", e)))?;
        Ok(Box::new(outline))
    }
}

pub struct OutlineSerializer;

impl Serializer for OutlineSerializer {
    fn file_extension(&self) -> String {
        OUTLINE_EXTENSION.to_string()
    }

    fn serialize_to_file(
        &self,
        model: &dyn Model,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), CapabilityError> {
        let outline = downcast_model::<Outline>(model)?;
        let text = serde_yaml::to_string(outline).map_err(|e| {
            CapabilityError::Serialization(format!("YAML serialization failed: {}", e))
        })?;
        cancel.checkpoint()?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// Converts feature trees to outlines and back.
pub struct OutlineTransformer;

impl Transformer for OutlineTransformer {
    fn name(&self) -> &str {
        "outline"
    }

    fn forward(&self, pivot: &dyn Model, ctx: &TransformContext) -> Result<BoxedModel, CapabilityError> {
        let tree = downcast_model::<FeatureTree>(pivot)?;
        Ok(Box::new(flatten(tree, ctx)?))
    }

    fn backward(
        &self,
        target: &dyn Model,
        ctx: &TransformContext,
    ) -> Result<BoxedModel, CapabilityError> {
        let outline = downcast_model::<Outline>(target)?;
        Ok(Box::new(nest(outline, ctx)?))
    }
}

fn flatten(tree: &FeatureTree, ctx: &TransformContext) -> Result<Outline, CapabilityError> {
    let mut outline = Outline {
        name: tree.name.clone(),
        nodes: Vec::with_capacity(tree.feature_count()),
        one_of: Vec::new(),
        any_of: Vec::new(),
        requires: Vec::new(),
        excludes: Vec::new(),
    };
    flatten_feature(&tree.root, None, Group::And, &mut outline, ctx)?;

    for constraint in &tree.constraints {
        match constraint {
            Constraint::Implies { feature, requires } => {
                if requires.len() > 1 {
                    ctx.emit(EventKind::OneToN {
                        detail: format!("{feature} implies {} features", requires.len()),
                    });
                }
                outline
                    .requires
                    .extend(requires.iter().map(|r| [feature.clone(), r.clone()]));
            }
            Constraint::Excludes { a, b } => outline.excludes.push([a.clone(), b.clone()]),
        }
    }
    tracing::debug!(model = %ctx.model_name, nodes = outline.nodes.len(), "flattened feature tree");
    Ok(outline)
}

fn flatten_feature(
    feature: &Feature,
    parent: Option<&str>,
    parent_group: Group,
    outline: &mut Outline,
    ctx: &TransformContext,
) -> Result<(), CapabilityError> {
    ctx.checkpoint()?;
    outline.nodes.push(OutlineNode {
        name: feature.name.clone(),
        parent: parent.map(String::from),
        // Group members are individually optional.
        optional: feature.optional || parent_group != Group::And,
    });
    ctx.emit(EventKind::NewFeature {
        feature: feature.name.clone(),
    });

    let members = || feature.children.iter().map(|c| c.name.clone()).collect();
    match feature.group {
        Group::And => {}
        Group::Or => {
            outline.any_of.push(members());
            ctx.emit(EventKind::AdditionalConstraint { factor: 1 });
        }
        Group::Alternative => {
            outline.one_of.push(members());
            ctx.emit(EventKind::AdditionalConstraint { factor: 1 });
        }
    }

    for child in &feature.children {
        flatten_feature(child, Some(&feature.name), feature.group, outline, ctx)?;
    }
    Ok(())
}

fn nest(outline: &Outline, ctx: &TransformContext) -> Result<FeatureTree, CapabilityError> {
    let invalid = |msg: String| CapabilityError::Transformation(format!("{}: {msg}", ctx.model_name));

    let mut children: IndexMap<Option<&str>, Vec<&OutlineNode>> = IndexMap::new();
    let mut seen = std::collections::HashSet::new();
    for node in &outline.nodes {
        if !seen.insert(node.name.as_str()) {
            return Err(invalid(format!("duplicate feature '{}'", node.name)));
        }
        children
            .entry(node.parent.as_deref())
            .or_default()
            .push(node);
    }

    let root = match children.get(&None).map(Vec::as_slice) {
        Some([root]) => *root,
        Some(_) => return Err(invalid("more than one root feature".into())),
        None => return Err(invalid("no root feature".into())),
    };

    let mut groups: IndexMap<&str, Group> = IndexMap::new();
    for (sets, group) in [(&outline.one_of, Group::Alternative), (&outline.any_of, Group::Or)] {
        for members in sets {
            let parent = group_parent(outline, &children, members).ok_or_else(|| {
                invalid(format!("group {members:?} is not the full child set of one feature"))
            })?;
            if groups.insert(parent, group).is_some() {
                return Err(invalid(format!("feature '{parent}' has more than one group")));
            }
        }
    }

    let mut root = nest_feature(root, &children, &groups, Group::And, 0, ctx)?;
    let built = root.count();
    if built != outline.nodes.len() {
        return Err(invalid(format!(
            "{} feature(s) unreachable from root '{}'",
            outline.nodes.len() - built,
            root.name
        )));
    }
    root.optional = false;

    let mut constraints: Vec<Constraint> = Vec::new();
    let mut implied: IndexMap<&str, Vec<String>> = IndexMap::new();
    for [feature, required] in &outline.requires {
        implied
            .entry(feature.as_str())
            .or_default()
            .push(required.clone());
    }
    constraints.extend(implied.into_iter().map(|(feature, requires)| Constraint::Implies {
        feature: feature.to_string(),
        requires,
    }));
    constraints.extend(outline.excludes.iter().map(|[a, b]| Constraint::Excludes {
        a: a.clone(),
        b: b.clone(),
    }));

    Ok(FeatureTree {
        name: outline.name.clone(),
        root,
        constraints,
    })
}

/// The feature whose children are exactly `members`, if any.
fn group_parent<'a>(
    outline: &'a Outline,
    children: &IndexMap<Option<&'a str>, Vec<&'a OutlineNode>>,
    members: &[String],
) -> Option<&'a str> {
    let first = members.first()?;
    let parent = outline
        .nodes
        .iter()
        .find(|n| &n.name == first)?
        .parent
        .as_deref()?;
    let siblings = children.get(&Some(parent))?;
    let same = siblings.len() == members.len()
        && siblings.iter().all(|s| members.contains(&s.name));
    same.then_some(parent)
}

fn nest_feature(
    node: &OutlineNode,
    children: &IndexMap<Option<&str>, Vec<&OutlineNode>>,
    groups: &IndexMap<&str, Group>,
    parent_group: Group,
    depth: usize,
    ctx: &TransformContext,
) -> Result<Feature, CapabilityError> {
    ctx.checkpoint()?;
    if depth >= MAX_DEPTH {
        return Err(CapabilityError::Transformation(format!(
            "{}: feature '{}' is nested deeper than {MAX_DEPTH} levels",
            ctx.model_name, node.name
        )));
    }
    let group = groups.get(node.name.as_str()).copied().unwrap_or_default();
    let mut feature = Feature::new(node.name.clone()).with_group(group);
    feature.optional = node.optional && parent_group == Group::And;
    ctx.emit(EventKind::NewFeature {
        feature: node.name.clone(),
    });

    if let Some(kids) = children.get(&Some(node.name.as_str())) {
        for kid in kids {
            feature
                .children
                .push(nest_feature(kid, children, groups, group, depth + 1, ctx)?);
        }
    }
    Ok(feature)
}
