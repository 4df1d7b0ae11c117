//! Pipeline plans: the chain of transformation steps between two model types.
//!
//! Every step crosses the pivot representation once, so the direction of a
//! step follows from which side the model is on when it starts: a model on the
//! pivot side goes `forward`, a model on the target side goes `backward`.

use crate::capability::{Deserializer, Serializer, Strategy, Transformer};
use crate::registry::{Plugin, PluginRegistry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Which representation the current model is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Pivot,
    Target,
}

impl Side {
    pub fn flip(self) -> Self {
        match self {
            Side::Pivot => Side::Target,
            Side::Target => Side::Pivot,
        }
    }

    /// Direction of a step starting on this side.
    pub fn direction(self) -> Direction {
        match self {
            Side::Pivot => Direction::Forward,
            Side::Target => Direction::Backward,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Backward => f.write_str("backward"),
        }
    }
}

/// How the chain is run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Source → target.
    #[default]
    OneWay,
    /// Source → target → source, every step benchmarked.
    RoundTrip,
    /// Source → target → source, only the final step benchmarked.
    ReverseOnly,
}

impl Mode {
    pub fn is_mirrored(self) -> bool {
        !matches!(self, Mode::OneWay)
    }
}

/// One transformation step of a plan.
#[derive(Clone)]
pub struct PlanStep {
    pub index: usize,
    pub transformer: Arc<dyn Transformer>,
    /// Belongs to the appended reverse half.
    pub mirrored: bool,
    /// Lifecycle events are emitted for this step.
    pub benchmarked: bool,
}

impl fmt::Debug for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanStep")
            .field("index", &self.index)
            .field("transformer", &self.transformer.name())
            .field("mirrored", &self.mirrored)
            .field("benchmarked", &self.benchmarked)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("source and target type are both '{0}'")]
    SameType(String),

    #[error("unknown {role} type '{name}'")]
    UnknownType { role: &'static str, name: String },

    #[error("no pivot plugin registered")]
    NoPivot,
}

/// Resolved, immutable plan for one batch.
#[derive(Clone)]
pub struct PipelinePlan {
    source: String,
    target: String,
    steps: Vec<PlanStep>,
    start: Side,
    mode: Mode,
    strategy: Strategy,
    deserializer: Arc<dyn Deserializer>,
    serializer: Arc<dyn Serializer>,
}

impl fmt::Debug for PipelinePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelinePlan")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("steps", &self.steps)
            .field("start", &self.start)
            .field("mode", &self.mode)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl PipelinePlan {
    /// Resolve the chain from `source` type to `target` type.
    pub fn build(
        registry: &PluginRegistry,
        source: &str,
        target: &str,
        mode: Mode,
        strategy: Strategy,
    ) -> Result<Self, PlanError> {
        let source_plugin = lookup(registry, "source", source)?;
        let target_plugin = lookup(registry, "target", target)?;
        if source_plugin.name().eq_ignore_ascii_case(target_plugin.name()) {
            return Err(PlanError::SameType(source_plugin.name().to_string()));
        }
        if registry.pivot().is_none() {
            return Err(PlanError::NoPivot);
        }

        let mut chain: Vec<Arc<dyn Transformer>> = Vec::new();
        chain.extend(source_plugin.transformer().cloned());
        chain.extend(target_plugin.transformer().cloned());
        let start = if source_plugin.is_pivot() {
            Side::Pivot
        } else {
            Side::Target
        };

        Ok(Self::from_chain(
            source_plugin,
            target_plugin,
            chain,
            start,
            mode,
            strategy,
        ))
    }

    fn from_chain(
        source: &Plugin,
        target: &Plugin,
        chain: Vec<Arc<dyn Transformer>>,
        start: Side,
        mode: Mode,
        strategy: Strategy,
    ) -> Self {
        let half = chain.len();
        let mut transformers = chain.clone();
        if mode.is_mirrored() {
            transformers.extend(chain.into_iter().rev());
        }
        let last = transformers.len().saturating_sub(1);

        let steps = transformers
            .into_iter()
            .enumerate()
            .map(|(index, transformer)| {
                let mirrored = index >= half;
                PlanStep {
                    index,
                    transformer,
                    mirrored,
                    benchmarked: mode != Mode::ReverseOnly || index == last,
                }
            })
            .collect();

        // Mirrored plans end where they started.
        let output = if mode.is_mirrored() { source } else { target };

        Self {
            source: source.name().to_string(),
            target: target.name().to_string(),
            steps,
            start,
            mode,
            strategy,
            deserializer: source.deserializer().clone(),
            serializer: output.serializer().clone(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn start(&self) -> Side {
        self.start
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn deserializer(&self) -> &Arc<dyn Deserializer> {
        &self.deserializer
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    /// Extensions of source files this plan accepts.
    pub fn source_extensions(&self) -> Vec<String> {
        self.deserializer.file_extensions()
    }

    /// Extension appended to output files.
    pub fn output_extension(&self) -> String {
        self.serializer.file_extension()
    }

    /// Direction of every step, in order.
    pub fn directions(&self) -> Vec<Direction> {
        let mut side = self.start;
        self.steps
            .iter()
            .map(|_| {
                let direction = side.direction();
                side = side.flip();
                direction
            })
            .collect()
    }
}

fn lookup<'a>(
    registry: &'a PluginRegistry,
    role: &'static str,
    name: &str,
) -> Result<&'a Plugin, PlanError> {
    registry.get(name).ok_or_else(|| PlanError::UnknownType {
        role,
        name: name.to_string(),
    })
}
