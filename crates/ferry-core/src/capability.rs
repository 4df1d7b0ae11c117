//! Capabilities supplied by plugins: deserializers, transformers, serializers.
//!
//! The orchestrator treats models as opaque. The only thing it asks of a model
//! is its size (number of variability elements), which feeds the lifecycle
//! events. Transformers downcast to the concrete representation they handle.

use crate::channel::Emitter;
use crate::runner::{CancellationToken, Cancelled};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::path::Path;

/// A deserialized model in some representation.
pub trait Model: Any + Send + fmt::Debug {
    /// Number of variability elements (features or their equivalent).
    fn element_count(&self) -> usize;

    fn as_any(&self) -> &dyn Any;
}

/// Owned model flowing between pipeline phases.
pub type BoxedModel = Box<dyn Model>;

/// Borrow `model` as the concrete representation `T`.
pub fn downcast_model<T: Model>(model: &dyn Model) -> Result<&T, CapabilityError> {
    model
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| CapabilityError::UnexpectedModel {
            expected: std::any::type_name::<T>(),
        })
}

/// Transformation strategy, passed through to transformers untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    OneWay,
    RoundTrip,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::OneWay => f.write_str("one-way"),
            Strategy::RoundTrip => f.write_str("round-trip"),
        }
    }
}

/// Per-call information handed to a transformer.
#[derive(Debug, Clone)]
pub struct TransformContext {
    /// Name of the model being transformed (the source file name).
    pub model_name: String,
    pub strategy: Strategy,
    /// True unless this is the last step of the plan.
    pub intermediate: bool,
    /// Present only for benchmarked steps.
    pub emitter: Option<Emitter>,
    pub cancel: CancellationToken,
}

impl TransformContext {
    /// Publish a fine-grained event if this step is benchmarked.
    ///
    /// Subscriber failures are logged and otherwise ignored; they must not fail
    /// the transformation.
    pub fn emit(&self, kind: crate::event::EventKind) {
        if let Some(emitter) = &self.emitter
            && let Err(err) = emitter.emit(kind)
        {
            tracing::warn!(model = %self.model_name, %err, "benchmark event delivery failed");
        }
    }

    /// Shorthand for `self.cancel.checkpoint()`.
    pub fn checkpoint(&self) -> Result<(), CapabilityError> {
        self.cancel.checkpoint().map_err(CapabilityError::from)
    }
}

/// Reads models of one representation from files.
pub trait Deserializer: Send + Sync {
    /// Extensions (including the leading dot) of files this deserializer reads.
    fn file_extensions(&self) -> Vec<String>;

    fn deserialize_from_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<BoxedModel, CapabilityError>;
}

/// Writes models of one representation to files.
pub trait Serializer: Send + Sync {
    /// Extension (including the leading dot) appended to written files.
    fn file_extension(&self) -> String;

    fn serialize_to_file(
        &self,
        model: &dyn Model,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), CapabilityError>;
}

/// Converts between the pivot representation and one target representation.
pub trait Transformer: Send + Sync {
    /// Name used in logs and plan listings.
    fn name(&self) -> &str;

    /// Pivot → target.
    fn forward(
        &self,
        pivot: &dyn Model,
        ctx: &TransformContext,
    ) -> Result<BoxedModel, CapabilityError>;

    /// Target → pivot.
    fn backward(
        &self,
        target: &dyn Model,
        ctx: &TransformContext,
    ) -> Result<BoxedModel, CapabilityError>;
}

/// Errors raised by capabilities.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("transformation failed: {0}")]
    Transformation(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("unexpected model representation, expected {expected}")]
    UnexpectedModel { expected: &'static str },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}
