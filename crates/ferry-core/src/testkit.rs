//! In-crate test doubles for capabilities.
//!
//! Model files are plain text, one feature name per line. Marker features
//! drive failure modes so a batch can mix good and bad files:
//! `!malformed` fails deserialization, `__fail` fails transformation,
//! `__slow` sleeps cooperatively, `__unwritable` fails serialization.
//! `__hang_read`, `__hang` and `__hang_write` sleep ignoring cancellation
//! while deserializing, transforming and serializing respectively.

use crate::capability::{
    BoxedModel, CapabilityError, Deserializer, Model, Serializer, TransformContext, Transformer,
    downcast_model,
};
use crate::event::EventKind;
use crate::registry::{Plugin, PluginRegistry};
use crate::runner::CancellationToken;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

pub const HANG_FOR: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct TestModel {
    pub features: Vec<String>,
}

impl Model for TestModel {
    fn element_count(&self) -> usize {
        self.features.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl TestModel {
    fn has(&self, marker: &str) -> bool {
        self.features.iter().any(|f| f == marker)
    }
}

fn sleep_cooperatively(total: Duration, cancel: &CancellationToken) -> Result<(), CapabilityError> {
    let start = Instant::now();
    while start.elapsed() < total {
        cancel.checkpoint()?;
        thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

fn stall(model: &TestModel, cancel: &CancellationToken) -> Result<(), CapabilityError> {
    if model.has("__hang") {
        thread::sleep(HANG_FOR);
    }
    if model.has("__slow") {
        sleep_cooperatively(HANG_FOR, cancel)?;
    }
    Ok(())
}

pub struct MockDeserializer {
    extension: String,
}

impl MockDeserializer {
    pub fn new(extension: &str) -> Self {
        Self {
            extension: extension.to_string(),
        }
    }
}

impl Deserializer for MockDeserializer {
    fn file_extensions(&self) -> Vec<String> {
        vec![self.extension.clone()]
    }

    fn deserialize_from_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<BoxedModel, CapabilityError> {
        let text = std::fs::read_to_string(path)?;
        if text.starts_with("!malformed") {
            return Err(CapabilityError::Deserialization(format!(
                "{} is malformed",
                path.display()
            )));
        }
        let model = TestModel {
            features: text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
        };
        if model.has("__hang_read") {
            thread::sleep(HANG_FOR);
        }
        cancel.checkpoint()?;
        Ok(Box::new(model))
    }
}

pub struct MockSerializer {
    extension: String,
}

impl MockSerializer {
    pub fn new(extension: &str) -> Self {
        Self {
            extension: extension.to_string(),
        }
    }
}

impl Serializer for MockSerializer {
    fn file_extension(&self) -> String {
        self.extension.clone()
    }

    fn serialize_to_file(
        &self,
        model: &dyn Model,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), CapabilityError> {
        let model = downcast_model::<TestModel>(model)?;
        if model.has("__unwritable") {
            return Err(CapabilityError::Serialization("refusing to write".into()));
        }
        if model.has("__hang_write") {
            thread::sleep(HANG_FOR);
        }
        cancel.checkpoint()?;
        std::fs::write(path, model.features.join("\n"))?;
        Ok(())
    }
}

/// Identity transformer that reports every feature it copies.
pub struct MockTransformer {
    name: String,
    calls: Arc<AtomicUsize>,
}

impl MockTransformer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    fn copy(&self, model: &dyn Model, ctx: &TransformContext) -> Result<BoxedModel, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let model = downcast_model::<TestModel>(model)?;
        stall(model, &ctx.cancel)?;
        if model.has("__fail") {
            return Err(CapabilityError::Transformation(format!(
                "{} cannot handle {}",
                self.name, ctx.model_name
            )));
        }
        for feature in &model.features {
            ctx.emit(EventKind::NewFeature {
                feature: feature.clone(),
            });
        }
        Ok(Box::new(model.clone()))
    }
}

impl Transformer for MockTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, pivot: &dyn Model, ctx: &TransformContext) -> Result<BoxedModel, CapabilityError> {
        self.copy(pivot, ctx)
    }

    fn backward(
        &self,
        target: &dyn Model,
        ctx: &TransformContext,
    ) -> Result<BoxedModel, CapabilityError> {
        self.copy(target, ctx)
    }
}

/// Registry with pivot `tree` (`.tree`) and plugin `outline` (`.outline`).
///
/// Returns the outline transformer's call counter.
pub fn registry() -> (PluginRegistry, Arc<AtomicUsize>) {
    let mut registry = PluginRegistry::new();
    registry
        .register(Plugin::pivot(
            "tree",
            MockDeserializer::new(".tree"),
            MockSerializer::new(".tree"),
        ))
        .unwrap();
    let transformer = MockTransformer::new("outline");
    let calls = transformer.calls();
    registry
        .register(Plugin::new(
            "outline",
            MockDeserializer::new(".outline"),
            MockSerializer::new(".outline"),
            transformer,
        ))
        .unwrap();
    registry
        .register(Plugin::new(
            "grid",
            MockDeserializer::new(".grid"),
            MockSerializer::new(".grid"),
            MockTransformer::new("grid"),
        ))
        .unwrap();
    (registry, calls)
}
