//! Benchmark collectors: subscribers that turn lifecycle events into ledger columns.
//!
//! A fresh set of collectors is instantiated for every file and subscribed to
//! that file's context only. Each built-in collector unsubscribes itself when
//! it sees the terminal `End` of its session.

use crate::channel::{EventChannel, Subscriber, SubscriberError, SubscriberId, SubscriptionHandle};
use crate::event::{ContextId, Event, EventKind, EventTag};
use crate::value::{Record, Value};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Accumulates results for one session.
pub trait Collector: Send + Sync {
    /// Stable identifier, used to select the collector by name.
    fn id(&self) -> &str;

    /// Column names, aligned with [`current_results`](Self::current_results).
    fn result_columns(&self) -> Vec<String>;

    fn current_results(&self) -> Vec<Value>;
}

/// A collector together with its subscriber face.
#[derive(Clone)]
pub struct CollectorHandle {
    collector: Arc<dyn Collector>,
    subscriber: Arc<dyn Subscriber>,
}

impl CollectorHandle {
    pub fn new<T>(collector: Arc<T>) -> Self
    where
        T: Collector + Subscriber + 'static,
    {
        Self {
            collector: collector.clone(),
            subscriber: collector,
        }
    }

    pub fn collector(&self) -> &Arc<dyn Collector> {
        &self.collector
    }

    pub fn subscriber(&self) -> &Arc<dyn Subscriber> {
        &self.subscriber
    }
}

impl fmt::Debug for CollectorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorHandle")
            .field("id", &self.collector.id())
            .finish()
    }
}

pub type CollectorFactory = Arc<dyn Fn() -> CollectorHandle + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("unknown collector '{0}'")]
    Unknown(String),
}

#[derive(Clone)]
struct CollectorEntry {
    columns: Vec<String>,
    factory: CollectorFactory,
}

/// Collector factories by id.
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    entries: IndexMap<String, CollectorEntry>,
}

impl fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("ids", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `modelSize`, `transformationTime` and `complexity`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(|| CollectorHandle::new(Arc::new(ModelSizeCollector::new())));
        registry.register(|| CollectorHandle::new(Arc::new(TransformationTimeCollector::new())));
        registry.register(|| CollectorHandle::new(Arc::new(ComplexityCollector::new())));
        registry
    }

    /// Register a factory. Id and columns are read from one probe instance.
    pub fn register(&mut self, factory: impl Fn() -> CollectorHandle + Send + Sync + 'static) {
        let probe = factory();
        let id = probe.collector.id().to_string();
        let columns = probe.collector.result_columns();
        self.entries.insert(
            id,
            CollectorEntry {
                columns,
                factory: Arc::new(factory),
            },
        );
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn columns(&self, id: &str) -> Option<&[String]> {
        self.entries.get(id).map(|e| e.columns.as_slice())
    }

    /// Select collectors by id. The selection is sorted by id and deduplicated.
    pub fn select<S: AsRef<str>>(&self, ids: &[S]) -> Result<CollectorSelection, CollectorError> {
        let mut chosen: Vec<(String, CollectorEntry)> = Vec::new();
        for id in ids {
            let id = id.as_ref().trim();
            if id.is_empty() || chosen.iter().any(|(c, _)| c == id) {
                continue;
            }
            let entry = self
                .entries
                .get(id)
                .ok_or_else(|| CollectorError::Unknown(id.to_string()))?;
            chosen.push((id.to_string(), entry.clone()));
        }
        chosen.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(CollectorSelection { entries: chosen })
    }
}

/// The collectors active for a batch.
#[derive(Clone, Default)]
pub struct CollectorSelection {
    entries: Vec<(String, CollectorEntry)>,
}

impl fmt::Debug for CollectorSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(id, _)| id))
            .finish()
    }
}

impl CollectorSelection {
    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// Every column, collector by collector.
    pub fn columns(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|(_, e)| e.columns.iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fresh collector instances for one session.
    pub fn instantiate(&self) -> CollectorSet {
        CollectorSet {
            members: self
                .entries
                .iter()
                .map(|(_, e)| ((e.factory)(), None))
                .collect(),
        }
    }
}

/// Collector instances bound to one session.
#[derive(Debug, Default)]
pub struct CollectorSet {
    members: Vec<(CollectorHandle, Option<SubscriberId>)>,
}

impl CollectorSet {
    /// Subscribe every collector to `context` on `channel`.
    pub fn attach(&mut self, channel: &EventChannel, context: ContextId) {
        for (handle, id) in &mut self.members {
            *id = Some(channel.subscribe_scoped(handle.subscriber.clone(), context));
        }
    }

    /// Unsubscribe whatever is still subscribed.
    pub fn detach(&mut self, channel: &EventChannel) {
        for (_, id) in &mut self.members {
            if let Some(id) = id.take() {
                channel.unsubscribe(id);
            }
        }
    }

    /// Current results of all collectors, keyed by column.
    pub fn results(&self) -> Record {
        let mut record = Record::new();
        for (handle, _) in &self.members {
            let columns = handle.collector.result_columns();
            let values = handle.collector.current_results();
            record.extend(columns.into_iter().zip(values));
        }
        record
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// ============================================================================
// Built-in collectors
// ============================================================================

#[derive(Debug, Default)]
struct SizeState {
    initial: Option<usize>,
    diff: i64,
    final_size: Option<usize>,
}

/// `modelSize`: initial size, net features added, final size.
#[derive(Debug, Default)]
pub struct ModelSizeCollector {
    state: Mutex<SizeState>,
}

impl ModelSizeCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Collector for ModelSizeCollector {
    fn id(&self) -> &str {
        "modelSize"
    }

    fn result_columns(&self) -> Vec<String> {
        vec![
            "initialSize".into(),
            "expectedDiff".into(),
            "finalSize".into(),
        ]
    }

    fn current_results(&self) -> Vec<Value> {
        let state = self.state.lock();
        vec![
            state.initial.into(),
            state.diff.into(),
            state.final_size.into(),
        ]
    }
}

impl Subscriber for ModelSizeCollector {
    fn name(&self) -> &str {
        self.id()
    }

    fn interested_in(&self, tag: EventTag) -> bool {
        matches!(
            tag,
            EventTag::Begin | EventTag::End | EventTag::NewFeature | EventTag::FeatureDeleted
        )
    }

    fn on_event(&self, event: &Event, handle: &SubscriptionHandle<'_>) -> Result<(), SubscriberError> {
        let mut state = self.state.lock();
        match &event.kind {
            // Each benchmarked step restates the size; the last step's wins.
            EventKind::Begin { size_before, .. } => state.initial = Some(*size_before),
            EventKind::NewFeature { .. } => state.diff += 1,
            EventKind::FeatureDeleted { .. } => state.diff -= 1,
            EventKind::End {
                size_after,
                intermediate: false,
                ..
            } => {
                // The diff counts features created from a blank output model.
                if i64::try_from(*size_after).ok() != Some(state.diff) {
                    tracing::warn!(
                        context = %event.context,
                        diff = state.diff,
                        final_size = size_after,
                        "feature count differs from reported final size; expected if the plugin emits no feature events"
                    );
                }
                state.final_size = Some(*size_after);
                handle.unsubscribe();
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TimeState {
    started: Option<DateTime<Utc>>,
    ended: Option<DateTime<Utc>>,
}

/// `transformationTime`: microseconds from the first `Begin` to the terminal `End`.
#[derive(Debug, Default)]
pub struct TransformationTimeCollector {
    state: Mutex<TimeState>,
}

impl TransformationTimeCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Collector for TransformationTimeCollector {
    fn id(&self) -> &str {
        "transformationTime"
    }

    fn result_columns(&self) -> Vec<String> {
        vec!["transformationTime".into()]
    }

    fn current_results(&self) -> Vec<Value> {
        let state = self.state.lock();
        let micros = match (state.started, state.ended) {
            (Some(start), Some(end)) => (end - start).abs().num_microseconds(),
            _ => None,
        };
        vec![micros.into()]
    }
}

impl Subscriber for TransformationTimeCollector {
    fn name(&self) -> &str {
        self.id()
    }

    fn interested_in(&self, tag: EventTag) -> bool {
        matches!(tag, EventTag::Begin | EventTag::End)
    }

    fn on_event(&self, event: &Event, handle: &SubscriptionHandle<'_>) -> Result<(), SubscriberError> {
        let mut state = self.state.lock();
        match event.kind {
            EventKind::Begin { .. } => {
                state.started.get_or_insert(event.timestamp);
            }
            EventKind::End {
                intermediate: false,
                ..
            } => {
                state.ended = Some(event.timestamp);
                handle.unsubscribe();
            }
            _ => {}
        }
        Ok(())
    }
}

/// `complexity`: one point per one-to-many mapping, `factor` points per added constraint.
#[derive(Debug, Default)]
pub struct ComplexityCollector {
    score: Mutex<i64>,
}

impl ComplexityCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Collector for ComplexityCollector {
    fn id(&self) -> &str {
        "complexity"
    }

    fn result_columns(&self) -> Vec<String> {
        vec!["complexity".into()]
    }

    fn current_results(&self) -> Vec<Value> {
        vec![(*self.score.lock()).into()]
    }
}

impl Subscriber for ComplexityCollector {
    fn name(&self) -> &str {
        self.id()
    }

    fn interested_in(&self, tag: EventTag) -> bool {
        matches!(
            tag,
            EventTag::OneToN | EventTag::AdditionalConstraint | EventTag::End
        )
    }

    fn on_event(&self, event: &Event, handle: &SubscriptionHandle<'_>) -> Result<(), SubscriberError> {
        match event.kind {
            EventKind::OneToN { .. } => *self.score.lock() += 1,
            EventKind::AdditionalConstraint { factor } => {
                *self.score.lock() += i64::from(factor)
            }
            EventKind::End {
                intermediate: false,
                ..
            } => {
                handle.unsubscribe();
            }
            _ => {}
        }
        Ok(())
    }
}
