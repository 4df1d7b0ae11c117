//! Ferry: batch transformation of model files through a pivot representation.
//!
//! A [`PipelinePlan`] chains plugin transformers from a source type to a target
//! type. The [`PipelineScheduler`] runs every file through the plan, each phase
//! bounded by a deadline, publishes lifecycle events on an [`EventChannel`] for
//! benchmark collectors, and records the outcome in a resumable
//! [`ResultLedger`]. The [`BatchDriver`] applies this to a whole directory.

mod batch;
mod capability;
mod channel;
mod collector;
mod event;
mod exclusion;
mod ledger;
mod plan;
mod registry;
mod runner;
mod scheduler;
mod value;

#[cfg(test)]
mod testkit;

pub use batch::{
    BatchDriver, BatchError, BatchOptions, BatchSummary, STUCK_WORKER_EXIT_CODE,
    StuckWorkerPolicy, collect_files,
};
pub use capability::{
    BoxedModel, CapabilityError, Deserializer, Model, Serializer, Strategy, TransformContext,
    Transformer, downcast_model,
};
pub use channel::{
    Emitter, EventChannel, PublishError, Subscriber, SubscriberError, SubscriberFailure,
    SubscriberId, SubscriptionHandle,
};
pub use collector::{
    Collector, CollectorError, CollectorFactory, CollectorHandle, CollectorRegistry,
    CollectorSelection, CollectorSet, ComplexityCollector, ModelSizeCollector,
    TransformationTimeCollector,
};
pub use event::{ContextId, Event, EventKind, EventTag};
pub use exclusion::{ExclusionError, ExclusionList};
pub use ledger::{FIXED_COLUMNS, LedgerError, ResultLedger};
pub use plan::{Direction, Mode, PipelinePlan, PlanError, PlanStep, Side};
pub use registry::{Plugin, PluginRegistry, RegistryError};
pub use runner::{BoundedRunner, CancellationToken, Cancelled, DEFAULT_PROBE_GRACE, RunError};
pub use scheduler::{
    DEFAULT_TIMEOUT, FileOutcome, FileReport, FileState, PipelineScheduler, SchedulerError,
    SchedulerOptions,
};
pub use value::{Record, RecordExt, Value};
