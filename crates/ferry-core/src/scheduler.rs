//! Pipeline scheduler: runs one file through deserialize → transform chain → serialize.
//!
//! Per file the scheduler walks
//! `Idle → Deserializing → Transforming(i) → Serializing → Done(outcome)`.
//! Every phase runs on the [`BoundedRunner`] under the same deadline. Lifecycle
//! events for a file are published in the order its states are visited, and a
//! row is appended to the ledger once the file reaches `Done`.

use crate::capability::{CapabilityError, TransformContext};
use crate::channel::{EventChannel, Emitter};
use crate::collector::CollectorSelection;
use crate::event::{ContextId, Event};
use crate::exclusion::{ExclusionError, ExclusionList};
use crate::ledger::{self, LedgerError, ResultLedger};
use crate::plan::{Direction, PipelinePlan};
use crate::runner::{BoundedRunner, DEFAULT_PROBE_GRACE, RunError};
use crate::value::{Record, RecordExt, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::Level;

/// Default per-phase deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal classification of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileOutcome {
    Success,
    FailedDeserialization,
    FailedTransformation,
    FailedSerialization,
    TimeoutDeserialization,
    TimeoutTransformation,
    TimeoutSerialization,
    Skipped,
}

impl FileOutcome {
    /// Value written to the ledger's `result` column.
    pub fn as_str(self) -> &'static str {
        match self {
            FileOutcome::Success => "SUCCESS",
            FileOutcome::FailedDeserialization => "FAILED_DESERIALIZATION",
            FileOutcome::FailedTransformation => "FAILED_TRANSFORMATION",
            FileOutcome::FailedSerialization => "FAILED_SERIALIZATION",
            FileOutcome::TimeoutDeserialization => "TIMEOUT_DESERIALIZATION",
            FileOutcome::TimeoutTransformation => "TIMEOUT_TRANSFORMATION",
            FileOutcome::TimeoutSerialization => "TIMEOUT_SERIALIZATION",
            FileOutcome::Skipped => "SKIPPED",
        }
    }

    pub fn is_success(self) -> bool {
        self == FileOutcome::Success
    }

    /// Neither success nor skipped.
    pub fn is_failure(self) -> bool {
        !matches!(self, FileOutcome::Success | FileOutcome::Skipped)
    }

    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            FileOutcome::TimeoutDeserialization
                | FileOutcome::TimeoutTransformation
                | FileOutcome::TimeoutSerialization
        )
    }
}

impl fmt::Display for FileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the state machine a file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Idle,
    Deserializing,
    Transforming(usize),
    Serializing,
    Done(FileOutcome),
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileState::Idle => f.write_str("idle"),
            FileState::Deserializing => f.write_str("deserializing"),
            FileState::Transforming(i) => write!(f, "transforming({i})"),
            FileState::Serializing => f.write_str("serializing"),
            FileState::Done(outcome) => write!(f, "done({outcome})"),
        }
    }
}

/// Tunables applied uniformly to every file of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Deadline for each phase.
    #[serde(with = "secs")]
    pub timeout: Duration,
    /// How long a cancelled worker may take before it counts as stuck.
    #[serde(skip)]
    pub probe_grace: Duration,
    /// Write the final model. When false, a file succeeds after its last step.
    pub serialize: bool,
    /// Most verbose event transformers may publish.
    #[serde(skip, default = "default_verbosity")]
    pub verbosity: Level,
}

fn default_verbosity() -> Level {
    Level::TRACE
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            probe_grace: DEFAULT_PROBE_GRACE,
            serialize: true,
            verbosity: default_verbosity(),
        }
    }
}

impl SchedulerOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_probe_grace(mut self, grace: Duration) -> Self {
        self.probe_grace = grace;
        self
    }

    pub fn with_serialize(mut self, serialize: bool) -> Self {
        self.serialize = serialize;
        self
    }

    pub fn with_verbosity(mut self, verbosity: Level) -> Self {
        self.verbosity = verbosity;
        self
    }
}

/// Errors that are not per-file outcomes: the shared stores failed.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("path has no file name: {0}")]
    NoFileName(PathBuf),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Exclusion(#[from] ExclusionError),
}

/// What happened to one file.
#[derive(Debug, Clone)]
pub struct FileReport {
    pub path: PathBuf,
    pub file_name: String,
    pub outcome: FileOutcome,
    /// Absent for skipped files.
    pub context: Option<ContextId>,
    pub deserialization_time: Option<Duration>,
    /// Written output, if any.
    pub output: Option<PathBuf>,
    /// Collector results at the end of the session.
    pub results: Record,
    /// Message of the error that ended the file, if any.
    pub error: Option<String>,
    /// A worker ignored cancellation and is still running.
    pub non_cooperative: bool,
}

impl FileReport {
    fn new(path: &Path, file_name: String) -> Self {
        Self {
            path: path.to_path_buf(),
            file_name,
            outcome: FileOutcome::Skipped,
            context: None,
            deserialization_time: None,
            output: None,
            results: Record::new(),
            error: None,
            non_cooperative: false,
        }
    }
}

/// Drives files through a [`PipelinePlan`].
pub struct PipelineScheduler {
    plan: Arc<PipelinePlan>,
    channel: Arc<EventChannel>,
    collectors: CollectorSelection,
    ledger: Option<Arc<ResultLedger>>,
    exclusions: Option<Arc<ExclusionList>>,
    options: SchedulerOptions,
    runner: BoundedRunner,
    next_context: AtomicU64,
}

impl fmt::Debug for PipelineScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineScheduler")
            .field("plan", &self.plan)
            .field("collectors", &self.collectors)
            .field("ledger", &self.ledger.as_ref().map(|l| l.path().to_path_buf()))
            .field("options", &self.options)
            .finish()
    }
}

/// Outcome of one bounded phase, already classified.
struct PhaseFailure {
    outcome: FileOutcome,
    message: String,
    non_cooperative: bool,
}

impl PhaseFailure {
    fn classify(err: RunError<CapabilityError>, failed: FileOutcome, timed_out: FileOutcome) -> Self {
        Self {
            outcome: if err.is_timeout() { timed_out } else { failed },
            non_cooperative: err.is_non_cooperative(),
            message: err.to_string(),
        }
    }
}

impl PipelineScheduler {
    pub fn new(plan: Arc<PipelinePlan>, channel: Arc<EventChannel>) -> Self {
        let options = SchedulerOptions::default();
        Self {
            plan,
            channel,
            collectors: CollectorSelection::default(),
            ledger: None,
            exclusions: None,
            runner: runner_for(&options),
            options,
            next_context: AtomicU64::new(1),
        }
    }

    pub fn with_collectors(mut self, collectors: CollectorSelection) -> Self {
        self.collectors = collectors;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<ResultLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_exclusions(mut self, exclusions: Arc<ExclusionList>) -> Self {
        self.exclusions = Some(exclusions);
        self
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.runner = runner_for(&options);
        self.options = options;
        self
    }

    pub fn plan(&self) -> &PipelinePlan {
        &self.plan
    }

    pub fn channel(&self) -> &Arc<EventChannel> {
        &self.channel
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Where the output for `file_name` is written inside `output_dir`.
    pub fn output_path(&self, output_dir: &Path, file_name: &str) -> PathBuf {
        output_dir.join(format!("{file_name}{}", self.plan.output_extension()))
    }

    /// Run `path` through the plan, writing output into `output_dir`.
    ///
    /// Per-file failures are reported in the returned [`FileReport`]; an `Err`
    /// means the ledger or exclusion list could not be updated.
    pub fn process_file(&self, path: &Path, output_dir: &Path) -> Result<FileReport, SchedulerError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SchedulerError::NoFileName(path.to_path_buf()))?;
        let mut report = FileReport::new(path, file_name);

        if let Some(reason) = self.skip_reason(&report.file_name) {
            tracing::info!(file = %report.file_name, reason, "skipping");
            return Ok(report);
        }

        let context = ContextId(self.next_context.fetch_add(1, Ordering::Relaxed));
        report.context = Some(context);
        let mut session = self.collectors.instantiate();
        session.attach(&self.channel, context);

        let result = self.run_phases(&mut report, context, output_dir);
        session.detach(&self.channel);

        match result {
            Ok(()) => {
                report.outcome = FileOutcome::Success;
                report.results = session.results();
            }
            Err(failure) => {
                report.outcome = failure.outcome;
                report.error = Some(failure.message);
                report.non_cooperative = failure.non_cooperative;
            }
        }
        self.transition(&report.file_name, context, FileState::Done(report.outcome));

        if report.non_cooperative
            && let Some(exclusions) = &self.exclusions
        {
            exclusions.append(&report.file_name)?;
        }
        if let Some(ledger) = &self.ledger {
            ledger.append(&self.record_for(&report))?;
        }
        Ok(report)
    }

    fn skip_reason(&self, file_name: &str) -> Option<&'static str> {
        if self
            .exclusions
            .as_ref()
            .is_some_and(|e| e.contains(file_name))
        {
            Some("listed in exclusion list")
        } else if self.ledger.as_ref().is_some_and(|l| l.exists(file_name)) {
            Some("already recorded in ledger")
        } else {
            None
        }
    }

    fn run_phases(
        &self,
        report: &mut FileReport,
        context: ContextId,
        output_dir: &Path,
    ) -> Result<(), PhaseFailure> {
        let file_name = report.file_name.clone();

        // Deserializing
        self.transition(&file_name, context, FileState::Deserializing);
        let deserializer = self.plan.deserializer().clone();
        let source = report.path.clone();
        let started = Instant::now();
        let mut model = self
            .runner
            .run("deserializer", move |token| {
                deserializer.deserialize_from_file(&source, &token)
            })
            .map_err(|err| {
                PhaseFailure::classify(
                    err,
                    FileOutcome::FailedDeserialization,
                    FileOutcome::TimeoutDeserialization,
                )
            })?;
        let elapsed = started.elapsed();
        report.deserialization_time = Some(elapsed);
        tracing::debug!(
            file = %file_name,
            %context,
            elapsed_us = elapsed.as_micros() as u64,
            size = model.element_count(),
            "deserialized"
        );

        // Transforming
        let last = self.plan.len().saturating_sub(1);
        let mut side = self.plan.start();
        for step in self.plan.steps() {
            self.transition(&file_name, context, FileState::Transforming(step.index));
            let direction = side.direction();
            let intermediate = step.index != last;

            let emitter = step.benchmarked.then(|| {
                Emitter::new(self.channel.clone(), context).with_verbosity(self.options.verbosity)
            });
            if let Some(emitter) = &emitter {
                self.announce(emitter, Event::begin(context, &file_name, model.element_count()));
            }

            let template = TransformContext {
                model_name: file_name.clone(),
                strategy: self.plan.strategy(),
                intermediate,
                emitter: emitter.clone(),
                cancel: Default::default(),
            };
            let transformer = step.transformer.clone();
            let outcome = self.runner.run("transformer", move |token| {
                let ctx = TransformContext {
                    cancel: token,
                    ..template
                };
                match direction {
                    Direction::Forward => transformer.forward(model.as_ref(), &ctx),
                    Direction::Backward => transformer.backward(model.as_ref(), &ctx),
                }
            });

            model = match outcome {
                Ok(next) => next,
                Err(err) => {
                    if let Some(emitter) = &emitter {
                        self.announce(emitter, Event::end(context, &file_name, 0, false, false));
                    }
                    tracing::warn!(
                        file = %file_name,
                        %context,
                        step = step.index,
                        transformer = step.transformer.name(),
                        %direction,
                        error = %err,
                        "transformation step failed"
                    );
                    return Err(PhaseFailure::classify(
                        err,
                        FileOutcome::FailedTransformation,
                        FileOutcome::TimeoutTransformation,
                    ));
                }
            };
            if let Some(emitter) = &emitter {
                self.announce(
                    emitter,
                    Event::end(context, &file_name, model.element_count(), true, intermediate),
                );
            }
            side = side.flip();
        }
        tracing::debug!(file = %file_name, %context, final_side = ?side, "transformation chain complete");

        // Serializing
        if !self.options.serialize {
            return Ok(());
        }
        self.transition(&file_name, context, FileState::Serializing);
        let output = self.output_path(output_dir, &file_name);
        let serializer = self.plan.serializer().clone();
        let destination = output.clone();
        self.runner
            .run("serializer", move |token| {
                serializer.serialize_to_file(model.as_ref(), &destination, &token)
            })
            .map_err(|err| {
                PhaseFailure::classify(
                    err,
                    FileOutcome::FailedSerialization,
                    FileOutcome::TimeoutSerialization,
                )
            })?;
        report.output = Some(output);
        Ok(())
    }

    /// Publish a scheduler-owned lifecycle event. Subscriber failures are logged.
    fn announce(&self, emitter: &Emitter, event: Event) {
        if let Err(err) = emitter.publish(event) {
            tracing::warn!(context = %emitter.context(), %err, "lifecycle event delivery failed");
        }
    }

    fn transition(&self, file_name: &str, context: ContextId, state: FileState) {
        match state {
            FileState::Done(outcome) if outcome.is_failure() => {
                tracing::warn!(file = file_name, %context, %state, "state change")
            }
            _ => tracing::debug!(file = file_name, %context, %state, "state change"),
        }
    }

    fn record_for(&self, report: &FileReport) -> Record {
        let mut record = Record::new()
            .with(ledger::FILE_NAME, report.file_name.as_str())
            .with(ledger::TARGET_TYPE, self.plan.target())
            .with(ledger::RESULT, report.outcome.as_str())
            .with(
                ledger::DESERIALIZATION_TIME,
                report
                    .deserialization_time
                    .map(|d| Value::from(d.as_micros() as u64)),
            );
        // Failed files get a dud row: only the fixed columns.
        if report.outcome.is_success() {
            record.extend(report.results.clone());
        }
        record
    }
}

fn runner_for(options: &SchedulerOptions) -> BoundedRunner {
    BoundedRunner::new(options.timeout).with_probe_grace(options.probe_grace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Strategy;
    use crate::channel::{Subscriber, SubscriberError, SubscriptionHandle};
    use crate::collector::CollectorRegistry;
    use crate::event::{EventKind, EventTag};
    use crate::plan::Mode;
    use crate::testkit;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Records every event it sees.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        fn tags(&self) -> Vec<EventTag> {
            self.events.lock().iter().map(Event::tag).collect()
        }
    }

    impl Subscriber for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_event(&self, event: &Event, _: &SubscriptionHandle<'_>) -> Result<(), SubscriberError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        out: PathBuf,
        channel: Arc<EventChannel>,
        recorder: Arc<Recorder>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let out = dir.path().join("out");
            std::fs::create_dir(&out).unwrap();
            let channel = Arc::new(EventChannel::new());
            let recorder = Arc::new(Recorder::default());
            channel.subscribe(recorder.clone());
            Self {
                dir,
                out,
                channel,
                recorder,
            }
        }

        fn file(&self, name: &str, features: &[&str]) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, features.join("\n")).unwrap();
            path
        }

        fn scheduler(&self, source: &str, target: &str, mode: Mode) -> PipelineScheduler {
            let (registry, _) = testkit::registry();
            let plan = PipelinePlan::build(&registry, source, target, mode, Strategy::OneWay).unwrap();
            PipelineScheduler::new(Arc::new(plan), self.channel.clone()).with_options(
                SchedulerOptions::default()
                    .with_timeout(Duration::from_millis(300))
                    .with_probe_grace(Duration::from_millis(50)),
            )
        }
    }

    #[test]
    fn test_success_writes_output_and_ledger() {
        let fx = Fixture::new();
        let ledger = Arc::new(
            ResultLedger::open(
                fx.dir.path().join("results.csv"),
                &CollectorRegistry::with_builtins()
                    .select(&["modelSize"])
                    .unwrap()
                    .columns(),
            )
            .unwrap(),
        );
        let collectors = CollectorRegistry::with_builtins()
            .select(&["modelSize"])
            .unwrap();
        let scheduler = fx
            .scheduler("tree", "outline", Mode::OneWay)
            .with_collectors(collectors)
            .with_ledger(ledger.clone());

        let path = fx.file("a.tree", &["root", "b", "c", "d", "e"]);
        let report = scheduler.process_file(&path, &fx.out).unwrap();

        assert_eq!(report.outcome, FileOutcome::Success);
        assert_eq!(report.output, Some(fx.out.join("a.tree.outline")));
        assert!(fx.out.join("a.tree.outline").exists());
        assert_eq!(report.results["initialSize"], Value::UInt(5));
        assert_eq!(report.results["finalSize"], Value::UInt(5));
        assert!(ledger.exists("a.tree"));

        let text = std::fs::read_to_string(ledger.path()).unwrap();
        let row = text.lines().nth(1).unwrap();
        assert!(row.starts_with("a.tree,outline,SUCCESS,"));
        assert!(row.ends_with(",5,5,5"));
    }

    #[test]
    fn test_events_follow_state_order() {
        let fx = Fixture::new();
        let scheduler = fx.scheduler("outline", "grid", Mode::OneWay);
        let path = fx.file("m.outline", &["a", "b"]);

        scheduler.process_file(&path, &fx.out).unwrap();

        let events = fx.recorder.events.lock().clone();
        let lifecycle: Vec<(EventTag, bool)> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Begin { .. } => Some((EventTag::Begin, false)),
                EventKind::End { intermediate, .. } => Some((EventTag::End, *intermediate)),
                _ => None,
            })
            .collect();
        assert_eq!(
            lifecycle,
            vec![
                (EventTag::Begin, false),
                (EventTag::End, true),
                (EventTag::Begin, false),
                (EventTag::End, false),
            ]
        );
        // Two steps, each copying two features.
        assert_eq!(
            events
                .iter()
                .filter(|e| e.tag() == EventTag::NewFeature)
                .count(),
            4
        );
        assert!(events.iter().all(|e| e.context == events[0].context));
    }

    #[test]
    fn test_reverse_only_emits_for_second_half() {
        let fx = Fixture::new();
        let scheduler = fx.scheduler("tree", "outline", Mode::ReverseOnly);
        let path = fx.file("r.tree", &["a", "b", "c"]);

        let report = scheduler.process_file(&path, &fx.out).unwrap();

        assert_eq!(report.outcome, FileOutcome::Success);
        assert_eq!(report.output, Some(fx.out.join("r.tree.tree")));
        let tags = fx.recorder.tags();
        assert_eq!(tags.first(), Some(&EventTag::Begin));
        assert_eq!(tags.last(), Some(&EventTag::End));
        assert_eq!(tags.iter().filter(|t| **t == EventTag::Begin).count(), 1);
        assert_eq!(tags.iter().filter(|t| **t == EventTag::NewFeature).count(), 3);
    }

    #[test]
    fn test_failed_deserialization_records_dud() {
        let fx = Fixture::new();
        let ledger = Arc::new(ResultLedger::open(fx.dir.path().join("results.csv"), &[]).unwrap());
        let scheduler = fx
            .scheduler("tree", "outline", Mode::OneWay)
            .with_ledger(ledger.clone());
        let path = fx.file("bad.tree", &["!malformed"]);

        let report = scheduler.process_file(&path, &fx.out).unwrap();

        assert_eq!(report.outcome, FileOutcome::FailedDeserialization);
        assert!(report.deserialization_time.is_none());
        assert!(fx.recorder.tags().is_empty());
        let text = std::fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(text.lines().nth(1), Some("bad.tree,outline,FAILED_DESERIALIZATION,"));
    }

    #[test]
    fn test_failed_transformation_emits_failed_end() {
        let fx = Fixture::new();
        let scheduler = fx.scheduler("tree", "outline", Mode::OneWay);
        let path = fx.file("f.tree", &["a", "__fail"]);

        let report = scheduler.process_file(&path, &fx.out).unwrap();

        assert_eq!(report.outcome, FileOutcome::FailedTransformation);
        assert!(report.output.is_none());
        let events = fx.recorder.events.lock().clone();
        match &events.last().unwrap().kind {
            EventKind::End {
                success,
                intermediate,
                size_after,
                ..
            } => {
                assert!(!success);
                assert!(!intermediate);
                assert_eq!(*size_after, 0);
            }
            other => panic!("unexpected last event: {other:?}"),
        }
    }

    #[test]
    fn test_stuck_transformer_is_excluded() {
        let fx = Fixture::new();
        let ledger = Arc::new(
            ResultLedger::open(
                fx.dir.path().join("results.csv"),
                &CollectorRegistry::with_builtins()
                    .select(&["modelSize"])
                    .unwrap()
                    .columns(),
            )
            .unwrap(),
        );
        let exclusions =
            Arc::new(ExclusionList::load(fx.dir.path().join("blacklist.txt")).unwrap());
        let scheduler = fx
            .scheduler("tree", "outline", Mode::OneWay)
            .with_collectors(
                CollectorRegistry::with_builtins()
                    .select(&["modelSize"])
                    .unwrap(),
            )
            .with_ledger(ledger.clone())
            .with_exclusions(exclusions.clone());
        let path = fx.file("stuck.tree", &["a", "b", "c", "d", "__hang"]);

        let started = Instant::now();
        let report = scheduler.process_file(&path, &fx.out).unwrap();

        assert!(started.elapsed() < testkit::HANG_FOR);
        assert_eq!(report.outcome, FileOutcome::TimeoutTransformation);
        assert!(report.non_cooperative);
        assert!(exclusions.contains("stuck.tree"));
        let text = std::fs::read_to_string(ledger.path()).unwrap();
        let row = text.lines().nth(1).unwrap();
        assert!(row.starts_with("stuck.tree,outline,TIMEOUT_TRANSFORMATION,"));
        assert!(row.ends_with(",,,"));
    }

    #[test]
    fn test_cooperative_timeout_is_not_excluded() {
        let fx = Fixture::new();
        let exclusions =
            Arc::new(ExclusionList::load(fx.dir.path().join("blacklist.txt")).unwrap());
        let scheduler = fx
            .scheduler("tree", "outline", Mode::OneWay)
            .with_exclusions(exclusions.clone());
        let path = fx.file("slow.tree", &["a", "__slow"]);

        let report = scheduler.process_file(&path, &fx.out).unwrap();

        assert_eq!(report.outcome, FileOutcome::TimeoutTransformation);
        assert!(!report.non_cooperative);
        assert!(exclusions.is_empty());
    }

    /// Scheduler with the `modelSize` collector, a ledger and an exclusion list.
    fn watched(fx: &Fixture) -> (PipelineScheduler, Arc<ResultLedger>, Arc<ExclusionList>) {
        let collectors = CollectorRegistry::with_builtins()
            .select(&["modelSize"])
            .unwrap();
        let ledger = Arc::new(
            ResultLedger::open(fx.dir.path().join("results.csv"), &collectors.columns()).unwrap(),
        );
        let exclusions =
            Arc::new(ExclusionList::load(fx.dir.path().join("blacklist.txt")).unwrap());
        let scheduler = fx
            .scheduler("tree", "outline", Mode::OneWay)
            .with_collectors(collectors)
            .with_ledger(ledger.clone())
            .with_exclusions(exclusions.clone());
        (scheduler, ledger, exclusions)
    }

    #[test]
    fn test_stuck_deserializer_is_excluded() {
        let fx = Fixture::new();
        let (scheduler, ledger, exclusions) = watched(&fx);
        let path = fx.file("stuck_read.tree", &["a", "b", "__hang_read"]);

        let started = Instant::now();
        let report = scheduler.process_file(&path, &fx.out).unwrap();

        assert!(started.elapsed() < testkit::HANG_FOR);
        assert_eq!(report.outcome, FileOutcome::TimeoutDeserialization);
        assert!(report.non_cooperative);
        assert!(report.deserialization_time.is_none());
        assert!(fx.recorder.tags().is_empty());
        assert_eq!(exclusions.len(), 1);
        assert!(exclusions.contains("stuck_read.tree"));

        let text = std::fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(
            text.lines().nth(1),
            Some("stuck_read.tree,outline,TIMEOUT_DESERIALIZATION,,,,")
        );
    }

    #[test]
    fn test_stuck_serializer_is_excluded() {
        let fx = Fixture::new();
        let (scheduler, ledger, exclusions) = watched(&fx);
        let path = fx.file("stuck_write.tree", &["a", "b", "__hang_write"]);

        let started = Instant::now();
        let report = scheduler.process_file(&path, &fx.out).unwrap();

        assert!(started.elapsed() < testkit::HANG_FOR);
        assert_eq!(report.outcome, FileOutcome::TimeoutSerialization);
        assert!(report.non_cooperative);
        assert!(report.output.is_none());
        assert!(report.deserialization_time.is_some());
        // The transformation itself completed.
        assert_eq!(fx.recorder.tags().last(), Some(&EventTag::End));
        assert!(exclusions.contains("stuck_write.tree"));

        // Dud row: a deserialization time, but no collector columns.
        let text = std::fs::read_to_string(ledger.path()).unwrap();
        let row = text.lines().nth(1).unwrap();
        assert!(row.starts_with("stuck_write.tree,outline,TIMEOUT_SERIALIZATION,"));
        assert!(row.ends_with(",,,"));
        assert!(!row.ends_with(",,,,"));
    }

    #[test]
    fn test_serialization_failure() {
        let fx = Fixture::new();
        let scheduler = fx.scheduler("tree", "outline", Mode::OneWay);
        let path = fx.file("w.tree", &["a", "__unwritable"]);

        let report = scheduler.process_file(&path, &fx.out).unwrap();
        assert_eq!(report.outcome, FileOutcome::FailedSerialization);
    }

    #[test]
    fn test_skip_serialization() {
        let fx = Fixture::new();
        let scheduler = fx.scheduler("tree", "outline", Mode::OneWay).with_options(
            SchedulerOptions::default().with_serialize(false),
        );
        let path = fx.file("n.tree", &["a", "__unwritable"]);

        let report = scheduler.process_file(&path, &fx.out).unwrap();
        assert_eq!(report.outcome, FileOutcome::Success);
        assert!(report.output.is_none());
        assert_eq!(std::fs::read_dir(&fx.out).unwrap().count(), 0);
    }

    #[test]
    fn test_recorded_file_is_skipped_without_events() {
        let fx = Fixture::new();
        let ledger = Arc::new(ResultLedger::open(fx.dir.path().join("results.csv"), &[]).unwrap());
        let (registry, calls) = testkit::registry();
        let plan = PipelinePlan::build(&registry, "tree", "outline", Mode::OneWay, Strategy::OneWay)
            .unwrap();
        let scheduler =
            PipelineScheduler::new(Arc::new(plan), fx.channel.clone()).with_ledger(ledger.clone());
        let path = fx.file("a.tree", &["a"]);

        assert_eq!(
            scheduler.process_file(&path, &fx.out).unwrap().outcome,
            FileOutcome::Success
        );
        let seen = fx.recorder.tags().len();
        let again = scheduler.process_file(&path, &fx.out).unwrap();

        assert_eq!(again.outcome, FileOutcome::Skipped);
        assert!(again.context.is_none());
        assert_eq!(fx.recorder.tags().len(), seen);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_context_ids_are_distinct() {
        let fx = Fixture::new();
        let scheduler = fx.scheduler("tree", "outline", Mode::OneWay);
        let a = scheduler
            .process_file(&fx.file("a.tree", &["x"]), &fx.out)
            .unwrap();
        let b = scheduler
            .process_file(&fx.file("b.tree", &["y"]), &fx.out)
            .unwrap();
        assert_ne!(a.context, b.context);
    }

    #[test]
    fn test_outcome_strings() {
        assert_eq!(FileOutcome::TimeoutSerialization.as_str(), "TIMEOUT_SERIALIZATION");
        assert_eq!(
            FileOutcome::FailedDeserialization.to_string(),
            "FAILED_DESERIALIZATION"
        );
        assert!(FileOutcome::TimeoutDeserialization.is_timeout());
        assert!(!FileOutcome::Skipped.is_failure());
    }
}
