//! Event channel: in-process publish/subscribe for lifecycle events.
//!
//! Delivery is synchronous and in registration order. The subscriber list is
//! snapshotted before delivery, so subscribers may subscribe or unsubscribe
//! (themselves included) from inside `on_event` without deadlocking.
//!
//! Muting is tracked per subscription: after a `Mute` for context `c` a
//! subscription receives nothing else from `c` until the matching `Unmute`,
//! which it still receives.

use crate::event::{ContextId, Event, EventKind, EventTag};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::Level;

/// Handle identifying one subscription on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Error raised by a subscriber while handling an event.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SubscriberError(pub String);

impl SubscriberError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A listener on the channel.
pub trait Subscriber: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Whether events of this kind should be delivered at all.
    fn interested_in(&self, tag: EventTag) -> bool {
        let _ = tag;
        true
    }

    /// Most verbose severity this subscriber accepts.
    fn threshold(&self) -> Level {
        Level::TRACE
    }

    /// Handle one event. `handle` lets the subscriber unsubscribe itself.
    fn on_event(
        &self,
        event: &Event,
        handle: &SubscriptionHandle<'_>,
    ) -> Result<(), SubscriberError>;
}

/// Passed to [`Subscriber::on_event`]; refers back to the delivering subscription.
pub struct SubscriptionHandle<'a> {
    channel: &'a EventChannel,
    id: SubscriberId,
}

impl SubscriptionHandle<'_> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn channel(&self) -> &EventChannel {
        self.channel
    }

    /// Remove the delivering subscription. Takes effect immediately.
    pub fn unsubscribe(&self) -> bool {
        self.channel.unsubscribe(self.id)
    }
}

/// One subscriber that failed during a publish.
#[derive(Debug, Clone)]
pub struct SubscriberFailure {
    pub id: SubscriberId,
    pub subscriber: String,
    pub error: SubscriberError,
}

/// Every failure from one publish, reported after all subscribers were tried.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} subscriber(s) failed: {}", failures.len(), summarize(failures))]
pub struct PublishError {
    pub failures: Vec<SubscriberFailure>,
}

fn summarize(failures: &[SubscriberFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({}): {}", f.subscriber, f.id, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

struct Subscription {
    id: SubscriberId,
    subscriber: Arc<dyn Subscriber>,
    scope: Option<ContextId>,
    active: AtomicBool,
    muted: Mutex<HashSet<ContextId>>,
}

impl Subscription {
    /// Update mute bookkeeping and decide whether `event` reaches the subscriber.
    fn admits(&self, event: &Event) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        if self.scope.is_some_and(|scope| scope != event.context) {
            return false;
        }

        match event.kind {
            EventKind::Mute => {
                self.muted.lock().insert(event.context);
            }
            EventKind::Unmute => {
                self.muted.lock().remove(&event.context);
            }
            _ => {
                if self.muted.lock().contains(&event.context) {
                    return false;
                }
            }
        }

        event.severity <= self.subscriber.threshold()
            && self.subscriber.interested_in(event.tag())
    }
}

/// Publish/subscribe bus shared by the scheduler, transformers and collectors.
pub struct EventChannel {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl EventChannel {
    /// Create a channel with no subscribers.
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a subscriber for events of every context.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        self.insert(subscriber, None)
    }

    /// Register a subscriber that only sees events of `context`.
    pub fn subscribe_scoped(
        &self,
        subscriber: Arc<dyn Subscriber>,
        context: ContextId,
    ) -> SubscriberId {
        self.insert(subscriber, Some(context))
    }

    fn insert(&self, subscriber: Arc<dyn Subscriber>, scope: Option<ContextId>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::trace!(subscriber = subscriber.name(), %id, ?scope, "subscribed");
        self.subscriptions.write().push(Arc::new(Subscription {
            id,
            subscriber,
            scope,
            active: AtomicBool::new(true),
            muted: Mutex::new(HashSet::new()),
        }));
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        match subscriptions.iter().position(|s| s.id == id) {
            Some(pos) => {
                let removed = subscriptions.remove(pos);
                removed.active.store(false, Ordering::Release);
                tracing::trace!(subscriber = removed.subscriber.name(), %id, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Whether `id` is still registered.
    pub fn is_subscribed(&self, id: SubscriberId) -> bool {
        self.subscriptions.read().iter().any(|s| s.id == id)
    }

    /// Number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }

    /// Deliver `event` to every admitted subscriber, in registration order.
    ///
    /// A failing subscriber does not stop delivery to the others; all
    /// failures are returned together. On success returns how many
    /// subscribers received the event.
    pub fn publish(&self, event: &Event) -> Result<usize, PublishError> {
        let snapshot: Vec<Arc<Subscription>> = self.subscriptions.read().clone();

        let mut delivered = 0;
        let mut failures = Vec::new();

        for subscription in snapshot {
            if !subscription.admits(event) {
                continue;
            }
            let handle = SubscriptionHandle {
                channel: self,
                id: subscription.id,
            };
            delivered += 1;
            if let Err(error) = subscription.subscriber.on_event(event, &handle) {
                tracing::warn!(
                    subscriber = subscription.subscriber.name(),
                    context = %event.context,
                    %error,
                    "subscriber failed while handling event"
                );
                failures.push(SubscriberFailure {
                    id: subscription.id,
                    subscriber: subscription.subscriber.name().to_string(),
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(delivered)
        } else {
            Err(PublishError { failures })
        }
    }
}

/// Publishing handle for one session, handed to transformers.
///
/// Events more verbose than the emitter's own verbosity are dropped before
/// they reach the channel.
#[derive(Clone)]
pub struct Emitter {
    channel: Arc<EventChannel>,
    context: ContextId,
    verbosity: Level,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("context", &self.context)
            .field("verbosity", &self.verbosity)
            .finish()
    }
}

impl Emitter {
    pub fn new(channel: Arc<EventChannel>, context: ContextId) -> Self {
        Self {
            channel,
            context,
            verbosity: Level::TRACE,
        }
    }

    pub fn with_verbosity(mut self, verbosity: Level) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn verbosity(&self) -> Level {
        self.verbosity
    }

    /// Publish an event of `kind` for this session.
    pub fn emit(&self, kind: EventKind) -> Result<(), PublishError> {
        self.publish(Event::new(self.context, kind))
    }

    /// Publish a prepared event, subject to this emitter's verbosity.
    pub fn publish(&self, event: Event) -> Result<(), PublishError> {
        if event.severity > self.verbosity {
            return Ok(());
        }
        self.channel.publish(&event).map(|_| ())
    }

    pub fn mute(&self) -> Result<(), PublishError> {
        self.emit(EventKind::Mute)
    }

    pub fn unmute(&self) -> Result<(), PublishError> {
        self.emit(EventKind::Unmute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the tags it sees, optionally failing or unsubscribing.
    struct Probe {
        name: String,
        seen: Mutex<Vec<EventTag>>,
        log: Option<Arc<Mutex<Vec<String>>>>,
        fail: bool,
        leave_on_end: bool,
        threshold: Level,
    }

    impl Probe {
        fn new(name: &str) -> Self {
            Self {
                name: name.into(),
                seen: Mutex::new(Vec::new()),
                log: None,
                fail: false,
                leave_on_end: false,
                threshold: Level::TRACE,
            }
        }

        fn seen(&self) -> Vec<EventTag> {
            self.seen.lock().clone()
        }
    }

    impl Subscriber for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        fn threshold(&self) -> Level {
            self.threshold
        }

        fn on_event(
            &self,
            event: &Event,
            handle: &SubscriptionHandle<'_>,
        ) -> Result<(), SubscriberError> {
            self.seen.lock().push(event.tag());
            if let Some(log) = &self.log {
                log.lock().push(self.name.clone());
            }
            if self.leave_on_end && event.is_terminal_end() {
                handle.unsubscribe();
            }
            if self.fail {
                return Err(SubscriberError::new("boom"));
            }
            Ok(())
        }
    }

    fn feature(ctx: u64) -> Event {
        Event::new(
            ContextId(ctx),
            EventKind::NewFeature {
                feature: "f".into(),
            },
        )
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let channel = EventChannel::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["c", "a", "b"] {
            let mut probe = Probe::new(name);
            probe.log = Some(log.clone());
            channel.subscribe(Arc::new(probe));
        }

        let delivered = channel.publish(&Event::begin(ContextId(1), "m", 1)).unwrap();

        assert_eq!(delivered, 3);
        assert_eq!(*log.lock(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_failures_are_aggregated() {
        let channel = EventChannel::new();
        let mut failing = Probe::new("failing");
        failing.fail = true;
        let failing = Arc::new(failing);
        let healthy = Arc::new(Probe::new("healthy"));
        let mut also_failing = Probe::new("also-failing");
        also_failing.fail = true;

        channel.subscribe(failing.clone());
        channel.subscribe(healthy.clone());
        channel.subscribe(Arc::new(also_failing));

        let err = channel
            .publish(&Event::begin(ContextId(1), "m", 1))
            .unwrap_err();

        assert_eq!(err.failures.len(), 2);
        assert_eq!(err.failures[0].subscriber, "failing");
        assert_eq!(err.failures[1].subscriber, "also-failing");
        // The subscriber after the failing one still got the event.
        assert_eq!(healthy.seen(), vec![EventTag::Begin]);
    }

    #[test]
    fn test_unsubscribe_from_handler() {
        let channel = EventChannel::new();
        let mut leaving = Probe::new("leaving");
        leaving.leave_on_end = true;
        let leaving = Arc::new(leaving);
        let id = channel.subscribe(leaving.clone());
        channel.subscribe(Arc::new(Probe::new("staying")));

        channel
            .publish(&Event::end(ContextId(1), "m", 1, true, false))
            .unwrap();
        assert!(!channel.is_subscribed(id));
        assert_eq!(channel.len(), 1);

        channel.publish(&Event::begin(ContextId(1), "m", 1)).unwrap();
        assert_eq!(leaving.seen(), vec![EventTag::End]);
    }

    #[test]
    fn test_mute_until_unmute_same_context() {
        let channel = EventChannel::new();
        let probe = Arc::new(Probe::new("probe"));
        channel.subscribe(probe.clone());

        channel.publish(&Event::mute(ContextId(7))).unwrap();
        channel.publish(&feature(7)).unwrap();
        // Other contexts are not affected.
        channel.publish(&feature(8)).unwrap();
        // An unmute for another context does not lift the mute.
        channel.publish(&Event::unmute(ContextId(8))).unwrap();
        channel.publish(&feature(7)).unwrap();
        channel.publish(&Event::unmute(ContextId(7))).unwrap();
        channel.publish(&feature(7)).unwrap();

        assert_eq!(
            probe.seen(),
            vec![
                EventTag::Mute,
                EventTag::NewFeature,
                EventTag::Unmute,
                EventTag::Unmute,
                EventTag::NewFeature,
            ]
        );
    }

    #[test]
    fn test_threshold_filters_verbose_events() {
        let channel = EventChannel::new();
        let mut quiet = Probe::new("quiet");
        quiet.threshold = Level::INFO;
        let quiet = Arc::new(quiet);
        channel.subscribe(quiet.clone());

        channel.publish(&feature(1)).unwrap();
        channel.publish(&Event::begin(ContextId(1), "m", 1)).unwrap();
        channel.publish(&Event::mute(ContextId(1))).unwrap();

        assert_eq!(quiet.seen(), vec![EventTag::Begin, EventTag::Mute]);
    }

    #[test]
    fn test_scoped_subscription() {
        let channel = EventChannel::new();
        let probe = Arc::new(Probe::new("scoped"));
        channel.subscribe_scoped(probe.clone(), ContextId(3));

        channel.publish(&Event::begin(ContextId(2), "other", 1)).unwrap();
        channel.publish(&Event::begin(ContextId(3), "mine", 1)).unwrap();

        assert_eq!(probe.seen(), vec![EventTag::Begin]);
    }

    #[test]
    fn test_emitter_respects_verbosity() {
        let channel = Arc::new(EventChannel::new());
        let probe = Arc::new(Probe::new("probe"));
        channel.subscribe(probe.clone());

        let emitter = Emitter::new(channel.clone(), ContextId(4)).with_verbosity(Level::INFO);
        emitter
            .emit(EventKind::NewFeature {
                feature: "dropped".into(),
            })
            .unwrap();
        emitter.publish(Event::begin(ContextId(4), "m", 2)).unwrap();
        emitter.mute().unwrap();

        assert_eq!(probe.seen(), vec![EventTag::Begin, EventTag::Mute]);
    }

    #[test]
    fn test_concurrent_publishers() {
        let channel = Arc::new(EventChannel::new());
        let probe = Arc::new(Probe::new("probe"));
        channel.subscribe(probe.clone());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let channel = channel.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        channel.publish(&feature(i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(probe.seen().len(), 100);
    }
}
