//! Lifecycle and benchmarking events.
//!
//! Events are immutable once published. Every event names the session
//! (`ContextId`) it belongs to, so collectors attached to one file never
//! confuse it with another file processed concurrently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::Level;

/// Identifies one processing session (one file run through the pipeline).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// A transformation step is about to run on a model of `size_before` elements.
    Begin {
        model_name: String,
        size_before: usize,
    },
    /// A transformation step finished. `size_after` is zero when it failed.
    End {
        model_name: String,
        size_after: usize,
        success: bool,
        intermediate: bool,
    },
    /// Stop delivering events of this context to subscribers until `Unmute`.
    Mute,
    /// Resume delivery for this context.
    Unmute,
    /// A transformer created an element in the output model.
    NewFeature { feature: String },
    /// A transformer dropped an element of the input model.
    FeatureDeleted { feature: String },
    /// One source element mapped onto several target elements.
    OneToN { detail: String },
    /// Constraints were added without a source counterpart.
    AdditionalConstraint { factor: u32 },
}

/// Discriminant of [`EventKind`], used to declare subscriber interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    Begin,
    End,
    Mute,
    Unmute,
    NewFeature,
    FeatureDeleted,
    OneToN,
    AdditionalConstraint,
}

impl EventKind {
    pub fn tag(&self) -> EventTag {
        match self {
            EventKind::Begin { .. } => EventTag::Begin,
            EventKind::End { .. } => EventTag::End,
            EventKind::Mute => EventTag::Mute,
            EventKind::Unmute => EventTag::Unmute,
            EventKind::NewFeature { .. } => EventTag::NewFeature,
            EventKind::FeatureDeleted { .. } => EventTag::FeatureDeleted,
            EventKind::OneToN { .. } => EventTag::OneToN,
            EventKind::AdditionalConstraint { .. } => EventTag::AdditionalConstraint,
        }
    }

    /// Severity an event of this kind is published with unless overridden.
    ///
    /// Control events use `ERROR`, the least verbose level, so that every
    /// subscriber threshold lets them through.
    pub fn default_severity(&self) -> Level {
        match self {
            EventKind::Mute | EventKind::Unmute => Level::ERROR,
            EventKind::Begin { .. } | EventKind::End { .. } => Level::INFO,
            _ => Level::DEBUG,
        }
    }
}

/// A published event.
#[derive(Debug, Clone)]
pub struct Event {
    pub context: ContextId,
    pub timestamp: DateTime<Utc>,
    pub severity: Level,
    pub kind: EventKind,
}

impl Event {
    /// Create an event stamped now, with the kind's default severity.
    pub fn new(context: ContextId, kind: EventKind) -> Self {
        Self {
            context,
            timestamp: Utc::now(),
            severity: kind.default_severity(),
            kind,
        }
    }

    pub fn begin(context: ContextId, model_name: impl Into<String>, size_before: usize) -> Self {
        Self::new(
            context,
            EventKind::Begin {
                model_name: model_name.into(),
                size_before,
            },
        )
    }

    pub fn end(
        context: ContextId,
        model_name: impl Into<String>,
        size_after: usize,
        success: bool,
        intermediate: bool,
    ) -> Self {
        Self::new(
            context,
            EventKind::End {
                model_name: model_name.into(),
                size_after,
                success,
                intermediate,
            },
        )
    }

    pub fn mute(context: ContextId) -> Self {
        Self::new(context, EventKind::Mute)
    }

    pub fn unmute(context: ContextId) -> Self {
        Self::new(context, EventKind::Unmute)
    }

    pub fn tag(&self) -> EventTag {
        self.kind.tag()
    }

    /// True for the `End` event that closes a session.
    pub fn is_terminal_end(&self) -> bool {
        matches!(
            self.kind,
            EventKind::End {
                intermediate: false,
                ..
            }
        )
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "emitted at {}, session {}: {:?}",
            self.timestamp.to_rfc3339(),
            self.context,
            self.kind
        )
    }
}
