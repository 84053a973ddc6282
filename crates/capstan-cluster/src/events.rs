//! Component-tagged event recording.
//!
//! Events are the operator-facing trail of scaling activity. Every event is
//! logged through `tracing`; a recorder can additionally forward events to a
//! channel, which the tests use to assert on recorded activity.

use std::fmt;

use tokio::sync::mpsc;
use tracing::{info, warn};

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Routine activity.
    Normal,
    /// Something an operator should look at.
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Warning => write!(f, "Warning"),
        }
    }
}

/// A recorded event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Component that recorded the event.
    pub component: String,
    /// Name of the object the event is about.
    pub object: String,
    /// Severity.
    pub event_type: EventType,
    /// Machine-readable reason constant.
    pub reason: &'static str,
    /// Human-readable message.
    pub message: String,
}

/// Records events on behalf of one component.
#[derive(Clone)]
pub struct EventRecorder {
    component: String,
    sink: Option<mpsc::UnboundedSender<Event>>,
}

impl EventRecorder {
    /// Creates a recorder that only logs.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            sink: None,
        }
    }

    /// Creates a recorder whose events can also be received on a channel.
    #[must_use]
    pub fn with_capture(component: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                component: component.into(),
                sink: Some(tx),
            },
            rx,
        )
    }

    /// Returns a recorder for a different component sharing this recorder's
    /// sink.
    #[must_use]
    pub fn for_component(&self, component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            sink: self.sink.clone(),
        }
    }

    /// Records a single event.
    pub fn event(
        &self,
        object: &str,
        event_type: EventType,
        reason: &'static str,
        message: impl Into<String>,
    ) {
        let message = message.into();
        match event_type {
            EventType::Normal => info!(
                component = %self.component,
                object,
                reason,
                %message,
                "event"
            ),
            EventType::Warning => warn!(
                component = %self.component,
                object,
                reason,
                %message,
                "event"
            ),
        }

        if let Some(sink) = &self.sink {
            let _ = sink.send(Event {
                component: self.component.clone(),
                object: object.to_string(),
                event_type,
                reason,
                message,
            });
        }
    }
}
