// Run events and the process-wide event bus
//
// `Event` is the immutable record appended to a session; the order of events
// in a session is the only source of truth for what happened when.
// `EventBus` is a tokio broadcast channel carrying structured observability
// events (provider lifecycle, registry changes, and a copy of every session
// event) to whoever subscribes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

use crate::provider::ProviderState;

/// Maximum capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// One entry in a session's append-only log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the session log, starting at 0
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(seq: u64, kind: EventKind) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Snake-case tag of the event kind (`user_message`, `delegate_handoff`, ...)
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Whether this event ends a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::DelegateResponse { .. } | EventKind::RunError { .. } | EventKind::RunCancelled
        )
    }
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Message submitted by the user
    UserMessage { text: String },

    /// Turn ownership moved from a delegate to one of its children
    DelegateHandoff { from: String, to: String },

    /// A delegate decided to invoke a capability
    CapabilityInvocation {
        delegate: String,
        capability: String,
        args: serde_json::Value,
    },

    /// Outcome of the preceding invocation
    CapabilityResult {
        capability: String,
        outcome: CapabilityOutcome,
    },

    /// The active delegate answered; the run is complete
    DelegateResponse { delegate: String, text: String },

    /// Unrecovered error; the run failed
    RunError { kind: RunErrorKind, cause: String },

    /// The run was cancelled between steps
    RunCancelled,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::UserMessage { .. } => "user_message",
            EventKind::DelegateHandoff { .. } => "delegate_handoff",
            EventKind::CapabilityInvocation { .. } => "capability_invocation",
            EventKind::CapabilityResult { .. } => "capability_result",
            EventKind::DelegateResponse { .. } => "delegate_response",
            EventKind::RunError { .. } => "run_error",
            EventKind::RunCancelled => "run_cancelled",
        }
    }
}

/// Success value or failure message of a capability invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CapabilityOutcome {
    Ok { value: serde_json::Value },
    Error { message: String },
}

impl CapabilityOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CapabilityOutcome::Ok { .. })
    }
}

/// Why a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    InvalidHandoffTarget,
    ProviderUnavailable,
    Reasoning,
    StepLimitExceeded,
    RunTimedOut,
    Internal,
}

impl fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunErrorKind::InvalidHandoffTarget => "InvalidHandoffTarget",
            RunErrorKind::ProviderUnavailable => "ProviderUnavailable",
            RunErrorKind::Reasoning => "Reasoning",
            RunErrorKind::StepLimitExceeded => "StepLimitExceeded",
            RunErrorKind::RunTimedOut => "RunTimedOut",
            RunErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Structured observability event published on the bus
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A session event was appended
    Session { session_id: String, event: Event },

    ProviderStateChanged {
        provider_id: String,
        from: ProviderState,
        to: ProviderState,
    },

    /// Capabilities discovered from a provider were registered
    CapabilitiesRegistered {
        provider_id: String,
        names: Vec<String>,
    },

    /// A provider's capabilities were removed from the registry
    CapabilitiesRemoved {
        provider_id: String,
        names: Vec<String>,
    },

    /// A registration overwrote an existing capability
    CapabilityReplaced { name: String },
}

/// Event bus for publishing and subscribing to events
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// Fails when nobody is subscribed.
    pub fn publish(&self, event: BusEvent) -> Result<usize, EventError> {
        self.tx.send(event).map_err(|_| EventError::NoSubscribers)
    }

    /// Publish, treating "no subscribers" as a non-event
    pub fn emit(&self, event: BusEvent) {
        if self.publish(event).is_err() {
            tracing::trace!("Event bus has no subscribers, event dropped");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors that can occur during event operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("No subscribers on the event bus")]
    NoSubscribers,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization_tags() {
        let event = Event::new(
            3,
            EventKind::DelegateHandoff {
                from: "product_manager_agent".into(),
                to: "architect_agent".into(),
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "delegate_handoff");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["to"], "architect_agent");

        let parsed: Event = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_capability_outcome_shape() {
        let kind = EventKind::CapabilityResult {
            capability: "suggest_tech_stack".into(),
            outcome: CapabilityOutcome::Error {
                message: "boom".into(),
            },
        };
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value["outcome"], json!({ "status": "error", "message": "boom" }));
    }

    #[test]
    fn test_terminal_events() {
        assert!(Event::new(0, EventKind::RunCancelled).is_terminal());
        assert!(Event::new(
            0,
            EventKind::DelegateResponse {
                delegate: "qa_agent".into(),
                text: "done".into()
            }
        )
        .is_terminal());
        assert!(!Event::new(0, EventKind::UserMessage { text: "hi".into() }).is_terminal());
    }

    #[test]
    fn test_event_bus_publish_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(BusEvent::CapabilityReplaced {
            name: "list_files".into(),
        });

        match rx.try_recv().unwrap() {
            BusEvent::CapabilityReplaced { name } => assert_eq!(name, "list_files"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_fails() {
        let bus = EventBus::new();
        assert_eq!(
            bus.publish(BusEvent::CapabilityReplaced { name: "x".into() }),
            Err(EventError::NoSubscribers)
        );
        // emit never fails
        bus.emit(BusEvent::CapabilityReplaced { name: "x".into() });
    }
}
