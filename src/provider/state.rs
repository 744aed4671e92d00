//! Provider Lifecycle State
//!
//! State Machine Transitions:
//! ```text
//! Uninitialized ─start─> Starting ─discover─> Ready
//!                           │                   │
//!               handshake timeout /        deadline / protocol
//!                 early exit                  failure
//!                           ▼                   ▼
//!                        Degraded <─────────────┘
//!
//! any state ─stop / unexpected exit─> Stopped ─start─> Starting
//! ```
//!
//! The state lives in an atomic so the hot path (capability resolution)
//! can read it without taking the provider's I/O lock.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::events::{BusEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    Uninitialized,
    Starting,
    Ready,
    Degraded,
    Stopped,
}

impl ProviderState {
    fn as_u8(self) -> u8 {
        match self {
            ProviderState::Uninitialized => 0,
            ProviderState::Starting => 1,
            ProviderState::Ready => 2,
            ProviderState::Degraded => 3,
            ProviderState::Stopped => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ProviderState::Starting,
            2 => ProviderState::Ready,
            3 => ProviderState::Degraded,
            4 => ProviderState::Stopped,
            _ => ProviderState::Uninitialized,
        }
    }

    /// Only a ready provider exposes usable capabilities
    pub fn is_ready(self) -> bool {
        self == ProviderState::Ready
    }
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderState::Uninitialized => "uninitialized",
            ProviderState::Starting => "starting",
            ProviderState::Ready => "ready",
            ProviderState::Degraded => "degraded",
            ProviderState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Atomic lifecycle state of one provider
///
/// Every transition is logged and, when a bus is attached, published as
/// `BusEvent::ProviderStateChanged`.
pub struct StateCell {
    provider_id: String,
    state: AtomicU8,
    bus: Option<Arc<EventBus>>,
}

impl StateCell {
    pub fn new(provider_id: impl Into<String>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            provider_id: provider_id.into(),
            state: AtomicU8::new(ProviderState::Uninitialized.as_u8()),
            bus,
        }
    }

    pub fn get(&self) -> ProviderState {
        ProviderState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `to`, returning the previous state
    pub fn set(&self, to: ProviderState) -> ProviderState {
        let from = ProviderState::from_u8(self.state.swap(to.as_u8(), Ordering::AcqRel));
        if from != to {
            match to {
                ProviderState::Degraded => {
                    tracing::warn!(provider = %self.provider_id, %from, %to, "Provider degraded")
                }
                _ => tracing::info!(provider = %self.provider_id, %from, %to, "Provider state changed"),
            }
            if let Some(bus) = &self.bus {
                bus.emit(BusEvent::ProviderStateChanged {
                    provider_id: self.provider_id.clone(),
                    from,
                    to,
                });
            }
        }
        from
    }
}
