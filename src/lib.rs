// Library interface for masterpiece
// A delegation-and-capability-routing runtime:
// - capability registry with local and provider-backed capabilities
// - provider bridge for subprocess (stdio frames) and HTTP capability providers
// - validated delegate trees and a per-session orchestrator

pub mod capability;
pub mod config;
pub mod delegate;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod provider;
pub mod reasoning;
pub mod session;

// Re-export commonly used types for convenience
pub use capability::{Capability, CapabilityInfo, CapabilityRegistry, Origin, ParamType, Parameter, ReplacePolicy};
pub use config::RuntimeConfig;
pub use delegate::{Delegate, DelegateId, DelegateSpec, DelegateTree};
pub use error::{MasterpieceError, Result};
pub use events::{BusEvent, CapabilityOutcome, Event, EventBus, EventKind, RunErrorKind};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorConfig};
pub use provider::{CapabilityProvider, ProviderBridge, ProviderConfig, ProviderState};
pub use reasoning::{Decision, DecisionRequest, Reasoning, Script, ScriptedReasoning};
pub use session::{InMemorySessionStore, RunStatus, Session, SessionStore};
