// Centralized error handling using thiserror for type-safe error management
//
// Design Decision: One taxonomy for the whole runtime
//
// Rationale: Callers need to tell structural misconfiguration (fatal at
// startup) apart from per-step invocation failures (recorded, run continues)
// and control errors (visible to the caller, only the offending request ends).
// Each of those maps to a dedicated variant so the orchestrator can match on
// them instead of inspecting strings.
//
// Error Classes:
// - Configuration: DuplicateCapability, UnboundCapability, DuplicateDelegateName,
//   CyclicDelegateTree, UnknownDelegate, Config
// - Invocation: UnknownCapability, InvalidArguments, CapabilityExecution
// - Provider: ProviderUnavailable, Provider(ProviderError)
// - Control: InvalidHandoffTarget, SessionNotFound, SessionTerminated, SessionBusy
// - Collaborator: Reasoning

use thiserror::Error;

use crate::provider::ProviderError;

/// Main error type for the delegation runtime
///
/// Usage:
///     fn bind(registry: &CapabilityRegistry, name: &str) -> Result<()> {
///         if !registry.contains(name).await {
///             return Err(MasterpieceError::UnknownCapability(name.to_string()));
///         }
///         Ok(())
///     }
#[derive(Debug, Error)]
pub enum MasterpieceError {
    /// A capability with this name is already registered and the registry
    /// runs with the strict replace policy
    #[error("Capability already registered: {0}")]
    DuplicateCapability(String),

    /// No capability with this name is registered
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    /// Arguments did not match the capability's input schema
    ///
    /// `problems` lists every missing, mistyped or unexpected parameter.
    #[error("Invalid arguments for '{capability}': {}", problems.join("; "))]
    InvalidArguments {
        capability: String,
        problems: Vec<String>,
    },

    /// The capability handler (local or provider-backed) failed
    ///
    /// `message` carries the origin's raw failure text.
    #[error("Capability '{capability}' failed: {message}")]
    CapabilityExecution { capability: String, message: String },

    /// The provider backing a capability is not in the ready state
    #[error("Provider unavailable: {provider} ({reason})")]
    ProviderUnavailable { provider: String, reason: String },

    /// A delegate binds a capability that is not in the registry
    #[error("Delegate '{delegate}' binds unregistered capability '{capability}'")]
    UnboundCapability { delegate: String, capability: String },

    /// A delegate name appears more than once in the tree
    #[error("Duplicate delegate name: {0}")]
    DuplicateDelegateName(String),

    /// A child reference closes a cycle back to an ancestor
    ///
    /// `path` starts at the repeated ancestor, follows the child links and
    /// ends at it again; delegates above the cycle are not included.
    #[error("Cyclic delegate tree: {}", path.join(" -> "))]
    CyclicDelegateTree { path: Vec<String> },

    /// A delegate refers to a child (or root) that was never declared
    #[error("Unknown delegate: {0}")]
    UnknownDelegate(String),

    #[error("Invalid handoff from '{from}' to '{to}': not a direct child")]
    InvalidHandoffTarget { from: String, to: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The session's last run failed; a new session is required
    #[error("Session terminated: {0}")]
    SessionTerminated(String),

    /// Another run is in flight on this session
    #[error("Session busy: {0}")]
    SessionBusy(String),

    /// The delegate's reasoning behavior failed or timed out
    #[error("Reasoning error: {0}")]
    Reasoning(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider bridge failure (startup, protocol, transport)
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl MasterpieceError {
    /// Whether this error is a structural configuration error
    ///
    /// Configuration errors are always fatal to startup and never recovered
    /// at runtime.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MasterpieceError::DuplicateCapability(_)
                | MasterpieceError::UnboundCapability { .. }
                | MasterpieceError::DuplicateDelegateName(_)
                | MasterpieceError::CyclicDelegateTree { .. }
                | MasterpieceError::UnknownDelegate(_)
                | MasterpieceError::Config(_)
        )
    }

    /// Whether this error is local to one invocation step
    ///
    /// Invocation errors are recorded as a failed capability result and the
    /// run keeps dispatching.
    pub fn is_invocation(&self) -> bool {
        matches!(
            self,
            MasterpieceError::UnknownCapability(_)
                | MasterpieceError::InvalidArguments { .. }
                | MasterpieceError::CapabilityExecution { .. }
        )
    }
}

/// Type alias for Result with MasterpieceError
pub type Result<T> = std::result::Result<T, MasterpieceError>;
