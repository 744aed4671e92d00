//! External Capability Providers
//!
//! Design Decision: One trait, two transport strategies
//!
//! Rationale: Capabilities hosted outside the process are reached either by
//! spawning a child that speaks line-delimited JSON frames over stdio, or by
//! calling a remote HTTP service. Both are hidden behind `CapabilityProvider`
//! so the registry only ever sees a provider id, a state, and a `call`.
//!
//! Architecture:
//! ```text
//! ProviderBridge (owns providers, syncs registry)
//!     ├─> SubprocessProvider (stdio frames, child process lifecycle)
//!     └─> HttpProvider (reqwest, bearer/basic auth)
//! ```
//!
//! Lifecycle:
//! 1. `start()`: spawn + handshake (subprocess) or reachability probe (HTTP)
//! 2. `discover()`: list capabilities, provider becomes `ready`
//! 3. `call()`: only valid while `ready`, bounded by the call deadline
//! 4. `stop()`: graceful shutdown, always ends in `stopped`

pub mod bridge;
pub mod config;
pub mod error;
pub mod http;
pub mod protocol;
pub mod state;
pub mod stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use std::fmt;

pub use bridge::ProviderBridge;
pub use config::{AuthConfig, HttpConfig, ProviderConfig, SubprocessConfig};
pub use error::{ProviderError, Result};
pub use http::HttpProvider;
pub use protocol::CapabilityDescriptor;
pub use state::{ProviderState, StateCell};
pub use stdio::SubprocessProvider;

/// Frame protocol version announced in the handshake
pub const PROTOCOL_VERSION: &str = "1";

/// Client name announced in the handshake
pub const CLIENT_NAME: &str = "masterpiece";

/// Transport strategy of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Subprocess,
    Http,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Subprocess => f.write_str("subprocess"),
            ProviderKind::Http => f.write_str("http"),
        }
    }
}

/// An external source of capabilities
///
/// Implementations use interior mutability: the bridge and the registry
/// share one `Arc<dyn CapabilityProvider>` and call through `&self`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Unique id, also the registry namespace
    fn id(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Current lifecycle state, readable without blocking on I/O
    fn state(&self) -> ProviderState;

    /// Establish the connection
    ///
    /// Error Conditions:
    /// - Spawn failure, handshake timeout, early exit: `StartupFailed`
    async fn start(&self) -> Result<()>;

    /// List the provider's capabilities and mark it ready
    async fn discover(&self) -> Result<Vec<CapabilityDescriptor>>;

    /// Invoke one capability by its provider-local name
    ///
    /// Error Conditions:
    /// - Not ready: `Unavailable`, without any round-trip
    /// - Deadline exceeded: `Unavailable`, provider degraded
    /// - Bad frame: `Protocol`, provider degraded
    /// - Capability failed remotely: `Execution`
    async fn call(&self, name: &str, args: Value) -> Result<Value>;

    /// Shut down; idempotent, always ends in `stopped`
    async fn stop(&self) -> Result<()>;

    /// Re-check liveness and return the resulting state
    async fn check_health(&self) -> ProviderState;
}
