//! Provider Bridge
//!
//! Design Decision: One coordinator owns every provider and keeps the
//! capability registry in sync with their lifecycles.
//!
//! Rationale: Starting a provider is only half the job; its discovered
//! capabilities must appear in the registry under `provider:<id>/<name>`
//! and stay resolvable to a clear `ProviderUnavailable` while the provider
//! is down. Doing both in one place keeps the registry from ever pointing at
//! a provider the bridge does not know.
//!
//! Registry synchronization:
//! - `start`: start + discover, then atomically swap the provider's entries
//! - `stop`: stop only; stopped and degraded providers keep their entries
//!   and resolution fails with `ProviderUnavailable` until a restart
//! - `remove`: stop, forget the provider and drop its entries
//! - a start that fails after the child is up tears the provider down again
//!
//! Thread Safety:
//! - provider map behind a tokio RwLock, cloned out before any I/O
//! - providers themselves use interior mutability

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::config::ProviderConfig;
use super::error::ProviderError;
use super::http::HttpProvider;
use super::protocol::CapabilityDescriptor;
use super::state::ProviderState;
use super::stdio::SubprocessProvider;
use super::CapabilityProvider;
use crate::capability::{namespaced, Capability, CapabilityRegistry, Handler, Origin};
use crate::error::Result;
use crate::events::{BusEvent, EventBus};

pub struct ProviderBridge {
    registry: Arc<CapabilityRegistry>,
    providers: RwLock<HashMap<String, Arc<dyn CapabilityProvider>>>,
    bus: Option<Arc<EventBus>>,
}

impl ProviderBridge {
    pub fn new(registry: Arc<CapabilityRegistry>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            registry,
            providers: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Create providers for every enabled entry of `config`
    ///
    /// Nothing is started; call `start_all` or `start`.
    pub async fn from_config(
        config: &ProviderConfig,
        registry: Arc<CapabilityRegistry>,
        bus: Option<Arc<EventBus>>,
    ) -> Result<Self> {
        config.validate()?;
        let bridge = Self::new(registry, bus);

        for server in config.subprocess.iter().filter(|s| s.enabled) {
            let provider = SubprocessProvider::new(server.clone(), bridge.bus.clone());
            bridge.add(Arc::new(provider)).await?;
        }
        for service in config.http.iter().filter(|h| h.enabled) {
            let provider = HttpProvider::new(service.clone(), bridge.bus.clone())?;
            bridge.add(Arc::new(provider)).await?;
        }

        Ok(bridge)
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Take ownership of a provider
    ///
    /// Error Conditions:
    /// - Id already present: `Config`
    pub async fn add(&self, provider: Arc<dyn CapabilityProvider>) -> Result<()> {
        let mut providers = self.providers.write().await;
        let id = provider.id().to_string();
        if providers.contains_key(&id) {
            return Err(ProviderError::Config(format!("Duplicate provider ID: {}", id)).into());
        }
        tracing::debug!(provider = %id, kind = %provider.kind(), "Added provider");
        providers.insert(id, provider);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn CapabilityProvider>> {
        self.providers.read().await.get(id).cloned()
    }

    async fn require(&self, id: &str) -> Result<Arc<dyn CapabilityProvider>> {
        self.get(id)
            .await
            .ok_or_else(|| ProviderError::Config(format!("Unknown provider: {}", id)).into())
    }

    /// Sorted provider ids
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current state of every provider
    pub async fn states(&self) -> HashMap<String, ProviderState> {
        self.providers
            .read()
            .await
            .iter()
            .map(|(id, provider)| (id.clone(), provider.state()))
            .collect()
    }

    /// Start a provider, discover its capabilities and register them
    ///
    /// Returns the registered (namespaced) names.
    ///
    /// Error Conditions:
    /// - Unknown id: `Config`
    /// - Start or discovery failure: the provider's error
    /// - Provider lists the same name twice: `Protocol`
    /// - Namespaced name already taken (strict registry): `DuplicateCapability`
    pub async fn start(&self, id: &str) -> Result<Vec<String>> {
        let provider = self.require(id).await?;

        provider.start().await?;

        // The provider tears its own child down when discovery fails
        let descriptors = provider.discover().await?;

        let names = match self.register_discovered(&provider, descriptors).await {
            Ok(names) => names,
            Err(e) => {
                tracing::error!(provider = %id, "Discarding provider after failed registration: {}", e);
                if let Err(stop_err) = provider.stop().await {
                    tracing::warn!(provider = %id, "Error stopping provider: {}", stop_err);
                }
                return Err(e);
            }
        };

        tracing::info!(provider = %id, count = names.len(), "Registered provider capabilities");
        if let Some(bus) = &self.bus {
            bus.emit(BusEvent::CapabilitiesRegistered {
                provider_id: id.to_string(),
                names: names.clone(),
            });
        }
        Ok(names)
    }

    async fn register_discovered(
        &self,
        provider: &Arc<dyn CapabilityProvider>,
        descriptors: Vec<CapabilityDescriptor>,
    ) -> Result<Vec<String>> {
        let id = provider.id();
        let mut seen = HashSet::new();
        if let Some(dup) = descriptors.iter().find(|d| !seen.insert(d.name.as_str())) {
            return Err(ProviderError::Protocol(format!(
                "provider '{}' listed capability '{}' twice",
                id, dup.name
            ))
            .into());
        }

        let capabilities = descriptors
            .into_iter()
            .map(|descriptor| Self::remote_capability(provider, descriptor))
            .collect();
        self.registry
            .replace_origin(&Origin::Provider(id.to_string()), capabilities)
            .await
    }

    fn remote_capability(
        provider: &Arc<dyn CapabilityProvider>,
        descriptor: CapabilityDescriptor,
    ) -> Capability {
        let parameters = descriptor.parameters();
        Capability {
            name: namespaced(provider.id(), &descriptor.name),
            description: descriptor.description,
            parameters,
            output: descriptor.output,
            origin: Origin::Provider(provider.id().to_string()),
            handler: Handler::Remote {
                provider: Arc::clone(provider),
                remote_name: descriptor.name,
            },
        }
    }

    /// Stop a provider
    ///
    /// Its capabilities stay registered and resolve to `ProviderUnavailable`
    /// until the provider is started again.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let provider = self.require(id).await?;
        provider.stop().await?;
        Ok(())
    }

    /// Stop a provider, forget it and drop its capabilities from the registry
    pub async fn remove(&self, id: &str) -> Result<()> {
        let provider = self.require(id).await?;
        let stopped = provider.stop().await;
        self.providers.write().await.remove(id);

        let removed = self
            .registry
            .unregister_origin(&Origin::Provider(id.to_string()))
            .await;
        tracing::info!(provider = %id, count = removed.len(), "Removed provider");
        if let Some(bus) = &self.bus {
            bus.emit(BusEvent::CapabilitiesRemoved {
                provider_id: id.to_string(),
                names: removed,
            });
        }

        stopped.map_err(Into::into)
    }

    /// Stop then start; the registry entries are replaced on success
    pub async fn restart(&self, id: &str) -> Result<Vec<String>> {
        tracing::info!(provider = %id, "Restarting provider");
        let provider = self.require(id).await?;
        provider.stop().await?;
        self.start(id).await
    }

    pub async fn check_health(&self, id: &str) -> Result<ProviderState> {
        let provider = self.require(id).await?;
        Ok(provider.check_health().await)
    }

    /// Health-check every provider
    pub async fn check_all(&self) -> HashMap<String, ProviderState> {
        let providers: Vec<_> = self.providers.read().await.values().cloned().collect();
        let mut states = HashMap::new();
        for provider in providers {
            states.insert(provider.id().to_string(), provider.check_health().await);
        }
        states
    }

    /// Start every provider, logging and collecting failures
    ///
    /// One provider failing to start does not prevent the others.
    pub async fn start_all(&self) -> Vec<(String, crate::error::MasterpieceError)> {
        let mut failures = Vec::new();
        for id in self.ids().await {
            if let Err(e) = self.start(&id).await {
                tracing::error!(provider = %id, "Failed to start provider: {}", e);
                failures.push((id, e));
            }
        }
        failures
    }

    /// Stop every provider
    pub async fn shutdown(&self) {
        for id in self.ids().await {
            if let Err(e) = self.stop(&id).await {
                tracing::warn!(provider = %id, "Error stopping provider: {}", e);
            }
        }
    }
}
