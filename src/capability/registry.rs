//! Capability Registry
//!
//! Process-wide map from capability name to capability. Registration
//! mutations (local registration, provider discovery and removal) take the write lock;
//! `resolve` clones the capability out under a short read lock so a
//! long-running remote call never holds the registry.
//!
//! Re-registration policy is fixed per registry:
//! - `ReplacePolicy::Strict` rejects a duplicate name with `DuplicateCapability`
//! - `ReplacePolicy::Replace` overwrites, logs a warning and publishes
//!   `BusEvent::CapabilityReplaced`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{Arguments, Capability, CapabilityInfo, Handler, Origin};
use crate::error::{MasterpieceError, Result};
use crate::events::{BusEvent, EventBus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacePolicy {
    #[default]
    Strict,
    Replace,
}

pub struct CapabilityRegistry {
    capabilities: RwLock<HashMap<String, Capability>>,
    policy: ReplacePolicy,
    bus: Option<Arc<EventBus>>,
}

impl CapabilityRegistry {
    pub fn new(policy: ReplacePolicy) -> Self {
        Self {
            capabilities: RwLock::new(HashMap::new()),
            policy,
            bus: None,
        }
    }

    pub fn with_event_bus(policy: ReplacePolicy, bus: Arc<EventBus>) -> Self {
        Self {
            bus: Some(bus),
            ..Self::new(policy)
        }
    }

    pub fn policy(&self) -> ReplacePolicy {
        self.policy
    }

    /// Register a capability under its name
    ///
    /// Error Conditions:
    /// - Name taken and policy is Strict: `DuplicateCapability`
    pub async fn register(&self, capability: Capability) -> Result<()> {
        let mut capabilities = self.capabilities.write().await;
        self.insert_locked(&mut capabilities, capability)
    }

    pub async fn register_all(&self, capabilities: impl IntoIterator<Item = Capability>) -> Result<()> {
        let mut map = self.capabilities.write().await;
        for capability in capabilities {
            self.insert_locked(&mut map, capability)?;
        }
        Ok(())
    }

    fn insert_locked(
        &self,
        map: &mut HashMap<String, Capability>,
        capability: Capability,
    ) -> Result<()> {
        if map.contains_key(&capability.name) {
            match self.policy {
                ReplacePolicy::Strict => {
                    return Err(MasterpieceError::DuplicateCapability(capability.name));
                }
                ReplacePolicy::Replace => {
                    tracing::warn!(capability = %capability.name, origin = %capability.origin, "Replacing registered capability");
                    if let Some(bus) = &self.bus {
                        bus.emit(BusEvent::CapabilityReplaced {
                            name: capability.name.clone(),
                        });
                    }
                }
            }
        } else {
            tracing::debug!(capability = %capability.name, origin = %capability.origin, "Registered capability");
        }
        map.insert(capability.name.clone(), capability);
        Ok(())
    }

    /// Atomically swap every capability of `origin` for `capabilities`
    ///
    /// Used by the provider bridge after discovery. Under the strict policy
    /// the swap is all-or-nothing: a collision with another origin leaves the
    /// registry untouched. Returns the names now registered.
    pub async fn replace_origin(
        &self,
        origin: &Origin,
        capabilities: Vec<Capability>,
    ) -> Result<Vec<String>> {
        let mut map = self.capabilities.write().await;

        if self.policy == ReplacePolicy::Strict {
            for capability in &capabilities {
                if let Some(existing) = map.get(&capability.name) {
                    if &existing.origin != origin {
                        return Err(MasterpieceError::DuplicateCapability(capability.name.clone()));
                    }
                }
            }
        }

        map.retain(|_, c| &c.origin != origin);
        let mut names = Vec::with_capacity(capabilities.len());
        for capability in capabilities {
            names.push(capability.name.clone());
            self.insert_locked(&mut map, capability)?;
        }
        Ok(names)
    }

    /// Remove every capability of `origin`, returning the removed names
    pub async fn unregister_origin(&self, origin: &Origin) -> Vec<String> {
        let mut map = self.capabilities.write().await;
        let names: Vec<String> = map
            .values()
            .filter(|c| &c.origin == origin)
            .map(|c| c.name.clone())
            .collect();
        for name in &names {
            map.remove(name);
        }
        names
    }

    /// Look up a capability that can be invoked right now
    ///
    /// Error Conditions:
    /// - Not registered: `UnknownCapability`
    /// - Origin provider not ready: `ProviderUnavailable`
    pub async fn resolve(&self, name: &str) -> Result<Capability> {
        let capability = self
            .capabilities
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| MasterpieceError::UnknownCapability(name.to_string()))?;

        if let Handler::Remote { provider, .. } = &capability.handler {
            let state = provider.state();
            if !state.is_ready() {
                return Err(MasterpieceError::ProviderUnavailable {
                    provider: provider.id().to_string(),
                    reason: format!("provider is {}", state),
                });
            }
        }

        Ok(capability)
    }

    /// Validate `args` and dispatch to the capability's handler
    ///
    /// `args` must be a JSON object (`null` counts as no arguments). There
    /// is no implicit retry.
    ///
    /// Error Conditions:
    /// - Resolution failures from `resolve`
    /// - Schema mismatch: `InvalidArguments`
    /// - Handler or provider failure: `CapabilityExecution` with the origin's message
    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value> {
        let capability = self.resolve(name).await?;

        let args: Arguments = match args {
            Value::Object(map) => map,
            Value::Null => Arguments::new(),
            other => {
                return Err(MasterpieceError::InvalidArguments {
                    capability: capability.name,
                    problems: vec![format!("arguments must be an object, got {}", other)],
                });
            }
        };
        capability.validate(&args)?;

        tracing::debug!(capability = %capability.name, origin = %capability.origin, "Invoking capability");
        match &capability.handler {
            Handler::Local(handler) => {
                handler(&args).map_err(|message| MasterpieceError::CapabilityExecution {
                    capability: capability.name.clone(),
                    message,
                })
            }
            Handler::Remote { provider, remote_name } => provider
                .call(remote_name, Value::Object(args))
                .await
                .map_err(|e| MasterpieceError::CapabilityExecution {
                    capability: capability.name.clone(),
                    message: e.to_string(),
                }),
        }
    }

    /// Whether `name` is registered (regardless of provider readiness)
    pub async fn contains(&self, name: &str) -> bool {
        self.capabilities.read().await.contains_key(name)
    }

    /// Sorted snapshot of registered names
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptions of the given capabilities, skipping unknown names
    pub async fn describe(&self, names: &[String]) -> Vec<CapabilityInfo> {
        let map = self.capabilities.read().await;
        names
            .iter()
            .filter_map(|name| map.get(name).map(Capability::info))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.capabilities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.capabilities.read().await.is_empty()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(ReplacePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ParamType, Parameter};
    use crate::provider::{CapabilityDescriptor, CapabilityProvider, ProviderError, ProviderKind, ProviderState, StateCell};
    use async_trait::async_trait;
    use serde_json::json;

    fn upper() -> Capability {
        Capability::local(
            "upper",
            "Uppercase text",
            vec![Parameter::required("text", ParamType::String)],
            ParamType::String,
            |args| Ok(json!(args["text"].as_str().unwrap_or_default().to_uppercase())),
        )
    }

    struct FixedProvider {
        state: StateCell,
    }

    #[async_trait]
    impl CapabilityProvider for FixedProvider {
        fn id(&self) -> &str {
            "fixed"
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::Http
        }
        fn state(&self) -> ProviderState {
            self.state.get()
        }
        async fn start(&self) -> crate::provider::Result<()> {
            self.state.set(ProviderState::Ready);
            Ok(())
        }
        async fn discover(&self) -> crate::provider::Result<Vec<CapabilityDescriptor>> {
            Ok(vec![])
        }
        async fn call(&self, name: &str, args: Value) -> crate::provider::Result<Value> {
            if name == "fail" {
                return Err(ProviderError::Execution {
                    provider: "fixed".into(),
                    message: "remote said no".into(),
                });
            }
            Ok(json!({ "called": name, "args": args }))
        }
        async fn stop(&self) -> crate::provider::Result<()> {
            self.state.set(ProviderState::Stopped);
            Ok(())
        }
        async fn check_health(&self) -> ProviderState {
            self.state.get()
        }
    }

    fn remote(provider: &Arc<FixedProvider>, name: &str) -> Capability {
        Capability {
            name: crate::capability::namespaced("fixed", name),
            description: String::new(),
            parameters: vec![],
            output: ParamType::Any,
            origin: Origin::Provider("fixed".into()),
            handler: Handler::Remote {
                provider: Arc::clone(provider) as Arc<dyn CapabilityProvider>,
                remote_name: name.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_strict_policy_rejects_duplicates() {
        let registry = CapabilityRegistry::new(ReplacePolicy::Strict);
        registry.register(upper()).await.unwrap();

        let err = registry.register(upper()).await.unwrap_err();
        assert!(matches!(err, MasterpieceError::DuplicateCapability(name) if name == "upper"));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_replace_policy_overwrites_and_publishes() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let registry = CapabilityRegistry::with_event_bus(ReplacePolicy::Replace, bus);

        registry.register(upper()).await.unwrap();
        let mut replacement = upper();
        replacement.description = "Shout".into();
        registry.register(replacement).await.unwrap();

        assert_eq!(registry.resolve("upper").await.unwrap().description, "Shout");
        assert!(matches!(rx.try_recv().unwrap(), BusEvent::CapabilityReplaced { name } if name == "upper"));
    }

    #[tokio::test]
    async fn test_resolve_unknown() {
        let registry = CapabilityRegistry::default();
        assert!(matches!(
            registry.resolve("missing").await,
            Err(MasterpieceError::UnknownCapability(_))
        ));
    }

    #[tokio::test]
    async fn test_invoke_local_is_idempotent() {
        let registry = CapabilityRegistry::default();
        registry.register(upper()).await.unwrap();

        let first = registry.invoke("upper", json!({"text": "ios"})).await.unwrap();
        let second = registry.invoke("upper", json!({"text": "ios"})).await.unwrap();
        assert_eq!(first, json!("IOS"));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_invoke_validates_arguments() {
        let registry = CapabilityRegistry::default();
        registry.register(upper()).await.unwrap();

        let err = registry.invoke("upper", json!({"text": 7})).await.unwrap_err();
        assert!(matches!(err, MasterpieceError::InvalidArguments { .. }));

        let err = registry.invoke("upper", json!(["text"])).await.unwrap_err();
        assert!(err.to_string().contains("arguments must be an object"));
    }

    #[tokio::test]
    async fn test_local_failure_becomes_execution_error() {
        let registry = CapabilityRegistry::default();
        registry
            .register(Capability::local("broken", "", vec![], ParamType::Any, |_| {
                Err("disk on fire".to_string())
            }))
            .await
            .unwrap();

        match registry.invoke("broken", Value::Null).await.unwrap_err() {
            MasterpieceError::CapabilityExecution { capability, message } => {
                assert_eq!(capability, "broken");
                assert_eq!(message, "disk on fire");
            }
            other => panic!("Expected CapabilityExecution, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_capability_requires_ready_provider() {
        let provider = Arc::new(FixedProvider {
            state: StateCell::new("fixed", None),
        });
        let registry = CapabilityRegistry::default();
        registry.register(remote(&provider, "echo")).await.unwrap();

        let err = registry.resolve("provider:fixed/echo").await.unwrap_err();
        assert!(matches!(err, MasterpieceError::ProviderUnavailable { ref provider, .. } if provider == "fixed"));

        provider.start().await.unwrap();
        let value = registry
            .invoke("provider:fixed/echo", json!({}))
            .await
            .unwrap();
        assert_eq!(value["called"], "echo");

        provider.state.set(ProviderState::Degraded);
        assert!(matches!(
            registry.invoke("provider:fixed/echo", json!({})).await,
            Err(MasterpieceError::ProviderUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_remote_failure_carries_raw_message() {
        let provider = Arc::new(FixedProvider {
            state: StateCell::new("fixed", None),
        });
        provider.start().await.unwrap();
        let registry = CapabilityRegistry::default();
        registry.register(remote(&provider, "fail")).await.unwrap();

        let err = registry.invoke("provider:fixed/fail", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("remote said no"));
    }

    #[tokio::test]
    async fn test_replace_origin_is_all_or_nothing() {
        let provider = Arc::new(FixedProvider {
            state: StateCell::new("fixed", None),
        });
        let registry = CapabilityRegistry::default();
        let origin = Origin::Provider("fixed".into());

        let names = registry
            .replace_origin(&origin, vec![remote(&provider, "a"), remote(&provider, "b")])
            .await
            .unwrap();
        assert_eq!(names.len(), 2);

        // Re-discovery replaces the provider's own set
        registry
            .replace_origin(&origin, vec![remote(&provider, "c")])
            .await
            .unwrap();
        assert_eq!(registry.names().await, vec!["provider:fixed/c".to_string()]);

        // A collision with a local capability aborts the swap
        let mut clash = upper();
        clash.name = "provider:fixed/d".into();
        registry.register(clash).await.unwrap();
        let err = registry
            .replace_origin(&origin, vec![remote(&provider, "d")])
            .await
            .unwrap_err();
        assert!(matches!(err, MasterpieceError::DuplicateCapability(_)));
        assert!(registry.contains("provider:fixed/c").await);

        let removed = registry.unregister_origin(&origin).await;
        assert_eq!(removed, vec!["provider:fixed/c".to_string()]);
        assert_eq!(registry.names().await, vec!["provider:fixed/d".to_string()]);
    }

    #[tokio::test]
    async fn test_describe_skips_unknown() {
        let registry = CapabilityRegistry::default();
        registry.register(upper()).await.unwrap();
        let infos = registry
            .describe(&["upper".to_string(), "nope".to_string()])
            .await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].parameters[0].name, "text");
    }
}
