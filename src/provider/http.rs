//! HTTP Provider
//!
//! Remote capability service reached with reqwest.
//!
//! Endpoints (relative to the configured base URL):
//! - `GET  <url>`               reachability probe (any HTTP answer counts)
//! - `GET  <url>/capabilities`  discovery, `{"capabilities":[...]}` or a bare array
//! - `POST <url>/invoke`        `{"capability": name, "args": {...}}` -> `{"result": ...}`
//!
//! Failure mapping:
//! - connection refused, timeout, TLS failure: `Unavailable`, provider degraded
//! - non-2xx answer: `Execution` carrying status and body, provider stays ready
//! - 2xx with an unparseable body: `Protocol`, provider degraded
//!
//! Startup is best-effort: an unreachable service leaves the provider
//! `degraded` without failing `start`, and a later `discover` may still
//! bring it to `ready`. Unlike a subprocess there is nothing to restart, so
//! `check_health` also moves a degraded provider back to ready once the
//! probe answers again.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::config::{resolve_env_var, AuthConfig, HttpConfig};
use super::error::{ProviderError, Result};
use super::protocol::{CapabilityDescriptor, InvokeRequest, InvokeResponse};
use super::state::{ProviderState, StateCell};
use super::{CapabilityProvider, ProviderKind};
use crate::events::EventBus;

/// Discovery answer, either wrapped or a bare list
#[derive(Deserialize)]
#[serde(untagged)]
enum DiscoveryBody {
    Wrapped { capabilities: Vec<CapabilityDescriptor> },
    Bare(Vec<CapabilityDescriptor>),
}

pub struct HttpProvider {
    config: HttpConfig,
    state: StateCell,
    client: Client,

    /// Auth with `${VAR}` references already resolved
    auth: Option<AuthConfig>,
}

impl HttpProvider {
    /// Build the client, resolving header and auth values from the environment
    ///
    /// Error Conditions:
    /// - Referenced environment variable unset: `Config`
    /// - Header name or value not valid HTTP: `Config`
    pub fn new(config: HttpConfig, bus: Option<Arc<EventBus>>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let value = resolve_env_var(value)?;
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ProviderError::Config(format!("Invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| ProviderError::Config(format!("Invalid value for header '{}': {}", name, e)))?;
            headers.insert(name, value);
        }

        let auth = match &config.auth {
            None | Some(AuthConfig::None) => None,
            Some(AuthConfig::Bearer { token }) => Some(AuthConfig::Bearer {
                token: resolve_env_var(token)?,
            }),
            Some(AuthConfig::Basic { username, password }) => Some(AuthConfig::Basic {
                username: resolve_env_var(username)?,
                password: resolve_env_var(password)?,
            }),
        };

        let client = Client::builder()
            .timeout(config.call_timeout())
            .default_headers(headers)
            .build()?;

        let state = StateCell::new(config.id.clone(), bus);
        Ok(Self {
            config,
            state,
            client,
            auth,
        })
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.config.url.trim_end_matches('/');
        if path.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, path)
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some(AuthConfig::Bearer { token }) => request.bearer_auth(token),
            Some(AuthConfig::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            _ => request,
        }
    }

    /// Any HTTP answer at the base URL means the service is reachable
    async fn probe(&self) -> Result<()> {
        self.authorize(self.client.get(self.endpoint("")))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| ProviderError::unavailable(&self.config.id, e.to_string()))
    }

    /// Transport failure: degrade and report unavailable
    fn transport_failure(&self, err: reqwest::Error) -> ProviderError {
        let reason = if err.is_timeout() {
            format!("request exceeded deadline of {}s", self.config.call_timeout_secs)
        } else {
            err.to_string()
        };
        tracing::warn!(provider = %self.config.id, "HTTP provider unreachable: {}", reason);
        self.state.set(ProviderState::Degraded);
        ProviderError::unavailable(&self.config.id, reason)
    }

    fn protocol_failure(&self, message: String) -> ProviderError {
        tracing::warn!(provider = %self.config.id, "HTTP provider sent bad body: {}", message);
        self.state.set(ProviderState::Degraded);
        ProviderError::Protocol(message)
    }
}

#[async_trait]
impl CapabilityProvider for HttpProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Http
    }

    fn state(&self) -> ProviderState {
        self.state.get()
    }

    async fn start(&self) -> Result<()> {
        self.state.set(ProviderState::Starting);
        match self.probe().await {
            Ok(()) => {
                tracing::info!(provider = %self.config.id, url = %self.config.url, "HTTP provider reachable");
                Ok(())
            }
            Err(e) => {
                // Remote services may come up later; discovery retries the connection
                tracing::warn!(provider = %self.config.id, "HTTP provider not reachable yet: {}", e);
                self.state.set(ProviderState::Degraded);
                Ok(())
            }
        }
    }

    async fn discover(&self) -> Result<Vec<CapabilityDescriptor>> {
        let state = self.state.get();
        if !matches!(
            state,
            ProviderState::Starting | ProviderState::Ready | ProviderState::Degraded
        ) {
            return Err(ProviderError::unavailable(
                &self.config.id,
                format!("cannot discover while {}", state),
            ));
        }

        let response = self
            .authorize(self.client.get(self.endpoint("capabilities")))
            .send()
            .await
            .map_err(|e| self.transport_failure(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Execution {
                provider: self.config.id.clone(),
                message: format!("discovery failed with HTTP {}: {}", status, body),
            });
        }

        let capabilities = match response.json::<DiscoveryBody>().await {
            Ok(DiscoveryBody::Wrapped { capabilities }) | Ok(DiscoveryBody::Bare(capabilities)) => {
                capabilities
            }
            Err(e) => return Err(self.protocol_failure(format!("invalid capability list: {}", e))),
        };

        tracing::info!(
            provider = %self.config.id,
            count = capabilities.len(),
            "Discovered provider capabilities"
        );
        self.state.set(ProviderState::Ready);
        Ok(capabilities)
    }

    async fn call(&self, name: &str, args: Value) -> Result<Value> {
        let state = self.state.get();
        if !state.is_ready() {
            return Err(ProviderError::unavailable(
                &self.config.id,
                format!("provider is {}", state),
            ));
        }

        let body = InvokeRequest {
            capability: name.to_string(),
            args,
        };
        let response = self
            .authorize(self.client.post(self.endpoint("invoke")))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_failure(e))?;

        let status = response.status();
        if !status.is_success() {
            let payload = response.text().await.unwrap_or_default();
            return Err(ProviderError::Execution {
                provider: self.config.id.clone(),
                message: format!("HTTP {}: {}", status, payload),
            });
        }

        match response.json::<InvokeResponse>().await {
            Ok(invoked) => Ok(invoked.result),
            Err(e) if e.is_timeout() => Err(self.transport_failure(e)),
            Err(e) => Err(self.protocol_failure(format!("invalid invoke response: {}", e))),
        }
    }

    async fn stop(&self) -> Result<()> {
        self.state.set(ProviderState::Stopped);
        Ok(())
    }

    async fn check_health(&self) -> ProviderState {
        match self.state.get() {
            ProviderState::Ready => {
                if let Err(e) = self.probe().await {
                    tracing::warn!(provider = %self.config.id, "Health check failed: {}", e);
                    self.state.set(ProviderState::Degraded);
                }
            }
            ProviderState::Degraded => {
                if self.probe().await.is_ok() {
                    tracing::info!(provider = %self.config.id, "HTTP provider recovered");
                    self.state.set(ProviderState::Ready);
                }
            }
            _ => {}
        }
        self.state.get()
    }
}
