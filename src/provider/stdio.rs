//! Subprocess Provider (stdio)
//!
//! Design Decision: One child process per provider, newline-delimited frames
//!
//! Rationale: Local providers are ordinary executables. Speaking one JSON
//! object per line over stdin/stdout keeps them trivial to write in any
//! language and needs no port management.
//!
//! Trade-offs:
//! - Sequential requests: one in flight at a time (the I/O mutex), ids are
//!   still checked so a desynchronized stream is detected rather than trusted
//! - Kill on failure: after a deadline overrun or a bad frame the stream
//!   position is unknown, so the child is terminated and the provider degraded
//!
//! Process hygiene:
//! - the child is spawned with `kill_on_drop(true)`; dropping the provider
//!   never leaves an orphan
//! - every failure path that abandons the child kills and reaps it
//! - the scope directory is passed as the final argument, always absolute
//!
//! Error Recovery Strategy:
//! - Handshake timeout / early exit: `StartupFailed`, state `degraded`
//! - Call deadline exceeded: `Unavailable`, state `degraded`, child killed
//! - Malformed or mismatched frame: `Protocol`, state `degraded`, child killed
//! - Child exited on its own: `Unavailable`, state `stopped`
//! - Error frame on a call: `Execution`, state unchanged
//! - Any discovery failure: state `degraded` (or `stopped` if the child
//!   exited), child killed

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::config::{resolve_env_var, SubprocessConfig};
use super::error::{ProviderError, Result};
use super::protocol::{
    decode_response, encode_line, CapabilityDescriptor, CapabilityList, RequestBody, RequestFrame,
    ResponseFrame,
};
use super::state::{ProviderState, StateCell};
use super::{CapabilityProvider, ProviderKind, CLIENT_NAME, PROTOCOL_VERSION};
use crate::events::EventBus;

/// How long to wait for a killed child to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Pipes and handle of a running child
struct ProcessIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Result of one request/response round-trip
enum Exchange {
    Frame(ResponseFrame),
    /// stdout hit EOF or stdin is broken: the child is gone
    Closed,
}

/// Provider hosted by a child process
///
/// Example:
/// ```rust,ignore
/// let mut config = SubprocessConfig::new("fs", "masterpiece-fs-provider");
/// config.scope = Some("./workspace".into());
///
/// let provider = SubprocessProvider::new(config, None);
/// provider.start().await?;
/// let capabilities = provider.discover().await?;
/// let listing = provider.call("list_directory", json!({})).await?;
/// provider.stop().await?;
/// ```
pub struct SubprocessProvider {
    config: SubprocessConfig,
    state: StateCell,

    /// Some while a child is running
    io: Mutex<Option<ProcessIo>>,

    /// Next request id, reset to 1 on every start
    next_id: AtomicU64,
}

impl SubprocessProvider {
    pub fn new(config: SubprocessConfig, bus: Option<Arc<EventBus>>) -> Self {
        let state = StateCell::new(config.id.clone(), bus);
        Self {
            config,
            state,
            io: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SubprocessConfig {
        &self.config
    }

    /// Whether a child process is currently attached
    pub async fn has_process(&self) -> bool {
        self.io.lock().await.is_some()
    }

    /// OS process id of the attached child
    pub async fn pid(&self) -> Option<u32> {
        self.io.lock().await.as_ref().and_then(|io| io.child.id())
    }

    /// Absolute form of the configured scope
    fn absolute_scope(scope: &Path) -> std::io::Result<PathBuf> {
        scope
            .canonicalize()
            .or_else(|_| std::path::absolute(scope))
    }

    fn spawn(&self) -> Result<Child> {
        let id = &self.config.id;
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);

        if let Some(scope) = &self.config.scope {
            let scope = Self::absolute_scope(scope).map_err(|e| {
                ProviderError::startup(id, format!("invalid scope '{}': {}", scope.display(), e))
            })?;
            cmd.arg(scope);
        }

        for (key, value) in &self.config.env {
            let resolved = resolve_env_var(value)
                .map_err(|e| ProviderError::startup(id, e.to_string()))?;
            cmd.env(key, resolved);
        }

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        // stderr is inherited so provider logs show up next to ours
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        cmd.spawn().map_err(|e| {
            ProviderError::startup(
                id,
                format!("failed to spawn '{}': {}", self.config.command, e),
            )
        })
    }

    /// Write one frame and read the next non-empty line back
    async fn exchange(io: &mut ProcessIo, frame: &RequestFrame) -> Result<Exchange> {
        let line = encode_line(frame)?;
        tracing::trace!(id = frame.id, kind = frame.body.kind(), "-> provider");

        if io.stdin.write_all(line.as_bytes()).await.is_err() || io.stdin.flush().await.is_err() {
            return Ok(Exchange::Closed);
        }

        let mut buf = String::new();
        loop {
            buf.clear();
            if io.stdout.read_line(&mut buf).await? == 0 {
                return Ok(Exchange::Closed);
            }
            if !buf.trim().is_empty() {
                break;
            }
        }
        tracing::trace!(line = buf.trim_end(), "<- provider");
        decode_response(&buf).map(Exchange::Frame)
    }

    async fn handshake(&self, io: &mut ProcessIo) -> std::result::Result<Value, String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = RequestFrame {
            id,
            body: RequestBody::Initialize {
                client_name: CLIENT_NAME.to_string(),
                client_version: env!("CARGO_PKG_VERSION").to_string(),
                protocol_version: PROTOCOL_VERSION.to_string(),
            },
        };

        let outcome = Self::exchange(io, &frame).await;
        match outcome {
            Ok(Exchange::Frame(response)) if response.id != id => Err(format!(
                "handshake answered with id {}, expected {}",
                response.id, id
            )),
            Ok(Exchange::Frame(ResponseFrame {
                error: Some(err), ..
            })) => Err(format!("handshake rejected: {}", err.message)),
            Ok(Exchange::Frame(response)) => Ok(response.result.unwrap_or(Value::Null)),
            Ok(Exchange::Closed) => Err(match io.child.try_wait() {
                Ok(Some(status)) => format!("process exited during handshake ({})", status),
                _ => "process closed stdout during handshake".to_string(),
            }),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Kill and reap a child, ignoring errors (it may already be gone)
    async fn terminate(io: Option<ProcessIo>) {
        let Some(mut io) = io else {
            return;
        };
        if let Err(e) = io.child.start_kill() {
            tracing::debug!("Provider process already gone: {}", e);
        }
        let _ = timeout(REAP_TIMEOUT, io.child.wait()).await;
    }

    /// One round-trip under the call deadline, with failure bookkeeping
    async fn request(&self, body: RequestBody) -> Result<Value> {
        let provider = self.config.id.as_str();
        let deadline = self.config.call_timeout();

        let mut guard = self.io.lock().await;
        let Some(io) = guard.as_mut() else {
            return Err(ProviderError::unavailable(provider, "no running process"));
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let kind = body.kind();
        let frame = RequestFrame { id, body };

        let outcome = timeout(deadline, Self::exchange(io, &frame)).await;
        let failure = match outcome {
            Ok(Ok(Exchange::Frame(response))) if response.id == id => {
                return match response.error {
                    Some(err) => Err(ProviderError::Execution {
                        provider: provider.to_string(),
                        message: err.message,
                    }),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
            }
            Ok(Ok(Exchange::Frame(response))) => ProviderError::Protocol(format!(
                "expected response id {}, got {}",
                id, response.id
            )),
            Ok(Ok(Exchange::Closed)) => {
                let exited = guard.take();
                drop(guard);
                Self::terminate(exited).await;
                self.state.set(ProviderState::Stopped);
                return Err(ProviderError::unavailable(
                    provider,
                    "provider process exited unexpectedly",
                ));
            }
            Ok(Err(ProviderError::Protocol(message))) => ProviderError::Protocol(message),
            Ok(Err(e)) => ProviderError::unavailable(provider, e.to_string()),
            Err(_) => ProviderError::unavailable(
                provider,
                format!("'{}' exceeded deadline of {}s", kind, deadline.as_secs()),
            ),
        };

        tracing::warn!(provider, kind, "Provider request failed: {}", failure);
        let abandoned = guard.take();
        drop(guard);
        self.state.set(ProviderState::Degraded);
        Self::terminate(abandoned).await;
        Err(failure)
    }
}

#[async_trait]
impl CapabilityProvider for SubprocessProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Subprocess
    }

    fn state(&self) -> ProviderState {
        self.state.get()
    }

    /// Spawn the child and complete the handshake
    ///
    /// The provider stays `starting` until `discover` succeeds. Starting an
    /// already running provider replaces its child.
    async fn start(&self) -> Result<()> {
        let provider = self.config.id.as_str();
        let mut guard = self.io.lock().await;
        Self::terminate(guard.take()).await;

        self.state.set(ProviderState::Starting);
        self.next_id.store(1, Ordering::SeqCst);

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state.set(ProviderState::Degraded);
                return Err(e);
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.state.set(ProviderState::Degraded);
            let _ = child.start_kill();
            return Err(ProviderError::startup(provider, "failed to capture stdio pipes"));
        };
        let mut io = ProcessIo {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };

        let handshake_timeout = self.config.handshake_timeout();
        let reason = match timeout(handshake_timeout, self.handshake(&mut io)).await {
            Ok(Ok(info)) => {
                tracing::info!(provider, pid = ?io.child.id(), %info, "Provider handshake complete");
                *guard = Some(io);
                return Ok(());
            }
            Ok(Err(reason)) => reason,
            Err(_) => format!("handshake timed out after {}s", handshake_timeout.as_secs()),
        };

        tracing::error!(provider, "Provider failed to start: {}", reason);
        self.state.set(ProviderState::Degraded);
        Self::terminate(Some(io)).await;
        Err(ProviderError::startup(provider, reason))
    }

    async fn discover(&self) -> Result<Vec<CapabilityDescriptor>> {
        let state = self.state.get();
        if !matches!(state, ProviderState::Starting | ProviderState::Ready) {
            return Err(ProviderError::unavailable(
                &self.config.id,
                format!("cannot discover while {}", state),
            ));
        }

        let listed = match self.request(RequestBody::ListCapabilities).await {
            Ok(result) => serde_json::from_value::<CapabilityList>(result)
                .map_err(|e| ProviderError::Protocol(format!("invalid capability list: {}", e))),
            Err(e) => Err(e),
        };
        let list = match listed {
            Ok(list) => list,
            Err(e) => {
                // Without a capability list the child is of no use
                tracing::error!(provider = %self.config.id, "Discovery failed: {}", e);
                if self.state.get() != ProviderState::Stopped {
                    self.state.set(ProviderState::Degraded);
                }
                Self::terminate(self.io.lock().await.take()).await;
                return Err(e);
            }
        };

        tracing::info!(
            provider = %self.config.id,
            count = list.capabilities.len(),
            "Discovered provider capabilities"
        );
        self.state.set(ProviderState::Ready);
        Ok(list.capabilities)
    }

    async fn call(&self, name: &str, args: Value) -> Result<Value> {
        let state = self.state.get();
        if !state.is_ready() {
            return Err(ProviderError::unavailable(
                &self.config.id,
                format!("provider is {}", state),
            ));
        }

        self.request(RequestBody::Call {
            capability: name.to_string(),
            args,
        })
        .await
    }

    /// Ask the child to shut down, then kill it after the grace period
    ///
    /// Waits for any in-flight request to finish (or hit its deadline) first.
    async fn stop(&self) -> Result<()> {
        let io = self.io.lock().await.take();

        if let Some(ProcessIo {
            mut child,
            mut stdin,
            stdout,
        }) = io
        {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if let Ok(line) = encode_line(&RequestFrame {
                id,
                body: RequestBody::Shutdown,
            }) {
                let _ = stdin.write_all(line.as_bytes()).await;
                let _ = stdin.flush().await;
            }
            drop(stdin);

            match timeout(self.config.shutdown_grace(), child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(provider = %self.config.id, %status, "Provider exited")
                }
                Ok(Err(e)) => tracing::warn!(provider = %self.config.id, "Failed to wait for provider: {}", e),
                Err(_) => {
                    tracing::warn!(provider = %self.config.id, "Provider ignored shutdown, killing");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(provider = %self.config.id, "Failed to kill provider: {}", e);
                    }
                }
            }
            drop(stdout);
        }

        self.state.set(ProviderState::Stopped);
        Ok(())
    }

    /// Detect a child that exited on its own
    ///
    /// Never blocks behind an in-flight request; reports the current state
    /// instead.
    async fn check_health(&self) -> ProviderState {
        let Ok(mut guard) = self.io.try_lock() else {
            return self.state.get();
        };

        let exited = match guard.as_mut() {
            Some(io) => matches!(io.child.try_wait(), Ok(Some(_)) | Err(_)),
            None => false,
        };
        if exited {
            tracing::warn!(provider = %self.config.id, "Provider process exited");
            let io = guard.take();
            drop(guard);
            Self::terminate(io).await;
            self.state.set(ProviderState::Stopped);
        }
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn script(id: &str, body: &str) -> SubprocessConfig {
        let mut config = SubprocessConfig::new(id, "sh");
        config.args = vec!["-c".to_string(), body.to_string()];
        config.handshake_timeout_secs = 2;
        config.call_timeout_secs = 2;
        config.shutdown_grace_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_call_before_start_fails_fast() {
        let provider = SubprocessProvider::new(SubprocessConfig::new("fs", "true"), None);

        let err = provider.call("read_file", json!({})).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
        assert!(!provider.has_process().await);
        assert_eq!(provider.state(), ProviderState::Uninitialized);
    }

    #[tokio::test]
    async fn test_spawn_failure_degrades() {
        let provider = SubprocessProvider::new(
            SubprocessConfig::new("ghost", "/nonexistent/masterpiece-provider-binary"),
            None,
        );

        let err = provider.start().await.unwrap_err();
        assert!(matches!(err, ProviderError::StartupFailed { .. }));
        assert_eq!(provider.state(), ProviderState::Degraded);
        assert!(!provider.has_process().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_during_handshake() {
        let provider = SubprocessProvider::new(script("quitter", "exit 3"), None);

        let err = provider.start().await.unwrap_err();
        assert!(err.to_string().contains("failed to start"));
        assert_eq!(provider.state(), ProviderState::Degraded);
        assert!(!provider.has_process().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_rejection() {
        let provider = SubprocessProvider::new(
            script(
                "picky",
                r#"read line; echo '{"id":1,"error":{"message":"unsupported protocol"}}'; sleep 5"#,
            ),
            None,
        );

        let err = provider.start().await.unwrap_err();
        assert!(err.to_string().contains("unsupported protocol"));
        assert_eq!(provider.state(), ProviderState::Degraded);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_full_lifecycle_with_error_frame() {
        let body = r#"
read line; echo '{"id":1,"result":{"name":"echo"}}'
read line; echo '{"id":2,"result":{"capabilities":[{"name":"shout","parameters":[{"name":"text","type":"string"}]}]}}'
read line; echo '{"id":3,"result":"HELLO"}'
read line; echo '{"id":4,"error":{"message":"text too long"}}'
read line; exit 0
"#;
        let provider = SubprocessProvider::new(script("echo", body), None);

        provider.start().await.unwrap();
        assert_eq!(provider.state(), ProviderState::Starting);

        let capabilities = provider.discover().await.unwrap();
        assert_eq!(capabilities[0].name, "shout");
        assert_eq!(provider.state(), ProviderState::Ready);

        let value = provider.call("shout", json!({"text": "hello"})).await.unwrap();
        assert_eq!(value, json!("HELLO"));

        let err = provider.call("shout", json!({"text": "x"})).await.unwrap_err();
        assert!(matches!(err, ProviderError::Execution { ref message, .. } if message == "text too long"));
        // Remote failures leave the provider usable
        assert_eq!(provider.state(), ProviderState::Ready);

        provider.stop().await.unwrap();
        assert_eq!(provider.state(), ProviderState::Stopped);
        assert!(!provider.has_process().await);

        // Idempotent
        provider.stop().await.unwrap();
        assert_eq!(provider.state(), ProviderState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_discovery_error_frame_kills_child() {
        let body = r#"
read line; echo '{"id":1,"result":{}}'
read line; echo '{"id":2,"error":{"message":"catalog unavailable"}}'
sleep 30
"#;
        let provider = SubprocessProvider::new(script("no-catalog", body), None);
        provider.start().await.unwrap();
        assert!(provider.pid().await.is_some());

        let err = provider.discover().await.unwrap_err();
        assert!(matches!(err, ProviderError::Execution { ref message, .. } if message == "catalog unavailable"));
        assert_eq!(provider.state(), ProviderState::Degraded);
        assert!(!provider.has_process().await);

        let err = provider.call("anything", json!({})).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mismatched_id_degrades() {
        let body = r#"
read line; echo '{"id":1,"result":{}}'
read line; echo '{"id":2,"result":{"capabilities":[{"name":"x"}]}}'
read line; echo '{"id":99,"result":"stale"}'
sleep 5
"#;
        let provider = SubprocessProvider::new(script("desync", body), None);
        provider.start().await.unwrap();
        provider.discover().await.unwrap();

        let err = provider.call("x", json!({})).await.unwrap_err();
        assert!(matches!(err, ProviderError::Protocol(_)));
        assert_eq!(provider.state(), ProviderState::Degraded);
        assert!(!provider.has_process().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unexpected_exit_stops_provider() {
        let body = r#"
read line; echo '{"id":1,"result":{}}'
read line; echo '{"id":2,"result":{"capabilities":[{"name":"x"}]}}'
read line; exit 1
"#;
        let provider = SubprocessProvider::new(script("crashy", body), None);
        provider.start().await.unwrap();
        provider.discover().await.unwrap();

        let err = provider.call("x", json!({})).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
        assert_eq!(provider.state(), ProviderState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_check_health_notices_exit() {
        let body = r#"read line; echo '{"id":1,"result":{}}'; exit 0"#;
        let provider = SubprocessProvider::new(script("brief", body), None);
        provider.start().await.unwrap();

        let mut state = provider.state();
        for _ in 0..50 {
            state = provider.check_health().await;
            if state == ProviderState::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, ProviderState::Stopped);
        assert!(!provider.has_process().await);
    }

    #[test]
    fn test_absolute_scope() {
        let scope = SubprocessProvider::absolute_scope(Path::new("some/relative/dir")).unwrap();
        assert!(scope.is_absolute());
        assert!(scope.ends_with("some/relative/dir"));
    }
}
