// masterpiece command line
//
// Usage:
//     masterpiece check [config.json]
//         Load the configuration, register built-ins, start every provider,
//         build the delegate tree and print the inventory, then shut down.
//
// Providers are stopped when the command ends, fails, or receives Ctrl+C
// (SIGTERM on unix).
//     masterpiece replay <events.json> [config.json]
//         Re-run a recorded session log against the configured tree with
//         scripted reasoning rebuilt from the log, printing each event.

use anyhow::{bail, Context};
use futures::StreamExt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use masterpiece::capability::builtin::register_builtins;
use masterpiece::{
    CapabilityRegistry, DelegateTree, Event, EventBus, EventKind, Orchestrator, ProviderBridge,
    RuntimeConfig, Script, ScriptedReasoning,
};

const USAGE: &str = "usage: masterpiece check [config.json]\n       masterpiece replay <events.json> [config.json]";

fn load_config(path: Option<&str>) -> anyhow::Result<RuntimeConfig> {
    match path {
        Some(path) => {
            dotenvy::dotenv().ok();
            RuntimeConfig::load_from_file(Path::new(path))
                .with_context(|| format!("Failed to load configuration from {}", path))
        }
        None => RuntimeConfig::load().context("Failed to load configuration"),
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Run `work` until it finishes or `signal` fires, then stop every provider
///
/// Providers are torn down on every path, so no child outlives the command.
async fn with_shutdown<W, S>(bridge: &ProviderBridge, work: W, signal: S) -> anyhow::Result<()>
where
    W: Future<Output = anyhow::Result<()>>,
    S: Future<Output = ()>,
{
    let outcome = tokio::select! {
        outcome = work => outcome,
        _ = signal => {
            tracing::info!("Shutdown signal received");
            Err(anyhow::anyhow!("Interrupted"))
        }
    };

    tracing::info!("Shutting down providers");
    bridge.shutdown().await;
    outcome
}

/// Registry with built-ins plus the configured providers, not yet started
async fn assemble(config: &RuntimeConfig, bus: Arc<EventBus>) -> anyhow::Result<ProviderBridge> {
    let registry = Arc::new(CapabilityRegistry::with_event_bus(config.registry.policy, bus.clone()));
    register_builtins(&registry, &config.workspace).await?;

    let bridge = ProviderBridge::from_config(&config.providers, registry, Some(bus)).await?;
    Ok(bridge)
}

async fn start_providers(bridge: &ProviderBridge) {
    for (id, error) in bridge.start_all().await {
        tracing::warn!(provider = %id, "Provider failed to start: {}", error);
    }
}

async fn build_tree(config: &RuntimeConfig, bridge: &ProviderBridge) -> anyhow::Result<DelegateTree> {
    let (root, specs) = config.delegate_specs()?;
    let tree = DelegateTree::build(&root, &specs, bridge.registry()).await?;
    Ok(tree)
}

async fn inventory(config: &RuntimeConfig, bridge: &ProviderBridge) -> anyhow::Result<()> {
    start_providers(bridge).await;
    let tree = build_tree(config, bridge).await;

    println!("Capabilities:");
    for name in bridge.registry().names().await {
        println!("  {}", name);
    }

    let states = bridge.states().await;
    if !states.is_empty() {
        println!("Providers:");
        for id in bridge.ids().await {
            if let Some(state) = states.get(&id) {
                println!("  {} [{}]", id, state);
            }
        }
    }

    let tree = tree?;
    println!("Delegates:");
    for (id, delegate) in tree.iter() {
        println!(
            "  {} ({} capabilities)",
            tree.path_to(id).join(" / "),
            delegate.capabilities().len()
        );
    }
    Ok(())
}

async fn check(config: RuntimeConfig) -> anyhow::Result<()> {
    let bus = Arc::new(EventBus::new());
    let bridge = assemble(&config, bus).await?;
    with_shutdown(&bridge, inventory(&config, &bridge), shutdown_signal()).await
}

async fn run_replay(
    config: &RuntimeConfig,
    bridge: &ProviderBridge,
    bus: Arc<EventBus>,
    recorded: &[Event],
    message: &str,
) -> anyhow::Result<()> {
    start_providers(bridge).await;
    let tree = build_tree(config, bridge).await?;
    let orchestrator = Orchestrator::builder()
        .tree(tree)
        .registry(bridge.registry().clone())
        .reasoners(Script::from_events(recorded).into_reasoners())
        .default_reasoner(Arc::new(ScriptedReasoning::new("replay", [])))
        .config(config.orchestrator.clone())
        .event_bus(bus)
        .build()?;

    let session = orchestrator.create_session("replay").await?;
    let mut events = orchestrator.submit(&session, message).await?;
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

async fn replay(log: PathBuf, config: RuntimeConfig) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&log).with_context(|| format!("Failed to read {:?}", log))?;
    let recorded: Vec<Event> = serde_json::from_str(&content).context("Invalid event log")?;
    let Some(message) = recorded.iter().find_map(|e| match &e.kind {
        EventKind::UserMessage { text } => Some(text.clone()),
        _ => None,
    }) else {
        bail!("Event log has no user message");
    };

    let bus = Arc::new(EventBus::new());
    let bridge = assemble(&config, bus.clone()).await?;
    let work = run_replay(&config, &bridge, bus, &recorded, &message);
    with_shutdown(&bridge, work, shutdown_signal()).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("check") => {
            let config = load_config(args.get(1).map(String::as_str))?;
            check(config).await
        }
        Some("replay") => {
            let Some(log) = args.get(1) else {
                bail!(USAGE);
            };
            let config = load_config(args.get(2).map(String::as_str))?;
            replay(PathBuf::from(log), config).await
        }
        Some("--version") => {
            println!("masterpiece {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(_) => bail!(USAGE),
    }
}
