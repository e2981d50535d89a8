//! Conduit Relay - serves permission-checked TCP clients from one server.
//!
//! Each TCP connection speaks length-prefixed JSON typed messages and sends
//! remote calls through the `conduit` requester. Clients are identified as
//! `tcp://<peer ip>` and go through the allow-list, the stored decisions and
//! finally an operator prompt before their calls reach the server.

mod backend;
mod policy;
mod prompt;
mod server;

use anyhow::Result;
use clap::Parser;
use conduit_core::permissions::{
    DecisionStore, JsonFileDecisionStore, ManagedRegistry, MemoryDecisionStore,
    TrustedClientsRegistry, UserPrompt, UserPromptingChecker,
};
use conduit_core::{LivenessConfig, PermissionCache, PolicyOrPromptingChecker};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "conduit-relay")]
#[command(about = "Permission-checked client relay for a single server")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging (also shortens the liveness timings)
    #[arg(short, long)]
    debug: bool,

    /// JSON array of allowed origins; reloaded when it changes
    #[arg(long)]
    policy: Option<PathBuf>,

    /// JSON file persisting the clients granted at the prompt
    #[arg(long)]
    decisions: Option<PathBuf>,

    /// JSON object describing known clients
    #[arg(long)]
    trusted_clients: Option<PathBuf>,

    /// Grant every client that reaches the prompt
    #[arg(long, conflicts_with = "auto_deny")]
    auto_grant: bool,

    /// Reject every client that reaches the prompt
    #[arg(long)]
    auto_deny: bool,

    /// Interval between server liveness pings
    #[arg(long)]
    ping_interval_ms: Option<u64>,

    /// Time without a pong after which the server is considered dead
    #[arg(long)]
    ping_timeout_ms: Option<u64>,
}

impl Args {
    fn liveness(&self) -> Result<LivenessConfig> {
        let base = if self.debug {
            LivenessConfig::debug()
        } else {
            LivenessConfig::default()
        };
        let interval = self
            .ping_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(base.interval);
        let timeout = self
            .ping_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(base.timeout);
        Ok(LivenessConfig::new(interval, timeout)?)
    }

    fn prompt(&self) -> Arc<dyn UserPrompt> {
        if self.auto_grant {
            Arc::new(prompt::StaticPrompt::new(true))
        } else if self.auto_deny {
            Arc::new(prompt::StaticPrompt::new(false))
        } else {
            Arc::new(prompt::ConsolePrompt::new())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Conduit Relay");

    let managed = Arc::new(ManagedRegistry::new());
    let _policy_watcher = match &args.policy {
        Some(path) => Some(policy::PolicyWatcher::new(path, Arc::clone(&managed))?),
        None => {
            managed.set_allowed_origins(Vec::<String>::new());
            None
        }
    };

    let trusted = match &args.trusted_clients {
        Some(path) => TrustedClientsRegistry::load_from_file(path)?,
        None => TrustedClientsRegistry::new(),
    };
    info!("Loaded {} trusted client(s)", trusted.len());

    let store: Arc<dyn DecisionStore> = match &args.decisions {
        Some(path) => Arc::new(JsonFileDecisionStore::new(path)),
        None => Arc::new(MemoryDecisionStore::new()),
    };

    let user = UserPromptingChecker::new(Arc::new(trusted), store, args.prompt());
    let checker = Arc::new(PolicyOrPromptingChecker::new(
        Arc::new(PermissionCache::new()),
        managed,
        Arc::new(user),
    ));

    let config = server::RelayConfig {
        host: args.host.clone(),
        port: args.port,
        liveness: args.liveness()?,
    };
    let mut relay =
        server::start_relay(config, Arc::new(backend::DemoBackend::new()), checker).await?;

    // Print port for launchers to read (intentional stdout)
    println!("RELAY_PORT={}", relay.addr().port());

    info!("Relay running on {}", relay.addr());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!(
        "Shutdown signal received, disconnecting {} client(s)",
        relay.client_count()
    );
    relay.shutdown();

    Ok(())
}
