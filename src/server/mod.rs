// src/server/mod.rs

//! Server assembly: binds the listener, builds the shared state, spawns the
//! background routines, and handles graceful shutdown.

use crate::config::Config;
use crate::core::cluster::{NodeRole, announcer, election, monitor};
use crate::core::protocol::MAX_FRAME_LENGTH;
use crate::core::state::ServerState;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{info, warn};

mod listener;
pub mod handlers;

/// Grace period for background routines to drain on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// A running node: shared state plus the set of background tasks.
pub struct ServerHandle {
    pub state: Arc<ServerState>,
    /// The actual announced address (relevant when the configured port was 0).
    pub address: String,
    tasks: JoinSet<()>,
}

impl ServerHandle {
    /// Cancels election activity, signals every background routine, and waits
    /// out the drain deadline before aborting stragglers.
    pub async fn shutdown(mut self) {
        info!("[{}] Shutting down", self.address);
        self.state.cancel_election_activity();
        let _ = self.state.shutdown_tx.send(());

        let drain = async {
            while self.tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
            warn!(
                "[{}] Graceful shutdown deadline exceeded; aborting remaining tasks",
                self.address
            );
        }
        self.tasks.shutdown().await;
        info!("[{}] Shutdown complete", self.address);
    }
}

/// Binds the listener, spawns every background routine, and settles the
/// node's initial role (startup discovery, registration). Returns once the
/// node is serving.
pub async fn start(mut config: Config) -> Result<ServerHandle> {
    let listener = TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;
    // Resolve ephemeral ports before the address is announced anywhere.
    config.port = listener.local_addr()?.port();

    let state = ServerState::initialize(config)?;
    info!(
        "[{}] Serving as {} with max frame size {} bytes",
        state.address,
        state.config.role,
        MAX_FRAME_LENGTH
    );

    let mut tasks = JoinSet::new();
    tasks.spawn(listener::run(
        listener,
        state.clone(),
        state.shutdown_tx.subscribe(),
    ));
    tasks.spawn(monitor::run_health_monitor(
        state.clone(),
        state.shutdown_tx.subscribe(),
    ));
    tasks.spawn(announcer::run(state.clone(), state.shutdown_tx.subscribe()));
    tasks.spawn(monitor::run_cluster_sweep(
        state.clone(),
        state.shutdown_tx.subscribe(),
    ));
    tasks.spawn(monitor::run_score_refresh(
        state.clone(),
        state.shutdown_tx.subscribe(),
    ));
    tasks.spawn(monitor::run_score_reporting(
        state.clone(),
        state.shutdown_tx.subscribe(),
    ));

    bootstrap(&state).await;

    Ok(ServerHandle {
        address: state.address.clone(),
        state,
        tasks,
    })
}

/// Startup discovery and role settling. An already-running master with a term
/// at least ours wins over any configured role.
async fn bootstrap(state: &Arc<ServerState>) {
    info!("[{}] Performing startup master discovery...", state.address);
    if election::active_discovery(state).await {
        {
            let mut el = state.election.lock();
            if el.role == NodeRole::Master {
                info!(
                    "[{}] Active master already present; starting as worker instead",
                    state.address
                );
                el.role = NodeRole::Worker;
            }
        }
        state.registry.set_local_master(false);
        let state = state.clone();
        tokio::spawn(async move {
            monitor::retry_register_with_master(state).await;
        });
        return;
    }

    match state.config.role {
        NodeRole::Master => {
            info!(
                "[{}] No active master found; assuming mastership",
                state.address
            );
            election::become_leader(state, Vec::new()).await;
        }
        _ => {
            if state.current_leader().is_some() {
                let state = state.clone();
                tokio::spawn(async move {
                    monitor::retry_register_with_master(state).await;
                });
            }
        }
    }
}

/// Runs a node until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<()> {
    let handle = start(config).await?;
    await_shutdown_signal().await;
    handle.shutdown().await;
    Ok(())
}

/// Waits for SIGINT/SIGTERM on Unix, Ctrl-C elsewhere.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
            _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received, initiating graceful shutdown.");
    }
}
