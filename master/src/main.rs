mod cluster;
mod failover;
mod handlers;
mod state;

use anyhow::{Context, Result};
use qc_common::StepRegistry;
use std::env;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

pub const WORKER_HEARTBEAT_TIMEOUT_SECS: u64 = 20;
pub const FAILOVER_SWEEP_INTERVAL_SECS: u64 = 5;
/// Veces que un archivo puede quedar huérfano por la caída de su worker.
pub const MAX_TASK_ATTEMPTS: u32 = 3;
/// Una tarea en vuelo que ningún heartbeat reporta por este tiempo vuelve a la cola.
pub const TASK_LEASE_SECS: u64 = 60;
/// Corridas terminadas que se siguen pudiendo consultar.
pub const RETAINED_FINISHED_RUNS: usize = 100;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    EnvFilter::new("qc_master=debug,qc_common=info,tower_http=info")
                }),
        )
        .init();

    let state = AppState::new(StepRegistry::with_builtin_steps());

    // router HTTP
    let app = handlers::build_router(state.clone());

    // detección de workers caídos en segundo plano
    let failover_state = state.clone();
    tokio::spawn(async move {
        failover::run_failover_loop(failover_state).await;
    });

    let bind = env::var("MASTER_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("cannot bind {}", bind))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
