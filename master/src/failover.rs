use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use qc_common::{FailureKind, Task};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::state::{locked, AppState};
use crate::{
    FAILOVER_SWEEP_INTERVAL_SECS, MAX_TASK_ATTEMPTS, TASK_LEASE_SECS,
    WORKER_HEARTBEAT_TIMEOUT_SECS,
};

/// Pseudo-step de los archivos cuyo worker desapareció demasiadas veces.
pub const WORKER_LOST_STEP: &str = "worker";

/// Plazos que usa cada pasada.
#[derive(Debug, Clone, Copy)]
pub struct SweepLimits {
    /// Sin heartbeat por más de esto, el worker se da por muerto.
    pub heartbeat_timeout: Duration,
    /// Una tarea en vuelo sin renovar por más de esto se reencola.
    pub lease: Duration,
}

impl Default for SweepLimits {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(WORKER_HEARTBEAT_TIMEOUT_SECS),
            lease: Duration::from_secs(TASK_LEASE_SECS),
        }
    }
}

/// Loop principal de tolerancia a fallos:
/// - detecta workers muertos (sin heartbeat)
/// - detecta tareas cuyo lease venció
/// - reencola esas tareas o las da por perdidas
pub async fn run_failover_loop(state: AppState) {
    let limits = SweepLimits::default();
    loop {
        sleep(Duration::from_secs(FAILOVER_SWEEP_INTERVAL_SECS)).await;
        sweep_once(&state, SystemTime::now(), limits);
    }
}

fn expired(now: SystemTime, since: SystemTime, limit: Duration) -> Option<Duration> {
    // marcas en el futuro no vencen
    now.duration_since(since).ok().filter(|elapsed| *elapsed > limit)
}

/// Una pasada de chequeo:
/// 1. marca workers muertos
/// 2. saca de in_flight las tareas de esos workers y las de lease vencido
/// 3. las reencola si no superan MAX_TASK_ATTEMPTS; si no, entrega un
///    UNEXPECTED_ERROR a la corrida
pub fn sweep_once(state: &AppState, now: SystemTime, limits: SweepLimits) {
    // 1) Detectar qué workers están muertos
    let mut newly_dead: HashSet<String> = HashSet::new();
    {
        let mut workers = locked(&state.workers);
        for (worker_id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            if let Some(elapsed) = expired(now, meta.last_heartbeat, limits.heartbeat_timeout) {
                meta.dead = true;
                newly_dead.insert(worker_id.clone());
                warn!(
                    "marcando worker {} como DEAD (sin heartbeat hace {:?})",
                    worker_id, elapsed
                );
            }
        }
    }

    // 2) Sacar de in_flight lo huérfano
    let mut orphaned: Vec<(Task, String)> = Vec::new();
    locked(&state.in_flight).retain(|task_id, inflight| {
        if newly_dead.contains(&inflight.worker_id) {
            orphaned.push((inflight.task.clone(), inflight.worker_id.clone()));
            return false;
        }
        if let Some(elapsed) = expired(now, inflight.lease_renewed_at, limits.lease) {
            warn!(
                "tarea {} sin renovar hace {:?} en el worker {}, se recupera",
                task_id, elapsed, inflight.worker_id
            );
            orphaned.push((inflight.task.clone(), inflight.worker_id.clone()));
            return false;
        }
        true
    });

    // 3) Reencolar o dar por perdido
    for (mut task, worker_id) in orphaned {
        if task.attempt + 1 < MAX_TASK_ATTEMPTS {
            task.attempt += 1;
            info!(
                "reencolando tarea {} ({}) que tenía el worker {} (intento={})",
                task.id, task.file.file_id, worker_id, task.attempt
            );
            locked(&state.tasks_queue).push_back(task);
        } else {
            warn!(
                "tarea {} ({}) agotó {} intentos; último worker {}",
                task.id, task.file.file_id, MAX_TASK_ATTEMPTS, worker_id
            );
            let outcome = task.file.failure(
                WORKER_LOST_STEP,
                FailureKind::UnexpectedError,
                format!("worker lost after {} attempt(s)", task.attempt + 1),
            );
            if !state.deliver(&task.run_id, outcome) {
                warn!("la corrida {} ya no espera resultados", task.run_id);
            }
        }
    }
}
