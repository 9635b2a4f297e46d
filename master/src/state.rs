// master/src/state.rs

use qc_common::{
    FailureRecord, RunId, RunInfo, StepRegistry, Task, TaskId, TaskOutcome, WorkerId,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct AppState {
    pub runs: Arc<Mutex<HashMap<RunId, RunInfo>>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // tareas pendientes de asignar
    pub tasks_queue: Arc<Mutex<VecDeque<Task>>>,
    // tareas ya asignadas pero no completadas
    pub in_flight: Arc<Mutex<HashMap<TaskId, InFlight>>>,
    // por dónde le llegan los resultados al scheduler de cada corrida activa
    pub completions: Arc<Mutex<HashMap<RunId, mpsc::UnboundedSender<TaskOutcome>>>>,
    pub failures: Arc<Mutex<HashMap<RunId, Vec<FailureRecord>>>>,
    pub registry: Arc<StepRegistry>,
}

impl AppState {
    pub fn new(registry: StepRegistry) -> Self {
        Self {
            runs: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            tasks_queue: Arc::new(Mutex::new(VecDeque::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            completions: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            registry: Arc::new(registry),
        }
    }

    /// Entrega un resultado al scheduler de su corrida.
    /// Devuelve `false` si la corrida ya no está escuchando.
    pub fn deliver(&self, run_id: &str, outcome: TaskOutcome) -> bool {
        let completions = locked(&self.completions);
        match completions.get(run_id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Deja sólo las `keep` corridas terminadas más recientes (y sus fallas).
    /// Devuelve cuántas se borraron.
    pub fn prune_finished_runs(&self, keep: usize) -> usize {
        let mut runs = locked(&self.runs);
        let mut finished: Vec<(RunId, SystemTime)> = runs
            .values()
            .filter(|r| !r.status.is_active())
            .map(|r| {
                let at = r.finished_at.map(SystemTime::from).unwrap_or(SystemTime::UNIX_EPOCH);
                (r.id.clone(), at)
            })
            .collect();
        if finished.len() <= keep {
            return 0;
        }

        finished.sort_by(|a, b| b.1.cmp(&a.1));
        let evicted: Vec<RunId> = finished.split_off(keep).into_iter().map(|(id, _)| id).collect();

        let mut failures = locked(&self.failures);
        for id in &evicted {
            runs.remove(id);
            failures.remove(id);
        }
        evicted.len()
    }
}

/// Toma el lock aunque otro handler haya hecho panic sosteniéndolo.
pub fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn new(hostname: String, max_concurrency: u32) -> Self {
        Self {
            hostname,
            last_heartbeat: SystemTime::now(),
            dead: false,
            max_concurrency,
            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            total_task_time_ms: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub task: Task,
    pub worker_id: WorkerId,
    pub started_at: SystemTime,
    /// Se renueva con cada heartbeat que reporta la tarea en ejecución.
    pub lease_renewed_at: SystemTime,
}

impl InFlight {
    pub fn new(task: Task, worker_id: WorkerId) -> Self {
        let now = SystemTime::now();
        Self {
            task,
            worker_id,
            started_at: now,
            lease_renewed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use qc_common::{FileTask, PipelineConfig, RunRequest, RunStatus};
    use std::path::PathBuf;

    fn run(id: &str, status: RunStatus, finished_mins_ago: i64) -> RunInfo {
        let req = RunRequest {
            name: id.to_string(),
            files: vec![],
            base_path: PathBuf::new(),
            output_dir: PathBuf::from(format!("/out/{}", id)),
            pipeline: PipelineConfig::default(),
            force: false,
            batch_size: None,
        };
        let mut info = RunInfo::new(id.to_string(), &req);
        info.status = status;
        if !status.is_active() {
            info.finished_at = Some(Utc::now() - Duration::minutes(finished_mins_ago));
        }
        info
    }

    #[test]
    fn se_olvidan_las_corridas_terminadas_mas_viejas() {
        let state = AppState::new(StepRegistry::with_builtin_steps());
        for info in [
            run("old", RunStatus::Succeeded, 30),
            run("mid", RunStatus::Failed, 20),
            run("new", RunStatus::Succeeded, 10),
            run("live", RunStatus::Running, 0),
        ] {
            locked(&state.runs).insert(info.id.clone(), info);
        }
        let failure = FileTask::new("a.png", "", "").failure(
            "S",
            qc_common::FailureKind::StepError,
            "x",
        );
        if let TaskOutcome::Failure(f) = failure {
            locked(&state.failures).insert("old".to_string(), vec![f]);
        }

        assert_eq!(state.prune_finished_runs(2), 1);

        let runs = locked(&state.runs);
        assert!(!runs.contains_key("old"));
        assert!(runs.contains_key("mid"));
        assert!(runs.contains_key("new"));
        assert!(runs.contains_key("live"));
        assert!(!locked(&state.failures).contains_key("old"));
    }
}
