use anyhow::{bail, Context, Result};
use qc_common::{
    Executor, FailureKind, PipelineDefinition, RunId, RunInfo, StepRegistry, Task,
    TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, TaskId, TaskOutcome,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use reqwest::{Client, StatusCode};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    env,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_WAIT: Duration = Duration::from_secs(2);
const REPORT_RETRY_BASE: Duration = Duration::from_secs(1);
const REPORT_RETRY_MAX: Duration = Duration::from_secs(30);
/// Pipelines de corridas distintas que se guardan a la vez.
const MAX_CACHED_RUNS: usize = 4;

/// Pseudo-step de las tareas cuyo pipeline no se pudo obtener o construir.
pub const LOAD_PIPELINE_STEP: &str = "load_pipeline";
/// Pseudo-step de las tareas cuyo hilo de ejecución terminó mal.
pub const WORKER_STEP: &str = "worker";

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct CachedExecutors {
    by_run: HashMap<RunId, Executor>,
    // orden de llegada, para descartar el más viejo
    order: VecDeque<RunId>,
}

/// Pipelines ya construidos, uno por corrida, hasta `MAX_CACHED_RUNS`.
#[derive(Clone, Default)]
struct ExecutorCache {
    inner: Arc<Mutex<CachedExecutors>>,
}

impl ExecutorCache {
    fn get(&self, run_id: &str) -> Option<Executor> {
        locked(&self.inner).by_run.get(run_id).cloned()
    }

    fn insert(&self, run_id: RunId, executor: Executor) {
        let mut cache = locked(&self.inner);
        if cache.by_run.insert(run_id.clone(), executor).is_none() {
            cache.order.push_back(run_id);
        }
        while cache.order.len() > MAX_CACHED_RUNS {
            if let Some(old) = cache.order.pop_front() {
                cache.by_run.remove(&old);
                debug!("pipeline de la corrida {} fuera de cache", old);
            }
        }
    }
}

#[derive(Default)]
struct RunningSet {
    running: HashSet<TaskId>,
    abandoned: HashSet<TaskId>,
}

/// Tareas que este worker está ejecutando, para reportarlas en el heartbeat.
#[derive(Clone, Default)]
struct RunningTasks {
    inner: Arc<Mutex<RunningSet>>,
}

impl RunningTasks {
    fn start(&self, task_id: &str) {
        locked(&self.inner).running.insert(task_id.to_string());
    }

    /// Saca la tarea del conjunto. Devuelve `true` si el master la había
    /// reasignado mientras corría.
    fn finish(&self, task_id: &str) -> bool {
        let mut set = locked(&self.inner);
        set.running.remove(task_id);
        set.abandoned.remove(task_id)
    }

    /// Lo que se reporta al master: lo que corre y no fue abandonado.
    fn snapshot(&self) -> Vec<TaskId> {
        let set = locked(&self.inner);
        let mut ids: Vec<TaskId> = set.running.difference(&set.abandoned).cloned().collect();
        ids.sort();
        ids
    }

    fn abandon(&self, task_ids: &[TaskId]) {
        let mut set = locked(&self.inner);
        for id in task_ids {
            if set.running.contains(id) {
                warn!("el master reasignó la tarea {}; su resultado se descarta", id);
                set.abandoned.insert(id.clone());
            }
        }
    }
}

#[derive(Clone)]
struct MasterApi {
    client: Client,
    base_url: String,
}

impl MasterApi {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn register(&self, req: &WorkerRegisterRequest) -> Result<WorkerId> {
        let res = self
            .client
            .post(self.url("/api/v1/workers/register"))
            .json(req)
            .send()
            .await
            .context("cannot reach master")?
            .error_for_status()?;
        let WorkerRegisterResponse { worker_id } = res.json().await?;
        Ok(worker_id)
    }

    async fn heartbeat(&self, req: &WorkerHeartbeatRequest) -> Result<WorkerHeartbeatResponse> {
        let res = self
            .client
            .post(self.url("/api/v1/workers/heartbeat"))
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(res.json().await?)
    }

    async fn next_task(&self, worker_id: &str) -> Result<Option<Task>> {
        let res = self
            .client
            .post(self.url("/api/v1/tasks/next"))
            .json(&TaskAssignmentRequest {
                worker_id: worker_id.to_string(),
            })
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            bail!("master does not know worker {}", worker_id);
        }
        let assignment: TaskAssignmentResponse = res.error_for_status()?.json().await?;
        Ok(assignment.task)
    }

    async fn run_info(&self, run_id: &str) -> Result<RunInfo> {
        let res = self
            .client
            .get(self.url(&format!("/api/v1/runs/{}", run_id)))
            .send()
            .await?
            .error_for_status()?;
        Ok(res.json().await?)
    }

    /// `false` si el master ya no esperaba este resultado.
    async fn complete(&self, req: &TaskCompleteRequest) -> Result<bool> {
        let res = self
            .client
            .post(self.url("/api/v1/tasks/complete"))
            .json(req)
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        res.error_for_status()?;
        Ok(true)
    }
}

/// Arma el executor de una corrida a partir de lo que publica el master.
fn executor_for_run(info: &RunInfo, registry: &StepRegistry) -> Result<Executor> {
    let pipeline = PipelineDefinition::build(&info.pipeline, registry)
        .with_context(|| format!("pipeline of run {} does not build", info.id))?;
    Ok(Executor::new(pipeline))
}

/// Ejecuta una tarea y devuelve siempre un resultado para reportar.
async fn execute_task(
    api: &MasterApi,
    cache: &ExecutorCache,
    registry: &StepRegistry,
    task: &Task,
) -> TaskOutcome {
    let executor = match cache.get(&task.run_id) {
        Some(e) => e,
        None => {
            let built = match api.run_info(&task.run_id).await {
                Ok(info) => executor_for_run(&info, registry),
                Err(e) => Err(e),
            };
            match built {
                Ok(e) => {
                    debug!("pipeline de la corrida {} en cache", task.run_id);
                    cache.insert(task.run_id.clone(), e.clone());
                    e
                }
                Err(e) => {
                    warn!(
                        "no se pudo obtener el pipeline de la corrida {}: {:#}",
                        task.run_id, e
                    );
                    return task.file.failure(
                        LOAD_PIPELINE_STEP,
                        FailureKind::UnexpectedError,
                        format!("{:#}", e),
                    );
                }
            }
        }
    };

    let file = task.file.clone();
    match tokio::task::spawn_blocking(move || executor.execute(&file)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("panic o join error en tarea {}: {}", task.id, e);
            task.file.failure(
                WORKER_STEP,
                FailureKind::UnexpectedError,
                format!("worker thread failed: {}", e),
            )
        }
    }
}

/// Espera antes del reintento número `attempt` (desde 0) de un reporte.
fn report_backoff(attempt: u32) -> Duration {
    REPORT_RETRY_BASE
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(REPORT_RETRY_MAX)
}

/// Reporta un resultado hasta que el master lo acepte o lo rechace con 404.
async fn report_with_retry(api: &MasterApi, report: &TaskCompleteRequest) {
    let mut attempt = 0;
    loop {
        match api.complete(report).await {
            Ok(true) => return,
            Ok(false) => {
                warn!("el master descartó el resultado de la tarea {}", report.task_id);
                return;
            }
            Err(e) => {
                let wait = report_backoff(attempt);
                warn!(
                    "no se pudo reportar la tarea {} (intento {}): {:#}; reintento en {:?}",
                    report.task_id,
                    attempt + 1,
                    e,
                    wait
                );
                sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

fn spawn_heartbeat(api: MasterApi, worker_id: WorkerId, running: RunningTasks) {
    tokio::spawn(async move {
        // System para leer CPU y memoria
        let mut sys = System::new_all();
        loop {
            sys.refresh_cpu();
            sys.refresh_memory();

            let req = WorkerHeartbeatRequest {
                worker_id: worker_id.clone(),
                cpu_percent: Some(sys.global_cpu_info().cpu_usage()),
                mem_bytes: Some(sys.used_memory()),
                running: running.snapshot(),
            };
            match api.heartbeat(&req).await {
                Ok(resp) => running.abandon(&resp.abandon),
                Err(e) => warn!("heartbeat falló: {:#}", e),
            }
            sleep(HEARTBEAT_INTERVAL).await;
        }
    });
}

/// Loop principal del worker.
/// - Se registra en el master.
/// - Hace heartbeats periódicos.
/// - Pide tareas mientras tenga "slots" libres.
/// - Ejecuta cada tarea en paralelo (hasta WORKER_CONCURRENCY).
pub async fn run() -> Result<()> {
    let base_url =
        env::var("MASTER_BASE_URL").unwrap_or_else(|_| "http://master:8080".to_string());
    let api = MasterApi {
        client: Client::new(),
        base_url: base_url.trim_end_matches('/').to_string(),
    };

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let max_concurrency: u32 = env::var("WORKER_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_WORKER_CONCURRENCY);

    let worker_id = api
        .register(&WorkerRegisterRequest {
            hostname,
            max_concurrency,
        })
        .await?;

    info!(
        "worker {} registrado con concurrency={} contra {}",
        worker_id, max_concurrency, api.base_url
    );

    let running = RunningTasks::default();
    spawn_heartbeat(api.clone(), worker_id.clone(), running.clone());

    let sem = Arc::new(Semaphore::new(max_concurrency as usize));
    let cache = ExecutorCache::default();
    let registry = Arc::new(StepRegistry::with_builtin_steps());

    loop {
        // --------- Control de concurrencia local ---------
        let permit = sem.clone().acquire_owned().await?;

        let Some(task) = api.next_task(&worker_id).await? else {
            drop(permit);
            debug!("worker {} pidió tarea pero no hay", worker_id);
            sleep(IDLE_WAIT).await;
            continue;
        };

        info!(
            "tengo tarea {} de la corrida {} (archivo={}, intento={})",
            task.id, task.run_id, task.file.file_id, task.attempt
        );

        let api = api.clone();
        let cache = cache.clone();
        let registry = registry.clone();
        let worker_id = worker_id.clone();
        let running = running.clone();

        tokio::spawn(async move {
            running.start(&task.id);
            let outcome = execute_task(&api, &cache, &registry, &task).await;
            if running.finish(&task.id) {
                warn!("tarea {} abandonada, no se reporta", task.id);
                drop(permit);
                return;
            }
            if outcome.is_success() {
                info!("terminé tarea {} correctamente", task.id);
            }

            let report = TaskCompleteRequest {
                task_id: task.id.clone(),
                worker_id,
                outcome,
            };
            report_with_retry(&api, &report).await;

            // liberar el slot al terminar
            drop(permit);
        });
    }
}
