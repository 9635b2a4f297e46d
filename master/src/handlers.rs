use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use qc_common::{
    CompletionHook, PipelineBuildError, PipelineDefinition, RunError, RunInfo, RunOptions,
    RunRequest, RunResults, RunStatus, RunSummary, Scheduler, TaskAssignmentRequest,
    TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse, TaskId, TaskOutcome,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::cluster::ClusterPool;
use crate::state::{locked, AppState, InFlight, WorkerMeta};
use crate::RETAINED_FINISHED_RUNS;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/runs", post(create_run))
        .route("/api/v1/runs/:id", get(get_run))
        .route("/api/v1/runs/:id/results", get(get_run_results))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/complete", post(complete_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Cuerpo de las respuestas de error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<PipelineBuildError>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn api_error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: msg.into(),
            build: None,
        }),
    )
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Valida el pipeline, registra la corrida y lanza su scheduler
pub async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> ApiResult<RunInfo> {
    if let Err(e) = PipelineDefinition::build(&req.pipeline, &state.registry) {
        warn!("corrida '{}' rechazada: {}", req.name, e);
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError {
                error: e.to_string(),
                build: Some(e),
            }),
        ));
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let info = RunInfo::new(run_id.clone(), &req);

    {
        let mut runs = locked(&state.runs);
        if let Some(other) = runs
            .values()
            .find(|r| r.status.is_active() && r.output_dir == req.output_dir)
        {
            return Err(api_error(
                StatusCode::CONFLICT,
                format!(
                    "output directory {} is in use by active run {}",
                    req.output_dir.display(),
                    other.id
                ),
            ));
        }
        runs.insert(run_id.clone(), info.clone());
    }

    info!(
        "corrida {} ('{}') aceptada con {} archivo(s)",
        run_id,
        req.name,
        req.files.len()
    );

    let options = RunOptions::new(req.output_dir.clone())
        .with_run_id(run_id.clone())
        .with_base_path(req.base_path.clone())
        .with_force(req.force)
        .with_batch_size(req.batch_size);
    let pool = ClusterPool::new(state.clone(), run_id.clone());
    let scheduler =
        Scheduler::new(pool, options).with_hook(live_counters(state.clone(), run_id.clone()));

    let run_state = state.clone();
    tokio::spawn(async move {
        {
            let mut runs = locked(&run_state.runs);
            if let Some(run) = runs.get_mut(&run_id) {
                run.status = RunStatus::Running;
                run.started_at = Some(Utc::now());
            }
        }
        let result = scheduler.run(req.files).await;
        finish_run(&run_state, &run_id, result);
    });

    Ok(Json(info))
}

/// Contadores en vivo de la corrida, actualizados con cada resultado.
fn live_counters(state: AppState, run_id: String) -> CompletionHook {
    Box::new(move |outcome: &TaskOutcome| {
        if let Some(run) = locked(&state.runs).get_mut(&run_id) {
            run.completed_files += 1;
            if !outcome.is_success() {
                run.failed_files += 1;
            }
        }
        if let TaskOutcome::Failure(f) = outcome {
            locked(&state.failures)
                .entry(run_id.clone())
                .or_default()
                .push(f.clone());
        }
    })
}

fn finish_run(state: &AppState, run_id: &str, result: Result<RunSummary, RunError>) {
    record_finish(state, run_id, result);

    let evicted = state.prune_finished_runs(RETAINED_FINISHED_RUNS);
    if evicted > 0 {
        info!("{} corrida(s) terminadas viejas descartadas", evicted);
    }
}

fn record_finish(state: &AppState, run_id: &str, result: Result<RunSummary, RunError>) {
    let mut runs = locked(&state.runs);
    let Some(run) = runs.get_mut(run_id) else {
        return;
    };
    run.finished_at = Some(Utc::now());

    match result {
        Ok(summary) => {
            run.status = RunStatus::Succeeded;
            run.total_files = summary.total as u32;
            run.completed_files = (summary.succeeded + summary.failed) as u32;
            run.failed_files = summary.failed as u32;
            run.skipped_files = summary.skipped as u32;
            run.tables = summary.tables;
            run.failure_table = Some(summary.failure_table);
            info!(
                "corrida {} terminada: {} ok, {} con falla, {} salteados",
                run_id, summary.succeeded, summary.failed, summary.skipped
            );
        }
        Err(e) => {
            error!("corrida {} abortada: {}", run_id, e);
            run.status = RunStatus::Failed;
            run.error = Some(e.to_string());
        }
    }
}

// Devuelve info básica de una corrida
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<RunInfo> {
    locked(&state.runs)
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown run {}", id)))
}

// Tablas de salida y fallas de una corrida
pub async fn get_run_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<RunResults> {
    let run = locked(&state.runs)
        .get(&id)
        .cloned()
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown run {}", id)))?;

    let failures = locked(&state.failures).get(&id).cloned().unwrap_or_default();

    Ok(Json(RunResults {
        run_id: run.id,
        status: run.status,
        tables: run.tables,
        failure_table: run.failure_table,
        failures,
    }))
}

// Registra un worker nuevo
pub async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();
    let max_concurrency = req.max_concurrency.max(1);

    let meta = WorkerMeta::new(req.hostname, max_concurrency);
    locked(&state.workers).insert(worker_id.clone(), meta);

    info!("worker registrado: {} (max_concurrency={})", worker_id, max_concurrency);
    Json(WorkerRegisterResponse { worker_id })
}

// Heartbeat de worker
pub async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> ApiResult<WorkerHeartbeatResponse> {
    let now = SystemTime::now();
    {
        let mut workers = locked(&state.workers);
        let Some(meta) = workers.get_mut(&req.worker_id) else {
            return Err(api_error(
                StatusCode::NOT_FOUND,
                format!("unknown worker {}", req.worker_id),
            ));
        };

        if meta.dead {
            info!("worker {} volvió a dar señales de vida", req.worker_id);
            meta.dead = false;
        }
        meta.last_heartbeat = now;
        meta.last_cpu_percent = req.cpu_percent;
        meta.last_mem_bytes = req.mem_bytes;
    }

    let abandon = reconcile_running(&state, &req.worker_id, &req.running, now);
    Ok(Json(WorkerHeartbeatResponse { ok: true, abandon }))
}

/// Cruza lo que el worker dice estar ejecutando con lo que el master le asignó.
///
/// - propia y en vuelo: se renueva el lease
/// - reencolada y todavía sin asignar: vuelve a ser del worker
/// - de otro worker o desconocida: el worker debe abandonarla
fn reconcile_running(
    state: &AppState,
    worker_id: &str,
    running: &[TaskId],
    now: SystemTime,
) -> Vec<TaskId> {
    let mut abandon = Vec::new();
    let mut in_flight = locked(&state.in_flight);

    for task_id in running {
        match in_flight.get_mut(task_id) {
            Some(entry) if entry.worker_id == worker_id => entry.lease_renewed_at = now,
            Some(entry) => {
                warn!(
                    "worker {} sigue con la tarea {}, que ahora es de {}",
                    worker_id, task_id, entry.worker_id
                );
                abandon.push(task_id.clone());
            }
            None => {
                let mut queue = locked(&state.tasks_queue);
                let position = queue.iter().position(|t| &t.id == task_id);
                match position.and_then(|pos| queue.remove(pos)) {
                    Some(task) => {
                        info!("tarea {} reencolada vuelve al worker {}", task_id, worker_id);
                        let entry = InFlight::new(task, worker_id.to_string());
                        in_flight.insert(task_id.clone(), entry);
                    }
                    None => abandon.push(task_id.clone()),
                }
            }
        }
    }
    abandon
}

// Asigna la siguiente tarea en cola (si hay)
pub async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> ApiResult<TaskAssignmentResponse> {
    // 1) Capacidad máxima de este worker
    let max_for_worker: u32 = match locked(&state.workers).get(&req.worker_id) {
        Some(meta) if !meta.dead => meta.max_concurrency,
        Some(_) => return Ok(Json(TaskAssignmentResponse { task: None })),
        None => {
            return Err(api_error(
                StatusCode::NOT_FOUND,
                format!("unknown worker {}", req.worker_id),
            ))
        }
    };

    // 2) Cuántas tareas tiene ya en vuelo; con el lock tomado hasta registrar la nueva
    let mut in_flight = locked(&state.in_flight);
    let active_for_worker = in_flight
        .values()
        .filter(|entry| entry.worker_id == req.worker_id)
        .count() as u32;

    if active_for_worker >= max_for_worker {
        info!(
            "worker {} pidió tarea pero ya tiene {}/{} en vuelo",
            req.worker_id, active_for_worker, max_for_worker
        );
        return Ok(Json(TaskAssignmentResponse { task: None }));
    }

    // 3) Sacar la siguiente tarea de la cola global
    let Some(task) = locked(&state.tasks_queue).pop_front() else {
        return Ok(Json(TaskAssignmentResponse { task: None }));
    };

    info!(
        "asignando tarea {} (corrida={}, archivo={}, intento={}) al worker {} ({}/{} en vuelo)",
        task.id,
        task.run_id,
        task.file.file_id,
        task.attempt,
        req.worker_id,
        active_for_worker,
        max_for_worker,
    );

    in_flight.insert(task.id.clone(), InFlight::new(task.clone(), req.worker_id.clone()));
    drop(in_flight);

    if let Some(meta) = locked(&state.workers).get_mut(&req.worker_id) {
        meta.tasks_started += 1;
    }

    Ok(Json(TaskAssignmentResponse { task: Some(task) }))
}

// Worker reporta el resultado de una tarea
pub async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> ApiResult<TaskCompleteResponse> {
    // sólo cuenta si la tarea sigue en vuelo para ese mismo worker
    let inflight = {
        let mut in_flight = locked(&state.in_flight);
        let owned = in_flight
            .get(&req.task_id)
            .map(|entry| entry.worker_id == req.worker_id)
            .unwrap_or(false);
        if owned {
            in_flight.remove(&req.task_id)
        } else {
            None
        }
    };

    let Some(inflight) = inflight else {
        warn!(
            "resultado tardío o desconocido para tarea {} (worker {}), se ignora",
            req.task_id, req.worker_id
        );
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("task {} is not in flight", req.task_id),
        ));
    };

    let duration_ms: u64 = inflight
        .started_at
        .elapsed()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    if let Some(meta) = locked(&state.workers).get_mut(&req.worker_id) {
        meta.total_task_time_ms += duration_ms;
        if req.outcome.is_success() {
            meta.tasks_succeeded += 1;
        } else {
            meta.tasks_failed += 1;
        }
    }

    let run_id = inflight.task.run_id;
    if !state.deliver(&run_id, req.outcome) {
        warn!("la corrida {} ya no espera resultados (tarea {})", run_id, req.task_id);
    }

    Ok(Json(TaskCompleteResponse { ok: true }))
}

pub async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    let now = SystemTime::now();

    // Contar tareas activas por worker (desde in_flight)
    let mut active_by_worker: HashMap<WorkerId, u32> = HashMap::new();
    for inf in locked(&state.in_flight).values() {
        *active_by_worker.entry(inf.worker_id.clone()).or_insert(0) += 1;
    }

    let workers = locked(&state.workers);
    let mut out = Vec::with_capacity(workers.len());

    for (wid, meta) in workers.iter() {
        let age_secs = now
            .duration_since(meta.last_heartbeat)
            .unwrap_or_default()
            .as_secs();

        let finished = meta.tasks_succeeded + meta.tasks_failed;
        let avg_ms = if finished > 0 {
            Some(meta.total_task_time_ms as f64 / finished as f64)
        } else {
            None
        };

        out.push(WorkerMetrics {
            worker_id: wid.clone(),
            hostname: meta.hostname.clone(),
            dead: meta.dead,
            max_concurrency: meta.max_concurrency,
            last_heartbeat_secs_ago: age_secs,
            active_tasks: active_by_worker.get(wid).copied().unwrap_or(0),
            tasks_started: meta.tasks_started,
            tasks_succeeded: meta.tasks_succeeded,
            tasks_failed: meta.tasks_failed,
            avg_task_ms: avg_ms,
            cpu_percent: meta.last_cpu_percent,
            mem_bytes: meta.last_mem_bytes,
        });
    }

    out.sort_by(|a, b| a.hostname.cmp(&b.hostname).then(a.worker_id.cmp(&b.worker_id)));
    Json(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::{sweep_once, SweepLimits};
    use image::{GrayImage, Luma};
    use qc_common::{Executor, FailureKind, FileTask, PipelineConfig, RunId, StepRegistry, Task};
    use std::{fs, path::PathBuf, time::Duration};

    fn scratch(sub: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("qc_master_tests_{}", std::process::id()))
            .join(sub);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn state() -> AppState {
        AppState::new(StepRegistry::with_builtin_steps())
    }

    fn request(dir: &std::path::Path, files: &[&str], pipeline: PipelineConfig) -> RunRequest {
        RunRequest {
            name: "test".to_string(),
            files: files.iter().map(|s| s.to_string()).collect(),
            base_path: dir.to_path_buf(),
            output_dir: dir.join("out"),
            pipeline,
            force: false,
            batch_size: None,
        }
    }

    async fn register(state: &AppState, max_concurrency: u32) -> WorkerId {
        let Json(resp) = register_worker(
            State(state.clone()),
            Json(WorkerRegisterRequest {
                hostname: "test-host".to_string(),
                max_concurrency,
            }),
        )
        .await;
        resp.worker_id
    }

    async fn next(state: &AppState, worker_id: &str) -> Option<Task> {
        let Json(resp) = assign_task(
            State(state.clone()),
            Json(TaskAssignmentRequest {
                worker_id: worker_id.to_string(),
            }),
        )
        .await
        .unwrap();
        resp.task
    }

    async fn heartbeat(
        state: &AppState,
        worker_id: &str,
        running: &[&str],
    ) -> WorkerHeartbeatResponse {
        let Json(resp) = worker_heartbeat(
            State(state.clone()),
            Json(WorkerHeartbeatRequest {
                worker_id: worker_id.to_string(),
                cpu_percent: None,
                mem_bytes: None,
                running: running.iter().map(|s| s.to_string()).collect(),
            }),
        )
        .await
        .unwrap();
        resp
    }

    async fn complete(
        state: &AppState,
        worker_id: &str,
        task_id: &str,
    ) -> ApiResult<TaskCompleteResponse> {
        let outcome = FileTask::new("a.png", "", "").failure("S", FailureKind::StepError, "x");
        complete_task(
            State(state.clone()),
            Json(TaskCompleteRequest {
                task_id: task_id.to_string(),
                worker_id: worker_id.to_string(),
                outcome,
            }),
        )
        .await
    }

    fn enqueue(state: &AppState, id: &str) {
        locked(&state.tasks_queue).push_back(Task {
            id: id.to_string(),
            run_id: "r".to_string(),
            attempt: 0,
            file: FileTask::new(format!("{}.png", id), "", ""),
        });
    }

    /// El worker deja de mandar heartbeats y pasa una pasada de failover.
    fn lose_contact(state: &AppState, worker_id: &str) {
        if let Some(meta) = locked(&state.workers).get_mut(worker_id) {
            meta.last_heartbeat = SystemTime::now() - Duration::from_secs(600);
        }
        sweep_once(state, SystemTime::now(), SweepLimits::default());
    }

    async fn status(state: &AppState, id: &RunId) -> RunStatus {
        let Json(info) = get_run(State(state.clone()), Path(id.clone())).await.unwrap();
        info.status
    }

    #[tokio::test]
    async fn pipeline_invalido_devuelve_400_con_todos_los_errores() {
        let dir = scratch("handlers_bad_pipeline");
        let pipeline = PipelineConfig::from_json_str(
            r#"{"steps":[{"name":"Nope.a"},{"name":"BasicModule.getBasicStats"},{"name":"Nope.b"}]}"#,
        )
        .unwrap();

        let req = request(&dir, &["a.png"], pipeline);
        let (code, Json(body)) = create_run(State(state()), Json(req)).await.unwrap_err();
        assert_eq!(code, StatusCode::BAD_REQUEST);
        let json = serde_json::to_value(&body).unwrap();
        assert!(json["build"]["Unresolved"].is_array());
        match body.build {
            Some(PipelineBuildError::Unresolved(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("se esperaba la lista de errores: {:?}", other),
        }
    }

    #[tokio::test]
    async fn mismo_directorio_de_salida_activo_devuelve_409() {
        let dir = scratch("handlers_conflict");
        let st = state();
        let req = request(&dir, &["a.png"], PipelineConfig::template("basic").unwrap());

        let mut busy = RunInfo::new("other".to_string(), &req);
        busy.status = RunStatus::Running;
        locked(&st.runs).insert(busy.id.clone(), busy);

        let err = create_run(State(st), Json(req)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn tarea_desconocida_devuelve_404() {
        let st = state();
        let worker_id = register(&st, 1).await;
        let err = complete(&st, &worker_id, "nope").await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn asignacion_respeta_max_concurrency() {
        let st = state();
        let worker_id = register(&st, 1).await;
        enqueue(&st, "a");
        enqueue(&st, "b");

        assert!(next(&st, &worker_id).await.is_some());
        assert!(next(&st, &worker_id).await.is_none());
        assert_eq!(locked(&st.tasks_queue).len(), 1);
    }

    #[tokio::test]
    async fn corrida_completa_con_un_worker_simulado() {
        let dir = scratch("handlers_end_to_end");
        GrayImage::from_fn(8, 4, |x, _| Luma([(x * 30) as u8]))
            .save(dir.join("a.png"))
            .unwrap();
        fs::write(dir.join("b.png"), b"corrupt").unwrap();

        let st = state();
        let pipeline = PipelineConfig::template("basic").unwrap();
        let req = request(&dir, &["a.png", "b.png"], pipeline.clone());
        let Json(info) = create_run(State(st.clone()), Json(req)).await.unwrap();
        let worker_id = register(&st, 2).await;
        let executor = Executor::new(PipelineDefinition::build(&pipeline, &st.registry).unwrap());

        for _ in 0..500 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Some(task) = next(&st, &worker_id).await {
                let outcome = executor.execute(&task.file);
                complete_task(
                    State(st.clone()),
                    Json(TaskCompleteRequest {
                        task_id: task.id,
                        worker_id: worker_id.clone(),
                        outcome,
                    }),
                )
                .await
                .unwrap();
            }
            if !status(&st, &info.id).await.is_active() {
                break;
            }
        }

        assert_eq!(status(&st, &info.id).await, RunStatus::Succeeded);
        let Json(results) = get_run_results(State(st.clone()), Path(info.id.clone()))
            .await
            .unwrap();
        assert_eq!(results.tables, vec![dir.join("out").join("results.tsv")]);
        assert_eq!(results.failures.len(), 1);
        assert_eq!(results.failures[0].file_id, "b.png");

        let Json(run) = get_run(State(st), Path(info.id)).await.unwrap();
        assert_eq!(run.completed_files, 2);
        assert_eq!(run.failed_files, 1);
    }

    #[tokio::test]
    async fn worker_revivido_recupera_su_tarea_y_no_se_asigna_dos_veces() {
        let st = state();
        let a = register(&st, 2).await;
        let b = register(&st, 2).await;
        enqueue(&st, "t-1");
        assert_eq!(next(&st, &a).await.unwrap().id, "t-1");

        lose_contact(&st, &a);
        assert_eq!(locked(&st.tasks_queue).len(), 1);

        // a vuelve y sigue ejecutando t-1
        let resp = heartbeat(&st, &a, &["t-1"]).await;
        assert!(resp.abandon.is_empty());
        assert!(locked(&st.tasks_queue).is_empty());
        assert!(next(&st, &b).await.is_none());
        assert_eq!(locked(&st.in_flight)["t-1"].worker_id, a);

        assert!(complete(&st, &a, "t-1").await.is_ok());
    }

    #[tokio::test]
    async fn tarea_reasignada_se_abandona_en_el_worker_revivido() {
        let st = state();
        let a = register(&st, 2).await;
        let b = register(&st, 2).await;
        enqueue(&st, "t-1");
        next(&st, &a).await.unwrap();

        lose_contact(&st, &a);
        let retry = next(&st, &b).await.unwrap();
        assert_eq!(retry.id, "t-1");
        assert_eq!(retry.attempt, 1);

        let resp = heartbeat(&st, &a, &["t-1"]).await;
        assert_eq!(resp.abandon, vec!["t-1".to_string()]);
        assert_eq!(locked(&st.in_flight)["t-1"].worker_id, b);

        let late = complete(&st, &a, "t-1").await.unwrap_err();
        assert_eq!(late.0, StatusCode::NOT_FOUND);
        assert!(complete(&st, &b, "t-1").await.is_ok());
    }

    #[tokio::test]
    async fn heartbeat_renueva_el_lease_de_lo_que_sigue_corriendo() {
        let st = state();
        let a = register(&st, 2).await;
        enqueue(&st, "t-1");
        enqueue(&st, "t-2");
        next(&st, &a).await.unwrap();
        next(&st, &a).await.unwrap();

        let stale = SystemTime::now() - Duration::from_secs(600);
        for entry in locked(&st.in_flight).values_mut() {
            entry.lease_renewed_at = stale;
        }

        // el resultado de t-2 se perdió: el worker ya no la reporta
        let resp = heartbeat(&st, &a, &["t-1"]).await;
        assert!(resp.abandon.is_empty());
        sweep_once(&st, SystemTime::now(), SweepLimits::default());

        assert!(!locked(&st.workers)[&a].dead);
        assert!(locked(&st.in_flight).contains_key("t-1"));
        let queue = locked(&st.tasks_queue);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, "t-2");
    }
}
