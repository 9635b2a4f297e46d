use std::{
    collections::{HashMap, HashSet},
    env,
    num::NonZeroUsize,
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::ResultAggregator;
use crate::error::{PoolError, RunError, StorageError};
use crate::executor::{Executor, FileTask};
use crate::ledger::ProgressLedger;
use crate::pool::{self, WorkerPool};
use crate::records::{FailureKind, FailureRecord, TaskOutcome};
use crate::run::RunId;
use crate::FileId;

/// Pseudo-step de las fallas detectadas antes de ejecutar el archivo.
pub const SCHEDULE_STEP: &str = "schedule";
pub const DEFAULT_MAX_STORAGE_FAILURES: u32 = 3;
pub const STORAGE_FAILURES_ENV: &str = "QC_MAX_STORAGE_FAILURES";

/// Límite de fallas de escritura seguidas, leído de `QC_MAX_STORAGE_FAILURES`.
pub fn max_storage_failures_from_env() -> u32 {
    env::var(STORAGE_FAILURES_ENV)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_MAX_STORAGE_FAILURES)
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_id: RunId,
    pub output_dir: PathBuf,
    pub base_path: PathBuf,
    pub force: bool,
    pub batch_size: Option<NonZeroUsize>,
    pub max_consecutive_storage_failures: u32,
}

impl RunOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            output_dir: output_dir.into(),
            base_path: PathBuf::new(),
            force: false,
            batch_size: None,
            max_consecutive_storage_failures: max_storage_failures_from_env(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<RunId>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// `None` o `Some(0)` significan sin lotes.
    pub fn with_batch_size(mut self, batch_size: Option<usize>) -> Self {
        self.batch_size = batch_size.and_then(NonZeroUsize::new);
        self
    }
}

/// Lo que quedó de una corrida.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    /// Archivos distintos recibidos.
    pub total: usize,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Ya estaban en `success` en el ledger.
    pub skipped: usize,
    pub failures: Vec<FailureRecord>,
    pub tables: Vec<PathBuf>,
    pub failure_table: PathBuf,
    pub ledger_path: PathBuf,
    /// Archivos cuyo resultado no llegó a quedar en el ledger.
    pub unrecorded: Vec<FileId>,
}

pub type CompletionHook = Box<dyn Fn(&TaskOutcome) + Send + Sync>;

/// Cuenta fallas de escritura seguidas; un éxito vuelve el contador a cero.
#[derive(Debug)]
struct StorageFailures {
    limit: u32,
    consecutive: u32,
}

impl StorageFailures {
    fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            consecutive: 0,
        }
    }

    fn failed(&mut self, err: StorageError) -> Result<(), RunError> {
        self.consecutive += 1;
        error!("falla de escritura ({}/{}): {}", self.consecutive, self.limit, err);
        if self.consecutive >= self.limit {
            return Err(RunError::TooManyStorageFailures {
                count: self.consecutive,
                last: err,
            });
        }
        Ok(())
    }

    fn succeeded(&mut self) {
        self.consecutive = 0;
    }
}

/// Estado mutable de una corrida. Sólo lo toca el loop del scheduler.
struct RunBook {
    ledger: ProgressLedger,
    aggregator: ResultAggregator,
    storage: StorageFailures,
    summary: RunSummary,
}

impl RunBook {
    fn new(opts: &RunOptions, ledger: ProgressLedger, aggregator: ResultAggregator) -> Self {
        Self {
            summary: RunSummary {
                run_id: opts.run_id.clone(),
                total: 0,
                submitted: 0,
                succeeded: 0,
                failed: 0,
                skipped: 0,
                failures: Vec::new(),
                tables: Vec::new(),
                failure_table: PathBuf::new(),
                ledger_path: ledger.path().to_path_buf(),
                unrecorded: Vec::new(),
            },
            ledger,
            aggregator,
            storage: StorageFailures::new(opts.max_consecutive_storage_failures),
        }
    }

    /// Ledger primero; si no se pudo escribir, la fila no va a la tabla.
    fn record(
        &mut self,
        outcome: TaskOutcome,
        hook: Option<&CompletionHook>,
    ) -> Result<(), RunError> {
        if let Some(hook) = hook {
            hook(&outcome);
        }

        match &outcome {
            TaskOutcome::Success(_) => self.summary.succeeded += 1,
            TaskOutcome::Failure(f) => {
                self.summary.failed += 1;
                self.summary.failures.push(f.clone());
            }
        }

        if let Err(e) = self.ledger.record_result(&outcome, &self.summary.run_id) {
            self.summary.unrecorded.push(outcome.file_id().to_string());
            return self.storage.failed(e);
        }

        match self.aggregator.push(outcome) {
            Ok(()) => {
                self.storage.succeeded();
                Ok(())
            }
            Err(e) => self.storage.failed(e),
        }
    }
}

/// Corre un conjunto de archivos sobre un `WorkerPool`, con ledger y tablas.
pub struct Scheduler<P> {
    pool: P,
    options: RunOptions,
    hook: Option<CompletionHook>,
}

impl Scheduler<Box<dyn WorkerPool>> {
    /// Scheduler con pool local: secuencial si `workers <= 1`.
    pub fn local(executor: Executor, workers: usize, options: RunOptions) -> Self {
        Self::new(pool::local_pool(executor, workers), options)
    }
}

impl<P: WorkerPool> Scheduler<P> {
    pub fn new(pool: P, options: RunOptions) -> Self {
        Self {
            pool,
            options,
            hook: None,
        }
    }

    /// Se llama con cada resultado, antes de persistirlo.
    pub fn with_hook(mut self, hook: CompletionHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub async fn run(mut self, files: Vec<FileId>) -> Result<RunSummary, RunError> {
        let opts = self.options.clone();
        info!(
            run = %opts.run_id,
            "corrida con {} archivo(s) en {} (force={}, batch={:?})",
            files.len(),
            opts.output_dir.display(),
            opts.force,
            opts.batch_size
        );

        let ledger = ProgressLedger::open(&opts.output_dir)?;
        let aggregator = ResultAggregator::new(&opts.output_dir, opts.batch_size)?;
        let mut book = RunBook::new(&opts, ledger, aggregator);

        let mut seen: HashSet<FileId> = HashSet::new();
        let mut out_names: HashMap<String, FileId> = HashMap::new();
        let mut queued: Vec<FileTask> = Vec::new();

        for file_id in files {
            if !seen.insert(file_id.clone()) {
                debug!(file = %file_id, "archivo repetido en la entrada, se ignora");
                continue;
            }
            book.summary.total += 1;

            let task = FileTask::new(file_id.clone(), &opts.base_path, &opts.output_dir);
            if !task.has_file_name() {
                warn!(file = %file_id, "id de archivo sin nombre, se rechaza");
                let outcome = task.failure(
                    SCHEDULE_STEP,
                    FailureKind::UnexpectedError,
                    format!("file id '{}' has no file name", file_id),
                );
                book.record(outcome, self.hook.as_ref())?;
                continue;
            }

            let name = task.file_name();
            if let Some(first) = out_names.get(&name) {
                warn!(file = %file_id, "el directorio de salida '{}' ya es de {}", name, first);
                let outcome = task.failure(
                    SCHEDULE_STEP,
                    FailureKind::UnexpectedError,
                    format!("output directory '{}' is already used by {}", name, first),
                );
                book.record(outcome, self.hook.as_ref())?;
                continue;
            }
            out_names.insert(name, file_id.clone());

            if !opts.force && book.ledger.is_already_done(&file_id) {
                book.summary.skipped += 1;
                let previous = book.ledger.entry(&file_id).and_then(|e| e.outcome.clone());
                match previous {
                    Some(TaskOutcome::Success(rec)) => {
                        if let Err(e) = book.aggregator.push_result(rec) {
                            book.storage.failed(e)?;
                        }
                    }
                    _ => warn!(
                        file = %file_id,
                        "entrada del ledger sin resultado, no se copia a la tabla"
                    ),
                }
                continue;
            }

            queued.push(task);
        }

        if book.summary.skipped > 0 {
            info!("{} archivo(s) ya completados, se saltean", book.summary.skipped);
        }

        let mut outstanding: HashSet<FileId> = HashSet::new();
        for task in queued {
            if let Err(e) = book.ledger.record_pending(&task.file_id, &opts.run_id) {
                book.storage.failed(e)?;
            }
            outstanding.insert(task.file_id.clone());
            self.pool.submit(task).await?;
            book.summary.submitted += 1;
        }

        while !outstanding.is_empty() {
            let Some(outcome) = self.pool.next_completion().await else {
                let err = PoolError::Closed(outstanding.len());
                error!("{}", err);
                book.summary.unrecorded.extend(outstanding.drain());
                break;
            };
            if !outstanding.remove(outcome.file_id()) {
                warn!(file = %outcome.file_id(), "resultado duplicado o desconocido, se ignora");
                continue;
            }
            book.record(outcome, self.hook.as_ref())?;
        }

        let aggregate = book.aggregator.finish()?;
        let mut summary = book.summary;
        summary.tables = aggregate.tables;
        summary.failure_table = aggregate.failure_table;
        summary.unrecorded.sort();

        info!(
            run = %summary.run_id,
            "corrida terminada: {} ok, {} con falla, {} salteados",
            summary.succeeded,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }
}
