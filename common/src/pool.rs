use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error};

use crate::error::PoolError;
use crate::executor::{Executor, FileTask};
use crate::records::{FailureKind, TaskOutcome};

/// Pseudo-step de las fallas que ocurren fuera de un step (hilo caído).
pub const WORKER_STEP: &str = "worker";

/// Ejecuta `FileTask`s y entrega sus resultados en orden de terminación.
///
/// `next_completion` devuelve `None` cuando no queda nada enviado sin
/// resultado (o el pool se cerró).
#[async_trait]
pub trait WorkerPool: Send {
    async fn submit(&mut self, task: FileTask) -> Result<(), PoolError>;
    async fn next_completion(&mut self) -> Option<TaskOutcome>;
}

#[async_trait]
impl<P: WorkerPool + ?Sized> WorkerPool for Box<P> {
    async fn submit(&mut self, task: FileTask) -> Result<(), PoolError> {
        (**self).submit(task).await
    }

    async fn next_completion(&mut self) -> Option<TaskOutcome> {
        (**self).next_completion().await
    }
}

/// Pool local según la cantidad de workers pedida (mínimo 1).
pub fn local_pool(executor: Executor, workers: usize) -> Box<dyn WorkerPool> {
    if workers <= 1 {
        Box::new(SequentialPool::new(executor))
    } else {
        Box::new(LocalPool::new(executor, workers))
    }
}

async fn execute_blocking(executor: Executor, task: FileTask) -> TaskOutcome {
    let for_thread = task.clone();
    match tokio::task::spawn_blocking(move || executor.execute(&for_thread)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(file = %task.file_id, "hilo del worker terminó mal: {}", e);
            task.failure(
                WORKER_STEP,
                FailureKind::UnexpectedError,
                format!("worker thread failed: {}", e),
            )
        }
    }
}

/* --------- N = 1 --------- */

/// Un archivo a la vez, en el orden en que se enviaron.
pub struct SequentialPool {
    executor: Executor,
    queue: VecDeque<FileTask>,
}

impl SequentialPool {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            queue: VecDeque::new(),
        }
    }
}

#[async_trait]
impl WorkerPool for SequentialPool {
    async fn submit(&mut self, task: FileTask) -> Result<(), PoolError> {
        self.queue.push_back(task);
        Ok(())
    }

    async fn next_completion(&mut self) -> Option<TaskOutcome> {
        let task = self.queue.pop_front()?;
        Some(execute_blocking(self.executor.clone(), task).await)
    }
}

/* --------- N > 1 --------- */

/// Hasta `workers` archivos en paralelo, cada uno en su propio hilo bloqueante.
pub struct LocalPool {
    executor: Executor,
    slots: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<TaskOutcome>,
    rx: mpsc::UnboundedReceiver<TaskOutcome>,
    pending: usize,
}

impl LocalPool {
    pub fn new(executor: Executor, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            executor,
            slots: Arc::new(Semaphore::new(workers.max(1))),
            tx,
            rx,
            pending: 0,
        }
    }
}

#[async_trait]
impl WorkerPool for LocalPool {
    async fn submit(&mut self, task: FileTask) -> Result<(), PoolError> {
        let slots = self.slots.clone();
        let executor = self.executor.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let outcome = match slots.acquire_owned().await {
                Ok(_permit) => execute_blocking(executor, task).await,
                Err(e) => task.failure(WORKER_STEP, FailureKind::UnexpectedError, e.to_string()),
            };
            // si el receptor ya no existe la corrida fue abortada
            let _ = tx.send(outcome);
        });

        self.pending += 1;
        debug!("tarea enviada al pool local ({} pendientes)", self.pending);
        Ok(())
    }

    async fn next_completion(&mut self) -> Option<TaskOutcome> {
        if self.pending == 0 {
            return None;
        }
        let outcome = self.rx.recv().await?;
        self.pending -= 1;
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineDefinition;
    use crate::registry::StepRegistry;
    use crate::test_support::{temp_dir, two_step_config, write_gradient_png};

    fn executor() -> Executor {
        let registry = StepRegistry::with_builtin_steps();
        Executor::new(PipelineDefinition::build(&two_step_config(), &registry).unwrap())
    }

    async fn drain(pool: &mut dyn WorkerPool) -> Vec<TaskOutcome> {
        let mut out = Vec::new();
        while let Some(o) = pool.next_completion().await {
            out.push(o);
        }
        out
    }

    #[tokio::test]
    async fn secuencial_respeta_el_orden_de_envio() {
        let dir = temp_dir("pool_sequential");
        for name in ["a.png", "b.png", "c.png"] {
            write_gradient_png(&dir, name, 6, 3);
        }

        let mut pool = SequentialPool::new(executor());
        for name in ["c.png", "a.png", "b.png"] {
            pool.submit(FileTask::new(name, &dir, dir.join("out"))).await.unwrap();
        }

        let ids: Vec<String> = drain(&mut pool)
            .await
            .iter()
            .map(|o| o.file_id().to_string())
            .collect();
        assert_eq!(ids, vec!["c.png", "a.png", "b.png"]);
    }

    #[tokio::test]
    async fn pool_local_entrega_un_resultado_por_tarea() {
        let dir = temp_dir("pool_local");
        let names: Vec<String> = (0..6).map(|i| format!("f{}.png", i)).collect();
        for name in &names {
            write_gradient_png(&dir, name, 8, 4);
        }

        let mut pool = local_pool(executor(), 3);
        for name in &names {
            pool.submit(FileTask::new(name.clone(), &dir, dir.join("out"))).await.unwrap();
        }

        let outcomes = drain(pool.as_mut()).await;
        assert_eq!(outcomes.len(), names.len());
        assert!(outcomes.iter().all(|o| o.is_success()));

        let mut ids: Vec<&str> = outcomes.iter().map(|o| o.file_id()).collect();
        ids.sort();
        let mut expected: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn pool_vacio_no_bloquea() {
        let mut pool = LocalPool::new(executor(), 2);
        assert!(pool.next_completion().await.is_none());
    }
}
