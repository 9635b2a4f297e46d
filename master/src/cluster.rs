use async_trait::async_trait;
use qc_common::{FileTask, PoolError, RunId, Task, TaskOutcome, WorkerPool};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::state::{locked, AppState};

/// Pool cuyos workers son procesos remotos.
///
/// `submit` deja la tarea en la cola global del master; los workers la piden
/// por HTTP y los resultados vuelven por el canal registrado para la corrida.
pub struct ClusterPool {
    state: AppState,
    run_id: RunId,
    rx: mpsc::UnboundedReceiver<TaskOutcome>,
    pending: usize,
}

impl ClusterPool {
    pub fn new(state: AppState, run_id: RunId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        locked(&state.completions).insert(run_id.clone(), tx);
        Self {
            state,
            run_id,
            rx,
            pending: 0,
        }
    }
}

#[async_trait]
impl WorkerPool for ClusterPool {
    async fn submit(&mut self, file: FileTask) -> Result<(), PoolError> {
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: self.run_id.clone(),
            attempt: 0,
            file,
        };
        debug!("encolando tarea {} ({})", task.id, task.file.file_id);
        locked(&self.state.tasks_queue).push_back(task);
        self.pending += 1;
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

impl Drop for ClusterPool {
    fn drop(&mut self) {
        locked(&self.state.completions).remove(&self.run_id);

        // si la corrida se abortó, lo que quedó en cola ya no tiene a quién reportar
        let mut queue = locked(&self.state.tasks_queue);
        let before = queue.len();
        queue.retain(|t| t.run_id != self.run_id);
        let dropped = before - queue.len();
        if dropped > 0 {
            info!("corrida {}: {} tarea(s) descartadas de la cola", self.run_id, dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qc_common::{FailureKind, StepRegistry};

    #[tokio::test]
    async fn resultados_vuelven_por_el_canal_de_la_corrida() {
        let state = AppState::new(StepRegistry::with_builtin_steps());
        let mut pool = ClusterPool::new(state.clone(), "run-1".to_string());

        pool.submit(FileTask::new("a.png", "/data", "/out")).await.unwrap();
        let task = locked(&state.tasks_queue).pop_front().unwrap();
        assert_eq!(task.run_id, "run-1");
        assert_eq!(task.attempt, 0);

        let outcome = task.file.failure("S", FailureKind::StepError, "bad");
        assert!(state.deliver("run-1", outcome.clone()));
        assert_eq!(pool.next_completion().await, Some(outcome));
        assert_eq!(pool.next_completion().await, None);
    }

    #[tokio::test]
    async fn al_soltar_el_pool_se_limpia_la_cola() {
        let state = AppState::new(StepRegistry::with_builtin_steps());
        {
            let mut pool = ClusterPool::new(state.clone(), "run-2".to_string());
            pool.submit(FileTask::new("a.png", "/data", "/out")).await.unwrap();
            pool.submit(FileTask::new("b.png", "/data", "/out")).await.unwrap();
        }
        assert!(locked(&state.tasks_queue).is_empty());
        let late = FileTask::new("a.png", "", "").failure("S", FailureKind::StepError, "x");
        assert!(!state.deliver("run-2", late));
    }
}
