use std::{
    any::Any,
    fs,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::pipeline::PipelineDefinition;
use crate::records::{FailureKind, TaskOutcome};
use crate::step::{RunState, StepError};
use crate::FileId;

/// Pseudo-step usado cuando falla la preparación del directorio de salida.
pub const PREPARE_STEP: &str = "prepare_output";

/// Pedido de ejecución de un archivo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTask {
    /// Ruta tal como la entregó el caller (relativa a `base_path` o absoluta).
    pub file_id: FileId,
    pub base_path: PathBuf,
    /// Directorio raíz de salida de la corrida.
    pub output_root: PathBuf,
}

impl FileTask {
    pub fn new(
        file_id: impl Into<FileId>,
        base_path: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            base_path: base_path.into(),
            output_root: output_root.into(),
        }
    }

    /// Ruta real del archivo (si `file_id` es absoluta, `base_path` se ignora).
    pub fn source_path(&self) -> PathBuf {
        self.base_path.join(&self.file_id)
    }

    /// `false` para ids como `""`, `"."` o `"x/.."`, cuyo directorio de
    /// salida sería la raíz de la corrida.
    pub fn has_file_name(&self) -> bool {
        Path::new(&self.file_id).file_name().is_some()
    }

    pub fn file_name(&self) -> String {
        Path::new(&self.file_id)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.file_id.clone())
    }

    /// Directorio con los artefactos de este archivo: `<output_root>/<nombre>`.
    pub fn out_dir(&self) -> PathBuf {
        self.output_root.join(self.file_name())
    }

    pub fn failure(
        &self,
        step: &str,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> TaskOutcome {
        TaskOutcome::failure(self.file_id.clone(), self.file_name(), step, kind, message)
    }
}

/// Ejecuta el pipeline completo sobre un archivo.
#[derive(Debug, Clone)]
pub struct Executor {
    pipeline: PipelineDefinition,
}

impl Executor {
    pub fn new(pipeline: PipelineDefinition) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.pipeline
    }

    /// Corre todos los steps en orden. El primer step que falla corta la
    /// ejecución de ese archivo y se reporta como `FailureRecord`.
    pub fn execute(&self, task: &FileTask) -> TaskOutcome {
        let started = Instant::now();
        let out_dir = task.out_dir();
        info!(file = %task.file_id, "procesando archivo");

        if !task.has_file_name() {
            error!(file = %task.file_id, "id de archivo sin nombre, no se ejecuta");
            return task.failure(
                PREPARE_STEP,
                FailureKind::UnexpectedError,
                format!("file id '{}' has no file name", task.file_id),
            );
        }

        if let Err(e) = prepare_out_dir(&out_dir) {
            error!(file = %task.file_id, "no se pudo preparar {}: {}", out_dir.display(), e);
            return task.failure(
                PREPARE_STEP,
                FailureKind::UnexpectedError,
                format!("cannot prepare output directory {}: {}", out_dir.display(), e),
            );
        }

        let mut state = RunState::new(task.source_path(), task.file_name(), out_dir);

        for (spec, step) in self.pipeline.steps() {
            state.enter_step(&spec.name);
            debug!(file = %task.file_id, step = %spec.name, "ejecutando step");

            let result = panic::catch_unwind(AssertUnwindSafe(|| step.run(&mut state)));

            let (kind, message) = match result {
                Ok(Ok(())) => continue,
                Ok(Err(StepError::Processing(msg))) => (FailureKind::StepError, msg),
                Ok(Err(StepError::Unexpected(e))) => {
                    (FailureKind::UnexpectedError, format!("{:#}", e))
                }
                Err(payload) => (
                    FailureKind::UnexpectedError,
                    format!("step panicked: {}", panic_message(payload.as_ref())),
                ),
            };

            match kind {
                FailureKind::StepError => warn!(
                    file = %task.file_id, step = %spec.name, "archivo falló: {}", message
                ),
                FailureKind::UnexpectedError => error!(
                    file = %task.file_id, step = %spec.name, "error inesperado: {}", message
                ),
            }
            return task.failure(&spec.name, kind, message);
        }

        info!(
            file = %task.file_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "archivo completado"
        );
        TaskOutcome::Success(state.into_record(task.file_id.clone()))
    }
}

/// Borra artefactos de una corrida anterior y deja el directorio vacío.
fn prepare_out_dir(out_dir: &Path) -> std::io::Result<()> {
    if out_dir.exists() {
        fs::remove_dir_all(out_dir)?;
    }
    fs::create_dir_all(out_dir)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
