use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::FileId;

/// Clasificación de la falla de un archivo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// El step detectó un problema de dominio (imagen corrupta, formato no soportado...).
    StepError,
    /// Cualquier otra falla: panic, error de IO no previsto, worker perdido.
    UnexpectedError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::StepError => f.write_str("STEP_ERROR"),
            FailureKind::UnexpectedError => f.write_str("UNEXPECTED_ERROR"),
        }
    }
}

/// Resultado de un archivo que completó todo el pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub file_id: FileId,
    pub file_name: String,
    /// Métricas en el orden en que las emitieron los steps.
    pub metrics: IndexMap<String, Value>,
    pub warnings: Vec<String>,
}

/// Falla de un archivo: qué step la produjo y por qué.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub file_id: FileId,
    pub file_name: String,
    pub step: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Lo que produce la ejecución de un `FileTask`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success(ResultRecord),
    Failure(FailureRecord),
}

impl TaskOutcome {
    pub fn file_id(&self) -> &str {
        match self {
            TaskOutcome::Success(r) => &r.file_id,
            TaskOutcome::Failure(f) => &f.file_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }

    pub fn failure(
        file_id: impl Into<FileId>,
        file_name: impl Into<String>,
        step: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        TaskOutcome::Failure(FailureRecord {
            file_id: file_id.into(),
            file_name: file_name.into(),
            step: step.into(),
            kind,
            message: message.into(),
        })
    }
}
