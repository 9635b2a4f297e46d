use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineConfig;
use crate::records::FailureRecord;

pub type RunId = String;

/// Pedido de una corrida al master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub name: String,
    pub files: Vec<String>,
    /// Prefijo que se antepone a cada archivo relativo.
    #[serde(default)]
    pub base_path: PathBuf,
    pub output_dir: PathBuf,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Accepted,
    Running,
    Failed,
    Succeeded,
}

impl RunStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Accepted | RunStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: RunId,
    pub name: String,
    pub status: RunStatus,
    pub pipeline: PipelineConfig,
    pub output_dir: PathBuf,

    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub total_files: u32,
    pub completed_files: u32,
    pub failed_files: u32,
    pub skipped_files: u32,

    /// Mensaje del error que abortó la corrida, si lo hubo.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tables: Vec<PathBuf>,
    #[serde(default)]
    pub failure_table: Option<PathBuf>,
}

impl RunInfo {
    pub fn new(id: RunId, req: &RunRequest) -> Self {
        Self {
            id,
            name: req.name.clone(),
            status: RunStatus::Accepted,
            pipeline: req.pipeline.clone(),
            output_dir: req.output_dir.clone(),
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            total_files: req.files.len() as u32,
            completed_files: 0,
            failed_files: 0,
            skipped_files: 0,
            error: None,
            tables: Vec::new(),
            failure_table: None,
        }
    }
}

/// Respuesta de `GET /api/v1/runs/:id/results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResults {
    pub run_id: RunId,
    pub status: RunStatus,
    pub tables: Vec<PathBuf>,
    pub failure_table: Option<PathBuf>,
    pub failures: Vec<FailureRecord>,
}
