use serde::{Deserialize, Serialize};

use crate::executor::FileTask;
use crate::run::RunId;

pub type TaskId = String;

/// Un archivo asignable a un worker remoto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub run_id: RunId,
    pub attempt: u32,
    pub file: FileTask,
}
