use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StorageError;
use crate::records::TaskOutcome;
use crate::run::RunId;
use crate::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Pending,
    Success,
    Failed,
}

/// Una línea del ledger.
///
/// Las entradas de cierre llevan el resultado completo del archivo, así el
/// estado y la fila de la tabla quedan escritos en una sola operación.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub file_id: FileId,
    pub status: LedgerStatus,
    pub timestamp: DateTime<Utc>,
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskOutcome>,
}

/// Registro durable del avance de cada archivo entre corridas.
///
/// Es un log JSONL de sólo agregado: la última entrada de cada archivo manda.
/// Lo escribe un único dueño (el loop del scheduler).
#[derive(Debug)]
pub struct ProgressLedger {
    path: PathBuf,
    file: File,
    entries: HashMap<FileId, LedgerEntry>,
}

impl ProgressLedger {
    pub const FILE_NAME: &'static str = "ledger.jsonl";

    /// Abre (o crea) el ledger dentro de `dir`, reproduciendo lo que ya tenga.
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
        let path = dir.join(Self::FILE_NAME);

        let entries = if path.exists() {
            Self::load(&path)?
        } else {
            HashMap::new()
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;

        // si la última línea quedó cortada, la cerramos para no pegarle la siguiente
        if ends_without_newline(&path).map_err(|e| StorageError::io(&path, e))? {
            file.write_all(b"\n").map_err(|e| StorageError::io(&path, e))?;
        }

        if !entries.is_empty() {
            info!("ledger {} con {} archivo(s) registrados", path.display(), entries.len());
        }

        Ok(Self {
            path,
            file,
            entries,
        })
    }

    /// Lee un ledger y devuelve el último estado de cada archivo.
    ///
    /// Las líneas que no se pueden parsear (por ejemplo, una escritura cortada
    /// por un crash) se saltean con un warning.
    pub fn load(path: &Path) -> Result<HashMap<FileId, LedgerEntry>, StorageError> {
        let file = File::open(path).map_err(|e| StorageError::io(path, e))?;
        let reader = BufReader::new(file);
        let mut out: HashMap<FileId, LedgerEntry> = HashMap::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| StorageError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(&line) {
                Ok(entry) => {
                    out.insert(entry.file_id.clone(), entry);
                }
                Err(e) => warn!(
                    "ledger {}: línea {} ilegible, se ignora ({})",
                    path.display(),
                    idx + 1,
                    e
                ),
            }
        }

        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self, file_id: &str) -> Option<LedgerStatus> {
        self.entries.get(file_id).map(|e| e.status)
    }

    pub fn entry(&self, file_id: &str) -> Option<&LedgerEntry> {
        self.entries.get(file_id)
    }

    pub fn is_already_done(&self, file_id: &str) -> bool {
        self.status(file_id) == Some(LedgerStatus::Success)
    }

    pub fn record_pending(&mut self, file_id: &str, run_id: &str) -> Result<(), StorageError> {
        self.append(LedgerEntry {
            file_id: file_id.to_string(),
            status: LedgerStatus::Pending,
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            outcome: None,
        })
    }

    pub fn record_result(
        &mut self,
        outcome: &TaskOutcome,
        run_id: &str,
    ) -> Result<(), StorageError> {
        let status = if outcome.is_success() {
            LedgerStatus::Success
        } else {
            LedgerStatus::Failed
        };
        self.append(LedgerEntry {
            file_id: outcome.file_id().to_string(),
            status,
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            outcome: Some(outcome.clone()),
        })
    }

    /// Cambia el handle por uno de sólo lectura: todo append posterior falla.
    #[cfg(test)]
    pub(crate) fn reopen_read_only(&mut self) -> std::io::Result<()> {
        self.file = File::open(&self.path)?;
        Ok(())
    }

    fn append(&mut self, entry: LedgerEntry) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        // una sola escritura por línea + fsync: o queda la línea entera o nada útil
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.sync_data())
            .map_err(|e| StorageError::io(&self.path, e))?;

        self.entries.insert(entry.file_id.clone(), entry);
        Ok(())
    }
}

fn ends_without_newline(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
