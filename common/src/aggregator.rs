use std::{
    fs::{self, File},
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::records::{FailureRecord, ResultRecord, TaskOutcome};

/// Valor que se escribe cuando un archivo no emitió una columna.
pub const NOT_COMPUTED: &str = "NA";
pub const FILE_COLUMN: &str = "filename";
pub const WARNINGS_COLUMN: &str = "warnings";
pub const FAILURE_TABLE: &str = "failures.tsv";
const FAILURE_HEADER: [&str; 5] = ["filename", "file_id", "step", "kind", "message"];

#[derive(Debug)]
struct FlushedBatch {
    path: PathBuf,
    records: Vec<ResultRecord>,
    /// cantidad de columnas de métricas con que se escribió
    width: usize,
}

/// Lo que dejó escrito el agregador al terminar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub tables: Vec<PathBuf>,
    pub failure_table: PathBuf,
    pub rows: usize,
    pub failures: usize,
    pub columns: Vec<String>,
}

/// Acumula resultados en tablas TSV, opcionalmente partidas en lotes.
///
/// Las columnas son la unión de todas las métricas vistas. Si aparece una
/// columna nueva después de escribir un lote, ese lote se reescribe al final
/// con el encabezado completo.
///
/// Las fallas se agregan fila por fila a `failures.tsv`; si alguna escritura
/// falla, la tabla se reescribe completa al final.
pub struct ResultAggregator {
    out_dir: PathBuf,
    batch_size: Option<NonZeroUsize>,
    columns: IndexSet<String>,
    current: Vec<ResultRecord>,
    flushed: Vec<FlushedBatch>,
    failure_path: PathBuf,
    failure_writer: csv::Writer<File>,
    failures: Vec<FailureRecord>,
    failure_table_stale: bool,
}

impl ResultAggregator {
    pub fn new(out_dir: &Path, batch_size: Option<NonZeroUsize>) -> Result<Self, StorageError> {
        fs::create_dir_all(out_dir).map_err(|e| StorageError::io(out_dir, e))?;
        remove_stale_tables(out_dir)?;

        let failure_path = out_dir.join(FAILURE_TABLE);
        let mut failure_writer = tsv_writer(&failure_path)?;
        failure_writer
            .write_record(FAILURE_HEADER)
            .map_err(|e| StorageError::table(&failure_path, e))?;
        failure_writer
            .flush()
            .map_err(|e| StorageError::io(&failure_path, e))?;

        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            batch_size,
            columns: IndexSet::new(),
            current: Vec::new(),
            flushed: Vec::new(),
            failure_path,
            failure_writer,
            failures: Vec::new(),
            failure_table_stale: false,
        })
    }

    pub fn push(&mut self, outcome: TaskOutcome) -> Result<(), StorageError> {
        match outcome {
            TaskOutcome::Success(rec) => self.push_result(rec),
            TaskOutcome::Failure(rec) => self.push_failure(&rec),
        }
    }

    pub fn push_result(&mut self, rec: ResultRecord) -> Result<(), StorageError> {
        for key in rec.metrics.keys() {
            if !self.columns.contains(key) {
                self.columns.insert(key.clone());
            }
        }
        self.current.push(rec);

        // un lote que no se pudo escribir se reintenta acá, sin pasarse de `size`
        if let Some(size) = self.batch_size {
            while self.current.len() >= size.get() {
                self.flush_batch(size.get())?;
            }
        }
        Ok(())
    }

    /// Las fallas se escriben enseguida, fila por fila.
    pub fn push_failure(&mut self, rec: &FailureRecord) -> Result<(), StorageError> {
        self.failures.push(rec.clone());
        let written = self
            .failure_writer
            .write_record(failure_row(rec))
            .map_err(|e| StorageError::table(&self.failure_path, e))
            .and_then(|_| {
                self.failure_writer
                    .flush()
                    .map_err(|e| StorageError::io(&self.failure_path, e))
            });
        if written.is_err() {
            self.failure_table_stale = true;
        }
        written
    }

    pub fn rows(&self) -> usize {
        self.current.len() + self.flushed.iter().map(|b| b.records.len()).sum::<usize>()
    }

    fn table_path(&self, index: usize) -> PathBuf {
        match self.batch_size {
            None => self.out_dir.join("results.tsv"),
            Some(_) => self.out_dir.join(format!("results_{}.tsv", index)),
        }
    }

    /// Escribe las primeras `count` filas pendientes como una tabla nueva.
    /// Si falla, las filas quedan en `current`.
    fn flush_batch(&mut self, count: usize) -> Result<(), StorageError> {
        let count = count.min(self.current.len());
        let path = self.table_path(self.flushed.len() + 1);
        write_table(&path, &self.current[..count], &self.columns)?;
        debug!("lote {} escrito con {} filas", path.display(), count);

        let records: Vec<ResultRecord> = self.current.drain(..count).collect();
        self.flushed.push(FlushedBatch {
            path,
            records,
            width: self.columns.len(),
        });
        Ok(())
    }

    /// Escribe lo pendiente y corrige los lotes que quedaron con menos columnas.
    pub fn finish(mut self) -> Result<AggregateSummary, StorageError> {
        match self.batch_size {
            None => self.flush_batch(self.current.len())?,
            Some(size) => {
                while !self.current.is_empty() {
                    self.flush_batch(size.get())?;
                }
            }
        }

        for batch in &mut self.flushed {
            if batch.width < self.columns.len() {
                write_table(&batch.path, &batch.records, &self.columns)?;
                batch.width = self.columns.len();
                debug!("lote {} reescrito con columnas nuevas", batch.path.display());
            }
        }

        if self.failure_table_stale {
            write_failure_table(&self.failure_path, &self.failures)?;
            self.failure_table_stale = false;
            debug!("tabla de fallas reescrita con {} filas", self.failures.len());
        } else {
            self.failure_writer
                .flush()
                .map_err(|e| StorageError::io(&self.failure_path, e))?;
        }

        let summary = AggregateSummary {
            tables: self.flushed.iter().map(|b| b.path.clone()).collect(),
            failure_table: self.failure_path.clone(),
            rows: self.rows(),
            failures: self.failures.len(),
            columns: self.columns.iter().cloned().collect(),
        };
        info!(
            "resultados: {} fila(s) en {} tabla(s), {} falla(s)",
            summary.rows,
            summary.tables.len(),
            summary.failures
        );
        Ok(summary)
    }
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<File>, StorageError> {
    csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|e| StorageError::table(path, e))
}

fn failure_row(rec: &FailureRecord) -> [String; 5] {
    [
        rec.file_name.clone(),
        rec.file_id.clone(),
        rec.step.clone(),
        rec.kind.to_string(),
        rec.message.clone(),
    ]
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => NOT_COMPUTED.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reescribe `failures.tsv` completa desde memoria.
fn write_failure_table(path: &Path, failures: &[FailureRecord]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tsv.tmp");
    let mut w = tsv_writer(&tmp)?;
    w.write_record(FAILURE_HEADER)
        .map_err(|e| StorageError::table(&tmp, e))?;
    for rec in failures {
        w.write_record(failure_row(rec))
            .map_err(|e| StorageError::table(&tmp, e))?;
    }
    w.flush().map_err(|e| StorageError::io(&tmp, e))?;
    drop(w);
    fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))
}

/// Escribe una tabla completa en un temporal y la mueve a su lugar.
fn write_table(
    path: &Path,
    records: &[ResultRecord],
    columns: &IndexSet<String>,
) -> Result<(), StorageError> {
    let tmp = path.with_extension("tsv.tmp");
    let mut w = tsv_writer(&tmp)?;

    let mut header: Vec<&str> = Vec::with_capacity(columns.len() + 2);
    header.push(FILE_COLUMN);
    header.extend(columns.iter().map(|c| c.as_str()));
    header.push(WARNINGS_COLUMN);
    w.write_record(&header).map_err(|e| StorageError::table(&tmp, e))?;

    for rec in records {
        let mut row: Vec<String> = Vec::with_capacity(columns.len() + 2);
        row.push(rec.file_name.clone());
        for col in columns {
            row.push(
                rec.metrics
                    .get(col)
                    .map(render)
                    .unwrap_or_else(|| NOT_COMPUTED.to_string()),
            );
        }
        row.push(rec.warnings.join("|"));
        w.write_record(&row).map_err(|e| StorageError::table(&tmp, e))?;
    }

    w.flush().map_err(|e| StorageError::io(&tmp, e))?;
    drop(w);
    fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))
}

/// Borra tablas `results*.tsv` de una corrida anterior en el mismo directorio.
/// Las filas que siguen siendo válidas se vuelven a escribir desde el ledger.
fn remove_stale_tables(out_dir: &Path) -> Result<(), StorageError> {
    let entries = fs::read_dir(out_dir).map_err(|e| StorageError::io(out_dir, e))?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let is_table = name == "results.tsv"
            || name
                .strip_prefix("results_")
                .and_then(|rest| rest.strip_suffix(".tsv"))
                .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false);
        if is_table {
            let path = entry.path();
            fs::remove_file(&path).map_err(|e| StorageError::io(&path, e))?;
        }
    }
    Ok(())
}
