use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
};

use image::{DynamicImage, GrayImage};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{records::ResultRecord, FileId};

/// Parámetros de un step, en el orden en que aparecen en la configuración.
pub type Params = IndexMap<String, String>;

/// Un step tal como viene de la configuración: nombre + parámetros.
///
/// El nombre sigue la convención `Modulo.funcion[:instancia]`; la instancia
/// permite usar la misma función varias veces con parámetros distintos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(default)]
    pub params: Params,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, params: Params) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Nombre sin el sufijo de instancia; es la clave en el registry.
    pub fn kind(&self) -> &str {
        match self.name.split_once(':') {
            Some((kind, _)) => kind,
            None => &self.name,
        }
    }

    /// Sufijo `:instancia`, si lo hay.
    pub fn instance(&self) -> Option<&str> {
        self.name
            .split_once(':')
            .map(|(_, inst)| inst)
            .filter(|inst| !inst.is_empty())
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }
}

impl fmt::Display for StepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Error devuelto por un step.
///
/// `Processing` es un problema de dominio previsto por el step (imagen ilegible,
/// formato no soportado, falta un paso previo). Cualquier otra cosa es `Unexpected`.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{0}")]
    Processing(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl StepError {
    pub fn processing(msg: impl Into<String>) -> Self {
        StepError::Processing(msg.into())
    }
}

/// Unidad de procesamiento ya resuelta desde un `StepSpec`.
///
/// Los efectos de un step quedan confinados al `RunState` que recibe y al
/// directorio de salida del archivo.
pub trait Step: Send + Sync + fmt::Debug {
    fn run(&self, state: &mut RunState) -> Result<(), StepError>;
}

/// Estado mutable de un archivo mientras recorre el pipeline.
///
/// Lo crea el executor para un solo archivo y nunca se comparte entre archivos.
#[derive(Debug)]
pub struct RunState {
    source_path: PathBuf,
    file_name: String,
    out_dir: PathBuf,
    current_step: String,

    metrics: IndexMap<String, Value>,
    // step que emitió cada métrica, para detectar colisiones
    metric_owner: HashMap<String, String>,
    warnings: Vec<String>,

    image: Option<DynamicImage>,
    masks: IndexMap<String, GrayImage>,
    mask_use: Option<GrayImage>,
}

impl RunState {
    pub fn new(
        source_path: impl Into<PathBuf>,
        file_name: impl Into<String>,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            file_name: file_name.into(),
            out_dir: out_dir.into(),
            current_step: String::new(),
            metrics: IndexMap::new(),
            metric_owner: HashMap::new(),
            warnings: Vec::new(),
            image: None,
            masks: IndexMap::new(),
            mask_use: None,
        }
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Ruta de un artefacto de este archivo: `<out_dir>/<archivo>_<sufijo>`.
    pub fn artifact_path(&self, suffix: &str) -> PathBuf {
        self.out_dir.join(format!("{}_{}", self.file_name, suffix))
    }

    pub fn current_step(&self) -> &str {
        &self.current_step
    }

    pub(crate) fn enter_step(&mut self, name: &str) {
        self.current_step = name.to_string();
    }

    /// Agrega una métrica al resultado del archivo.
    ///
    /// Si otro step ya emitió la misma clave, el valor nuevo se guarda como
    /// `clave@step` para no pisar el anterior.
    pub fn emit(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let owner = self.metric_owner.get(&key);

        let final_key = match owner {
            Some(step) if *step != self.current_step => format!("{}@{}", key, self.current_step),
            _ => key,
        };

        self.metric_owner
            .entry(final_key.clone())
            .or_insert_with(|| self.current_step.clone());
        self.metrics.insert(final_key, value.into());
    }

    pub fn metric(&self, key: &str) -> Option<&Value> {
        self.metrics.get(key)
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::warn!(file = %self.file_name, step = %self.current_step, "{}", msg);
        self.warnings.push(msg);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn image(&self) -> Option<&DynamicImage> {
        self.image.as_ref()
    }

    pub fn set_image(&mut self, img: DynamicImage) {
        self.image = Some(img);
    }

    pub fn mask(&self, name: &str) -> Option<&GrayImage> {
        self.masks.get(name)
    }

    pub fn set_mask(&mut self, name: impl Into<String>, mask: GrayImage) {
        self.masks.insert(name.into(), mask);
    }

    /// Máscara de píxeles todavía utilizables (255 = usable).
    pub fn mask_use(&self) -> Option<&GrayImage> {
        self.mask_use.as_ref()
    }

    pub fn mask_use_mut(&mut self) -> Option<&mut GrayImage> {
        self.mask_use.as_mut()
    }

    pub fn set_mask_use(&mut self, mask: GrayImage) {
        self.mask_use = Some(mask);
    }

    /// Consume el estado y arma el registro de resultado.
    pub(crate) fn into_record(self, file_id: FileId) -> ResultRecord {
        ResultRecord {
            file_id,
            file_name: self.file_name,
            metrics: self.metrics,
            warnings: self.warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_e_instance_separan_el_sufijo() {
        let spec = StepSpec::new(
            "LightDarkModule.getIntensityThresholdPercent:tissue",
            Params::new(),
        );
        assert_eq!(spec.kind(), "LightDarkModule.getIntensityThresholdPercent");
        assert_eq!(spec.instance(), Some("tissue"));

        let plain = StepSpec::new("BasicModule.getBasicStats", Params::new());
        assert_eq!(plain.kind(), "BasicModule.getBasicStats");
        assert_eq!(plain.instance(), None);

        let empty_suffix = StepSpec::new("BasicModule.getBasicStats:", Params::new());
        assert_eq!(empty_suffix.instance(), None);
    }

    #[test]
    fn emit_etiqueta_colisiones_entre_steps() {
        let mut state = RunState::new("/tmp/a.png", "a.png", "/tmp/out/a.png");

        state.enter_step("A");
        state.emit("height", 10);
        state.emit("height", 11); // mismo step: sobrescribe

        state.enter_step("B");
        state.emit("height", 20);
        state.emit("width", 5);

        assert_eq!(state.metric("height"), Some(&json!(11)));
        assert_eq!(state.metric("height@B"), Some(&json!(20)));
        assert_eq!(state.metric("width"), Some(&json!(5)));

        let rec = state.into_record("a.png".to_string());
        let keys: Vec<&str> = rec.metrics.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["height", "height@B", "width"]);
    }

    #[test]
    fn artifact_path_usa_nombre_del_archivo() {
        let state = RunState::new("/data/in/s1.svs", "s1.svs", "/data/out/s1.svs");
        assert_eq!(
            state.artifact_path("mask_use.png"),
            PathBuf::from("/data/out/s1.svs/s1.svs_mask_use.png")
        );
    }
}
