use std::{fmt, fs, path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::{RegistryError, StepRegistry};
use crate::step::{Params, Step, StepSpec};

/* --------- configuración del pipeline --------- */

/// Una sección de la configuración: el step y sus parámetros.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSection {
    pub name: String,
    #[serde(default)]
    pub params: Params,
}

/// Configuración ya parseada: lista ordenada de steps.
///
/// `defaults` se aplica a todos los steps; si una sección define la misma
/// clave, gana la sección.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub defaults: Params,
    pub steps: Vec<StepSection>,
}

const DEFAULT_TEMPLATE: &str = r#"{
  "defaults": {},
  "steps": [
    { "name": "BasicModule.getBasicStats", "params": { "image_work_size": "2048" } },
    { "name": "LightDarkModule.getIntensityThresholdPercent:bright",
      "params": { "lower_threshold": "0.9", "upper_threshold": "1.0" } },
    { "name": "LightDarkModule.getIntensityThresholdPercent:dark",
      "params": { "lower_threshold": "0.0", "upper_threshold": "0.15" } },
    { "name": "BrightContrastModule.getContrast", "params": { "limit_to_mask": "True" } },
    { "name": "BasicModule.finalComputations" },
    { "name": "SaveModule.saveThumbnails", "params": { "small_dim": "500" } },
    { "name": "SaveModule.saveFinalMask" }
  ]
}"#;

const BASIC_TEMPLATE: &str = r#"{
  "defaults": {},
  "steps": [
    { "name": "BasicModule.getBasicStats" },
    { "name": "BasicModule.finalComputations" }
  ]
}"#;

impl PipelineConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: PipelineConfig =
            serde_json::from_str(s).context("invalid pipeline configuration")?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("in {}", path.display()))
    }

    /// Configuraciones que vienen con la librería.
    pub fn template(name: &str) -> Result<Self> {
        match name {
            "default" => Self::from_json_str(DEFAULT_TEMPLATE),
            "basic" => Self::from_json_str(BASIC_TEMPLATE),
            other => bail!(
                "unknown configuration template '{}' (available: default, basic)",
                other
            ),
        }
    }

    /// `StepSpec` de cada sección, con `defaults` mezclados.
    pub fn step_specs(&self) -> Vec<StepSpec> {
        self.steps
            .iter()
            .map(|section| {
                let mut params = self.defaults.clone();
                for (k, v) in &section.params {
                    params.insert(k.clone(), v.clone());
                }
                StepSpec::new(section.name.clone(), params)
            })
            .collect()
    }
}

/* --------- definición resuelta --------- */

/// Error al construir el pipeline. Lista todos los steps con problemas.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PipelineBuildError {
    #[error("pipeline has no steps")]
    Empty,
    #[error("pipeline has {} unresolved step(s): {}", .0.len(), join_errors(.0))]
    Unresolved(Vec<RegistryError>),
}

fn join_errors(errors: &[RegistryError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug)]
struct ResolvedStep {
    spec: StepSpec,
    step: Box<dyn Step>,
}

/// Secuencia ordenada de steps resueltos.
///
/// Se construye una vez por corrida y se comparte (sólo lectura) entre todos
/// los workers; clonarla es barato.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    steps: Arc<[ResolvedStep]>,
    config: Arc<PipelineConfig>,
}

impl PipelineDefinition {
    pub fn build(
        config: &PipelineConfig,
        registry: &StepRegistry,
    ) -> Result<Self, PipelineBuildError> {
        if config.steps.is_empty() {
            return Err(PipelineBuildError::Empty);
        }

        let mut resolved = Vec::with_capacity(config.steps.len());
        let mut errors = Vec::new();

        for spec in config.step_specs() {
            match registry.resolve(&spec) {
                Ok(step) => resolved.push(ResolvedStep { spec, step }),
                Err(e) => errors.push(e),
            }
        }

        if !errors.is_empty() {
            return Err(PipelineBuildError::Unresolved(errors));
        }

        Ok(Self {
            steps: resolved.into(),
            config: Arc::new(config.clone()),
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.spec.name.as_str()).collect()
    }

    /// Configuración de origen; es lo que viaja a los workers remotos.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub(crate) fn steps(&self) -> impl Iterator<Item = (&StepSpec, &dyn Step)> {
        self.steps.iter().map(|s| (&s.spec, s.step.as_ref()))
    }
}

impl fmt::Display for PipelineDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pipeline ({} steps):", self.steps.len())?;
        for (i, s) in self.steps.iter().enumerate() {
            writeln!(f, "  {:>2}. {}", i + 1, s.spec.name)?;
        }
        Ok(())
    }
}
