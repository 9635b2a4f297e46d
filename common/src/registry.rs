use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::step::{Step, StepSpec};
use crate::steps;

/// Error al resolver un `StepSpec` contra el registry.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RegistryError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),
    #[error("step '{step}': invalid parameter '{param}': {reason}")]
    InvalidParameter {
        step: String,
        param: String,
        reason: String,
    },
}

/// Construye un step a partir de su configuración, validando parámetros.
pub type StepFactory = Box<dyn Fn(&StepSpec) -> Result<Box<dyn Step>, RegistryError> + Send + Sync>;

/// Tabla nombre -> fábrica de steps.
///
/// Se arma una vez al arrancar y después sólo se consulta, así que se puede
/// compartir entre hilos sin locks.
pub struct StepRegistry {
    factories: BTreeMap<String, StepFactory>,
}

impl StepRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry con los steps que trae la librería.
    pub fn with_builtin_steps() -> Self {
        let mut reg = Self::empty();
        steps::register_builtin(&mut reg);
        reg
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&StepSpec) -> Result<Box<dyn Step>, RegistryError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Resuelve un step por su nombre (sin el sufijo de instancia).
    pub fn resolve(&self, spec: &StepSpec) -> Result<Box<dyn Step>, RegistryError> {
        let factory = self
            .factories
            .get(spec.kind())
            .ok_or_else(|| RegistryError::UnknownStep(spec.name.clone()))?;
        factory(spec)
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_builtin_steps()
    }
}

/* ---------- lectura tipada de parámetros ---------- */

impl StepSpec {
    pub fn invalid_param(&self, param: &str, reason: impl Into<String>) -> RegistryError {
        RegistryError::InvalidParameter {
            step: self.name.clone(),
            param: param.to_string(),
            reason: reason.into(),
        }
    }

    /// Parámetro obligatorio parseado a `T`.
    pub fn required_param<T>(&self, key: &str) -> Result<T, RegistryError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self
            .param(key)
            .ok_or_else(|| self.invalid_param(key, "missing required parameter"))?;
        raw.trim()
            .parse::<T>()
            .map_err(|e| self.invalid_param(key, format!("'{}': {}", raw, e)))
    }

    /// Parámetro opcional parseado a `T`, con valor por defecto.
    pub fn param_or<T>(&self, key: &str, default: T) -> Result<T, RegistryError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.param(key) {
            None => Ok(default),
            Some(_) => self.required_param(key),
        }
    }

    /// Booleano al estilo de los archivos de configuración: True/False, yes/no, 1/0.
    pub fn bool_param(&self, key: &str, default: bool) -> Result<bool, RegistryError> {
        let Some(raw) = self.param(key) else {
            return Ok(default);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            other => Err(self.invalid_param(key, format!("'{}' is not a boolean", other))),
        }
    }

    /// Fracción en el rango [0, 1].
    pub fn fraction_param(&self, key: &str, default: f64) -> Result<f64, RegistryError> {
        let v: f64 = self.param_or(key, default)?;
        if !(0.0..=1.0).contains(&v) {
            return Err(self.invalid_param(key, format!("{} is outside [0, 1]", v)));
        }
        Ok(v)
    }
}
