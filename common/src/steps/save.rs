use anyhow::Context;

use super::require_image_loaded;
use crate::registry::RegistryError;
use crate::step::{RunState, Step, StepError, StepSpec};

/// Guarda la máscara de uso final como `<archivo>_mask_use.png`.
#[derive(Debug)]
pub struct SaveFinalMask;

impl SaveFinalMask {
    pub fn from_spec(_spec: &StepSpec) -> Result<Box<dyn Step>, RegistryError> {
        Ok(Box::new(Self))
    }
}

impl Step for SaveFinalMask {
    fn run(&self, state: &mut RunState) -> Result<(), StepError> {
        require_image_loaded(state)?;
        let path = state.artifact_path("mask_use.png");
        let mask = state.mask_use().context("use mask vanished")?;
        mask.save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Guarda una miniatura de la imagen de trabajo como `<archivo>_thumb_small.png`.
#[derive(Debug)]
pub struct SaveThumbnails {
    small_dim: u32,
}

impl SaveThumbnails {
    pub fn from_spec(spec: &StepSpec) -> Result<Box<dyn Step>, RegistryError> {
        let small_dim: u32 = spec.param_or("small_dim", 500)?;
        if small_dim == 0 {
            return Err(spec.invalid_param("small_dim", "must be positive"));
        }
        Ok(Box::new(Self { small_dim }))
    }
}

impl Step for SaveThumbnails {
    fn run(&self, state: &mut RunState) -> Result<(), StepError> {
        require_image_loaded(state)?;
        let path = state.artifact_path("thumb_small.png");
        let img = state.image().context("image vanished")?;
        img.thumbnail(self.small_dim, self.small_dim)
            .to_rgb8()
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}
