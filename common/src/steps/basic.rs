use anyhow::Context;
use image::{GrayImage, ImageReader, Luma};

use super::require_image_loaded;
use crate::registry::RegistryError;
use crate::step::{RunState, Step, StepError, StepSpec};

/// Abre la imagen del archivo y emite sus datos básicos.
///
/// `image_work_size` (px, opcional) limita la dimensión mayor de la imagen de
/// trabajo; la métrica `width`/`height` siempre es la del archivo original.
#[derive(Debug)]
pub struct GetBasicStats {
    work_size: Option<u32>,
}

impl GetBasicStats {
    pub fn from_spec(spec: &StepSpec) -> Result<Box<dyn Step>, RegistryError> {
        let work_size = match spec.param("image_work_size") {
            None => None,
            Some(_) => {
                let px: u32 = spec.required_param("image_work_size")?;
                if px == 0 {
                    return Err(spec.invalid_param("image_work_size", "must be positive"));
                }
                Some(px)
            }
        };
        Ok(Box::new(Self { work_size }))
    }
}

impl Step for GetBasicStats {
    fn run(&self, state: &mut RunState) -> Result<(), StepError> {
        let path = state.source_path().to_path_buf();

        let reader = ImageReader::open(&path)
            .and_then(|r| r.with_guessed_format())
            .map_err(|e| StepError::processing(format!("cannot open {}: {}", path.display(), e)))?;

        let format = reader.format();
        let img = reader
            .decode()
            .map_err(|e| {
                StepError::processing(format!("unreadable image {}: {}", path.display(), e))
            })?;

        let type_name = format
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("unknown");

        state.emit("type", type_name);
        state.emit("width", img.width());
        state.emit("height", img.height());
        state.emit("image_bands", img.color().channel_count());

        let img = match self.work_size {
            Some(max) if img.width() > max || img.height() > max => img.thumbnail(max, max),
            _ => img,
        };

        state.set_mask_use(GrayImage::from_pixel(img.width(), img.height(), Luma([255])));
        state.set_image(img);
        Ok(())
    }
}

/// Cuenta los píxeles que sobrevivieron a todas las máscaras.
#[derive(Debug)]
pub struct FinalComputations;

impl FinalComputations {
    pub fn from_spec(_spec: &StepSpec) -> Result<Box<dyn Step>, RegistryError> {
        Ok(Box::new(Self))
    }
}

impl Step for FinalComputations {
    fn run(&self, state: &mut RunState) -> Result<(), StepError> {
        require_image_loaded(state)?;
        let usable = state
            .mask_use()
            .map(|m| m.pixels().filter(|p| p[0] > 0).count())
            .context("use mask vanished")?;

        state.emit("pixels_to_use", usable as u64);
        Ok(())
    }
}
