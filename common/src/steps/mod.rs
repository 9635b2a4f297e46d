//! Steps de referencia que trae la librería.
//!
//! El engine no depende de ellos: cualquier `Step` registrado en el
//! `StepRegistry` se ejecuta igual. Sirven para correr el pipeline punta a
//! punta sobre imágenes comunes (PNG, JPEG, TIFF...).

mod basic;
mod contrast;
mod light_dark;
mod save;

pub use basic::{FinalComputations, GetBasicStats};
pub use contrast::GetContrast;
pub use light_dark::IntensityThresholdPercent;
pub use save::{SaveFinalMask, SaveThumbnails};

use crate::registry::StepRegistry;
use crate::step::{RunState, StepError};

pub fn register_builtin(reg: &mut StepRegistry) {
    reg.register("BasicModule.getBasicStats", GetBasicStats::from_spec)
        .register("BasicModule.finalComputations", FinalComputations::from_spec)
        .register(
            "LightDarkModule.getIntensityThresholdPercent",
            IntensityThresholdPercent::from_spec,
        )
        .register("BrightContrastModule.getContrast", GetContrast::from_spec)
        .register("SaveModule.saveFinalMask", SaveFinalMask::from_spec)
        .register("SaveModule.saveThumbnails", SaveThumbnails::from_spec);
}

fn require_image_loaded(state: &RunState) -> Result<(), StepError> {
    if state.image().is_none() || state.mask_use().is_none() {
        return Err(StepError::processing(
            "no image loaded: BasicModule.getBasicStats must run first",
        ));
    }
    Ok(())
}
