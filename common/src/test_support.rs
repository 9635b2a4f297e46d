//! Utilidades compartidas por los tests de la librería.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use image::{GrayImage, Luma};

use crate::pipeline::{PipelineConfig, StepSection};
use crate::step::Params;

/// Directorio temporal limpio para un test.
pub fn temp_dir(sub: &str) -> PathBuf {
    let base = env::temp_dir()
        .join(format!("qc_common_tests_{}", std::process::id()))
        .join(sub);
    let _ = fs::remove_dir_all(&base);
    fs::create_dir_all(&base).unwrap();
    base
}

/// PNG en escala de grises con un gradiente horizontal de negro a blanco.
pub fn write_gradient_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let img = GrayImage::from_fn(width, height, |x, _y| {
        let v = if width > 1 { x * 255 / (width - 1) } else { 0 };
        Luma([v as u8])
    });
    let path = dir.join(name);
    img.save(&path).unwrap();
    path
}

pub fn section(name: &str, params: &[(&str, &str)]) -> StepSection {
    let params: Params = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    StepSection {
        name: name.to_string(),
        params,
    }
}

/// Pipeline chico de dos steps donde el segundo depende de la imagen que carga el primero.
pub fn two_step_config() -> PipelineConfig {
    PipelineConfig {
        defaults: Params::new(),
        steps: vec![
            section("BasicModule.getBasicStats", &[]),
            section(
                "LightDarkModule.getIntensityThresholdPercent:bright",
                &[("lower_threshold", "0.5")],
            ),
        ],
    }
}
