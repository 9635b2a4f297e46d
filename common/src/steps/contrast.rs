use super::require_image_loaded;
use crate::registry::RegistryError;
use crate::step::{RunState, Step, StepError, StepSpec};

/// Contraste RMS y de Michelson sobre la imagen en escala de grises.
#[derive(Debug)]
pub struct GetContrast {
    limit_to_mask: bool,
}

impl GetContrast {
    pub fn from_spec(spec: &StepSpec) -> Result<Box<dyn Step>, RegistryError> {
        Ok(Box::new(Self {
            limit_to_mask: spec.bool_param("limit_to_mask", true)?,
        }))
    }
}

impl Step for GetContrast {
    fn run(&self, state: &mut RunState) -> Result<(), StepError> {
        require_image_loaded(state)?;

        let values: Vec<f64> = match (state.image(), state.mask_use()) {
            (Some(img), Some(mask_use)) => {
                let gray = img.to_luma8();
                gray.pixels()
                    .zip(mask_use.pixels())
                    .filter(|(_, m)| !self.limit_to_mask || m[0] > 0)
                    .map(|(p, _)| p[0] as f64 / 255.0)
                    .collect()
            }
            _ => Vec::new(),
        };

        if values.is_empty() {
            state.warn("no usable pixels to compute contrast");
            return Ok(());
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let rms = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();

        let max = values.iter().cloned().fold(f64::MIN, f64::max);
        let min = values.iter().cloned().fold(f64::MAX, f64::min);
        let michelson = if max + min > 0.0 {
            (max - min) / (max + min)
        } else {
            0.0
        };

        state.emit("rms_contrast", rms);
        state.emit("michelson_contrast", michelson);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Params;
    use crate::steps::GetBasicStats;
    use crate::test_support::{temp_dir, write_gradient_png};

    #[test]
    fn contraste_de_un_gradiente_completo() {
        let dir = temp_dir("contrast_gradient");
        let path = write_gradient_png(&dir, "g.png", 2, 2);
        let mut state = RunState::new(&path, "g.png", dir.join("out"));
        GetBasicStats::from_spec(&StepSpec::new("BasicModule.getBasicStats", Params::new()))
            .unwrap()
            .run(&mut state)
            .unwrap();

        let spec = StepSpec::new("BrightContrastModule.getContrast", Params::new());
        let step = GetContrast::from_spec(&spec).unwrap();
        step.run(&mut state).unwrap();

        // dos columnas: negro y blanco
        assert_eq!(state.metric("michelson_contrast"), Some(&serde_json::json!(1.0)));
        assert_eq!(state.metric("rms_contrast"), Some(&serde_json::json!(0.5)));
    }
}
