use image::{GrayImage, Luma};

use super::require_image_loaded;
use crate::registry::RegistryError;
use crate::step::{RunState, Step, StepError, StepSpec};

/// Marca los píxeles cuya intensidad cae en `(lower_threshold, upper_threshold]`
/// y los saca de la máscara de uso.
///
/// El nombre de la máscara (y de la métrica) sale del parámetro `name`, del
/// sufijo de instancia o, si no hay ninguno, es `intensity`.
#[derive(Debug)]
pub struct IntensityThresholdPercent {
    step_name: String,
    name: String,
    lower: f64,
    upper: f64,
    invert: bool,
}

impl IntensityThresholdPercent {
    pub fn from_spec(spec: &StepSpec) -> Result<Box<dyn Step>, RegistryError> {
        let lower = spec.fraction_param("lower_threshold", 0.0)?;
        let upper = spec.fraction_param("upper_threshold", 1.0)?;
        if lower >= upper {
            return Err(spec.invalid_param(
                "lower_threshold",
                format!("must be lower than upper_threshold ({} >= {})", lower, upper),
            ));
        }

        let name = spec
            .param("name")
            .or(spec.instance())
            .unwrap_or("intensity")
            .to_string();

        Ok(Box::new(Self {
            step_name: spec.name.clone(),
            name,
            lower,
            upper,
            invert: spec.bool_param("invert", false)?,
        }))
    }
}

impl Step for IntensityThresholdPercent {
    fn run(&self, state: &mut RunState) -> Result<(), StepError> {
        require_image_loaded(state)?;
        let gray = match state.image() {
            Some(img) => img.to_luma8(),
            None => return Err(StepError::processing("no image loaded")),
        };

        let mut hits: u64 = 0;
        let mask = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
            let v = gray.get_pixel(x, y)[0] as f64 / 255.0;
            let in_range = v > self.lower && v <= self.upper;
            if in_range != self.invert {
                hits += 1;
                Luma([255])
            } else {
                Luma([0])
            }
        });

        let total = (gray.width() as u64 * gray.height() as u64).max(1);
        state.emit(self.name.clone(), hits as f64 / total as f64);

        let mut remaining: u64 = 0;
        if let Some(mask_use) = state.mask_use_mut() {
            for (use_px, hit_px) in mask_use.pixels_mut().zip(mask.pixels()) {
                if hit_px[0] > 0 {
                    use_px[0] = 0;
                }
                if use_px[0] > 0 {
                    remaining += 1;
                }
            }
        }

        if remaining == 0 {
            state.warn(format!(
                "After {} NO usable pixels remain detectable!",
                self.step_name
            ));
        }

        state.set_mask(self.name.clone(), mask);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Params;
    use crate::steps::GetBasicStats;
    use crate::test_support::{temp_dir, write_gradient_png};

    fn spec(name: &str, params: &[(&str, &str)]) -> StepSpec {
        let params: Params = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StepSpec::new(name, params)
    }

    fn loaded_state(sub: &str) -> RunState {
        let dir = temp_dir(sub);
        let path = write_gradient_png(&dir, "g.png", 10, 4);
        let mut state = RunState::new(&path, "g.png", dir.join("out"));
        let load = GetBasicStats::from_spec(&spec("BasicModule.getBasicStats", &[])).unwrap();
        load.run(&mut state).unwrap();
        state
    }

    #[test]
    fn umbral_marca_pixeles_y_actualiza_mask_use() {
        let mut state = loaded_state("light_dark_threshold");
        let step = IntensityThresholdPercent::from_spec(&spec(
            "LightDarkModule.getIntensityThresholdPercent:bright",
            &[("lower_threshold", "0.5")],
        ))
        .unwrap();

        state.enter_step("LightDarkModule.getIntensityThresholdPercent:bright");
        step.run(&mut state).unwrap();

        // gradiente 0..255 en 10 columnas: las 5 de la derecha superan 0.5
        assert_eq!(state.metric("bright"), Some(&serde_json::json!(0.5)));
        let usable = state.mask_use().unwrap().pixels().filter(|p| p[0] > 0).count();
        assert_eq!(usable, 20);
        assert!(state.mask("bright").is_some());
        assert!(state.warnings().is_empty());
    }

    #[test]
    fn advierte_cuando_no_quedan_pixeles() {
        let mut state = loaded_state("light_dark_empty");
        let step = IntensityThresholdPercent::from_spec(&spec(
            "LightDarkModule.getIntensityThresholdPercent:all",
            &[("lower_threshold", "0.0"), ("upper_threshold", "1.0"), ("invert", "True")],
        ))
        .unwrap();
        // invert sobre (0, 1] deja sólo los píxeles negros exactos
        step.run(&mut state).unwrap();
        let step2 = IntensityThresholdPercent::from_spec(&spec(
            "LightDarkModule.getIntensityThresholdPercent:rest",
            &[],
        ))
        .unwrap();
        step2.run(&mut state).unwrap();

        assert_eq!(state.warnings().len(), 1);
        assert!(state.warnings()[0].contains("NO usable pixels"));
    }

    #[test]
    fn parametros_inconsistentes_se_rechazan() {
        let err = IntensityThresholdPercent::from_spec(&spec(
            "LightDarkModule.getIntensityThresholdPercent",
            &[("lower_threshold", "0.8"), ("upper_threshold", "0.2")],
        ))
        .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidParameter { .. }));
    }

    #[test]
    fn sin_imagen_es_step_error() {
        let step = IntensityThresholdPercent::from_spec(&spec(
            "LightDarkModule.getIntensityThresholdPercent",
            &[],
        ))
        .unwrap();
        let mut state = RunState::new("/x.png", "x.png", "/tmp");
        assert!(matches!(step.run(&mut state), Err(StepError::Processing(_))));
    }
}
