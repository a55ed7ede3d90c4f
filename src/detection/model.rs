use std::collections::BTreeSet;
use std::path::Path;
use std::sync::PoisonError;

use candle_core::{Device, ModuleT, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::{info, warn};

use crate::config::{Config, NUM_SCALES};
use crate::detection::detector::{MultiScaleDetector, TrainingOutput};
use crate::detection::target::GroundTruth;
use crate::detection::{process_detections, Detection};
use crate::error::Result;
use crate::layers::HeadProjection;

/// Output projections for the three scales followed by the detection heads.
pub struct DetectionModel {
    projections: [HeadProjection; NUM_SCALES],
    detector: MultiScaleDetector,
    confidence_threshold: f32,
}

impl DetectionModel {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let detector = MultiScaleDetector::new(config)?;
        let out_channels = config.output_channels();
        let load = |scale: usize| {
            HeadProjection::load(
                vb.pp(format!("head.{scale}")),
                config.feature_channels[scale],
                out_channels,
            )
        };
        let projections = [load(0)?, load(1)?, load(2)?];
        Ok(Self {
            projections,
            detector,
            confidence_threshold: config.confidence_threshold,
        })
    }

    pub fn detector(&self) -> &MultiScaleDetector {
        &self.detector
    }

    fn project(&self, features: &[Tensor; NUM_SCALES], train: bool) -> Result<[Tensor; NUM_SCALES]> {
        let [p0, p1, p2] = &self.projections;
        Ok([
            p0.forward_t(&features[0], train)?,
            p1.forward_t(&features[1], train)?,
            p2.forward_t(&features[2], train)?,
        ])
    }

    /// `(B, N, 5 + C)` pixel-space detections over all scales.
    pub fn predict(&mut self, features: &[Tensor; NUM_SCALES]) -> Result<Tensor> {
        let raw = self.project(features, false)?;
        self.detector.infer(&raw)
    }

    pub fn loss(
        &mut self,
        features: &[Tensor; NUM_SCALES],
        truth: &GroundTruth,
    ) -> Result<TrainingOutput> {
        let raw = self.project(features, true)?;
        self.detector.compute_loss(&raw, truth)
    }

    /// Per-image detections whose objectness clears the configured threshold.
    pub fn detect(&mut self, features: &[Tensor; NUM_SCALES]) -> Result<Vec<Vec<Detection>>> {
        let output = self.predict(features)?;
        process_detections(&output, self.confidence_threshold)
    }
}

/// Outcome of [`load_weights_best_effort`]. Names are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub mismatched: Vec<String>,
    pub unused: Vec<String>,
}

/// Copies every tensor of a safetensors checkpoint whose name and shape match
/// a variable of `varmap`. Anything else is skipped and reported.
pub fn load_weights_best_effort(
    varmap: &VarMap,
    path: impl AsRef<Path>,
    device: &Device,
) -> Result<LoadReport> {
    let path = path.as_ref();
    let checkpoint = candle_core::safetensors::load(path, device)?;
    let vars = varmap.data().lock().unwrap_or_else(PoisonError::into_inner);

    let mut report = LoadReport::default();
    let names: BTreeSet<&String> = vars.keys().collect();
    for name in names {
        let var = &vars[name];
        match checkpoint.get(name) {
            None => {
                warn!(name = %name, "no tensor in checkpoint, keeping initial value");
                report.missing.push(name.clone());
            }
            Some(tensor) if tensor.dims() != var.dims() => {
                warn!(
                    name = %name,
                    expected = ?var.dims(),
                    found = ?tensor.dims(),
                    "shape mismatch, keeping initial value"
                );
                report.mismatched.push(name.clone());
            }
            Some(tensor) => {
                var.set(&tensor.to_dtype(var.dtype())?)?;
                report.loaded.push(name.clone());
            }
        }
    }

    let unused: BTreeSet<&String> = checkpoint
        .keys()
        .filter(|name| !vars.contains_key(*name))
        .collect();
    report.unused = unused.into_iter().cloned().collect();

    info!(
        path = %path.display(),
        loaded = report.loaded.len(),
        missing = report.missing.len(),
        mismatched = report.mismatched.len(),
        unused = report.unused.len(),
        "loaded weights"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use std::collections::HashMap;

    fn small_config() -> Config {
        Config {
            image_size: 64,
            num_classes: 2,
            feature_channels: [4, 6, 8],
            ..Config::default()
        }
    }

    fn features(config: &Config) -> [Tensor; NUM_SCALES] {
        let grids = [8, 4, 2];
        [0, 1, 2].map(|scale| {
            let shape = (1, config.feature_channels[scale], grids[scale], grids[scale]);
            Tensor::randn(0f32, 1.0, shape, &Device::Cpu).unwrap()
        })
    }

    #[test]
    fn predict_covers_all_cells() {
        let config = small_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut model = DetectionModel::new(&config, vb).unwrap();
        let output = model.predict(&features(&config)).unwrap();
        assert_eq!(output.dims(), &[1, 3 * (64 + 16 + 4), 7]);

        let detections = model.detect(&features(&config)).unwrap();
        assert_eq!(detections.len(), 1);
        assert!(detections[0].iter().all(|d| d.objectness > 0.5));
    }

    #[test]
    fn best_effort_load_reports_each_variable() {
        let config = small_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        DetectionModel::new(&config, vb).unwrap();

        let bias = "head.0.c2.conv.bias";
        let weight = "head.0.c2.conv.weight";
        let mut tensors = HashMap::new();
        tensors.insert(
            bias.to_string(),
            Tensor::full(0.25f32, config.output_channels(), &Device::Cpu).unwrap(),
        );
        tensors.insert(
            weight.to_string(),
            Tensor::zeros((1, 1, 1, 1), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "backbone.stem.weight".to_string(),
            Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap(),
        );
        let path = std::env::temp_dir().join(format!("yolo-head-{}.safetensors", std::process::id()));
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let report = load_weights_best_effort(&varmap, &path, &Device::Cpu).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(report.loaded, vec![bias.to_string()]);
        assert_eq!(report.mismatched, vec![weight.to_string()]);
        assert_eq!(report.unused, vec!["backbone.stem.weight".to_string()]);
        assert!(!report.missing.is_empty());

        let vars = varmap.data().lock().unwrap();
        let loaded = vars[bias].as_tensor().to_vec1::<f32>().unwrap();
        assert!(loaded.iter().all(|&v| v == 0.25));
    }

    #[test]
    fn missing_checkpoint_is_an_error() {
        let varmap = VarMap::new();
        let result = load_weights_best_effort(&varmap, "/nonexistent/weights.safetensors", &Device::Cpu);
        assert!(result.is_err());
    }
}
