// THEORY:
// The `pipeline` module is the top-level API of the screening engine. It wires the
// three core stages together exactly the way a screening request flows:
//
//   raw photograph -> normalizer -> input tensor -> model inference -> severity mapper
//                                              \-> saliency generator (Grad-CAM)
//
// Grading and explaining consume the same tensor but are otherwise independent.
// Grading uses tape-free inference, so it never touches layer observers and can run
// while another request holds the model's attribution lock. The two results are
// combined into an `Analysis` for the caller (typically a serving layer that turns
// the report into JSON and the heatmap into an image).

use crate::core_modules::model::{RegressionModel, SharedModel};
use crate::core_modules::normalizer::{
    self, DEFAULT_BLUR_SIGMA, DEFAULT_TARGET_SIZE, NormalizedImage, RawImage,
};
use crate::core_modules::saliency::{self, DEFAULT_DISPLAY_SIZE, SaliencyMap};
use crate::core_modules::severity::{self, SeverityRecord};
use crate::core_modules::tensor::{InputTensor, to_input_tensor};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Layer observed by Grad-CAM when none is configured.
pub const DEFAULT_TARGET_LAYER: &str = "features";

/// Configuration for the ScreeningPipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningConfig {
    /// Side length of the normalized square image fed to the model.
    pub target_size: u32,
    /// Gaussian sigma of the background estimate in local contrast enhancement.
    pub blur_sigma: f32,
    /// Name of the model layer observed by Grad-CAM.
    pub target_layer: String,
    /// Side length of the rendered saliency heatmap.
    pub heatmap_size: u32,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            target_size: DEFAULT_TARGET_SIZE,
            blur_sigma: DEFAULT_BLUR_SIGMA,
            target_layer: DEFAULT_TARGET_LAYER.to_string(),
            heatmap_size: DEFAULT_DISPLAY_SIZE,
        }
    }
}

impl ScreeningConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let invalid = |name: &str, reason: &str| Error::InvalidParameter {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if self.target_size == 0 {
            return Err(invalid("target_size", "must be greater than 0"));
        }
        if !self.blur_sigma.is_finite() || self.blur_sigma <= 0.0 {
            return Err(invalid("blur_sigma", "must be a positive number"));
        }
        if self.target_layer.trim().is_empty() {
            return Err(invalid("target_layer", "must name a model layer"));
        }
        if self.heatmap_size == 0 {
            return Err(invalid("heatmap_size", "must be greater than 0"));
        }
        Ok(())
    }
}

/// The screening outcome handed to the serving layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreeningReport {
    pub condition: &'static str,
    pub severity: usize,
    pub confidence: f64,
    pub regions: Vec<&'static str>,
    pub description: &'static str,
    /// Model regression score rounded to two decimals.
    pub raw_score: f64,
}

impl ScreeningReport {
    pub fn new(record: SeverityRecord, raw_score: f64) -> Self {
        Self {
            condition: record.label,
            severity: record.stage,
            confidence: record.confidence,
            regions: record.regions,
            description: record.description,
            raw_score: severity::rounded_score(raw_score),
        }
    }
}

/// Both outputs of one screening run.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub report: ScreeningReport,
    pub saliency: SaliencyMap,
    pub normalized: NormalizedImage,
}

/// The main, top-level struct for the screening engine.
pub struct ScreeningPipeline<M> {
    config: ScreeningConfig,
    model: Arc<SharedModel<M>>,
}

impl<M: RegressionModel> ScreeningPipeline<M> {
    pub fn new(config: ScreeningConfig, model: Arc<SharedModel<M>>) -> Result<Self> {
        config.validate()?;
        info!(?config, "screening pipeline initialized");
        Ok(Self { config, model })
    }

    pub fn config(&self) -> &ScreeningConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<SharedModel<M>> {
        &self.model
    }

    /// Stage 1: normalize the photograph and tensorize it.
    pub fn preprocess(&self, image: &RawImage) -> Result<(NormalizedImage, InputTensor)> {
        let normalized =
            normalizer::normalize(image, self.config.blur_sigma, self.config.target_size)?;
        let tensor = to_input_tensor(&normalized);
        Ok((normalized, tensor))
    }

    /// Stage 2: run inference and grade the score.
    pub fn grade(&self, tensor: &InputTensor) -> Result<ScreeningReport> {
        let score = f64::from(self.model.model().infer(tensor)?);
        let record = severity::classify(score)?;
        info!(
            score,
            stage = record.stage,
            confidence = record.confidence,
            "graded fundus image"
        );
        Ok(ScreeningReport::new(record, score))
    }

    /// Stage 3: explain the model's output with a Grad-CAM map.
    pub fn explain(&self, tensor: &InputTensor) -> Result<SaliencyMap> {
        let map = saliency::explain(
            tensor,
            &self.model,
            &self.config.target_layer,
            self.config.heatmap_size,
        )?;
        Ok(map)
    }

    /// Grades a photograph without explaining it.
    pub fn screen(&self, image: &RawImage) -> Result<ScreeningReport> {
        let (_, tensor) = self.preprocess(image)?;
        self.grade(&tensor)
    }

    /// Grades and explains a photograph.
    pub fn analyze(&self, image: &RawImage) -> Result<Analysis> {
        let (normalized, tensor) = self.preprocess(image)?;
        let report = self.grade(&tensor)?;
        let saliency = self.explain(&tensor)?;
        Ok(Analysis {
            report,
            saliency,
            normalized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::patch_regressor::PatchRegressor;
    use crate::error::{NormalizeError, SaliencyError};
    use image::{Rgb, RgbImage};
    use ndarray::{Array4, Axis, arr1};

    /// Scores `head_bias + 4 * mean(red)` over 10x10 patches.
    fn red_sensitive_model(head_bias: f32) -> Arc<SharedModel<PatchRegressor>> {
        let mut kernels = Array4::zeros((1, 3, 10, 10));
        kernels.index_axis_mut(Axis(0), 0).index_axis_mut(Axis(0), 0).fill(0.01);
        let model = PatchRegressor::new(kernels, arr1(&[0.0]), arr1(&[4.0]), head_bias).unwrap();
        Arc::new(SharedModel::new(model))
    }

    fn small_config() -> ScreeningConfig {
        ScreeningConfig {
            target_size: 60,
            blur_sigma: 4.0,
            heatmap_size: 60,
            ..ScreeningConfig::default()
        }
    }

    fn fundus() -> RawImage {
        RgbImage::from_fn(120, 90, |x, y| {
            if (20..100).contains(&x) && (10..80).contains(&y) {
                Rgb([(x * 2) as u8, 80, 40])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    #[test]
    fn default_config_matches_the_screening_constants() {
        let config = ScreeningConfig::default();
        assert_eq!(config.target_size, 300);
        assert_eq!(config.blur_sigma, 10.0);
        assert_eq!(config.heatmap_size, 300);
        assert_eq!(config.target_layer, "features");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ScreeningConfig {
            blur_sigma: -1.0,
            ..ScreeningConfig::default()
        };
        let err = ScreeningPipeline::new(config, red_sensitive_model(0.0)).err().unwrap();
        assert!(matches!(err, Error::InvalidParameter { ref name, .. } if name == "blur_sigma"));
    }

    #[test]
    fn partial_json_config_falls_back_to_defaults() {
        let config: ScreeningConfig = serde_json::from_str(r#"{ "target_size": 224 }"#).unwrap();
        assert_eq!(config.target_size, 224);
        assert_eq!(config.blur_sigma, DEFAULT_BLUR_SIGMA);
        assert_eq!(config.target_layer, DEFAULT_TARGET_LAYER);
    }

    #[test]
    fn analysis_combines_report_and_heatmap() {
        let pipeline = ScreeningPipeline::new(small_config(), red_sensitive_model(0.0)).unwrap();
        let analysis = pipeline.analyze(&fundus()).unwrap();

        assert!(analysis.report.severity <= 4);
        assert!((72.0..=99.4).contains(&analysis.report.confidence));
        assert_eq!(analysis.saliency.values().dim(), (60, 60));
        assert_eq!(analysis.normalized.size(), 60);
        let peak = analysis.saliency.max();
        assert!(peak == 1.0 || peak == 0.0);
    }

    #[test]
    fn report_uses_the_model_score() {
        // A constant bias dominates: black input scores exactly the bias.
        let pipeline = ScreeningPipeline::new(small_config(), red_sensitive_model(2.5)).unwrap();
        let (_, tensor) = pipeline.preprocess(&fundus()).unwrap();
        let zeros = InputTensor::zeros(tensor.raw_dim());
        let report = pipeline.grade(&zeros).unwrap();

        assert_eq!(report.severity, 3);
        assert_eq!(report.condition, "Severe Non-Proliferative DR");
        assert_eq!(report.regions, vec!["Optic Disc", "Macula", "Vessels"]);
        assert_eq!(report.raw_score, 2.5);
    }

    #[test]
    fn report_serializes_with_serving_field_names() {
        let report = ScreeningReport::new(severity::classify(0.0).unwrap(), 0.004);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["condition"], "No Diabetic Retinopathy");
        assert_eq!(json["severity"], 0);
        assert_eq!(json["confidence"], 99.4);
        assert_eq!(json["regions"], serde_json::json!([]));
        assert_eq!(json["raw_score"], 0.0);
    }

    #[test]
    fn stage_errors_propagate_unchanged() {
        let pipeline = ScreeningPipeline::new(small_config(), red_sensitive_model(0.0)).unwrap();
        let err = pipeline.screen(&RgbImage::new(0, 0)).unwrap_err();
        assert!(matches!(err, Error::Normalize(NormalizeError::InvalidImage { .. })));

        let config = ScreeningConfig {
            target_layer: "missing".to_string(),
            ..small_config()
        };
        let pipeline = ScreeningPipeline::new(config, red_sensitive_model(0.0)).unwrap();
        let err = pipeline.analyze(&fundus()).unwrap_err();
        assert!(matches!(err, Error::Saliency(SaliencyError::LayerNotCaptured { .. })));
    }
}
