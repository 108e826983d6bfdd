//! Run configuration.
//!
//! A JSON config file is parsed into [`RawConfig`] (every knob optional) and
//! resolved against defaults into the dense [`FitConfig`] consumed by the
//! driver. Unknown enumerated values (renderer, detector) fail
//! deserialization and abort the run before any stage starts.
use crate::landmarks::DetectorKind;
use crate::loss::texture::TextureRegWeights;
use crate::model::LinearModelSpec;
use crate::render::RendererKind;
use crate::schedule::ScheduleParams;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Per-term loss weights, applied per stage as documented on each field.
#[derive(Clone, Debug)]
pub struct LossWeights {
    /// Photometric term (appearance and texture stages).
    pub photometric: f32,
    /// Landmark term during the pose stage.
    pub landmark_pose: f32,
    /// Landmark term during the appearance stage.
    pub landmark_appearance: f32,
    /// Landmark term during the texture stage.
    pub landmark_texture: f32,
    /// Expression prior during the pose stage.
    pub expression_reg_pose: f32,
    /// Statistical priors during the appearance and texture stages.
    pub shape_reg: f32,
    pub expression_reg: f32,
    pub albedo_reg: f32,
    /// Illumination energy penalty.
    pub sh_energy: f32,
    /// Scale applied to the summed texture regularizers.
    pub texture_blend: f32,
    pub diffuse_texture: TextureRegWeights,
    pub specular_texture: TextureRegWeights,
    pub roughness_texture: TextureRegWeights,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            photometric: 1000.0,
            landmark_pose: 1.0,
            landmark_appearance: 100.0,
            landmark_texture: 100.0,
            expression_reg_pose: 0.1,
            shape_reg: 0.001,
            expression_reg: 0.001,
            albedo_reg: 0.001,
            sh_energy: 1e-4,
            texture_blend: 0.2,
            diffuse_texture: TextureRegWeights {
                symmetry: 0.3,
                consistency: 1.0,
                smoothness: 0.1,
                uniformity: 0.0,
            },
            specular_texture: TextureRegWeights {
                symmetry: 0.3,
                consistency: 2.0,
                smoothness: 1.0,
                uniformity: 0.5,
            },
            roughness_texture: TextureRegWeights {
                symmetry: 0.1,
                consistency: 2.0,
                smoothness: 1.0,
                uniformity: 0.0,
            },
        }
    }
}

/// Dense, fully-resolved run configuration.
#[derive(Clone, Debug)]
pub struct FitConfig {
    pub schedule: ScheduleParams,
    pub weights: LossWeights,
    pub renderer: RendererKind,
    pub detector: DetectorKind,
    /// Gamma exponent used to linearize the target photographs.
    pub gamma: f32,
    /// Score against a Gaussian-smoothed render.
    pub smoothing: bool,
    /// Emit debug artifacts every N iterations; 0 disables them.
    pub debug_frequency: usize,
    pub initial_focal: f32,
    /// Export full artifacts after each stage, not only at run end.
    pub save_intermediate_stages: bool,
    pub model: LinearModelSpec,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleParams::default(),
            weights: LossWeights::default(),
            renderer: RendererKind::Vertex,
            detector: DetectorKind::Contrast,
            gamma: 2.2,
            smoothing: false,
            debug_frequency: 0,
            initial_focal: 1000.0,
            save_intermediate_stages: false,
            model: LinearModelSpec::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawTextureWeights {
    pub symmetry: Option<f32>,
    pub consistency: Option<f32>,
    pub smoothness: Option<f32>,
    pub uniformity: Option<f32>,
}

impl RawTextureWeights {
    fn resolve(&self, mut base: TextureRegWeights) -> TextureRegWeights {
        if let Some(v) = self.symmetry {
            base.symmetry = v;
        }
        if let Some(v) = self.consistency {
            base.consistency = v;
        }
        if let Some(v) = self.smoothness {
            base.smoothness = v;
        }
        if let Some(v) = self.uniformity {
            base.uniformity = v;
        }
        base
    }
}

/// Flat JSON view of the configuration; every knob is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub pose_iterations: Option<usize>,
    pub appearance_iterations: Option<usize>,
    pub texture_iterations: Option<usize>,
    pub optimize_focal: Option<bool>,
    pub unfreeze_iteration: Option<usize>,

    pub photometric_weight: Option<f32>,
    pub landmark_pose_weight: Option<f32>,
    pub landmark_appearance_weight: Option<f32>,
    pub landmark_texture_weight: Option<f32>,
    pub expression_reg_pose_weight: Option<f32>,
    pub shape_reg_weight: Option<f32>,
    pub expression_reg_weight: Option<f32>,
    pub albedo_reg_weight: Option<f32>,
    pub sh_energy_weight: Option<f32>,
    pub texture_blend_weight: Option<f32>,
    pub diffuse_texture_weights: RawTextureWeights,
    pub specular_texture_weights: RawTextureWeights,
    pub roughness_texture_weights: RawTextureWeights,

    pub renderer: Option<RendererKind>,
    pub detector: Option<DetectorKind>,
    pub gamma: Option<f32>,
    pub smoothing: Option<bool>,
    pub debug_frequency: Option<usize>,
    pub initial_focal: Option<f32>,
    pub save_intermediate_stages: Option<bool>,

    pub model_shape_dim: Option<usize>,
    pub model_expression_dim: Option<usize>,
    pub model_albedo_dim: Option<usize>,
    pub model_grid: Option<usize>,
    pub model_texture_size: Option<usize>,
    pub model_seed: Option<u64>,
}

impl RawConfig {
    pub fn resolve(&self) -> FitConfig {
        let mut cfg = FitConfig::default();
        if let Some(v) = self.pose_iterations {
            cfg.schedule.pose_iterations = v;
        }
        if let Some(v) = self.appearance_iterations {
            cfg.schedule.appearance_iterations = v;
        }
        if let Some(v) = self.texture_iterations {
            cfg.schedule.texture_iterations = v;
        }
        if let Some(v) = self.optimize_focal {
            cfg.schedule.optimize_focal = v;
        }
        if let Some(v) = self.unfreeze_iteration {
            cfg.schedule.unfreeze_iteration = v;
        }

        if let Some(v) = self.photometric_weight {
            cfg.weights.photometric = v;
        }
        if let Some(v) = self.landmark_pose_weight {
            cfg.weights.landmark_pose = v;
        }
        if let Some(v) = self.landmark_appearance_weight {
            cfg.weights.landmark_appearance = v;
        }
        if let Some(v) = self.landmark_texture_weight {
            cfg.weights.landmark_texture = v;
        }
        if let Some(v) = self.expression_reg_pose_weight {
            cfg.weights.expression_reg_pose = v;
        }
        if let Some(v) = self.shape_reg_weight {
            cfg.weights.shape_reg = v;
        }
        if let Some(v) = self.expression_reg_weight {
            cfg.weights.expression_reg = v;
        }
        if let Some(v) = self.albedo_reg_weight {
            cfg.weights.albedo_reg = v;
        }
        if let Some(v) = self.sh_energy_weight {
            cfg.weights.sh_energy = v;
        }
        if let Some(v) = self.texture_blend_weight {
            cfg.weights.texture_blend = v;
        }
        cfg.weights.diffuse_texture = self
            .diffuse_texture_weights
            .resolve(cfg.weights.diffuse_texture);
        cfg.weights.specular_texture = self
            .specular_texture_weights
            .resolve(cfg.weights.specular_texture);
        cfg.weights.roughness_texture = self
            .roughness_texture_weights
            .resolve(cfg.weights.roughness_texture);

        if let Some(v) = self.renderer {
            cfg.renderer = v;
        }
        if let Some(v) = self.detector {
            cfg.detector = v;
        }
        if let Some(v) = self.gamma {
            cfg.gamma = v;
        }
        if let Some(v) = self.smoothing {
            cfg.smoothing = v;
        }
        if let Some(v) = self.debug_frequency {
            cfg.debug_frequency = v;
        }
        if let Some(v) = self.initial_focal {
            cfg.initial_focal = v;
        }
        if let Some(v) = self.save_intermediate_stages {
            cfg.save_intermediate_stages = v;
        }

        if let Some(v) = self.model_shape_dim {
            cfg.model.shape_dim = v;
        }
        if let Some(v) = self.model_expression_dim {
            cfg.model.expression_dim = v;
        }
        if let Some(v) = self.model_albedo_dim {
            cfg.model.albedo_dim = v;
        }
        if let Some(v) = self.model_grid {
            cfg.model.grid = v;
        }
        if let Some(v) = self.model_texture_size {
            cfg.model.texture_size = v;
        }
        if let Some(v) = self.model_seed {
            cfg.model.seed = v;
        }
        cfg
    }
}

/// Load and resolve a JSON configuration file.
pub fn load_config(path: &Path) -> Result<FitConfig, String> {
    let contents = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config {}: {e}", path.display()))?;
    let raw: RawConfig = serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to parse config {}: {e}", path.display()))?;
    Ok(raw.resolve())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_resolves_to_defaults() {
        let raw: RawConfig = serde_json::from_str("{}").expect("parse");
        let cfg = raw.resolve();
        assert_eq!(cfg.renderer, RendererKind::Vertex);
        assert_eq!(cfg.detector, DetectorKind::Contrast);
        assert_eq!(cfg.schedule.unfreeze_iteration, 100);
        assert_eq!(cfg.weights.photometric, 1000.0);
    }

    #[test]
    fn knobs_override_defaults() {
        let raw: RawConfig = serde_json::from_str(
            r#"{
                "renderer": "path_traced_alt",
                "detector": "centroid",
                "appearance_iterations": 50,
                "smoothing": true,
                "specular_texture_weights": {"uniformity": 0.9}
            }"#,
        )
        .expect("parse");
        let cfg = raw.resolve();
        assert_eq!(cfg.renderer, RendererKind::PathTracedAlt);
        assert_eq!(cfg.detector, DetectorKind::Centroid);
        assert_eq!(cfg.schedule.appearance_iterations, 50);
        assert!(cfg.smoothing);
        assert_eq!(cfg.weights.specular_texture.uniformity, 0.9);
    }

    #[test]
    fn unknown_detector_name_is_rejected() {
        let parsed: Result<RawConfig, _> =
            serde_json::from_str(r#"{"detector": "neural_net_v9"}"#);
        assert!(parsed.is_err());
    }
}
