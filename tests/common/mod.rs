//! Synthetic-scene helpers shared by the integration tests.
//!
//! Renders a ground-truth face with the bundled linear model and the vertex
//! renderer, then gamma-encodes it so it looks like a photograph to the
//! fitting pipeline.
use face_fitter::camera::transform_vertices;
use face_fitter::config::FitConfig;
use face_fitter::image::InputBatch;
use face_fitter::model::{LinearFaceModel, MorphableModel};
use face_fitter::render::{RenderInputs, Renderer, VertexRenderer};
use face_fitter::state::{SH_BANDS, SH_CHANNELS};
use nalgebra::DVector;

pub const FRAME_W: usize = 48;
pub const FRAME_H: usize = 48;

/// A configuration small enough for test runtimes: tiny model, tiny frames,
/// short stages.
pub fn small_config() -> FitConfig {
    let mut cfg = FitConfig::default();
    cfg.model.grid = 10;
    cfg.model.shape_dim = 6;
    cfg.model.expression_dim = 4;
    cfg.model.albedo_dim = 4;
    cfg.model.texture_size = 16;
    cfg.model.seed = 11;
    cfg.schedule.pose_iterations = 40;
    cfg.schedule.appearance_iterations = 40;
    cfg.schedule.texture_iterations = 8;
    cfg.schedule.unfreeze_iteration = 20;
    cfg.initial_focal = 60.0;
    cfg.debug_frequency = 0;
    cfg
}

/// One gamma-encoded frame of the ground-truth scene: the mean face, slightly
/// rotated and off-center, under warm ambient light.
pub fn synthetic_batch(cfg: &FitConfig) -> InputBatch {
    let model = LinearFaceModel::new(&cfg.model);
    let dims = model.dims();
    let shape = DVector::zeros(dims.shape);
    let expr = DVector::zeros(dims.expression);
    let albedo = DVector::zeros(dims.albedo);

    let vertices = model.compute_shape(&shape, &expr);
    let camera = transform_vertices(&vertices, &[0.04, -0.03, 0.02], &[4.0, -3.0, 240.0]);
    let normals = model.compute_normals(&camera);
    let (diffuse, specular) = model.compute_albedo(&albedo);
    let mut sh = vec![0.0f32; SH_BANDS * SH_CHANNELS];
    sh[0] = 1.0;
    sh[1] = 0.92;
    sh[2] = 0.85;

    let inputs = RenderInputs {
        camera_vertices: &camera,
        normals: &normals,
        faces: model.faces(),
        uv: model.uv_map(),
        diffuse_albedo: &diffuse,
        specular_albedo: &specular,
        diffuse_texture: None,
        specular_texture: None,
        roughness_texture: None,
        sh: &sh,
        focal: cfg.initial_focal,
        center: [FRAME_W as f32 * 0.5, FRAME_H as f32 * 0.5],
        width: FRAME_W,
        height: FRAME_H,
    };
    let renderer = VertexRenderer::new();
    let mut frame = renderer.render(&inputs).color;
    frame.clamp_in_place(0.0, 1.0);
    frame.pow_in_place(1.0 / cfg.gamma);
    InputBatch {
        frames: vec![frame],
        width: FRAME_W,
        height: FRAME_H,
    }
}

/// Moving average of `values` with the given window.
pub fn moving_average(values: &[f32], window: usize) -> Vec<f32> {
    if values.len() < window || window == 0 {
        return values.to_vec();
    }
    values
        .windows(window)
        .map(|w| w.iter().sum::<f32>() / window as f32)
        .collect()
}
