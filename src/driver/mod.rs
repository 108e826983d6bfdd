//! Optimization driver: the staged fitting controller.
//!
//! [`FaceFitter`] owns the collaborators (model, renderer, detector), the
//! output layout and the mutable [`FitState`], and walks the three stages
//! strictly in order — pose from landmarks, photometric appearance, texture
//! refinement — persisting a loss plot and a checkpoint at every stage
//! boundary. Stage internals live in the `stages` submodule.
mod stages;

use crate::camera::estimate_pose;
use crate::checkpoint;
use crate::config::FitConfig;
use crate::export::{self, texture_to_rgb};
use crate::image::plot::save_loss_plot;
use crate::image::{self, load_input_frames, write_json_file, ImageRgbF32, InputBatch};
use crate::landmarks::{LandmarkDetector, LandmarkSet};
use crate::model::{LinearFaceModel, MorphableModel};
use crate::render::Renderer;
use crate::schedule::{FitStage, StageScheduler};
use crate::state::{FitState, StateInit, TextureChannel};
use crate::types::{FitReport, StageSummary};
use log::{debug, info};
use nalgebra::DVector;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Which stages to run and where to resume from.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub skip_pose: bool,
    pub skip_appearance: bool,
    pub skip_texture: bool,
    /// Checkpoint to restore before the first stage; a missing file is fatal.
    pub resume_checkpoint: Option<PathBuf>,
}

/// Staged fitting controller. One instance per run.
pub struct FaceFitter {
    pub(crate) config: FitConfig,
    pub(crate) model: Box<dyn MorphableModel>,
    pub(crate) renderer: Box<dyn Renderer>,
    detector: Box<dyn LandmarkDetector>,
    pub(crate) scheduler: StageScheduler,
    output_dir: PathBuf,
    pub(crate) debug_dir: PathBuf,
    pub(crate) input: Option<InputBatch>,
    /// Gamma-decoded (linear) targets, one per frame.
    pub(crate) target_linear: Vec<ImageRgbF32>,
    pub(crate) landmarks: Vec<LandmarkSet>,
    pub(crate) state: Option<FitState>,
}

impl FaceFitter {
    /// Build a fitter with the collaborators selected by `config`.
    pub fn new(output_dir: &Path, config: FitConfig) -> Self {
        let model = Box::new(LinearFaceModel::new(&config.model));
        let renderer = config.renderer.create();
        let detector = config.detector.create();
        Self::with_collaborators(output_dir, config, model, renderer, detector)
    }

    /// Seam for substituting any collaborator (used by tests and by callers
    /// with a real model asset).
    pub fn with_collaborators(
        output_dir: &Path,
        config: FitConfig,
        model: Box<dyn MorphableModel>,
        renderer: Box<dyn Renderer>,
        detector: Box<dyn LandmarkDetector>,
    ) -> Self {
        let scheduler = StageScheduler::new(config.schedule.clone());
        Self {
            config,
            model,
            renderer,
            detector,
            scheduler,
            output_dir: output_dir.to_path_buf(),
            debug_dir: output_dir.join("debug"),
            input: None,
            target_linear: Vec::new(),
            landmarks: Vec::new(),
            state: None,
        }
    }

    /// Current parameter state, once an input has been set.
    pub fn state(&self) -> Option<&FitState> {
        self.state.as_ref()
    }

    /// Load an image (or directory of images), detect landmarks, and build a
    /// neutral parameter state with a landmark-estimated pose.
    pub fn set_input(&mut self, path: &Path, shared_identity: bool) -> Result<(), String> {
        let batch = load_input_frames(path)?;
        self.set_input_batch(batch, shared_identity)
    }

    /// Same as [`set_input`](Self::set_input) for frames already in memory.
    pub fn set_input_batch(
        &mut self,
        batch: InputBatch,
        shared_identity: bool,
    ) -> Result<(), String> {
        if batch.is_empty() {
            return Err("Input batch contains no frames".to_string());
        }
        info!(
            "loaded {} frame(s) at {}x{}, detecting landmarks",
            batch.len(),
            batch.width,
            batch.height
        );
        let landmarks = self.detector.detect(&batch.frames)?;
        if landmarks.len() != batch.len() {
            return Err(format!(
                "Detector returned {} landmark sets for {} frames",
                landmarks.len(),
                batch.len()
            ));
        }

        let dims = self.model.dims();
        let mut state = FitState::new(&StateInit {
            frames: batch.len(),
            shared_identity,
            shape_dim: dims.shape,
            expression_dim: dims.expression,
            albedo_dim: dims.albedo,
            screen_width: batch.width,
            screen_height: batch.height,
            initial_focal: self.config.initial_focal,
        });

        // Always initialize the head pose from the detected landmarks.
        let center = batch.center();
        let assoc = self.model.landmark_association();
        for f in 0..batch.len() {
            let idx = state.identity_index(f);
            let shape = state.shape_coeff.row(idx).transpose();
            let expr = state.expression_coeff.row(f).transpose();
            let vertices = self.model.compute_shape(&shape, &expr);
            let mut head_points = nalgebra::DMatrix::zeros(assoc.len(), 3);
            for (i, &v) in assoc.iter().enumerate() {
                for c in 0..3 {
                    head_points[(i, c)] = vertices[(v, c)];
                }
            }
            let (rot, trans) = estimate_pose(state.focal[f], &center, &landmarks[f], &head_points);
            for c in 0..3 {
                state.rotation[(f, c)] = rot[c];
                state.translation[(f, c)] = trans[c];
            }
            debug!(
                "frame {f}: pose init t=({:.1}, {:.1}, {:.1})",
                trans[0], trans[1], trans[2]
            );
        }

        self.target_linear = batch
            .frames
            .iter()
            .map(|frame| {
                let mut linear = frame.clone();
                linear.pow_in_place(self.config.gamma);
                linear
            })
            .collect();
        self.landmarks = landmarks;
        self.input = Some(batch);
        self.state = Some(state);
        Ok(())
    }

    /// Restore a checkpoint over the current state. Restored blocks rejoin
    /// the optimizable set automatically since the active field set is
    /// re-derived from the stage plan at every iteration.
    pub fn load_checkpoint(&mut self, path: &Path) -> Result<(), String> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| "Cannot resume: no input has been set".to_string())?;
        checkpoint::load(path, state)
    }

    /// Run the configured stages in order and export the final artifacts.
    pub fn run(&mut self, options: &RunOptions) -> Result<FitReport, String> {
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| "No input frames loaded".to_string())?;
        let (frames, width, height) = (input.len(), input.width, input.height);

        if let Some(cp) = &options.resume_checkpoint {
            info!("resuming optimization from checkpoint {}", cp.display());
            self.load_checkpoint(cp)?;
        }

        let start = Instant::now();
        let mut summaries = Vec::new();

        if !options.skip_pose {
            summaries.push(self.run_stage(FitStage::Pose)?);
            if self.config.save_intermediate_stages {
                self.export_artifacts(&self.output_dir.join("stage1"), "stage1_")?;
            }
        }
        if !options.skip_appearance {
            summaries.push(self.run_stage(FitStage::Appearance)?);
            if self.config.save_intermediate_stages {
                self.export_artifacts(&self.output_dir.join("stage2"), "stage2_")?;
            }
        }
        if !options.skip_texture {
            summaries.push(self.run_stage(FitStage::Texture)?);
        }

        let total_ms = start.elapsed().as_secs_f64() * 1000.0;
        let shared_identity = self.state.as_ref().map(|s| s.shared_identity).unwrap_or(false);
        let report = FitReport {
            frames,
            width,
            height,
            shared_identity,
            renderer: self.renderer.kind().name(),
            detector: self.config.detector.name(),
            stages: summaries,
            total_ms,
        };

        self.export_artifacts(&self.output_dir, "")?;
        write_json_file(&self.output_dir.join("report.json"), &report)?;
        let minutes = total_ms / 60_000.0;
        std::fs::write(
            self.output_dir.join("run_time.txt"),
            format!("took {minutes:.2} minutes to optimize\n"),
        )
        .map_err(|e| format!("Failed to write run-time report: {e}"))?;
        info!("optimization finished in {minutes:.2} minutes");
        Ok(report)
    }

    fn run_stage(&mut self, stage: FitStage) -> Result<StageSummary, String> {
        let start = Instant::now();
        let losses = match stage {
            FitStage::Pose => self.run_pose_stage()?,
            FitStage::Appearance => self.run_appearance_stage()?,
            FitStage::Texture => self.run_texture_stage()?,
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let checkpoints = self.output_dir.join("checkpoints");
        save_loss_plot(
            &checkpoints.join(format!("stage{}_loss.png", stage.index())),
            &losses,
        )?;
        write_json_file(
            &checkpoints.join(format!("stage{}_loss.json", stage.index())),
            &losses,
        )?;
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| "Parameter state vanished mid-run".to_string())?;
        checkpoint::save(
            &checkpoints.join(format!("stage{}_checkpoint.json", stage.index())),
            state,
        )?;

        Ok(StageSummary {
            stage: stage.name(),
            iterations: losses.len(),
            initial_loss: losses.first().copied(),
            final_loss: losses.last().copied(),
            elapsed_ms,
        })
    }

    /// Export mesh, texture maps, reconstruction and overlay for every frame.
    pub fn export_artifacts(&self, dir: &Path, prefix: &str) -> Result<(), String> {
        let state = match &self.state {
            Some(s) => s,
            None => return Ok(()),
        };
        info!("saving artifacts to {}", dir.display());
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Failed to create {}: {e}", dir.display()))?;

        let textures = self.stage_textures(state);
        for f in 0..state.frames {
            let eval = self.forward_frame(state, f, Some(&textures));
            let idx = state.identity_index(f);

            let diffuse_img = texture_to_rgb(&textures.diffuse, idx);
            let diffuse_name = format!("{prefix}diffuse_map_{idx}.png");
            image::io::save_rgb_png(&dir.join(&diffuse_name), &diffuse_img, None)?;
            image::io::save_rgb_png(
                &dir.join(format!("{prefix}specular_map_{idx}.png")),
                &texture_to_rgb(&textures.specular, idx),
                None,
            )?;
            image::io::save_rgb_png(
                &dir.join(format!("{prefix}roughness_map_{idx}.png")),
                &texture_to_rgb(&textures.roughness, idx),
                None,
            )?;

            image::io::save_rgb_png(
                &dir.join(format!("{prefix}reconstruction_{f}.png")),
                &eval.output.color,
                Some(self.config.gamma),
            )?;
            if let Some(input) = &self.input {
                let over = export::overlay(&input.frames[f], &eval.output.color, &eval.mask);
                image::io::save_rgb_png(
                    &dir.join(format!("{prefix}overlay_{f}.png")),
                    &over,
                    None,
                )?;
            }

            export::save_obj(
                &dir.join(format!("{prefix}mesh_{f}.obj")),
                &format!("{prefix}mesh_{f}.mtl"),
                &eval.camera_vertices,
                self.model.faces(),
                &eval.normals,
                self.model.uv_map(),
                &diffuse_name,
            )?;
        }
        Ok(())
    }

    /// Resolved texture stacks for rendering and export: refined maps when
    /// the texture stage has produced them, model-derived otherwise.
    pub(crate) fn stage_textures(&self, state: &FitState) -> stages::StageTextures {
        let identity_rows = state.shape_coeff.nrows();
        let (tw, th) = self.model.texture_size();
        let diffuse = state.resolved_texture(TextureChannel::Diffuse, || {
            self.generate_texture_stack(state, identity_rows, 3, false)
        });
        let specular = state.resolved_texture(TextureChannel::Specular, || {
            self.generate_texture_stack(state, identity_rows, 3, true)
        });
        let roughness = state.resolved_texture(TextureChannel::Roughness, || {
            let mut stack = crate::state::TextureStack::zeros(identity_rows, tw, th, 1);
            stack.data.fill(self.model.default_roughness());
            stack
        });
        stages::StageTextures {
            diffuse,
            specular,
            roughness,
        }
    }

    /// Build a model-derived texture stack from the current albedo
    /// coefficients (diffuse or specular channel).
    fn generate_texture_stack(
        &self,
        state: &FitState,
        identity_rows: usize,
        channels: usize,
        specular: bool,
    ) -> crate::state::TextureStack {
        let (tw, th) = self.model.texture_size();
        let mut stack = crate::state::TextureStack::zeros(identity_rows, tw, th, channels);
        for idx in 0..identity_rows {
            let albedo: DVector<f32> = state.albedo_coeff.row(idx).transpose();
            let (diff, spec) = self.model.compute_albedo(&albedo);
            let per_vertex = if specular { spec } else { diff };
            let map = self.model.generate_texture(&per_vertex);
            let start = idx * stack.map_len();
            stack.data[start..start + map.len()].copy_from_slice(&map);
        }
        stack
    }
}
