//! Per-stage optimization loops.
//!
//! Each loop walks the same skeleton: zero gradients, evaluate the forward
//! chain, compose the stage's loss, pull gradients back into the parameter
//! blocks, apply one Adam step to the fields the stage plan declares active
//! at this iteration, and record the scalar loss. The pose stage never
//! renders; the appearance and texture stages render every frame every
//! iteration.
use super::FaceFitter;
use crate::camera::{backprop_projection, backprop_transform, project_point, transform_vertices};
use crate::export::{self, texture_to_rgb};
use crate::image::filter::{close_mask, gaussian_smooth_rgb};
use crate::image::{io::save_gray_png, io::save_rgb_png, ImageF32, ImageRgbF32};
use crate::loss::{self, texture::reg_texture};
use crate::optim::{Adam, AdamParams};
use crate::render::{RenderInputs, RenderOutput, TextureView};
use crate::schedule::{FitStage, StagePlan};
use crate::state::{
    FitGradients, FitState, ParamField, TextureStack, SH_BANDS, SH_CHANNELS,
};
use log::{debug, info};
use nalgebra::{DMatrix, DVector};

/// Radius of the morphological closing applied to vertex-coverage masks when
/// the renderer exposes no native alpha.
const MASK_CLOSE_RADIUS: usize = 2;

/// The three texture stacks a stage renders with, resolved to either the
/// refined maps or the model-derived fallback.
pub(crate) struct StageTextures {
    pub diffuse: TextureStack,
    pub specular: TextureStack,
    pub roughness: TextureStack,
}

impl StageTextures {
    fn clamp_in_place(&mut self) {
        self.diffuse.clamp_in_place(0.0, 1.0);
        self.specular.clamp_in_place(0.0, 1.0);
        self.roughness.clamp_in_place(0.0, 1.0);
    }

    fn view(stack: &TextureStack, idx: usize) -> TextureView<'_> {
        let len = stack.map_len();
        TextureView {
            width: stack.width,
            height: stack.height,
            channels: stack.channels,
            data: &stack.data[idx * len..(idx + 1) * len],
        }
    }
}

/// Forward-chain products for one frame.
pub(crate) struct FrameEval {
    /// Model-space vertices before the rigid transform.
    pub vertices: DMatrix<f32>,
    pub camera_vertices: DMatrix<f32>,
    pub normals: DMatrix<f32>,
    pub diffuse_albedo: DMatrix<f32>,
    pub specular_albedo: DMatrix<f32>,
    /// This frame's 27 SH coefficients, band-major RGB.
    pub sh: Vec<f32>,
    pub output: RenderOutput,
    /// Fitting mask: native alpha, or the closed vertex-coverage mask.
    pub mask: ImageF32,
}

/// Landmark-term value plus its gradients through the projection.
struct LandmarkTerm {
    loss: f32,
    d_camera: DMatrix<f32>,
    d_focal: f32,
}

fn row_vec(m: &DMatrix<f32>, row: usize) -> DVector<f32> {
    m.row(row).transpose()
}

fn row3(m: &DMatrix<f32>, row: usize) -> [f32; 3] {
    [m[(row, 0)], m[(row, 1)], m[(row, 2)]]
}

fn add_row3(m: &mut DMatrix<f32>, row: usize, v: &[f32; 3]) {
    for c in 0..3 {
        m[(row, c)] += v[c];
    }
}

fn add_row(m: &mut DMatrix<f32>, row: usize, v: &DVector<f32>) {
    for k in 0..v.len() {
        m[(row, k)] += v[k];
    }
}

/// Coverage image from the per-pixel owner map.
fn coverage_mask(output: &RenderOutput, w: usize, h: usize) -> ImageF32 {
    let mut mask = ImageF32::new(w, h);
    for y in 0..h {
        for x in 0..w {
            if output.owner[y * w + x] >= 0 {
                mask.set(x, y, 1.0);
            }
        }
    }
    mask
}

impl FaceFitter {
    fn inputs_for<'a>(
        &'a self,
        state: &FitState,
        frame: usize,
        camera_vertices: &'a DMatrix<f32>,
        normals: &'a DMatrix<f32>,
        diffuse_albedo: &'a DMatrix<f32>,
        specular_albedo: &'a DMatrix<f32>,
        sh: &'a [f32],
        textures: Option<&'a StageTextures>,
    ) -> RenderInputs<'a> {
        let idx = state.identity_index(frame);
        RenderInputs {
            camera_vertices,
            normals,
            faces: self.model.faces(),
            uv: self.model.uv_map(),
            diffuse_albedo,
            specular_albedo,
            diffuse_texture: textures.map(|t| StageTextures::view(&t.diffuse, idx)),
            specular_texture: textures.map(|t| StageTextures::view(&t.specular, idx)),
            roughness_texture: textures.map(|t| StageTextures::view(&t.roughness, idx)),
            sh,
            focal: state.focal[frame],
            center: [
                state.screen_width as f32 * 0.5,
                state.screen_height as f32 * 0.5,
            ],
            width: state.screen_width,
            height: state.screen_height,
        }
    }

    /// Evaluate the full forward chain for one frame: morphable model, rigid
    /// transform, shading, and the fitting mask.
    pub(crate) fn forward_frame(
        &self,
        state: &FitState,
        frame: usize,
        textures: Option<&StageTextures>,
    ) -> FrameEval {
        let idx = state.identity_index(frame);
        let shape = row_vec(&state.shape_coeff, idx);
        let expr = row_vec(&state.expression_coeff, frame);
        let albedo = row_vec(&state.albedo_coeff, idx);
        let vertices = self.model.compute_shape(&shape, &expr);
        let camera_vertices = transform_vertices(
            &vertices,
            &row3(&state.rotation, frame),
            &row3(&state.translation, frame),
        );
        let normals = self.model.compute_normals(&camera_vertices);
        let (diffuse_albedo, specular_albedo) = self.model.compute_albedo(&albedo);
        let sh: Vec<f32> = (0..SH_BANDS * SH_CHANNELS)
            .map(|k| state.sh_coeff[(frame, k)])
            .collect();
        let inputs = self.inputs_for(
            state,
            frame,
            &camera_vertices,
            &normals,
            &diffuse_albedo,
            &specular_albedo,
            &sh,
            textures,
        );
        let output = self.renderer.render(&inputs);
        let mask = match &output.alpha {
            Some(alpha) => alpha.clone(),
            None => close_mask(
                &coverage_mask(&output, state.screen_width, state.screen_height),
                MASK_CLOSE_RADIUS,
            ),
        };
        FrameEval {
            vertices,
            camera_vertices,
            normals,
            diffuse_albedo,
            specular_albedo,
            sh,
            output,
            mask,
        }
    }

    /// Project the associated vertices and score them against this frame's
    /// detected landmarks; gradients flow to the camera-space vertices and
    /// the focal length.
    fn landmark_term(
        &self,
        state: &FitState,
        frame: usize,
        camera_vertices: &DMatrix<f32>,
        weight: f32,
    ) -> LandmarkTerm {
        let assoc = self.model.landmark_association();
        let focal = state.focal[frame];
        let center = [
            state.screen_width as f32 * 0.5,
            state.screen_height as f32 * 0.5,
        ];
        let projected: Vec<[f32; 2]> = assoc
            .iter()
            .map(|&v| {
                project_point(
                    &[
                        camera_vertices[(v, 0)],
                        camera_vertices[(v, 1)],
                        camera_vertices[(v, 2)],
                    ],
                    focal,
                    &center,
                )
            })
            .collect();
        let res = loss::landmark(
            &projected,
            &self.landmarks[frame],
            state.screen_width,
            state.screen_height,
            weight,
        );
        let mut d_camera = DMatrix::zeros(camera_vertices.nrows(), 3);
        let mut d_focal = 0.0f32;
        for (i, &v) in assoc.iter().enumerate() {
            let p = [
                camera_vertices[(v, 0)],
                camera_vertices[(v, 1)],
                camera_vertices[(v, 2)],
            ];
            let (d_point, df) = backprop_projection(&p, focal, &res.d_projected[i]);
            for c in 0..3 {
                d_camera[(v, c)] += d_point[c];
            }
            d_focal += df;
        }
        LandmarkTerm {
            loss: res.loss,
            d_camera,
            d_focal,
        }
    }

    /// Photometric term against the gamma-decoded target, optionally scored
    /// through a Gaussian-smoothed render; the gradient is smoothed back
    /// through the symmetric kernel.
    fn photometric_term(&self, eval: &FrameEval, frame: usize) -> (f32, ImageRgbF32) {
        let target = &self.target_linear[frame];
        let weight = self.config.weights.photometric;
        if self.config.smoothing {
            let smoothed = gaussian_smooth_rgb(&eval.output.color);
            let res = loss::photometric(&smoothed, target, &eval.mask, weight);
            (res.loss, gaussian_smooth_rgb(&res.d_render))
        } else {
            let res = loss::photometric(&eval.output.color, target, &eval.mask, weight);
            (res.loss, res.d_render)
        }
    }

    /// Step every field the plan declares active at `iteration`.
    fn step_active_fields(
        &self,
        state: &mut FitState,
        grads: &FitGradients,
        plan: &StagePlan,
        adam: &mut Adam,
        iteration: usize,
    ) {
        for (field, lr) in plan.active_fields(iteration) {
            if let (Some(data), Some(grad)) =
                (state.field_data_mut(field), grads.field_data(field))
            {
                adam.step(field, lr, data, grad);
            }
        }
    }

    fn maybe_emit_debug(
        &self,
        state: &FitState,
        stage: FitStage,
        iteration: usize,
    ) -> Result<(), String> {
        let freq = self.config.debug_frequency;
        if freq == 0 || iteration % freq != 0 {
            return Ok(());
        }
        let textures = self.stage_textures(state);
        self.emit_debug(state, stage, iteration, &textures)
    }

    /// Periodic debug snapshot: render | target | diff with the texture strip
    /// below, the fitting mask, and the frame-0 mesh.
    fn emit_debug(
        &self,
        state: &FitState,
        stage: FitStage,
        iteration: usize,
        textures: &StageTextures,
    ) -> Result<(), String> {
        let tag = format!("stage{}_iter{iteration:04}", stage.index());
        for f in 0..state.frames {
            let eval = self.forward_frame(state, f, Some(textures));
            let idx = state.identity_index(f);
            let target = &self.target_linear[f];
            let diff = export::abs_diff(&eval.output.color, target);
            let composed = export::compose_debug_frame(
                &eval.output.color,
                target,
                &diff,
                &texture_to_rgb(&textures.diffuse, idx),
                &texture_to_rgb(&textures.specular, idx),
                &texture_to_rgb(&textures.roughness, idx),
            );
            save_rgb_png(
                &self.debug_dir.join(format!("{tag}_frame{f}.png")),
                &composed,
                Some(self.config.gamma),
            )?;
            save_gray_png(
                &self.debug_dir.join(format!("{tag}_mask{f}.png")),
                &eval.mask,
            )?;
            if f == 0 {
                let diffuse_name = format!("{tag}_diffuse.png");
                save_rgb_png(
                    &self.debug_dir.join(&diffuse_name),
                    &texture_to_rgb(&textures.diffuse, idx),
                    None,
                )?;
                export::save_obj(
                    &self.debug_dir.join(format!("{tag}_mesh.obj")),
                    &format!("{tag}_mesh.mtl"),
                    &eval.camera_vertices,
                    self.model.faces(),
                    &eval.normals,
                    self.model.uv_map(),
                    &diffuse_name,
                )?;
            }
        }
        Ok(())
    }

    /// Stage 1: head pose and expression against the detected landmarks.
    pub(crate) fn run_pose_stage(&mut self) -> Result<Vec<f32>, String> {
        let mut state = self
            .state
            .take()
            .ok_or_else(|| "No parameter state; set an input first".to_string())?;
        let result = self.pose_loop(&mut state);
        self.state = Some(state);
        result
    }

    fn pose_loop(&self, state: &mut FitState) -> Result<Vec<f32>, String> {
        let plan = self.scheduler.plan(FitStage::Pose);
        info!(
            "stage 1 (pose): {} iterations, {} frame(s)",
            plan.iterations, state.frames
        );
        let weights = &self.config.weights;
        let mut adam = Adam::new(AdamParams::default());
        let mut grads = FitGradients::zeros_like(state);
        let mut history = Vec::with_capacity(plan.iterations);

        for iter in 0..plan.iterations {
            grads.clear();
            let mut total = 0.0f32;
            for f in 0..state.frames {
                let idx = state.identity_index(f);
                let shape = row_vec(&state.shape_coeff, idx);
                let expr = row_vec(&state.expression_coeff, f);
                let vertices = self.model.compute_shape(&shape, &expr);
                let rot = row3(&state.rotation, f);
                let camera_vertices =
                    transform_vertices(&vertices, &rot, &row3(&state.translation, f));

                let lt = self.landmark_term(state, f, &camera_vertices, weights.landmark_pose);
                total += lt.loss;

                let tg = backprop_transform(&vertices, &rot, &lt.d_camera);
                add_row3(&mut grads.rotation, f, &tg.rotation);
                add_row3(&mut grads.translation, f, &tg.translation);
                grads.focal[f] += lt.d_focal;
                let (d_shape, d_expr) = self.model.backprop_shape(&tg.vertices);
                add_row(&mut grads.shape_coeff, idx, &d_shape);
                add_row(&mut grads.expression_coeff, f, &d_expr);
            }

            let prior = loss::statistical_prior(
                &state.expression_coeff,
                self.model.expression_variance().as_slice(),
                weights.expression_reg_pose,
            );
            total += prior.loss;
            grads.expression_coeff += prior.d_coeff;

            self.step_active_fields(state, &grads, &plan, &mut adam, iter);
            history.push(total);
            debug!("stage1 iter {iter}: loss {total:.6}");
            self.maybe_emit_debug(state, FitStage::Pose, iter)?;
        }
        Ok(history)
    }

    /// Stage 2: photometric appearance under the statistical prior, with the
    /// late geometry promotion declared by the stage plan.
    pub(crate) fn run_appearance_stage(&mut self) -> Result<Vec<f32>, String> {
        let mut state = self
            .state
            .take()
            .ok_or_else(|| "No parameter state; set an input first".to_string())?;
        let result = self.appearance_loop(&mut state);
        self.state = Some(state);
        result
    }

    fn appearance_loop(&self, state: &mut FitState) -> Result<Vec<f32>, String> {
        let plan = self.scheduler.plan(FitStage::Appearance);
        info!(
            "stage 2 (appearance): {} iterations, geometry promoted at {}",
            plan.iterations, self.config.schedule.unfreeze_iteration
        );
        let weights = &self.config.weights;
        // Statistical textures only stand in while no refined maps exist; a
        // resumed refinement checkpoint wins and detaches albedo from them.
        let textures_follow_albedo = state.enhanced_diffuse.is_none();
        let mut adam = Adam::new(AdamParams::default());
        let mut grads = FitGradients::zeros_like(state);
        let mut history = Vec::with_capacity(plan.iterations);

        for iter in 0..plan.iterations {
            grads.clear();
            let mut total = 0.0f32;
            let mut textures = self.stage_textures(state);
            textures.clamp_in_place();

            for f in 0..state.frames {
                let idx = state.identity_index(f);
                let eval = self.forward_frame(state, f, Some(&textures));

                let (pm_loss, d_render) = self.photometric_term(&eval, f);
                total += pm_loss;
                let inputs = self.inputs_for(
                    state,
                    f,
                    &eval.camera_vertices,
                    &eval.normals,
                    &eval.diffuse_albedo,
                    &eval.specular_albedo,
                    &eval.sh,
                    Some(&textures),
                );
                let rg = self.renderer.backward(&inputs, &eval.output, &d_render);

                let lt = self.landmark_term(
                    state,
                    f,
                    &eval.camera_vertices,
                    weights.landmark_appearance,
                );
                total += lt.loss;

                let d_camera = &rg.camera_vertices + &lt.d_camera;
                let rot = row3(&state.rotation, f);
                let tg = backprop_transform(&eval.vertices, &rot, &d_camera);
                add_row3(&mut grads.rotation, f, &tg.rotation);
                add_row3(&mut grads.translation, f, &tg.translation);
                grads.focal[f] += rg.focal + lt.d_focal;
                let (d_shape, d_expr) = self.model.backprop_shape(&tg.vertices);
                add_row(&mut grads.shape_coeff, idx, &d_shape);
                add_row(&mut grads.expression_coeff, f, &d_expr);

                for (k, &g) in rg.sh.iter().enumerate() {
                    grads.sh_coeff[(f, k)] += g;
                }

                // Albedo gradient: direct per-vertex products from the
                // splatting renderer, or texel gradients scattered back to
                // vertices from the texture-sampling renderers.
                match (&rg.diffuse_albedo, &rg.specular_albedo) {
                    (Some(d_diff), Some(d_spec)) => {
                        let d_albedo = self.model.backprop_albedo(d_diff, d_spec);
                        add_row(&mut grads.albedo_coeff, idx, &d_albedo);
                    }
                    _ if textures_follow_albedo => {
                        let zeros = DMatrix::zeros(self.model.vertex_count(), 3);
                        let d_diff = rg
                            .diffuse_texture
                            .as_ref()
                            .map(|d| self.model.backprop_texture(d, 3));
                        let d_spec = rg
                            .specular_texture
                            .as_ref()
                            .map(|d| self.model.backprop_texture(d, 3));
                        if d_diff.is_some() || d_spec.is_some() {
                            let d_albedo = self.model.backprop_albedo(
                                d_diff.as_ref().unwrap_or(&zeros),
                                d_spec.as_ref().unwrap_or(&zeros),
                            );
                            add_row(&mut grads.albedo_coeff, idx, &d_albedo);
                        }
                    }
                    _ => {}
                }
            }

            let shape_prior = loss::statistical_prior(
                &state.shape_coeff,
                self.model.shape_variance().as_slice(),
                weights.shape_reg,
            );
            total += shape_prior.loss;
            grads.shape_coeff += shape_prior.d_coeff;
            let expr_prior = loss::statistical_prior(
                &state.expression_coeff,
                self.model.expression_variance().as_slice(),
                weights.expression_reg,
            );
            total += expr_prior.loss;
            grads.expression_coeff += expr_prior.d_coeff;
            let albedo_prior = loss::statistical_prior(
                &state.albedo_coeff,
                self.model.albedo_variance().as_slice(),
                weights.albedo_reg,
            );
            total += albedo_prior.loss;
            grads.albedo_coeff += albedo_prior.d_coeff;
            let sh_prior = loss::sh_energy(&state.sh_coeff, weights.sh_energy);
            total += sh_prior.loss;
            grads.sh_coeff += sh_prior.d_coeff;

            self.step_active_fields(state, &grads, &plan, &mut adam, iter);
            history.push(total);
            debug!("stage2 iter {iter}: loss {total:.6}");
            self.maybe_emit_debug(state, FitStage::Appearance, iter)?;
        }
        Ok(history)
    }

    /// Stage 3: per-texel refinement of the diffuse, specular and roughness
    /// maps with everything else frozen.
    pub(crate) fn run_texture_stage(&mut self) -> Result<Vec<f32>, String> {
        let mut state = self
            .state
            .take()
            .ok_or_else(|| "No parameter state; set an input first".to_string())?;
        let result = self.texture_loop(&mut state);
        self.state = Some(state);
        result
    }

    fn texture_loop(&self, state: &mut FitState) -> Result<Vec<f32>, String> {
        let plan = self.scheduler.plan(FitStage::Texture);
        info!("stage 3 (texture): {} iterations", plan.iterations);
        let weights = &self.config.weights;
        let identity_rows = state.shape_coeff.nrows();
        let (tw, th) = self.model.texture_size();

        // Consistency anchors stay at the statistical model's output even
        // when the maps themselves resume from a refinement checkpoint.
        let reference = StageTextures {
            diffuse: self.generate_texture_stack(state, identity_rows, 3, false),
            specular: self.generate_texture_stack(state, identity_rows, 3, true),
            roughness: {
                let mut stack = TextureStack::zeros(identity_rows, tw, th, 1);
                stack.data.fill(self.model.default_roughness());
                stack
            },
        };
        let mut textures = self.stage_textures(state);

        let mut adam = Adam::new(AdamParams::default());
        let mut history = Vec::with_capacity(plan.iterations);

        for iter in 0..plan.iterations {
            textures.clamp_in_place();
            let mut total = 0.0f32;
            let mut d_diffuse = vec![0.0f32; textures.diffuse.data.len()];
            let mut d_specular = vec![0.0f32; textures.specular.data.len()];
            let mut d_roughness = vec![0.0f32; textures.roughness.data.len()];

            for f in 0..state.frames {
                let idx = state.identity_index(f);
                let eval = self.forward_frame(state, f, Some(&textures));

                let (pm_loss, d_render) = self.photometric_term(&eval, f);
                total += pm_loss;
                let lt = self.landmark_term(
                    state,
                    f,
                    &eval.camera_vertices,
                    weights.landmark_texture,
                );
                total += lt.loss;

                let inputs = self.inputs_for(
                    state,
                    f,
                    &eval.camera_vertices,
                    &eval.normals,
                    &eval.diffuse_albedo,
                    &eval.specular_albedo,
                    &eval.sh,
                    Some(&textures),
                );
                let rg = self.renderer.backward(&inputs, &eval.output, &d_render);
                let offset_d = idx * textures.diffuse.map_len();
                if let Some(d) = &rg.diffuse_texture {
                    for (k, &g) in d.iter().enumerate() {
                        d_diffuse[offset_d + k] += g;
                    }
                }
                let offset_s = idx * textures.specular.map_len();
                if let Some(d) = &rg.specular_texture {
                    for (k, &g) in d.iter().enumerate() {
                        d_specular[offset_s + k] += g;
                    }
                }
                let offset_r = idx * textures.roughness.map_len();
                if let Some(d) = &rg.roughness_texture {
                    for (k, &g) in d.iter().enumerate() {
                        d_roughness[offset_r + k] += g;
                    }
                }
            }

            let blend = weights.texture_blend;
            let reg_d = reg_texture(&textures.diffuse, &reference.diffuse, &weights.diffuse_texture);
            total += blend * reg_d.loss;
            for (g, r) in d_diffuse.iter_mut().zip(reg_d.d_texture.iter()) {
                *g += blend * r;
            }
            let reg_s = reg_texture(
                &textures.specular,
                &reference.specular,
                &weights.specular_texture,
            );
            total += blend * reg_s.loss;
            for (g, r) in d_specular.iter_mut().zip(reg_s.d_texture.iter()) {
                *g += blend * r;
            }
            let reg_r = reg_texture(
                &textures.roughness,
                &reference.roughness,
                &weights.roughness_texture,
            );
            total += blend * reg_r.loss;
            for (g, r) in d_roughness.iter_mut().zip(reg_r.d_texture.iter()) {
                *g += blend * r;
            }

            for (field, lr) in plan.active_fields(iter) {
                match field {
                    ParamField::DiffuseTexture => {
                        adam.step(field, lr, &mut textures.diffuse.data, &d_diffuse)
                    }
                    ParamField::SpecularTexture => {
                        adam.step(field, lr, &mut textures.specular.data, &d_specular)
                    }
                    ParamField::RoughnessTexture => {
                        adam.step(field, lr, &mut textures.roughness.data, &d_roughness)
                    }
                    _ => {}
                }
            }
            history.push(total);
            debug!("stage3 iter {iter}: loss {total:.6}");
            if self.config.debug_frequency > 0 && iter % self.config.debug_frequency == 0 {
                self.emit_debug(state, FitStage::Texture, iter, &textures)?;
            }
        }

        textures.clamp_in_place();
        state.enhanced_diffuse = Some(textures.diffuse);
        state.enhanced_specular = Some(textures.specular);
        state.enhanced_roughness = Some(textures.roughness);
        Ok(history)
    }
}
