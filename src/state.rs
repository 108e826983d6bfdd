//! Mutable parameter state shared by every optimization stage.
//!
//! [`FitState`] is the single source of truth for one fitting run: coefficient
//! blocks for geometry and reflectance, per-frame pose and camera intrinsics,
//! spherical-harmonic illumination, and the optional per-texel maps produced by
//! the refinement stage. The driver mutates it in place; the scheduler and the
//! loss composer only read it.
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Number of spherical-harmonic bands kept per color channel.
pub const SH_BANDS: usize = 9;
/// Color channels per SH band.
pub const SH_CHANNELS: usize = 3;

/// Identifies one optimizable block of [`FitState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamField {
    Shape,
    Expression,
    Albedo,
    Rotation,
    Translation,
    Focal,
    SphericalHarmonics,
    DiffuseTexture,
    SpecularTexture,
    RoughnessTexture,
}

impl ParamField {
    /// Stable name used in logs and reports.
    pub fn name(self) -> &'static str {
        match self {
            ParamField::Shape => "shape",
            ParamField::Expression => "expression",
            ParamField::Albedo => "albedo",
            ParamField::Rotation => "rotation",
            ParamField::Translation => "translation",
            ParamField::Focal => "focal",
            ParamField::SphericalHarmonics => "sh",
            ParamField::DiffuseTexture => "diffuse_texture",
            ParamField::SpecularTexture => "specular_texture",
            ParamField::RoughnessTexture => "roughness_texture",
        }
    }
}

/// Selects one of the per-texel map slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureChannel {
    Diffuse,
    Specular,
    Roughness,
}

/// A stack of per-identity texture maps: one map when the identity is shared,
/// one per frame otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextureStack {
    pub count: usize,
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl TextureStack {
    pub fn zeros(count: usize, width: usize, height: usize, channels: usize) -> Self {
        Self {
            count,
            width,
            height,
            channels,
            data: vec![0.0; count * width * height * channels],
        }
    }

    #[inline]
    pub fn map_len(&self) -> usize {
        self.width * self.height * self.channels
    }

    #[inline]
    /// Linear index of channel `c` of texel (x, y) in map `map`.
    pub fn idx(&self, map: usize, x: usize, y: usize, c: usize) -> usize {
        map * self.map_len() + (y * self.width + x) * self.channels + c
    }

    #[inline]
    pub fn get(&self, map: usize, x: usize, y: usize, c: usize) -> f32 {
        self.data[self.idx(map, x, y, c)]
    }

    #[inline]
    pub fn set(&mut self, map: usize, x: usize, y: usize, c: usize, v: f32) {
        let i = self.idx(map, x, y, c);
        self.data[i] = v;
    }

    /// Clamp every texel into `[lo, hi]` in place.
    pub fn clamp_in_place(&mut self, lo: f32, hi: f32) {
        for v in &mut self.data {
            *v = v.clamp(lo, hi);
        }
    }
}

/// Sizing information required to build a neutral [`FitState`].
#[derive(Clone, Debug)]
pub struct StateInit {
    pub frames: usize,
    pub shared_identity: bool,
    pub shape_dim: usize,
    pub expression_dim: usize,
    pub albedo_dim: usize,
    pub screen_width: usize,
    pub screen_height: usize,
    pub initial_focal: f32,
}

/// All fit coefficients for one run. See module docs for the sharing rules.
#[derive(Clone, Debug)]
pub struct FitState {
    /// Identity geometry coefficients; 1 row if `shared_identity`, else one per frame.
    pub shape_coeff: DMatrix<f32>,
    /// Identity reflectance coefficients; same sharing rule as shape.
    pub albedo_coeff: DMatrix<f32>,
    /// Per-frame expression coefficients.
    pub expression_coeff: DMatrix<f32>,
    /// Per-frame Euler rotation (radians), frames × 3.
    pub rotation: DMatrix<f32>,
    /// Per-frame translation, frames × 3.
    pub translation: DMatrix<f32>,
    /// Per-frame focal length in pixels.
    pub focal: DVector<f32>,
    /// Per-frame SH illumination, frames × (SH_BANDS · SH_CHANNELS), band-major.
    pub sh_coeff: DMatrix<f32>,
    /// Refined per-texel maps; `None` until the refinement stage produces them.
    pub enhanced_diffuse: Option<TextureStack>,
    pub enhanced_specular: Option<TextureStack>,
    pub enhanced_roughness: Option<TextureStack>,
    pub screen_width: usize,
    pub screen_height: usize,
    pub shared_identity: bool,
    pub frames: usize,
}

impl FitState {
    /// Build a neutral state: zero coefficients, identity pose, ambient light.
    pub fn new(init: &StateInit) -> Self {
        let identity_rows = if init.shared_identity { 1 } else { init.frames };
        let mut sh_coeff = DMatrix::zeros(init.frames, SH_BANDS * SH_CHANNELS);
        for f in 0..init.frames {
            // Neutral ambient term so the first render is not black.
            for c in 0..SH_CHANNELS {
                sh_coeff[(f, c)] = 0.8;
            }
        }
        Self {
            shape_coeff: DMatrix::zeros(identity_rows, init.shape_dim),
            albedo_coeff: DMatrix::zeros(identity_rows, init.albedo_dim),
            expression_coeff: DMatrix::zeros(init.frames, init.expression_dim),
            rotation: DMatrix::zeros(init.frames, 3),
            translation: DMatrix::zeros(init.frames, 3),
            focal: DVector::from_element(init.frames, init.initial_focal),
            sh_coeff,
            enhanced_diffuse: None,
            enhanced_specular: None,
            enhanced_roughness: None,
            screen_width: init.screen_width,
            screen_height: init.screen_height,
            shared_identity: init.shared_identity,
            frames: init.frames,
        }
    }

    /// Row index into identity-shared blocks (shape, albedo, textures) for
    /// frame `i`: 0 when the identity is shared, `i` otherwise.
    #[inline]
    pub fn identity_index(&self, frame: usize) -> usize {
        if self.shared_identity {
            0
        } else {
            frame
        }
    }

    /// Borrow the enhanced map for `channel`, if the refinement stage has
    /// produced one.
    pub fn enhanced(&self, channel: TextureChannel) -> Option<&TextureStack> {
        match channel {
            TextureChannel::Diffuse => self.enhanced_diffuse.as_ref(),
            TextureChannel::Specular => self.enhanced_specular.as_ref(),
            TextureChannel::Roughness => self.enhanced_roughness.as_ref(),
        }
    }

    /// Resolve the texture to render with: the enhanced map when present,
    /// otherwise the model-derived fallback. Every call site that needs a
    /// texture goes through here so the replacement rule cannot diverge.
    pub fn resolved_texture(
        &self,
        channel: TextureChannel,
        model_derived: impl FnOnce() -> TextureStack,
    ) -> TextureStack {
        match self.enhanced(channel) {
            Some(t) => t.clone(),
            None => model_derived(),
        }
    }

    /// Mutable access to a coefficient block's backing storage, paired with
    /// the matching gradient slice by the optimizer.
    pub fn field_data_mut(&mut self, field: ParamField) -> Option<&mut [f32]> {
        match field {
            ParamField::Shape => Some(self.shape_coeff.as_mut_slice()),
            ParamField::Expression => Some(self.expression_coeff.as_mut_slice()),
            ParamField::Albedo => Some(self.albedo_coeff.as_mut_slice()),
            ParamField::Rotation => Some(self.rotation.as_mut_slice()),
            ParamField::Translation => Some(self.translation.as_mut_slice()),
            ParamField::Focal => Some(self.focal.as_mut_slice()),
            ParamField::SphericalHarmonics => Some(self.sh_coeff.as_mut_slice()),
            // Texture blocks live outside the state while a stage optimizes them.
            ParamField::DiffuseTexture
            | ParamField::SpecularTexture
            | ParamField::RoughnessTexture => None,
        }
    }
}

/// Gradient accumulator mirroring the coefficient blocks of [`FitState`].
#[derive(Clone, Debug)]
pub struct FitGradients {
    pub shape_coeff: DMatrix<f32>,
    pub albedo_coeff: DMatrix<f32>,
    pub expression_coeff: DMatrix<f32>,
    pub rotation: DMatrix<f32>,
    pub translation: DMatrix<f32>,
    pub focal: DVector<f32>,
    pub sh_coeff: DMatrix<f32>,
}

impl FitGradients {
    /// Zero gradients with the same shapes as `state`.
    pub fn zeros_like(state: &FitState) -> Self {
        Self {
            shape_coeff: DMatrix::zeros(state.shape_coeff.nrows(), state.shape_coeff.ncols()),
            albedo_coeff: DMatrix::zeros(state.albedo_coeff.nrows(), state.albedo_coeff.ncols()),
            expression_coeff: DMatrix::zeros(
                state.expression_coeff.nrows(),
                state.expression_coeff.ncols(),
            ),
            rotation: DMatrix::zeros(state.rotation.nrows(), state.rotation.ncols()),
            translation: DMatrix::zeros(state.translation.nrows(), state.translation.ncols()),
            focal: DVector::zeros(state.focal.len()),
            sh_coeff: DMatrix::zeros(state.sh_coeff.nrows(), state.sh_coeff.ncols()),
        }
    }

    /// Reset all accumulated gradients to zero.
    pub fn clear(&mut self) {
        self.shape_coeff.fill(0.0);
        self.albedo_coeff.fill(0.0);
        self.expression_coeff.fill(0.0);
        self.rotation.fill(0.0);
        self.translation.fill(0.0);
        self.focal.fill(0.0);
        self.sh_coeff.fill(0.0);
    }

    /// Borrow a block's gradient storage by field id.
    pub fn field_data(&self, field: ParamField) -> Option<&[f32]> {
        match field {
            ParamField::Shape => Some(self.shape_coeff.as_slice()),
            ParamField::Expression => Some(self.expression_coeff.as_slice()),
            ParamField::Albedo => Some(self.albedo_coeff.as_slice()),
            ParamField::Rotation => Some(self.rotation.as_slice()),
            ParamField::Translation => Some(self.translation.as_slice()),
            ParamField::Focal => Some(self.focal.as_slice()),
            ParamField::SphericalHarmonics => Some(self.sh_coeff.as_slice()),
            ParamField::DiffuseTexture
            | ParamField::SpecularTexture
            | ParamField::RoughnessTexture => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(frames: usize, shared: bool) -> StateInit {
        StateInit {
            frames,
            shared_identity: shared,
            shape_dim: 8,
            expression_dim: 4,
            albedo_dim: 6,
            screen_width: 64,
            screen_height: 48,
            initial_focal: 500.0,
        }
    }

    #[test]
    fn shared_identity_resolves_to_row_zero() {
        let state = FitState::new(&init(5, true));
        assert_eq!(state.shape_coeff.nrows(), 1);
        assert_eq!(state.albedo_coeff.nrows(), 1);
        for i in 0..5 {
            assert_eq!(state.identity_index(i), 0);
        }
    }

    #[test]
    fn per_frame_identity_keeps_one_row_per_frame() {
        let state = FitState::new(&init(3, false));
        assert_eq!(state.shape_coeff.nrows(), 3);
        for i in 0..3 {
            assert_eq!(state.identity_index(i), i);
        }
    }

    #[test]
    fn enhanced_texture_takes_precedence_once_present() {
        let mut state = FitState::new(&init(1, true));
        let fallback = || TextureStack::zeros(1, 4, 4, 3);
        let resolved = state.resolved_texture(TextureChannel::Diffuse, fallback);
        assert_eq!(resolved.data.iter().copied().sum::<f32>(), 0.0);

        let mut refined = TextureStack::zeros(1, 4, 4, 3);
        refined.set(0, 1, 1, 0, 0.7);
        state.enhanced_diffuse = Some(refined.clone());
        let resolved = state.resolved_texture(TextureChannel::Diffuse, fallback);
        assert_eq!(resolved, refined);
    }
}
