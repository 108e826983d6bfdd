//! Renderer seam: camera-space geometry plus reflectance to an RGBA image.
//!
//! Three interchangeable implementations share one uniform contract
//! ([`Renderer`]): a per-vertex splatting renderer shading statistical albedo
//! directly, and two texture-sampling path-tracer stand-ins, one of which
//! exposes no native alpha so the driver must close a coverage mask itself.
//! Dispatch is through [`RendererKind`] and a trait object, never by string.
//!
//! Each renderer also provides an analytic `backward`: exact gradients for
//! albedo, texture and illumination parameters, and screen-space approximate
//! gradients for geometry (render-image spatial gradients chained through the
//! projection Jacobian).
pub mod sh;

mod path;
mod raster;
mod vertex;

pub use self::path::{PathTracedAltRenderer, PathTracedRenderer};
pub use self::vertex::VertexRenderer;

use crate::image::{ImageF32, ImageRgbF32};
use nalgebra::DMatrix;
use serde::Deserialize;

/// Renderer selection, fixed at configuration time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RendererKind {
    /// Per-vertex splatting; shades statistical albedo, native alpha.
    Vertex,
    /// Texture-sampling renderer with native alpha.
    PathTraced,
    /// Alternate texture-sampling renderer; roughness-aware, no native alpha.
    PathTracedAlt,
}

impl RendererKind {
    /// Instantiate the renderer behind the uniform trait.
    pub fn create(self) -> Box<dyn Renderer> {
        match self {
            RendererKind::Vertex => Box::new(VertexRenderer::new()),
            RendererKind::PathTraced => Box::new(PathTracedRenderer::new(4)),
            RendererKind::PathTracedAlt => Box::new(PathTracedAltRenderer::new(4)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RendererKind::Vertex => "vertex",
            RendererKind::PathTraced => "path_traced",
            RendererKind::PathTracedAlt => "path_traced_alt",
        }
    }
}

/// Borrowed view of one texture map (one identity slice of a stack).
#[derive(Clone, Copy, Debug)]
pub struct TextureView<'a> {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub data: &'a [f32],
}

impl<'a> TextureView<'a> {
    /// Nearest-texel lookup at UV coordinates in [0, 1]².
    #[inline]
    pub fn sample(&self, u: f32, v: f32, c: usize) -> f32 {
        let (x, y) = self.texel_at(u, v);
        self.data[(y * self.width + x) * self.channels + c]
    }

    /// Texel coordinates addressed by a UV pair.
    #[inline]
    pub fn texel_at(&self, u: f32, v: f32) -> (usize, usize) {
        let x = (u.clamp(0.0, 1.0) * (self.width - 1) as f32).round() as usize;
        let y = (v.clamp(0.0, 1.0) * (self.height - 1) as f32).round() as usize;
        (x, y)
    }
}

/// Everything one frame's render consumes, borrowed from the driver.
pub struct RenderInputs<'a> {
    /// Camera-space vertices, V × 3.
    pub camera_vertices: &'a DMatrix<f32>,
    /// Camera-space unit normals, V × 3.
    pub normals: &'a DMatrix<f32>,
    /// Triangle list, used to estimate splat footprints.
    pub faces: &'a [[u32; 3]],
    /// Per-vertex UVs for texture sampling.
    pub uv: &'a [[f32; 2]],
    /// Per-vertex diffuse albedo, V × 3 (statistical path).
    pub diffuse_albedo: &'a DMatrix<f32>,
    /// Per-vertex specular albedo, V × 3 (statistical path).
    pub specular_albedo: &'a DMatrix<f32>,
    /// Diffuse texture map (texture path); `None` for the vertex renderer.
    pub diffuse_texture: Option<TextureView<'a>>,
    pub specular_texture: Option<TextureView<'a>>,
    pub roughness_texture: Option<TextureView<'a>>,
    /// 27 SH illumination coefficients, band-major RGB.
    pub sh: &'a [f32],
    pub focal: f32,
    pub center: [f32; 2],
    pub width: usize,
    pub height: usize,
}

/// Uniform render product: linear RGB color plus optional native coverage.
pub struct RenderOutput {
    pub color: ImageRgbF32,
    /// Native alpha/coverage; `None` when the renderer cannot provide one.
    pub alpha: Option<ImageF32>,
    /// Owning vertex per pixel (-1 where background), kept for backward.
    pub(crate) owner: Vec<i32>,
}

/// Gradients produced by a renderer's backward pass. Blocks a renderer does
/// not consume stay `None`.
pub struct RenderGrads {
    pub diffuse_albedo: Option<DMatrix<f32>>,
    pub specular_albedo: Option<DMatrix<f32>>,
    pub diffuse_texture: Option<Vec<f32>>,
    pub specular_texture: Option<Vec<f32>>,
    pub roughness_texture: Option<Vec<f32>>,
    /// 27-entry SH gradient.
    pub sh: Vec<f32>,
    pub camera_vertices: DMatrix<f32>,
    pub focal: f32,
}

/// Image-formation contract shared by all renderer variants.
pub trait Renderer {
    fn kind(&self) -> RendererKind;

    /// Whether `render` fills [`RenderOutput::alpha`]. When false the driver
    /// derives a closed vertex-coverage mask instead.
    fn has_native_alpha(&self) -> bool;

    /// Rasterize and shade one frame.
    fn render(&self, inputs: &RenderInputs<'_>) -> RenderOutput;

    /// Pull a pixel-space color gradient back onto the consumed parameters.
    fn backward(
        &self,
        inputs: &RenderInputs<'_>,
        output: &RenderOutput,
        d_color: &ImageRgbF32,
    ) -> RenderGrads;
}
