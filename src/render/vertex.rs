//! Per-vertex splatting renderer.
//!
//! Shades statistical per-vertex albedo under SH illumination with a glossy
//! reflection lobe, splats to the nearest pixels with a z-buffer, and exposes
//! native coverage alpha. The cheapest of the three variants and the one used
//! while the statistical albedo is still being fitted.
use super::raster::{normal_at, rasterize, screen_space_geometry_grads, vertex_at, view_dir};
use super::sh::{backprop_irradiance, irradiance, reflect, sh_basis};
use super::{RenderGrads, RenderInputs, RenderOutput, Renderer, RendererKind};
use crate::image::{ImageF32, ImageRgbF32};
use crate::state::{SH_BANDS, SH_CHANNELS};
use nalgebra::DMatrix;

pub struct VertexRenderer;

impl VertexRenderer {
    pub fn new() -> Self {
        Self
    }

    fn shade(&self, inputs: &RenderInputs<'_>, v: usize) -> [f32; 3] {
        let n = normal_at(inputs, v);
        let e_d = irradiance(inputs.sh, &sh_basis(&n));
        let r = reflect(&view_dir(&vertex_at(inputs, v)), &n);
        let e_s = irradiance(inputs.sh, &sh_basis(&r));
        let mut out = [0.0f32; 3];
        for c in 0..3 {
            out[c] = inputs.diffuse_albedo[(v, c)] * e_d[c]
                + inputs.specular_albedo[(v, c)] * e_s[c];
        }
        out
    }
}

impl Default for VertexRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for VertexRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Vertex
    }

    fn has_native_alpha(&self) -> bool {
        true
    }

    fn render(&self, inputs: &RenderInputs<'_>) -> RenderOutput {
        let map = rasterize(inputs);
        let (w, h) = (inputs.width, inputs.height);
        let mut color = ImageRgbF32::new(w, h);
        let mut alpha = ImageF32::new(w, h);
        for y in 0..h {
            for x in 0..w {
                let v = map.owner[y * w + x];
                if v < 0 {
                    continue;
                }
                color.set_pixel(x, y, self.shade(inputs, v as usize));
                alpha.set(x, y, 1.0);
            }
        }
        RenderOutput {
            color,
            alpha: Some(alpha),
            owner: map.owner,
        }
    }

    fn backward(
        &self,
        inputs: &RenderInputs<'_>,
        output: &RenderOutput,
        d_color: &ImageRgbF32,
    ) -> RenderGrads {
        let (w, h) = (inputs.width, inputs.height);
        let v_count = inputs.camera_vertices.nrows();
        let mut d_diff = DMatrix::zeros(v_count, 3);
        let mut d_spec = DMatrix::zeros(v_count, 3);
        let mut d_sh = vec![0.0f32; SH_BANDS * SH_CHANNELS];
        for y in 0..h {
            for x in 0..w {
                let v = output.owner[y * w + x];
                if v < 0 {
                    continue;
                }
                let v = v as usize;
                let g = d_color.pixel(x, y);
                if g == [0.0, 0.0, 0.0] {
                    continue;
                }
                let n = normal_at(inputs, v);
                let basis_n = sh_basis(&n);
                let e_d = irradiance(inputs.sh, &basis_n);
                let r = reflect(&view_dir(&vertex_at(inputs, v)), &n);
                let basis_r = sh_basis(&r);
                let e_s = irradiance(inputs.sh, &basis_r);
                let mut d_e_d = [0.0f32; 3];
                let mut d_e_s = [0.0f32; 3];
                for c in 0..3 {
                    d_diff[(v, c)] += g[c] * e_d[c];
                    d_spec[(v, c)] += g[c] * e_s[c];
                    d_e_d[c] = g[c] * inputs.diffuse_albedo[(v, c)];
                    d_e_s[c] = g[c] * inputs.specular_albedo[(v, c)];
                }
                backprop_irradiance(&basis_n, &d_e_d, &mut d_sh);
                backprop_irradiance(&basis_r, &d_e_s, &mut d_sh);
            }
        }
        let (d_verts, d_focal) =
            screen_space_geometry_grads(inputs, &output.color, &output.owner, d_color);
        RenderGrads {
            diffuse_albedo: Some(d_diff),
            specular_albedo: Some(d_spec),
            diffuse_texture: None,
            specular_texture: None,
            roughness_texture: None,
            sh: d_sh,
            camera_vertices: d_verts,
            focal: d_focal,
        }
    }
}
