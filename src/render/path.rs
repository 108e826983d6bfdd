//! Texture-sampling renderer variants standing in for the path-traced
//! backends.
//!
//! Both sample diffuse/specular maps through the owning vertex's UVs and
//! shade under SH illumination with a multi-tap glossy lobe. The primary
//! variant exposes native alpha; the alternate variant is roughness-aware but
//! reports no coverage channel, so the driver closes a vertex mask for it.
use super::raster::{normal_at, rasterize, screen_space_geometry_grads, vertex_at, view_dir};
use super::sh::{backprop_irradiance, irradiance, reflect, sh_basis};
use super::{RenderGrads, RenderInputs, RenderOutput, Renderer, RendererKind, TextureView};
use crate::image::{ImageF32, ImageRgbF32};
use crate::state::{SH_BANDS, SH_CHANNELS};
use nalgebra::DMatrix;

/// Fixed tangent-space offsets for the glossy taps; the first `samples`
/// entries are used.
const TAPS: [[f32; 2]; 8] = [
    [0.0, 0.0],
    [1.0, 0.0],
    [-1.0, 0.0],
    [0.0, 1.0],
    [0.0, -1.0],
    [0.7, 0.7],
    [-0.7, 0.7],
    [0.7, -0.7],
];

struct Shaded {
    color: [f32; 3],
    e_diffuse: [f32; 3],
    e_glossy: [f32; 3],
    spec_scale: f32,
    tex_d: [f32; 3],
    tex_s: [f32; 3],
}

fn glossy_bases(r: &[f32; 3], spread: f32, samples: usize) -> Vec<[f32; SH_BANDS]> {
    // Tangent frame around the reflection direction.
    let t0 = if r[0].abs() < 0.9 {
        [0.0, -r[2], r[1]]
    } else {
        [-r[2], 0.0, r[0]]
    };
    let t0_len = (t0[0] * t0[0] + t0[1] * t0[1] + t0[2] * t0[2]).sqrt().max(1e-8);
    let t0 = [t0[0] / t0_len, t0[1] / t0_len, t0[2] / t0_len];
    let t1 = [
        r[1] * t0[2] - r[2] * t0[1],
        r[2] * t0[0] - r[0] * t0[2],
        r[0] * t0[1] - r[1] * t0[0],
    ];
    let mut bases = Vec::with_capacity(samples.max(1));
    for tap in TAPS.iter().take(samples.max(1)) {
        let d = [
            r[0] + spread * (tap[0] * t0[0] + tap[1] * t1[0]),
            r[1] + spread * (tap[0] * t0[1] + tap[1] * t1[1]),
            r[2] + spread * (tap[0] * t0[2] + tap[1] * t1[2]),
        ];
        let len = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt().max(1e-8);
        bases.push(sh_basis(&[d[0] / len, d[1] / len, d[2] / len]));
    }
    bases
}

fn sample3(tex: &TextureView<'_>, u: f32, v: f32) -> [f32; 3] {
    [tex.sample(u, v, 0), tex.sample(u, v, 1), tex.sample(u, v, 2)]
}

fn shade_textured(
    inputs: &RenderInputs<'_>,
    v: usize,
    samples: usize,
    roughness_aware: bool,
) -> Shaded {
    let n = normal_at(inputs, v);
    let e_diffuse = irradiance(inputs.sh, &sh_basis(&n));
    let r = reflect(&view_dir(&vertex_at(inputs, v)), &n);
    let uv = inputs.uv[v];

    let rough = match (roughness_aware, inputs.roughness_texture.as_ref()) {
        (true, Some(tex)) => tex.sample(uv[0], uv[1], 0).clamp(0.0, 1.0),
        _ => 0.0,
    };
    let spread = if roughness_aware {
        0.15 + 0.85 * rough
    } else {
        0.3
    };
    let bases = glossy_bases(&r, spread, samples);
    let mut e_glossy = [0.0f32; 3];
    for basis in &bases {
        let e = irradiance(inputs.sh, basis);
        for c in 0..3 {
            e_glossy[c] += e[c];
        }
    }
    for c in &mut e_glossy {
        *c /= bases.len() as f32;
    }

    let tex_d = inputs
        .diffuse_texture
        .as_ref()
        .map(|t| sample3(t, uv[0], uv[1]))
        .unwrap_or([0.0; 3]);
    let tex_s = inputs
        .specular_texture
        .as_ref()
        .map(|t| sample3(t, uv[0], uv[1]))
        .unwrap_or([0.0; 3]);

    let spec_scale = if roughness_aware { 1.0 - rough } else { 1.0 };
    let mut color = [0.0f32; 3];
    for c in 0..3 {
        color[c] = tex_d[c] * e_diffuse[c] + tex_s[c] * e_glossy[c] * spec_scale;
    }
    Shaded {
        color,
        e_diffuse,
        e_glossy,
        spec_scale,
        tex_d,
        tex_s,
    }
}

fn render_textured(inputs: &RenderInputs<'_>, samples: usize, roughness_aware: bool) -> RenderOutput {
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
            let shaded = shade_textured(inputs, v as usize, samples, roughness_aware);
            color.set_pixel(x, y, shaded.color);
            alpha.set(x, y, 1.0);
        }
    }
    RenderOutput {
        color,
        alpha: Some(alpha),
        owner: map.owner,
    }
}

#[allow(clippy::too_many_arguments)]
fn backward_textured(
    inputs: &RenderInputs<'_>,
    output: &RenderOutput,
    d_color: &ImageRgbF32,
    samples: usize,
    roughness_aware: bool,
) -> RenderGrads {
    let (w, h) = (inputs.width, inputs.height);
    let mut d_sh = vec![0.0f32; SH_BANDS * SH_CHANNELS];
    let mut d_tex_d = inputs
        .diffuse_texture
        .as_ref()
        .map(|t| vec![0.0f32; t.data.len()]);
    let mut d_tex_s = inputs
        .specular_texture
        .as_ref()
        .map(|t| vec![0.0f32; t.data.len()]);
    let mut d_tex_r = if roughness_aware {
        inputs
            .roughness_texture
            .as_ref()
            .map(|t| vec![0.0f32; t.data.len()])
    } else {
        None
    };

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
            let shaded = shade_textured(inputs, v, samples, roughness_aware);
            let uv = inputs.uv[v];

            if let (Some(grad), Some(tex)) = (d_tex_d.as_mut(), inputs.diffuse_texture.as_ref()) {
                let (tx, ty) = tex.texel_at(uv[0], uv[1]);
                for c in 0..3 {
                    grad[(ty * tex.width + tx) * tex.channels + c] += g[c] * shaded.e_diffuse[c];
                }
            }
            if let (Some(grad), Some(tex)) = (d_tex_s.as_mut(), inputs.specular_texture.as_ref()) {
                let (tx, ty) = tex.texel_at(uv[0], uv[1]);
                for c in 0..3 {
                    grad[(ty * tex.width + tx) * tex.channels + c] +=
                        g[c] * shaded.e_glossy[c] * shaded.spec_scale;
                }
            }
            if let (Some(grad), Some(tex)) = (d_tex_r.as_mut(), inputs.roughness_texture.as_ref()) {
                let (tx, ty) = tex.texel_at(uv[0], uv[1]);
                let mut d_rough = 0.0f32;
                for c in 0..3 {
                    // spec_scale = 1 - roughness; the lobe-width dependence is
                    // dropped from the gradient.
                    d_rough -= g[c] * shaded.tex_s[c] * shaded.e_glossy[c];
                }
                grad[(ty * tex.width + tx) * tex.channels] += d_rough;
            }

            let n = normal_at(inputs, v);
            let basis_n = sh_basis(&n);
            let mut d_e_d = [0.0f32; 3];
            for c in 0..3 {
                d_e_d[c] = g[c] * shaded.tex_d[c];
            }
            backprop_irradiance(&basis_n, &d_e_d, &mut d_sh);

            let r = reflect(&view_dir(&vertex_at(inputs, v)), &n);
            let rough = match (roughness_aware, inputs.roughness_texture.as_ref()) {
                (true, Some(tex)) => tex.sample(uv[0], uv[1], 0).clamp(0.0, 1.0),
                _ => 0.0,
            };
            let spread = if roughness_aware {
                0.15 + 0.85 * rough
            } else {
                0.3
            };
            let bases = glossy_bases(&r, spread, samples);
            let tap_weight = shaded.spec_scale / bases.len() as f32;
            let mut d_e_s = [0.0f32; 3];
            for c in 0..3 {
                d_e_s[c] = g[c] * shaded.tex_s[c] * tap_weight;
            }
            for basis in &bases {
                backprop_irradiance(basis, &d_e_s, &mut d_sh);
            }
        }
    }

    let (d_verts, d_focal) =
        screen_space_geometry_grads(inputs, &output.color, &output.owner, d_color);
    RenderGrads {
        diffuse_albedo: None,
        specular_albedo: None,
        diffuse_texture: d_tex_d,
        specular_texture: d_tex_s,
        roughness_texture: d_tex_r,
        sh: d_sh,
        camera_vertices: d_verts,
        focal: d_focal,
    }
}

/// Primary texture-sampling renderer; native alpha.
pub struct PathTracedRenderer {
    samples: usize,
}

impl PathTracedRenderer {
    pub fn new(samples: usize) -> Self {
        Self {
            samples: samples.clamp(1, TAPS.len()),
        }
    }
}

impl Renderer for PathTracedRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::PathTraced
    }

    fn has_native_alpha(&self) -> bool {
        true
    }

    fn render(&self, inputs: &RenderInputs<'_>) -> RenderOutput {
        render_textured(inputs, self.samples, false)
    }

    fn backward(
        &self,
        inputs: &RenderInputs<'_>,
        output: &RenderOutput,
        d_color: &ImageRgbF32,
    ) -> RenderGrads {
        backward_textured(inputs, output, d_color, self.samples, false)
    }
}

/// Alternate texture-sampling renderer; roughness-aware, no native alpha.
pub struct PathTracedAltRenderer {
    samples: usize,
}

impl PathTracedAltRenderer {
    pub fn new(samples: usize) -> Self {
        Self {
            samples: samples.clamp(1, TAPS.len()),
        }
    }
}

impl Renderer for PathTracedAltRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::PathTracedAlt
    }

    fn has_native_alpha(&self) -> bool {
        false
    }

    fn render(&self, inputs: &RenderInputs<'_>) -> RenderOutput {
        let mut out = render_textured(inputs, self.samples, true);
        out.alpha = None;
        out
    }

    fn backward(
        &self,
        inputs: &RenderInputs<'_>,
        output: &RenderOutput,
        d_color: &ImageRgbF32,
    ) -> RenderGrads {
        backward_textured(inputs, output, d_color, self.samples, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn flat_inputs<'a>(
        verts: &'a DMatrix<f32>,
        normals: &'a DMatrix<f32>,
        faces: &'a [[u32; 3]],
        uv: &'a [[f32; 2]],
        albedo: &'a DMatrix<f32>,
        sh: &'a [f32],
        tex: TextureView<'a>,
    ) -> RenderInputs<'a> {
        RenderInputs {
            camera_vertices: verts,
            normals,
            faces,
            uv,
            diffuse_albedo: albedo,
            specular_albedo: albedo,
            diffuse_texture: Some(tex),
            specular_texture: Some(tex),
            roughness_texture: None,
            sh,
            focal: 100.0,
            center: [16.0, 16.0],
            width: 32,
            height: 32,
        }
    }

    #[test]
    fn alternate_renderer_reports_no_alpha() {
        let verts = DMatrix::from_row_slice(3, 3, &[
            -5.0, -5.0, 100.0, //
            5.0, -5.0, 100.0, //
            0.0, 5.0, 100.0,
        ]);
        let normals = DMatrix::from_row_slice(3, 3, &[
            0.0, 0.0, -1.0, //
            0.0, 0.0, -1.0, //
            0.0, 0.0, -1.0,
        ]);
        let faces = [[0u32, 1, 2]];
        let uv = [[0.0f32, 0.0], [1.0, 0.0], [0.5, 1.0]];
        let albedo = DMatrix::from_element(3, 3, 0.5);
        let mut sh = vec![0.0f32; SH_BANDS * SH_CHANNELS];
        sh[0] = 1.0;
        sh[1] = 1.0;
        sh[2] = 1.0;
        let data = vec![0.5f32; 4 * 4 * 3];
        let tex = TextureView {
            width: 4,
            height: 4,
            channels: 3,
            data: &data,
        };
        let inputs = flat_inputs(&verts, &normals, &faces, &uv, &albedo, &sh, tex);

        let alt = PathTracedAltRenderer::new(2);
        let out = alt.render(&inputs);
        assert!(out.alpha.is_none());
        assert!(alt.kind() != RendererKind::PathTraced);

        let primary = PathTracedRenderer::new(2);
        let out = primary.render(&inputs);
        assert!(out.alpha.is_some());
    }
}
