//! Shared splat rasterization used by every renderer variant.
//!
//! Vertices are projected and splatted as small squares with a z-buffer; the
//! footprint is sized from the mean projected edge length so coverage stays
//! closed at typical working distances. The same pass also backs the
//! screen-space approximation used for geometry gradients.
use super::RenderInputs;
use crate::camera::{backprop_projection, project_point};
use crate::image::ImageRgbF32;
use nalgebra::DMatrix;

/// Per-pixel owner (-1 for background) and the splat radius that produced it.
pub(crate) struct RasterMap {
    pub owner: Vec<i32>,
    pub radius: i32,
}

/// Projected footprint radius from mean camera-space edge length.
fn splat_radius(inputs: &RenderInputs<'_>) -> i32 {
    let verts = inputs.camera_vertices;
    let mut edge_sum = 0.0f32;
    let mut z_sum = 0.0f32;
    let mut count = 0usize;
    for f in inputs.faces.iter().step_by(7) {
        let a = f[0] as usize;
        let b = f[1] as usize;
        let dx = verts[(a, 0)] - verts[(b, 0)];
        let dy = verts[(a, 1)] - verts[(b, 1)];
        let dz = verts[(a, 2)] - verts[(b, 2)];
        edge_sum += (dx * dx + dy * dy + dz * dz).sqrt();
        z_sum += verts[(a, 2)].max(1e-3);
        count += 1;
    }
    if count == 0 {
        return 1;
    }
    let mean_edge = edge_sum / count as f32;
    let mean_z = (z_sum / count as f32).max(1e-3);
    let px = inputs.focal * mean_edge / mean_z;
    (px * 0.75).ceil().clamp(1.0, 8.0) as i32
}

/// Project and z-buffer every vertex.
pub(crate) fn rasterize(inputs: &RenderInputs<'_>) -> RasterMap {
    let (w, h) = (inputs.width, inputs.height);
    let radius = splat_radius(inputs);
    let mut owner = vec![-1i32; w * h];
    let mut depth = vec![f32::INFINITY; w * h];
    let verts = inputs.camera_vertices;
    for v in 0..verts.nrows() {
        let p = [verts[(v, 0)], verts[(v, 1)], verts[(v, 2)]];
        if p[2] <= 1e-3 {
            continue;
        }
        let uv = project_point(&p, inputs.focal, &inputs.center);
        let cx = uv[0].round() as i32;
        let cy = uv[1].round() as i32;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let x = cx + dx;
                let y = cy + dy;
                if x < 0 || y < 0 || x >= w as i32 || y >= h as i32 {
                    continue;
                }
                let i = y as usize * w + x as usize;
                if p[2] < depth[i] {
                    depth[i] = p[2];
                    owner[i] = v as i32;
                }
            }
        }
    }
    RasterMap { owner, radius }
}

/// Screen-space geometry gradients: the rendered image's spatial gradient at
/// each owned pixel, chained through the projection Jacobian onto the owning
/// vertex. Returns (d_camera_vertices, d_focal).
pub(crate) fn screen_space_geometry_grads(
    inputs: &RenderInputs<'_>,
    color: &ImageRgbF32,
    owner: &[i32],
    d_color: &ImageRgbF32,
) -> (DMatrix<f32>, f32) {
    let (w, h) = (inputs.width, inputs.height);
    let verts = inputs.camera_vertices;
    let mut d_verts = DMatrix::zeros(verts.nrows(), 3);
    let mut d_focal = 0.0f32;
    for y in 0..h {
        for x in 0..w {
            let v = owner[y * w + x];
            if v < 0 {
                continue;
            }
            let v = v as usize;
            let g = d_color.pixel(x, y);
            if g == [0.0, 0.0, 0.0] {
                continue;
            }
            let xm = x.saturating_sub(1);
            let xp = (x + 1).min(w - 1);
            let ym = y.saturating_sub(1);
            let yp = (y + 1).min(h - 1);
            let left = color.pixel(xm, y);
            let right = color.pixel(xp, y);
            let up = color.pixel(x, ym);
            let down = color.pixel(x, yp);
            let mut d_u = 0.0f32;
            let mut d_v = 0.0f32;
            for c in 0..3 {
                // Moving the splat by +du translates the pattern, so the
                // pixel intensity changes by minus the spatial gradient.
                d_u -= g[c] * (right[c] - left[c]) * 0.5;
                d_v -= g[c] * (down[c] - up[c]) * 0.5;
            }
            let p = [verts[(v, 0)], verts[(v, 1)], verts[(v, 2)]];
            let (d_point, d_f) = backprop_projection(&p, inputs.focal, &[d_u, d_v]);
            d_verts[(v, 0)] += d_point[0];
            d_verts[(v, 1)] += d_point[1];
            d_verts[(v, 2)] += d_point[2];
            d_focal += d_f;
        }
    }
    (d_verts, d_focal)
}

/// Unit view direction toward a camera-space point.
#[inline]
pub(crate) fn view_dir(p: &[f32; 3]) -> [f32; 3] {
    let len = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt().max(1e-8);
    [p[0] / len, p[1] / len, p[2] / len]
}

/// Normal row of `inputs.normals` as an array.
#[inline]
pub(crate) fn normal_at(inputs: &RenderInputs<'_>, v: usize) -> [f32; 3] {
    [
        inputs.normals[(v, 0)],
        inputs.normals[(v, 1)],
        inputs.normals[(v, 2)],
    ]
}

/// Camera-space position row as an array.
#[inline]
pub(crate) fn vertex_at(inputs: &RenderInputs<'_>, v: usize) -> [f32; 3] {
    [
        inputs.camera_vertices[(v, 0)],
        inputs.camera_vertices[(v, 1)],
        inputs.camera_vertices[(v, 2)],
    ]
}
