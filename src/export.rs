//! Mesh and image artifact export.
//!
//! OBJ + MTL with per-vertex UVs and normals, plus the image-composition
//! helpers behind the periodic debug frames and the final artifact set
//! (reconstruction, overlay, texture maps).
use crate::image::{ImageF32, ImageRgbF32};
use crate::state::TextureStack;
use nalgebra::DMatrix;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Write a textured mesh as OBJ with a sibling MTL referencing `texture_file`.
pub fn save_obj(
    path: &Path,
    mtl_name: &str,
    vertices: &DMatrix<f32>,
    faces: &[[u32; 3]],
    normals: &DMatrix<f32>,
    uv: &[[f32; 2]],
    texture_file: &str,
) -> Result<(), String> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;

    let mtl_path = parent.join(mtl_name);
    let mtl = format!(
        "newmtl textured\nKa 1.0 1.0 1.0\nKd 1.0 1.0 1.0\nKs 0.0 0.0 0.0\nmap_Kd {texture_file}\n"
    );
    fs::write(&mtl_path, mtl)
        .map_err(|e| format!("Failed to write {}: {e}", mtl_path.display()))?;

    let mut out = Vec::with_capacity(vertices.nrows() * 64);
    writeln!(out, "mtllib {mtl_name}").map_err(|e| e.to_string())?;
    writeln!(out, "usemtl textured").map_err(|e| e.to_string())?;
    for i in 0..vertices.nrows() {
        writeln!(
            out,
            "v {} {} {}",
            vertices[(i, 0)],
            vertices[(i, 1)],
            vertices[(i, 2)]
        )
        .map_err(|e| e.to_string())?;
    }
    for t in uv {
        writeln!(out, "vt {} {}", t[0], 1.0 - t[1]).map_err(|e| e.to_string())?;
    }
    for i in 0..normals.nrows() {
        writeln!(
            out,
            "vn {} {} {}",
            normals[(i, 0)],
            normals[(i, 1)],
            normals[(i, 2)]
        )
        .map_err(|e| e.to_string())?;
    }
    for f in faces {
        let (a, b, c) = (f[0] + 1, f[1] + 1, f[2] + 1);
        writeln!(out, "f {a}/{a}/{a} {b}/{b}/{b} {c}/{c}/{c}").map_err(|e| e.to_string())?;
    }
    fs::write(path, out).map_err(|e| format!("Failed to write {}: {e}", path.display()))
}

/// Nearest-neighbor resize.
pub fn resize_rgb(img: &ImageRgbF32, w: usize, h: usize) -> ImageRgbF32 {
    let mut out = ImageRgbF32::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let sx = (x * img.w / w.max(1)).min(img.w - 1);
            let sy = (y * img.h / h.max(1)).min(img.h - 1);
            out.set_pixel(x, y, img.pixel(sx, sy));
        }
    }
    out
}

/// Concatenate images left to right; heights must match.
pub fn hconcat(images: &[&ImageRgbF32]) -> ImageRgbF32 {
    let h = images.first().map(|i| i.h).unwrap_or(0);
    let w: usize = images.iter().map(|i| i.w).sum();
    let mut out = ImageRgbF32::new(w, h);
    let mut offset = 0usize;
    for img in images {
        for y in 0..img.h.min(h) {
            for x in 0..img.w {
                out.set_pixel(offset + x, y, img.pixel(x, y));
            }
        }
        offset += img.w;
    }
    out
}

/// Concatenate images top to bottom, padding narrower rows with black.
pub fn vconcat(images: &[&ImageRgbF32]) -> ImageRgbF32 {
    let w = images.iter().map(|i| i.w).max().unwrap_or(0);
    let h: usize = images.iter().map(|i| i.h).sum();
    let mut out = ImageRgbF32::new(w, h);
    let mut offset = 0usize;
    for img in images {
        for y in 0..img.h {
            for x in 0..img.w {
                out.set_pixel(x, offset + y, img.pixel(x, y));
            }
        }
        offset += img.h;
    }
    out
}

/// One identity slice of a texture stack as an RGB image (scalar channels are
/// replicated to gray).
pub fn texture_to_rgb(stack: &TextureStack, map: usize) -> ImageRgbF32 {
    let mut out = ImageRgbF32::new(stack.width, stack.height);
    for y in 0..stack.height {
        for x in 0..stack.width {
            let px = if stack.channels >= 3 {
                [
                    stack.get(map, x, y, 0),
                    stack.get(map, x, y, 1),
                    stack.get(map, x, y, 2),
                ]
            } else {
                let v = stack.get(map, x, y, 0);
                [v, v, v]
            };
            out.set_pixel(x, y, px);
        }
    }
    out
}

/// Blend the render over the target where the mask covers it.
pub fn overlay(target: &ImageRgbF32, render: &ImageRgbF32, mask: &ImageF32) -> ImageRgbF32 {
    let mut out = target.clone();
    for y in 0..target.h.min(render.h) {
        for x in 0..target.w.min(render.w) {
            let a = mask.get(x, y) * 0.6;
            if a <= 0.0 {
                continue;
            }
            let t = target.pixel(x, y);
            let r = render.pixel(x, y);
            out.set_pixel(
                x,
                y,
                [
                    t[0] * (1.0 - a) + r[0] * a,
                    t[1] * (1.0 - a) + r[1] * a,
                    t[2] * (1.0 - a) + r[2] * a,
                ],
            );
        }
    }
    out
}

/// Absolute per-channel difference of two images.
pub fn abs_diff(a: &ImageRgbF32, b: &ImageRgbF32) -> ImageRgbF32 {
    let mut out = ImageRgbF32::new(a.w, a.h);
    for y in 0..a.h.min(b.h) {
        for x in 0..a.w.min(b.w) {
            let pa = a.pixel(x, y);
            let pb = b.pixel(x, y);
            out.set_pixel(
                x,
                y,
                [
                    (pa[0] - pb[0]).abs(),
                    (pa[1] - pb[1]).abs(),
                    (pa[2] - pb[2]).abs(),
                ],
            );
        }
    }
    out
}

/// Render | target | diff on top, the three texture maps below.
#[allow(clippy::too_many_arguments)]
pub fn compose_debug_frame(
    render: &ImageRgbF32,
    target: &ImageRgbF32,
    diff: &ImageRgbF32,
    diffuse: &ImageRgbF32,
    specular: &ImageRgbF32,
    roughness: &ImageRgbF32,
) -> ImageRgbF32 {
    let top = hconcat(&[render, target, diff]);
    let (tw, th) = (target.w, target.h);
    let tex_row = hconcat(&[
        &resize_rgb(diffuse, tw, th),
        &resize_rgb(specular, tw, th),
        &resize_rgb(roughness, tw, th),
    ]);
    vconcat(&[&top, &tex_row])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_dimensions_add_up() {
        let a = ImageRgbF32::new(4, 3);
        let b = ImageRgbF32::new(2, 3);
        let joined = hconcat(&[&a, &b]);
        assert_eq!((joined.w, joined.h), (6, 3));
        let stacked = vconcat(&[&a, &a]);
        assert_eq!((stacked.w, stacked.h), (4, 6));
    }

    #[test]
    fn obj_export_writes_mesh_and_material() {
        let dir = std::env::temp_dir().join("face_fitter_obj_test");
        let path = dir.join("mesh.obj");
        let vertices = DMatrix::from_row_slice(3, 3, &[0.0; 9]);
        let normals = DMatrix::from_row_slice(3, 3, &[0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
        let uv = [[0.0f32, 0.0], [1.0, 0.0], [0.0, 1.0]];
        let faces = [[0u32, 1, 2]];
        save_obj(&path, "mesh.mtl", &vertices, &faces, &normals, &uv, "diffuse.png")
            .expect("export");
        let obj = std::fs::read_to_string(&path).expect("read obj");
        assert!(obj.contains("mtllib mesh.mtl"));
        assert!(obj.contains("f 1/1/1 2/2/2 3/3/3"));
        assert!(dir.join("mesh.mtl").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
