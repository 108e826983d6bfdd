//! Separable Gaussian smoothing and binary mask closing.
//!
//! The smoothing pass mirrors the photometric loss option that scores the
//! render against a blurred copy of itself to reduce sensitivity to
//! rasterization noise. The closing pass fills the pinholes a vertex-coverage
//! mask exhibits between splatted vertices.
use super::{ImageF32, ImageRgbF32};
use rayon::prelude::*;

/// 5-tap binomial kernel, sigma ≈ 1.
const K5: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

/// Separable 5-tap Gaussian blur of an RGB image. Borders replicate.
pub fn gaussian_smooth_rgb(img: &ImageRgbF32) -> ImageRgbF32 {
    let (w, h) = (img.w, img.h);
    let mut tmp = ImageRgbF32::new(w, h);
    // horizontal
    tmp.data
        .par_chunks_mut(w * 3)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..w {
                let mut acc = [0.0f32; 3];
                for (k, coef) in K5.iter().enumerate() {
                    let sx = (x as isize + k as isize - 2).clamp(0, w as isize - 1) as usize;
                    let px = img.pixel(sx, y);
                    acc[0] += coef * px[0];
                    acc[1] += coef * px[1];
                    acc[2] += coef * px[2];
                }
                row[x * 3] = acc[0];
                row[x * 3 + 1] = acc[1];
                row[x * 3 + 2] = acc[2];
            }
        });
    // vertical
    let mut out = ImageRgbF32::new(w, h);
    out.data
        .par_chunks_mut(w * 3)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..w {
                let mut acc = [0.0f32; 3];
                for (k, coef) in K5.iter().enumerate() {
                    let sy = (y as isize + k as isize - 2).clamp(0, h as isize - 1) as usize;
                    let px = tmp.pixel(x, sy);
                    acc[0] += coef * px[0];
                    acc[1] += coef * px[1];
                    acc[2] += coef * px[2];
                }
                row[x * 3] = acc[0];
                row[x * 3 + 1] = acc[1];
                row[x * 3 + 2] = acc[2];
            }
        });
    out
}

/// Morphological closing (dilate then erode) with a square kernel.
///
/// Input values are treated as coverage in [0, 1]; the output is binary.
pub fn close_mask(mask: &ImageF32, radius: usize) -> ImageF32 {
    let dilated = morph(mask, radius, true);
    morph(&dilated, radius, false)
}

fn morph(src: &ImageF32, radius: usize, dilate: bool) -> ImageF32 {
    let (w, h) = (src.w, src.h);
    let r = radius as isize;
    let mut out = ImageF32::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut v: f32 = if dilate { 0.0 } else { 1.0 };
            for dy in -r..=r {
                for dx in -r..=r {
                    let sx = (x as isize + dx).clamp(0, w as isize - 1) as usize;
                    let sy = (y as isize + dy).clamp(0, h as isize - 1) as usize;
                    let s = src.get(sx, sy);
                    v = if dilate { v.max(s) } else { v.min(s) };
                }
            }
            out.set(x, y, if v >= 0.5 { 1.0 } else { 0.0 });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoothing_preserves_constant_image() {
        let mut img = ImageRgbF32::new(8, 8);
        for y in 0..8 {
            for x in 0..8 {
                img.set_pixel(x, y, [0.25, 0.5, 0.75]);
            }
        }
        let smoothed = gaussian_smooth_rgb(&img);
        for y in 0..8 {
            for x in 0..8 {
                let px = smoothed.pixel(x, y);
                assert!((px[0] - 0.25).abs() < 1e-5);
                assert!((px[1] - 0.5).abs() < 1e-5);
                assert!((px[2] - 0.75).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn closing_fills_single_pixel_hole() {
        let mut mask = ImageF32::filled(9, 9, 1.0);
        mask.set(4, 4, 0.0);
        let closed = close_mask(&mask, 1);
        assert_eq!(closed.get(4, 4), 1.0);
    }
}
