//! Loss terms composed into the per-stage objective.
//!
//! Every term is a pure function of the forward outputs and the current
//! coefficients, returning its weighted scalar value together with the exact
//! gradient with respect to its direct inputs. The driver chains those
//! gradients through the renderer/camera/model backward maps.
pub mod texture;

use crate::image::{ImageF32, ImageRgbF32};
use nalgebra::DMatrix;

/// Photometric term value and its gradient with respect to the render.
pub struct PhotometricResult {
    pub loss: f32,
    pub d_render: ImageRgbF32,
}

/// `weight · mean(mask · |render − target|)` over all pixels and channels.
pub fn photometric(
    render: &ImageRgbF32,
    target: &ImageRgbF32,
    mask: &ImageF32,
    weight: f32,
) -> PhotometricResult {
    let (w, h) = (render.w, render.h);
    let n = (w * h * 3) as f32;
    let mut loss = 0.0f32;
    let mut d_render = ImageRgbF32::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let m = mask.get(x, y);
            if m == 0.0 {
                continue;
            }
            let r = render.pixel(x, y);
            let t = target.pixel(x, y);
            let mut g = [0.0f32; 3];
            for c in 0..3 {
                let diff = r[c] - t[c];
                loss += m * diff.abs();
                g[c] = weight * m * diff.signum() / n;
            }
            d_render.set_pixel(x, y, g);
        }
    }
    PhotometricResult {
        loss: weight * loss / n,
        d_render,
    }
}

/// Landmark term value and its gradient with respect to the projections.
pub struct LandmarkResult {
    pub loss: f32,
    pub d_projected: Vec<[f32; 2]>,
}

/// Mean squared 2D distance between projected and detected keypoints,
/// normalized by the image area so the weight is resolution-independent.
pub fn landmark(
    projected: &[[f32; 2]],
    detected: &[[f32; 2]],
    width: usize,
    height: usize,
    weight: f32,
) -> LandmarkResult {
    let n = projected.len().min(detected.len());
    let norm = (width * height) as f32;
    let mut loss = 0.0f32;
    let mut d_projected = vec![[0.0f32; 2]; projected.len()];
    if n == 0 {
        return LandmarkResult { loss, d_projected };
    }
    let scale = weight / (n as f32 * norm);
    for i in 0..n {
        let du = projected[i][0] - detected[i][0];
        let dv = projected[i][1] - detected[i][1];
        loss += du * du + dv * dv;
        d_projected[i] = [2.0 * scale * du, 2.0 * scale * dv];
    }
    LandmarkResult {
        loss: scale * loss,
        d_projected,
    }
}

/// Statistical-prior value and coefficient gradient.
pub struct PriorResult {
    pub loss: f32,
    pub d_coeff: DMatrix<f32>,
}

/// `weight · mean(c² / v)` with the basis variance per column. Zero at the
/// population mean for any strictly positive variance.
pub fn statistical_prior(coeff: &DMatrix<f32>, variance: &[f32], weight: f32) -> PriorResult {
    let n = (coeff.nrows() * coeff.ncols()) as f32;
    let mut loss = 0.0f32;
    let mut d_coeff = DMatrix::zeros(coeff.nrows(), coeff.ncols());
    if n == 0.0 {
        return PriorResult { loss, d_coeff };
    }
    for r in 0..coeff.nrows() {
        for k in 0..coeff.ncols() {
            let v = variance[k].max(1e-12);
            let c = coeff[(r, k)];
            loss += c * c / v;
            d_coeff[(r, k)] = weight * 2.0 * c / (v * n);
        }
    }
    PriorResult {
        loss: weight * loss / n,
        d_coeff,
    }
}

/// `weight · mean(sh²)` discouraging unbounded illumination energy.
pub fn sh_energy(sh: &DMatrix<f32>, weight: f32) -> PriorResult {
    let n = (sh.nrows() * sh.ncols()) as f32;
    let mut loss = 0.0f32;
    let mut d_coeff = DMatrix::zeros(sh.nrows(), sh.ncols());
    if n == 0.0 {
        return PriorResult { loss, d_coeff };
    }
    for r in 0..sh.nrows() {
        for k in 0..sh.ncols() {
            let c = sh[(r, k)];
            loss += c * c;
            d_coeff[(r, k)] = weight * 2.0 * c / n;
        }
    }
    PriorResult {
        loss: weight * loss / n,
        d_coeff,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prior_is_zero_at_the_population_mean() {
        let coeff = DMatrix::zeros(2, 4);
        let variance = [0.1f32, 1.0, 10.0, 0.5];
        let res = statistical_prior(&coeff, &variance, 3.0);
        assert_eq!(res.loss, 0.0);
        assert!(res.d_coeff.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn prior_grows_with_coefficient_magnitude() {
        let variance = [1.0f32, 1.0];
        let small = DMatrix::from_row_slice(1, 2, &[0.1, 0.0]);
        let large = DMatrix::from_row_slice(1, 2, &[1.0, 0.0]);
        let a = statistical_prior(&small, &variance, 1.0);
        let b = statistical_prior(&large, &variance, 1.0);
        assert!(b.loss > a.loss);
    }

    #[test]
    fn photometric_masks_out_background() {
        let mut render = ImageRgbF32::new(2, 1);
        render.set_pixel(0, 0, [1.0, 1.0, 1.0]);
        render.set_pixel(1, 0, [1.0, 1.0, 1.0]);
        let target = ImageRgbF32::new(2, 1);
        let mut mask = ImageF32::new(2, 1);
        mask.set(0, 0, 1.0);
        let res = photometric(&render, &target, &mask, 6.0);
        // Only the masked pixel contributes: 3 channels of |1| over 6 samples.
        assert!((res.loss - 3.0).abs() < 1e-6);
        assert_eq!(res.d_render.pixel(1, 0), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn landmark_gradient_points_toward_detection() {
        let projected = [[10.0f32, 10.0]];
        let detected = [[12.0f32, 10.0]];
        let res = landmark(&projected, &detected, 10, 10, 1.0);
        assert!(res.loss > 0.0);
        assert!(res.d_projected[0][0] < 0.0);
        assert_eq!(res.d_projected[0][1], 0.0);
    }
}
