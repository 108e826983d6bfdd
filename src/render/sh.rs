//! Low-order spherical-harmonic illumination.
//!
//! Nine real SH basis functions evaluated at a direction, and RGB irradiance
//! for a 27-coefficient illumination vector (band-major, 3 channels per band).
use crate::state::{SH_BANDS, SH_CHANNELS};

/// Evaluate the 9 real SH basis functions at unit direction `n`.
pub fn sh_basis(n: &[f32; 3]) -> [f32; SH_BANDS] {
    let (x, y, z) = (n[0], n[1], n[2]);
    [
        0.282_095,
        0.488_603 * y,
        0.488_603 * z,
        0.488_603 * x,
        1.092_548 * x * y,
        1.092_548 * y * z,
        0.315_392 * (3.0 * z * z - 1.0),
        1.092_548 * x * z,
        0.546_274 * (x * x - y * y),
    ]
}

/// RGB irradiance `E_c(n) = Σ_b sh[b·3 + c] · Y_b(n)`.
pub fn irradiance(sh: &[f32], basis: &[f32; SH_BANDS]) -> [f32; 3] {
    let mut e = [0.0f32; 3];
    for (b, &y) in basis.iter().enumerate() {
        for c in 0..SH_CHANNELS {
            e[c] += sh[b * SH_CHANNELS + c] * y;
        }
    }
    e
}

/// Accumulate `d_e · ∂E/∂sh` into a 27-entry SH gradient.
pub fn backprop_irradiance(basis: &[f32; SH_BANDS], d_e: &[f32; 3], d_sh: &mut [f32]) {
    for (b, &y) in basis.iter().enumerate() {
        for c in 0..SH_CHANNELS {
            d_sh[b * SH_CHANNELS + c] += d_e[c] * y;
        }
    }
}

/// Mirror direction of the view ray `d` about normal `n` (both unit length).
pub fn reflect(d: &[f32; 3], n: &[f32; 3]) -> [f32; 3] {
    let dot = d[0] * n[0] + d[1] * n[1] + d[2] * n[2];
    [
        d[0] - 2.0 * dot * n[0],
        d[1] - 2.0 * dot * n[1],
        d[2] - 2.0 * dot * n[2],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambient_band_is_direction_independent() {
        let a = sh_basis(&[0.0, 0.0, 1.0]);
        let b = sh_basis(&[1.0, 0.0, 0.0]);
        assert_eq!(a[0], b[0]);
    }

    #[test]
    fn irradiance_of_ambient_light_is_flat() {
        let mut sh = vec![0.0f32; SH_BANDS * SH_CHANNELS];
        sh[0] = 1.0;
        sh[1] = 0.5;
        sh[2] = 0.25;
        let up = irradiance(&sh, &sh_basis(&[0.0, 0.0, 1.0]));
        let side = irradiance(&sh, &sh_basis(&[0.0, 1.0, 0.0]));
        for c in 0..3 {
            assert!((up[c] - side[c]).abs() < 1e-6);
        }
    }

    #[test]
    fn reflection_of_normal_incidence_flips() {
        let r = reflect(&[0.0, 0.0, -1.0], &[0.0, 0.0, 1.0]);
        assert!((r[0]).abs() < 1e-6 && (r[1]).abs() < 1e-6 && (r[2] - 1.0).abs() < 1e-6);
    }
}
