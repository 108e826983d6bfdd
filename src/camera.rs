//! Rigid transform, pinhole projection and landmark-based pose initialization.
//!
//! Rotation is parameterized as XYZ Euler angles (radians): `R = Rz·Ry·Rx`.
//! The camera looks down +z; vertices in front of the camera have positive
//! camera-space depth. Projection is `u = f·X/Z + cx`, `v = f·Y/Z + cy`.
//!
//! Every forward map here has a matching analytic backward used by the driver
//! when pulling loss gradients into pose, focal and vertex parameters.
use nalgebra::{DMatrix, Matrix3, Vector3};

/// Euler-angle rotation matrix `Rz(z)·Ry(y)·Rx(x)`.
pub fn rotation_matrix(angles: &[f32; 3]) -> Matrix3<f32> {
    let (sx, cx) = angles[0].sin_cos();
    let (sy, cy) = angles[1].sin_cos();
    let (sz, cz) = angles[2].sin_cos();
    let rx = Matrix3::new(1.0, 0.0, 0.0, 0.0, cx, -sx, 0.0, sx, cx);
    let ry = Matrix3::new(cy, 0.0, sy, 0.0, 1.0, 0.0, -sy, 0.0, cy);
    let rz = Matrix3::new(cz, -sz, 0.0, sz, cz, 0.0, 0.0, 0.0, 1.0);
    rz * ry * rx
}

/// Derivatives of [`rotation_matrix`] with respect to each Euler angle.
pub fn rotation_derivatives(angles: &[f32; 3]) -> [Matrix3<f32>; 3] {
    let (sx, cx) = angles[0].sin_cos();
    let (sy, cy) = angles[1].sin_cos();
    let (sz, cz) = angles[2].sin_cos();
    let rx = Matrix3::new(1.0, 0.0, 0.0, 0.0, cx, -sx, 0.0, sx, cx);
    let ry = Matrix3::new(cy, 0.0, sy, 0.0, 1.0, 0.0, -sy, 0.0, cy);
    let rz = Matrix3::new(cz, -sz, 0.0, sz, cz, 0.0, 0.0, 0.0, 1.0);
    let drx = Matrix3::new(0.0, 0.0, 0.0, 0.0, -sx, -cx, 0.0, cx, -sx);
    let dry = Matrix3::new(-sy, 0.0, cy, 0.0, 0.0, 0.0, -cy, 0.0, -sy);
    let drz = Matrix3::new(-sz, -cz, 0.0, cz, -sz, 0.0, 0.0, 0.0, 0.0);
    [rz * ry * drx, rz * dry * rx, drz * ry * rx]
}

/// Apply `R·v + t` to every vertex row.
pub fn transform_vertices(
    vertices: &DMatrix<f32>,
    rotation: &[f32; 3],
    translation: &[f32; 3],
) -> DMatrix<f32> {
    let r = rotation_matrix(rotation);
    let t = Vector3::new(translation[0], translation[1], translation[2]);
    let mut out = DMatrix::zeros(vertices.nrows(), 3);
    for i in 0..vertices.nrows() {
        let p = Vector3::new(vertices[(i, 0)], vertices[(i, 1)], vertices[(i, 2)]);
        let q = r * p + t;
        out[(i, 0)] = q[0];
        out[(i, 1)] = q[1];
        out[(i, 2)] = q[2];
    }
    out
}

/// Gradients flowing out of the rigid transform.
pub struct TransformGrads {
    pub rotation: [f32; 3],
    pub translation: [f32; 3],
    /// Gradient with respect to the untransformed (model-space) vertices.
    pub vertices: DMatrix<f32>,
}

/// Backward of [`transform_vertices`]: pulls a camera-space vertex gradient
/// back to the Euler angles, the translation and the model-space vertices.
pub fn backprop_transform(
    vertices: &DMatrix<f32>,
    rotation: &[f32; 3],
    d_camera: &DMatrix<f32>,
) -> TransformGrads {
    let r = rotation_matrix(rotation);
    let dr = rotation_derivatives(rotation);
    let rt = r.transpose();
    let mut grads = TransformGrads {
        rotation: [0.0; 3],
        translation: [0.0; 3],
        vertices: DMatrix::zeros(vertices.nrows(), 3),
    };
    for i in 0..vertices.nrows() {
        let p = Vector3::new(vertices[(i, 0)], vertices[(i, 1)], vertices[(i, 2)]);
        let g = Vector3::new(d_camera[(i, 0)], d_camera[(i, 1)], d_camera[(i, 2)]);
        for k in 0..3 {
            grads.rotation[k] += g.dot(&(dr[k] * p));
            grads.translation[k] += g[k];
        }
        let back = rt * g;
        grads.vertices[(i, 0)] = back[0];
        grads.vertices[(i, 1)] = back[1];
        grads.vertices[(i, 2)] = back[2];
    }
    grads
}

/// Project one camera-space point to pixel coordinates.
#[inline]
pub fn project_point(p: &[f32; 3], focal: f32, center: &[f32; 2]) -> [f32; 2] {
    let z = p[2].max(1e-6);
    [
        focal * p[0] / z + center[0],
        focal * p[1] / z + center[1],
    ]
}

/// Backward of [`project_point`]; returns (d_point, d_focal).
pub fn backprop_projection(
    p: &[f32; 3],
    focal: f32,
    d_uv: &[f32; 2],
) -> ([f32; 3], f32) {
    let z = p[2].max(1e-6);
    let inv_z = 1.0 / z;
    let d_point = [
        d_uv[0] * focal * inv_z,
        d_uv[1] * focal * inv_z,
        -(d_uv[0] * focal * p[0] + d_uv[1] * focal * p[1]) * inv_z * inv_z,
    ];
    let d_focal = (d_uv[0] * p[0] + d_uv[1] * p[1]) * inv_z;
    (d_point, d_focal)
}

/// Weak-perspective pose estimate aligning associated model vertices to
/// detected landmarks: depth from the ratio of pixel spread to model spread,
/// lateral offset from the landmark centroid. Rotation starts at identity.
pub fn estimate_pose(
    focal: f32,
    center: &[f32; 2],
    landmarks: &[[f32; 2]],
    head_points: &DMatrix<f32>,
) -> ([f32; 3], [f32; 3]) {
    let n = landmarks.len().min(head_points.nrows());
    if n == 0 {
        return ([0.0; 3], [0.0, 0.0, focal.max(1.0)]);
    }
    let mut lm_mean = [0.0f32; 2];
    for lm in landmarks.iter().take(n) {
        lm_mean[0] += lm[0];
        lm_mean[1] += lm[1];
    }
    lm_mean[0] /= n as f32;
    lm_mean[1] /= n as f32;

    let mut hp_mean = [0.0f32; 3];
    for i in 0..n {
        for c in 0..3 {
            hp_mean[c] += head_points[(i, c)];
        }
    }
    for c in &mut hp_mean {
        *c /= n as f32;
    }

    let mut lm_spread = 0.0f32;
    let mut hp_spread = 0.0f32;
    for i in 0..n {
        let du = landmarks[i][0] - lm_mean[0];
        let dv = landmarks[i][1] - lm_mean[1];
        lm_spread += du * du + dv * dv;
        let dx = head_points[(i, 0)] - hp_mean[0];
        let dy = head_points[(i, 1)] - hp_mean[1];
        hp_spread += dx * dx + dy * dy;
    }
    lm_spread = (lm_spread / n as f32).sqrt().max(1e-6);
    hp_spread = (hp_spread / n as f32).sqrt().max(1e-6);

    // u ≈ f·(x + tx)/tz + cx  =>  pixel scale s = f/tz.
    let scale = lm_spread / hp_spread;
    let tz = (focal / scale).max(1.0);
    let tx = (lm_mean[0] - center[0]) * tz / focal - hp_mean[0];
    let ty = (lm_mean[1] - center[1]) * tz / focal - hp_mean[1];

    ([0.0; 3], [tx, ty, tz])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_angles_give_identity_rotation() {
        let r = rotation_matrix(&[0.0, 0.0, 0.0]);
        assert!((r - Matrix3::identity()).norm() < 1e-6);
    }

    #[test]
    fn rotation_derivative_matches_finite_difference() {
        let angles = [0.3, -0.2, 0.5];
        let dr = rotation_derivatives(&angles);
        let eps = 1e-4f32;
        for k in 0..3 {
            let mut plus = angles;
            plus[k] += eps;
            let mut minus = angles;
            minus[k] -= eps;
            let fd = (rotation_matrix(&plus) - rotation_matrix(&minus)) / (2.0 * eps);
            assert!(
                (fd - dr[k]).norm() < 1e-2,
                "angle {k} derivative off by {}",
                (fd - dr[k]).norm()
            );
        }
    }

    #[test]
    fn projection_backward_matches_finite_difference() {
        let p = [12.0f32, -5.0, 300.0];
        let focal = 480.0;
        let center = [32.0, 24.0];
        let d_uv = [1.0f32, -0.5];
        let (d_point, d_focal) = backprop_projection(&p, focal, &d_uv);

        let loss = |p: &[f32; 3], f: f32| {
            let uv = project_point(p, f, &center);
            d_uv[0] * uv[0] + d_uv[1] * uv[1]
        };
        let eps = 1e-2f32;
        for c in 0..3 {
            let mut plus = p;
            plus[c] += eps;
            let mut minus = p;
            minus[c] -= eps;
            let fd = (loss(&plus, focal) - loss(&minus, focal)) / (2.0 * eps);
            assert!((fd - d_point[c]).abs() < 1e-2, "component {c}");
        }
        let fd_f = (loss(&p, focal + eps) - loss(&p, focal - eps)) / (2.0 * eps);
        assert!((fd_f - d_focal).abs() < 1e-3);
    }

    #[test]
    fn pose_estimate_puts_model_in_front_of_camera() {
        let head = DMatrix::from_row_slice(4, 3, &[
            -50.0, -50.0, 10.0, //
            50.0, -50.0, 10.0, //
            50.0, 50.0, 10.0, //
            -50.0, 50.0, 10.0,
        ]);
        let landmarks = vec![[100.0, 100.0], [156.0, 100.0], [156.0, 156.0], [100.0, 156.0]];
        let (rot, trans) = estimate_pose(500.0, &[128.0, 128.0], &landmarks, &head);
        assert_eq!(rot, [0.0; 3]);
        assert!(trans[2] > 100.0, "tz={}", trans[2]);
    }
}
