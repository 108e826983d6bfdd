//! Morphable-model seam: low-dimensional coefficients to geometry and albedo.
//!
//! [`MorphableModel`] is the contract the optimization driver consumes. It is
//! deliberately linear-algebraic: shape, expression and albedo are affine in
//! their coefficients, so the backward maps are plain transpose products and
//! the statistical priors have per-coefficient basis variances.
//!
//! [`LinearFaceModel`] is the reference implementation: a dome-shaped vertex
//! grid with a seeded random orthogonal-ish basis. Any conforming model asset
//! (e.g. a PCA face basis loaded from disk) can replace it behind the trait.
use nalgebra::{DMatrix, DVector, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Coefficient block sizes exposed by a model.
#[derive(Clone, Copy, Debug)]
pub struct ModelDims {
    pub shape: usize,
    pub expression: usize,
    pub albedo: usize,
}

/// Parametric face model consumed by the fitting core.
///
/// Vertices are `V × 3` matrices in model units; per-vertex colors are `V × 3`
/// (or `V × 1` for scalar channels). All forward maps must be affine in the
/// coefficients so the `backprop_*` methods are exact.
pub trait MorphableModel {
    fn dims(&self) -> ModelDims;
    fn vertex_count(&self) -> usize;
    /// Triangle list into the vertex array.
    fn faces(&self) -> &[[u32; 3]];
    /// Per-vertex UV coordinates in [0, 1]².
    fn uv_map(&self) -> &[[f32; 2]];
    /// Vertex index associated with each 2D landmark, in detector order.
    fn landmark_association(&self) -> &[usize];

    /// Basis variances used by the statistical priors.
    fn shape_variance(&self) -> &DVector<f32>;
    fn expression_variance(&self) -> &DVector<f32>;
    fn albedo_variance(&self) -> &DVector<f32>;

    /// Neutral-pose vertices for the given shape and expression coefficients.
    fn compute_shape(&self, shape: &DVector<f32>, expression: &DVector<f32>) -> DMatrix<f32>;
    /// Diffuse and specular per-vertex albedo for the given coefficients.
    fn compute_albedo(&self, albedo: &DVector<f32>) -> (DMatrix<f32>, DMatrix<f32>);
    /// Area-weighted per-vertex normals.
    fn compute_normals(&self, vertices: &DMatrix<f32>) -> DMatrix<f32>;

    /// Pull a vertex-position gradient back to (shape, expression) coefficients.
    fn backprop_shape(&self, d_vertices: &DMatrix<f32>) -> (DVector<f32>, DVector<f32>);
    /// Pull per-vertex diffuse/specular albedo gradients back to coefficients.
    fn backprop_albedo(
        &self,
        d_diffuse: &DMatrix<f32>,
        d_specular: &DMatrix<f32>,
    ) -> DVector<f32>;

    /// Texture resolution of maps generated from per-vertex values.
    fn texture_size(&self) -> (usize, usize);
    /// For each texel (row-major), the vertex whose value fills it.
    fn texel_to_vertex(&self) -> &[usize];
    /// Roughness value used when no refined roughness map exists yet.
    fn default_roughness(&self) -> f32;

    /// Expand per-vertex values (`V × C`) into a texture map (`w·h·C` floats).
    fn generate_texture(&self, per_vertex: &DMatrix<f32>) -> Vec<f32> {
        let (w, h) = self.texture_size();
        let channels = per_vertex.ncols();
        let lut = self.texel_to_vertex();
        let mut out = vec![0.0f32; w * h * channels];
        for (texel, &v) in lut.iter().enumerate() {
            for c in 0..channels {
                out[texel * channels + c] = per_vertex[(v, c)];
            }
        }
        out
    }

    /// Scatter a texture-map gradient back onto per-vertex values.
    fn backprop_texture(&self, d_map: &[f32], channels: usize) -> DMatrix<f32> {
        let lut = self.texel_to_vertex();
        let mut out = DMatrix::zeros(self.vertex_count(), channels);
        for (texel, &v) in lut.iter().enumerate() {
            for c in 0..channels {
                out[(v, c)] += d_map[texel * channels + c];
            }
        }
        out
    }
}

/// Build parameters for [`LinearFaceModel`].
#[derive(Clone, Debug)]
pub struct LinearModelSpec {
    pub shape_dim: usize,
    pub expression_dim: usize,
    pub albedo_dim: usize,
    /// Vertex grid resolution per side; vertex count is `grid²`.
    pub grid: usize,
    pub texture_size: usize,
    pub seed: u64,
}

impl Default for LinearModelSpec {
    fn default() -> Self {
        Self {
            shape_dim: 60,
            expression_dim: 30,
            albedo_dim: 40,
            grid: 24,
            texture_size: 128,
            seed: 7,
        }
    }
}

/// Reference linear model: dome-shaped face shell plus seeded random bases.
pub struct LinearFaceModel {
    dims: ModelDims,
    mean_shape: DMatrix<f32>,
    shape_basis: DMatrix<f32>,
    expression_basis: DMatrix<f32>,
    mean_diffuse: DMatrix<f32>,
    mean_specular: DMatrix<f32>,
    diffuse_basis: DMatrix<f32>,
    specular_basis: DMatrix<f32>,
    shape_var: DVector<f32>,
    expression_var: DVector<f32>,
    albedo_var: DVector<f32>,
    faces: Vec<[u32; 3]>,
    uv: Vec<[f32; 2]>,
    landmarks: Vec<usize>,
    texel_lut: Vec<usize>,
    texture_size: (usize, usize),
}

/// Number of 2D landmarks every detector variant reports.
pub const LANDMARK_COUNT: usize = 68;

// Model units are millimetres; the shell is roughly face-sized.
const FACE_WIDTH: f32 = 140.0;
const FACE_HEIGHT: f32 = 180.0;
const FACE_DEPTH: f32 = 60.0;

impl LinearFaceModel {
    pub fn new(spec: &LinearModelSpec) -> Self {
        let grid = spec.grid.max(4);
        let v_count = grid * grid;
        let mut rng = StdRng::seed_from_u64(spec.seed);

        let mut mean_shape = DMatrix::zeros(v_count, 3);
        let mut uv = Vec::with_capacity(v_count);
        for gy in 0..grid {
            for gx in 0..grid {
                let u = gx as f32 / (grid - 1) as f32;
                let v = gy as f32 / (grid - 1) as f32;
                let x = (u - 0.5) * FACE_WIDTH;
                let y = (v - 0.5) * FACE_HEIGHT;
                let rx = (u - 0.5) * 2.0;
                let ry = (v - 0.5) * 2.0;
                let dome = (1.0 - (rx * rx + ry * ry) * 0.5).max(0.0);
                let z = dome.sqrt() * FACE_DEPTH;
                let idx = gy * grid + gx;
                mean_shape[(idx, 0)] = x;
                mean_shape[(idx, 1)] = y;
                mean_shape[(idx, 2)] = z;
                uv.push([u, v]);
            }
        }

        let mut faces = Vec::with_capacity((grid - 1) * (grid - 1) * 2);
        for gy in 0..grid - 1 {
            for gx in 0..grid - 1 {
                let a = (gy * grid + gx) as u32;
                let b = a + 1;
                let c = a + grid as u32;
                let d = c + 1;
                faces.push([a, c, b]);
                faces.push([b, c, d]);
            }
        }

        let shape_var = decaying_variance(spec.shape_dim, 25.0);
        let expression_var = decaying_variance(spec.expression_dim, 16.0);
        let albedo_var = decaying_variance(spec.albedo_dim, 0.05);

        let shape_basis = random_basis(&mut rng, 3 * v_count, &shape_var);
        let expression_basis = random_basis(&mut rng, 3 * v_count, &expression_var);
        let diffuse_basis = random_basis(&mut rng, 3 * v_count, &albedo_var);
        let specular_basis = random_basis(&mut rng, 3 * v_count, &albedo_var);

        let mut mean_diffuse = DMatrix::zeros(v_count, 3);
        let mut mean_specular = DMatrix::zeros(v_count, 3);
        for v in 0..v_count {
            let shade = 1.0 + 0.05 * (rng.gen::<f32>() - 0.5);
            mean_diffuse[(v, 0)] = 0.62 * shade;
            mean_diffuse[(v, 1)] = 0.45 * shade;
            mean_diffuse[(v, 2)] = 0.35 * shade;
            mean_specular[(v, 0)] = 0.15;
            mean_specular[(v, 1)] = 0.15;
            mean_specular[(v, 2)] = 0.15;
        }

        let landmarks = landmark_ring(grid);

        let tex = spec.texture_size.max(8);
        let mut texel_lut = Vec::with_capacity(tex * tex);
        for ty in 0..tex {
            for tx in 0..tex {
                let u = tx as f32 / (tex - 1) as f32;
                let v = ty as f32 / (tex - 1) as f32;
                let gx = (u * (grid - 1) as f32).round() as usize;
                let gy = (v * (grid - 1) as f32).round() as usize;
                texel_lut.push(gy * grid + gx);
            }
        }

        Self {
            dims: ModelDims {
                shape: spec.shape_dim,
                expression: spec.expression_dim,
                albedo: spec.albedo_dim,
            },
            mean_shape,
            shape_basis,
            expression_basis,
            mean_diffuse,
            mean_specular,
            diffuse_basis,
            specular_basis,
            shape_var,
            expression_var,
            albedo_var,
            faces,
            uv,
            landmarks,
            texel_lut,
            texture_size: (tex, tex),
        }
    }
}

fn decaying_variance(dim: usize, scale: f32) -> DVector<f32> {
    DVector::from_fn(dim, |k, _| {
        let s = scale / (1.0 + k as f32 * 0.5);
        s * s
    })
}

/// Random basis whose column `k` has RMS amplitude `sqrt(var[k])`.
fn random_basis(rng: &mut StdRng, rows: usize, var: &DVector<f32>) -> DMatrix<f32> {
    DMatrix::from_fn(rows, var.len(), |_, k| {
        let amp = var[k].sqrt();
        amp * (rng.gen::<f32>() * 2.0 - 1.0)
    })
}

/// 68 landmark vertices: the boundary ring plus interior feature rows.
fn landmark_ring(grid: usize) -> Vec<usize> {
    let mut picks = Vec::with_capacity(LANDMARK_COUNT);
    // Jaw line along the bottom and sides.
    for i in 0..17 {
        let t = i as f32 / 16.0;
        let gx = (t * (grid - 1) as f32).round() as usize;
        let gy = grid - 1 - (((0.5 - (t - 0.5).abs()) * 2.0) * (grid / 6) as f32) as usize;
        picks.push(gy.min(grid - 1) * grid + gx);
    }
    // Brows, eyes, nose and mouth rows in the interior.
    let rows = [grid / 5, grid * 2 / 5, grid / 2, grid * 7 / 10];
    let per_row = (LANDMARK_COUNT - picks.len()) / rows.len();
    for (r, &gy) in rows.iter().enumerate() {
        let count = if r == rows.len() - 1 {
            LANDMARK_COUNT - picks.len()
        } else {
            per_row
        };
        for i in 0..count {
            let t = (i as f32 + 0.5) / count as f32;
            let gx = (grid as f32 * (0.15 + 0.7 * t)).round() as usize;
            picks.push(gy * grid + gx.min(grid - 1));
        }
    }
    picks.truncate(LANDMARK_COUNT);
    picks
}

impl MorphableModel for LinearFaceModel {
    fn dims(&self) -> ModelDims {
        self.dims
    }

    fn vertex_count(&self) -> usize {
        self.mean_shape.nrows()
    }

    fn faces(&self) -> &[[u32; 3]] {
        &self.faces
    }

    fn uv_map(&self) -> &[[f32; 2]] {
        &self.uv
    }

    fn landmark_association(&self) -> &[usize] {
        &self.landmarks
    }

    fn shape_variance(&self) -> &DVector<f32> {
        &self.shape_var
    }

    fn expression_variance(&self) -> &DVector<f32> {
        &self.expression_var
    }

    fn albedo_variance(&self) -> &DVector<f32> {
        &self.albedo_var
    }

    fn compute_shape(&self, shape: &DVector<f32>, expression: &DVector<f32>) -> DMatrix<f32> {
        let flat = &self.shape_basis * shape + &self.expression_basis * expression;
        let mut vertices = self.mean_shape.clone();
        for v in 0..vertices.nrows() {
            for c in 0..3 {
                vertices[(v, c)] += flat[3 * v + c];
            }
        }
        vertices
    }

    fn compute_albedo(&self, albedo: &DVector<f32>) -> (DMatrix<f32>, DMatrix<f32>) {
        let flat_d = &self.diffuse_basis * albedo;
        let flat_s = &self.specular_basis * albedo;
        let mut diffuse = self.mean_diffuse.clone();
        let mut specular = self.mean_specular.clone();
        for v in 0..diffuse.nrows() {
            for c in 0..3 {
                diffuse[(v, c)] += flat_d[3 * v + c];
                specular[(v, c)] += flat_s[3 * v + c];
            }
        }
        (diffuse, specular)
    }

    fn compute_normals(&self, vertices: &DMatrix<f32>) -> DMatrix<f32> {
        let mut normals = DMatrix::zeros(vertices.nrows(), 3);
        for f in &self.faces {
            let [a, b, c] = [f[0] as usize, f[1] as usize, f[2] as usize];
            let pa = Vector3::new(vertices[(a, 0)], vertices[(a, 1)], vertices[(a, 2)]);
            let pb = Vector3::new(vertices[(b, 0)], vertices[(b, 1)], vertices[(b, 2)]);
            let pc = Vector3::new(vertices[(c, 0)], vertices[(c, 1)], vertices[(c, 2)]);
            let n = (pb - pa).cross(&(pc - pa));
            for &v in &[a, b, c] {
                normals[(v, 0)] += n[0];
                normals[(v, 1)] += n[1];
                normals[(v, 2)] += n[2];
            }
        }
        for v in 0..normals.nrows() {
            let len = (normals[(v, 0)] * normals[(v, 0)]
                + normals[(v, 1)] * normals[(v, 1)]
                + normals[(v, 2)] * normals[(v, 2)])
                .sqrt()
                .max(1e-8);
            for c in 0..3 {
                normals[(v, c)] /= len;
            }
        }
        normals
    }

    fn backprop_shape(&self, d_vertices: &DMatrix<f32>) -> (DVector<f32>, DVector<f32>) {
        let mut flat = DVector::zeros(3 * d_vertices.nrows());
        for v in 0..d_vertices.nrows() {
            for c in 0..3 {
                flat[3 * v + c] = d_vertices[(v, c)];
            }
        }
        (
            self.shape_basis.transpose() * &flat,
            self.expression_basis.transpose() * &flat,
        )
    }

    fn backprop_albedo(&self, d_diffuse: &DMatrix<f32>, d_specular: &DMatrix<f32>) -> DVector<f32> {
        let mut flat_d = DVector::zeros(3 * d_diffuse.nrows());
        let mut flat_s = DVector::zeros(3 * d_specular.nrows());
        for v in 0..d_diffuse.nrows() {
            for c in 0..3 {
                flat_d[3 * v + c] = d_diffuse[(v, c)];
                flat_s[3 * v + c] = d_specular[(v, c)];
            }
        }
        self.diffuse_basis.transpose() * &flat_d + self.specular_basis.transpose() * &flat_s
    }

    fn texture_size(&self) -> (usize, usize) {
        self.texture_size
    }

    fn texel_to_vertex(&self) -> &[usize] {
        &self.texel_lut
    }

    fn default_roughness(&self) -> f32 {
        0.4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_coefficients_reproduce_the_mean() {
        let model = LinearFaceModel::new(&LinearModelSpec {
            grid: 8,
            shape_dim: 4,
            expression_dim: 3,
            albedo_dim: 2,
            texture_size: 16,
            seed: 1,
        });
        let zero_s = DVector::zeros(4);
        let zero_e = DVector::zeros(3);
        let verts = model.compute_shape(&zero_s, &zero_e);
        assert_eq!(verts, model.mean_shape);
    }

    #[test]
    fn shape_backward_matches_forward_linearity() {
        let model = LinearFaceModel::new(&LinearModelSpec {
            grid: 6,
            shape_dim: 3,
            expression_dim: 2,
            albedo_dim: 2,
            texture_size: 8,
            seed: 3,
        });
        // For linear f, <J^T g, s> == <g, f(s) - f(0)>.
        let s = DVector::from_vec(vec![0.3, -0.2, 0.1]);
        let e = DVector::zeros(2);
        let base = model.compute_shape(&DVector::zeros(3), &e);
        let moved = model.compute_shape(&s, &e);
        let g = DMatrix::from_element(model.vertex_count(), 3, 0.25);
        let (d_s, _) = model.backprop_shape(&g);
        let lhs: f32 = d_s.dot(&s);
        let rhs: f32 = g.zip_fold(&(moved - base), 0.0, |acc, gi, di| acc + gi * di);
        assert!((lhs - rhs).abs() < 1e-2 * lhs.abs().max(1.0));
    }

    #[test]
    fn landmark_association_is_full_and_in_range() {
        let model = LinearFaceModel::new(&LinearModelSpec::default());
        let assoc = model.landmark_association();
        assert_eq!(assoc.len(), LANDMARK_COUNT);
        assert!(assoc.iter().all(|&v| v < model.vertex_count()));
    }
}
