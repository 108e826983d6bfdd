//! Per-texel texture regularization for the refinement stage.
//!
//! Combines four penalties per map: left-right symmetry, consistency with the
//! statistically-derived starting texture, local smoothness, and a uniformity
//! anchor pulling texels toward the map mean. Channel-specific weights come
//! from configuration (specular favors smoothness and uniformity, diffuse
//! favors fidelity).
use crate::state::TextureStack;

/// Weights of the individual texture penalties.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextureRegWeights {
    pub symmetry: f32,
    pub consistency: f32,
    pub smoothness: f32,
    pub uniformity: f32,
}

/// Weighted regularization value plus the gradient per texel.
pub struct TextureRegResult {
    pub loss: f32,
    pub d_texture: Vec<f32>,
}

/// Evaluate all texture penalties for one stack against its reference.
pub fn reg_texture(
    tex: &TextureStack,
    reference: &TextureStack,
    weights: &TextureRegWeights,
) -> TextureRegResult {
    let mut loss = 0.0f32;
    let mut grad = vec![0.0f32; tex.data.len()];
    let n = tex.data.len().max(1) as f32;
    let (w, h, ch) = (tex.width, tex.height, tex.channels);

    for map in 0..tex.count {
        // Left-right symmetry about the vertical texture midline.
        if weights.symmetry != 0.0 {
            for y in 0..h {
                for x in 0..w {
                    let mx = w - 1 - x;
                    for c in 0..ch {
                        let d = tex.get(map, x, y, c) - tex.get(map, mx, y, c);
                        loss += weights.symmetry * d * d / n;
                        let g = weights.symmetry * 2.0 * d / n;
                        grad[tex.idx(map, x, y, c)] += g;
                        grad[tex.idx(map, mx, y, c)] -= g;
                    }
                }
            }
        }

        // Distance from the starting texture.
        if weights.consistency != 0.0 {
            for i in 0..tex.map_len() {
                let gi = map * tex.map_len() + i;
                let d = tex.data[gi] - reference.data[gi];
                loss += weights.consistency * d * d / n;
                grad[gi] += weights.consistency * 2.0 * d / n;
            }
        }

        // First-difference smoothness over the 4-neighborhood.
        if weights.smoothness != 0.0 {
            for y in 0..h {
                for x in 0..w {
                    for c in 0..ch {
                        let here = tex.get(map, x, y, c);
                        if x + 1 < w {
                            let d = here - tex.get(map, x + 1, y, c);
                            loss += weights.smoothness * d * d / n;
                            let g = weights.smoothness * 2.0 * d / n;
                            grad[tex.idx(map, x, y, c)] += g;
                            grad[tex.idx(map, x + 1, y, c)] -= g;
                        }
                        if y + 1 < h {
                            let d = here - tex.get(map, x, y + 1, c);
                            loss += weights.smoothness * d * d / n;
                            let g = weights.smoothness * 2.0 * d / n;
                            grad[tex.idx(map, x, y, c)] += g;
                            grad[tex.idx(map, x, y + 1, c)] -= g;
                        }
                    }
                }
            }
        }

        // Pull texels toward the per-map mean.
        if weights.uniformity != 0.0 {
            let map_len = tex.map_len() as f32;
            let start = map * tex.map_len();
            let mean: f32 =
                tex.data[start..start + tex.map_len()].iter().sum::<f32>() / map_len;
            for i in 0..tex.map_len() {
                let gi = start + i;
                let d = tex.data[gi] - mean;
                loss += weights.uniformity * d * d / n;
                grad[gi] += weights.uniformity * 2.0 * d / n;
            }
        }
    }

    TextureRegResult {
        loss,
        d_texture: grad,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack_from(data: Vec<f32>, w: usize, h: usize) -> TextureStack {
        TextureStack {
            count: 1,
            width: w,
            height: h,
            channels: 1,
            data,
        }
    }

    #[test]
    fn symmetric_uniform_map_has_zero_regularization() {
        let tex = stack_from(vec![0.5; 16], 4, 4);
        let reference = tex.clone();
        let res = reg_texture(
            &tex,
            &reference,
            &TextureRegWeights {
                symmetry: 1.0,
                consistency: 1.0,
                smoothness: 1.0,
                uniformity: 1.0,
            },
        );
        assert_eq!(res.loss, 0.0);
        assert!(res.d_texture.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn asymmetry_is_penalized_and_pulled_back() {
        let mut tex = stack_from(vec![0.5; 16], 4, 4);
        tex.set(0, 0, 0, 0, 0.9);
        let reference = stack_from(vec![0.5; 16], 4, 4);
        let res = reg_texture(
            &tex,
            &reference,
            &TextureRegWeights {
                symmetry: 1.0,
                ..Default::default()
            },
        );
        assert!(res.loss > 0.0);
        // The bright texel is pushed down, its mirror pushed up.
        assert!(res.d_texture[tex.idx(0, 0, 0, 0)] > 0.0);
        assert!(res.d_texture[tex.idx(0, 3, 0, 0)] < 0.0);
    }

    #[test]
    fn consistency_tracks_the_reference() {
        let tex = stack_from(vec![0.8; 4], 2, 2);
        let reference = stack_from(vec![0.5; 4], 2, 2);
        let res = reg_texture(
            &tex,
            &reference,
            &TextureRegWeights {
                consistency: 2.0,
                ..Default::default()
            },
        );
        assert!((res.loss - 2.0 * 0.3f32 * 0.3).abs() < 1e-5);
        assert!(res.d_texture.iter().all(|&g| g > 0.0));
    }
}
