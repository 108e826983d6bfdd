//! Adam-style adaptive optimizer over named parameter blocks.
//!
//! Each [`ParamField`] keeps its own first/second-moment buffers and step
//! counter, so a block promoted mid-stage starts with fresh moments and its
//! own bias correction — the declarative equivalent of adding a parameter
//! group to a running optimizer.
use crate::state::ParamField;
use std::collections::HashMap;

/// Moment decay rates and the denominator floor.
#[derive(Clone, Copy, Debug)]
pub struct AdamParams {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

struct AdamBuf {
    m: Vec<f32>,
    v: Vec<f32>,
    t: u64,
}

/// Per-block Adam state. One instance lives for the duration of a stage.
pub struct Adam {
    params: AdamParams,
    state: HashMap<ParamField, AdamBuf>,
}

impl Adam {
    pub fn new(params: AdamParams) -> Self {
        Self {
            params,
            state: HashMap::new(),
        }
    }

    /// Drop all moment buffers (used at stage boundaries).
    pub fn reset(&mut self) {
        self.state.clear();
    }

    /// Apply one update to `data` in place given its gradient.
    ///
    /// `data` and `grad` must have identical layout; the block is identified
    /// by `field` so its moments persist across iterations.
    pub fn step(&mut self, field: ParamField, lr: f32, data: &mut [f32], grad: &[f32]) {
        debug_assert_eq!(data.len(), grad.len());
        let buf = self.state.entry(field).or_insert_with(|| AdamBuf {
            m: vec![0.0; data.len()],
            v: vec![0.0; data.len()],
            t: 0,
        });
        if buf.m.len() != data.len() {
            // Block shape changed (e.g. checkpoint load); restart its moments.
            buf.m = vec![0.0; data.len()];
            buf.v = vec![0.0; data.len()];
            buf.t = 0;
        }
        buf.t += 1;
        let b1 = self.params.beta1;
        let b2 = self.params.beta2;
        let bias1 = 1.0 - b1.powi(buf.t as i32);
        let bias2 = 1.0 - b2.powi(buf.t as i32);
        for i in 0..data.len() {
            let g = grad[i];
            buf.m[i] = b1 * buf.m[i] + (1.0 - b1) * g;
            buf.v[i] = b2 * buf.v[i] + (1.0 - b2) * g * g;
            let m_hat = buf.m[i] / bias1;
            let v_hat = buf.v[i] / bias2;
            data[i] -= lr * m_hat / (v_hat.sqrt() + self.params.epsilon);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadratic_objective_decreases_within_bounded_steps() {
        // f(x) = Σ (x - target)², a stand-in for the convex translation fit.
        let target = [1.5f32, -2.0, 0.25];
        let mut x = [0.0f32; 3];
        let mut adam = Adam::new(AdamParams::default());
        let loss = |x: &[f32; 3]| -> f32 {
            x.iter()
                .zip(target.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum()
        };
        let initial = loss(&x);
        let mut previous = initial;
        for step in 0..200 {
            let grad: Vec<f32> = x
                .iter()
                .zip(target.iter())
                .map(|(a, b)| 2.0 * (a - b))
                .collect();
            adam.step(ParamField::Translation, 0.05, &mut x, &grad);
            let current = loss(&x);
            if step == 0 {
                assert!(current < initial, "first step must strictly decrease");
            }
            previous = current;
        }
        assert!(previous < initial * 0.05, "final loss {previous}");
    }

    #[test]
    fn blocks_keep_independent_moments() {
        let mut adam = Adam::new(AdamParams::default());
        let mut a = [0.0f32];
        let mut b = [0.0f32];
        for _ in 0..10 {
            adam.step(ParamField::Shape, 0.1, &mut a, &[1.0]);
        }
        adam.step(ParamField::Expression, 0.1, &mut b, &[1.0]);
        // A freshly promoted block takes a bias-corrected full-size first step.
        assert!(b[0] < 0.0 && b[0] > -0.2);
        assert!(a[0] < b[0]);
    }
}
