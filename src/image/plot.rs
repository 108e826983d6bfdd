//! Minimal loss-curve plotting.
//!
//! Renders a per-iteration loss history into a grayscale PNG so a run can be
//! inspected without external tooling. Axes are implicit: x is iteration,
//! y spans [min, max] of the finite history values.
use super::io::save_gray_png;
use super::ImageF32;
use std::path::Path;

const PLOT_W: usize = 640;
const PLOT_H: usize = 360;
const MARGIN: usize = 12;

/// Plot `losses` as a polyline and write the result to `path` as a PNG.
pub fn save_loss_plot(path: &Path, losses: &[f32]) -> Result<(), String> {
    let mut canvas = ImageF32::filled(PLOT_W, PLOT_H, 1.0);
    if losses.len() >= 2 {
        let finite: Vec<f32> = losses.iter().copied().filter(|v| v.is_finite()).collect();
        let (lo, hi) = bounds(&finite);
        let span = (hi - lo).max(1e-12);
        let inner_w = (PLOT_W - 2 * MARGIN) as f32;
        let inner_h = (PLOT_H - 2 * MARGIN) as f32;
        let to_xy = |i: usize, v: f32| -> (f32, f32) {
            let x = MARGIN as f32 + inner_w * i as f32 / (losses.len() - 1) as f32;
            let t = ((v - lo) / span).clamp(0.0, 1.0);
            let y = MARGIN as f32 + inner_h * (1.0 - t);
            (x, y)
        };
        let mut prev: Option<(f32, f32)> = None;
        for (i, &v) in losses.iter().enumerate() {
            if !v.is_finite() {
                prev = None;
                continue;
            }
            let cur = to_xy(i, v);
            if let Some(p) = prev {
                draw_line(&mut canvas, p, cur);
            }
            prev = Some(cur);
        }
    }
    save_gray_png(path, &canvas)
}

fn bounds(values: &[f32]) -> (f32, f32) {
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for &v in values {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if !lo.is_finite() || !hi.is_finite() {
        (0.0, 1.0)
    } else {
        (lo, hi)
    }
}

fn draw_line(canvas: &mut ImageF32, p0: (f32, f32), p1: (f32, f32)) {
    let steps = ((p1.0 - p0.0).abs().max((p1.1 - p0.1).abs()).ceil() as usize).max(1);
    for s in 0..=steps {
        let t = s as f32 / steps as f32;
        let x = p0.0 + (p1.0 - p0.0) * t;
        let y = p0.1 + (p1.1 - p0.1) * t;
        let (xi, yi) = (x.round() as isize, y.round() as isize);
        if xi >= 0 && yi >= 0 && (xi as usize) < canvas.w && (yi as usize) < canvas.h {
            canvas.set(xi as usize, yi as usize, 0.0);
        }
    }
}
