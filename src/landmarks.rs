//! Landmark-detector seam.
//!
//! Both bundled detectors share one output contract: [`LANDMARK_COUNT`] 2D
//! keypoints per frame in a fixed order matching the model's landmark-vertex
//! association (jaw arc first, then the interior feature rows). They are
//! lightweight heuristics — a production deployment would put a learned
//! detector behind the same trait.
use crate::image::ImageRgbF32;
use crate::model::LANDMARK_COUNT;
use serde::Deserialize;

/// 2D keypoints for one frame, in association order.
pub type LandmarkSet = Vec<[f32; 2]>;

/// Detector selection, fixed at configuration time. An unknown name in a
/// config file fails deserialization and aborts the run before any stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Gradient-contrast box fit.
    Contrast,
    /// Luminance-moment ellipse fit.
    Centroid,
}

impl DetectorKind {
    pub fn create(self) -> Box<dyn LandmarkDetector> {
        match self {
            DetectorKind::Contrast => Box::new(ContrastDetector::default()),
            DetectorKind::Centroid => Box::new(CentroidDetector),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DetectorKind::Contrast => "contrast",
            DetectorKind::Centroid => "centroid",
        }
    }
}

/// Maps an image batch to per-frame 2D keypoint sets.
pub trait LandmarkDetector {
    fn detect(&self, frames: &[ImageRgbF32]) -> Result<Vec<LandmarkSet>, String>;
}

/// Canonical 68-point layout inside a face box, matching the model's
/// association order: 17 jaw points along the lower arc, then brow/eye/nose
/// and mouth rows.
fn template_landmarks(cx: f32, cy: f32, half_w: f32, half_h: f32) -> LandmarkSet {
    let mut points = Vec::with_capacity(LANDMARK_COUNT);
    for i in 0..17 {
        let t = i as f32 / 16.0;
        let x = cx + (t - 0.5) * 2.0 * half_w;
        let arc = 1.0 - (t - 0.5).abs() * 2.0;
        let y = cy + half_h * (0.55 + 0.35 * arc);
        points.push([x, y]);
    }
    let rows = [-0.6f32, -0.2, 0.0, 0.4];
    let remaining = LANDMARK_COUNT - points.len();
    let per_row = remaining / rows.len();
    for (r, &ry) in rows.iter().enumerate() {
        let count = if r == rows.len() - 1 {
            LANDMARK_COUNT - points.len()
        } else {
            per_row
        };
        for i in 0..count {
            let t = (i as f32 + 0.5) / count as f32;
            let x = cx + (0.7 * (t - 0.5) * 2.0) * half_w;
            points.push([x, cy + ry * half_h]);
        }
    }
    points.truncate(LANDMARK_COUNT);
    points
}

#[inline]
fn luminance(px: [f32; 3]) -> f32 {
    0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2]
}

/// Finds the face box from horizontal/vertical gradient-contrast profiles.
#[derive(Default)]
pub struct ContrastDetector;

impl LandmarkDetector for ContrastDetector {
    fn detect(&self, frames: &[ImageRgbF32]) -> Result<Vec<LandmarkSet>, String> {
        let mut out = Vec::with_capacity(frames.len());
        for (idx, frame) in frames.iter().enumerate() {
            let (w, h) = (frame.w, frame.h);
            let mut col_energy = vec![0.0f32; w];
            let mut row_energy = vec![0.0f32; h];
            for y in 1..h {
                for x in 1..w {
                    let l = luminance(frame.pixel(x, y));
                    let gx = (l - luminance(frame.pixel(x - 1, y))).abs();
                    let gy = (l - luminance(frame.pixel(x, y - 1))).abs();
                    col_energy[x] += gx + gy;
                    row_energy[y] += gx + gy;
                }
            }
            let (x0, x1) = energy_bounds(&col_energy);
            let (y0, y1) = energy_bounds(&row_energy);
            if x1 <= x0 || y1 <= y0 {
                return Err(format!("contrast detector found no face in frame {idx}"));
            }
            let cx = (x0 + x1) as f32 * 0.5;
            let cy = (y0 + y1) as f32 * 0.5;
            let half_w = ((x1 - x0) as f32 * 0.5).max(2.0);
            let half_h = ((y1 - y0) as f32 * 0.5).max(2.0);
            out.push(template_landmarks(cx, cy, half_w, half_h));
        }
        Ok(out)
    }
}

/// Range containing 90% of the profile energy.
fn energy_bounds(profile: &[f32]) -> (usize, usize) {
    let total: f32 = profile.iter().sum();
    if total <= 0.0 {
        return (0, 0);
    }
    let mut acc = 0.0f32;
    let mut lo = 0usize;
    for (i, &e) in profile.iter().enumerate() {
        acc += e;
        if acc >= total * 0.05 {
            lo = i;
            break;
        }
    }
    let mut acc = 0.0f32;
    let mut hi = profile.len() - 1;
    for (i, &e) in profile.iter().enumerate().rev() {
        acc += e;
        if acc >= total * 0.05 {
            hi = i;
            break;
        }
    }
    (lo, hi)
}

/// Fits an ellipse from luminance moments and lays the template inside it.
pub struct CentroidDetector;

impl LandmarkDetector for CentroidDetector {
    fn detect(&self, frames: &[ImageRgbF32]) -> Result<Vec<LandmarkSet>, String> {
        let mut out = Vec::with_capacity(frames.len());
        for (idx, frame) in frames.iter().enumerate() {
            let (w, h) = (frame.w, frame.h);
            let mut mass = 0.0f32;
            let mut mx = 0.0f32;
            let mut my = 0.0f32;
            for y in 0..h {
                for x in 0..w {
                    let l = luminance(frame.pixel(x, y));
                    mass += l;
                    mx += l * x as f32;
                    my += l * y as f32;
                }
            }
            if mass <= 1e-6 {
                return Err(format!("centroid detector found no face in frame {idx}"));
            }
            let cx = mx / mass;
            let cy = my / mass;
            let mut vx = 0.0f32;
            let mut vy = 0.0f32;
            for y in 0..h {
                for x in 0..w {
                    let l = luminance(frame.pixel(x, y));
                    let dx = x as f32 - cx;
                    let dy = y as f32 - cy;
                    vx += l * dx * dx;
                    vy += l * dy * dy;
                }
            }
            let half_w = (vx / mass).sqrt().max(2.0) * 1.6;
            let half_h = (vy / mass).sqrt().max(2.0) * 1.6;
            out.push(template_landmarks(cx, cy, half_w, half_h));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bright_square_frame() -> ImageRgbF32 {
        let mut img = ImageRgbF32::new(64, 64);
        for y in 20..44 {
            for x in 16..48 {
                img.set_pixel(x, y, [0.8, 0.7, 0.6]);
            }
        }
        img
    }

    #[test]
    fn both_detectors_share_the_output_contract() {
        let frames = vec![bright_square_frame()];
        for kind in [DetectorKind::Contrast, DetectorKind::Centroid] {
            let detector = kind.create();
            let sets = detector.detect(&frames).expect("detection");
            assert_eq!(sets.len(), 1, "{}", kind.name());
            assert_eq!(sets[0].len(), LANDMARK_COUNT, "{}", kind.name());
        }
    }

    #[test]
    fn detected_landmarks_cluster_around_the_face() {
        let frames = vec![bright_square_frame()];
        let sets = ContrastDetector.detect(&frames).expect("detection");
        let mean_x: f32 = sets[0].iter().map(|p| p[0]).sum::<f32>() / LANDMARK_COUNT as f32;
        let mean_y: f32 = sets[0].iter().map(|p| p[1]).sum::<f32>() / LANDMARK_COUNT as f32;
        assert!((mean_x - 32.0).abs() < 12.0);
        assert!((mean_y - 32.0).abs() < 14.0);
    }
}
