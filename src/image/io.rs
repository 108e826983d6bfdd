//! I/O helpers for RGB images and JSON.
//!
//! - `load_input_frames`: read a single image or every image in a directory
//!   into float RGB frames with a common resolution.
//! - `save_rgb_png` / `save_gray_png`: write float buffers to 8-bit PNG.
//! - `write_json_file`: pretty-print a serializable value to disk.
use super::{ImageF32, ImageRgbF32};
use image::{ImageBuffer, Rgb};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// A batch of input photographs sharing one resolution.
#[derive(Clone, Debug)]
pub struct InputBatch {
    pub frames: Vec<ImageRgbF32>,
    pub width: usize,
    pub height: usize,
}

impl InputBatch {
    /// Number of frames in the batch.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Image center in pixels, used by camera-pose estimation.
    pub fn center(&self) -> [f32; 2] {
        [self.width as f32 * 0.5, self.height as f32 * 0.5]
    }
}

/// Load an image from disk into a float RGB buffer with channels in [0, 1].
pub fn load_rgb_image(path: &Path) -> Result<ImageRgbF32, String> {
    let img = image::open(path)
        .map_err(|e| format!("Failed to open {}: {e}", path.display()))?
        .into_rgb8();
    let w = img.width() as usize;
    let h = img.height() as usize;
    let mut out = ImageRgbF32::new(w, h);
    for (x, y, px) in img.enumerate_pixels() {
        out.set_pixel(
            x as usize,
            y as usize,
            [
                px.0[0] as f32 / 255.0,
                px.0[1] as f32 / 255.0,
                px.0[2] as f32 / 255.0,
            ],
        );
    }
    Ok(out)
}

/// Load one image, or every image in a directory, into an [`InputBatch`].
///
/// Directory entries are read in lexicographic order so frame indices are
/// stable across runs. Every frame must share the first frame's resolution.
pub fn load_input_frames(path: &Path) -> Result<InputBatch, String> {
    let mut files: Vec<PathBuf> = if path.is_file() {
        vec![path.to_path_buf()]
    } else if path.is_dir() {
        let mut entries = Vec::new();
        let dir = fs::read_dir(path)
            .map_err(|e| format!("Failed to read input directory {}: {e}", path.display()))?;
        for entry in dir {
            let entry = entry
                .map_err(|e| format!("Failed to list input directory {}: {e}", path.display()))?;
            let p = entry.path();
            if p.is_file() && is_supported_image(&p) {
                entries.push(p);
            }
        }
        entries
    } else {
        return Err(format!("Input path {} does not exist", path.display()));
    };
    files.sort();

    let mut frames = Vec::with_capacity(files.len());
    let mut width = 0usize;
    let mut height = 0usize;
    for file in &files {
        let frame = load_rgb_image(file)?;
        if frames.is_empty() {
            width = frame.w;
            height = frame.h;
        } else if frame.w != width || frame.h != height {
            return Err(format!(
                "Input frame {} is {}x{} but the batch is {}x{}",
                file.display(),
                frame.w,
                frame.h,
                width,
                height
            ));
        }
        frames.push(frame);
    }
    if frames.is_empty() {
        return Err(format!(
            "No readable image frames found at {}",
            path.display()
        ));
    }
    Ok(InputBatch {
        frames,
        width,
        height,
    })
}

fn is_supported_image(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("png") | Some("jpg") | Some("jpeg") | Some("bmp") | Some("tiff")
    )
}

/// Write a linear RGB buffer to an 8-bit PNG, optionally gamma-encoding with
/// exponent `1/gamma` first.
pub fn save_rgb_png(path: &Path, img: &ImageRgbF32, gamma: Option<f32>) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
    }
    let inv_gamma = gamma.map(|g| 1.0 / g.max(1e-6));
    let buf: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_fn(img.w as u32, img.h as u32, |x, y| {
            let px = img.pixel(x as usize, y as usize);
            let encode = |v: f32| {
                let v = v.clamp(0.0, 1.0);
                let v = match inv_gamma {
                    Some(ig) => v.powf(ig),
                    None => v,
                };
                (v * 255.0).round() as u8
            };
            Rgb([encode(px[0]), encode(px[1]), encode(px[2])])
        });
    buf.save(path)
        .map_err(|e| format!("Failed to save {}: {e}", path.display()))
}

/// Write a single-channel buffer to an 8-bit grayscale PNG (replicated to RGB).
pub fn save_gray_png(path: &Path, img: &ImageF32) -> Result<(), String> {
    let mut rgb = ImageRgbF32::new(img.w, img.h);
    for y in 0..img.h {
        for x in 0..img.w {
            let v = img.get(x, y);
            rgb.set_pixel(x, y, [v, v, v]);
        }
    }
    save_rgb_png(path, &rgb, None)
}

/// Pretty-print a serializable value to a JSON file.
pub fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Failed to serialize JSON for {}: {e}", path.display()))?;
    fs::write(path, json).map_err(|e| format!("Failed to write {}: {e}", path.display()))
}
