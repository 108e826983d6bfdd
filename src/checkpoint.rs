//! Checkpoint records: serialize the full parameter state at stage
//! boundaries and restore it, partially when the record predates a field.
//!
//! The record is a key-value document keyed by field name; optional keys
//! double as the format version. Loading overwrites exactly the fields the
//! record carries and leaves everything else untouched, so a record written
//! before texture refinement existed still loads cleanly.
use crate::state::{FitState, TextureStack};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// On-disk checkpoint document. Every key is optional on read.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape_coeff: Option<DMatrix<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub albedo_coeff: Option<DMatrix<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression_coeff: Option<DMatrix<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<DMatrix<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<DMatrix<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focal: Option<DVector<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sh_coeff: Option<DMatrix<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_width: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_height: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_identity: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhanced_diffuse: Option<TextureStack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhanced_specular: Option<TextureStack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhanced_roughness: Option<TextureStack>,
}

impl CheckpointRecord {
    /// Snapshot every field of `state`, including enhanced maps if present.
    pub fn from_state(state: &FitState) -> Self {
        Self {
            shape_coeff: Some(state.shape_coeff.clone()),
            albedo_coeff: Some(state.albedo_coeff.clone()),
            expression_coeff: Some(state.expression_coeff.clone()),
            rotation: Some(state.rotation.clone()),
            translation: Some(state.translation.clone()),
            focal: Some(state.focal.clone()),
            sh_coeff: Some(state.sh_coeff.clone()),
            screen_width: Some(state.screen_width),
            screen_height: Some(state.screen_height),
            shared_identity: Some(state.shared_identity),
            enhanced_diffuse: state.enhanced_diffuse.clone(),
            enhanced_specular: state.enhanced_specular.clone(),
            enhanced_roughness: state.enhanced_roughness.clone(),
        }
    }

    /// Overwrite every state field the record carries; absent keys leave the
    /// in-memory value untouched.
    pub fn apply(self, state: &mut FitState) {
        if let Some(v) = self.shape_coeff {
            state.shape_coeff = v;
        }
        if let Some(v) = self.albedo_coeff {
            state.albedo_coeff = v;
        }
        if let Some(v) = self.expression_coeff {
            state.expression_coeff = v;
        }
        if let Some(v) = self.rotation {
            state.rotation = v;
        }
        if let Some(v) = self.translation {
            state.translation = v;
        }
        if let Some(v) = self.focal {
            state.focal = v;
        }
        if let Some(v) = self.sh_coeff {
            state.sh_coeff = v;
        }
        if let Some(v) = self.screen_width {
            state.screen_width = v;
        }
        if let Some(v) = self.screen_height {
            state.screen_height = v;
        }
        if let Some(v) = self.shared_identity {
            state.shared_identity = v;
        }
        if let Some(v) = self.enhanced_diffuse {
            state.enhanced_diffuse = Some(v);
        }
        if let Some(v) = self.enhanced_specular {
            state.enhanced_specular = Some(v);
        }
        if let Some(v) = self.enhanced_roughness {
            state.enhanced_roughness = Some(v);
        }
    }
}

/// Write the complete current state to `path`.
pub fn save(path: &Path, state: &FitState) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
    }
    let file = File::create(path)
        .map_err(|e| format!("Failed to create checkpoint {}: {e}", path.display()))?;
    let record = CheckpointRecord::from_state(state);
    serde_json::to_writer(BufWriter::new(file), &record)
        .map_err(|e| format!("Failed to write checkpoint {}: {e}", path.display()))
}

/// Read a record from `path`. A missing or unreadable file is an error at
/// the point of an explicit resume request, never silently ignored.
pub fn read_record(path: &Path) -> Result<CheckpointRecord, String> {
    let file = File::open(path)
        .map_err(|e| format!("Failed to open checkpoint {}: {e}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| format!("Failed to parse checkpoint {}: {e}", path.display()))
}

/// Load a record and overwrite the state fields it carries.
pub fn load(path: &Path, state: &mut FitState) -> Result<(), String> {
    read_record(path)?.apply(state);
    Ok(())
}

/// Restore only the albedo coefficients from a record, leaving every other
/// field in place. Used to graft the reflectance of one run onto another.
pub fn load_albedo(path: &Path, state: &mut FitState) -> Result<(), String> {
    let record = read_record(path)?;
    match record.albedo_coeff {
        Some(v) => {
            state.albedo_coeff = v;
            Ok(())
        }
        None => Err(format!(
            "Checkpoint {} carries no albedo coefficients",
            path.display()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateInit;

    fn small_state() -> FitState {
        let mut state = FitState::new(&StateInit {
            frames: 2,
            shared_identity: false,
            shape_dim: 3,
            expression_dim: 2,
            albedo_dim: 2,
            screen_width: 32,
            screen_height: 24,
            initial_focal: 400.0,
        });
        state.shape_coeff[(0, 1)] = 0.5;
        state.rotation[(1, 2)] = -0.25;
        state
    }

    #[test]
    fn empty_record_applies_as_a_no_op() {
        let mut state = small_state();
        let before = state.clone();
        let record: CheckpointRecord = serde_json::from_str("{}").expect("parse");
        record.apply(&mut state);
        assert_eq!(state.shape_coeff, before.shape_coeff);
        assert_eq!(state.rotation, before.rotation);
        assert_eq!(state.screen_width, before.screen_width);
        assert!(state.enhanced_diffuse.is_none());
    }

    #[test]
    fn record_round_trips_through_json() {
        let state = small_state();
        let record = CheckpointRecord::from_state(&state);
        let json = serde_json::to_string(&record).expect("serialize");
        let parsed: CheckpointRecord = serde_json::from_str(&json).expect("parse");
        let mut restored = FitState::new(&StateInit {
            frames: 2,
            shared_identity: false,
            shape_dim: 3,
            expression_dim: 2,
            albedo_dim: 2,
            screen_width: 1,
            screen_height: 1,
            initial_focal: 1.0,
        });
        parsed.apply(&mut restored);
        assert_eq!(restored.shape_coeff, state.shape_coeff);
        assert_eq!(restored.rotation, state.rotation);
        assert_eq!(restored.focal, state.focal);
        assert_eq!(restored.screen_width, 32);
    }
}
