use face_fitter::checkpoint::{self, CheckpointRecord};
use face_fitter::state::{FitState, StateInit, TextureStack};
use std::path::PathBuf;

fn state_init(frames: usize, shared: bool) -> StateInit {
    StateInit {
        frames,
        shared_identity: shared,
        shape_dim: 5,
        expression_dim: 3,
        albedo_dim: 4,
        screen_width: 40,
        screen_height: 30,
        initial_focal: 300.0,
    }
}

fn populated_state() -> FitState {
    let mut state = FitState::new(&state_init(2, false));
    state.shape_coeff[(0, 2)] = 0.4;
    state.shape_coeff[(1, 0)] = -0.1;
    state.albedo_coeff[(1, 3)] = 0.9;
    state.expression_coeff[(0, 1)] = -0.7;
    state.rotation[(0, 0)] = 0.2;
    state.translation[(1, 2)] = 310.0;
    state.focal[0] = 512.0;
    state.sh_coeff[(1, 5)] = 0.33;
    let mut map = TextureStack::zeros(2, 4, 4, 3);
    map.set(1, 2, 3, 1, 0.66);
    state.enhanced_diffuse = Some(map);
    state
}

fn temp_file(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("face_fitter_checkpoints");
    std::fs::create_dir_all(&dir).expect("temp dir");
    dir.join(format!("{tag}.json"))
}

#[test]
fn save_then_load_reproduces_every_recorded_field() {
    let state = populated_state();
    let path = temp_file("roundtrip");
    checkpoint::save(&path, &state).expect("save");

    let mut restored = FitState::new(&state_init(2, true));
    checkpoint::load(&path, &mut restored).expect("load");

    assert_eq!(restored.shape_coeff, state.shape_coeff);
    assert_eq!(restored.albedo_coeff, state.albedo_coeff);
    assert_eq!(restored.expression_coeff, state.expression_coeff);
    assert_eq!(restored.rotation, state.rotation);
    assert_eq!(restored.translation, state.translation);
    assert_eq!(restored.focal, state.focal);
    assert_eq!(restored.sh_coeff, state.sh_coeff);
    assert_eq!(restored.screen_width, state.screen_width);
    assert_eq!(restored.screen_height, state.screen_height);
    assert_eq!(restored.shared_identity, state.shared_identity);
    assert_eq!(restored.enhanced_diffuse, state.enhanced_diffuse);
    assert!(restored.enhanced_specular.is_none());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn record_with_only_albedo_leaves_other_fields_untouched() {
    let donor = populated_state();
    let full = serde_json::to_value(CheckpointRecord::from_state(&donor)).expect("serialize");
    let partial = serde_json::json!({ "albedo_coeff": full["albedo_coeff"] });
    let path = temp_file("albedo_only");
    std::fs::write(&path, partial.to_string()).expect("write partial record");

    let mut state = FitState::new(&state_init(2, false));
    state.rotation[(0, 1)] = 0.5;
    let rotation_before = state.rotation.clone();
    let shape_before = state.shape_coeff.clone();
    checkpoint::load(&path, &mut state).expect("partial load");

    assert_eq!(state.albedo_coeff, donor.albedo_coeff);
    assert_eq!(state.rotation, rotation_before);
    assert_eq!(state.shape_coeff, shape_before);
    assert!(state.enhanced_diffuse.is_none(), "older record restores no maps");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn load_albedo_grafts_only_the_reflectance() {
    let donor = populated_state();
    let path = temp_file("graft");
    checkpoint::save(&path, &donor).expect("save");

    let mut state = FitState::new(&state_init(2, false));
    let translation_before = state.translation.clone();
    checkpoint::load_albedo(&path, &mut state).expect("albedo load");
    assert_eq!(state.albedo_coeff, donor.albedo_coeff);
    assert_eq!(state.translation, translation_before);
    assert!(state.enhanced_diffuse.is_none());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn missing_checkpoint_file_is_an_error() {
    let mut state = FitState::new(&state_init(1, true));
    let err = checkpoint::load(&temp_file("never_written_x"), &mut state)
        .expect_err("missing file must fail");
    assert!(err.contains("Failed to open checkpoint"));
}
