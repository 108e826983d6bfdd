use serde::Serialize;

/// Summary of one completed optimization stage.
#[derive(Clone, Debug, Serialize)]
pub struct StageSummary {
    pub stage: &'static str,
    pub iterations: usize,
    pub initial_loss: Option<f32>,
    pub final_loss: Option<f32>,
    pub elapsed_ms: f64,
}

/// Per-run report written next to the exported artifacts.
#[derive(Clone, Debug, Serialize)]
pub struct FitReport {
    pub frames: usize,
    pub width: usize,
    pub height: usize,
    pub shared_identity: bool,
    pub renderer: &'static str,
    pub detector: &'static str,
    pub stages: Vec<StageSummary>,
    pub total_ms: f64,
}
