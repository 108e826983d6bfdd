#![doc = include_str!("../README.md")]

// Public modules (stable-ish surface)
pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod image;
pub mod schedule;
pub mod state;
pub mod types;

// “Expert” modules – still public, but considered unstable internals.
// (You can tighten or feature-gate these later.)
pub mod camera;
pub mod export;
pub mod landmarks;
pub mod loss;
pub mod model;
pub mod optim;
pub mod render;

// --- High-level re-exports -------------------------------------------------

// Main entry points: fitting driver + results.
pub use crate::config::{load_config, FitConfig};
pub use crate::driver::{FaceFitter, RunOptions};
pub use crate::types::{FitReport, StageSummary};

// Staged-optimization surface for tools and advanced users.
pub use crate::schedule::{FitStage, ScheduleEvent, StagePlan, StageScheduler};
pub use crate::state::{FitState, ParamField};

// --- Prelude ---------------------------------------------------------------

/// Small prelude for quick experiments.
///
/// ```no_run
/// use face_fitter::prelude::*;
/// use std::path::Path;
///
/// # fn main() -> Result<(), String> {
/// let mut fitter = FaceFitter::new(Path::new("out"), FitConfig::default());
/// fitter.set_input(Path::new("photo.png"), false)?;
/// let report = fitter.run(&RunOptions::default())?;
/// println!("fitted {} frame(s) in {:.1} ms", report.frames, report.total_ms);
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    pub use crate::config::FitConfig;
    pub use crate::driver::{FaceFitter, RunOptions};
    pub use crate::state::FitState;
    pub use crate::types::FitReport;
}
