//! Declarative per-stage optimization schedules.
//!
//! Each stage is described by a [`StagePlan`]: which parameter blocks are
//! trainable, at what base learning rate, for how many iterations, and which
//! blocks get promoted mid-stage. The scheduler never touches the parameter
//! state — the driver re-derives the active field set from the plan at every
//! iteration and only steps what the plan declares.
use crate::state::ParamField;

/// The three fitting phases, entered strictly in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitStage {
    /// Head pose and expression from landmarks.
    Pose,
    /// Photometric appearance under the statistical prior.
    Appearance,
    /// Per-texel texture refinement.
    Texture,
}

impl FitStage {
    /// 1-based index used in artifact file names.
    pub fn index(self) -> usize {
        match self {
            FitStage::Pose => 1,
            FitStage::Appearance => 2,
            FitStage::Texture => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FitStage::Pose => "pose",
            FitStage::Appearance => "appearance",
            FitStage::Texture => "texture",
        }
    }
}

/// Mid-stage promotion of one parameter block.
#[derive(Clone, Copy, Debug)]
pub struct ScheduleEvent {
    pub at_iteration: usize,
    pub field: ParamField,
    pub learning_rate: f32,
}

/// Declarative descriptor of one stage.
#[derive(Clone, Debug)]
pub struct StagePlan {
    pub stage: FitStage,
    /// Blocks trainable from iteration 0, with base learning rates.
    pub fields: Vec<(ParamField, f32)>,
    pub iterations: usize,
    pub events: Vec<ScheduleEvent>,
}

impl StagePlan {
    /// The trainable field set at `iteration`: base fields plus every event
    /// whose threshold has been reached.
    pub fn active_fields(&self, iteration: usize) -> Vec<(ParamField, f32)> {
        let mut fields = self.fields.clone();
        for event in &self.events {
            if iteration >= event.at_iteration {
                fields.push((event.field, event.learning_rate));
            }
        }
        fields
    }

    /// Whether `field` may receive updates at `iteration`.
    pub fn is_active(&self, field: ParamField, iteration: usize) -> bool {
        self.active_fields(iteration)
            .iter()
            .any(|(f, _)| *f == field)
    }
}

/// Knobs the scheduler reads from the run configuration.
#[derive(Clone, Debug)]
pub struct ScheduleParams {
    pub pose_iterations: usize,
    pub appearance_iterations: usize,
    pub texture_iterations: usize,
    /// Whether the focal length joins the pose stage.
    pub optimize_focal: bool,
    /// Appearance-stage iteration at which geometry and pose are promoted.
    pub unfreeze_iteration: usize,
}

impl Default for ScheduleParams {
    fn default() -> Self {
        Self {
            pose_iterations: 200,
            appearance_iterations: 400,
            texture_iterations: 100,
            optimize_focal: false,
            unfreeze_iteration: 100,
        }
    }
}

// Base learning rates per stage.
const POSE_LR: f32 = 0.02;
const SH_LR: f32 = 0.005;
const ALBEDO_LR: f32 = 0.007;
const UNFREEZE_COEFF_LR: f32 = 0.01;
const UNFREEZE_POSE_LR: f32 = 1e-4;
const DIFFUSE_TEX_LR: f32 = 0.005;
const SPECULAR_TEX_LR: f32 = 0.02;
const ROUGHNESS_TEX_LR: f32 = 0.02;

/// Produces the three fixed stage plans.
#[derive(Clone, Debug)]
pub struct StageScheduler {
    params: ScheduleParams,
}

impl StageScheduler {
    pub fn new(params: ScheduleParams) -> Self {
        Self { params }
    }

    pub fn plan(&self, stage: FitStage) -> StagePlan {
        match stage {
            FitStage::Pose => {
                let mut fields = vec![
                    (ParamField::Rotation, POSE_LR),
                    (ParamField::Translation, POSE_LR),
                    (ParamField::Expression, POSE_LR),
                ];
                if self.params.optimize_focal {
                    fields.push((ParamField::Focal, POSE_LR));
                }
                StagePlan {
                    stage,
                    fields,
                    iterations: self.params.pose_iterations,
                    events: Vec::new(),
                }
            }
            FitStage::Appearance => StagePlan {
                stage,
                fields: vec![
                    (ParamField::SphericalHarmonics, SH_LR),
                    (ParamField::Albedo, ALBEDO_LR),
                ],
                iterations: self.params.appearance_iterations,
                // Geometry joins late, at reduced rates, once illumination and
                // albedo have settled enough for photometric gradients to be
                // trustworthy.
                events: vec![
                    ScheduleEvent {
                        at_iteration: self.params.unfreeze_iteration,
                        field: ParamField::Shape,
                        learning_rate: UNFREEZE_COEFF_LR,
                    },
                    ScheduleEvent {
                        at_iteration: self.params.unfreeze_iteration,
                        field: ParamField::Expression,
                        learning_rate: UNFREEZE_COEFF_LR,
                    },
                    ScheduleEvent {
                        at_iteration: self.params.unfreeze_iteration,
                        field: ParamField::Rotation,
                        learning_rate: UNFREEZE_POSE_LR,
                    },
                    ScheduleEvent {
                        at_iteration: self.params.unfreeze_iteration,
                        field: ParamField::Translation,
                        learning_rate: UNFREEZE_POSE_LR,
                    },
                ],
            },
            FitStage::Texture => StagePlan {
                stage,
                fields: vec![
                    (ParamField::DiffuseTexture, DIFFUSE_TEX_LR),
                    (ParamField::SpecularTexture, SPECULAR_TEX_LR),
                    (ParamField::RoughnessTexture, ROUGHNESS_TEX_LR),
                ],
                iterations: self.params.texture_iterations,
                events: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pose_stage_excludes_identity_blocks() {
        let plan = StageScheduler::new(ScheduleParams::default()).plan(FitStage::Pose);
        assert!(plan.is_active(ParamField::Rotation, 0));
        assert!(plan.is_active(ParamField::Expression, 0));
        assert!(!plan.is_active(ParamField::Shape, plan.iterations - 1));
        assert!(!plan.is_active(ParamField::Albedo, 0));
    }

    #[test]
    fn focal_length_joins_only_when_requested() {
        let mut params = ScheduleParams::default();
        assert!(!StageScheduler::new(params.clone())
            .plan(FitStage::Pose)
            .is_active(ParamField::Focal, 0));
        params.optimize_focal = true;
        assert!(StageScheduler::new(params)
            .plan(FitStage::Pose)
            .is_active(ParamField::Focal, 0));
    }

    #[test]
    fn appearance_stage_promotes_geometry_at_the_threshold() {
        let plan = StageScheduler::new(ScheduleParams::default()).plan(FitStage::Appearance);
        assert!(plan.is_active(ParamField::Albedo, 0));
        assert!(plan.is_active(ParamField::SphericalHarmonics, 0));
        for field in [
            ParamField::Shape,
            ParamField::Expression,
            ParamField::Rotation,
            ParamField::Translation,
        ] {
            assert!(!plan.is_active(field, 99), "{} active early", field.name());
            assert!(plan.is_active(field, 100), "{} missing late", field.name());
        }
    }

    #[test]
    fn texture_stage_freezes_everything_but_the_maps() {
        let plan = StageScheduler::new(ScheduleParams::default()).plan(FitStage::Texture);
        assert!(plan.events.is_empty());
        assert!(plan.is_active(ParamField::DiffuseTexture, 0));
        assert!(!plan.is_active(ParamField::Rotation, 0));
        assert!(!plan.is_active(ParamField::SphericalHarmonics, 0));
    }
}
