//! Stage-list execution shared by the preprocessing workflows.

pub mod stage;

pub use stage::{nifti_stem, Binding, PortMap, Stage, StageContext, StageList, StagePlan, WorkflowError};
