//! Per-subject preprocessing workflows.

pub mod distcorr;
pub mod func;

pub use distcorr::{run_distcorr, DistCorrInputs, DistCorrOutputs, DistCorrParams, SkullStripMethod};
pub use func::{run_func_preproc_all, FuncPreprocOutputs};
