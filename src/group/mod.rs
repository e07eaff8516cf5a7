//! Group-level analysis of individual-level derivatives.
//!
//! A group run filters the derivatives of one resource down to the subjects
//! in the group subject list, merges them into a 4D image, computes a group
//! mask and per-subject means, builds the design files, runs FLAME with
//! cluster thresholding, and routes the results into the group output tree.

pub mod driver;
pub mod error;
pub mod layout;
pub mod model;
pub mod routing;
pub mod stats;
pub mod sublist;

pub use driver::run_group_analysis;
pub use error::GroupError;
