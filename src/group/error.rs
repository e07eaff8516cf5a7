//! Fatal group-analysis errors.

use crate::exec::ExecError;
use std::path::PathBuf;
use thiserror::Error;

/// Everything that stops a group run.
#[derive(Debug, Error)]
pub enum GroupError {
    #[error(
        "the group analysis subject list is not in the format for repeated measures \
         (entry '{entry}' has no comma). Use one 'subject,scan' or 'subject,session,scan' \
         group per line, or turn off repeated measures in the group configuration. \
         A properly formatted list (subject_list_group_analysis_repeated_measures.txt) \
         is generated alongside the individual-level subject list."
    )]
    ExpectedRepeatedMeasures { entry: String },

    #[error(
        "the group analysis subject list looks formatted for repeated measures \
         (entry '{entry}' contains a comma), but repeated measures is not enabled \
         in the group configuration"
    )]
    UnexpectedRepeatedMeasures { entry: String },

    #[error(
        "none of the subjects in the group analysis subject list have outputs for \
         '{resource}' from individual-level analysis. Make sure the subject list \
         matches the subjects of the individual-level run."
    )]
    NoDerivatives { resource: String },

    #[error(
        "could not open the motion parameter file {}. When motion statistics are \
         generated it is written to the individual-level output directory.",
        path.display()
    )]
    MissingParameterFile { path: PathBuf },

    #[error(
        "the measure {measure} is in the design formula, but motion statistics were \
         not generated during individual-level analysis (or their parameter file is missing)"
    )]
    MeasureNotComputed { measure: String },

    #[error("cannot derive {what} from {}", path.display())]
    PathLayout { what: &'static str, path: PathBuf },

    #[error("{step} failed for output {output}: {source}")]
    Tool {
        step: &'static str,
        output: String,
        #[source]
        source: ExecError,
    },
}
