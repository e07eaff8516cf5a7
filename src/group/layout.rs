//! Group output, working, and motion-file locations derived from the
//! individual-level output layout
//! `<output_directory>/<pipeline_id>/<subject_id>/<derivative>/...`.

use super::error::GroupError;
use crate::models::SubjectInfo;
use std::path::{Component, Path, PathBuf};

/// Motion measures that can be requested in a design formula.
pub const MOTION_MEASURES: [&str; 3] = ["MeanFD", "MeanFD_Jenkinson", "MeanDVARS"];

/// Name of the derivative directory (e.g. `alff_to_standard_smooth`): the
/// second component of `path` under `pipeline_path`.
pub fn current_output(path: &Path, pipeline_path: &Path) -> Result<String, GroupError> {
    let layout_error = || GroupError::PathLayout {
        what: "the derivative directory name",
        path: path.to_path_buf(),
    };

    let relative = path.strip_prefix(pipeline_path).map_err(|_| layout_error())?;
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .nth(1)
        .ok_or_else(layout_error)
}

/// Group results directory for a model.
///
/// The derivative's directory relative to `<pipeline_id>/` is re-rooted under
/// `group_output_dir`, with the subject ID replaced by
/// `group_analysis_results_<pipeline_id>/_grp_model_<model_name>`.
pub fn group_out_dir(
    first: &SubjectInfo,
    group_output_dir: &Path,
    model_name: &str,
) -> Result<PathBuf, GroupError> {
    let dir = first
        .path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    let marker = format!("{}/", first.pipeline_id);
    let (_, below_pipeline) = dir.split_once(&marker).ok_or_else(|| GroupError::PathLayout {
        what: "the group output directory",
        path: first.path.clone(),
    })?;

    let joined = group_output_dir.join(below_pipeline);
    let results = format!(
        "group_analysis_results_{}/_grp_model_{}",
        first.pipeline_id, model_name
    );

    if first.subject_id.is_empty() {
        return Ok(joined);
    }
    Ok(PathBuf::from(
        joined.to_string_lossy().replace(&first.subject_id, &results),
    ))
}

/// Strategy label: the part of the derivative's directory following the
/// scan ID, with `.` mapped to `_` and `/` to `__`.
pub fn strategy_name(first: &SubjectInfo) -> String {
    let dir = first
        .path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    if first.scan_id.is_empty() {
        return String::new();
    }
    dir.split(first.scan_id.as_str())
        .nth(1)
        .unwrap_or_default()
        .replace('.', "_")
        .replace('/', "__")
}

/// Working directory for one model:
/// `<working>/group_analysis__<resource>__grp_model_<model>__<scan>/<strategy>`.
pub fn group_work_dir(
    working_directory: &Path,
    resource: &str,
    model_name: &str,
    first: &SubjectInfo,
) -> PathBuf {
    let wf_name = format!(
        "group_analysis__{}__grp_model_{}__{}",
        resource, model_name, first.scan_id
    );
    let strategy = strategy_name(first);
    let base = working_directory.join(wf_name);
    if strategy.is_empty() {
        base
    } else {
        base.join(strategy)
    }
}

/// Motion statistics file for a scan:
/// `<output_directory>/<pipeline_id>/<scan stripped of '_'>_threshold_<t>_all_params.csv`.
pub fn parameter_file_path(
    output_directory: &Path,
    pipeline_id: &str,
    scan_id: &str,
    threshold: f64,
) -> PathBuf {
    output_directory.join(pipeline_id).join(format!(
        "{}_threshold_{}_all_params.csv",
        scan_id.trim_matches('_'),
        threshold
    ))
}

/// Motion measures named in the design formula.
pub fn requested_measures(design_formula: &str) -> Vec<&'static str> {
    let terms: Vec<&str> = design_formula
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .collect();
    MOTION_MEASURES
        .iter()
        .copied()
        .filter(|m| terms.contains(m))
        .collect()
}

/// Locate the motion parameter file, failing when the design formula
/// needs motion measures that are unavailable.
pub fn resolve_parameter_file(
    output_directory: &Path,
    first: &SubjectInfo,
    threshold: f64,
    motion_generated: bool,
    design_formula: &str,
) -> Result<Option<PathBuf>, GroupError> {
    let requested = requested_measures(design_formula);

    let path = parameter_file_path(output_directory, &first.pipeline_id, &first.scan_id, threshold);
    let parameter_file = if path.is_file() {
        Some(path)
    } else if motion_generated {
        return Err(GroupError::MissingParameterFile { path });
    } else {
        None
    };

    if parameter_file.is_none() {
        if let Some(measure) = requested.first() {
            return Err(GroupError::MeasureNotComputed {
                measure: measure.to_string(),
            });
        }
    }

    Ok(parameter_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info(path: &str) -> SubjectInfo {
        SubjectInfo {
            pipeline_id: "pipeline_HackettCity".to_string(),
            subject_id: "sub001_session_1".to_string(),
            scan_id: "_scan_rest_1_rest".to_string(),
            path: PathBuf::from(path),
        }
    }

    const DERIVATIVE: &str = "/out/pipeline_HackettCity/sub001_session_1/alff_to_standard_smooth/_scan_rest_1_rest/_csf_threshold_0.96/_fwhm_6/alff_smooth.nii.gz";

    #[test]
    fn test_current_output() {
        let first = info(DERIVATIVE);
        let name = current_output(&first.path, Path::new("/out/pipeline_HackettCity")).unwrap();
        assert_eq!(name, "alff_to_standard_smooth");

        let err = current_output(&first.path, Path::new("/elsewhere")).unwrap_err();
        assert!(matches!(err, GroupError::PathLayout { .. }));
    }

    #[test]
    fn test_group_out_dir() {
        let out = group_out_dir(&info(DERIVATIVE), Path::new("/grp"), "model_age").unwrap();
        assert_eq!(
            out,
            PathBuf::from(
                "/grp/group_analysis_results_pipeline_HackettCity/_grp_model_model_age/alff_to_standard_smooth/_scan_rest_1_rest/_csf_threshold_0.96/_fwhm_6"
            )
        );
    }

    #[test]
    fn test_group_out_dir_requires_pipeline_component() {
        let mut first = info("/out/other/sub001_session_1/alff/a.nii.gz");
        first.pipeline_id = "missing".to_string();
        assert!(group_out_dir(&first, Path::new("/grp"), "m").is_err());
    }

    #[test]
    fn test_strategy_and_work_dir() {
        let first = info(DERIVATIVE);
        assert_eq!(strategy_name(&first), "___csf_threshold_0_96___fwhm_6");

        let work = group_work_dir(Path::new("/work"), "alff", "model_age", &first);
        assert_eq!(
            work,
            PathBuf::from("/work/group_analysis__alff__grp_model_model_age___scan_rest_1_rest/___csf_threshold_0_96___fwhm_6")
        );
    }

    #[test]
    fn test_parameter_file_path() {
        let path = parameter_file_path(Path::new("/out"), "p1", "_scan_rest_1_rest", 0.2);
        assert_eq!(path, PathBuf::from("/out/p1/scan_rest_1_rest_threshold_0.2_all_params.csv"));
    }

    #[test]
    fn test_requested_measures() {
        assert_eq!(requested_measures("Age + MeanFD + Sex"), vec!["MeanFD"]);
        assert_eq!(
            requested_measures("MeanDVARS+MeanFD_Jenkinson"),
            vec!["MeanFD_Jenkinson", "MeanDVARS"]
        );
        assert!(requested_measures("Age + Sex").is_empty());
    }

    #[test]
    fn test_resolve_parameter_file() {
        let temp = TempDir::new().unwrap();
        let mut first = info(DERIVATIVE);
        first.pipeline_id = "p1".to_string();

        // Not generated and not requested: fine.
        assert_eq!(
            resolve_parameter_file(temp.path(), &first, 0.2, false, "Age").unwrap(),
            None
        );

        // Not generated but requested.
        let err = resolve_parameter_file(temp.path(), &first, 0.2, false, "Age + MeanFD").unwrap_err();
        assert!(matches!(err, GroupError::MeasureNotComputed { ref measure } if measure == "MeanFD"));

        // Generated but missing on disk.
        let err = resolve_parameter_file(temp.path(), &first, 0.2, true, "Age").unwrap_err();
        assert!(matches!(err, GroupError::MissingParameterFile { .. }));

        let expected = parameter_file_path(temp.path(), "p1", &first.scan_id, 0.2);
        std::fs::create_dir_all(expected.parent().unwrap()).unwrap();
        std::fs::write(&expected, "Subject,MeanFD\n").unwrap();
        assert_eq!(
            resolve_parameter_file(temp.path(), &first, 0.2, true, "MeanFD").unwrap(),
            Some(expected.clone())
        );
    }

    #[test]
    fn test_resolve_parameter_file_present_without_generation() {
        let temp = TempDir::new().unwrap();
        let mut first = info(DERIVATIVE);
        first.pipeline_id = "p1".to_string();

        let expected = parameter_file_path(temp.path(), "p1", &first.scan_id, 0.2);
        std::fs::create_dir_all(expected.parent().unwrap()).unwrap();
        std::fs::write(&expected, "Subject,MeanFD\n").unwrap();

        assert_eq!(
            resolve_parameter_file(temp.path(), &first, 0.2, false, "Age + MeanFD").unwrap(),
            Some(expected.clone())
        );
        assert_eq!(
            resolve_parameter_file(temp.path(), &first, 0.2, false, "Age").unwrap(),
            Some(expected)
        );
    }
}
