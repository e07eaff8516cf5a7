//! Data models shared across the pipeline.
//!
//! This module contains the per-derivative subject records consumed by the
//! group driver and the structures that make up a group run report.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One individual-level derivative file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SubjectInfoRepr")]
pub struct SubjectInfo {
    /// Individual-level pipeline (output folder) the derivative came from.
    pub pipeline_id: String,
    pub subject_id: String,
    pub scan_id: String,
    /// Path to the derivative image.
    pub path: PathBuf,
}

/// Accepted on-disk shapes: an object with named fields, or a
/// `[pipeline_id, subject_id, scan_id, path]` tuple.
#[derive(Deserialize)]
#[serde(untagged)]
enum SubjectInfoRepr {
    Named {
        pipeline_id: String,
        subject_id: String,
        scan_id: String,
        path: PathBuf,
    },
    Tuple(String, String, String, PathBuf),
}

impl From<SubjectInfoRepr> for SubjectInfo {
    fn from(repr: SubjectInfoRepr) -> Self {
        match repr {
            SubjectInfoRepr::Named {
                pipeline_id,
                subject_id,
                scan_id,
                path,
            }
            | SubjectInfoRepr::Tuple(pipeline_id, subject_id, scan_id, path) => Self {
                pipeline_id,
                subject_id,
                scan_id,
                path,
            },
        }
    }
}

impl SubjectInfo {
    /// Load subject records from a JSON array.
    pub fn load_all(path: &Path) -> Result<Vec<Self>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read subject info file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse subject info file: {}", path.display()))
    }
}

/// Metadata about a group run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub resource: String,
    pub pipeline_id: String,
    pub model_name: String,
    /// Name of the derivative directory (e.g. `alff_to_standard_smooth`).
    pub current_output: String,
    pub analysis_date: DateTime<Utc>,
    pub duration_seconds: f64,
    pub dry_run: bool,
}

/// Which subject-list entries survived filtering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubjectSummary {
    /// Entries read from the group subject list.
    pub listed: Vec<String>,
    /// Entries with at least one derivative, in list order.
    pub kept: Vec<String>,
    /// Entries without any derivative.
    pub missing: Vec<String>,
}

impl SubjectSummary {
    pub fn new(listed: Vec<String>, kept: Vec<String>) -> Self {
        let missing = listed
            .iter()
            .filter(|s| !kept.contains(s))
            .cloned()
            .collect();
        Self {
            listed,
            kept,
            missing,
        }
    }
}

/// A file copied into the group results tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedOutput {
    /// Results subdirectory category (`merged`, `stats/threshold`, ...).
    pub category: String,
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// The complete report of one group run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRunReport {
    pub metadata: RunMetadata,
    pub subjects: SubjectSummary,
    /// Derivatives merged into the 4D file, in merge order.
    pub derivative_paths: Vec<PathBuf>,
    pub filtered_subject_list: PathBuf,
    pub parameter_file: Option<PathBuf>,
    pub merged_file: PathBuf,
    pub merged_mask: PathBuf,
    /// Masked mean per subject-list entry.
    pub derivative_means: BTreeMap<String, f64>,
    /// Design files from the model builder.
    pub model_files: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub outputs: Vec<RoutedOutput>,
}

impl GroupRunReport {
    /// Routed outputs grouped by category, categories sorted.
    pub fn outputs_by_category(&self) -> BTreeMap<&str, Vec<&RoutedOutput>> {
        let mut grouped: BTreeMap<&str, Vec<&RoutedOutput>> = BTreeMap::new();
        for output in &self.outputs {
            grouped.entry(output.category.as_str()).or_default().push(output);
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_subject_info_both_shapes() {
        let json = r#"[
            {"pipeline_id": "pipeline_01", "subject_id": "sub001", "scan_id": "_scan_rest", "path": "/out/a.nii.gz"},
            ["pipeline_01", "sub002", "_scan_rest", "/out/b.nii.gz"]
        ]"#;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("infos.json");
        std::fs::write(&path, json).unwrap();

        let infos = SubjectInfo::load_all(&path).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].subject_id, "sub001");
        assert_eq!(infos[1].subject_id, "sub002");
        assert_eq!(infos[1].path, PathBuf::from("/out/b.nii.gz"));
    }

    #[test]
    fn test_subject_info_rejects_bad_json() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("infos.json");
        std::fs::write(&path, r#"[["only", "three", "fields"]]"#).unwrap();
        assert!(SubjectInfo::load_all(&path).is_err());
    }

    #[test]
    fn test_subject_summary_missing() {
        let listed = vec!["001".to_string(), "002".to_string(), "003".to_string()];
        let kept = vec!["001".to_string(), "003".to_string()];
        let summary = SubjectSummary::new(listed, kept);
        assert_eq!(summary.missing, vec!["002".to_string()]);
    }

    #[test]
    fn test_outputs_by_category() {
        let out = |category: &str, name: &str| RoutedOutput {
            category: category.to_string(),
            source: PathBuf::from(name),
            destination: PathBuf::from(name),
        };
        let report = GroupRunReport {
            metadata: RunMetadata {
                resource: "alff".to_string(),
                pipeline_id: "p".to_string(),
                model_name: "m".to_string(),
                current_output: "alff".to_string(),
                analysis_date: Utc::now(),
                duration_seconds: 1.0,
                dry_run: false,
            },
            subjects: SubjectSummary::default(),
            derivative_paths: vec![],
            filtered_subject_list: PathBuf::from("s.txt"),
            parameter_file: None,
            merged_file: PathBuf::from("merged.nii.gz"),
            merged_mask: PathBuf::from("mask.nii.gz"),
            derivative_means: BTreeMap::new(),
            model_files: vec![],
            output_dir: PathBuf::from("/g"),
            outputs: vec![
                out("rendered", "a.png"),
                out("merged", "m.nii.gz"),
                out("rendered", "b.png"),
            ],
        };

        let grouped = report.outputs_by_category();
        assert_eq!(grouped.keys().copied().collect::<Vec<_>>(), vec!["merged", "rendered"]);
        assert_eq!(grouped["rendered"].len(), 2);
    }
}
