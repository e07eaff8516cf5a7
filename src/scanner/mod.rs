//! Derivative scanner for individual-level output directories.
//!
//! Walks `<output_directory>/<pipeline_id>/<subject_id>/<resource>/...` and
//! builds a [`SubjectInfo`] record for every NIfTI image of a resource.

use crate::models::SubjectInfo;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Image extensions recognized as derivatives.
const NIFTI_EXTENSIONS: [&str; 2] = [".nii.gz", ".nii"];

/// Scanner for one individual-level pipeline.
#[derive(Debug, Clone)]
pub struct DerivativeScanner {
    pipeline_id: String,
    pipeline_root: PathBuf,
}

impl DerivativeScanner {
    /// Create a scanner for `<output_directory>/<pipeline_id>`.
    pub fn new(output_directory: &Path, pipeline_id: &str) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            pipeline_root: output_directory.join(pipeline_id),
        }
    }

    /// Collect the derivatives of `resource` for every subject, sorted by path.
    pub fn scan(&self, resource: &str) -> Result<Vec<SubjectInfo>> {
        if !self.pipeline_root.is_dir() {
            return Err(anyhow::anyhow!(
                "Pipeline output directory not found: {}",
                self.pipeline_root.display()
            ));
        }

        let mut infos = Vec::new();
        let walker = WalkDir::new(&self.pipeline_root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e.file_name().to_string_lossy().as_ref()));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Cannot read {}: {}", self.pipeline_root.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_nifti(entry.path()) {
                continue;
            }
            if let Some(info) = self.describe(entry.path(), resource) {
                infos.push(info);
            }
        }

        debug!(
            "Found {} {} derivative(s) under {}",
            infos.len(),
            resource,
            self.pipeline_root.display()
        );
        Ok(infos)
    }

    /// Subject record for `path` when it lies in the `resource` directory.
    fn describe(&self, path: &Path, resource: &str) -> Option<SubjectInfo> {
        let relative = path.strip_prefix(&self.pipeline_root).ok()?;
        let parts: Vec<String> = relative
            .iter()
            .map(|c| c.to_string_lossy().into_owned())
            .collect();

        match parts.as_slice() {
            [subject, derivative, .., _file] if derivative == resource => Some(SubjectInfo {
                pipeline_id: self.pipeline_id.clone(),
                subject_id: subject.clone(),
                scan_id: parts
                    .iter()
                    .find(|p| p.starts_with("_scan_"))
                    .cloned()
                    .unwrap_or_default(),
                path: path.to_path_buf(),
            }),
            _ => None,
        }
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn is_nifti(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    NIFTI_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}
