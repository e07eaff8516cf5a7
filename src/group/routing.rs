//! Placement of group outputs in the results tree.
//!
//! Artifacts are copied to `<out_dir>/<category>/<scaffold>/<file>` and the
//! destination is then collapsed by a fixed substitution table, so every
//! artifact lands directly under its category directory.

use crate::models::RoutedOutput;
use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Named centrality variants, in match priority.
pub const CENTRALITY_VARIANTS: [&str; 6] = [
    "degree_centrality_binarize",
    "degree_centrality_weighted",
    "eigenvector_centrality_binarize",
    "eigenvector_centrality_weighted",
    "lfcd_binarize",
    "lfcd_weighted",
];

/// How a resource's extra output subdirectory is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubdirRule {
    /// `ROI_number_<n>` from the derivative file name.
    RoiNumber,
    /// The centrality variant contained in the derivative file name.
    CentralityVariant,
    /// The leading `<word><#><digits>` token of the derivative file name.
    MapIndex,
}

/// A rule applies when the resource name contains `pattern`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    pub pattern: &'static str,
    pub rule: SubdirRule,
}

pub fn default_routing_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule {
            pattern: "sca_roi",
            rule: SubdirRule::RoiNumber,
        },
        RoutingRule {
            pattern: "centrality",
            rule: SubdirRule::CentralityVariant,
        },
        RoutingRule {
            pattern: "tempreg_maps_z_files",
            rule: SubdirRule::MapIndex,
        },
    ]
}

/// File name with up to two extensions removed (`a_1.nii.gz` -> `a_1`).
fn strip_two_extensions(path: &Path) -> String {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for _ in 0..2 {
        match name.rfind('.') {
            Some(dot) if dot > 0 => name.truncate(dot),
            _ => break,
        }
    }
    name
}

impl SubdirRule {
    fn subdir(&self, derivative: &Path) -> Result<Option<String>> {
        match self {
            SubdirRule::RoiNumber => {
                let re = Regex::new(r"ROI_number_(\d)+")?;
                Ok(re
                    .find(&strip_two_extensions(derivative))
                    .map(|m| m.as_str().to_string()))
            }
            SubdirRule::CentralityVariant => {
                let text = derivative
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Ok(CENTRALITY_VARIANTS
                    .iter()
                    .find(|v| text.contains(*v))
                    .map(|v| v.to_string()))
            }
            SubdirRule::MapIndex => {
                let re = Regex::new(r"\w*[#]*\d+")?;
                Ok(re
                    .find(&strip_two_extensions(derivative))
                    .map(|m| m.as_str().to_string()))
            }
        }
    }
}

/// Extra subdirectories for `resource`, all matching rules in order.
pub fn resource_subdirs(rules: &[RoutingRule], resource: &str, derivative: &Path) -> Result<Vec<String>> {
    let mut subdirs = Vec::new();
    for rule in rules.iter().filter(|r| resource.contains(r.pattern)) {
        match rule.rule.subdir(derivative)? {
            Some(dir) => subdirs.push(dir),
            None => warn!(
                "No {:?} subdirectory found in {} for {}",
                rule.rule,
                derivative.display(),
                resource
            ),
        }
    }
    Ok(subdirs)
}

/// The collapsing substitution table applied to every destination.
pub struct PathRewriter {
    rules: Vec<(Regex, &'static str)>,
}

impl PathRewriter {
    pub fn new() -> Result<Self, regex::Error> {
        let table: [(&str, &str); 9] = [
            (r"(rendered).*/", "${1}/"),
            (r"(model_files).*/", "${1}/"),
            (r"(merged).*/", "${1}/"),
            (r"(stats/clusterMap).*/", "${1}/"),
            (r"(stats/unthreshold).*/", "${1}/"),
            (r"(stats/threshold).*/", "${1}/"),
            (r"_cluster.*/", ""),
            (r"_slicer.*/", ""),
            (r"_overlay.*/", ""),
        ];

        let mut rules = Vec::with_capacity(table.len());
        for (pattern, replacement) in table {
            rules.push((Regex::new(pattern)?, replacement));
        }
        Ok(Self { rules })
    }

    pub fn rewrite(&self, path: &str) -> String {
        self.rules
            .iter()
            .fold(path.to_string(), |acc, (re, replacement)| {
                re.replace_all(&acc, *replacement).into_owned()
            })
    }
}

/// Copies artifacts into a results directory.
pub struct Sink {
    base: PathBuf,
    rewriter: PathRewriter,
    dry_run: bool,
}

impl Sink {
    pub fn new(base: PathBuf, dry_run: bool) -> Result<Self> {
        Ok(Self {
            base,
            rewriter: PathRewriter::new()?,
            dry_run,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Where an artifact written under `scaffold` ends up for `category`.
    pub fn destination(&self, category: &str, scaffold: &Path, source: &Path) -> PathBuf {
        let mut dest = self.base.join(category).join(scaffold);
        if let Some(name) = source.file_name() {
            dest.push(name);
        }
        PathBuf::from(self.rewriter.rewrite(&dest.to_string_lossy()))
    }

    /// Copy one artifact (skipped in dry runs).
    pub fn deliver(&self, category: &str, scaffold: &Path, source: &Path) -> Result<RoutedOutput> {
        let destination = self.destination(category, scaffold, source);

        if !self.dry_run && source != destination {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::copy(source, &destination).with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    source.display(),
                    destination.display()
                )
            })?;
        }
        debug!("{} -> {}", source.display(), destination.display());

        Ok(RoutedOutput {
            category: category.to_string(),
            source: source.to_path_buf(),
            destination,
        })
    }
}

/// Results category for each statistics output name.
pub const STATS_DESTINATIONS: [(&str, &str); 14] = [
    ("merged", "merged"),
    ("zstats", "stats/unthreshold"),
    ("zfstats", "stats/unthreshold"),
    ("fstats", "stats/unthreshold"),
    ("cluster_threshold", "stats/threshold"),
    ("cluster_threshold_zf", "stats/threshold"),
    ("cluster_index", "stats/clusterMap"),
    ("cluster_index_zf", "stats/clusterMap"),
    ("cluster_localmax_txt", "stats/clusterMap"),
    ("cluster_localmax_txt_zf", "stats/clusterMap"),
    ("overlay_threshold", "rendered"),
    ("overlay_threshold_zf", "rendered"),
    ("rendered_image", "rendered"),
    ("rendered_image_zf", "rendered"),
];

/// Category for model design files.
pub const MODEL_FILES_CATEGORY: &str = "model_files";
