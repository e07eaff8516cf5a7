//! Configuration file handling.
//!
//! Two files drive a run: the pipeline configuration (`.neuroflow.toml`),
//! which describes where individual-level outputs live and how tools are
//! executed, and the group-analysis configuration (YAML or TOML), which
//! describes one statistical model.

use crate::preproc::DistCorrParams;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default pipeline configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = ".neuroflow.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Individual-level pipeline layout.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Execution settings.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Second-level statistics settings.
    #[serde(default)]
    pub stats: StatsConfig,

    /// Fieldmap acquisition defaults for distortion correction.
    #[serde(default)]
    pub distcorr: DistCorrParams,

    /// Tool name -> program overrides (e.g. a container wrapper script).
    #[serde(default)]
    pub tools: HashMap<String, String>,
}

/// Layout of the individual-level pipeline outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of individual-level outputs (`<root>/<pipeline_id>/<subject>/...`).
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,

    /// Scratch space for workflow stages.
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,

    /// Where crash details are written.
    #[serde(default = "default_crash_log_directory")]
    pub crash_log_directory: PathBuf,

    /// FSL installation root (`$FSLDIR`).
    #[serde(default = "default_fsl_dir")]
    pub fsl_dir: PathBuf,

    /// Whether motion statistics were generated during individual-level runs.
    #[serde(default = "default_true")]
    pub generate_motion_statistics: bool,

    /// Framewise-displacement threshold used in the motion parameter file name.
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_directory: default_output_directory(),
            working_directory: default_working_directory(),
            crash_log_directory: default_crash_log_directory(),
            fsl_dir: default_fsl_dir(),
            generate_motion_statistics: true,
            motion_threshold: default_motion_threshold(),
        }
    }
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("output")
}

fn default_working_directory() -> PathBuf {
    PathBuf::from("working")
}

fn default_crash_log_directory() -> PathBuf {
    PathBuf::from("crash")
}

fn default_fsl_dir() -> PathBuf {
    std::env::var_os("FSLDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/usr/share/fsl"))
}

fn default_true() -> bool {
    true
}

fn default_motion_threshold() -> f64 {
    0.2
}

/// Execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Concurrent runs (preprocessing) or masked averages (group).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Log commands instead of running them.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            verbose: false,
            dry_run: false,
        }
    }
}

fn default_concurrency() -> usize {
    4
}

/// Second-level statistics settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Program that turns phenotype data and derivative means into
    /// `.mat`/`.con`/`.grp`/`.fts` design files.
    #[serde(default = "default_model_builder")]
    pub model_builder: String,

    /// Background image for rendered overlays. Defaults to the 2mm MNI152
    /// brain under `fsl_dir`.
    #[serde(default)]
    pub background_image: Option<PathBuf>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            model_builder: default_model_builder(),
            background_image: None,
        }
    }
}

fn default_model_builder() -> String {
    "cpac_create_fsl_model".to_string()
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(concurrency) = args.concurrency {
            self.execution.concurrency = concurrency;
        }
        if let Some(ref work_dir) = args.work_dir {
            self.pipeline.working_directory = work_dir.clone();
        }

        // Flags always override
        if args.verbose {
            self.execution.verbose = true;
        }
        if args.dry_run {
            self.execution.dry_run = true;
        }

        if let crate::cli::Commands::Distcorr(ref dc) = args.command {
            if let Some(v) = dc.delta_te {
                self.distcorr.delta_te = v;
            }
            if let Some(v) = dc.dwell_time {
                self.distcorr.dwell_time = v;
            }
            if let Some(v) = dc.dwell_asym_ratio {
                self.distcorr.dwell_asym_ratio = v;
            }
            if let Some(v) = dc.bet_frac {
                self.distcorr.bet_frac = v;
            }
            if let Some(method) = dc.skullstrip {
                self.distcorr.skullstrip = method;
            }
        }
    }

    /// Overlay background image for rendered statistics.
    pub fn background_image(&self) -> PathBuf {
        self.stats.background_image.clone().unwrap_or_else(|| {
            self.pipeline
                .fsl_dir
                .join("data/standard/MNI152_T1_2mm_brain.nii.gz")
        })
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Group-analysis model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Subject list, one ID (or comma-joined ID group) per line.
    pub subject_list: PathBuf,

    /// Root for group results.
    #[serde(default = "default_group_output_dir")]
    pub output_dir: PathBuf,

    /// Model name used in output directory names.
    pub model_name: String,

    /// Design formula handed to the model builder.
    #[serde(default)]
    pub design_formula: String,

    /// Phenotype CSV handed to the model builder.
    #[serde(default)]
    pub pheno_file: Option<PathBuf>,

    /// Column of the phenotype file holding subject IDs.
    #[serde(default = "default_subject_id_label")]
    pub subject_id_label: String,

    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,

    #[serde(default = "default_p_threshold")]
    pub p_threshold: f64,

    /// Subject list entries are `subject,scan[,session]` groups.
    #[serde(default)]
    pub repeated_measures: bool,

    /// Include F-tests (`.fts`) in the model.
    #[serde(default)]
    pub f_test: bool,
}

fn default_group_output_dir() -> PathBuf {
    PathBuf::from("group_analysis")
}

fn default_subject_id_label() -> String {
    "subject_id".to_string()
}

fn default_z_threshold() -> f64 {
    2.3
}

fn default_p_threshold() -> f64 {
    0.05
}

impl GroupConfig {
    /// Load a group configuration; `.yml`/`.yaml` files are parsed as YAML,
    /// anything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Error in reading {} configuration file", path.display()))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        );

        let config: GroupConfig = if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse group config: {}", path.display()))?
        } else {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse group config: {}", path.display()))?
        };

        Ok(config)
    }

    /// Point the configuration at the filtered subject list.
    pub fn update_subject_list(&mut self, path: PathBuf) {
        self.subject_list = path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.execution.concurrency, 4);
        assert_eq!(config.stats.model_builder, "cpac_create_fsl_model");
        assert!(config.pipeline.generate_motion_statistics);
        assert_eq!(config.distcorr.delta_te, 2.46);
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[pipeline]
output_directory = "/data/out"
working_directory = "/scratch"
fsl_dir = "/opt/fsl"
generate_motion_statistics = false
motion_threshold = 0.5

[execution]
concurrency = 8

[stats]
model_builder = "/opt/cpac/bin/create_fsl_model"

[tools]
flameo = "/opt/fsl/bin/flameo"
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.pipeline.output_directory, PathBuf::from("/data/out"));
        assert!(!config.pipeline.generate_motion_statistics);
        assert_eq!(config.pipeline.motion_threshold, 0.5);
        assert_eq!(config.execution.concurrency, 8);
        assert_eq!(config.tools.get("flameo").unwrap(), "/opt/fsl/bin/flameo");
        assert_eq!(
            config.background_image(),
            PathBuf::from("/opt/fsl/data/standard/MNI152_T1_2mm_brain.nii.gz")
        );
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(!toml_str.is_empty());
        assert!(toml_str.contains("[pipeline]"));
        assert!(toml_str.contains("[execution]"));
        assert!(toml_str.contains("[stats]"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.execution.concurrency, 4);
    }

    #[test]
    fn test_group_config_yaml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("group.yml");
        std::fs::write(
            &path,
            "subject_list: /data/subjects.txt\nmodel_name: model_age\ndesign_formula: Age + MeanFD\nrepeated_measures: true\nz_threshold: 3.1\n",
        )
        .unwrap();

        let config = GroupConfig::load(&path).unwrap();
        assert_eq!(config.model_name, "model_age");
        assert!(config.repeated_measures);
        assert_eq!(config.z_threshold, 3.1);
        assert_eq!(config.p_threshold, 0.05);
        assert_eq!(config.subject_id_label, "subject_id");
    }

    #[test]
    fn test_group_config_toml_and_update() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("group.toml");
        std::fs::write(&path, "subject_list = \"s.txt\"\nmodel_name = \"m\"\n").unwrap();

        let mut config = GroupConfig::load(&path).unwrap();
        assert!(!config.repeated_measures);
        config.update_subject_list(PathBuf::from("/new/s.txt"));
        assert_eq!(config.subject_list, PathBuf::from("/new/s.txt"));
    }

    #[test]
    fn test_group_config_missing_file() {
        let err = GroupConfig::load(Path::new("/nonexistent/group.yml")).unwrap_err();
        assert!(err.to_string().contains("configuration file"));
    }
}
