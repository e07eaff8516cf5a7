//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::preproc::SkullStripMethod;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// neuroflow - fMRI preprocessing and group analysis on AFNI/FSL
///
/// Chains AFNI and FSL command-line tools into functional preprocessing,
/// fieldmap distortion correction, and second-level group analysis.
///
/// Examples:
///   neuroflow preproc --rest sub001/func/rest.nii.gz --start-idx 4
///   neuroflow distcorr --anat anat.nii.gz --func rest.nii.gz --fmap-phase pha.nii.gz --fmap-mag mag.nii.gz
///   neuroflow group --group-config group.yml --resource alff_to_standard_smooth --subject-infos infos.json
///   neuroflow group --group-config group.yml --resource falff_to_standard --scan pipeline_01
///   neuroflow init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    ///
    /// If not specified, looks for .neuroflow.toml in the current directory
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log every external command instead of running it
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Number of independent runs (or masked averages) executed at once
    #[arg(long, value_name = "NUM", global = true, env = "NEUROFLOW_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Working directory for intermediate files
    ///
    /// Overrides pipeline.working_directory from the config file.
    #[arg(long, value_name = "DIR", global = true)]
    pub work_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Functional preprocessing of one or more raw 4D runs
    Preproc(PreprocArgs),

    /// Fieldmap-based EPI distortion correction
    Distcorr(DistCorrArgs),

    /// Group-level analysis of one derivative
    Group(GroupArgs),

    /// Generate a default .neuroflow.toml configuration file
    InitConfig,
}

#[derive(clap::Args, Debug, Clone)]
pub struct PreprocArgs {
    /// Raw functional run(s)
    #[arg(long, value_name = "FILE", required = true, num_args = 1..)]
    pub rest: Vec<PathBuf>,

    /// First volume to keep (defaults to 0)
    #[arg(long, value_name = "IDX", allow_hyphen_values = true)]
    pub start_idx: Option<i64>,

    /// Last volume to keep (defaults to the last volume)
    #[arg(long, value_name = "IDX", allow_hyphen_values = true)]
    pub stop_idx: Option<i64>,

    /// Write the resolved output paths as JSON to this file
    #[arg(long, value_name = "FILE")]
    pub outputs_json: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DistCorrArgs {
    /// Anatomical (T1) image
    #[arg(long, value_name = "FILE")]
    pub anat: PathBuf,

    /// Functional EPI run
    #[arg(long, value_name = "FILE")]
    pub func: PathBuf,

    /// Fieldmap phase difference image
    #[arg(long, value_name = "FILE")]
    pub fmap_phase: PathBuf,

    /// Fieldmap magnitude image
    #[arg(long, value_name = "FILE")]
    pub fmap_mag: PathBuf,

    /// Echo time difference in ms
    #[arg(long)]
    pub delta_te: Option<f64>,

    /// EPI dwell time (echo spacing) in seconds
    #[arg(long)]
    pub dwell_time: Option<f64>,

    /// Dwell to asymmetric echo time ratio
    #[arg(long)]
    pub dwell_asym_ratio: Option<f64>,

    /// Fractional intensity threshold for skull stripping (0.0 - 1.0)
    #[arg(long)]
    pub bet_frac: Option<f64>,

    /// Skull stripping tool for the magnitude image
    #[arg(long, value_name = "METHOD")]
    pub skullstrip: Option<SkullStripMethod>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct GroupArgs {
    /// Group analysis configuration (YAML or TOML)
    #[arg(long, value_name = "FILE")]
    pub group_config: PathBuf,

    /// Derivative (resource) name to analyze
    #[arg(long, value_name = "NAME")]
    pub resource: String,

    /// JSON file listing pipeline_id, subject_id, scan_id and path per derivative
    #[arg(long, value_name = "FILE", conflicts_with = "scan", required_unless_present = "scan")]
    pub subject_infos: Option<PathBuf>,

    /// Discover derivatives by scanning the output directory of this pipeline
    #[arg(long, value_name = "PIPELINE_ID")]
    pub scan: Option<String>,

    /// Report output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Report file (defaults to the model_files directory)
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,
}

/// Output format for the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "md",
            OutputFormat::Json => "json",
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        match &self.command {
            Commands::Preproc(preproc) => {
                for rest in &preproc.rest {
                    if !self.dry_run && !rest.is_file() {
                        return Err(format!("Functional run does not exist: {}", rest.display()));
                    }
                }
            }
            Commands::Distcorr(dc) => {
                if let Some(frac) = dc.bet_frac {
                    if !(0.0..=1.0).contains(&frac) {
                        return Err("BET fraction must be between 0.0 and 1.0".to_string());
                    }
                }
                for (label, path) in [
                    ("Anatomical image", &dc.anat),
                    ("Functional run", &dc.func),
                    ("Fieldmap phase image", &dc.fmap_phase),
                    ("Fieldmap magnitude image", &dc.fmap_mag),
                ] {
                    if !self.dry_run && !path.is_file() {
                        return Err(format!("{} does not exist: {}", label, path.display()));
                    }
                }
            }
            Commands::Group(group) => {
                if !group.group_config.is_file() {
                    return Err(format!(
                        "Group configuration does not exist: {}",
                        group.group_config.display()
                    ));
                }
                if let Some(ref infos) = group.subject_infos {
                    if !infos.is_file() {
                        return Err(format!("Subject info file does not exist: {}", infos.display()));
                    }
                }
                if group.resource.trim().is_empty() {
                    return Err("Resource name must not be empty".to_string());
                }
            }
            Commands::InitConfig => {}
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_args(command: Commands) -> Args {
        Args {
            command,
            config: None,
            verbose: false,
            quiet: false,
            dry_run: false,
            concurrency: None,
            work_dir: None,
        }
    }

    #[test]
    fn test_parse_preproc() {
        let args = Args::try_parse_from([
            "neuroflow", "preproc", "--rest", "a.nii.gz", "b.nii.gz", "--start-idx", "-1", "-v",
        ])
        .unwrap();

        assert!(args.verbose);
        match args.command {
            Commands::Preproc(p) => {
                assert_eq!(p.rest.len(), 2);
                assert_eq!(p.start_idx, Some(-1));
                assert_eq!(p.stop_idx, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_group_requires_source() {
        let result = Args::try_parse_from([
            "neuroflow", "group", "--group-config", "g.yml", "--resource", "alff",
        ]);
        assert!(result.is_err());

        let args = Args::try_parse_from([
            "neuroflow", "group", "--group-config", "g.yml", "--resource", "alff", "--scan", "pipe",
            "--format", "json",
        ])
        .unwrap();
        match args.command {
            Commands::Group(g) => {
                assert_eq!(g.scan.as_deref(), Some("pipe"));
                assert_eq!(g.format, OutputFormat::Json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args(Commands::InitConfig);
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_missing_rest() {
        let args = make_args(Commands::Preproc(PreprocArgs {
            rest: vec![PathBuf::from("/nonexistent/rest.nii.gz")],
            start_idx: None,
            stop_idx: None,
            outputs_json: None,
        }));
        assert!(args.validate().is_err());

        let mut dry = args.clone();
        dry.dry_run = true;
        assert!(dry.validate().is_ok());
    }

    #[test]
    fn test_validation_group_config_exists() {
        let temp = TempDir::new().unwrap();
        let cfg = temp.path().join("group.yml");
        std::fs::write(&cfg, "model_name: m\n").unwrap();

        let args = make_args(Commands::Group(GroupArgs {
            group_config: cfg,
            resource: "alff".to_string(),
            subject_infos: None,
            scan: Some("p".to_string()),
            format: OutputFormat::Markdown,
            report: None,
        }));
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_concurrency() {
        let mut args = make_args(Commands::InitConfig);
        args.concurrency = Some(0);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args(Commands::InitConfig);
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
