//! neuroflow - fMRI preprocessing and group analysis on AFNI/FSL
//!
//! A CLI tool that chains AFNI and FSL command-line programs into
//! functional preprocessing, fieldmap distortion correction, and
//! second-level group statistics.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Invalid arguments or runtime error (missing inputs, tool failure, etc.)

mod cli;
mod config;
mod exec;
mod group;
mod models;
mod preproc;
mod report;
mod scanner;
mod workflow;

use anyhow::{Context, Result};
use cli::{Args, Commands, DistCorrArgs, GroupArgs, OutputFormat, PreprocArgs};
use config::{Config, GroupConfig, DEFAULT_CONFIG_FILE};
use exec::{CommandRunner, DryRunRunner, ProcessRunner};
use models::SubjectInfo;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if let Commands::InitConfig = args.command {
        return handle_init_config();
    }

    // Load configuration before logging
    let (mut config, source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    // Initialize logging
    init_logging(log_level(&args, &config));

    info!("neuroflow v{}", env!("CARGO_PKG_VERSION"));
    source.log();
    debug!("Arguments: {:?}", args);

    if let Err(e) = run(args, config).await {
        error!("Run failed: {:#}", e);
        eprintln!("\n❌ Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Handle init-config: generate a default .neuroflow.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to set output/working directories, FSLDIR, and tool overrides.");
    Ok(())
}

/// Log level from CLI flags, with `execution.verbose` from the config
/// file enabling debug output unless `--quiet` is given.
fn log_level(args: &Args, config: &Config) -> tracing::Level {
    if !args.quiet && config.execution.verbose {
        tracing::Level::DEBUG
    } else {
        args.log_level()
    }
}

/// Initialize logging at the given level.
fn init_logging(level: tracing::Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Load configuration, pick a runner, and dispatch the subcommand.
async fn run(args: Args, config: Config) -> Result<()> {
    let runner: Box<dyn CommandRunner> = if config.execution.dry_run {
        println!("🔍 Dry run: commands are logged, nothing is executed.");
        Box::new(DryRunRunner)
    } else {
        Box::new(ProcessRunner::with_overrides(config.tools.clone()))
    };
    let show_progress = !args.quiet;

    match &args.command {
        Commands::Preproc(preproc) => run_preproc(runner.as_ref(), &config, preproc, show_progress).await,
        Commands::Distcorr(dc) => run_distcorr(runner.as_ref(), &config, dc).await,
        Commands::Group(group) => run_group(runner.as_ref(), &config, group, show_progress).await,
        Commands::InitConfig => handle_init_config(),
    }
}

/// Preprocess every functional run.
async fn run_preproc(
    runner: &dyn CommandRunner,
    config: &Config,
    args: &PreprocArgs,
    show_progress: bool,
) -> Result<()> {
    let start_time = Instant::now();
    let work_dir = config.pipeline.working_directory.join("func_preproc");

    println!("🧠 Preprocessing {} functional run(s)...", args.rest.len());
    println!("   Working directory: {}", work_dir.display());

    let outputs = preproc::run_func_preproc_all(
        runner,
        &args.rest,
        args.start_idx,
        args.stop_idx,
        &work_dir,
        config.execution.concurrency,
        show_progress,
    )
    .await?;

    for (rest, out) in args.rest.iter().zip(&outputs) {
        println!(
            "   {} -> {} (volumes {}..{})",
            rest.display(),
            out.preprocessed.display(),
            out.window.start,
            out.window.stop
        );
    }

    if let Some(ref path) = args.outputs_json {
        let json = serde_json::to_string_pretty(&outputs)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write outputs to {}", path.display()))?;
        info!("Output paths written to {}", path.display());
    }

    println!(
        "\n✅ Preprocessing complete in {:.1}s",
        start_time.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Run fieldmap distortion correction.
async fn run_distcorr(runner: &dyn CommandRunner, config: &Config, args: &DistCorrArgs) -> Result<()> {
    let work_dir = config.pipeline.working_directory.join("distcorr");
    let inputs = preproc::DistCorrInputs {
        anat_file: args.anat.clone(),
        func_file: args.func.clone(),
        fmap_pha: args.fmap_phase.clone(),
        fmap_mag: args.fmap_mag.clone(),
    };

    println!("🧲 Distortion correction of {}", args.func.display());
    println!(
        "   deltaTE {} ms, dwell time {} s, asym ratio {}, skull strip {:?}",
        config.distcorr.delta_te,
        config.distcorr.dwell_time,
        config.distcorr.dwell_asym_ratio,
        config.distcorr.skullstrip
    );

    let outputs = preproc::run_distcorr(runner, &inputs, config.distcorr, &work_dir).await?;

    println!("\n✅ Unwarped EPI: {}", outputs.epireg.display());
    println!("   Fieldmap: {}", outputs.fmap_despiked.display());
    Ok(())
}

/// Run the group model for one resource and write the run report.
async fn run_group(
    runner: &dyn CommandRunner,
    config: &Config,
    args: &GroupArgs,
    show_progress: bool,
) -> Result<()> {
    let mut group_config = GroupConfig::load(&args.group_config)?;

    let infos = match (&args.subject_infos, &args.scan) {
        (Some(path), _) => SubjectInfo::load_all(path)?,
        (None, Some(pipeline_id)) => {
            println!(
                "📂 Scanning {} for {} derivatives...",
                config.pipeline.output_directory.join(pipeline_id).display(),
                args.resource
            );
            scanner::DerivativeScanner::new(&config.pipeline.output_directory, pipeline_id)
                .scan(&args.resource)?
        }
        (None, None) => anyhow::bail!("Either --subject-infos or --scan is required"),
    };

    if infos.is_empty() {
        warn!("No derivative files given for {}", args.resource);
    }

    println!(
        "📊 Group analysis: {} with model {} ({} derivative file(s))",
        args.resource,
        group_config.model_name,
        infos.len()
    );

    let report = group::run_group_analysis(
        runner,
        config,
        &mut group_config,
        &args.resource,
        &infos,
        show_progress,
    )
    .await?;

    let report_path = args.report.clone().unwrap_or_else(|| {
        report
            .output_dir
            .join("model_files")
            .join(format!("group_analysis_report.{}", args.format.extension()))
    });
    report::write_report(&report, &report_path, args.format == OutputFormat::Json)
        .with_context(|| format!("Failed to write report to {}", report_path.display()))?;

    println!("\n📊 Group Summary:");
    println!(
        "   Subjects: {} included, {} missing",
        report.subjects.kept.len(),
        report.subjects.missing.len()
    );
    println!("   Outputs: {}", report.outputs.len());
    println!("   Duration: {:.1}s", report.metadata.duration_seconds);
    println!("   Results: {}", report.output_dir.display());
    println!("\n✅ Group analysis complete! Report saved to: {}", report_path.display());

    Ok(())
}

/// Where the configuration came from, logged once logging is up.
enum ConfigSource {
    Explicit(PathBuf),
    DefaultFile,
    BuiltIn,
    Fallback(String),
}

impl ConfigSource {
    fn log(&self) {
        match self {
            ConfigSource::Explicit(path) => info!("Loaded config from: {}", path.display()),
            ConfigSource::DefaultFile => info!("Loaded default config from {}", DEFAULT_CONFIG_FILE),
            ConfigSource::BuiltIn => debug!("No config file found, using defaults"),
            ConfigSource::Fallback(e) => warn!("Failed to load config: {}", e),
        }
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<(Config, ConfigSource)> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)?;
        return Ok((config, ConfigSource::Explicit(config_path.clone())));
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok((config, ConfigSource::DefaultFile)),
        Ok(None) => Ok((Config::default(), ConfigSource::BuiltIn)),
        Err(e) => Ok((Config::default(), ConfigSource::Fallback(format!("{:#}", e)))),
    }
}
