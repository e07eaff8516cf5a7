//! Group-analysis driver: subject filtering, merge and mask, means, design
//! files, second-level statistics, and output routing for one resource.

use super::error::GroupError;
use super::layout::{current_output, group_out_dir, group_work_dir, resolve_parameter_file};
use super::model::{
    compute_means, mask_command, means_csv, merge_command, model_builder_command, ModelFiles,
    ModelRequest,
};
use super::routing::{default_routing_rules, resource_subdirs, Sink, MODEL_FILES_CATEGORY, STATS_DESTINATIONS};
use super::stats::{run_second_level, StatsInputs};
use super::sublist::{filter_derivatives, parse_subject_list, validate_format, write_subject_list};
use crate::config::{Config, GroupConfig};
use crate::exec::{CommandRunner, ExecError, ToolCommand};
use crate::models::{GroupRunReport, RoutedOutput, RunMetadata, SubjectInfo, SubjectSummary};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

async fn run_step<R>(runner: &R, step: &'static str, output: &str, command: &ToolCommand) -> Result<(), GroupError>
where
    R: CommandRunner + ?Sized,
{
    runner
        .run(command)
        .await
        .map(|_| ())
        .map_err(|source| GroupError::Tool {
            step,
            output: output.to_string(),
            source,
        })
}

/// Individual-level pipeline directory containing `info.path`.
fn pipeline_path(config: &Config, info: &SubjectInfo) -> PathBuf {
    info.path
        .ancestors()
        .find(|a| a.file_name().map_or(false, |n| n == info.pipeline_id.as_str()))
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.pipeline.output_directory.join(&info.pipeline_id))
}

/// Run the group model for `resource` over `infos`.
///
/// `group.subject_list` is pointed at the filtered list on success.
pub async fn run_group_analysis<R>(
    runner: &R,
    config: &Config,
    group: &mut GroupConfig,
    resource: &str,
    infos: &[SubjectInfo],
    show_progress: bool,
) -> Result<GroupRunReport>
where
    R: CommandRunner + ?Sized,
{
    let started = Instant::now();
    let dry_run = runner.is_dry_run();

    info!(
        "Group analysis of {} with model {} ({} derivative file(s))",
        resource,
        group.model_name,
        infos.len()
    );

    let content = std::fs::read_to_string(&group.subject_list).with_context(|| {
        format!(
            "Failed to read group subject list: {}",
            group.subject_list.display()
        )
    })?;
    let entries = parse_subject_list(&content);
    validate_format(&entries, group.repeated_measures)?;

    let candidates: Vec<&SubjectInfo> = infos
        .iter()
        .filter(|info| {
            let present = dry_run || info.path.exists();
            if !present {
                warn!("Derivative does not exist, skipping: {}", info.path.display());
            }
            present
        })
        .collect();
    let candidate_paths: Vec<PathBuf> = candidates.iter().map(|i| i.path.clone()).collect();

    let filtered = filter_derivatives(&entries, &candidate_paths);
    let summary = SubjectSummary::new(entries.clone(), filtered.entries.clone());

    let Some((_, first_path)) = filtered.derivatives.first() else {
        error!(
            "No derivatives for {}: {} subject(s) listed in {}, {} derivative file(s) given",
            resource,
            entries.len(),
            group.subject_list.display(),
            infos.len()
        );
        return Err(GroupError::NoDerivatives {
            resource: resource.to_string(),
        }
        .into());
    };
    let first = candidates
        .iter()
        .find(|info| &info.path == first_path)
        .copied()
        .ok_or_else(|| GroupError::PathLayout {
            what: "the subject record",
            path: first_path.clone(),
        })?;

    if !summary.missing.is_empty() {
        warn!(
            "{} subject(s) have no {} output and are excluded from the group model: {}. \
             Derivatives were searched under {}",
            summary.missing.len(),
            resource,
            summary.missing.join(", "),
            pipeline_path(config, first).display()
        );
    }

    let result = analyze(
        runner,
        config,
        group,
        resource,
        first,
        &filtered.entries,
        &filtered.derivatives,
        show_progress,
    )
    .await;

    let (analysis, subject_list) = match result {
        Ok(done) => done,
        Err(e) => {
            error!(
                "Group analysis of {} failed ({} of {} subject(s) kept, first derivative {}): {:#}",
                resource,
                summary.kept.len(),
                summary.listed.len(),
                first.path.display(),
                e
            );
            write_crash_report(&config.pipeline.crash_log_directory, resource, &summary, &e);
            return Err(e);
        }
    };

    let report = GroupRunReport {
        metadata: RunMetadata {
            resource: resource.to_string(),
            pipeline_id: first.pipeline_id.clone(),
            model_name: group.model_name.clone(),
            current_output: analysis.current_output,
            analysis_date: Utc::now(),
            duration_seconds: started.elapsed().as_secs_f64(),
            dry_run,
        },
        subjects: summary,
        derivative_paths: filtered.paths(),
        filtered_subject_list: subject_list,
        parameter_file: analysis.parameter_file,
        merged_file: analysis.merged,
        merged_mask: analysis.mask,
        derivative_means: analysis.means,
        model_files: analysis.model_files,
        output_dir: analysis.output_dir,
        outputs: analysis.outputs,
    };

    info!(
        "Group analysis of {} finished: {} subject(s), {} output file(s) in {}",
        resource,
        report.subjects.kept.len(),
        report.outputs.len(),
        report.output_dir.display()
    );
    Ok(report)
}

struct Analysis {
    current_output: String,
    parameter_file: Option<PathBuf>,
    merged: PathBuf,
    mask: PathBuf,
    means: std::collections::BTreeMap<String, f64>,
    model_files: Vec<PathBuf>,
    output_dir: PathBuf,
    outputs: Vec<RoutedOutput>,
}

/// Write the failure context of a group run to the crash log directory.
/// Failing to write it only logs a warning.
fn write_crash_report(dir: &Path, resource: &str, summary: &SubjectSummary, err: &anyhow::Error) {
    let path = dir.join(format!(
        "group_{}_{}.log",
        resource,
        Utc::now().format("%Y%m%dT%H%M%S")
    ));
    let content = format!(
        "resource: {}\nkept: {}\nmissing: {}\nerror: {:#}\n",
        resource,
        summary.kept.join(" "),
        summary.missing.join(" "),
        err
    );

    let written = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, content));
    match written {
        Ok(()) => info!("Crash details written to {}", path.display()),
        Err(e) => warn!("Could not write crash details to {}: {}", path.display(), e),
    }
}

#[allow(clippy::too_many_arguments)]
async fn analyze<R>(
    runner: &R,
    config: &Config,
    group: &mut GroupConfig,
    resource: &str,
    first: &SubjectInfo,
    kept: &[String],
    derivatives: &[(String, PathBuf)],
    show_progress: bool,
) -> Result<(Analysis, PathBuf)>
where
    R: CommandRunner + ?Sized,
{
    let dry_run = runner.is_dry_run();

    let base_dir = group_out_dir(first, &group.output_dir, &group.model_name)?;
    let model_dir = base_dir.join("model_files");
    std::fs::create_dir_all(&model_dir)
        .with_context(|| format!("Failed to create {}", model_dir.display()))?;

    let list_name = group
        .subject_list
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "subject_list.txt".into());
    let subject_list = model_dir.join(list_name);
    write_subject_list(&subject_list, kept)
        .with_context(|| format!("Failed to write {}", subject_list.display()))?;
    group.update_subject_list(subject_list.clone());

    let output_name = current_output(&first.path, &pipeline_path(config, first))?;

    let parameter_file = match resolve_parameter_file(
        &config.pipeline.output_directory,
        first,
        config.pipeline.motion_threshold,
        config.pipeline.generate_motion_statistics,
        &group.design_formula,
    ) {
        Ok(found) => found,
        Err(GroupError::MissingParameterFile { path }) if dry_run => {
            warn!("[dry-run] motion parameter file not found: {}", path.display());
            Some(path)
        }
        Err(e) => return Err(e.into()),
    };

    let merged = model_dir.join(format!("{}_merged.nii.gz", output_name));
    let mask = model_dir.join(format!("{}_merged_mask.nii.gz", output_name));
    let paths: Vec<PathBuf> = derivatives.iter().map(|(_, p)| p.clone()).collect();

    info!("Merging {} derivative(s) into {}", paths.len(), merged.display());
    run_step(runner, "fslmerge", &output_name, &merge_command(&merged, &paths)).await?;
    run_step(runner, "fslmaths", &output_name, &mask_command(&merged, &mask)).await?;

    let means = compute_means(
        runner,
        &mask,
        derivatives,
        config.execution.concurrency,
        dry_run,
        show_progress,
    )
    .await
    .map_err(|source: ExecError| GroupError::Tool {
        step: "3dmaskave",
        output: output_name.clone(),
        source,
    })?;

    let means_file = model_dir.join(format!("{}_means.csv", output_name));
    std::fs::write(
        &means_file,
        means_csv(&group.subject_id_label, &output_name, &means),
    )
    .with_context(|| format!("Failed to write {}", means_file.display()))?;

    let files = ModelFiles::new(&model_dir, &group.model_name, group.f_test);
    let request = ModelRequest {
        builder: &config.stats.model_builder,
        pheno_file: group.pheno_file.as_deref(),
        subject_list: &subject_list,
        subject_id_label: &group.subject_id_label,
        design_formula: &group.design_formula,
        means_file: &means_file,
        parameter_file: parameter_file.as_deref(),
        model_name: &group.model_name,
        output_dir: &model_dir,
        files: &files,
    };
    run_step(runner, "model builder", &output_name, &model_builder_command(&request)).await?;

    let work_dir = group_work_dir(
        &config.pipeline.working_directory,
        resource,
        &group.model_name,
        first,
    );
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("Failed to create {}", work_dir.display()))?;

    let background = config.background_image();
    let inputs = StatsInputs {
        merged: &merged,
        mask: &mask,
        model: &files,
        z_threshold: group.z_threshold,
        p_threshold: group.p_threshold,
        background: &background,
    };
    let stats = run_second_level(runner, &inputs, &work_dir)
        .await
        .with_context(|| format!("Second-level statistics failed for {}", output_name))?;

    let mut out_dir = base_dir;
    for subdir in resource_subdirs(&default_routing_rules(), resource, &first.path)? {
        out_dir.push(subdir);
    }
    let sink = Sink::new(out_dir, dry_run)?;
    let mut outputs = Vec::new();
    for file in files.all() {
        outputs.push(sink.deliver(MODEL_FILES_CATEGORY, Path::new(""), &file)?);
    }
    for (name, category) in STATS_DESTINATIONS {
        for artifact in stats.get(name) {
            outputs.push(sink.deliver(category, &artifact.scaffold, &artifact.path)?);
        }
    }

    Ok((
        Analysis {
            current_output: output_name,
            parameter_file,
            merged,
            mask,
            means,
            model_files: files.all(),
            output_dir: sink.base().to_path_buf(),
            outputs,
        },
        subject_list,
    ))
}
