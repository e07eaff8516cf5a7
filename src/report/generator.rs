//! Markdown and JSON run reports.
//!
//! This module renders a [`GroupRunReport`] for humans (Markdown) or tools
//! (JSON).

use crate::models::{GroupRunReport, RoutedOutput, RunMetadata, SubjectSummary};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &GroupRunReport) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "# Group Analysis Report: {}\n\n",
        report.metadata.resource
    ));

    output.push_str(&generate_metadata_section(report));
    output.push_str(&generate_subjects_section(&report.subjects));
    output.push_str(&generate_means_section(&report.derivative_means));
    output.push_str(&generate_inputs_section(report));
    output.push_str(&generate_outputs_section(&report.outputs_by_category()));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(report: &GroupRunReport) -> String {
    let metadata: &RunMetadata = &report.metadata;
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Resource:** `{}`\n", metadata.resource));
    section.push_str(&format!("- **Derivative:** `{}`\n", metadata.current_output));
    section.push_str(&format!("- **Pipeline:** `{}`\n", metadata.pipeline_id));
    section.push_str(&format!("- **Model:** `{}`\n", metadata.model_name));
    section.push_str(&format!(
        "- **Analysis Date:** {}\n",
        metadata.analysis_date.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!(
        "- **Analysis Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push_str(&format!(
        "- **Output Directory:** `{}`\n",
        report.output_dir.display()
    ));
    if metadata.dry_run {
        section.push_str("- **Dry Run:** no tools were executed\n");
    }
    section.push('\n');

    section
}

/// Generate the subject summary section.
fn generate_subjects_section(subjects: &SubjectSummary) -> String {
    let mut section = String::new();

    section.push_str("## Subjects\n\n");
    section.push_str("| Listed | Included | Missing |\n");
    section.push_str("|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} |\n\n",
        subjects.listed.len(),
        subjects.kept.len(),
        subjects.missing.len()
    ));

    if !subjects.missing.is_empty() {
        section.push_str("### Missing Subjects\n\n");
        section.push_str("These subjects have no derivative for this resource and were excluded:\n\n");
        for subject in &subjects.missing {
            section.push_str(&format!("- `{}`\n", subject));
        }
        section.push('\n');
    }

    section
}

/// Generate the per-subject means table.
fn generate_means_section(means: &BTreeMap<String, f64>) -> String {
    if means.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Derivative Means\n\n");
    section.push_str("| Subject | Mean |\n");
    section.push_str("|:---|---:|\n");
    for (subject, mean) in means {
        if mean.is_nan() {
            section.push_str(&format!("| {} | n/a |\n", subject));
        } else {
            section.push_str(&format!("| {} | {:.6} |\n", subject, mean));
        }
    }
    section.push('\n');

    section
}

/// Generate the model inputs section.
fn generate_inputs_section(report: &GroupRunReport) -> String {
    let mut section = String::new();

    section.push_str("## Model Inputs\n\n");
    section.push_str(&format!(
        "- **Subject List:** `{}`\n",
        report.filtered_subject_list.display()
    ));
    section.push_str(&format!("- **Merged:** `{}`\n", report.merged_file.display()));
    section.push_str(&format!("- **Mask:** `{}`\n", report.merged_mask.display()));
    match report.parameter_file {
        Some(ref path) => section.push_str(&format!("- **Motion Parameters:** `{}`\n", path.display())),
        None => section.push_str("- **Motion Parameters:** not used\n"),
    }
    for file in &report.model_files {
        section.push_str(&format!("- **Design:** `{}`\n", file.display()));
    }
    section.push('\n');

    section
}

/// Generate the routed outputs section, one table per category.
fn generate_outputs_section(grouped: &BTreeMap<&str, Vec<&RoutedOutput>>) -> String {
    let mut section = String::new();

    section.push_str("## Outputs\n\n");

    if grouped.is_empty() {
        section.push_str("No outputs were produced.\n\n");
        return section;
    }

    for (category, outputs) in grouped {
        section.push_str(&format!("### {}\n\n", category));
        for output in outputs {
            let name = output
                .destination
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            section.push_str(&format!("- `{}`\n", name));
        }
        section.push('\n');
    }

    section
}

/// Generate the footer.
fn generate_footer() -> String {
    format!(
        "---\n\n*Report generated by neuroflow v{}*\n",
        env!("CARGO_PKG_VERSION")
    )
}

/// Generate a JSON report.
pub fn generate_json_report(report: &GroupRunReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Write a report to a file in the requested format.
pub fn write_report(report: &GroupRunReport, path: &Path, json: bool) -> Result<()> {
    let content = if json {
        generate_json_report(report)?
    } else {
        generate_markdown_report(report)
    };

    std::fs::write(path, content)?;
    Ok(())
}
