//! Merged 4D input, group mask, per-subject means, and design files.

use crate::exec::{CommandRunner, ExecError, ToolCommand, ToolOutput};
use futures::stream::{self, StreamExt, TryStreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Concatenate derivatives along time.
pub fn merge_command(merged: &Path, paths: &[PathBuf]) -> ToolCommand {
    let mut cmd = ToolCommand::new("fslmerge").arg("-t").path_arg(merged);
    for path in paths {
        cmd = cmd.path_arg(path);
    }
    cmd.output(merged)
}

/// Voxels non-zero in every volume: `abs`, minimum over time, binarize.
pub fn mask_command(merged: &Path, mask: &Path) -> ToolCommand {
    ToolCommand::new("fslmaths")
        .path_arg(merged)
        .args(["-abs", "-Tmin", "-bin"])
        .path_arg(mask)
        .output(mask)
}

pub fn maskave_command(mask: &Path, derivative: &Path) -> ToolCommand {
    ToolCommand::new("3dmaskave")
        .arg("-mask")
        .path_arg(mask)
        .path_arg(derivative)
}

/// Mean from `3dmaskave` stdout: first token of the last line.
pub fn parse_maskave(output: &ToolOutput) -> Result<f64, ExecError> {
    let parse_error = |detail: String| ExecError::Parse {
        tool: "3dmaskave".to_string(),
        detail,
    };

    let token = output
        .last_line()
        .and_then(|line| line.split_whitespace().next())
        .ok_or_else(|| parse_error("no output".to_string()))?;

    token
        .parse::<f64>()
        .map_err(|_| parse_error(format!("'{}' is not a number", token)))
}

/// Masked mean of every derivative, keyed by subject-list entry.
///
/// With `lenient`, unparseable output is recorded as NaN instead of failing
/// (used for dry runs, where no tool prints anything).
pub async fn compute_means<R>(
    runner: &R,
    mask: &Path,
    derivatives: &[(String, PathBuf)],
    concurrency: usize,
    lenient: bool,
    show_progress: bool,
) -> Result<BTreeMap<String, f64>, ExecError>
where
    R: CommandRunner + ?Sized,
{
    let progress = if show_progress {
        let pb = ProgressBar::new(derivatives.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} means")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Some(pb)
    } else {
        None
    };

    let values = stream::iter(derivatives.iter())
        .map(|(entry, path)| {
            let progress = progress.clone();
            async move {
                let command = maskave_command(mask, path);
                let output = runner.run(&command).await?;
                if let Some(pb) = progress {
                    pb.inc(1);
                }

                let mean = match parse_maskave(&output) {
                    Ok(mean) => mean,
                    Err(e) if lenient => {
                        debug!("{}: {}", path.display(), e);
                        f64::NAN
                    }
                    Err(e) => return Err(e),
                };
                Ok::<_, ExecError>((entry.clone(), mean))
            }
        })
        .buffered(concurrency.max(1))
        .try_collect::<Vec<_>>()
        .await?;

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    let mut means = BTreeMap::new();
    for (entry, mean) in values {
        if means.insert(entry.clone(), mean).is_some() {
            warn!("Subject {} has several derivatives; keeping the last mean", entry);
        }
    }
    Ok(means)
}

/// Render means as a two-column CSV.
pub fn means_csv(subject_label: &str, output_name: &str, means: &BTreeMap<String, f64>) -> String {
    let mut csv = format!("{},{}\n", subject_label, output_name);
    for (entry, mean) in means {
        let _ = writeln!(csv, "{},{}", entry.replace(',', "_"), mean);
    }
    csv
}

/// Design files written by the model builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub mat: PathBuf,
    pub con: PathBuf,
    pub grp: PathBuf,
    pub fts: Option<PathBuf>,
}

impl ModelFiles {
    pub fn new(model_files_dir: &Path, model_name: &str, f_test: bool) -> Self {
        let file = |ext: &str| model_files_dir.join(format!("{}.{}", model_name, ext));
        Self {
            mat: file("mat"),
            con: file("con"),
            grp: file("grp"),
            fts: f_test.then(|| file("fts")),
        }
    }

    pub fn all(&self) -> Vec<PathBuf> {
        let mut files = vec![self.mat.clone(), self.con.clone(), self.grp.clone()];
        files.extend(self.fts.clone());
        files
    }
}

/// Inputs of the external model builder.
#[derive(Debug, Clone)]
pub struct ModelRequest<'a> {
    pub builder: &'a str,
    pub pheno_file: Option<&'a Path>,
    pub subject_list: &'a Path,
    pub subject_id_label: &'a str,
    pub design_formula: &'a str,
    pub means_file: &'a Path,
    pub parameter_file: Option<&'a Path>,
    pub model_name: &'a str,
    pub output_dir: &'a Path,
    pub files: &'a ModelFiles,
}

pub fn model_builder_command(req: &ModelRequest<'_>) -> ToolCommand {
    let mut cmd = ToolCommand::new(req.builder);
    if let Some(pheno) = req.pheno_file {
        cmd = cmd.arg("--pheno").path_arg(pheno);
    }
    cmd = cmd
        .arg("--subject-list")
        .path_arg(req.subject_list)
        .arg("--subject-id-label")
        .arg(req.subject_id_label)
        .arg("--formula")
        .arg(req.design_formula)
        .arg("--means")
        .path_arg(req.means_file);
    if let Some(params) = req.parameter_file {
        cmd = cmd.arg("--parameter-file").path_arg(params);
    }
    cmd = cmd
        .arg("--model-name")
        .arg(req.model_name)
        .arg("--output-dir")
        .path_arg(req.output_dir);
    if req.files.fts.is_some() {
        cmd = cmd.arg("--f-test");
    }

    for file in req.files.all() {
        cmd = cmd.output(file);
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;

    /// Voxel-by-time model of `fslmaths -abs -Tmin -bin`.
    fn apply_mask_ops(series: &[Vec<f64>]) -> Vec<Vec<f64>> {
        series
            .iter()
            .map(|voxel| {
                let min = voxel.iter().map(|v| v.abs()).fold(f64::INFINITY, f64::min);
                vec![if min > 0.0 { 1.0 } else { 0.0 }]
            })
            .collect()
    }

    #[test]
    fn test_merge_and_mask_commands() {
        let merged = PathBuf::from("/mf/alff_merged.nii.gz");
        let merge = merge_command(&merged, &[PathBuf::from("/a.nii.gz"), PathBuf::from("/b.nii.gz")]);
        assert_eq!(
            merge.command_line(),
            "fslmerge -t /mf/alff_merged.nii.gz /a.nii.gz /b.nii.gz"
        );
        assert_eq!(merge.outputs, vec![merged.clone()]);

        let mask = mask_command(&merged, Path::new("/mf/alff_merged_mask.nii.gz"));
        assert_eq!(
            mask.command_line(),
            "fslmaths /mf/alff_merged.nii.gz -abs -Tmin -bin /mf/alff_merged_mask.nii.gz"
        );
    }

    #[test]
    fn test_binarize_is_idempotent() {
        let series = vec![
            vec![1.5, -2.0, 0.3],
            vec![0.0, 4.0, 1.0],
            vec![-0.1, -0.2, -0.3],
        ];
        let once = apply_mask_ops(&series);
        assert_eq!(once, vec![vec![1.0], vec![0.0], vec![1.0]]);
        assert_eq!(apply_mask_ops(&once), once);

        // Masking a mask is the same command shape.
        let a = mask_command(Path::new("m.nii.gz"), Path::new("mask.nii.gz"));
        let b = mask_command(Path::new("mask.nii.gz"), Path::new("mask.nii.gz"));
        assert_eq!(a.args[1..4], b.args[1..4]);
    }

    #[test]
    fn test_parse_maskave() {
        let out = ToolOutput::with_stdout("++ 3dmaskave: AFNI version=AFNI_2011\n+++ 61234 voxels survive the mask\n0.842153 [61234 voxels]\n");
        assert_eq!(parse_maskave(&out).unwrap(), 0.842153);

        assert!(matches!(
            parse_maskave(&ToolOutput::default()),
            Err(ExecError::Parse { .. })
        ));
        assert!(parse_maskave(&ToolOutput::with_stdout("voxels only\n")).is_err());
    }

    #[tokio::test]
    async fn test_compute_means_keyed_and_sorted() {
        let runner = FakeRunner::responding(|cmd| {
            let path = cmd.args.last().cloned().unwrap_or_default();
            if path.contains("/003/") {
                "3.5 [100 voxels]\n".to_string()
            } else {
                "1.25 [100 voxels]\n".to_string()
            }
        });

        let derivatives = vec![
            ("003".to_string(), PathBuf::from("/out/p/003/alff/a.nii.gz")),
            ("001".to_string(), PathBuf::from("/out/p/001/alff/a.nii.gz")),
        ];
        let means = compute_means(&runner, Path::new("/mask.nii.gz"), &derivatives, 2, false, false)
            .await
            .unwrap();

        assert_eq!(means.keys().cloned().collect::<Vec<_>>(), vec!["001", "003"]);
        assert_eq!(means["001"], 1.25);
        assert_eq!(means["003"], 3.5);
        assert_eq!(runner.calls_to("3dmaskave").len(), 2);
    }

    #[tokio::test]
    async fn test_compute_means_lenient() {
        let runner = FakeRunner::new();
        let derivatives = vec![("001".to_string(), PathBuf::from("/a.nii.gz"))];

        let strict = compute_means(&runner, Path::new("/m"), &derivatives, 1, false, false).await;
        assert!(strict.is_err());

        let lenient = compute_means(&runner, Path::new("/m"), &derivatives, 1, true, false)
            .await
            .unwrap();
        assert!(lenient["001"].is_nan());
    }

    #[test]
    fn test_means_csv() {
        let mut means = BTreeMap::new();
        means.insert("001".to_string(), 0.5);
        means.insert("sub2,rest_1".to_string(), 1.0);
        assert_eq!(
            means_csv("subject_id", "alff", &means),
            "subject_id,alff\n001,0.5\nsub2_rest_1,1\n"
        );
    }

    #[test]
    fn test_model_builder_command() {
        let files = ModelFiles::new(Path::new("/mf"), "model_age", true);
        let req = ModelRequest {
            builder: "cpac_create_fsl_model",
            pheno_file: Some(Path::new("/pheno.csv")),
            subject_list: Path::new("/mf/subjects.txt"),
            subject_id_label: "subject_id",
            design_formula: "Age + MeanFD",
            means_file: Path::new("/mf/alff_means.csv"),
            parameter_file: None,
            model_name: "model_age",
            output_dir: Path::new("/mf"),
            files: &files,
        };

        let cmd = model_builder_command(&req);
        assert_eq!(cmd.tool, "cpac_create_fsl_model");
        assert!(cmd.args.contains(&"--f-test".to_string()));
        assert!(!cmd.args.contains(&"--parameter-file".to_string()));
        assert_eq!(cmd.outputs.len(), 4);
        assert_eq!(files.fts, Some(PathBuf::from("/mf/model_age.fts")));
        assert_eq!(ModelFiles::new(Path::new("/mf"), "m", false).all().len(), 3);
    }
}
