//! Functional (T2*) preprocessing.
//!
//! The raw run is trimmed to the requested volume window, deobliqued,
//! reoriented to RPI, motion corrected twice (the second pass registers to
//! the mean of the first), skull stripped with a dilated automask, and
//! intensity normalized. A binary mask is derived from the normalized
//! series.

use crate::exec::{CommandRunner, ExecError, ToolCommand};
use crate::workflow::{Binding, PortMap, Stage, StageContext, StageList, StagePlan, WorkflowError};
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// First and last volume kept from the raw series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeWindow {
    pub start: i64,
    pub stop: i64,
}

/// Resolve user-supplied volume indices against the series length.
///
/// A start that is unset, negative or past the last volume becomes 0; a stop
/// that is unset or past the last volume becomes the last volume.
pub fn resolve_window(nvols: usize, start: Option<i64>, stop: Option<i64>) -> VolumeWindow {
    let last = nvols as i64 - 1;

    let start = match start {
        Some(s) if s >= 0 && s <= last => s,
        _ => 0,
    };
    let stop = match stop {
        Some(s) if s <= last => s,
        _ => last,
    };

    VolumeWindow { start, stop }
}

/// Ask AFNI for the number of volumes in a dataset.
pub async fn count_volumes<R>(runner: &R, path: &Path) -> Result<usize, ExecError>
where
    R: CommandRunner + ?Sized,
{
    let cmd = ToolCommand::new("3dinfo").arg("-nv").path_arg(path);
    let out = runner.run(&cmd).await?;

    out.last_line()
        .and_then(|l| l.split_whitespace().next())
        .and_then(|v| v.parse::<usize>().ok())
        .ok_or_else(|| ExecError::Parse {
            tool: "3dinfo".to_string(),
            detail: format!("expected a volume count, got {:?}", out.stdout.trim()),
        })
}

/// Series length assumed when no tool answers: long enough to keep the
/// requested indices.
fn dry_run_volumes(start: Option<i64>, stop: Option<i64>) -> usize {
    let highest = start.into_iter().chain(stop).max().unwrap_or(0).max(0);
    highest as usize + 1
}

/// Files produced by one functional preprocessing run.
#[derive(Debug, Clone, Serialize)]
pub struct FuncPreprocOutputs {
    pub window: VolumeWindow,
    pub drop_tr: PathBuf,
    pub refit: PathBuf,
    pub reorient: PathBuf,
    pub reorient_mean: PathBuf,
    pub motion_correct_ref: PathBuf,
    pub motion_correct: PathBuf,
    pub movement_parameters: PathBuf,
    pub max_displacement: PathBuf,
    pub mask: PathBuf,
    pub skullstrip: PathBuf,
    pub example_func: PathBuf,
    pub preprocessed: PathBuf,
    pub preprocessed_mask: PathBuf,
}

impl FuncPreprocOutputs {
    fn from_ports(window: VolumeWindow, ports: &PortMap) -> Result<Self> {
        let get = |key: &str| -> Result<PathBuf> {
            ports
                .get(key)
                .cloned()
                .with_context(|| format!("functional preprocessing produced no {}", key))
        };

        Ok(Self {
            window,
            drop_tr: get("func_drop_trs.out_file")?,
            refit: get("func_deoblique.out_file")?,
            reorient: get("func_reorient.out_file")?,
            reorient_mean: get("func_get_mean_RPI.out_file")?,
            motion_correct_ref: get("func_get_mean_motion.out_file")?,
            motion_correct: get("func_motion_correct_A.out_file")?,
            movement_parameters: get("func_motion_correct_A.oned_file")?,
            max_displacement: get("func_motion_correct_A.md1d_file")?,
            mask: get("func_get_dilate_mask.out_file")?,
            skullstrip: get("func_edge_detect.out_file")?,
            example_func: get("func_mean_skullstrip.out_file")?,
            preprocessed: get("func_normalize.out_file")?,
            preprocessed_mask: get("func_mask_normalize.out_file")?,
        })
    }
}

fn single(port: &str, path: PathBuf) -> PortMap {
    [(port.to_string(), path)].into_iter().collect()
}

fn tstat_mean(ctx: &StageContext) -> Result<StagePlan, WorkflowError> {
    let out = ctx.derived("in_file", "_3dT.nii.gz")?;
    Ok(StagePlan {
        command: ToolCommand::new("3dTstat")
            .arg("-mean")
            .arg("-prefix")
            .path_arg(&out)
            .path_arg(ctx.input("in_file")?)
            .output(&out),
        outputs: single("out_file", out),
    })
}

fn volreg(ctx: &StageContext) -> Result<StagePlan, WorkflowError> {
    let out = ctx.derived("in_file", "_3dv.nii.gz")?;
    let md1d = ctx.derived("in_file", "_3dvmd1D.1D")?;
    let oned = ctx.derived("in_file", "_3dv1D.1D")?;

    let command = ToolCommand::new("3dvolreg")
        .args(["-Fourier", "-twopass"])
        .arg("-base")
        .path_arg(ctx.input("basefile")?)
        .args(["-zpad", "4"])
        .arg("-maxdisp1D")
        .path_arg(&md1d)
        .arg("-1Dfile")
        .path_arg(&oned)
        .arg("-prefix")
        .path_arg(&out)
        .path_arg(ctx.input("in_file")?)
        .output(&out)
        .output(&md1d)
        .output(&oned);

    let outputs = [
        ("out_file".to_string(), out),
        ("md1d_file".to_string(), md1d),
        ("oned_file".to_string(), oned),
    ]
    .into_iter()
    .collect();

    Ok(StagePlan { command, outputs })
}

fn fslmaths(ctx: &StageContext, ops: &[&str], data_type: &str) -> Result<StagePlan, WorkflowError> {
    let out = ctx.derived("in_file", "_maths.nii.gz")?;
    Ok(StagePlan {
        command: ToolCommand::new("fslmaths")
            .path_arg(ctx.input("in_file")?)
            .args(ops.iter().copied())
            .path_arg(&out)
            .args(["-odt", data_type])
            .output(&out),
        outputs: single("out_file", out),
    })
}

/// Build the functional preprocessing stage list for a resolved window.
pub fn func_preproc_stages(window: VolumeWindow) -> StageList {
    let mut list = StageList::new("func_preproc", &["rest"]);

    list.push(Stage::new(
        "func_drop_trs",
        vec![Binding::input("infile_a", "rest")],
        &["out_file"],
        move |ctx| {
            let out = ctx.derived("infile_a", "_3dc.nii.gz")?;
            let selector = format!(
                "{}[{}..{}]",
                ctx.input("infile_a")?.display(),
                window.start,
                window.stop
            );
            Ok(StagePlan {
                command: ToolCommand::new("3dcalc")
                    .arg("-a")
                    .arg(selector)
                    .args(["-expr", "a"])
                    .arg("-prefix")
                    .path_arg(&out)
                    .output(&out),
                outputs: single("out_file", out),
            })
        },
    ));

    list.push(
        Stage::new(
            "func_deoblique",
            vec![Binding::from_stage("in_file", "func_drop_trs", "out_file")],
            &["out_file"],
            |ctx| {
                let target = ctx.input("in_file")?.to_path_buf();
                Ok(StagePlan {
                    command: ToolCommand::new("3drefit")
                        .arg("-deoblique")
                        .path_arg(&target)
                        .output(&target),
                    outputs: single("out_file", target),
                })
            },
        )
        .in_place("in_file"),
    );

    list.push(Stage::new(
        "func_reorient",
        vec![Binding::from_stage("in_file", "func_deoblique", "out_file")],
        &["out_file"],
        |ctx| {
            let out = ctx.derived("in_file", "_RPI.nii.gz")?;
            Ok(StagePlan {
                command: ToolCommand::new("3dresample")
                    .args(["-orient", "RPI"])
                    .arg("-prefix")
                    .path_arg(&out)
                    .arg("-inset")
                    .path_arg(ctx.input("in_file")?)
                    .output(&out),
                outputs: single("out_file", out),
            })
        },
    ));

    list.push(Stage::new(
        "func_get_mean_RPI",
        vec![Binding::from_stage("in_file", "func_reorient", "out_file")],
        &["out_file"],
        tstat_mean,
    ));

    list.push(Stage::new(
        "func_motion_correct",
        vec![
            Binding::from_stage("in_file", "func_reorient", "out_file"),
            Binding::from_stage("basefile", "func_get_mean_RPI", "out_file"),
        ],
        &["out_file", "md1d_file", "oned_file"],
        volreg,
    ));

    list.push(Stage::new(
        "func_get_mean_motion",
        vec![Binding::from_stage("in_file", "func_motion_correct", "out_file")],
        &["out_file"],
        tstat_mean,
    ));

    list.push(Stage::new(
        "func_motion_correct_A",
        vec![
            Binding::from_stage("in_file", "func_reorient", "out_file"),
            Binding::from_stage("basefile", "func_get_mean_motion", "out_file"),
        ],
        &["out_file", "md1d_file", "oned_file"],
        volreg,
    ));

    list.push(Stage::new(
        "func_get_dilate_mask",
        vec![Binding::from_stage("in_file", "func_motion_correct_A", "out_file")],
        &["out_file"],
        |ctx| {
            let out = ctx.derived("in_file", "_automask.nii.gz")?;
            Ok(StagePlan {
                command: ToolCommand::new("3dAutomask")
                    .args(["-dilate", "1"])
                    .arg("-prefix")
                    .path_arg(&out)
                    .path_arg(ctx.input("in_file")?)
                    .output(&out),
                outputs: single("out_file", out),
            })
        },
    ));

    list.push(Stage::new(
        "func_edge_detect",
        vec![
            Binding::from_stage("infile_a", "func_motion_correct_A", "out_file"),
            Binding::from_stage("infile_b", "func_get_dilate_mask", "out_file"),
        ],
        &["out_file"],
        |ctx| {
            let out = ctx.derived("infile_a", "_3dc.nii.gz")?;
            Ok(StagePlan {
                command: ToolCommand::new("3dcalc")
                    .arg("-a")
                    .path_arg(ctx.input("infile_a")?)
                    .arg("-b")
                    .path_arg(ctx.input("infile_b")?)
                    .args(["-expr", "a*b"])
                    .arg("-prefix")
                    .path_arg(&out)
                    .output(&out),
                outputs: single("out_file", out),
            })
        },
    ));

    list.push(Stage::new(
        "func_mean_skullstrip",
        vec![Binding::from_stage("in_file", "func_edge_detect", "out_file")],
        &["out_file"],
        tstat_mean,
    ));

    list.push(Stage::new(
        "func_normalize",
        vec![Binding::from_stage("in_file", "func_edge_detect", "out_file")],
        &["out_file"],
        |ctx| fslmaths(ctx, &["-ing", "10000"], "float"),
    ));

    list.push(Stage::new(
        "func_mask_normalize",
        vec![Binding::from_stage("in_file", "func_normalize", "out_file")],
        &["out_file"],
        |ctx| fslmaths(ctx, &["-Tmin", "-bin"], "char"),
    ));

    list
}

/// Preprocess one functional run in `work_dir`.
pub async fn run_func_preproc<R>(
    runner: &R,
    rest: &Path,
    start_idx: Option<i64>,
    stop_idx: Option<i64>,
    work_dir: &Path,
) -> Result<FuncPreprocOutputs>
where
    R: CommandRunner + ?Sized,
{
    let nvols = match count_volumes(runner, rest).await {
        Ok(n) => n,
        Err(e) if runner.is_dry_run() => {
            debug!("[dry-run] {}: {}", rest.display(), e);
            dry_run_volumes(start_idx, stop_idx)
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read volume count of {}", rest.display()))
        }
    };
    let window = resolve_window(nvols, start_idx, stop_idx);
    debug!(
        "{}: {} volumes, keeping [{}..{}]",
        rest.display(),
        nvols,
        window.start,
        window.stop
    );

    let stages = func_preproc_stages(window);
    let inputs = single("rest", rest.to_path_buf());
    let ports = stages
        .run(runner, &inputs, work_dir)
        .await
        .with_context(|| format!("Functional preprocessing failed for {}", rest.display()))?;

    FuncPreprocOutputs::from_ports(window, &ports)
}

/// Preprocess several runs, at most `concurrency` at a time. Results keep
/// the order of `rests`.
pub async fn run_func_preproc_all<R>(
    runner: &R,
    rests: &[PathBuf],
    start_idx: Option<i64>,
    stop_idx: Option<i64>,
    work_dir: &Path,
    concurrency: usize,
    show_progress: bool,
) -> Result<Vec<FuncPreprocOutputs>>
where
    R: CommandRunner + ?Sized,
{
    info!(
        "Preprocessing {} functional run(s), concurrency {}",
        rests.len(),
        concurrency
    );

    let progress = if show_progress {
        let pb = ProgressBar::new(rests.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} runs")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Some(pb)
    } else {
        None
    };

    let results = stream::iter(rests.iter().enumerate())
        .map(|(i, rest)| {
            let dir = work_dir.join(format!("_func_preproc{}", i));
            let progress = progress.clone();
            async move {
                let out = run_func_preproc(runner, rest, start_idx, stop_idx, &dir).await;
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                out
            }
        })
        .buffered(concurrency.max(1))
        .try_collect::<Vec<_>>()
        .await?;

    if let Some(pb) = progress {
        pb.finish_with_message("Preprocessing complete");
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::exec::DryRunRunner;
    use tempfile::TempDir;

    fn nvols_runner(n: usize) -> FakeRunner {
        FakeRunner::responding(move |cmd| {
            if cmd.tool == "3dinfo" {
                format!("{}\n", n)
            } else {
                String::new()
            }
        })
    }

    #[test]
    fn test_window_defaults() {
        assert_eq!(resolve_window(300, None, None), VolumeWindow { start: 0, stop: 299 });
        assert_eq!(resolve_window(300, Some(4), Some(200)), VolumeWindow { start: 4, stop: 200 });
    }

    #[test]
    fn test_window_clamps_at_boundaries() {
        let nvols = 150;
        for start in [-10, -1, 150, 151, 10_000] {
            assert_eq!(resolve_window(nvols, Some(start), None).start, 0);
        }
        for stop in [150, 151, 10_000] {
            assert_eq!(resolve_window(nvols, None, Some(stop)).stop, 149);
        }
        // Exactly at the boundary the values are kept.
        let w = resolve_window(nvols, Some(149), Some(0));
        assert_eq!(w, VolumeWindow { start: 149, stop: 0 });
    }

    #[test]
    fn test_stage_order_and_validation() {
        let list = func_preproc_stages(VolumeWindow { start: 0, stop: 9 });
        list.validate().unwrap();
        assert_eq!(
            list.order(),
            vec![
                "func_drop_trs",
                "func_deoblique",
                "func_reorient",
                "func_get_mean_RPI",
                "func_motion_correct",
                "func_get_mean_motion",
                "func_motion_correct_A",
                "func_get_dilate_mask",
                "func_edge_detect",
                "func_mean_skullstrip",
                "func_normalize",
                "func_mask_normalize",
            ]
        );
    }

    #[test]
    fn test_second_pass_depends_on_first_pass_mean() {
        let list = func_preproc_stages(VolumeWindow { start: 0, stop: 9 });
        let deps = list.upstream("func_motion_correct_A");

        assert!(deps.contains("func_get_mean_motion"));
        assert!(deps.contains("func_motion_correct"));
        assert!(deps.contains("func_reorient"));
        assert!(!deps.contains("func_get_dilate_mask"));

        let pass2 = list.stage("func_motion_correct_A").unwrap();
        let base = pass2.inputs.iter().find(|b| b.port == "basefile").unwrap();
        assert_eq!(
            base.source,
            crate::workflow::stage::Source::Stage {
                stage: "func_get_mean_motion".to_string(),
                port: "out_file".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_count_volumes_parse_error() {
        let runner = FakeRunner::responding(|_| "not a number".to_string());
        let err = count_volumes(&runner, Path::new("rest.nii.gz")).await.unwrap_err();
        assert!(matches!(err, ExecError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_run_func_preproc_commands() {
        let temp = TempDir::new().unwrap();
        let rest = temp.path().join("rest.nii.gz");
        std::fs::write(&rest, b"").unwrap();

        let runner = nvols_runner(120);
        let work = temp.path().join("work");
        let out = run_func_preproc(&runner, &rest, Some(4), Some(500), &work)
            .await
            .unwrap();

        assert_eq!(out.window, VolumeWindow { start: 4, stop: 119 });
        assert_eq!(
            runner.tools(),
            vec![
                "3dinfo", "3dcalc", "3drefit", "3dresample", "3dTstat", "3dvolreg", "3dTstat",
                "3dvolreg", "3dAutomask", "3dcalc", "3dTstat", "fslmaths", "fslmaths",
            ]
        );

        let calls = runner.calls();
        assert_eq!(calls[1].args[1], format!("{}[4..119]", rest.display()));

        // Both passes register the reoriented series; the second uses the
        // mean of the first pass as its base.
        let volregs = runner.calls_to("3dvolreg");
        let base_of = |c: &ToolCommand| c.args[3].clone();
        let input_of = |c: &ToolCommand| c.args.last().unwrap().clone();
        assert_eq!(input_of(&volregs[0]), out.reorient.to_string_lossy());
        assert_eq!(input_of(&volregs[1]), out.reorient.to_string_lossy());
        assert_eq!(base_of(&volregs[0]), out.reorient_mean.to_string_lossy());
        assert_eq!(base_of(&volregs[1]), out.motion_correct_ref.to_string_lossy());

        assert!(out
            .preprocessed_mask
            .to_string_lossy()
            .ends_with("rest_3dc_RPI_3dv_3dc_maths_maths.nii.gz"));
        assert_eq!(calls.last().unwrap().args[1..3], ["-Tmin", "-bin"]);
        assert!(out.refit.starts_with(work.join("func_deoblique")));
    }

    #[tokio::test]
    async fn test_dry_run_without_files() {
        let temp = TempDir::new().unwrap();
        let rest = temp.path().join("missing_rest.nii.gz");

        let out = run_func_preproc(&DryRunRunner, &rest, Some(4), None, &temp.path().join("w"))
            .await
            .unwrap();
        assert_eq!(out.window, VolumeWindow { start: 4, stop: 4 });
        assert!(!out.preprocessed.exists());
    }

    #[tokio::test]
    async fn test_run_func_preproc_stops_on_failure() {
        let temp = TempDir::new().unwrap();
        let rest = temp.path().join("rest.nii.gz");
        std::fs::write(&rest, b"").unwrap();

        let runner = FakeRunner::responding(|cmd| {
            if cmd.tool == "3dinfo" { "10".to_string() } else { String::new() }
        })
        .failing_on("3dvolreg");

        let result = run_func_preproc(&runner, &rest, None, None, temp.path()).await;
        assert!(result.is_err());
        assert_eq!(runner.tools().last().unwrap(), "3dvolreg");
        assert_eq!(runner.calls_to("3dvolreg").len(), 1);
    }

    #[tokio::test]
    async fn test_run_many_keeps_order() {
        let temp = TempDir::new().unwrap();
        let rests: Vec<PathBuf> = (0..3)
            .map(|i| {
                let p = temp.path().join(format!("rest_{}.nii.gz", i));
                std::fs::write(&p, b"").unwrap();
                p
            })
            .collect();

        let runner = nvols_runner(50);
        let outs = run_func_preproc_all(&runner, &rests, None, None, &temp.path().join("w"), 2, false)
            .await
            .unwrap();

        assert_eq!(outs.len(), 3);
        for (i, out) in outs.iter().enumerate() {
            assert!(out
                .drop_tr
                .to_string_lossy()
                .contains(&format!("_func_preproc{}", i)));
            assert!(out.drop_tr.to_string_lossy().ends_with(&format!("rest_{}_3dc.nii.gz", i)));
        }
    }
}
