//! Fieldmap-based EPI distortion correction.
//!
//! The magnitude image is skull stripped and eroded, the anatomical image is
//! brain extracted and segmented to get a white-matter mask, the phase image
//! is turned into a fieldmap and despiked, and `epi_reg` registers the EPI to
//! the anatomy while unwarping it with that fieldmap.
//!
//! `fsl_prepare_fieldmap` only understands SIEMENS phase images, scaled
//! 0-4096.

use crate::exec::{CommandRunner, ToolCommand};
use crate::workflow::{Binding, PortMap, Stage, StageContext, StageList, StagePlan, WorkflowError};
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tool used to skull strip the fieldmap magnitude image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SkullStripMethod {
    /// FSL `bet`
    #[default]
    FslBet,
    /// AFNI `3dSkullStrip`
    Afni,
}

/// Acquisition parameters for the fieldmap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistCorrParams {
    /// Echo time difference in ms.
    pub delta_te: f64,
    /// Effective EPI echo spacing in seconds.
    pub dwell_time: f64,
    pub dwell_asym_ratio: f64,
    pub bet_frac: f64,
    pub skullstrip: SkullStripMethod,
}

impl Default for DistCorrParams {
    fn default() -> Self {
        Self {
            delta_te: 2.46,
            dwell_time: 0.0005,
            dwell_asym_ratio: 0.93902439,
            bet_frac: 0.5,
            skullstrip: SkullStripMethod::FslBet,
        }
    }
}

/// Files produced by distortion correction.
#[derive(Debug, Clone, Serialize)]
pub struct DistCorrOutputs {
    pub func_file: PathBuf,
    pub magnitude_image: PathBuf,
    pub fmapmagbrain: PathBuf,
    pub stripped_anat: PathBuf,
    pub partial_volume_files: Vec<PathBuf>,
    pub partial_volume_map: PathBuf,
    pub threshold_image: PathBuf,
    pub t1_wm_seg: PathBuf,
    pub fieldmap: PathBuf,
    pub fmap_despiked: PathBuf,
    pub epireg: PathBuf,
}

fn single(port: &str, path: PathBuf) -> PortMap {
    [(port.to_string(), path)].into_iter().collect()
}

fn bet(ctx: &StageContext, frac: f64) -> Result<StagePlan, WorkflowError> {
    let out = ctx.derived("in_file", "_brain.nii.gz")?;
    Ok(StagePlan {
        command: ToolCommand::new("bet")
            .path_arg(ctx.input("in_file")?)
            .path_arg(&out)
            .arg("-f")
            .arg(frac.to_string())
            .output(&out),
        outputs: single("out_file", out),
    })
}

fn unary_maths(ctx: &StageContext, op: &[&str], suffix: &str) -> Result<StagePlan, WorkflowError> {
    let out = ctx.derived("in_file", suffix)?;
    Ok(StagePlan {
        command: ToolCommand::new("fslmaths")
            .path_arg(ctx.input("in_file")?)
            .args(op.iter().copied())
            .path_arg(&out)
            .output(&out),
        outputs: single("out_file", out),
    })
}

/// Build the distortion-correction stage list.
pub fn distcorr_stages(params: DistCorrParams) -> StageList {
    let mut list = StageList::new(
        "epi_distcorr",
        &["anat_file", "func_file", "fmap_pha", "fmap_mag"],
    );

    list.push(Stage::new(
        "bet",
        vec![Binding::input("in_file", "fmap_mag")],
        &["out_file"],
        move |ctx| match params.skullstrip {
            SkullStripMethod::FslBet => bet(ctx, params.bet_frac),
            SkullStripMethod::Afni => {
                let out = ctx.derived("in_file", "_skullstrip.nii.gz")?;
                Ok(StagePlan {
                    command: ToolCommand::new("3dSkullStrip")
                        .arg("-input")
                        .path_arg(ctx.input("in_file")?)
                        .arg("-prefix")
                        .path_arg(&out)
                        .arg("-shrink_fac")
                        .arg(params.bet_frac.to_string())
                        .output(&out),
                    outputs: single("out_file", out),
                })
            }
        },
    ));

    list.push(Stage::new(
        "fslmath_mag",
        vec![Binding::from_stage("in_file", "bet", "out_file")],
        &["out_file"],
        |ctx| unary_maths(ctx, &["-ero"], "_ero.nii.gz"),
    ));

    list.push(Stage::new(
        "bet_anat",
        vec![Binding::input("in_file", "anat_file")],
        &["out_file"],
        |ctx| bet(ctx, 0.5),
    ));

    list.push(Stage::new(
        "fast_anat",
        vec![Binding::from_stage("in_files", "bet_anat", "out_file")],
        &["pve_0", "pve_1", "pve_2", "partial_volume_map"],
        |ctx| {
            let base = ctx.file("T1");
            let pve = |i: usize| ctx.file(&format!("T1_pve_{}.nii.gz", i));
            let pveseg = ctx.file("T1_pveseg.nii.gz");

            let command = ToolCommand::new("fast")
                .args(["-t", "1", "-I", "10", "-l", "10", "-g", "-B"])
                .arg("-o")
                .path_arg(&base)
                .path_arg(ctx.input("in_files")?)
                .output(pve(0))
                .output(pve(1))
                .output(pve(2))
                .output(&pveseg);

            let outputs = [
                ("pve_0".to_string(), pve(0)),
                ("pve_1".to_string(), pve(1)),
                ("pve_2".to_string(), pve(2)),
                ("partial_volume_map".to_string(), pveseg),
            ]
            .into_iter()
            .collect();

            Ok(StagePlan { command, outputs })
        },
    ));

    list.push(Stage::new(
        "fsl_anat",
        vec![Binding::from_stage("in_file", "fast_anat", "pve_2")],
        &["out_file"],
        |ctx| unary_maths(ctx, &["-thr", "0.5"], "_thresh.nii.gz"),
    ));

    list.push(Stage::new(
        "fslmath_wmseg",
        vec![Binding::from_stage("in_file", "fsl_anat", "out_file")],
        &["out_file"],
        |ctx| unary_maths(ctx, &["-bin"], "_bin.nii.gz"),
    ));

    list.push(Stage::new(
        "prepare",
        vec![
            Binding::input("in_phase", "fmap_pha"),
            Binding::from_stage("in_magnitude", "bet", "out_file"),
        ],
        &["out_fieldmap"],
        move |ctx| {
            let out = ctx.derived("in_phase", "_fslprepared.nii.gz")?;
            Ok(StagePlan {
                command: ToolCommand::new("fsl_prepare_fieldmap")
                    .arg("SIEMENS")
                    .path_arg(ctx.input("in_phase")?)
                    .path_arg(ctx.input("in_magnitude")?)
                    .path_arg(&out)
                    .arg(params.delta_te.to_string())
                    .output(&out),
                outputs: single("out_fieldmap", out),
            })
        },
    ));

    list.push(Stage::new(
        "fugue1",
        vec![Binding::from_stage("fmap_in_file", "prepare", "out_fieldmap")],
        &["fmap_out_file"],
        move |ctx| {
            let out = ctx.file("fmap_despiked.nii.gz");
            Ok(StagePlan {
                command: ToolCommand::new("fugue")
                    .flag_path("--loadfmap", ctx.input("fmap_in_file")?)
                    .arg(format!("--dwell={}", params.dwell_time))
                    .arg(format!("--dwelltoasym={}", params.dwell_asym_ratio))
                    .arg("--despike")
                    .flag_path("--savefmap", &out)
                    .output(&out),
                outputs: single("fmap_out_file", out),
            })
        },
    ));

    list.push(Stage::new(
        "epireg",
        vec![
            Binding::input("epi", "func_file"),
            Binding::input("t1_head", "anat_file"),
            Binding::from_stage("t1_brain", "bet_anat", "out_file"),
            Binding::from_stage("wmseg", "fslmath_wmseg", "out_file"),
            Binding::input("fmapmag", "fmap_mag"),
            Binding::from_stage("fmapmagbrain", "fslmath_mag", "out_file"),
            Binding::from_stage("fmap", "fugue1", "fmap_out_file"),
        ],
        &["out_file"],
        move |ctx| {
            let base = ctx.file("epi2struct");
            let out = ctx.file("epi2struct.nii.gz");
            Ok(StagePlan {
                command: ToolCommand::new("epi_reg")
                    .flag_path("--epi", ctx.input("epi")?)
                    .flag_path("--t1", ctx.input("t1_head")?)
                    .flag_path("--t1brain", ctx.input("t1_brain")?)
                    .flag_path("--out", &base)
                    .flag_path("--fmap", ctx.input("fmap")?)
                    .flag_path("--fmapmag", ctx.input("fmapmag")?)
                    .flag_path("--fmapmagbrain", ctx.input("fmapmagbrain")?)
                    .arg(format!("--echospacing={}", params.dwell_time))
                    .arg("--pedir=-y")
                    .flag_path("--wmseg", ctx.input("wmseg")?)
                    .output(&out),
                outputs: single("out_file", out),
            })
        },
    ));

    list
}

/// Input images for distortion correction.
#[derive(Debug, Clone)]
pub struct DistCorrInputs {
    pub anat_file: PathBuf,
    pub func_file: PathBuf,
    pub fmap_pha: PathBuf,
    pub fmap_mag: PathBuf,
}

/// Run distortion correction in `work_dir`.
pub async fn run_distcorr<R>(
    runner: &R,
    inputs: &DistCorrInputs,
    params: DistCorrParams,
    work_dir: &Path,
) -> Result<DistCorrOutputs>
where
    R: CommandRunner + ?Sized,
{
    let ports: PortMap = [
        ("anat_file".to_string(), inputs.anat_file.clone()),
        ("func_file".to_string(), inputs.func_file.clone()),
        ("fmap_pha".to_string(), inputs.fmap_pha.clone()),
        ("fmap_mag".to_string(), inputs.fmap_mag.clone()),
    ]
    .into_iter()
    .collect();

    let resolved = distcorr_stages(params)
        .run(runner, &ports, work_dir)
        .await
        .with_context(|| {
            format!(
                "Distortion correction failed for {}",
                inputs.func_file.display()
            )
        })?;

    let get = |key: &str| -> Result<PathBuf> {
        resolved
            .get(key)
            .cloned()
            .with_context(|| format!("distortion correction produced no {}", key))
    };

    Ok(DistCorrOutputs {
        func_file: inputs.func_file.clone(),
        magnitude_image: get("bet.out_file")?,
        fmapmagbrain: get("fslmath_mag.out_file")?,
        stripped_anat: get("bet_anat.out_file")?,
        partial_volume_files: vec![
            get("fast_anat.pve_0")?,
            get("fast_anat.pve_1")?,
            get("fast_anat.pve_2")?,
        ],
        partial_volume_map: get("fast_anat.partial_volume_map")?,
        threshold_image: get("fsl_anat.out_file")?,
        t1_wm_seg: get("fslmath_wmseg.out_file")?,
        fieldmap: get("prepare.out_fieldmap")?,
        fmap_despiked: get("fugue1.fmap_out_file")?,
        epireg: get("epireg.out_file")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use tempfile::TempDir;

    fn inputs(dir: &Path) -> DistCorrInputs {
        let touch = |name: &str| {
            let p = dir.join(name);
            std::fs::write(&p, b"").unwrap();
            p
        };
        DistCorrInputs {
            anat_file: touch("anat.nii.gz"),
            func_file: touch("rest.nii.gz"),
            fmap_pha: touch("phase.nii.gz"),
            fmap_mag: touch("magnitude.nii.gz"),
        }
    }

    #[test]
    fn test_stage_list_is_valid() {
        let list = distcorr_stages(DistCorrParams::default());
        list.validate().unwrap();

        let deps = list.upstream("epireg");
        for stage in ["bet", "fslmath_mag", "bet_anat", "fast_anat", "fsl_anat", "fslmath_wmseg", "prepare", "fugue1"] {
            assert!(deps.contains(stage), "epireg should depend on {}", stage);
        }
    }

    #[tokio::test]
    async fn test_run_distcorr_fsl() {
        let temp = TempDir::new().unwrap();
        let ins = inputs(temp.path());
        let runner = FakeRunner::new();

        let out = run_distcorr(&runner, &ins, DistCorrParams::default(), &temp.path().join("w"))
            .await
            .unwrap();

        assert_eq!(
            runner.tools(),
            vec![
                "bet", "fslmaths", "bet", "fast", "fslmaths", "fslmaths",
                "fsl_prepare_fieldmap", "fugue", "epi_reg",
            ]
        );
        assert!(out.threshold_image.to_string_lossy().ends_with("T1_pve_2_thresh.nii.gz"));
        assert_eq!(out.partial_volume_files.len(), 3);

        let epireg = runner.calls_to("epi_reg").remove(0);
        assert!(epireg.args.contains(&"--pedir=-y".to_string()));
        assert!(epireg.args.contains(&"--echospacing=0.0005".to_string()));
        assert!(epireg
            .args
            .contains(&format!("--wmseg={}", out.t1_wm_seg.display())));

        let prepare = runner.calls_to("fsl_prepare_fieldmap").remove(0);
        assert_eq!(prepare.args[0], "SIEMENS");
        assert_eq!(prepare.args.last().unwrap(), "2.46");
    }

    #[tokio::test]
    async fn test_run_distcorr_afni_skullstrip() {
        let temp = TempDir::new().unwrap();
        let ins = inputs(temp.path());
        let runner = FakeRunner::new();
        let params = DistCorrParams {
            skullstrip: SkullStripMethod::Afni,
            bet_frac: 0.3,
            ..DistCorrParams::default()
        };

        run_distcorr(&runner, &ins, params, temp.path()).await.unwrap();

        let first = runner.calls().remove(0);
        assert_eq!(first.tool, "3dSkullStrip");
        assert_eq!(first.args.last().unwrap(), "0.3");
    }
}
