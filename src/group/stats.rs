//! Second-level statistics: FLAME (OLS) followed by cluster-based
//! thresholding and rendering of every z-statistic image.

use super::model::ModelFiles;
use crate::exec::{CommandRunner, ExecError, ToolCommand, ToolOutput};
use crate::workflow::nifti_stem;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A file produced by the statistics stages together with the node
/// directory (relative to the group working directory) it was written in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub scaffold: PathBuf,
}

impl Artifact {
    fn new(path: PathBuf, scaffold: &str) -> Self {
        Self {
            path,
            scaffold: PathBuf::from(scaffold),
        }
    }
}

/// Everything second-level statistics needs.
#[derive(Debug, Clone)]
pub struct StatsInputs<'a> {
    pub merged: &'a Path,
    pub mask: &'a Path,
    pub model: &'a ModelFiles,
    pub z_threshold: f64,
    pub p_threshold: f64,
    pub background: &'a Path,
}

/// Artifacts by output name (`zstats`, `cluster_threshold`, `rendered_image_zf`, ...).
#[derive(Debug, Clone, Default)]
pub struct StatsOutputs {
    pub artifacts: BTreeMap<String, Vec<Artifact>>,
}

impl StatsOutputs {
    fn push(&mut self, name: &str, artifact: Artifact) {
        self.artifacts.entry(name.to_string()).or_default().push(artifact);
    }

    pub fn get(&self, name: &str) -> &[Artifact] {
        self.artifacts.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub fn flameo_command(inputs: &StatsInputs<'_>, log_dir: &Path) -> ToolCommand {
    let mut cmd = ToolCommand::new("flameo")
        .flag_path("--cope", inputs.merged)
        .flag_path("--mask", inputs.mask)
        .flag_path("--dm", &inputs.model.mat)
        .flag_path("--tc", &inputs.model.con)
        .flag_path("--cs", &inputs.model.grp);
    if let Some(ref fts) = inputs.model.fts {
        cmd = cmd.flag_path("--fc", fts);
    }
    cmd.arg("--runmode=ols").flag_path("--ld", log_dir)
}

/// Statistic images in a FLAME output directory, ordered by contrast number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatImages {
    pub zstats: Vec<PathBuf>,
    pub zfstats: Vec<PathBuf>,
    pub fstats: Vec<PathBuf>,
}

pub fn discover_stat_images(stats_dir: &Path) -> Result<StatImages> {
    let pattern = Regex::new(r"^(zstat|zfstat|fstat)(\d+)\.nii(\.gz)?$")?;
    let mut found: Vec<(String, u32, PathBuf)> = Vec::new();

    if !stats_dir.is_dir() {
        return Ok(StatImages::default());
    }

    for entry in std::fs::read_dir(stats_dir)
        .with_context(|| format!("Failed to list {}", stats_dir.display()))?
    {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(caps) = pattern.captures(&name) {
            let number = caps[2].parse::<u32>().unwrap_or(0);
            found.push((caps[1].to_string(), number, path));
        }
    }
    found.sort_by(|a, b| (a.1, &a.2).cmp(&(b.1, &b.2)));

    let mut images = StatImages::default();
    for (kind, _, path) in found {
        match kind.as_str() {
            "zstat" => images.zstats.push(path),
            "zfstat" => images.zfstats.push(path),
            _ => images.fstats.push(path),
        }
    }
    Ok(images)
}

/// Smoothness estimate from `smoothest`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Smoothness {
    pub dlh: f64,
    pub volume: u64,
}

pub fn parse_smoothest(output: &ToolOutput) -> Result<Smoothness, ExecError> {
    let mut dlh = None;
    let mut volume = None;
    for line in output.stdout.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("DLH"), Some(v)) => dlh = v.parse::<f64>().ok(),
            (Some("VOLUME"), Some(v)) => volume = v.parse::<u64>().ok(),
            _ => {}
        }
    }

    match (dlh, volume) {
        (Some(dlh), Some(volume)) => Ok(Smoothness { dlh, volume }),
        _ => Err(ExecError::Parse {
            tool: "smoothest".to_string(),
            detail: "missing DLH or VOLUME".to_string(),
        }),
    }
}

/// Upper end of the `fslstats -R` range.
pub fn parse_range_max(output: &ToolOutput) -> Result<f64, ExecError> {
    output
        .last_line()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| ExecError::Parse {
            tool: "fslstats".to_string(),
            detail: "expected '<min> <max>'".to_string(),
        })
}

/// Threshold, render, and collect one z-statistic image.
async fn threshold_zstat<R>(
    runner: &R,
    inputs: &StatsInputs<'_>,
    zstat: &Path,
    index: usize,
    suffix: &str,
    work_dir: &Path,
    outputs: &mut StatsOutputs,
) -> Result<()>
where
    R: CommandRunner + ?Sized,
{
    let stem = nifti_stem(zstat);
    let node = |name: &str| format!("_{}{}{}", name, suffix, index);
    let key = |name: &str| format!("{}{}", name, suffix);
    let mkdir = |name: &str| -> Result<PathBuf> {
        let dir = work_dir.join(node(name));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    };

    debug!("Thresholding {}", zstat.display());

    let smoothest = ToolCommand::new("smoothest")
        .arg("-z")
        .path_arg(zstat)
        .arg("-m")
        .path_arg(inputs.mask);
    mkdir("smoothest")?;
    let smoothness = parse_smoothest(&runner.run(&smoothest).await?)?;

    let cluster_dir = mkdir("cluster")?;
    let thresh = cluster_dir.join(format!("thresh_{}.nii.gz", stem));
    let cluster_index = cluster_dir.join(format!("cluster_mask_{}.nii.gz", stem));
    let localmax = cluster_dir.join(format!("{}_localmax.txt", stem));
    let cluster = ToolCommand::new("cluster")
        .flag_path("--in", zstat)
        .arg(format!("--thresh={}", inputs.z_threshold))
        .arg(format!("--pthresh={}", inputs.p_threshold))
        .arg(format!("--dlh={}", smoothness.dlh))
        .arg(format!("--volume={}", smoothness.volume))
        .flag_path("--othresh", &thresh)
        .flag_path("--oindex", &cluster_index)
        .flag_path("--olmax", &localmax)
        .arg("--mm")
        .output(&thresh)
        .output(&cluster_index)
        .output(&localmax);
    runner.run(&cluster).await?;

    mkdir("fslstats")?;
    let range = ToolCommand::new("fslstats").path_arg(&thresh).arg("-R");
    let max = parse_range_max(&runner.run(&range).await?)?;

    let overlay_dir = mkdir("overlay")?;
    let overlay_image = overlay_dir.join(format!("rendered_thresh_{}.nii.gz", stem));
    let overlay = ToolCommand::new("overlay")
        .args(["1", "0"])
        .path_arg(inputs.background)
        .arg("-a")
        .path_arg(&thresh)
        .arg(inputs.z_threshold.to_string())
        .arg(max.to_string())
        .path_arg(&overlay_image)
        .output(&overlay_image);
    runner.run(&overlay).await?;

    let slicer_dir = mkdir("slicer")?;
    let rendered = slicer_dir.join(format!("rendered_thresh_{}.png", stem));
    let slicer = ToolCommand::new("slicer")
        .path_arg(&overlay_image)
        .args(["-L", "-A", "750"])
        .path_arg(&rendered)
        .output(&rendered);
    runner.run(&slicer).await?;

    outputs.push(&key("cluster_threshold"), Artifact::new(thresh, &node("cluster")));
    outputs.push(&key("cluster_index"), Artifact::new(cluster_index, &node("cluster")));
    outputs.push(&key("cluster_localmax_txt"), Artifact::new(localmax, &node("cluster")));
    outputs.push(&key("overlay_threshold"), Artifact::new(overlay_image, &node("overlay")));
    outputs.push(&key("rendered_image"), Artifact::new(rendered, &node("slicer")));
    Ok(())
}

/// Run FLAME and threshold every resulting z-statistic in `work_dir`.
pub async fn run_second_level<R>(runner: &R, inputs: &StatsInputs<'_>, work_dir: &Path) -> Result<StatsOutputs>
where
    R: CommandRunner + ?Sized,
{
    let flameo_dir = work_dir.join("flameo");
    if flameo_dir.exists() {
        std::fs::remove_dir_all(&flameo_dir)
            .with_context(|| format!("Failed to clear {}", flameo_dir.display()))?;
    }
    std::fs::create_dir_all(&flameo_dir)
        .with_context(|| format!("Failed to create {}", flameo_dir.display()))?;

    let log_dir = flameo_dir.join("stats");
    info!("Running FLAME (OLS) on {}", inputs.merged.display());
    runner
        .run(&flameo_command(inputs, &log_dir))
        .await
        .context("flameo failed")?;

    let images = discover_stat_images(&log_dir)?;
    if images.zstats.is_empty() {
        warn!("flameo produced no z-statistic images in {}", log_dir.display());
    }

    let mut outputs = StatsOutputs::default();
    outputs.push("merged", Artifact::new(inputs.merged.to_path_buf(), ""));
    for (name, paths) in [
        ("zstats", &images.zstats),
        ("zfstats", &images.zfstats),
        ("fstats", &images.fstats),
    ] {
        for path in paths {
            outputs.push(name, Artifact::new(path.clone(), ""));
        }
    }

    for (i, zstat) in images.zstats.iter().enumerate() {
        threshold_zstat(runner, inputs, zstat, i, "", work_dir, &mut outputs)
            .await
            .with_context(|| format!("Thresholding failed for {}", zstat.display()))?;
    }
    if inputs.model.fts.is_some() {
        for (i, zfstat) in images.zfstats.iter().enumerate() {
            threshold_zstat(runner, inputs, zfstat, i, "_zf", work_dir, &mut outputs)
                .await
                .with_context(|| format!("Thresholding failed for {}", zfstat.display()))?;
        }
    }

    Ok(outputs)
}
