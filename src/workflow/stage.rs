//! Ordered stage lists with declared input/output bindings.
//!
//! A [`StageList`] is a fixed sequence of external-tool steps. Each stage
//! names where every input comes from (a workflow input or an earlier
//! stage's output port), so dependency order is plain data that can be
//! validated and inspected without running anything.

use crate::exec::{CommandRunner, ExecError, ToolCommand};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Resolved file for each port. Workflow inputs use bare port names, stage
/// outputs use `stage.port`.
pub type PortMap = BTreeMap<String, PathBuf>;

/// Where a stage input comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A workflow input port.
    Input(String),
    /// An output port of an earlier stage.
    Stage { stage: String, port: String },
}

impl Source {
    fn key(&self) -> String {
        match self {
            Source::Input(port) => port.clone(),
            Source::Stage { stage, port } => format!("{}.{}", stage, port),
        }
    }
}

/// One input edge of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub port: String,
    pub source: Source,
}

impl Binding {
    /// Bind `port` to a workflow input.
    pub fn input(port: &str, input: &str) -> Self {
        Self {
            port: port.to_string(),
            source: Source::Input(input.to_string()),
        }
    }

    /// Bind `port` to `stage.output` of an earlier stage.
    pub fn from_stage(port: &str, stage: &str, output: &str) -> Self {
        Self {
            port: port.to_string(),
            source: Source::Stage {
                stage: stage.to_string(),
                port: output.to_string(),
            },
        }
    }
}

/// What a stage will run and which files fill its output ports.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub command: ToolCommand,
    pub outputs: PortMap,
}

/// Inputs and scratch directory handed to a stage's builder.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub stage: String,
    pub dir: PathBuf,
    pub inputs: PortMap,
}

impl StageContext {
    /// Resolved path of an input port.
    pub fn input(&self, port: &str) -> Result<&Path, WorkflowError> {
        self.inputs
            .get(port)
            .map(PathBuf::as_path)
            .ok_or_else(|| WorkflowError::MissingInput {
                stage: self.stage.clone(),
                port: port.to_string(),
            })
    }

    /// A file inside this stage's directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// A file inside this stage's directory named after an input's stem.
    pub fn derived(&self, port: &str, suffix: &str) -> Result<PathBuf, WorkflowError> {
        let stem = nifti_stem(self.input(port)?);
        Ok(self.file(&format!("{}{}", stem, suffix)))
    }
}

type Builder = Box<dyn Fn(&StageContext) -> Result<StagePlan, WorkflowError> + Send + Sync>;

/// A single step of a stage list.
pub struct Stage {
    pub name: String,
    pub inputs: Vec<Binding>,
    pub outputs: Vec<String>,
    /// Input port copied into the stage directory before the tool runs,
    /// for tools that rewrite their input in place.
    pub in_place: Option<String>,
    build: Builder,
}

impl Stage {
    pub fn new<F>(name: &str, inputs: Vec<Binding>, outputs: &[&str], build: F) -> Self
    where
        F: Fn(&StageContext) -> Result<StagePlan, WorkflowError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            inputs,
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            in_place: None,
            build: Box::new(build),
        }
    }

    /// Mark `port` as modified in place by the tool.
    pub fn in_place(mut self, port: &str) -> Self {
        self.in_place = Some(port.to_string());
        self
    }

    /// Build the plan for a context without running anything.
    pub fn plan(&self, ctx: &StageContext) -> Result<StagePlan, WorkflowError> {
        (self.build)(ctx)
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("in_place", &self.in_place)
            .finish()
    }
}

/// Errors raised while validating or executing a stage list.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage '{stage}' binds '{port}' to '{source_key}', which is not produced earlier")]
    UnknownSource {
        stage: String,
        port: String,
        source_key: String,
    },

    #[error("stage '{stage}' has no input '{port}'")]
    MissingInput { stage: String, port: String },

    #[error("stage '{stage}' did not resolve declared output '{port}'")]
    UndeclaredOutput { stage: String, port: String },

    #[error("filesystem error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: ExecError,
    },
}

/// A named, ordered list of stages.
#[derive(Debug)]
pub struct StageList {
    pub name: String,
    pub inputs: Vec<String>,
    pub stages: Vec<Stage>,
}

impl StageList {
    pub fn new(name: &str, inputs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            stages: Vec::new(),
        }
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    /// Stage names in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Check that every binding refers to a workflow input or an output of
    /// an earlier stage.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let mut available: HashSet<String> = self.inputs.iter().cloned().collect();
        let mut names = HashSet::new();

        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(WorkflowError::DuplicateStage(stage.name.clone()));
            }
            for binding in &stage.inputs {
                let key = binding.source.key();
                if !available.contains(&key) {
                    return Err(WorkflowError::UnknownSource {
                        stage: stage.name.clone(),
                        port: binding.port.clone(),
                        source_key: key,
                    });
                }
            }
            for port in &stage.outputs {
                available.insert(format!("{}.{}", stage.name, port));
            }
        }

        Ok(())
    }

    /// All stages `name` transitively depends on.
    pub fn upstream(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut pending = vec![name.to_string()];

        while let Some(current) = pending.pop() {
            let Some(stage) = self.stage(&current) else {
                continue;
            };
            for binding in &stage.inputs {
                if let Source::Stage { stage: dep, .. } = &binding.source {
                    if found.insert(dep.clone()) {
                        pending.push(dep.clone());
                    }
                }
            }
        }

        found
    }

    /// Run every stage in order under `work_dir`, each in its own directory.
    ///
    /// Returns every resolved port: the workflow inputs plus `stage.port`
    /// entries for all stage outputs.
    pub async fn run<R>(
        &self,
        runner: &R,
        inputs: &PortMap,
        work_dir: &Path,
    ) -> Result<PortMap, WorkflowError>
    where
        R: CommandRunner + ?Sized,
    {
        self.validate()?;
        info!("Running {} ({} stages)", self.name, self.stages.len());

        let mut resolved = inputs.clone();

        for stage in &self.stages {
            let dir = work_dir.join(&stage.name);
            fresh_dir(&dir)?;

            let mut ctx = StageContext {
                stage: stage.name.clone(),
                dir,
                inputs: PortMap::new(),
            };
            for binding in &stage.inputs {
                let key = binding.source.key();
                let path = resolved
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| WorkflowError::MissingInput {
                        stage: stage.name.clone(),
                        port: key.clone(),
                    })?;
                ctx.inputs.insert(binding.port.clone(), path);
            }

            if let Some(port) = &stage.in_place {
                let original = ctx.input(port)?.to_path_buf();
                let name = original.file_name().map(PathBuf::from).unwrap_or_default();
                let copy = ctx.dir.join(name);
                if runner.is_dry_run() && !original.exists() {
                    debug!("[{}] would copy {}", stage.name, original.display());
                } else {
                    std::fs::copy(&original, &copy).map_err(|source| WorkflowError::Io {
                        path: original.clone(),
                        source,
                    })?;
                }
                ctx.inputs.insert(port.clone(), copy);
            }

            let plan = stage.plan(&ctx)?;
            for port in &stage.outputs {
                if !plan.outputs.contains_key(port) {
                    return Err(WorkflowError::UndeclaredOutput {
                        stage: stage.name.clone(),
                        port: port.clone(),
                    });
                }
            }

            debug!("[{}] {}", stage.name, plan.command);
            runner
                .run(&plan.command)
                .await
                .map_err(|source| WorkflowError::Stage {
                    stage: stage.name.clone(),
                    source,
                })?;

            for (port, path) in plan.outputs {
                resolved.insert(format!("{}.{}", stage.name, port), path);
            }
        }

        Ok(resolved)
    }
}

/// Recreate a stage directory so reruns never see stale outputs.
fn fresh_dir(dir: &Path) -> Result<(), WorkflowError> {
    if dir.exists() {
        std::fs::remove_dir_all(dir).map_err(|source| WorkflowError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    std::fs::create_dir_all(dir).map_err(|source| WorkflowError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

/// File name without `.nii.gz` / `.nii` / other extension.
pub fn nifti_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for ext in [".nii.gz", ".nii", ".1D", ".png", ".txt"] {
        if let Some(stem) = name.strip_suffix(ext) {
            return stem.to_string();
        }
    }
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name,
    }
}
