// Runners Module
// Execution collaborators that turn a job instance into an exit code and files

pub mod scripted;
pub mod shell;

// Re-export key types
pub use scripted::{ScriptedJob, ScriptedRunner};
pub use shell::{Shell, ShellConfig, ShellRunner};

use crate::artifacts::{ArtifactError, ArtifactFiles};

use indexmap::IndexMap;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors a runner reports instead of an exit code
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start job: {0}")]
    Spawn(#[source] io::Error),

    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("runner unavailable: {0}")]
    Unavailable(String),

    #[error("bad upstream artifact: {0}")]
    Artifact(#[from] ArtifactError),
}

/// Artifacts downloaded from upstream instances, in edge order
#[derive(Debug, Clone, Default)]
pub struct MaterializedArtifacts {
    bundles: Vec<(String, ArtifactFiles)>,
}

impl MaterializedArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job_id: impl Into<String>, files: ArtifactFiles) {
        self.bundles.push((job_id.into(), files));
    }

    /// Upstream job ids whose bundles were downloaded
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.bundles.iter().map(|(id, _)| id.as_str())
    }

    /// Bundle downloaded from one upstream
    pub fn from_job(&self, job_id: &str) -> Option<&ArtifactFiles> {
        self.bundles
            .iter()
            .find(|(id, _)| id == job_id)
            .map(|(_, files)| files)
    }

    /// All files merged into one tree; later upstreams win on conflicts
    pub fn merged(&self) -> ArtifactFiles {
        let mut merged = ArtifactFiles::new();
        for (_, files) in &self.bundles {
            merged.extend(files.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

/// Everything a runner needs to execute one job instance
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: String,
    /// Name of the job declaration
    pub spec: String,
    pub stage: String,
    pub script_ref: String,
    /// Declared `artifacts:paths`, so the runner knows what to collect
    pub artifact_paths: Vec<String>,
    pub artifacts: MaterializedArtifacts,
    pub variables: IndexMap<String, String>,
}

/// Result of running a job to completion
#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    pub exit_code: i32,
    /// Files left behind by the job, by relative path
    pub produced: ArtifactFiles,
    /// Captured console output
    pub log: String,
}

impl JobOutput {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.produced.insert(path.into(), data.into());
        self
    }
}

/// Executes job instances on behalf of the scheduler
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync {
    /// Run a job; exit code 0 means success
    async fn run(&self, request: JobRequest) -> Result<JobOutput, RunnerError>;
}
