// Run Status Types
// Job instance states and aggregate pipeline status

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a job instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// No upstream; ready as soon as the run starts
    Pending,
    /// Waiting on upstream instances
    Blocked,
    /// Eligible to start, waiting for executor capacity
    Runnable,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped | JobState::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Blocked => "blocked",
            JobState::Runnable => "runnable",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
            JobState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate outcome of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    Failed,
    Canceled,
    /// Workflow rules decided not to create the pipeline
    Skipped,
}

impl PipelineStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineStatus::Succeeded)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStatus::Succeeded => "succeeded",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Canceled => "canceled",
            PipelineStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}
