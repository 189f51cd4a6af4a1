// Execution Events
// Progress reporting and event types for pipeline execution

use crate::model::{JobState, PipelineStatus};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Pipeline execution started
    PipelineStarted { total_jobs: usize },

    /// Pipeline execution completed
    PipelineCompleted {
        status: PipelineStatus,
        duration: Duration,
    },

    /// The workflow gate declined to create the pipeline
    PipelineSkipped,

    /// Instance moved between two non-terminal states
    JobStateChanged {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    /// Instance handed to the runner
    JobStarted { job_id: String, stage: String },

    /// Instance reached a terminal state after running
    JobCompleted {
        job_id: String,
        state: JobState,
        exit_code: Option<i32>,
        duration: Duration,
    },

    /// Instance reached a terminal state without running
    JobSkipped { job_id: String, reason: String },

    /// Instance was canceled
    JobCanceled { job_id: String },

    /// Bundle committed to the artifact store
    ArtifactsCommitted { job_id: String, paths: usize },

}

impl ExecutionEvent {
    pub fn pipeline_started(total_jobs: usize) -> Self {
        Self::PipelineStarted { total_jobs }
    }

    pub fn pipeline_completed(status: PipelineStatus, duration: Duration) -> Self {
        Self::PipelineCompleted { status, duration }
    }

    pub fn state_changed(job_id: impl Into<String>, from: JobState, to: JobState) -> Self {
        Self::JobStateChanged {
            job_id: job_id.into(),
            from,
            to,
        }
    }

    pub fn job_started(job_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self::JobStarted {
            job_id: job_id.into(),
            stage: stage.into(),
        }
    }

    pub fn job_completed(
        job_id: impl Into<String>,
        state: JobState,
        exit_code: Option<i32>,
        duration: Duration,
    ) -> Self {
        Self::JobCompleted {
            job_id: job_id.into(),
            state,
            exit_code,
            duration,
        }
    }

    pub fn job_skipped(job_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::JobSkipped {
            job_id: job_id.into(),
            reason: reason.into(),
        }
    }

    pub fn job_canceled(job_id: impl Into<String>) -> Self {
        Self::JobCanceled {
            job_id: job_id.into(),
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
