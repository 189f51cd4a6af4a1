// Pipeline Engine Library
// Dependency-aware CI pipelines: workflow gating, needs/stage DAG scheduling and artifact propagation

pub mod artifacts;
pub mod engine;
pub mod error;
pub mod execution;
pub mod expression;
pub mod model;
pub mod runners;
pub mod workflow;

// Re-export commonly used types
pub use engine::PipelineEngine;
pub use error::{EngineError, EngineResult};

// Re-export model types
pub use model::{
    ArtifactSpec, ExpireIn, JobSpec, JobState, MatrixEntry, Need, Parallel, PipelineSource,
    PipelineStatus, PipelineTemplate, Rule, TemplateError, TriggerContext, When,
};

// Re-export expression types
pub use expression::{ExpressionContext, ExpressionEngine, ExpressionError};

// Re-export workflow types
pub use workflow::{GateDecision, WorkflowGate};

// Re-export execution types
pub use execution::{
    progress_channel, CancelHandle, ExecutionEvent, GraphBuilder, GraphError, JobInstance,
    JobOutcome, PipelineGraph, PipelineResult, ProgressSender, Scheduler, SchedulerConfig,
};

// Re-export artifact types
pub use artifacts::{
    ArtifactBundle, ArtifactError, ArtifactFiles, ArtifactStore, FsArtifactStore,
    MemoryArtifactStore,
};

// Re-export runner types
pub use runners::{JobOutput, JobRequest, JobRunner, RunnerError, ScriptedRunner, ShellRunner};
