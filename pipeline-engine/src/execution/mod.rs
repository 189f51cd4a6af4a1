// Execution Module
// Graph construction, matrix expansion, run state and scheduling

pub mod events;
pub mod executor;
pub mod graph;
pub mod matrix;
pub mod state;

// Re-export key types
pub use events::{progress_channel, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use executor::{CancelHandle, JobOutcome, PipelineResult, Scheduler, SchedulerConfig};
pub use graph::{Edge, EdgeKind, GraphBuilder, GraphError, JobInstance, PipelineGraph};
pub use matrix::{ExpansionError, MatrixExpander, MatrixInstance};
pub use state::{Resolution, RunState};
