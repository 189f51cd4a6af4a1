// Pipeline Data Model
// Static job declarations, templates, trigger context and run states

pub mod job;
pub mod status;
pub mod template;
pub mod trigger;

pub use job::{
    ArtifactSpec, ExpireIn, JobSpec, MatrixEntry, MatrixValue, Need, Parallel, Rule, When,
    DEFAULT_STAGE,
};
pub use status::{JobState, PipelineStatus};
pub use template::{PipelineTemplate, TemplateError, WorkflowSpec, DEFAULT_STAGES};
pub use trigger::{PipelineSource, TriggerContext};
