// Engine Errors
// Build-time failures surfaced by the pipeline engine entry point

use crate::execution::GraphError;
use crate::expression::ExpressionError;
use crate::model::TemplateError;

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that abort a pipeline before any job runs
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid pipeline template: {0}")]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}
