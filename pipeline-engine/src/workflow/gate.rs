// Workflow Gate
// Decides from `workflow:rules` whether a pipeline is created for a trigger

use crate::expression::{ExpressionContext, ExpressionError};
use crate::model::{Rule, TriggerContext, When};
use crate::workflow::rules::first_match;

use indexmap::IndexMap;

/// Outcome of the workflow gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Create the pipeline; carries variables contributed by the matching rule
    Create { variables: IndexMap<String, String> },
    /// Do not create the pipeline
    Skip,
}

impl GateDecision {
    pub fn is_create(&self) -> bool {
        matches!(self, GateDecision::Create { .. })
    }
}

pub struct WorkflowGate;

impl WorkflowGate {
    /// Evaluate `rules` against the trigger's predefined variables.
    pub fn decide(rules: &[Rule], trigger: &TriggerContext) -> Result<GateDecision, ExpressionError> {
        let context = ExpressionContext::new(trigger.to_variables());
        Self::decide_with(rules, &context)
    }

    /// Evaluate `rules` against an explicit variable context.
    ///
    /// - empty rule list: create
    /// - first matching rule decides: `never` skips, anything else creates
    /// - rules present but none matched: skip
    pub fn decide_with(
        rules: &[Rule],
        context: &ExpressionContext,
    ) -> Result<GateDecision, ExpressionError> {
        if rules.is_empty() {
            return Ok(GateDecision::Create {
                variables: IndexMap::new(),
            });
        }

        let decision = match first_match(rules, context)? {
            Some(rule) if rule.when == Some(When::Never) => GateDecision::Skip,
            Some(rule) => GateDecision::Create {
                variables: rule.variables.clone(),
            },
            None => GateDecision::Skip,
        };

        tracing::debug!(create = decision.is_create(), rules = rules.len(), "workflow gate evaluated");

        Ok(decision)
    }
}
