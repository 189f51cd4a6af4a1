// Workflow Module
// Pipeline-level gating and the rule matching it shares with job rules

pub mod gate;
pub mod rules;

pub use gate::{GateDecision, WorkflowGate};
pub use rules::first_match;
