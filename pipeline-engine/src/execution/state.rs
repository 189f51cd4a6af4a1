// Run State
// Per-instance states and the rules deciding when a blocked instance may run

use crate::execution::graph::{EdgeKind, JobInstance, PipelineGraph};
use crate::model::{JobState, When};

/// What to do with an instance whose upstreams are all terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Run,
    Skip {
        reason: String,
        /// The skip stems from a failure and should trigger `on_failure` jobs
        carries_failure: bool,
    },
}

/// Mutable view of a run over an immutable graph
#[derive(Debug, Clone)]
pub struct RunState {
    states: Vec<JobState>,
    carries_failure: Vec<bool>,
    /// Upstreams of each instance that are not yet terminal
    waiting_on: Vec<usize>,
}

impl RunState {
    pub fn new(graph: &PipelineGraph) -> Self {
        let instances = graph.instances();
        Self {
            states: instances.iter().map(JobInstance::initial_state).collect(),
            carries_failure: vec![false; instances.len()],
            waiting_on: instances.iter().map(|i| i.upstream.len()).collect(),
        }
    }

    pub fn state(&self, index: usize) -> JobState {
        self.states[index]
    }

    pub fn states(&self) -> &[JobState] {
        &self.states
    }

    pub fn set(&mut self, index: usize, state: JobState) {
        self.states[index] = state;
    }

    /// Record a terminal state; `carries_failure` marks failures that
    /// propagate to downstream jobs
    pub fn finish(&mut self, index: usize, state: JobState, carries_failure: bool) {
        self.states[index] = state;
        self.carries_failure[index] = carries_failure;
    }

    pub fn carries_failure(&self, index: usize) -> bool {
        self.carries_failure[index]
    }

    /// Note that one upstream of `index` became terminal; returns true when
    /// none remain
    pub fn upstream_finished(&mut self, index: usize) -> bool {
        self.waiting_on[index] = self.waiting_on[index].saturating_sub(1);
        self.waiting_on[index] == 0
    }

    /// Every upstream of `index` is terminal
    pub fn is_ready(&self, index: usize) -> bool {
        self.waiting_on[index] == 0
    }

    pub fn is_finished(&self) -> bool {
        self.states.iter().all(JobState::is_terminal)
    }

    /// Decide an instance's fate from its upstreams' terminal states.
    ///
    /// An edge is satisfied when the upstream succeeded, failed with
    /// `allow_failure`, or the edge is optional. A stage edge is also
    /// satisfied by an upstream that was skipped without a failure behind
    /// it, such as an `on_failure` job in a green pipeline. A required edge
    /// to a failed upstream, or to one skipped because of a failure, counts
    /// as a failure for `on_failure` purposes.
    pub fn resolve(&self, graph: &PipelineGraph, index: usize) -> Resolution {
        let instance = graph.instance(index);
        let mut unsatisfied: Option<&str> = None;
        let mut failed = false;

        for edge in &instance.upstream {
            let upstream = graph.instance(edge.upstream);
            let satisfied = match self.states[edge.upstream] {
                JobState::Succeeded => true,
                JobState::Failed => upstream.allow_failure,
                JobState::Skipped => {
                    edge.kind == EdgeKind::Stage && !self.carries_failure[edge.upstream]
                }
                _ => false,
            };

            if satisfied || edge.optional {
                continue;
            }

            if self.carries_failure[edge.upstream] {
                failed = true;
            }
            unsatisfied.get_or_insert(upstream.id.as_str());
        }

        match instance.when {
            When::OnSuccess => match unsatisfied {
                None => Resolution::Run,
                Some(upstream) => Resolution::Skip {
                    reason: format!("upstream '{}' did not succeed", upstream),
                    carries_failure: failed,
                },
            },
            When::Always => Resolution::Run,
            When::OnFailure if failed => Resolution::Run,
            When::OnFailure => Resolution::Skip {
                reason: "no upstream failed".to_string(),
                carries_failure: false,
            },
            When::Never => Resolution::Skip {
                reason: "excluded".to_string(),
                carries_failure: false,
            },
        }
    }

    /// A blocked `on_success` instance is skipped as soon as a required
    /// upstream carries a failure, without waiting for its other upstreams
    pub fn skip_early(&self, graph: &PipelineGraph, index: usize) -> Option<Resolution> {
        let instance = graph.instance(index);
        if instance.when != When::OnSuccess || self.states[index] != JobState::Blocked {
            return None;
        }

        instance
            .upstream
            .iter()
            .find(|edge| !edge.optional && self.carries_failure[edge.upstream])
            .map(|edge| Resolution::Skip {
                reason: format!(
                    "upstream '{}' did not succeed",
                    graph.instance(edge.upstream).id
                ),
                carries_failure: true,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobSpec, Need, PipelineTemplate, TriggerContext};

    fn graph(jobs: Vec<JobSpec>) -> PipelineGraph {
        let template = jobs
            .into_iter()
            .fold(PipelineTemplate::new(["build", "test", "deploy"]), |t, j| {
                t.job(j)
            });
        PipelineGraph::build(&template, &TriggerContext::push("main")).unwrap()
    }

    fn idx(graph: &PipelineGraph, id: &str) -> usize {
        graph.position(id).unwrap()
    }

    #[test]
    fn test_initial_states() {
        let g = graph(vec![JobSpec::new("a", "build"), JobSpec::new("b", "test")]);
        let state = RunState::new(&g);
        assert_eq!(state.state(idx(&g, "a")), JobState::Pending);
        assert_eq!(state.state(idx(&g, "b")), JobState::Blocked);
        assert!(!state.is_finished());
    }

    #[test]
    fn test_on_success_after_failure_skips() {
        let g = graph(vec![JobSpec::new("a", "build"), JobSpec::new("b", "test")]);
        let mut state = RunState::new(&g);
        state.finish(idx(&g, "a"), JobState::Failed, true);

        match state.resolve(&g, idx(&g, "b")) {
            Resolution::Skip {
                carries_failure, ..
            } => assert!(carries_failure),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn test_allowed_failure_satisfies() {
        let g = graph(vec![
            JobSpec::new("a", "build").allow_failure(),
            JobSpec::new("b", "test"),
        ]);
        let mut state = RunState::new(&g);
        state.finish(idx(&g, "a"), JobState::Failed, false);
        assert_eq!(state.resolve(&g, idx(&g, "b")), Resolution::Run);
    }

    #[test]
    fn test_optional_need_tolerates_failure() {
        let g = graph(vec![
            JobSpec::new("a", "build"),
            JobSpec::new("b", "test").needs([Need::new("a").optional()]),
        ]);
        let mut state = RunState::new(&g);
        state.finish(idx(&g, "a"), JobState::Failed, true);
        assert_eq!(state.resolve(&g, idx(&g, "b")), Resolution::Run);
    }

    #[test]
    fn test_when_always_and_on_failure() {
        let g = graph(vec![
            JobSpec::new("a", "build"),
            JobSpec::new("cleanup", "deploy").when(When::Always),
            JobSpec::new("notify", "deploy").when(When::OnFailure),
        ]);

        let mut state = RunState::new(&g);
        state.finish(idx(&g, "a"), JobState::Succeeded, false);
        assert_eq!(state.resolve(&g, idx(&g, "cleanup")), Resolution::Run);
        assert!(matches!(
            state.resolve(&g, idx(&g, "notify")),
            Resolution::Skip { .. }
        ));

        state.finish(idx(&g, "a"), JobState::Failed, true);
        assert_eq!(state.resolve(&g, idx(&g, "cleanup")), Resolution::Run);
        assert_eq!(state.resolve(&g, idx(&g, "notify")), Resolution::Run);
    }

    #[test]
    fn test_failure_carried_through_skips() {
        let g = graph(vec![
            JobSpec::new("a", "build"),
            JobSpec::new("b", "test").needs(["a"]),
            JobSpec::new("c", "deploy").needs(["b"]).when(When::OnFailure),
        ]);
        let mut state = RunState::new(&g);
        state.finish(idx(&g, "a"), JobState::Failed, true);
        state.finish(idx(&g, "b"), JobState::Skipped, true);
        assert_eq!(state.resolve(&g, idx(&g, "c")), Resolution::Run);
    }

    #[test]
    fn test_quiet_skip_satisfies_stage_edge() {
        let g = graph(vec![
            JobSpec::new("notify", "test").when(When::OnFailure),
            JobSpec::new("ship", "deploy"),
            JobSpec::new("report", "deploy").needs(["notify"]),
        ]);
        let mut state = RunState::new(&g);
        state.finish(idx(&g, "notify"), JobState::Skipped, false);

        assert_eq!(state.resolve(&g, idx(&g, "ship")), Resolution::Run);
        assert!(matches!(
            state.resolve(&g, idx(&g, "report")),
            Resolution::Skip {
                carries_failure: false,
                ..
            }
        ));

        state.finish(idx(&g, "notify"), JobState::Skipped, true);
        assert!(matches!(
            state.resolve(&g, idx(&g, "ship")),
            Resolution::Skip {
                carries_failure: true,
                ..
            }
        ));
    }

    #[test]
    fn test_skip_early_on_required_failure() {
        let g = graph(vec![
            JobSpec::new("a", "build"),
            JobSpec::new("b", "build"),
            JobSpec::new("c", "test").needs(["a", "b"]),
            JobSpec::new("d", "test").needs([Need::new("a").optional(), Need::new("b")]),
            JobSpec::new("e", "test").needs(["a", "b"]).when(When::Always),
        ]);
        let mut state = RunState::new(&g);
        assert_eq!(state.skip_early(&g, idx(&g, "c")), None);

        state.finish(idx(&g, "a"), JobState::Failed, true);
        assert!(matches!(
            state.skip_early(&g, idx(&g, "c")),
            Some(Resolution::Skip {
                carries_failure: true,
                ..
            })
        ));
        assert_eq!(state.skip_early(&g, idx(&g, "d")), None);
        assert_eq!(state.skip_early(&g, idx(&g, "e")), None);
    }

    #[test]
    fn test_upstream_countdown() {
        let g = graph(vec![
            JobSpec::new("a", "build"),
            JobSpec::new("b", "build"),
            JobSpec::new("c", "test"),
        ]);
        let mut state = RunState::new(&g);
        let c = idx(&g, "c");
        assert!(!state.upstream_finished(c));
        assert!(state.upstream_finished(c));
    }
}
