// Pipeline Engine
// Gate, build and run a pipeline template for one trigger

use crate::artifacts::ArtifactStore;
use crate::error::EngineResult;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::{
    CancelHandle, GraphBuilder, PipelineGraph, PipelineResult, Scheduler, SchedulerConfig,
};
use crate::expression::ExpressionContext;
use crate::model::{PipelineTemplate, TriggerContext};
use crate::runners::JobRunner;
use crate::workflow::{GateDecision, WorkflowGate};

use std::sync::Arc;

/// Entry point composing the workflow gate, graph builder and scheduler
pub struct PipelineEngine {
    scheduler: Scheduler,
    event_tx: Option<ProgressSender>,
}

impl PipelineEngine {
    pub fn new(runner: Arc<dyn JobRunner>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            scheduler: Scheduler::new(runner, store),
            event_tx: None,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = self.scheduler.with_config(config);
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.scheduler = self.scheduler.with_progress(tx.clone());
        self.event_tx = Some(tx);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.scheduler.cancel_handle()
    }

    /// Decide whether the trigger creates a pipeline and, if so, build its
    /// graph. `None` means the workflow gate skipped the pipeline.
    pub fn plan(
        template: &PipelineTemplate,
        trigger: &TriggerContext,
    ) -> EngineResult<Option<PipelineGraph>> {
        let context =
            ExpressionContext::new(template.variables.clone()).extended(&trigger.to_variables());

        match WorkflowGate::decide_with(&template.workflow.rules, &context)? {
            GateDecision::Skip => Ok(None),
            GateDecision::Create { variables } => {
                let graph = GraphBuilder::new(template, trigger)
                    .with_variables(&variables)
                    .build()?;
                Ok(Some(graph))
            }
        }
    }

    /// Run `template` for `trigger`.
    ///
    /// Template and graph errors are returned before any job starts. A
    /// pipeline the gate declines, or whose rules exclude every job, is
    /// reported as `Skipped`.
    pub async fn run(
        &self,
        template: &PipelineTemplate,
        trigger: &TriggerContext,
    ) -> EngineResult<PipelineResult> {
        let graph = match Self::plan(template, trigger)? {
            Some(graph) if !graph.is_empty() => graph,
            Some(_) => {
                tracing::info!("no jobs left after rules, pipeline skipped");
                self.event_tx.send_event(ExecutionEvent::PipelineSkipped);
                return Ok(PipelineResult::skipped());
            }
            None => {
                tracing::info!(source = %trigger.source, "workflow rules skipped pipeline");
                self.event_tx.send_event(ExecutionEvent::PipelineSkipped);
                return Ok(PipelineResult::skipped());
            }
        };

        Ok(self.scheduler.run(&graph).await)
    }

    /// Parse a YAML template and run it
    pub async fn run_yaml(&self, source: &str, trigger: &TriggerContext) -> EngineResult<PipelineResult> {
        let template = PipelineTemplate::from_yaml_str(source)?;
        self.run(&template, trigger).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MemoryArtifactStore;
    use crate::error::EngineError;
    use crate::execution::{progress_channel, GraphError};
    use crate::model::{JobState, PipelineStatus};
    use crate::runners::{ScriptedJob, ScriptedRunner};

    const PIPELINE: &str = r#"
stages: [build, test, deploy]
workflow:
  rules:
    - if: $CI_COMMIT_BRANCH == "main"
      variables:
        DEPLOY_ENV: production
    - if: $CI_COMMIT_BRANCH =~ /^feature\//
    - when: never
compile:
  stage: build
  script: cargo build
  artifacts:
    paths: [target/]
unit:
  stage: test
  needs: [compile]
  script: cargo test
ship:
  stage: deploy
  script: ./deploy.sh
  rules:
    - if: $DEPLOY_ENV == "production"
"#;

    fn engine(runner: &ScriptedRunner) -> PipelineEngine {
        PipelineEngine::new(
            Arc::new(runner.clone()),
            Arc::new(MemoryArtifactStore::new()),
        )
    }

    #[tokio::test]
    async fn test_main_branch_runs_everything() {
        let runner = ScriptedRunner::new().on(
            "compile",
            ScriptedJob::succeed().produce("target/app", "bin"),
        );
        let result = engine(&runner)
            .run_yaml(PIPELINE, &TriggerContext::push("main"))
            .await
            .unwrap();

        assert_eq!(result.status, PipelineStatus::Succeeded);
        assert_eq!(runner.started(), vec!["compile", "unit", "ship"]);

        let unit = runner.request_for("unit").unwrap();
        assert_eq!(unit.artifacts.merged()["target/app"], b"bin");
        assert_eq!(unit.variables["DEPLOY_ENV"], "production");
    }

    #[tokio::test]
    async fn test_feature_branch_excludes_deploy() {
        let runner = ScriptedRunner::new();
        let result = engine(&runner)
            .run_yaml(PIPELINE, &TriggerContext::push("feature/login"))
            .await
            .unwrap();

        assert_eq!(result.status, PipelineStatus::Succeeded);
        assert!(result.job("ship").is_none());
        assert_eq!(runner.started(), vec!["compile", "unit"]);
    }

    #[tokio::test]
    async fn test_gate_skips_pipeline() {
        let runner = ScriptedRunner::new();
        let (tx, mut rx) = progress_channel();
        let result = engine(&runner)
            .with_progress(tx)
            .run_yaml(PIPELINE, &TriggerContext::push("dev"))
            .await
            .unwrap();

        assert_eq!(result.status, PipelineStatus::Skipped);
        assert!(result.jobs.is_empty());
        assert!(runner.started().is_empty());
        assert!(matches!(rx.try_recv(), Ok(ExecutionEvent::PipelineSkipped)));
    }

    #[tokio::test]
    async fn test_all_jobs_excluded_is_skipped() {
        let runner = ScriptedRunner::new();
        let result = engine(&runner)
            .run_yaml(
                r#"
docs:
  script: make docs
  rules:
    - if: $CI_COMMIT_TAG
"#,
                &TriggerContext::push("main"),
            )
            .await
            .unwrap();

        assert_eq!(result.status, PipelineStatus::Skipped);
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_running() {
        let runner = ScriptedRunner::new();
        let err = engine(&runner)
            .run_yaml(
                r#"
stages: [test]
a:
  stage: test
  needs: [b]
b:
  stage: test
  needs: [a]
"#,
                &TriggerContext::push("main"),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Graph(GraphError::CycleDetected { .. })
        ));
        assert!(runner.started().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_template() {
        let runner = ScriptedRunner::new();
        let err = engine(&runner)
            .run_yaml("- not\n- a mapping\n", &TriggerContext::push("main"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Template(_)));
    }

    #[tokio::test]
    async fn test_invalid_workflow_rule() {
        let runner = ScriptedRunner::new();
        let err = engine(&runner)
            .run_yaml(
                r#"
workflow:
  rules:
    - if: $CI_COMMIT_BRANCH ==
job:
  script: "true"
"#,
                &TriggerContext::push("main"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Expression(_)));
    }

    #[tokio::test]
    async fn test_failure_reported() {
        let runner = ScriptedRunner::new().on("unit", ScriptedJob::fail(101));
        let result = engine(&runner)
            .run_yaml(PIPELINE, &TriggerContext::push("main"))
            .await
            .unwrap();

        assert_eq!(result.status, PipelineStatus::Failed);
        assert_eq!(result.state("unit"), Some(JobState::Failed));
        assert_eq!(result.state("ship"), Some(JobState::Skipped));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let template = PipelineTemplate::from_yaml_str(PIPELINE).unwrap();
        let trigger = TriggerContext::push("main");

        let first = PipelineEngine::plan(&template, &trigger).unwrap().unwrap();
        let second = PipelineEngine::plan(&template, &trigger).unwrap().unwrap();

        let ids = |g: &PipelineGraph| g.instances().iter().map(|i| i.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        let order = |g: &PipelineGraph| {
            g.topological_order()
                .iter()
                .map(|i| i.id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(order(&first), order(&second));
    }
}
