// Pipeline Graph Builder
// Turns a template plus trigger context into an immutable DAG of job instances

use crate::execution::matrix::{ExpansionError, MatrixExpander};
use crate::expression::{ExpressionContext, ExpressionError};
use crate::model::{ExpireIn, JobSpec, JobState, PipelineTemplate, TriggerContext, When};
use crate::workflow::first_match;

use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Error type for graph construction
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    #[error("circular dependency between jobs: {}", .jobs.join(", "))]
    CycleDetected { jobs: Vec<String> },

    #[error("job '{job}' cannot reference '{reference}': {reason}")]
    IllegalStageReference {
        job: String,
        reference: String,
        reason: String,
    },

    #[error("job '{job}' needs '{need}', which is not in the pipeline")]
    UnknownNeed { job: String, need: String },

    #[error("job '{job}' depends on undefined job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("job '{job}' uses stage '{stage}', which is not declared")]
    UnknownStage { job: String, stage: String },

    #[error("stage '{stage}' is declared more than once")]
    DuplicateStage { stage: String },

    #[error("more than one job instance is named '{id}'")]
    DuplicateInstance { id: String },

    #[error("job '{job}' has an invalid parallel declaration: {reason}")]
    InvalidParallel { job: String, reason: String },

    #[error("job '{job}' has an invalid rule")]
    InvalidRule {
        job: String,
        #[source]
        source: ExpressionError,
    },
}

/// Why an edge exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Declared with `needs:`
    Need,
    /// Implied by stage ordering
    Stage,
}

/// Upstream link of a job instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Index of the upstream instance in the graph
    pub upstream: usize,
    pub kind: EdgeKind,
    /// An unsuccessful upstream does not hold the downstream back
    pub optional: bool,
    /// Whether the downstream downloads the upstream's artifacts
    pub artifacts: bool,
}

/// A concrete unit of scheduling
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub id: String,
    /// Name of the job declaration this instance came from
    pub spec: String,
    pub stage: String,
    pub stage_index: usize,
    pub script_ref: String,
    pub when: When,
    pub allow_failure: bool,
    /// Job, rule and instance variables, in increasing precedence
    pub variables: IndexMap<String, String>,
    pub artifact_paths: Vec<String>,
    pub artifact_expiry: ExpireIn,
    pub upstream: Vec<Edge>,
    pub downstream: Vec<usize>,
}

impl JobInstance {
    /// State an instance starts in before the scheduler touches it
    pub fn initial_state(&self) -> JobState {
        if self.upstream.is_empty() {
            JobState::Pending
        } else {
            JobState::Blocked
        }
    }
}

/// Immutable DAG of job instances
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    stages: Vec<String>,
    instances: Vec<JobInstance>,
    index: HashMap<String, usize>,
    by_spec: IndexMap<String, Vec<usize>>,
    order: Vec<usize>,
    variables: IndexMap<String, String>,
}

impl PipelineGraph {
    /// Build with the default builder settings
    pub fn build(
        template: &PipelineTemplate,
        trigger: &TriggerContext,
    ) -> Result<Self, GraphError> {
        GraphBuilder::new(template, trigger).build()
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn instances(&self) -> &[JobInstance] {
        &self.instances
    }

    pub fn instance(&self, index: usize) -> &JobInstance {
        &self.instances[index]
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Pipeline-level variables (template, trigger and workflow variables)
    pub fn variables(&self) -> &IndexMap<String, String> {
        &self.variables
    }

    /// Index of an instance by id
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Look up an instance by id
    pub fn find(&self, id: &str) -> Option<&JobInstance> {
        self.position(id).map(|idx| &self.instances[idx])
    }

    /// All instances expanded from one job declaration
    pub fn instances_of(&self, spec: &str) -> Vec<&JobInstance> {
        self.by_spec
            .get(spec)
            .map(|indices| indices.iter().map(|&i| &self.instances[i]).collect())
            .unwrap_or_default()
    }

    /// Instances in an order where every upstream precedes its downstreams
    pub fn topological_order(&self) -> Vec<&JobInstance> {
        self.order.iter().map(|&i| &self.instances[i]).collect()
    }

    /// Group instances by longest upstream chain; instances in one level have
    /// no edges between them
    pub fn execution_levels(&self) -> Vec<Vec<&JobInstance>> {
        let mut levels: Vec<Vec<&JobInstance>> = Vec::new();
        let mut assigned = vec![0usize; self.instances.len()];

        for &idx in &self.order {
            let instance = &self.instances[idx];
            let level = instance
                .upstream
                .iter()
                .map(|edge| assigned[edge.upstream] + 1)
                .max()
                .unwrap_or(0);

            assigned[idx] = level;

            if level >= levels.len() {
                levels.resize(level + 1, Vec::new());
            }
            levels[level].push(instance);
        }

        levels
    }
}

/// Job declaration that survived rule evaluation
struct IncludedJob<'a> {
    spec: &'a JobSpec,
    stage_index: usize,
    when: When,
    allow_failure: bool,
    rule_variables: IndexMap<String, String>,
}

/// Builds a `PipelineGraph` from a template
pub struct GraphBuilder<'a> {
    template: &'a PipelineTemplate,
    context: ExpressionContext,
}

impl<'a> GraphBuilder<'a> {
    /// The rule context is the template's variables overlaid with the
    /// trigger's predefined variables.
    pub fn new(template: &'a PipelineTemplate, trigger: &TriggerContext) -> Self {
        let mut variables = template.variables.clone();
        variables.extend(trigger.to_variables());

        Self {
            template,
            context: ExpressionContext::new(variables),
        }
    }

    /// Add pipeline variables, e.g. those contributed by the workflow gate
    pub fn with_variables(mut self, variables: &IndexMap<String, String>) -> Self {
        self.context = self.context.extended(variables);
        self
    }

    pub fn build(&self) -> Result<PipelineGraph, GraphError> {
        let stages = self.template.stages();
        let stage_indices = Self::index_stages(&stages)?;

        // Stage membership is checked for every declaration, included or not
        for spec in self.template.jobs.values() {
            if !stage_indices.contains_key(spec.stage.as_str()) {
                return Err(GraphError::UnknownStage {
                    job: spec.name.clone(),
                    stage: spec.stage.clone(),
                });
            }
        }

        let included = self.evaluate_rules(&stage_indices)?;
        self.validate_references(&stage_indices, &included)?;

        // Expand instances
        let mut instances = Vec::new();
        let mut index = HashMap::new();
        let mut by_spec: IndexMap<String, Vec<usize>> = IndexMap::new();

        for job in included.values() {
            let expansion =
                MatrixExpander::expand(job.spec).map_err(|e: ExpansionError| {
                    GraphError::InvalidParallel {
                        job: job.spec.name.clone(),
                        reason: e.to_string(),
                    }
                })?;

            for expanded in expansion {
                let mut variables = job.spec.variables.clone();
                variables.extend(job.rule_variables.clone());
                variables.extend(expanded.variables);

                if index.contains_key(&expanded.name) {
                    return Err(GraphError::DuplicateInstance { id: expanded.name });
                }

                let position = instances.len();
                index.insert(expanded.name.clone(), position);
                by_spec
                    .entry(job.spec.name.clone())
                    .or_default()
                    .push(position);

                instances.push(JobInstance {
                    id: expanded.name,
                    spec: job.spec.name.clone(),
                    stage: job.spec.stage.clone(),
                    stage_index: job.stage_index,
                    script_ref: job.spec.script_ref.clone(),
                    when: job.when,
                    allow_failure: job.allow_failure,
                    variables,
                    artifact_paths: job.spec.artifact_paths().to_vec(),
                    artifact_expiry: job.spec.artifact_expiry(),
                    upstream: Vec::new(),
                    downstream: Vec::new(),
                });
            }
        }

        Self::connect(&mut instances, &included, &by_spec);
        let order = Self::topological_sort(&instances)?;

        tracing::debug!(
            instances = instances.len(),
            jobs = by_spec.len(),
            "pipeline graph built"
        );

        Ok(PipelineGraph {
            stages,
            instances,
            index,
            by_spec,
            order,
            variables: self.context.variables.clone(),
        })
    }

    fn index_stages(stages: &[String]) -> Result<HashMap<&str, usize>, GraphError> {
        let mut indices = HashMap::new();
        for (i, stage) in stages.iter().enumerate() {
            if indices.insert(stage.as_str(), i).is_some() {
                return Err(GraphError::DuplicateStage {
                    stage: stage.clone(),
                });
            }
        }
        Ok(indices)
    }

    /// Apply each job's `rules:`; first match wins, `never` or no match
    /// excludes the job
    fn evaluate_rules(
        &self,
        stage_indices: &HashMap<&str, usize>,
    ) -> Result<IndexMap<&'a str, IncludedJob<'a>>, GraphError> {
        let mut included = IndexMap::new();

        for spec in self.template.jobs.values() {
            let stage_index = stage_indices[spec.stage.as_str()];
            let mut job = IncludedJob {
                spec,
                stage_index,
                when: spec.when,
                allow_failure: spec.allow_failure,
                rule_variables: IndexMap::new(),
            };

            if !spec.rules.is_empty() {
                let context = self.context.extended(&spec.variables);
                let rule = first_match(&spec.rules, &context).map_err(|source| {
                    GraphError::InvalidRule {
                        job: spec.name.clone(),
                        source,
                    }
                })?;

                match rule {
                    None => {
                        tracing::debug!(job = %spec.name, "excluded: no rule matched");
                        continue;
                    }
                    Some(rule) if rule.when == Some(When::Never) => {
                        tracing::debug!(job = %spec.name, "excluded by rule");
                        continue;
                    }
                    Some(rule) => {
                        if let Some(when) = rule.when {
                            job.when = when;
                        }
                        if let Some(allow_failure) = rule.allow_failure {
                            job.allow_failure = allow_failure;
                        }
                        job.rule_variables = rule.variables.clone();
                    }
                }
            }

            if job.when == When::Never {
                continue;
            }

            included.insert(spec.name.as_str(), job);
        }

        Ok(included)
    }

    fn validate_references(
        &self,
        stage_indices: &HashMap<&str, usize>,
        included: &IndexMap<&str, IncludedJob<'_>>,
    ) -> Result<(), GraphError> {
        let stage_of = |name: &str| {
            self.template
                .jobs
                .get(name)
                .map(|spec| stage_indices[spec.stage.as_str()])
        };

        for job in included.values() {
            let name = &job.spec.name;

            for need in &job.spec.needs {
                if &need.job == name {
                    return Err(GraphError::CycleDetected {
                        jobs: vec![name.clone()],
                    });
                }

                match stage_of(&need.job) {
                    Some(stage) if stage > job.stage_index => {
                        return Err(GraphError::IllegalStageReference {
                            job: name.clone(),
                            reference: need.job.clone(),
                            reason: "needed job runs in a later stage".to_string(),
                        });
                    }
                    Some(_) if included.contains_key(need.job.as_str()) => {}
                    _ if need.optional => {}
                    _ => {
                        return Err(GraphError::UnknownNeed {
                            job: name.clone(),
                            need: need.job.clone(),
                        });
                    }
                }
            }

            // With `needs` present, `dependencies` play no part
            if !job.spec.needs.is_empty() {
                continue;
            }

            for dependency in job.spec.dependencies.iter().flatten() {
                match stage_of(dependency) {
                    None => {
                        return Err(GraphError::UnknownDependency {
                            job: name.clone(),
                            dependency: dependency.clone(),
                        });
                    }
                    Some(stage) if stage >= job.stage_index => {
                        return Err(GraphError::IllegalStageReference {
                            job: name.clone(),
                            reference: dependency.clone(),
                            reason: "dependencies must be in an earlier stage".to_string(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(())
    }

    /// Fill in upstream and downstream edges
    fn connect(
        instances: &mut [JobInstance],
        included: &IndexMap<&str, IncludedJob<'_>>,
        by_spec: &IndexMap<String, Vec<usize>>,
    ) {
        for position in 0..instances.len() {
            let job = &included[instances[position].spec.as_str()];
            let mut upstream = Vec::new();

            if !job.spec.needs.is_empty() {
                for need in &job.spec.needs {
                    // Optional needs on absent jobs have no instances
                    let Some(targets) = by_spec.get(&need.job) else {
                        continue;
                    };
                    upstream.extend(targets.iter().map(|&target| Edge {
                        upstream: target,
                        kind: EdgeKind::Need,
                        optional: need.optional,
                        artifacts: need.artifacts,
                    }));
                }
            } else {
                let wanted: Option<HashSet<&str>> = job
                    .spec
                    .dependencies
                    .as_ref()
                    .map(|deps| deps.iter().map(String::as_str).collect());

                for (target, candidate) in instances.iter().enumerate() {
                    if candidate.stage_index >= job.stage_index {
                        continue;
                    }
                    let artifacts = wanted
                        .as_ref()
                        .map_or(true, |w| w.contains(candidate.spec.as_str()));
                    upstream.push(Edge {
                        upstream: target,
                        kind: EdgeKind::Stage,
                        optional: false,
                        artifacts,
                    });
                }
            }

            instances[position].upstream = upstream;
        }

        for position in 0..instances.len() {
            let targets: Vec<usize> = instances[position]
                .upstream
                .iter()
                .map(|edge| edge.upstream)
                .collect();
            for target in targets {
                instances[target].downstream.push(position);
            }
        }
    }

    /// Kahn's algorithm; instances left with unresolved upstreams form cycles
    fn topological_sort(instances: &[JobInstance]) -> Result<Vec<usize>, GraphError> {
        let mut in_degree: Vec<usize> = instances.iter().map(|i| i.upstream.len()).collect();

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(idx, _)| idx)
            .collect();

        let mut order = Vec::with_capacity(instances.len());

        while let Some(idx) = queue.pop_front() {
            order.push(idx);

            for &next in &instances[idx].downstream {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() < instances.len() {
            let mut jobs: Vec<String> = Vec::new();
            for (idx, instance) in instances.iter().enumerate() {
                if in_degree[idx] > 0 && !jobs.contains(&instance.spec) {
                    jobs.push(instance.spec.clone());
                }
            }
            return Err(GraphError::CycleDetected { jobs });
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MatrixValue, Need, Rule};

    fn template(jobs: Vec<JobSpec>) -> PipelineTemplate {
        jobs.into_iter()
            .fold(PipelineTemplate::new(["build", "test", "deploy"]), |t, j| {
                t.job(j)
            })
    }

    fn build(jobs: Vec<JobSpec>) -> Result<PipelineGraph, GraphError> {
        PipelineGraph::build(&template(jobs), &TriggerContext::push("main"))
    }

    fn upstream_ids<'g>(graph: &'g PipelineGraph, id: &str) -> Vec<&'g str> {
        graph
            .find(id)
            .unwrap()
            .upstream
            .iter()
            .map(|e| graph.instance(e.upstream).id.as_str())
            .collect()
    }

    #[test]
    fn test_stage_edges() {
        let graph = build(vec![
            JobSpec::new("compile", "build"),
            JobSpec::new("unit", "test"),
            JobSpec::new("lint", "test"),
            JobSpec::new("ship", "deploy"),
        ])
        .unwrap();

        assert_eq!(upstream_ids(&graph, "compile"), Vec::<&str>::new());
        assert_eq!(upstream_ids(&graph, "unit"), vec!["compile"]);
        assert_eq!(upstream_ids(&graph, "ship"), vec!["compile", "unit", "lint"]);
        assert_eq!(graph.find("compile").unwrap().initial_state(), JobState::Pending);
        assert_eq!(graph.find("ship").unwrap().initial_state(), JobState::Blocked);
    }

    #[test]
    fn test_needs_replace_stage_edges() {
        let graph = build(vec![
            JobSpec::new("a", "build"),
            JobSpec::new("b", "build"),
            JobSpec::new("c", "test").needs(["a"]),
        ])
        .unwrap();

        let c = graph.find("c").unwrap();
        assert_eq!(upstream_ids(&graph, "c"), vec!["a"]);
        assert_eq!(c.upstream[0].kind, EdgeKind::Need);
        assert!(c.upstream[0].artifacts);
    }

    #[test]
    fn test_needs_within_same_stage() {
        let graph = build(vec![
            JobSpec::new("a", "test"),
            JobSpec::new("b", "test").needs(["a"]),
        ])
        .unwrap();

        let levels = graph.execution_levels();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0][0].id, "a");
        assert_eq!(levels[1][0].id, "b");
    }

    #[test]
    fn test_cycle_detected() {
        let err = build(vec![
            JobSpec::new("a", "test").needs(["b"]),
            JobSpec::new("b", "test").needs(["a"]),
            JobSpec::new("c", "build"),
        ])
        .unwrap_err();

        match err {
            GraphError::CycleDetected { jobs } => assert_eq!(jobs, vec!["a", "b"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_need_is_cycle() {
        let err = build(vec![JobSpec::new("a", "test").needs(["a"])]).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { jobs } if jobs == vec!["a"]));
    }

    #[test]
    fn test_illegal_stage_references() {
        let err = build(vec![
            JobSpec::new("a", "build").needs(["b"]),
            JobSpec::new("b", "test"),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::IllegalStageReference { .. }));

        let err = build(vec![
            JobSpec::new("a", "test"),
            JobSpec::new("b", "test").dependencies(["a"]),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::IllegalStageReference { .. }));
    }

    #[test]
    fn test_dependencies_ignored_when_needs_present() {
        let graph = build(vec![
            JobSpec::new("a", "test"),
            JobSpec::new("b", "test").needs(["a"]).dependencies(["a", "ghost"]),
        ])
        .unwrap();

        assert_eq!(upstream_ids(&graph, "b"), vec!["a"]);
        let b = graph.find("b").unwrap();
        assert!(b.upstream.iter().all(|e| e.kind == EdgeKind::Need && e.artifacts));
    }

    #[test]
    fn test_duplicate_instance_ids() {
        let mut first = IndexMap::new();
        first.insert("A".to_string(), MatrixValue::One("x".to_string()));
        let mut second = IndexMap::new();
        second.insert("B".to_string(), MatrixValue::One("x".to_string()));

        let err = build(vec![JobSpec::new("m", "test").matrix(vec![first, second])]).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateInstance { ref id } if id == "m: [x]"));

        let err = build(vec![
            JobSpec::new("rspec", "test").parallel(2),
            JobSpec::new("rspec 1/2", "test"),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateInstance { ref id } if id == "rspec 1/2"));
    }

    #[test]
    fn test_unknown_references() {
        let err = build(vec![JobSpec::new("a", "test").needs(["ghost"])]).unwrap_err();
        assert!(matches!(err, GraphError::UnknownNeed { .. }));

        let err = build(vec![JobSpec::new("a", "test").dependencies(["ghost"])]).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));

        let err = build(vec![JobSpec::new("a", "review")]).unwrap_err();
        assert!(matches!(err, GraphError::UnknownStage { .. }));
    }

    #[test]
    fn test_optional_need_on_absent_job_is_dropped() {
        let graph = build(vec![
            JobSpec::new("a", "build"),
            JobSpec::new("b", "test").needs([Need::new("a"), Need::new("ghost").optional()]),
        ])
        .unwrap();
        assert_eq!(upstream_ids(&graph, "b"), vec!["a"]);
    }

    #[test]
    fn test_duplicate_stage() {
        let template = PipelineTemplate::new(["build", "build"]);
        let err = PipelineGraph::build(&template, &TriggerContext::push("main")).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateStage { .. }));
    }

    #[test]
    fn test_dependencies_filter_artifacts() {
        let graph = build(vec![
            JobSpec::new("a", "build"),
            JobSpec::new("b", "build"),
            JobSpec::new("c", "test").dependencies(["b"]),
            JobSpec::new("d", "test").dependencies(Vec::<String>::new()),
        ])
        .unwrap();

        let c = graph.find("c").unwrap();
        assert_eq!(c.upstream.len(), 2);
        let carrying: Vec<_> = c
            .upstream
            .iter()
            .filter(|e| e.artifacts)
            .map(|e| graph.instance(e.upstream).id.as_str())
            .collect();
        assert_eq!(carrying, vec!["b"]);

        let d = graph.find("d").unwrap();
        assert_eq!(d.upstream.len(), 2);
        assert!(d.upstream.iter().all(|e| !e.artifacts));
    }

    #[test]
    fn test_parallel_instances_and_needs() {
        let mut entry = IndexMap::new();
        entry.insert(
            "OS".to_string(),
            MatrixValue::Many(vec!["linux".to_string(), "mac".to_string()]),
        );

        let graph = build(vec![
            JobSpec::new("compile", "build").matrix(vec![entry]),
            JobSpec::new("rspec", "test").parallel(2).needs(["compile"]),
        ])
        .unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.instances_of("compile").len(), 2);
        assert_eq!(
            upstream_ids(&graph, "rspec 2/2"),
            vec!["compile: [linux]", "compile: [mac]"]
        );
        assert_eq!(graph.find("compile: [mac]").unwrap().variables["OS"], "mac");
    }

    #[test]
    fn test_rules_exclude_jobs() {
        let graph = build(vec![
            JobSpec::new("always", "test"),
            JobSpec::new("tags_only", "test").rule(Rule::when_if("$CI_COMMIT_TAG", When::OnSuccess)),
            JobSpec::new("never", "test").rule(Rule::otherwise(When::Never)),
            JobSpec::new("manual_flaky", "test").rule(
                Rule::when_if(r#"$CI_COMMIT_BRANCH == "main""#, When::Always)
                    .with_allow_failure(true)
                    .with_variable("MODE", "strict"),
            ),
        ])
        .unwrap();

        assert!(graph.find("always").is_some());
        assert!(graph.find("tags_only").is_none());
        assert!(graph.find("never").is_none());

        let flaky = graph.find("manual_flaky").unwrap();
        assert_eq!(flaky.when, When::Always);
        assert!(flaky.allow_failure);
        assert_eq!(flaky.variables["MODE"], "strict");
    }

    #[test]
    fn test_need_on_excluded_job() {
        let excluded = JobSpec::new("a", "build").rule(Rule::otherwise(When::Never));

        let err = build(vec![excluded.clone(), JobSpec::new("b", "test").needs(["a"])]).unwrap_err();
        assert!(matches!(err, GraphError::UnknownNeed { .. }));

        let graph = build(vec![
            excluded,
            JobSpec::new("b", "test").needs([Need::new("a").optional()]),
        ])
        .unwrap();
        assert!(graph.find("b").unwrap().upstream.is_empty());
    }

    #[test]
    fn test_invalid_rule_is_error() {
        let err = build(vec![JobSpec::new("a", "test").rule(Rule::when_if("$A ==", When::Always))])
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidRule { .. }));
    }

    #[test]
    fn test_invalid_parallel() {
        let err = build(vec![JobSpec::new("a", "test").parallel(0)]).unwrap_err();
        assert!(matches!(err, GraphError::InvalidParallel { .. }));
    }

    #[test]
    fn test_build_is_idempotent() {
        let t = template(vec![
            JobSpec::new("a", "build").parallel(2),
            JobSpec::new("b", "test").needs(["a"]),
            JobSpec::new("c", "deploy"),
        ]);
        let trigger = TriggerContext::push("main");

        let first = PipelineGraph::build(&t, &trigger).unwrap();
        let second = PipelineGraph::build(&t, &trigger).unwrap();

        let shape = |g: &PipelineGraph| -> Vec<(String, Vec<usize>)> {
            g.instances()
                .iter()
                .map(|i| (i.id.clone(), i.upstream.iter().map(|e| e.upstream).collect()))
                .collect()
        };
        assert_eq!(shape(&first), shape(&second));
    }

    #[test]
    fn test_topological_order() {
        let graph = build(vec![
            JobSpec::new("c", "deploy"),
            JobSpec::new("b", "test").needs(["a"]),
            JobSpec::new("a", "build"),
        ])
        .unwrap();

        let order: Vec<_> = graph.topological_order().iter().map(|i| i.id.as_str()).collect();
        let pos = |id: &str| order.iter().position(|x| *x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }
}
