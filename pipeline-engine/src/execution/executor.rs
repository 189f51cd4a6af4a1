// Pipeline Scheduler
// Event-driven execution of a job-instance DAG with bounded concurrency

use crate::artifacts::{ArtifactBundle, ArtifactFiles, ArtifactStore, PathPatterns};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::PipelineGraph;
use crate::execution::state::{Resolution, RunState};
use crate::model::{ExpireIn, JobState, PipelineStatus};
use crate::runners::{JobRequest, JobRunner, MaterializedArtifacts, RunnerError};

use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

/// Configuration for pipeline execution
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Maximum concurrently running job instances (0 = unlimited)
    pub max_concurrent_jobs: usize,
    /// Per-job timeout (None = no timeout)
    pub job_timeout: Option<Duration>,
}

impl SchedulerConfig {
    pub fn with_capacity(mut self, max_concurrent_jobs: usize) -> Self {
        self.max_concurrent_jobs = max_concurrent_jobs;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }
}

/// Cancels a running pipeline from anywhere
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation; queued and waiting instances become `Canceled`
    /// and running ones are interrupted
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    fn reset(&self) {
        self.tx.send_replace(false);
    }
}

/// Final record for one job instance
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub state: JobState,
    pub stage: String,
    pub allow_failure: bool,
    /// Bundle committed after success, if the job declares artifacts
    pub artifacts: Option<ArtifactBundle>,
    pub exit_code: Option<i32>,
    /// Why the instance failed, was skipped or canceled
    pub reason: Option<String>,
    pub duration: Duration,
}

/// Result of pipeline execution
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub status: PipelineStatus,
    /// Outcomes by instance id, in graph order
    pub jobs: IndexMap<String, JobOutcome>,
    pub duration: Duration,
}

impl PipelineResult {
    /// Result for a pipeline the workflow gate declined to create
    pub fn skipped() -> Self {
        Self {
            status: PipelineStatus::Skipped,
            jobs: IndexMap::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn job(&self, id: &str) -> Option<&JobOutcome> {
        self.jobs.get(id)
    }

    pub fn state(&self, id: &str) -> Option<JobState> {
        self.job(id).map(|outcome| outcome.state)
    }
}

/// Upstream bundle to download before a job starts
struct Download {
    job_id: String,
    optional: bool,
    /// The upstream succeeded and declares artifacts, so a bundle must exist
    expected: bool,
}

/// Message from a finished job task back to the scheduler loop
struct Finished {
    index: usize,
    state: JobState,
    exit_code: Option<i32>,
    reason: Option<String>,
    bundle: Option<ArtifactBundle>,
    duration: Duration,
}

impl Finished {
    fn failed(index: usize, exit_code: Option<i32>, reason: String, duration: Duration) -> Self {
        Self {
            index,
            state: JobState::Failed,
            exit_code,
            reason: Some(reason),
            bundle: None,
            duration,
        }
    }
}

/// Aborts the wrapped task when dropped, so aborting the scheduler's task
/// also stops the job
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Pipeline scheduler
pub struct Scheduler {
    runner: Arc<dyn JobRunner>,
    store: Arc<dyn ArtifactStore>,
    config: SchedulerConfig,
    event_tx: Option<ProgressSender>,
    cancel: CancelHandle,
}

/// Bookkeeping for one `run` call
struct Run<'g> {
    graph: &'g PipelineGraph,
    state: RunState,
    outcomes: Vec<Option<JobOutcome>>,
    ready: VecDeque<usize>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn JobRunner>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            runner,
            store,
            config: SchedulerConfig::default(),
            event_tx: None,
            cancel: CancelHandle::new(),
        }
    }

    /// Set scheduler configuration
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Handle that cancels the active run, or the next one if none is
    /// running. Each run clears the request when it ends.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Execute every instance of `graph` and report the outcome
    pub async fn run(&self, graph: &PipelineGraph) -> PipelineResult {
        let start = Instant::now();
        let mut run = Run {
            graph,
            state: RunState::new(graph),
            outcomes: vec![None; graph.len()],
            ready: VecDeque::new(),
        };

        self.event_tx
            .send_event(ExecutionEvent::pipeline_started(graph.len()));
        tracing::info!(
            jobs = graph.len(),
            capacity = self.config.max_concurrent_jobs,
            "pipeline started"
        );

        let semaphore = (self.config.max_concurrent_jobs > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_concurrent_jobs)));
        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut cancel_rx = self.cancel.subscribe();
        let mut cancel_open = true;
        let mut canceled = *cancel_rx.borrow_and_update();

        if !canceled {
            for index in 0..graph.len() {
                if graph.instance(index).upstream.is_empty() {
                    self.settle(&mut run, index);
                }
            }
        }

        while !canceled {
            // Start runnable instances in FIFO order while capacity allows
            while let Some(&index) = run.ready.front() {
                let permit = match &semaphore {
                    Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    None => None,
                };
                run.ready.pop_front();
                self.launch(&mut run, index, permit, &mut tasks);
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                changed = cancel_rx.changed(), if cancel_open => {
                    match changed {
                        Ok(()) => canceled = *cancel_rx.borrow_and_update(),
                        Err(_) => cancel_open = false,
                    }
                }
                Some(joined) = tasks.join_next() => {
                    match joined {
                        Ok(finished) => self.complete(&mut run, finished),
                        Err(e) => tracing::error!(error = %e, "job task failed to join"),
                    }
                }
            }
        }

        if canceled {
            tasks.shutdown().await;
            self.cancel_remaining(&mut run);
        }

        let duration = start.elapsed();
        let result = self.finish(run, canceled, duration);
        self.cancel.reset();

        self.event_tx
            .send_event(ExecutionEvent::pipeline_completed(result.status, duration));
        tracing::info!(status = %result.status, ?duration, "pipeline completed");

        result
    }

    /// Decide the fate of an instance once its upstreams are all terminal,
    /// or earlier when a failed upstream already rules it out. Skips cascade
    /// downstream.
    fn settle(&self, run: &mut Run<'_>, index: usize) {
        let graph = run.graph;
        let mut pending = vec![index];

        while let Some(index) = pending.pop() {
            if !matches!(
                run.state.state(index),
                JobState::Pending | JobState::Blocked
            ) {
                continue;
            }

            let resolution = if run.state.is_ready(index) {
                run.state.resolve(graph, index)
            } else {
                match run.state.skip_early(graph, index) {
                    Some(resolution) => resolution,
                    None => continue,
                }
            };
            let instance = graph.instance(index);

            match resolution {
                Resolution::Run => {
                    let from = run.state.state(index);
                    run.state.set(index, JobState::Runnable);
                    run.ready.push_back(index);
                    self.event_tx.send_event(ExecutionEvent::state_changed(
                        &instance.id,
                        from,
                        JobState::Runnable,
                    ));
                }
                Resolution::Skip {
                    reason,
                    carries_failure,
                } => {
                    tracing::debug!(job = %instance.id, %reason, "job skipped");
                    run.state.finish(index, JobState::Skipped, carries_failure);
                    self.event_tx
                        .send_event(ExecutionEvent::job_skipped(&instance.id, &reason));
                    run.outcomes[index] = Some(JobOutcome {
                        state: JobState::Skipped,
                        stage: instance.stage.clone(),
                        allow_failure: instance.allow_failure,
                        artifacts: None,
                        exit_code: None,
                        reason: Some(reason),
                        duration: Duration::ZERO,
                    });

                    for &downstream in &instance.downstream {
                        run.state.upstream_finished(downstream);
                        pending.push(downstream);
                    }
                }
            }
        }
    }

    fn launch(
        &self,
        run: &mut Run<'_>,
        index: usize,
        permit: Option<OwnedSemaphorePermit>,
        tasks: &mut JoinSet<Finished>,
    ) {
        let graph = run.graph;
        let instance = graph.instance(index);

        let mut downloads: Vec<Download> = Vec::new();
        for edge in instance.upstream.iter().filter(|e| e.artifacts) {
            let upstream = graph.instance(edge.upstream);
            if downloads.iter().any(|d| d.job_id == upstream.id) {
                continue;
            }
            downloads.push(Download {
                job_id: upstream.id.clone(),
                optional: edge.optional,
                expected: run.state.state(edge.upstream) == JobState::Succeeded
                    && !upstream.artifact_paths.is_empty(),
            });
        }

        let mut variables = graph.variables().clone();
        variables.extend(instance.variables.clone());
        variables.insert("CI_JOB_NAME".to_string(), instance.id.clone());
        variables.insert("CI_JOB_STAGE".to_string(), instance.stage.clone());

        let request = JobRequest {
            job_id: instance.id.clone(),
            spec: instance.spec.clone(),
            stage: instance.stage.clone(),
            script_ref: instance.script_ref.clone(),
            artifact_paths: instance.artifact_paths.clone(),
            artifacts: MaterializedArtifacts::new(),
            variables,
        };

        let job = JobTask {
            index,
            request,
            downloads,
            expiry: instance.artifact_expiry,
            runner: self.runner.clone(),
            store: self.store.clone(),
            timeout: self.config.job_timeout,
        };

        tasks.spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let mut handle = AbortOnDrop(tokio::spawn(job.execute()));
            match (&mut handle.0).await {
                Ok(finished) => finished,
                Err(e) => Finished::failed(
                    index,
                    None,
                    format!("job task aborted: {}", e),
                    started.elapsed(),
                ),
            }
        });

        let from = run.state.state(index);
        run.state.set(index, JobState::Running);
        self.event_tx.send_event(ExecutionEvent::state_changed(
            &instance.id,
            from,
            JobState::Running,
        ));
        self.event_tx
            .send_event(ExecutionEvent::job_started(&instance.id, &instance.stage));
        tracing::debug!(job = %instance.id, stage = %instance.stage, "job started");
    }

    fn complete(&self, run: &mut Run<'_>, finished: Finished) {
        let graph = run.graph;
        let index = finished.index;
        let instance = graph.instance(index);
        let carries_failure = finished.state == JobState::Failed && !instance.allow_failure;

        run.state.finish(index, finished.state, carries_failure);

        if finished.state == JobState::Failed {
            tracing::warn!(
                job = %instance.id,
                allow_failure = instance.allow_failure,
                reason = finished.reason.as_deref().unwrap_or(""),
                "job failed"
            );
        } else {
            tracing::debug!(job = %instance.id, state = %finished.state, "job finished");
        }

        if let Some(bundle) = &finished.bundle {
            self.event_tx.send_event(ExecutionEvent::ArtifactsCommitted {
                job_id: instance.id.clone(),
                paths: bundle.paths.len(),
            });
        }
        self.event_tx.send_event(ExecutionEvent::job_completed(
            &instance.id,
            finished.state,
            finished.exit_code,
            finished.duration,
        ));

        run.outcomes[index] = Some(JobOutcome {
            state: finished.state,
            stage: instance.stage.clone(),
            allow_failure: instance.allow_failure,
            artifacts: finished.bundle,
            exit_code: finished.exit_code,
            reason: finished.reason,
            duration: finished.duration,
        });

        for &downstream in &instance.downstream {
            run.state.upstream_finished(downstream);
            self.settle(run, downstream);
        }
    }

    fn cancel_remaining(&self, run: &mut Run<'_>) {
        let graph = run.graph;
        for index in 0..graph.len() {
            if run.state.state(index).is_terminal() {
                continue;
            }

            let instance = graph.instance(index);
            run.state.finish(index, JobState::Canceled, false);
            self.event_tx
                .send_event(ExecutionEvent::job_canceled(&instance.id));
            run.outcomes[index] = Some(JobOutcome {
                state: JobState::Canceled,
                stage: instance.stage.clone(),
                allow_failure: instance.allow_failure,
                artifacts: None,
                exit_code: None,
                reason: Some("pipeline canceled".to_string()),
                duration: Duration::ZERO,
            });
        }
    }

    fn finish(&self, run: Run<'_>, canceled: bool, duration: Duration) -> PipelineResult {
        let graph = run.graph;
        let mut jobs = IndexMap::with_capacity(graph.len());
        let mut failed = false;

        for (index, outcome) in run.outcomes.into_iter().enumerate() {
            let instance = graph.instance(index);
            let outcome = outcome.unwrap_or_else(|| JobOutcome {
                state: run.state.state(index),
                stage: instance.stage.clone(),
                allow_failure: instance.allow_failure,
                artifacts: None,
                exit_code: None,
                reason: None,
                duration: Duration::ZERO,
            });

            if outcome.state == JobState::Failed && !outcome.allow_failure {
                failed = true;
            }
            jobs.insert(instance.id.clone(), outcome);
        }

        let status = if canceled {
            PipelineStatus::Canceled
        } else if failed {
            PipelineStatus::Failed
        } else {
            PipelineStatus::Succeeded
        };

        PipelineResult {
            status,
            jobs,
            duration,
        }
    }
}

/// Owned state of one job for its task
struct JobTask {
    index: usize,
    request: JobRequest,
    downloads: Vec<Download>,
    expiry: ExpireIn,
    runner: Arc<dyn JobRunner>,
    store: Arc<dyn ArtifactStore>,
    timeout: Option<Duration>,
}

impl JobTask {
    async fn execute(self) -> Finished {
        let started = Instant::now();
        let JobTask {
            index,
            mut request,
            downloads,
            expiry,
            runner,
            store,
            timeout,
        } = self;
        let job_id = request.job_id.clone();
        let artifact_paths = request.artifact_paths.clone();

        for download in downloads.into_iter().filter(|d| d.expected) {
            match store.fetch(&download.job_id).await {
                Ok(files) => request.artifacts.push(download.job_id, files),
                Err(e) if download.optional => {
                    tracing::debug!(job = %job_id, upstream = %download.job_id, error = %e, "optional artifacts unavailable");
                }
                Err(e) => {
                    return Finished::failed(
                        index,
                        None,
                        format!("artifacts of '{}' unavailable: {}", download.job_id, e),
                        started.elapsed(),
                    );
                }
            }
        }

        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, runner.run(request))
                .await
                .unwrap_or(Err(RunnerError::Timeout(limit))),
            None => runner.run(request).await,
        };

        let output = match result {
            Ok(output) if output.exit_code == 0 => output,
            Ok(output) => {
                return Finished::failed(
                    index,
                    Some(output.exit_code),
                    format!("exited with code {}", output.exit_code),
                    started.elapsed(),
                );
            }
            Err(e) => return Finished::failed(index, None, e.to_string(), started.elapsed()),
        };

        let bundle = if artifact_paths.is_empty() {
            None
        } else {
            let committed = match PathPatterns::new(&artifact_paths) {
                Ok(patterns) => {
                    let files: ArtifactFiles = output
                        .produced
                        .into_iter()
                        .filter(|(path, _)| patterns.matches(path))
                        .collect();
                    store
                        .put(&job_id, files, expiry)
                        .await
                        .map_err(|e| e.to_string())
                }
                Err(e) => Err(format!("invalid artifact path pattern: {}", e)),
            };

            match committed {
                Ok(bundle) => Some(bundle),
                Err(reason) => {
                    return Finished::failed(
                        index,
                        Some(0),
                        format!("failed to commit artifacts: {}", reason),
                        started.elapsed(),
                    );
                }
            }
        };

        Finished {
            index,
            state: JobState::Succeeded,
            exit_code: Some(0),
            reason: None,
            bundle,
            duration: started.elapsed(),
        }
    }
}
