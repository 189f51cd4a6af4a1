// Scripted Runner
// Canned job behaviour for dry runs and pipeline tests

use crate::runners::{JobOutput, JobRequest, JobRunner, RunnerError};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Behaviour of one scripted job
#[derive(Debug, Clone, Default)]
pub struct ScriptedJob {
    exit_code: i32,
    delay: Option<Duration>,
    files: Vec<(String, Vec<u8>)>,
    error: Option<String>,
}

impl ScriptedJob {
    pub fn succeed() -> Self {
        Self::default()
    }

    pub fn fail(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Default::default()
        }
    }

    /// Report a runner error instead of an exit code
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn produce(mut self, path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.into(), data.into()));
        self
    }
}

/// Runner that looks up each job by instance id, then by declaration name,
/// and replays the configured behaviour. Unknown jobs succeed.
///
/// Every request is recorded so tests can inspect what ran, in which order,
/// and with which inputs.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    jobs: HashMap<String, ScriptedJob>,
    requests: Arc<Mutex<Vec<JobRequest>>>,
    finished: Arc<Mutex<Vec<String>>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, job: impl Into<String>, behaviour: ScriptedJob) -> Self {
        self.jobs.insert(job.into(), behaviour);
        self
    }

    /// Requests in the order jobs started
    pub fn requests(&self) -> Vec<JobRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Job ids in the order they started
    pub fn started(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.job_id).collect()
    }

    /// Job ids in the order they finished
    pub fn finished(&self) -> Vec<String> {
        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Request a job was started with
    pub fn request_for(&self, job_id: &str) -> Option<JobRequest> {
        self.requests().into_iter().find(|r| r.job_id == job_id)
    }

    /// Highest number of jobs that were running at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Decrements the running counter even when the job future is dropped
struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl JobRunner for ScriptedRunner {
    async fn run(&self, request: JobRequest) -> Result<JobOutput, RunnerError> {
        let behaviour = self
            .jobs
            .get(&request.job_id)
            .or_else(|| self.jobs.get(&request.spec))
            .cloned()
            .unwrap_or_default();
        let job_id = request.job_id.clone();

        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        if let Some(delay) = behaviour.delay {
            tokio::time::sleep(delay).await;
        }

        self.finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job_id);

        if let Some(message) = behaviour.error {
            return Err(RunnerError::Unavailable(message));
        }

        let mut output = JobOutput::exit(behaviour.exit_code);
        output.produced.extend(behaviour.files);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::MaterializedArtifacts;
    use indexmap::IndexMap;

    fn request(id: &str, spec: &str) -> JobRequest {
        JobRequest {
            job_id: id.to_string(),
            spec: spec.to_string(),
            stage: "test".to_string(),
            script_ref: String::new(),
            artifact_paths: Vec::new(),
            artifacts: MaterializedArtifacts::new(),
            variables: IndexMap::new(),
        }
    }

    #[tokio::test]
    async fn test_lookup_by_id_then_spec() {
        let runner = ScriptedRunner::new()
            .on("rspec", ScriptedJob::fail(1))
            .on("rspec 2/2", ScriptedJob::succeed().produce("out", "x"));

        let first = runner.run(request("rspec 1/2", "rspec")).await.unwrap();
        assert_eq!(first.exit_code, 1);

        let second = runner.run(request("rspec 2/2", "rspec")).await.unwrap();
        assert_eq!(second.exit_code, 0);
        assert_eq!(second.produced["out"], b"x");

        let unknown = runner.run(request("lint", "lint")).await.unwrap();
        assert_eq!(unknown.exit_code, 0);

        assert_eq!(runner.started(), vec!["rspec 1/2", "rspec 2/2", "lint"]);
        assert_eq!(runner.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_runner_error() {
        let runner = ScriptedRunner::new().on("deploy", ScriptedJob::error("no credentials"));
        let err = runner.run(request("deploy", "deploy")).await.unwrap_err();
        assert!(matches!(err, RunnerError::Unavailable(_)));
    }
}
