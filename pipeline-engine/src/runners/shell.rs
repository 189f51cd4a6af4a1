// Shell Runner
// Executes a job's script through a shell in a per-job working directory

use crate::artifacts::fs::{encode_job_id, validate_relative};
use crate::artifacts::{ArtifactFiles, PathPatterns};
use crate::runners::{JobOutput, JobRequest, JobRunner, RunnerError};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Shell types supported by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shell {
    /// Default shell (sh on Unix, cmd on Windows)
    #[default]
    Default,
    /// Bash shell
    Bash,
}

impl Shell {
    /// Get the shell executable and arguments
    fn get_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    ("cmd", &["/C"])
                } else {
                    ("sh", &["-c"])
                }
            }
            Shell::Bash => ("bash", &["-c"]),
        }
    }
}

/// Configuration for shell execution
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub shell: Shell,
    /// Parent of the per-job working directories
    pub workspace_root: PathBuf,
    /// Keep job directories after the run (useful for debugging)
    pub keep_workspace: bool,
    /// Timeout (None = no timeout)
    pub timeout: Option<Duration>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: Shell::Default,
            workspace_root: std::env::temp_dir().join("pipeline-engine").join("jobs"),
            keep_workspace: false,
            timeout: None,
        }
    }
}

/// Runs `script_ref` as a shell script
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    config: ShellConfig,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ShellConfig) -> Self {
        Self { config }
    }

    pub fn with_workspace_root(mut self, root: impl AsRef<Path>) -> Self {
        self.config.workspace_root = root.as_ref().to_path_buf();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn with_shell(mut self, shell: Shell) -> Self {
        self.config.shell = shell;
        self
    }

    /// Whether the configured shell can be found on PATH
    pub fn is_available(&self) -> bool {
        let (program, _) = self.config.shell.get_command();
        which::which(program).is_ok()
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.config.workspace_root.join(encode_job_id(job_id))
    }

    async fn run_in(&self, dir: &Path, request: &JobRequest) -> Result<JobOutput, RunnerError> {
        write_files(dir, &request.artifacts.merged())?;

        let (shell_cmd, shell_args) = self.config.shell.get_command();

        let mut cmd = Command::new(shell_cmd);
        cmd.args(shell_args);
        cmd.arg(&request.script_ref);
        cmd.current_dir(dir);
        cmd.envs(&request.variables);
        cmd.env("CI_JOB_NAME", &request.job_id);
        cmd.env("CI_JOB_STAGE", &request.stage);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Dropping the future (cancellation) must not leave the process behind
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(RunnerError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Spawn(io::Error::other("stdout was not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Spawn(io::Error::other("stderr was not captured")))?;

        let stdout_handle = tokio::spawn(collect_lines(BufReader::new(stdout)));
        let stderr_handle = tokio::spawn(collect_lines(BufReader::new(stderr)));

        // Wait for completion with optional timeout
        let status = if let Some(timeout) = self.config.timeout {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(result) => result?,
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(RunnerError::Timeout(timeout));
                }
            }
        } else {
            child.wait().await?
        };

        let stdout = stdout_handle.await.unwrap_or_default();
        let stderr = stderr_handle.await.unwrap_or_default();

        let mut log = stdout;
        if !stderr.is_empty() {
            if !log.is_empty() {
                log.push('\n');
            }
            log.push_str(&stderr);
        }

        // Killed by a signal: no code
        let exit_code = status.code().unwrap_or(-1);

        let produced = if exit_code == 0 && !request.artifact_paths.is_empty() {
            let patterns = PathPatterns::new(&request.artifact_paths).map_err(|e| {
                RunnerError::Io(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
            })?;
            collect_files(dir, &patterns)?
        } else {
            ArtifactFiles::new()
        };

        Ok(JobOutput {
            exit_code,
            produced,
            log,
        })
    }
}

#[async_trait::async_trait]
impl JobRunner for ShellRunner {
    async fn run(&self, request: JobRequest) -> Result<JobOutput, RunnerError> {
        let dir = self.job_dir(&request.job_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        tracing::debug!(job = %request.job_id, dir = %dir.display(), "running shell job");
        let result = self.run_in(&dir, &request).await;

        if !self.config.keep_workspace {
            if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::warn!(job = %request.job_id, error = %e, "failed to clean job directory");
            }
        }

        result
    }
}

async fn collect_lines<R>(reader: BufReader<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    let mut output = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&line);
    }
    output
}

/// Materialize upstream files; paths must stay inside `dir`
fn write_files(dir: &Path, files: &ArtifactFiles) -> Result<(), RunnerError> {
    for (path, data) in files {
        validate_relative(path)?;
        let target = dir.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, data)?;
    }
    Ok(())
}

/// Files under `dir` matching `patterns`, keyed by `/`-separated relative path
fn collect_files(dir: &Path, patterns: &PathPatterns) -> io::Result<ArtifactFiles> {
    let mut files = ArtifactFiles::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }

            let Ok(relative) = path.strip_prefix(dir) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if patterns.matches(&key) {
                files.insert(key, fs::read(&path)?);
            }
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::MaterializedArtifacts;
    use indexmap::IndexMap;
    use tempfile::TempDir;

    fn request(id: &str, script: &str) -> JobRequest {
        JobRequest {
            job_id: id.to_string(),
            spec: id.to_string(),
            stage: "test".to_string(),
            script_ref: script.to_string(),
            artifact_paths: Vec::new(),
            artifacts: MaterializedArtifacts::new(),
            variables: IndexMap::new(),
        }
    }

    fn runner(tmp: &TempDir) -> ShellRunner {
        ShellRunner::new().with_workspace_root(tmp.path())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_runner_echo() {
        let tmp = TempDir::new().unwrap();
        let output = runner(&tmp).run(request("echo", "echo hello")).await.unwrap();

        assert_eq!(output.exit_code, 0);
        assert!(output.log.contains("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_runner_exit_code() {
        let tmp = TempDir::new().unwrap();
        let output = runner(&tmp).run(request("fail", "exit 42")).await.unwrap();
        assert_eq!(output.exit_code, 42);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_variables_become_env() {
        let tmp = TempDir::new().unwrap();
        let mut req = request("env", "echo \"$TARGET on $CI_JOB_NAME\"");
        req.variables.insert("TARGET".to_string(), "linux".to_string());

        let output = runner(&tmp).run(req).await.unwrap();
        assert!(output.log.contains("linux on env"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_artifacts_in_and_out() {
        let tmp = TempDir::new().unwrap();
        let mut upstream = ArtifactFiles::new();
        upstream.insert("bin/app".to_string(), b"v1".to_vec());

        let mut req = request(
            "package",
            "mkdir -p dist && cat bin/app > dist/app.txt && echo extra > notes.txt",
        );
        req.artifacts.push("compile", upstream);
        req.artifact_paths = vec!["dist/".to_string()];

        let output = runner(&tmp).run(req).await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.produced.len(), 1);
        assert_eq!(output.produced["dist/app.txt"], b"v1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_job_collects_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut req = request("broken", "echo x > out.txt; exit 1");
        req.artifact_paths = vec!["out.txt".to_string()];

        let output = runner(&tmp).run(req).await.unwrap();
        assert_eq!(output.exit_code, 1);
        assert!(output.produced.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let tmp = TempDir::new().unwrap();
        let err = runner(&tmp)
            .with_timeout(Duration::from_millis(100))
            .run(request("slow", "sleep 5"))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_workspace_is_removed() {
        let tmp = TempDir::new().unwrap();
        runner(&tmp).run(request("clean me", "true")).await.unwrap();
        assert!(!tmp.path().join("clean%20me").exists());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_job_dirs_are_distinct() {
        let runner = ShellRunner::new();
        assert_ne!(runner.job_dir("a b"), runner.job_dir("a_b"));
        assert_ne!(runner.job_dir("rspec 1/2"), runner.job_dir("rspec_1_2"));
        assert_eq!(
            runner.job_dir("rspec 1/2").parent(),
            Some(runner.config.workspace_root.as_path())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_upstream_paths_cannot_escape_workspace() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("jobs");
        let mut upstream = ArtifactFiles::new();
        upstream.insert("../escaped.txt".to_string(), b"x".to_vec());

        let mut req = request("consumer", "true");
        req.artifacts.push("producer", upstream);

        let err = ShellRunner::new()
            .with_workspace_root(&root)
            .run(req)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Artifact(_)));
        assert!(!root.join("escaped.txt").exists());
        assert!(!tmp.path().join("escaped.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_default_shell_available() {
        assert!(ShellRunner::new().is_available());
    }
}
