//! Process executor for delegated work.
//!
//! Runs one external command and supervises it:
//! - Environment composed from the process env, ancestor `.env` files and
//!   explicit overrides (later sources win)
//! - Optional stdin content, written and closed alongside the output pumps
//! - stdout/stderr streamed into memory and, when a log file is given,
//!   appended to it as they arrive
//! - Timeout enforcement with SIGTERM, then a hard kill after a grace period
//!
//! The child's pid is reported to the caller as soon as it is spawned so
//! it can be cancelled independently of the executor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Time a child gets to exit after SIGTERM before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Name of the environment files searched in ancestor directories.
const ENV_FILE: &str = ".env";

const READ_CHUNK: usize = 8192;

/// Failure of a supervised process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", .timeout.as_secs_f64())]
    Timeout {
        program: String,
        timeout: Duration,
        pid: Option<u32>,
    },

    #[error("{program} exited with code {code}")]
    NonZeroExit {
        program: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("{program} was terminated by a signal")]
    Signal {
        program: String,
        stdout: String,
        stderr: String,
    },

    #[error("I/O error while supervising {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    /// Exit code, when the process ran to a non-zero exit.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::NonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Captured stderr, when the process ran to completion.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::NonZeroExit { stderr, .. } | Self::Signal { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// A fully built command line plus how to run it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Applied last, over the process env and any `.env` files
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    /// Streamed output is appended here while the process runs
    pub log_file: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, content: impl Into<String>) -> Self {
        self.stdin = Some(content.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// The command as a single display line.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output of a process that exited successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub pid: Option<u32>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Runs commands on behalf of the delegation service.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion. The child's pid is sent on `pid_tx` as
    /// soon as the process has been spawned.
    async fn run(
        &self,
        spec: CommandSpec,
        pid_tx: Option<oneshot::Sender<u32>>,
    ) -> Result<ProcessOutput, ProcessError>;
}

/// Executor spawning real child processes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    env_search_depth: usize,
}

impl ProcessExecutor {
    /// Create an executor that reads `.env` files from up to
    /// `env_search_depth` ancestors of the working directory.
    pub fn new(env_search_depth: usize) -> Self {
        Self { env_search_depth }
    }

    /// Build the child environment for a command run in `working_dir`.
    pub async fn compose_env(
        &self,
        working_dir: Option<&Path>,
        overrides: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();

        if let Some(dir) = working_dir {
            for path in self.env_files(dir).await {
                match dotenvy::from_path_iter(&path) {
                    Ok(iter) => {
                        for item in iter {
                            match item {
                                Ok((key, value)) => {
                                    env.insert(key, value);
                                }
                                Err(e) => {
                                    warn!(path = %path.display(), error = %e, "Skipping malformed env line");
                                }
                            }
                        }
                        debug!(path = %path.display(), "Loaded env file");
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to read env file");
                    }
                }
            }
        }

        env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// `.env` files from `dir` upward, farthest ancestor first so that
    /// closer files override.
    async fn env_files(&self, dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for ancestor in dir.ancestors().take(self.env_search_depth + 1) {
            let candidate = ancestor.join(ENV_FILE);
            if tokio::fs::metadata(&candidate)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                found.push(candidate);
            }
        }
        found.reverse();
        found
    }

    async fn execute(
        &self,
        spec: CommandSpec,
        pid_tx: Option<oneshot::Sender<u32>>,
    ) -> Result<ProcessOutput, ProcessError> {
        let program = spec.program.clone();
        let io_err = |source: std::io::Error| ProcessError::Io {
            program: program.clone(),
            source,
        };

        let env = self
            .compose_env(spec.working_dir.as_deref(), &spec.env)
            .await;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .env_clear()
            .envs(&env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(program = %program, pid = ?pid, "Spawned process");

        if let (Some(tx), Some(pid)) = (pid_tx, pid) {
            let _ = tx.send(pid);
        }

        let mut stdout_task = tokio::spawn(pump(child.stdout.take(), spec.log_file.clone()));
        let mut stderr_task = tokio::spawn(pump(child.stderr.take(), spec.log_file.clone()));
        let stdin_task = match (spec.stdin, child.stdin.take()) {
            (Some(content), Some(stdin)) => Some(tokio::spawn(feed(stdin, content, program.clone()))),
            _ => None,
        };

        let supervised = async {
            let status = child.wait().await?;
            let stdout = join_pump(&mut stdout_task).await?;
            let stderr = join_pump(&mut stderr_task).await?;
            Ok::<_, std::io::Error>((status, stdout, stderr))
        };
        let outcome = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, supervised).await.ok(),
            None => Some(supervised.await),
        };

        let Some(outcome) = outcome else {
            let limit = spec.timeout.unwrap_or_default();
            warn!(program = %program, pid = ?pid, timeout_secs = limit.as_secs(), "Process timed out");
            terminate_child(&mut child, pid).await;
            stdout_task.abort();
            stderr_task.abort();
            if let Some(task) = stdin_task {
                task.abort();
            }
            return Err(ProcessError::Timeout {
                program,
                timeout: limit,
                pid,
            });
        };
        let (status, stdout, stderr) = outcome.map_err(io_err)?;
        let duration = started.elapsed();

        match status.code() {
            Some(0) => {
                info!(program = %program, pid = ?pid, duration_ms = duration.as_millis() as u64, "Process completed");
                Ok(ProcessOutput {
                    pid,
                    exit_code: 0,
                    stdout,
                    stderr,
                    duration,
                })
            }
            Some(code) => Err(ProcessError::NonZeroExit {
                program,
                code,
                stdout,
                stderr,
            }),
            None => Err(ProcessError::Signal {
                program,
                stdout,
                stderr,
            }),
        }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_ENV_SEARCH_DEPTH)
    }
}

#[async_trait]
impl CommandRunner for ProcessExecutor {
    async fn run(
        &self,
        spec: CommandSpec,
        pid_tx: Option<oneshot::Sender<u32>>,
    ) -> Result<ProcessOutput, ProcessError> {
        self.execute(spec, pid_tx).await
    }
}

/// Copy a child stream into memory and, optionally, a log file.
async fn pump<R>(reader: Option<R>, log_file: Option<PathBuf>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };

    let mut log = match log_file {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?,
        ),
        None => None,
    };

    let mut collected = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
        if let Some(file) = log.as_mut() {
            file.write_all(&buf[..n]).await?;
            file.flush().await?;
        }
    }

    Ok(String::from_utf8_lossy(&collected).into_owned())
}

async fn join_pump(
    task: &mut tokio::task::JoinHandle<std::io::Result<String>>,
) -> std::io::Result<String> {
    task.await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

/// Write `content` to the child's stdin and close it.
async fn feed(mut stdin: ChildStdin, content: String, program: String) {
    let written = async {
        stdin.write_all(content.as_bytes()).await?;
        stdin.shutdown().await
    }
    .await;
    if let Err(e) = written {
        // A child that exits without reading its input closes the pipe.
        warn!(program = %program, error = %e, "Failed to write stdin");
    }
}

/// SIGTERM the child, then kill it if it outlives the grace period.
async fn terminate_child(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        if let Err(e) = send_terminate(pid) {
            warn!(pid, error = %e, "Failed to send SIGTERM");
        }
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "Process ignored SIGTERM, killing");
    }
    if let Err(e) = child.kill().await {
        warn!(pid = ?pid, error = %e, "Failed to kill process");
    }
}

/// Ask a process to terminate.
///
/// This is a request: the process may ignore it, and nothing here waits
/// for it to exit.
#[cfg(unix)]
pub fn send_terminate(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
pub fn send_terminate(pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("cannot signal process {} on this platform", pid),
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let executor = ProcessExecutor::new(0);
        let output = executor
            .run(sh("echo out; echo err >&2"), None)
            .await
            .unwrap();

        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(output.pid.is_some());
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_code_and_streams() {
        let executor = ProcessExecutor::new(0);
        let err = executor
            .run(sh("echo partial; echo broken >&2; exit 3"), None)
            .await
            .unwrap_err();

        match err {
            ProcessError::NonZeroExit {
                code,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(code, 3);
                assert_eq!(stdout, "partial\n");
                assert_eq!(stderr, "broken\n");
            }
            other => panic!("expected non-zero exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let executor = ProcessExecutor::new(0);
        let err = executor
            .run(CommandSpec::new("definitely-not-a-real-binary-xyz"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout_reports_pid_immediately() {
        let executor = ProcessExecutor::new(0);
        let (tx, rx) = oneshot::channel();
        let spec = sh("sleep 5").timeout(Duration::from_millis(200));

        let started = Instant::now();
        let err = executor.run(spec, Some(tx)).await.unwrap_err();

        let pid = rx.await.unwrap();
        assert!(pid > 0);
        match err {
            ProcessError::Timeout { pid: reported, .. } => assert_eq!(reported, Some(pid)),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_stdin_is_written_and_closed() {
        let executor = ProcessExecutor::new(0);
        let output = executor
            .run(CommandSpec::new("cat").stdin("prompt text"), None)
            .await
            .unwrap();

        assert_eq!(output.stdout, "prompt text");
    }

    #[tokio::test]
    async fn test_large_stdin_is_streamed_while_output_drains() {
        let executor = ProcessExecutor::new(0);
        let input = "y".repeat(1_000_000);
        let spec = CommandSpec::new("cat")
            .stdin(input.clone())
            .timeout(Duration::from_secs(10));

        let output = tokio::time::timeout(Duration::from_secs(15), executor.run(spec, None))
            .await
            .expect("executor returned")
            .unwrap();

        assert_eq!(output.stdout.len(), input.len());
    }

    #[tokio::test]
    async fn test_timeout_applies_while_stdin_is_unread() {
        let executor = ProcessExecutor::new(0);
        let spec = CommandSpec::new("sleep")
            .arg("4")
            .stdin("x".repeat(1_000_000))
            .timeout(Duration::from_millis(200));

        let started = Instant::now();
        let err = executor.run(spec, None).await.unwrap_err();

        assert!(matches!(err, ProcessError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_env_layers_later_sources_win() {
        let root = TempDir::new().unwrap();
        let project = root.path().join("project");
        let work = project.join("work");
        tokio::fs::create_dir_all(&work).await.unwrap();
        tokio::fs::write(
            project.join(".env"),
            "MNEMO_T_A=project\nMNEMO_T_B=project\nMNEMO_T_C=project\n",
        )
        .await
        .unwrap();
        tokio::fs::write(work.join(".env"), "MNEMO_T_B=work\nMNEMO_T_C=work\n")
            .await
            .unwrap();

        let executor = ProcessExecutor::new(3);
        let spec = sh("echo $MNEMO_T_A-$MNEMO_T_B-$MNEMO_T_C")
            .current_dir(&work)
            .env("MNEMO_T_C", "override");
        let output = executor.run(spec, None).await.unwrap();

        assert_eq!(output.stdout.trim(), "project-work-override");
    }

    #[tokio::test]
    async fn test_env_search_depth_limits_ancestors() {
        let root = TempDir::new().unwrap();
        let deep = root.path().join("a/b/c");
        tokio::fs::create_dir_all(&deep).await.unwrap();
        tokio::fs::write(root.path().join(".env"), "MNEMO_T_FAR=yes\n")
            .await
            .unwrap();

        let executor = ProcessExecutor::new(1);
        let env = executor.compose_env(Some(&deep), &BTreeMap::new()).await;
        assert!(!env.contains_key("MNEMO_T_FAR"));

        let executor = ProcessExecutor::new(3);
        let env = executor.compose_env(Some(&deep), &BTreeMap::new()).await;
        assert_eq!(env.get("MNEMO_T_FAR").map(String::as_str), Some("yes"));
    }

    #[tokio::test]
    async fn test_output_streams_to_log_file() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("job.log");

        let executor = ProcessExecutor::new(0);
        executor
            .run(sh("echo line one; echo line two").log_file(&log), None)
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&log).await.unwrap();
        assert_eq!(content, "line one\nline two\n");
    }

    #[test]
    fn test_command_display() {
        let spec = CommandSpec::new("agent").args(["--mode", "read_only"]);
        assert_eq!(spec.display(), "agent --mode read_only");
    }
}
