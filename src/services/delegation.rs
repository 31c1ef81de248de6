//! Background delegation of tasks to external agents.
//!
//! Each job moves through `queued -> running -> completed | failed |
//! cancelled`, with every transition stamped into the task's header under
//! the record lock. Jobs run on a bounded [`WorkerPool`]; anything that goes
//! wrong inside a job is written to its output file and recorded as
//! `failed`, never surfaced to the pool.
//!
//! Cancelling a running job sends SIGTERM to the recorded pid and marks the
//! task `cancelled` right away. A process that ignores the signal keeps
//! running.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use mnemo_models::{
    Delegation, DelegationStatus, Memory, MemoryType, PermissionMode, TaskFields, TaskStatus,
};

use crate::error::{Error, Result};

use super::agents::{compose_prompt, AgentRegistry};
use super::executor::{send_terminate, CommandRunner, ProcessError};
use super::memory::{task_fields, MemoryService};
use super::worker_pool::{PoolStats, WorkerPool};

/// Lines of job output returned by [`DelegationService::get_delegation_status`].
pub const DEFAULT_OUTPUT_TAIL_LINES: usize = 50;

/// Longest error text kept in a header or summary.
const ERROR_TAIL_CHARS: usize = 2000;

/// Options for one delegation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelegationRequest {
    pub mode: PermissionMode,
    /// Appended to the prompt built from the task
    pub extra_instructions: Option<String>,
    /// Defaults to `<store>/jobs/<task-id>.log`
    pub output_file: Option<PathBuf>,
    /// Defaults to the configured delegation timeout
    pub timeout: Option<Duration>,
    /// Defaults to the project root
    pub working_dir: Option<PathBuf>,
}

/// Result of [`DelegationService::cancel_delegation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub task_id: String,
    pub cancelled: bool,
    pub job_id: Option<String>,
    /// State the job was in when it was cancelled
    pub previous_status: Option<DelegationStatus>,
    /// Process sent SIGTERM, when the job was running
    pub signalled_pid: Option<u32>,
    pub message: String,
}

impl CancelOutcome {
    fn refused(task_id: &str, job_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            cancelled: false,
            job_id,
            previous_status: None,
            signalled_pid: None,
            message: message.into(),
        }
    }
}

/// Delegation state of a task plus the end of its output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationStatusReport {
    pub task_id: String,
    pub memory_type: MemoryType,
    pub task_status: TaskStatus,
    pub delegation: Option<Delegation>,
    pub output_tail: Vec<String>,
}

/// Everything a worker needs to run one job.
#[derive(Debug, Clone)]
struct JobSpec {
    memory_type: MemoryType,
    task_id: String,
    job_id: String,
    agent: String,
    mode: PermissionMode,
    extra_instructions: Option<String>,
    output_file: PathBuf,
    timeout: Duration,
    working_dir: PathBuf,
}

/// Completion summary appended to a job's output file.
struct JobSummary<'a> {
    job: &'a JobSpec,
    status: DelegationStatus,
    duration: Duration,
    command: Option<String>,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl JobSummary<'_> {
    fn render(&self) -> String {
        let mut out = format!(
            "\n=== mnemo job {} {} ===\nstatus: {}\nagent: {}\nexecution_time: {:.1}s\n",
            self.job.job_id,
            self.status,
            self.status,
            self.job.agent,
            self.duration.as_secs_f64()
        );
        if let Some(command) = &self.command {
            out.push_str(&format!("command: {}\n", command));
        }
        if let Some(code) = self.exit_code {
            out.push_str(&format!("exit_code: {}\n", code));
        }
        if let Some(error) = &self.error {
            out.push_str(&format!("error:\n{}\n", error));
        }
        out
    }
}

struct DelegationInner {
    memory: MemoryService,
    runner: Arc<dyn CommandRunner>,
    agents: AgentRegistry,
    pool: WorkerPool,
}

/// Service running delegation jobs in the background.
#[derive(Clone)]
pub struct DelegationService {
    inner: Arc<DelegationInner>,
}

impl DelegationService {
    /// Create the service and start its worker pool.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(memory: MemoryService, runner: Arc<dyn CommandRunner>, agents: AgentRegistry) -> Self {
        let pool = WorkerPool::new(memory.config().delegation_concurrency);
        Self {
            inner: Arc::new(DelegationInner {
                memory,
                runner,
                agents,
                pool,
            }),
        }
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.inner.agents
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Queue a task for an agent and return the job id without waiting.
    ///
    /// Fails with `Conflict` if the task already has a queued or running
    /// job.
    pub async fn start_background_delegation(
        &self,
        task_id: &str,
        agent: &str,
        request: DelegationRequest,
    ) -> Result<String> {
        let task = self.resolve_task(task_id).await?;

        let provider = self.inner.agents.get(agent)?;
        if provider.modes.get(request.mode).is_none() {
            return Err(Error::AgentConfig(format!(
                "agent {} has no arguments for {} mode",
                agent, request.mode
            )));
        }

        let job_id = format!("job-{}", nanoid::nanoid!(12));
        let output_file = request
            .output_file
            .clone()
            .unwrap_or_else(|| self.default_output_file(&task.id));

        self.inner
            .memory
            .modify(task.memory_type, &task.id, |memory| {
                let id = memory.id.clone();
                let fields = task_fields(memory)?;
                if let Some(current) = fields.delegation.as_ref().filter(|d| d.status.is_active()) {
                    return Err(Error::Conflict(format!(
                        "task {} already has a {} delegation ({})",
                        id,
                        current.status,
                        current.job_id.as_deref().unwrap_or("unknown job")
                    )));
                }
                let attempts = fields.delegation.as_ref().map_or(0, |d| d.attempts);
                let mut delegation = Delegation::queued(&job_id, agent, request.mode);
                delegation.output_file = Some(output_file.display().to_string());
                delegation.progress = Some("queued".to_string());
                delegation.attempts = attempts;
                fields.delegation = Some(delegation);
                Ok(())
            })
            .await?;

        let job = JobSpec {
            memory_type: task.memory_type,
            task_id: task.id.clone(),
            job_id: job_id.clone(),
            agent: agent.to_string(),
            mode: request.mode,
            extra_instructions: request.extra_instructions,
            output_file,
            timeout: request
                .timeout
                .unwrap_or(self.inner.memory.config().delegation_timeout),
            working_dir: request
                .working_dir
                .unwrap_or_else(|| self.default_working_dir()),
        };
        self.submit(job).await?;

        info!(task_id = %task.id, job_id = %job_id, agent, "Queued delegation");
        Ok(job_id)
    }

    /// Cancel a task's queued or running job.
    ///
    /// A queued job is marked cancelled and will be skipped by its worker.
    /// A running job's process is sent SIGTERM first; without a recorded
    /// pid there is nothing to cancel and the outcome says so.
    pub async fn cancel_delegation(&self, task_id: &str) -> Result<CancelOutcome> {
        let task = self.resolve_task(task_id).await?;

        let mut refusal: Option<CancelOutcome> = None;
        let mut previous = None;
        let mut signalled_pid = None;

        let stamped = self
            .stamp(task.memory_type, &task.id, |fields| {
                let Some(delegation) = fields.delegation.as_mut() else {
                    refusal = Some(CancelOutcome::refused(task_id, None, "task has no delegation"));
                    return Ok(false);
                };
                let job_id = delegation.job_id.clone();

                match delegation.status {
                    DelegationStatus::Queued => {}
                    DelegationStatus::Running => {
                        let Some(pid) = delegation.process_id else {
                            refusal = Some(CancelOutcome::refused(
                                task_id,
                                job_id,
                                "running job has no recorded process id",
                            ));
                            return Ok(false);
                        };
                        if let Err(e) = send_terminate(pid) {
                            warn!(task_id, pid, error = %e, "Failed to signal delegated process");
                        }
                        signalled_pid = Some(pid);
                    }
                    status => {
                        refusal = Some(CancelOutcome::refused(
                            task_id,
                            job_id,
                            format!("delegation is already {}", status),
                        ));
                        return Ok(false);
                    }
                }

                previous = Some(delegation.status);
                delegation.status = DelegationStatus::Cancelled;
                delegation.completed_at = Some(mnemo_models::now());
                delegation.progress = Some("cancelled".to_string());
                fields.status = TaskStatus::Todo;
                Ok(true)
            })
            .await?;

        let Some(memory) = stamped else {
            return Ok(refusal.unwrap_or_else(|| {
                CancelOutcome::refused(task_id, None, "nothing to cancel")
            }));
        };

        let delegation = memory.delegation();
        if let Some(path) = delegation.and_then(|d| d.output_file.as_deref()) {
            let marker = format!("\n=== mnemo job cancelled at {} ===\n", timestamp());
            if let Err(e) = self.append_output(Path::new(path), &marker).await {
                warn!(task_id, error = %e, "Failed to write cancel marker");
            }
        }

        let job_id = delegation.and_then(|d| d.job_id.clone());
        info!(task_id, job_id = ?job_id, pid = ?signalled_pid, "Cancelled delegation");

        Ok(CancelOutcome {
            task_id: task.id,
            cancelled: true,
            job_id,
            previous_status: previous,
            signalled_pid,
            message: match signalled_pid {
                Some(pid) => format!("sent SIGTERM to process {}", pid),
                None => "removed queued job".to_string(),
            },
        })
    }

    /// Requeue jobs left queued or running by a previous process.
    ///
    /// Call once at startup, before accepting new work. Each recovered job
    /// gets a restart marker in its output file. Returns how many jobs were
    /// requeued.
    pub async fn requeue_interrupted_jobs(&self) -> Result<usize> {
        let mut requeued = 0;

        for memory in self.inner.memory.list_types(MemoryType::task_types()).await? {
            let Some(delegation) = memory.delegation().filter(|d| d.status.is_active()) else {
                continue;
            };
            match self.requeue(&memory, delegation.clone()).await {
                Ok(()) => requeued += 1,
                Err(e) => {
                    error!(task_id = %memory.id, error = %e, "Failed to requeue interrupted job");
                }
            }
        }

        if requeued > 0 {
            info!(count = requeued, "Requeued interrupted delegation jobs");
        }
        Ok(requeued)
    }

    /// Delegation fields of a task and the tail of its output file.
    ///
    /// Returns `None` when the task does not exist.
    pub async fn get_delegation_status(
        &self,
        task_id: &str,
        tail_lines: usize,
    ) -> Result<Option<DelegationStatusReport>> {
        let Some(memory) = self.inner.memory.find_by_id_across_types(task_id).await? else {
            return Ok(None);
        };
        let Some(fields) = memory.task() else {
            return Err(not_a_task(&memory));
        };

        let output_tail = match fields.delegation.as_ref().and_then(|d| d.output_file.as_deref()) {
            Some(path) => self
                .inner
                .memory
                .storage()
                .read(Path::new(path))
                .await?
                .map(|content| tail(&content, tail_lines))
                .unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(Some(DelegationStatusReport {
            task_id: memory.id.clone(),
            memory_type: memory.memory_type,
            task_status: fields.status,
            delegation: fields.delegation.clone(),
            output_tail,
        }))
    }

    /// Tasks whose delegation is in `status`, or any delegation when `None`.
    pub async fn list_delegations(&self, status: Option<DelegationStatus>) -> Result<Vec<Memory>> {
        Ok(self
            .inner
            .memory
            .list_types(MemoryType::task_types())
            .await?
            .into_iter()
            .filter(|m| {
                m.delegation()
                    .is_some_and(|d| status.map_or(true, |s| d.status == s))
            })
            .collect())
    }

    /// Stop taking jobs and wait for queued and running ones to finish.
    pub async fn shutdown(&self) {
        self.inner.pool.shutdown().await;
    }

    // =========================================================================
    // Job execution
    // =========================================================================

    async fn submit(&self, job: JobSpec) -> Result<()> {
        let service = self.clone();
        let queued = job.clone();
        if let Err(e) = self.inner.pool.submit(service.run_job(queued)) {
            let message = e.to_string();
            self.stamp(job.memory_type, &job.task_id, |fields| {
                Ok(mark_terminal(fields, &job, DelegationStatus::Failed, Some(message.clone())))
            })
            .await?;
            return Err(e);
        }
        Ok(())
    }

    async fn requeue(&self, memory: &Memory, delegation: Delegation) -> Result<()> {
        let agent = delegation.agent.clone().ok_or_else(|| {
            Error::InvalidInput(format!("interrupted job on {} has no agent", memory.id))
        })?;
        let job = JobSpec {
            memory_type: memory.memory_type,
            task_id: memory.id.clone(),
            job_id: delegation
                .job_id
                .clone()
                .unwrap_or_else(|| format!("job-{}", nanoid::nanoid!(12))),
            agent,
            mode: delegation.mode.unwrap_or_default(),
            extra_instructions: None,
            output_file: delegation
                .output_file
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| self.default_output_file(&memory.id)),
            timeout: self.inner.memory.config().delegation_timeout,
            working_dir: self.default_working_dir(),
        };

        let marker = format!(
            "\n=== mnemo restarted at {}: job {} requeued (was {}) ===\n",
            timestamp(),
            job.job_id,
            delegation.status
        );
        self.append_output(&job.output_file, &marker).await?;

        self.inner
            .memory
            .modify(job.memory_type, &job.task_id, |memory| {
                let fields = task_fields(memory)?;
                let delegation = fields.delegation.get_or_insert_with(|| {
                    Delegation::queued(&job.job_id, &job.agent, job.mode)
                });
                delegation.status = DelegationStatus::Queued;
                delegation.job_id = Some(job.job_id.clone());
                delegation.queued_at = Some(mnemo_models::now());
                delegation.started_at = None;
                delegation.process_id = None;
                delegation.output_file = Some(job.output_file.display().to_string());
                delegation.progress = Some("requeued after restart".to_string());
                Ok(())
            })
            .await?;

        warn!(
            task_id = %job.task_id,
            job_id = %job.job_id,
            previous = %delegation.status,
            "Requeued interrupted job"
        );
        self.submit(job).await
    }

    /// Worker entry point. Never fails: errors end up in the output file
    /// and the task header.
    async fn run_job(self, job: JobSpec) {
        let started = Instant::now();
        if let Err(e) = self.execute_job(&job, started).await {
            error!(task_id = %job.task_id, job_id = %job.job_id, error = %e, "Delegation job failed");

            let message = truncate_tail(&e.to_string());
            let summary = JobSummary {
                job: &job,
                status: DelegationStatus::Failed,
                duration: started.elapsed(),
                command: None,
                exit_code: None,
                error: Some(message.clone()),
            };
            if let Err(e) = self.append_output(&job.output_file, &summary.render()).await {
                warn!(job_id = %job.job_id, error = %e, "Failed to write job summary");
            }
            if let Err(e) = self.finish(&job, DelegationStatus::Failed, Some(message)).await {
                error!(job_id = %job.job_id, error = %e, "Failed to record job failure");
            }
        }
    }

    async fn execute_job(&self, job: &JobSpec, started: Instant) -> Result<()> {
        let Some(task) = self.begin(job).await? else {
            return Ok(());
        };
        let attempt = task.delegation().map_or(1, |d| d.attempts);

        let marker = format!(
            "=== mnemo job {} started at {} (task {}, agent {}, mode {}, attempt {}) ===\n",
            job.job_id,
            timestamp(),
            job.task_id,
            job.agent,
            job.mode,
            attempt
        );
        self.append_output(&job.output_file, &marker).await?;

        let prompt = compose_prompt(&task, job.extra_instructions.as_deref());
        let spec = self
            .inner
            .agents
            .get(&job.agent)?
            .build_command(job.mode, &prompt)?
            .current_dir(&job.working_dir)
            .timeout(job.timeout)
            .log_file(&job.output_file);
        let command = spec.display();

        info!(job_id = %job.job_id, task_id = %job.task_id, command = %command, "Running delegated task");

        let (pid_tx, pid_rx) = oneshot::channel();
        let (result, ()) = tokio::join!(
            self.inner.runner.run(spec, Some(pid_tx)),
            self.record_pid(job, pid_rx)
        );

        let (mut status, exit_code, error) = match &result {
            Ok(output) => (DelegationStatus::Completed, Some(output.exit_code), None),
            Err(e) => (DelegationStatus::Failed, e.exit_code(), Some(process_error_text(e))),
        };

        // A cancel while running wins over the process result.
        if let Some(current) = self.current_delegation(job).await? {
            if current.status == DelegationStatus::Cancelled {
                status = DelegationStatus::Cancelled;
            }
        }

        let summary = JobSummary {
            job,
            status,
            duration: started.elapsed(),
            command: Some(command),
            exit_code,
            error: error.clone(),
        };
        self.append_output(&job.output_file, &summary.render()).await?;

        if status != DelegationStatus::Cancelled {
            self.finish(job, status, error).await?;
        }

        info!(
            job_id = %job.job_id,
            task_id = %job.task_id,
            status = %status,
            duration_ms = started.elapsed().as_millis() as u64,
            "Delegation job finished"
        );
        Ok(())
    }

    /// Stamp the job `running`, or skip it when it was cancelled or
    /// replaced while queued.
    async fn begin(&self, job: &JobSpec) -> Result<Option<Memory>> {
        let mut cancelled = false;
        let stamped = self
            .stamp(job.memory_type, &job.task_id, |fields| {
                let Some(delegation) = fields.delegation.as_mut() else {
                    return Ok(false);
                };
                if delegation.job_id.as_deref() != Some(job.job_id.as_str()) {
                    return Ok(false);
                }
                match delegation.status {
                    DelegationStatus::Queued => {
                        delegation.status = DelegationStatus::Running;
                        delegation.started_at = Some(mnemo_models::now());
                        delegation.completed_at = None;
                        delegation.process_id = None;
                        delegation.error = None;
                        delegation.attempts += 1;
                        delegation.progress = Some("running".to_string());
                        fields.status = TaskStatus::InProgress;
                        Ok(true)
                    }
                    DelegationStatus::Cancelled => {
                        cancelled = true;
                        if fields.status == TaskStatus::InProgress {
                            fields.status = TaskStatus::Todo;
                            return Ok(true);
                        }
                        Ok(false)
                    }
                    _ => Ok(false),
                }
            })
            .await?;

        if cancelled {
            info!(job_id = %job.job_id, task_id = %job.task_id, "Skipping job cancelled while queued");
            return Ok(None);
        }
        if stamped.is_none() {
            debug!(job_id = %job.job_id, task_id = %job.task_id, "Skipping superseded job");
        }
        Ok(stamped)
    }

    /// Record the child's pid once it has been spawned.
    async fn record_pid(&self, job: &JobSpec, pid_rx: oneshot::Receiver<u32>) {
        let Ok(pid) = pid_rx.await else {
            return;
        };
        let result = self
            .stamp(job.memory_type, &job.task_id, |fields| {
                Ok(match owned_delegation(fields, job) {
                    Some(d) if d.status == DelegationStatus::Running => {
                        d.process_id = Some(pid);
                        true
                    }
                    _ => false,
                })
            })
            .await;

        match result {
            Ok(_) => debug!(job_id = %job.job_id, pid, "Recorded process id"),
            Err(e) => warn!(job_id = %job.job_id, pid, error = %e, "Failed to record process id"),
        }
    }

    /// Stamp a terminal state unless the job was cancelled or replaced.
    async fn finish(
        &self,
        job: &JobSpec,
        status: DelegationStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let stamped = self
            .stamp(job.memory_type, &job.task_id, |fields| {
                Ok(mark_terminal(fields, job, status, error))
            })
            .await?;
        Ok(stamped.is_some())
    }

    async fn current_delegation(&self, job: &JobSpec) -> Result<Option<Delegation>> {
        Ok(self
            .inner
            .memory
            .get_by_id(job.memory_type, &job.task_id)
            .await?
            .and_then(|m| m.delegation().cloned())
            .filter(|d| d.job_id.as_deref() == Some(job.job_id.as_str())))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Change a task's fields under its lock.
    ///
    /// `change` returns whether it changed anything; nothing is written
    /// when it returns `false`, and `None` is returned.
    async fn stamp<F>(&self, memory_type: MemoryType, id: &str, change: F) -> Result<Option<Memory>>
    where
        F: FnOnce(&mut TaskFields) -> Result<bool>,
    {
        self.inner
            .memory
            .modify_if(memory_type, id, |memory| change(task_fields(memory)?))
            .await
    }

    async fn resolve_task(&self, task_id: &str) -> Result<Memory> {
        let memory = self
            .inner
            .memory
            .find_by_id_across_types(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;
        if !memory.memory_type.is_task_management() {
            return Err(not_a_task(&memory));
        }
        Ok(memory)
    }

    async fn append_output(&self, path: &Path, content: &str) -> Result<()> {
        self.inner.memory.storage().append(path, content).await?;
        Ok(())
    }

    fn default_output_file(&self, task_id: &str) -> PathBuf {
        self.inner
            .memory
            .storage()
            .jobs_dir()
            .join(format!("{}.log", task_id))
    }

    fn default_working_dir(&self) -> PathBuf {
        let config = self.inner.memory.config();
        match &config.project_root {
            Some(root) => PathBuf::from(root),
            None => config
                .base_dir
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| config.base_dir.clone()),
        }
    }
}

/// The task's delegation, if it still belongs to `job`.
fn owned_delegation<'a>(fields: &'a mut TaskFields, job: &JobSpec) -> Option<&'a mut Delegation> {
    fields
        .delegation
        .as_mut()
        .filter(|d| d.job_id.as_deref() == Some(job.job_id.as_str()))
}

/// Move the job to a terminal state. Returns `false` when the job is no
/// longer the task's current one or cannot make that transition.
fn mark_terminal(
    fields: &mut TaskFields,
    job: &JobSpec,
    status: DelegationStatus,
    error: Option<String>,
) -> bool {
    let Some(delegation) = owned_delegation(fields, job) else {
        return false;
    };
    if !delegation.status.can_transition_to(status) {
        return false;
    }

    delegation.status = status;
    delegation.completed_at = Some(mnemo_models::now());
    delegation.progress = Some(status.as_str().to_string());
    delegation.error = error;
    fields.status = match status {
        DelegationStatus::Completed => TaskStatus::Done,
        DelegationStatus::Failed => TaskStatus::Blocked,
        _ => TaskStatus::Todo,
    };
    true
}

fn process_error_text(error: &ProcessError) -> String {
    let mut text = error.to_string();
    if let Some(stderr) = error.stderr().map(str::trim).filter(|s| !s.is_empty()) {
        text.push('\n');
        text.push_str(stderr);
    }
    truncate_tail(&text)
}

/// Keep the last [`ERROR_TAIL_CHARS`] characters.
fn truncate_tail(text: &str) -> String {
    let count = text.chars().count();
    if count <= ERROR_TAIL_CHARS {
        return text.to_string();
    }
    text.chars().skip(count - ERROR_TAIL_CHARS).collect()
}

fn tail(content: &str, lines: usize) -> Vec<String> {
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].iter().map(|l| l.to_string()).collect()
}

fn timestamp() -> String {
    mnemo_models::now().to_rfc3339()
}

fn not_a_task(memory: &Memory) -> Error {
    Error::InvalidInput(format!(
        "{} {} is not a task-management record",
        memory.memory_type, memory.id
    ))
}
