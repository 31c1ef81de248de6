//! Integration tests for background delegation.
//!
//! Jobs run either through a counting fake runner or, on unix, through
//! real `sh` processes.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mnemo::config::StoreConfig;
use mnemo::services::{
    CommandRunner, CommandSpec, DelegationRequest, MemoryService, ProcessError, ProcessOutput,
    DEFAULT_OUTPUT_TAIL_LINES,
};
use mnemo::Result;
use mnemo_models::{Delegation, DelegationStatus, MemoryCreate, MemoryType, PermissionMode, TaskStatus};
use tokio::sync::{oneshot, Notify};

/// Fake runner that records how many delegated tasks are marked running
/// in the store while it works.
struct ObservingRunner {
    store: MemoryService,
    running_now: AtomicUsize,
    max_running_now: AtomicUsize,
    max_running_in_store: AtomicUsize,
    calls: AtomicUsize,
}

impl ObservingRunner {
    fn new(store: MemoryService) -> Self {
        Self {
            store,
            running_now: AtomicUsize::new(0),
            max_running_now: AtomicUsize::new(0),
            max_running_in_store: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CommandRunner for ObservingRunner {
    async fn run(
        &self,
        _spec: CommandSpec,
        _pid_tx: Option<oneshot::Sender<u32>>,
    ) -> std::result::Result<ProcessOutput, ProcessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running_now.fetch_max(now, Ordering::SeqCst);

        for _ in 0..5 {
            let running = self
                .store
                .list_types(MemoryType::task_types())
                .await
                .map(|tasks| {
                    tasks
                        .iter()
                        .filter(|t| {
                            t.delegation()
                                .is_some_and(|d| d.status == DelegationStatus::Running)
                        })
                        .count()
                })
                .unwrap_or(0);
            self.max_running_in_store.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.running_now.fetch_sub(1, Ordering::SeqCst);
        Ok(ProcessOutput {
            pid: None,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(50),
        })
    }
}

/// Fake runner blocked on a gate.
struct GatedRunner {
    gate: Arc<Notify>,
    calls: AtomicUsize,
}

#[async_trait]
impl CommandRunner for GatedRunner {
    async fn run(
        &self,
        _spec: CommandSpec,
        _pid_tx: Option<oneshot::Sender<u32>>,
    ) -> std::result::Result<ProcessOutput, ProcessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        Ok(ProcessOutput {
            pid: None,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
        })
    }
}

async fn add_task(memory: &MemoryService, title: &str) -> Result<String> {
    Ok(memory
        .store(MemoryCreate::new(MemoryType::Task, title, "Work to do."))
        .await?
        .id)
}

// ============================================================================
// Concurrency
// ============================================================================

/// Five jobs on a pool of two never run more than two at once
#[tokio::test]
async fn test_concurrency_bound() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let base = dir.path().join(".mnemo");
    let observer = MemoryService::new(StoreConfig::new(&base));
    let runner = Arc::new(ObservingRunner::new(observer));

    let store = StoreConfig::new(&base)
        .with_concurrency(2)
        .with_project_root(dir.path().display().to_string());
    let state = mnemo::AppState::with_runner(
        store,
        common::agent("fake", "fake-agent", &["{prompt}"]),
        runner.clone(),
    )
    .await?;

    let mut ids = Vec::new();
    for i in 0..5 {
        let id = add_task(&state.memory, &format!("Job {}", i)).await?;
        state
            .delegation
            .start_background_delegation(&id, "fake", DelegationRequest::default())
            .await?;
        ids.push(id);
    }
    state.delegation.shutdown().await;

    assert_eq!(runner.calls.load(Ordering::SeqCst), 5);
    assert!(runner.max_running_now.load(Ordering::SeqCst) <= 2);
    assert!(runner.max_running_in_store.load(Ordering::SeqCst) <= 2);
    assert!(runner.max_running_in_store.load(Ordering::SeqCst) >= 1);

    let stats = state.delegation.pool_stats();
    assert_eq!(stats.concurrency, 2);
    assert!(stats.max_active <= 2);
    assert_eq!(stats.completed, 5);

    for id in &ids {
        let report = state
            .delegation
            .get_delegation_status(id, DEFAULT_OUTPUT_TAIL_LINES)
            .await?
            .unwrap();
        assert_eq!(report.delegation.unwrap().status, DelegationStatus::Completed);
        assert_eq!(report.task_status, TaskStatus::Done);
    }
    Ok(())
}

// ============================================================================
// Crash recovery
// ============================================================================

/// A job left running by a dead process is requeued with a restart marker
#[tokio::test]
async fn test_crash_recovery_requeues_running_job() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let base = dir.path().join(".mnemo");

    // First process: the job was running when it died.
    let before = MemoryService::new(StoreConfig::new(&base));
    before.initialize().await?;
    let id = add_task(&before, "Survivor").await?;
    let output = before.storage().jobs_dir().join(format!("{}.log", id));
    before
        .modify(MemoryType::Task, &id, |memory| {
            let task = memory.task_mut().unwrap();
            let mut delegation = Delegation::queued("job-before", "fake", PermissionMode::Standard);
            delegation.status = DelegationStatus::Running;
            delegation.attempts = 1;
            delegation.process_id = Some(999_999);
            delegation.output_file = Some(output.display().to_string());
            task.delegation = Some(delegation);
            task.status = TaskStatus::InProgress;
            Ok(())
        })
        .await?;
    tokio::fs::write(&output, "partial output\n").await?;

    // Second process starts over the same store.
    let gate = Arc::new(Notify::new());
    let runner = Arc::new(GatedRunner {
        gate: gate.clone(),
        calls: AtomicUsize::new(0),
    });
    let store = StoreConfig::new(&base)
        .with_concurrency(1)
        .with_project_root(dir.path().display().to_string());
    let state = mnemo::AppState::with_runner(
        store,
        common::agent("fake", "fake-agent", &["{prompt}"]),
        runner.clone(),
    )
    .await?;

    assert_eq!(state.delegation.requeue_interrupted_jobs().await?, 1);

    let report = state
        .delegation
        .get_delegation_status(&id, DEFAULT_OUTPUT_TAIL_LINES)
        .await?
        .unwrap();
    let delegation = report.delegation.unwrap();
    assert!(matches!(
        delegation.status,
        DelegationStatus::Queued | DelegationStatus::Running
    ));
    assert_eq!(delegation.job_id.as_deref(), Some("job-before"));
    assert_ne!(delegation.process_id, Some(999_999));

    let log = tokio::fs::read_to_string(&output).await?;
    assert!(log.starts_with("partial output\n"));
    assert!(log.contains("=== mnemo restarted at "));

    gate.notify_one();
    state.delegation.shutdown().await;

    let report = state
        .delegation
        .get_delegation_status(&id, DEFAULT_OUTPUT_TAIL_LINES)
        .await?
        .unwrap();
    let delegation = report.delegation.unwrap();
    assert_eq!(delegation.status, DelegationStatus::Completed);
    assert_eq!(delegation.attempts, 2);
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    Ok(())
}

/// Finished jobs are left alone on restart
#[tokio::test]
async fn test_recovery_ignores_finished_jobs() -> Result<()> {
    let (_dir, state) = common::state().await;
    let id = add_task(&state.memory, "Finished").await?;
    state
        .memory
        .modify(MemoryType::Task, &id, |memory| {
            let task = memory.task_mut().unwrap();
            let mut delegation = Delegation::queued("job-done", "fake", PermissionMode::Standard);
            delegation.status = DelegationStatus::Completed;
            task.delegation = Some(delegation);
            Ok(())
        })
        .await?;

    assert_eq!(state.delegation.requeue_interrupted_jobs().await?, 0);
    state.delegation.shutdown().await;
    Ok(())
}

// ============================================================================
// Real processes
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_process_output_streams_to_job_log() -> Result<()> {
    let (_dir, state) = common::state_with(
        Arc::new(mnemo::services::ProcessExecutor::new(0)),
        common::agent("sh", "sh", &["-c", "echo working on it; echo careful >&2"]),
        2,
    )
    .await;
    let id = add_task(&state.memory, "Echo").await?;

    let job_id = state
        .delegation
        .start_background_delegation(&id, "sh", DelegationRequest::default())
        .await?;
    state.delegation.shutdown().await;

    let report = state
        .delegation
        .get_delegation_status(&id, DEFAULT_OUTPUT_TAIL_LINES)
        .await?
        .unwrap();
    assert_eq!(report.task_status, TaskStatus::Done);
    let log = report.output_tail.join("\n");
    assert!(log.contains(&format!("=== mnemo job {} started", job_id)));
    assert!(log.contains("working on it"));
    assert!(log.contains("careful"));
    assert!(log.contains("status: completed"));
    assert!(log.contains("command: sh -c"));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_failing_process_marks_task_blocked() -> Result<()> {
    let (_dir, state) = common::state_with(
        Arc::new(mnemo::services::ProcessExecutor::new(0)),
        common::agent("sh", "sh", &["-c", "echo broken >&2; exit 7"]),
        2,
    )
    .await;
    let id = add_task(&state.memory, "Fail").await?;

    state
        .delegation
        .start_background_delegation(&id, "sh", DelegationRequest::default())
        .await?;
    state.delegation.shutdown().await;

    let report = state
        .delegation
        .get_delegation_status(&id, DEFAULT_OUTPUT_TAIL_LINES)
        .await?
        .unwrap();
    assert_eq!(report.task_status, TaskStatus::Blocked);
    let delegation = report.delegation.unwrap();
    assert_eq!(delegation.status, DelegationStatus::Failed);
    assert!(delegation.error.unwrap().contains("broken"));
    assert!(report.output_tail.join("\n").contains("exit_code: 7"));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_timeout_fails_job() -> Result<()> {
    let (_dir, state) = common::state_with(
        Arc::new(mnemo::services::ProcessExecutor::new(0)),
        common::agent("sh", "sh", &["-c", "exec sleep 30"]),
        2,
    )
    .await;
    let id = add_task(&state.memory, "Slow").await?;

    state
        .delegation
        .start_background_delegation(
            &id,
            "sh",
            DelegationRequest {
                timeout: Some(Duration::from_millis(200)),
                ..Default::default()
            },
        )
        .await?;
    state.delegation.shutdown().await;

    let report = state
        .delegation
        .get_delegation_status(&id, DEFAULT_OUTPUT_TAIL_LINES)
        .await?
        .unwrap();
    let delegation = report.delegation.unwrap();
    assert_eq!(delegation.status, DelegationStatus::Failed);
    assert!(delegation.error.unwrap().contains("timed out"));
    Ok(())
}

/// Cancelling a running job signals its process and resets the task
#[cfg(unix)]
#[tokio::test]
async fn test_cancel_running_job() -> Result<()> {
    let (_dir, state) = common::state_with(
        Arc::new(mnemo::services::ProcessExecutor::new(0)),
        common::agent("sh", "sh", &["-c", "exec sleep 30"]),
        2,
    )
    .await;
    let id = add_task(&state.memory, "Long").await?;

    state
        .delegation
        .start_background_delegation(&id, "sh", DelegationRequest::default())
        .await?;

    let mut pid = None;
    for _ in 0..200 {
        pid = state
            .delegation
            .get_delegation_status(&id, 0)
            .await?
            .and_then(|r| r.delegation)
            .and_then(|d| d.process_id);
        if pid.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(pid.is_some());

    let outcome = state.delegation.cancel_delegation(&id).await?;
    assert!(outcome.cancelled);
    assert_eq!(outcome.signalled_pid, pid);

    state.delegation.shutdown().await;
    let report = state
        .delegation
        .get_delegation_status(&id, DEFAULT_OUTPUT_TAIL_LINES)
        .await?
        .unwrap();
    assert_eq!(report.delegation.unwrap().status, DelegationStatus::Cancelled);
    assert_eq!(report.task_status, TaskStatus::Todo);
    Ok(())
}
