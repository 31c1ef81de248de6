//! Task-management queries.
//!
//! Read-only projections over requirement, design, task and bug records.
//! Lists are ordered by priority (urgent first), then newest first.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mnemo_models::{Memory, MemoryType, Priority, TaskFields, TaskStatus};

use crate::error::{Error, Result};

use super::memory::MemoryService;

/// Filter for [`TaskService::list_tasks`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Task-management types to include; all of them when empty
    #[serde(default)]
    pub types: Vec<MemoryType>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
    /// Only tasks with (`true`) or without (`false`) dependencies
    pub has_dependencies: Option<bool>,
    /// Only tasks due at or before this time
    pub due_before: Option<DateTime<Utc>>,
    /// Every tag must be present
    #[serde(default)]
    pub tags: Vec<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    fn matches(&self, memory: &Memory, task: &TaskFields) -> bool {
        if self.status.is_some_and(|s| task.status != s) {
            return false;
        }
        if self.priority.is_some_and(|p| task.priority != p) {
            return false;
        }
        if let Some(assignee) = &self.assignee {
            if task.assignee.as_deref() != Some(assignee.as_str()) {
                return false;
            }
        }
        if let Some(has) = self.has_dependencies {
            if task.dependencies.is_empty() == has {
                return false;
            }
        }
        if let Some(before) = self.due_before {
            if !task.due_date.is_some_and(|due| due <= before) {
                return false;
            }
        }
        self.tags.iter().all(|tag| memory.has_tag(tag))
    }
}

/// Counts over all task-management records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub unassigned: usize,
    /// Not done and past their due date
    pub overdue: usize,
    /// With a queued or running delegation
    pub delegated: usize,
    /// Fraction of tasks that are done
    pub completion_rate: f64,
}

/// One step of a dependency chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyNode {
    pub id: String,
    pub memory_type: MemoryType,
    pub title: String,
    pub status: TaskStatus,
    /// Hops from the task the chain was requested for
    pub depth: usize,
}

/// Transitive dependencies of a task, dependencies before dependents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyChain {
    pub task_id: String,
    pub chain: Vec<DependencyNode>,
    /// Dependency ids with no matching record
    pub missing: Vec<String>,
    pub has_cycle: bool,
}

/// Service for task-management queries.
#[derive(Clone)]
pub struct TaskService {
    memory: MemoryService,
}

impl TaskService {
    /// Create a new task service.
    pub fn new(memory: MemoryService) -> Self {
        Self { memory }
    }

    /// Tasks matching `filter`, urgent and newest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Memory>> {
        let types = task_types(&filter.types)?;
        let mut tasks: Vec<Memory> = self
            .memory
            .list_types(&types)
            .await?
            .into_iter()
            .filter(|m| m.task().is_some_and(|t| filter.matches(m, t)))
            .collect();

        tasks.sort_by(priority_then_recency);
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    /// Counts by status, priority and type.
    pub async fn get_task_statistics(&self) -> Result<TaskStatistics> {
        let now = mnemo_models::now();
        let mut stats = TaskStatistics::default();
        let mut done = 0usize;

        for memory in self.memory.list_types(MemoryType::task_types()).await? {
            let Some(task) = memory.task() else { continue };
            stats.total += 1;
            *stats
                .by_status
                .entry(task.status.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_priority
                .entry(task.priority.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_type
                .entry(memory.memory_type.as_str().to_string())
                .or_default() += 1;

            if task.assignee.is_none() {
                stats.unassigned += 1;
            }
            if task.status == TaskStatus::Done {
                done += 1;
            } else if task.due_date.is_some_and(|due| due < now) {
                stats.overdue += 1;
            }
            if task.delegation.as_ref().is_some_and(|d| d.status.is_active()) {
                stats.delegated += 1;
            }
        }

        if stats.total > 0 {
            stats.completion_rate = done as f64 / stats.total as f64;
        }
        Ok(stats)
    }

    /// Tasks ready to hand to an agent.
    ///
    /// A candidate is `todo`, has no active delegation, and every
    /// dependency is a task-management record that is `done`.
    pub async fn find_delegation_candidates(&self, limit: Option<usize>) -> Result<Vec<Memory>> {
        let all = self.memory.list_types(MemoryType::task_types()).await?;
        let done: HashSet<&str> = all
            .iter()
            .filter(|m| m.task().is_some_and(|t| t.status == TaskStatus::Done))
            .map(|m| m.id.as_str())
            .collect();

        let mut candidates: Vec<Memory> = all
            .iter()
            .filter(|m| {
                m.task().is_some_and(|t| {
                    t.status == TaskStatus::Todo
                        && !t.delegation.as_ref().is_some_and(|d| d.status.is_active())
                        && t.dependencies.iter().all(|d| done.contains(d.as_str()))
                })
            })
            .cloned()
            .collect();

        candidates.sort_by(priority_then_recency);
        if let Some(limit) = limit {
            candidates.truncate(limit);
        }
        Ok(candidates)
    }

    /// Transitive dependencies of a task, deepest first. `None` when the
    /// task does not exist.
    pub async fn get_task_dependency_chain(
        &self,
        task_id: &str,
    ) -> Result<Option<DependencyChain>> {
        let all: HashMap<String, Memory> = self
            .memory
            .list_types(MemoryType::task_types())
            .await?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        if !all.contains_key(task_id) {
            return Ok(None);
        }

        let mut walk = ChainWalk {
            all: &all,
            done: HashSet::new(),
            in_progress: HashSet::new(),
            chain: Vec::new(),
            missing: Vec::new(),
            has_cycle: false,
        };
        walk.visit(task_id, 0);

        // The requested task itself closes the chain; report only its
        // dependencies.
        walk.chain.retain(|n| n.id != task_id);

        Ok(Some(DependencyChain {
            task_id: task_id.to_string(),
            chain: walk.chain,
            missing: walk.missing,
            has_cycle: walk.has_cycle,
        }))
    }
}

/// Depth-first post-order walk over dependency edges.
struct ChainWalk<'a> {
    all: &'a HashMap<String, Memory>,
    done: HashSet<String>,
    in_progress: HashSet<String>,
    chain: Vec<DependencyNode>,
    missing: Vec<String>,
    has_cycle: bool,
}

impl ChainWalk<'_> {
    fn visit(&mut self, id: &str, depth: usize) {
        if self.done.contains(id) {
            return;
        }
        if !self.in_progress.insert(id.to_string()) {
            self.has_cycle = true;
            return;
        }

        let Some(memory) = self.all.get(id) else {
            if !self.missing.iter().any(|m| m == id) {
                self.missing.push(id.to_string());
            }
            self.in_progress.remove(id);
            return;
        };

        if let Some(task) = memory.task() {
            for dependency in &task.dependencies {
                self.visit(dependency, depth + 1);
            }
            self.chain.push(DependencyNode {
                id: memory.id.clone(),
                memory_type: memory.memory_type,
                title: memory.title.clone(),
                status: task.status,
                depth,
            });
        }

        self.in_progress.remove(id);
        self.done.insert(id.to_string());
    }
}

fn task_types(requested: &[MemoryType]) -> Result<Vec<MemoryType>> {
    if requested.is_empty() {
        return Ok(MemoryType::task_types().to_vec());
    }
    if let Some(t) = requested.iter().find(|t| !t.is_task_management()) {
        return Err(Error::InvalidInput(format!(
            "{} is not a task-management type",
            t
        )));
    }
    Ok(requested.to_vec())
}

/// Urgent before low; newer before older.
fn priority_then_recency(a: &Memory, b: &Memory) -> Ordering {
    let priority = |m: &Memory| m.task().map(|t| t.priority).unwrap_or_default();
    priority(b)
        .cmp(&priority(a))
        .then_with(|| b.header.created_at.cmp(&a.header.created_at))
        .then_with(|| a.id.cmp(&b.id))
}
