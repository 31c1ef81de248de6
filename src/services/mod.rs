//! Service layer for mnemo.
//!
//! Contains the store and the delegation machinery:
//! - Markdown (record codec: YAML frontmatter + body)
//! - Memory (CRUD and hierarchical placement)
//! - Index / Search (exact, tag and fuzzy search over a fresh index)
//! - Graph (relationship edits and traversal)
//! - Tasks (task-management queries)
//! - WorkerPool (bounded FIFO executor)
//! - Delegation (background agent jobs, recovery, cancellation)
//! - Executor (supervised child processes)
//! - Agents (agent-provider registry)

pub mod agents;
pub mod delegation;
pub mod executor;
pub mod graph;
pub mod index;
pub mod markdown;
mod memory;
pub mod search;
pub mod tasks;
pub mod worker_pool;

pub use agents::{compose_prompt, AgentHealth, AgentProvider, AgentRegistry, ModeTemplates};
pub use delegation::{
    CancelOutcome, DelegationRequest, DelegationService, DelegationStatusReport,
    DEFAULT_OUTPUT_TAIL_LINES,
};
pub use executor::{
    send_terminate, CommandRunner, CommandSpec, ProcessError, ProcessExecutor, ProcessOutput,
};
pub use graph::{GraphEdge, GraphNode, GraphService, IncomingRelationship, RelationshipGraph};
pub use index::{tokenize, SearchIndex};
pub use markdown::{make_id, MarkdownCodec, ParsedRecord, ValidationResult, RECORD_EXTENSION};
pub use memory::{MemoryService, MemoryStats, ValidationReport};
pub use search::{SearchQuery, SearchResult, SearchService};
pub use tasks::{DependencyChain, DependencyNode, TaskFilter, TaskService, TaskStatistics};
pub use worker_pool::{PoolStats, WorkerPool};
