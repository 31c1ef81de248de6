//! Application state for mnemo.
//!
//! Wires the services together over one store. The protocol layer holds an
//! `AppState` and calls into its services.

use std::sync::Arc;

use tracing::info;

use crate::config::{Config, StoreConfig};
use crate::services::{
    AgentRegistry, CommandRunner, DelegationService, GraphService, MemoryService, ProcessExecutor,
    SearchService, TaskService,
};
use crate::Result;

/// Shared services over one store.
#[derive(Clone)]
pub struct AppState {
    /// Record CRUD.
    pub memory: MemoryService,
    /// Content, tag and fuzzy search.
    pub search: SearchService,
    /// Relationship edits and traversal.
    pub graph: GraphService,
    /// Task-management queries.
    pub tasks: TaskService,
    /// Background agent jobs.
    pub delegation: DelegationService,
    /// Runner used for delegated jobs and agent health checks.
    pub runner: Arc<dyn CommandRunner>,
}

impl AppState {
    /// Build every service from the global configuration, rooted at
    /// `store`. Creates the store layout if needed.
    pub async fn new(config: &Config, store: StoreConfig) -> Result<Self> {
        let agents =
            AgentRegistry::from_optional_file(config.agents.registry_file.as_ref()).await?;
        let runner: Arc<dyn CommandRunner> =
            Arc::new(ProcessExecutor::new(store.env_search_depth));
        Self::with_runner(store, agents, runner).await
    }

    /// Build every service with an explicit agent registry and runner.
    pub async fn with_runner(
        store: StoreConfig,
        agents: AgentRegistry,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let memory = MemoryService::new(store);
        memory.initialize().await?;

        let search = SearchService::new(memory.clone());
        let graph = GraphService::new(memory.clone());
        let tasks = TaskService::new(memory.clone());
        let delegation = DelegationService::new(memory.clone(), runner.clone(), agents);

        info!(
            base_dir = %memory.base_dir().display(),
            concurrency = memory.config().delegation_concurrency,
            "Application state initialized"
        );

        Ok(Self {
            memory,
            search,
            graph,
            tasks,
            delegation,
            runner,
        })
    }
}
