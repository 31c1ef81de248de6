//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use mnemo::config::StoreConfig;
use mnemo::services::{AgentProvider, AgentRegistry, CommandRunner, ModeTemplates};
use mnemo::AppState;
use tempfile::TempDir;

/// A fresh store in a temporary project directory.
pub async fn state_with(
    runner: Arc<dyn CommandRunner>,
    agents: AgentRegistry,
    concurrency: usize,
) -> (TempDir, AppState) {
    let dir = TempDir::new().unwrap();
    let store = StoreConfig::new(dir.path().join(".mnemo"))
        .with_concurrency(concurrency)
        .with_project_root(dir.path().display().to_string());
    let state = AppState::with_runner(store, agents, runner).await.unwrap();
    (dir, state)
}

/// Store with the real process executor and no agents.
pub async fn state() -> (TempDir, AppState) {
    state_with(
        Arc::new(mnemo::services::ProcessExecutor::new(0)),
        AgentRegistry::new(),
        2,
    )
    .await
}

/// Registry with one agent `name` running `executable` with `standard`
/// arguments.
pub fn agent(name: &str, executable: &str, standard: &[&str]) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry.register(AgentProvider {
        name: name.to_string(),
        executable: executable.to_string(),
        health_check: vec![],
        modes: ModeTemplates {
            standard: Some(standard.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        },
        prompt_via_stdin: false,
        env: Default::default(),
    });
    registry
}
