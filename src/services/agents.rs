//! Agent-provider registry.
//!
//! Knows, per external agent, which executable to run, how to check it is
//! installed, and which arguments to pass for each permission mode. The
//! executor only ever sees the finished [`CommandSpec`].
//!
//! Providers are read from a TOML file:
//!
//! ```toml
//! [[agents]]
//! name = "claude"
//! executable = "claude"
//! health_check = ["--version"]
//!
//! [agents.modes]
//! read_only = ["-p", "{prompt}", "--permission-mode", "plan"]
//! standard = ["-p", "{prompt}"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use mnemo_models::{Memory, PermissionMode};

use crate::error::{Error, Result};

use super::executor::{CommandRunner, CommandSpec};

/// Placeholder replaced by the prompt in argument templates.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Timeout for provider health checks.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Argument templates per permission mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModeTemplates {
    pub read_only: Option<Vec<String>>,
    pub standard: Option<Vec<String>>,
    pub autonomous: Option<Vec<String>>,
}

impl ModeTemplates {
    pub fn get(&self, mode: PermissionMode) -> Option<&[String]> {
        match mode {
            PermissionMode::ReadOnly => self.read_only.as_deref(),
            PermissionMode::Standard => self.standard.as_deref(),
            PermissionMode::Autonomous => self.autonomous.as_deref(),
        }
    }
}

/// One external agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentProvider {
    pub name: String,
    pub executable: String,
    #[serde(default)]
    pub health_check: Vec<String>,
    #[serde(default)]
    pub modes: ModeTemplates,
    /// Pass the prompt on stdin instead of through `{prompt}`
    #[serde(default)]
    pub prompt_via_stdin: bool,
    /// Extra environment for the agent process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl AgentProvider {
    /// Build the command running `prompt` in `mode`.
    ///
    /// Without stdin delegation, every `{prompt}` in the template is
    /// substituted; a template with no placeholder gets the prompt as its
    /// last argument.
    pub fn build_command(&self, mode: PermissionMode, prompt: &str) -> Result<CommandSpec> {
        let template = self.modes.get(mode).ok_or_else(|| {
            Error::AgentConfig(format!(
                "agent {} has no arguments for {} mode",
                self.name, mode
            ))
        })?;

        let mut spec = CommandSpec::new(&self.executable);
        for (key, value) in &self.env {
            spec = spec.env(key, value);
        }

        if self.prompt_via_stdin {
            return Ok(spec.args(template.iter().cloned()).stdin(prompt));
        }

        let mut substituted = false;
        let args: Vec<String> = template
            .iter()
            .map(|arg| {
                if arg.contains(PROMPT_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(PROMPT_PLACEHOLDER, prompt)
                } else {
                    arg.clone()
                }
            })
            .collect();
        spec = spec.args(args);
        if !substituted {
            spec = spec.arg(prompt);
        }
        Ok(spec)
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    agents: Vec<AgentProvider>,
}

/// Result of probing an agent's executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent: String,
    pub available: bool,
    /// First line of the health check output
    pub version: Option<String>,
    pub error: Option<String>,
}

/// Registry of known agent providers, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    providers: BTreeMap<String, AgentProvider>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the providers mnemo knows out of the box.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(AgentProvider {
            name: "claude".to_string(),
            executable: "claude".to_string(),
            health_check: vec!["--version".to_string()],
            modes: ModeTemplates {
                read_only: Some(strings(&["-p", PROMPT_PLACEHOLDER, "--permission-mode", "plan"])),
                standard: Some(strings(&[
                    "-p",
                    PROMPT_PLACEHOLDER,
                    "--permission-mode",
                    "acceptEdits",
                ])),
                autonomous: Some(strings(&[
                    "-p",
                    PROMPT_PLACEHOLDER,
                    "--dangerously-skip-permissions",
                ])),
            },
            prompt_via_stdin: false,
            env: BTreeMap::new(),
        });
        registry
    }

    /// Parse providers from TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: RegistryFile = toml::from_str(content)
            .map_err(|e| Error::AgentConfig(format!("invalid agent registry: {}", e)))?;

        let mut registry = Self::new();
        for provider in file.agents {
            if provider.executable.trim().is_empty() {
                return Err(Error::AgentConfig(format!(
                    "agent {} has an empty executable",
                    provider.name
                )));
            }
            if registry.providers.contains_key(&provider.name) {
                return Err(Error::AgentConfig(format!(
                    "agent {} is defined twice",
                    provider.name
                )));
            }
            registry.register(provider);
        }
        Ok(registry)
    }

    /// Built-in providers overlaid with the ones in `path`.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::AgentConfig(format!("cannot read {}: {}", path.display(), e))
        })?;

        let mut registry = Self::builtin();
        let loaded = Self::from_toml_str(&content)?;
        for provider in loaded.providers.into_values() {
            registry.register(provider);
        }

        info!(path = %path.display(), agents = registry.len(), "Loaded agent registry");
        Ok(registry)
    }

    /// Load from `path` when set, else the built-in registry.
    pub async fn from_optional_file(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path).await,
            None => Ok(Self::builtin()),
        }
    }

    /// Add or replace a provider.
    pub fn register(&mut self, provider: AgentProvider) {
        self.providers.insert(provider.name.clone(), provider);
    }

    pub fn get(&self, name: &str) -> Result<&AgentProvider> {
        self.providers
            .get(name)
            .ok_or_else(|| Error::AgentConfig(format!("unknown agent: {}", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Run the agent's health check.
    ///
    /// A missing executable or failing check is reported as unavailable,
    /// not as an error. Only an unknown agent name fails.
    pub async fn check_agent_health(
        &self,
        runner: &dyn CommandRunner,
        name: &str,
    ) -> Result<AgentHealth> {
        let provider = self.get(name)?;
        let spec = CommandSpec::new(&provider.executable)
            .args(provider.health_check.iter().cloned())
            .timeout(HEALTH_CHECK_TIMEOUT);

        let health = match runner.run(spec, None).await {
            Ok(output) => AgentHealth {
                agent: name.to_string(),
                available: true,
                version: output
                    .stdout
                    .lines()
                    .map(str::trim)
                    .find(|l| !l.is_empty())
                    .map(str::to_string),
                error: None,
            },
            Err(e) => {
                warn!(agent = %name, error = %e, "Agent health check failed");
                AgentHealth {
                    agent: name.to_string(),
                    available: false,
                    version: None,
                    error: Some(e.to_string()),
                }
            }
        };

        debug!(agent = %name, available = health.available, "Checked agent health");
        Ok(health)
    }
}

/// Prompt handed to an agent for a task.
pub fn compose_prompt(task: &Memory, extra_instructions: Option<&str>) -> String {
    let mut prompt = format!(
        "You are working on {} {}: {}\n",
        task.memory_type, task.id, task.title
    );

    if let Some(fields) = task.task() {
        prompt.push_str(&format!("Priority: {}\n", fields.priority));
        if !fields.dependencies.is_empty() {
            prompt.push_str(&format!(
                "Depends on: {}\n",
                fields.dependencies.join(", ")
            ));
        }
    }
    if !task.header.tags.is_empty() {
        prompt.push_str(&format!("Tags: {}\n", task.header.tags.join(", ")));
    }

    prompt.push('\n');
    prompt.push_str(task.content.trim());
    prompt.push('\n');

    if let Some(extra) = extra_instructions.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str("\nAdditional instructions:\n");
        prompt.push_str(extra);
        prompt.push('\n');
    }
    prompt
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_models::{MemoryHeader, MemoryType};

    const REGISTRY: &str = r#"
[[agents]]
name = "echo"
executable = "echo"
health_check = ["ok"]

[agents.modes]
standard = ["run", "{prompt}"]
read_only = ["--dry"]

[[agents]]
name = "piped"
executable = "cat"
prompt_via_stdin = true

[agents.modes]
standard = []

[agents.env]
PIPED = "1"
"#;

    #[test]
    fn test_parse_registry() {
        let registry = AgentRegistry::from_toml_str(REGISTRY).unwrap();
        assert_eq!(registry.names(), vec!["echo", "piped"]);
        assert_eq!(registry.get("echo").unwrap().health_check, vec!["ok"]);
        assert_eq!(
            registry.get("nope").unwrap_err().error_code(),
            "AGENT_CONFIG_ERROR"
        );
    }

    #[test]
    fn test_rejects_unknown_keys_and_duplicates() {
        let bad = "[[agents]]\nname = \"a\"\nexecutable = \"a\"\nflavour = \"x\"\n";
        assert!(AgentRegistry::from_toml_str(bad).is_err());

        let twice = "[[agents]]\nname = \"a\"\nexecutable = \"a\"\n\n[[agents]]\nname = \"a\"\nexecutable = \"b\"\n";
        assert!(AgentRegistry::from_toml_str(twice).is_err());
    }

    #[test]
    fn test_build_command_substitutes_prompt() {
        let registry = AgentRegistry::from_toml_str(REGISTRY).unwrap();
        let echo = registry.get("echo").unwrap();

        let spec = echo.build_command(PermissionMode::Standard, "do it").unwrap();
        assert_eq!(spec.program, "echo");
        assert_eq!(spec.args, vec!["run", "do it"]);
        assert!(spec.stdin.is_none());

        let spec = echo.build_command(PermissionMode::ReadOnly, "look").unwrap();
        assert_eq!(spec.args, vec!["--dry", "look"]);

        assert!(echo.build_command(PermissionMode::Autonomous, "x").is_err());
    }

    #[test]
    fn test_build_command_with_stdin_prompt() {
        let registry = AgentRegistry::from_toml_str(REGISTRY).unwrap();
        let spec = registry
            .get("piped")
            .unwrap()
            .build_command(PermissionMode::Standard, "hello")
            .unwrap();
        assert!(spec.args.is_empty());
        assert_eq!(spec.stdin.as_deref(), Some("hello"));
        assert_eq!(spec.env.get("PIPED").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_builtin_has_claude() {
        let registry = AgentRegistry::builtin();
        let claude = registry.get("claude").unwrap();
        for mode in [
            PermissionMode::ReadOnly,
            PermissionMode::Standard,
            PermissionMode::Autonomous,
        ] {
            assert!(claude.modes.get(mode).is_some());
        }
    }

    #[tokio::test]
    async fn test_load_overlays_builtin() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agents.toml");
        tokio::fs::write(&path, REGISTRY).await.unwrap();

        let registry = AgentRegistry::load(&path).await.unwrap();
        assert_eq!(registry.names(), vec!["claude", "echo", "piped"]);

        let missing = AgentRegistry::load(&dir.path().join("none.toml")).await;
        assert!(missing.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_health_check() {
        let runner = crate::services::executor::ProcessExecutor::new(0);
        let mut registry = AgentRegistry::from_toml_str(REGISTRY).unwrap();
        registry.register(AgentProvider {
            name: "ghost".into(),
            executable: "definitely-not-installed-mnemo".into(),
            health_check: vec![],
            modes: ModeTemplates::default(),
            prompt_via_stdin: false,
            env: BTreeMap::new(),
        });

        let health = registry.check_agent_health(&runner, "echo").await.unwrap();
        assert!(health.available);
        assert_eq!(health.version.as_deref(), Some("ok"));

        let health = registry.check_agent_health(&runner, "ghost").await.unwrap();
        assert!(!health.available);
        assert!(health.error.is_some());
    }

    #[test]
    fn test_compose_prompt() {
        let mut header = MemoryHeader::new(MemoryType::Task);
        header.tags = vec!["api".into()];
        if let Some(task) = match &mut header.kind {
            mnemo_models::HeaderKind::Task(task) => Some(task),
            _ => None,
        } {
            task.dependencies = vec!["task-setup".into()];
        }
        let memory = Memory {
            id: "task-build".into(),
            memory_type: MemoryType::Task,
            title: "Build".into(),
            content: "# Build\n\nMake it work.".into(),
            header,
            file_path: None,
        };

        let prompt = compose_prompt(&memory, Some("Be brief."));
        assert!(prompt.starts_with("You are working on task task-build: Build\n"));
        assert!(prompt.contains("Priority: medium\n"));
        assert!(prompt.contains("Depends on: task-setup\n"));
        assert!(prompt.contains("Tags: api\n"));
        assert!(prompt.contains("Make it work."));
        assert!(prompt.ends_with("Additional instructions:\nBe brief.\n"));
    }
}
