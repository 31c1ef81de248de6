//! Memory model for stored knowledge and task records.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::links::Relationship;
use crate::task::{Delegation, TaskFields};

/// Confidence assigned when the caller does not provide one.
pub const DEFAULT_CONFIDENCE: f64 = 0.8;

/// Source of a memory - how it was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    /// Entered directly by the user
    User,
    /// Created by an AI agent
    #[default]
    Agent,
    /// Derived from analysing source code
    CodeAnalysis,
    /// Extracted from a conversation
    Conversation,
    /// Imported from another store
    Import,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySource::User => "user",
            MemorySource::Agent => "agent",
            MemorySource::CodeAnalysis => "code_analysis",
            MemorySource::Conversation => "conversation",
            MemorySource::Import => "import",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "user" => Some(MemorySource::User),
            "agent" => Some(MemorySource::Agent),
            "code_analysis" => Some(MemorySource::CodeAnalysis),
            "conversation" => Some(MemorySource::Conversation),
            "import" => Some(MemorySource::Import),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Types of memories that can be stored.
///
/// The first nine are knowledge records; the last four are
/// task-management records, which carry [`TaskFields`] in their header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Recurring solution or approach
    Pattern,
    /// Concrete code idiom used in the project
    CodePattern,
    /// A decision and its context
    Decision,
    /// Architecture decision record
    ArchitecturalDecision,
    /// User or team preference
    Preference,
    /// Observation about the codebase
    Insight,
    /// Something learned while working
    Learning,
    /// Free-standing note about how two things relate
    Relationship,
    /// Retrospective reflection
    Reflection,
    /// Requirement
    Requirement,
    /// Design document
    Design,
    /// Work item
    Task,
    /// Bug report
    Bug,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Pattern => "pattern",
            MemoryType::CodePattern => "code_pattern",
            MemoryType::Decision => "decision",
            MemoryType::ArchitecturalDecision => "architectural_decision",
            MemoryType::Preference => "preference",
            MemoryType::Insight => "insight",
            MemoryType::Learning => "learning",
            MemoryType::Relationship => "relationship",
            MemoryType::Reflection => "reflection",
            MemoryType::Requirement => "requirement",
            MemoryType::Design => "design",
            MemoryType::Task => "task",
            MemoryType::Bug => "bug",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pattern" => Some(MemoryType::Pattern),
            "code_pattern" => Some(MemoryType::CodePattern),
            "decision" => Some(MemoryType::Decision),
            "architectural_decision" => Some(MemoryType::ArchitecturalDecision),
            "preference" => Some(MemoryType::Preference),
            "insight" => Some(MemoryType::Insight),
            "learning" => Some(MemoryType::Learning),
            "relationship" => Some(MemoryType::Relationship),
            "reflection" => Some(MemoryType::Reflection),
            "requirement" => Some(MemoryType::Requirement),
            "design" => Some(MemoryType::Design),
            "task" => Some(MemoryType::Task),
            "bug" => Some(MemoryType::Bug),
            _ => None,
        }
    }

    pub fn all() -> &'static [MemoryType] {
        &[
            MemoryType::Pattern,
            MemoryType::CodePattern,
            MemoryType::Decision,
            MemoryType::ArchitecturalDecision,
            MemoryType::Preference,
            MemoryType::Insight,
            MemoryType::Learning,
            MemoryType::Relationship,
            MemoryType::Reflection,
            MemoryType::Requirement,
            MemoryType::Design,
            MemoryType::Task,
            MemoryType::Bug,
        ]
    }

    /// The task-management variants.
    pub fn task_types() -> &'static [MemoryType] {
        &[
            MemoryType::Requirement,
            MemoryType::Design,
            MemoryType::Task,
            MemoryType::Bug,
        ]
    }

    /// Whether records of this type carry task fields.
    pub fn is_task_management(&self) -> bool {
        matches!(
            self,
            MemoryType::Requirement | MemoryType::Design | MemoryType::Task | MemoryType::Bug
        )
    }

    /// Prefix used when deriving record ids.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            MemoryType::Pattern => "pattern",
            MemoryType::CodePattern => "code-pattern",
            MemoryType::Decision => "decision",
            MemoryType::ArchitecturalDecision => "adr",
            MemoryType::Preference => "pref",
            MemoryType::Insight => "insight",
            MemoryType::Learning => "learning",
            MemoryType::Relationship => "rel",
            MemoryType::Reflection => "reflection",
            MemoryType::Requirement => "req",
            MemoryType::Design => "design",
            MemoryType::Task => "task",
            MemoryType::Bug => "bug",
        }
    }

    /// Directory, relative to the store base, that holds this type.
    pub fn directory(&self) -> &'static str {
        match self {
            MemoryType::Pattern | MemoryType::CodePattern => "patterns",
            MemoryType::Decision | MemoryType::ArchitecturalDecision => "decisions",
            MemoryType::Preference => "preferences",
            MemoryType::Insight | MemoryType::Learning => "insights",
            MemoryType::Relationship => "relationships",
            MemoryType::Reflection => "reflections",
            MemoryType::Requirement => "project/requirements",
            MemoryType::Design => "project/designs",
            MemoryType::Task => "project/tasks",
            MemoryType::Bug => "project/bugs",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Type-specific part of the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeaderKind {
    Knowledge,
    Task(TaskFields),
}

/// Metadata block stored ahead of a record's body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHeader {
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub source: MemorySource,
    pub project_root: Option<String>,
    pub category: Option<String>,
    pub sensitive: Option<bool>,
    /// Outgoing edges owned by this record
    pub relationships: Vec<Relationship>,
    pub kind: HeaderKind,
}

impl MemoryHeader {
    /// A fresh header for a record of `memory_type`.
    pub fn new(memory_type: MemoryType) -> Self {
        let now = crate::now();
        Self {
            confidence: DEFAULT_CONFIDENCE,
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
            source: MemorySource::default(),
            project_root: None,
            category: None,
            sensitive: None,
            relationships: Vec::new(),
            kind: if memory_type.is_task_management() {
                HeaderKind::Task(TaskFields::default())
            } else {
                HeaderKind::Knowledge
            },
        }
    }

    pub fn is_sensitive(&self) -> bool {
        self.sensitive.unwrap_or(false)
    }
}

/// A single stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    /// Derived from the first top-level heading of the body
    pub title: String,
    pub content: String,
    pub header: MemoryHeader,
    /// Where the record was read from, when loaded from disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
}

impl Memory {
    pub fn task(&self) -> Option<&TaskFields> {
        match &self.header.kind {
            HeaderKind::Task(task) => Some(task),
            HeaderKind::Knowledge => None,
        }
    }

    pub fn task_mut(&mut self) -> Option<&mut TaskFields> {
        match &mut self.header.kind {
            HeaderKind::Task(task) => Some(task),
            HeaderKind::Knowledge => None,
        }
    }

    pub fn delegation(&self) -> Option<&Delegation> {
        self.task().and_then(|t| t.delegation.as_ref())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.header.tags.iter().any(|t| t == tag)
    }
}

/// Request model for creating a memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCreate {
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source: Option<MemorySource>,
    #[serde(default)]
    pub project_root: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub sensitive: Option<bool>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    /// Initial task fields; ignored for knowledge records
    #[serde(default)]
    pub task: Option<TaskFields>,
}

impl MemoryCreate {
    pub fn new(memory_type: MemoryType, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            memory_type,
            title: title.into(),
            content: content.into(),
            confidence: None,
            tags: Vec::new(),
            source: None,
            project_root: None,
            category: None,
            sensitive: None,
            relationships: Vec::new(),
            task: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_sensitive(mut self, sensitive: bool) -> Self {
        self.sensitive = Some(sensitive);
        self
    }

    pub fn with_task(mut self, task: TaskFields) -> Self {
        self.task = Some(task);
        self
    }
}

/// Request model for updating a memory.
///
/// Header fields merge shallowly: only `Some` values replace what is stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub confidence: Option<f64>,
    pub tags: Option<Vec<String>>,
    pub source: Option<MemorySource>,
    pub project_root: Option<String>,
    pub category: Option<String>,
    pub sensitive: Option<bool>,
    pub task: Option<crate::task::TaskUpdate>,
}
