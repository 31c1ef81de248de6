//! Record codec: markdown documents with YAML frontmatter.
//!
//! A record is stored as
//!
//! ```text
//! ---
//! id: insight-hello-world
//! type: insight
//! ...
//! ---
//!
//! # Hello
//! World
//! ```
//!
//! The header is validated against a fixed field set before it is decoded,
//! and every violation is reported at once. The title is not stored in the
//! header; it is the first top-level heading of the body.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use mnemo_models::{
    Delegation, DelegationStatus, HeaderKind, Memory, MemoryHeader, MemorySource, MemoryType,
    PermissionMode, Priority, Relationship, RelationshipKind, TaskFields, TaskStatus,
};
use mnemo_storage::slug::slugify;

use crate::error::{Error, FieldViolation, Result, ValidationFailure};

/// File extension of record documents.
pub const RECORD_EXTENSION: &str = "mdx";

static HEADING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#[ \t]+(.+?)[ \t]*$").expect("heading regex"));

/// Header fields every record may carry.
const BASE_FIELDS: &[&str] = &[
    "id",
    "type",
    "confidence",
    "created_at",
    "updated_at",
    "tags",
    "source",
    "project_root",
    "category",
    "sensitive",
    "relationships",
];

/// Header fields only task-management records may carry.
const TASK_FIELDS: &[&str] = &[
    "status",
    "priority",
    "assignee",
    "due_date",
    "dependencies",
    "blocks",
    "delegation_status",
    "delegation_job_id",
    "delegation_agent",
    "delegation_mode",
    "delegation_queued_at",
    "delegation_started_at",
    "delegation_completed_at",
    "delegation_process_id",
    "delegation_output_file",
    "delegation_progress",
    "delegation_error",
    "delegation_attempts",
];

const RELATIONSHIP_FIELDS: &[&str] = &[
    "target_id",
    "target_type",
    "kind",
    "strength",
    "confidence",
    "metadata",
    "validated",
    "created_at",
];

/// Derive a record id from its title and type.
///
/// Titles that normalise to the same slug produce the same id. A title with
/// no usable characters falls back to the type name and the current time.
pub fn make_id(title: &str, memory_type: MemoryType) -> String {
    let slug = slugify(title);
    if slug.is_empty() {
        format!("{}-{}", memory_type.as_str(), Utc::now().timestamp_millis())
    } else {
        format!("{}-{}", memory_type.id_prefix(), slug)
    }
}

/// Text of the first top-level heading in `body`.
pub fn extract_title(body: &str) -> Option<String> {
    HEADING_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|t| !t.is_empty())
}

/// Prepend `# title` unless the body already opens a top-level heading.
pub fn ensure_heading(title: &str, body: &str) -> String {
    if extract_title(body).is_some() || title.trim().is_empty() {
        body.to_string()
    } else {
        format!("# {}\n\n{}", title.trim(), body)
    }
}

/// Replace the first top-level heading with `title`, or prepend one.
pub fn replace_heading(title: &str, body: &str) -> String {
    if HEADING_RE.is_match(body) {
        HEADING_RE
            .replace(body, format!("# {}", title.trim()).as_str())
            .into_owned()
    } else {
        format!("# {}\n\n{}", title.trim(), body)
    }
}

/// Wire form of the header. Task and delegation fields are flat and
/// omitted when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Frontmatter {
    id: String,
    #[serde(rename = "type")]
    memory_type: MemoryType,
    #[serde(default = "default_confidence")]
    confidence: f64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<MemorySource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    project_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sensitive: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    relationships: Vec<Relationship>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    due_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    blocks: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegation_status: Option<DelegationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegation_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegation_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegation_mode: Option<PermissionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegation_queued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegation_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegation_completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegation_process_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegation_output_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegation_progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegation_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegation_attempts: Option<u32>,
}

fn default_confidence() -> f64 {
    mnemo_models::DEFAULT_CONFIDENCE
}

impl Frontmatter {
    fn from_memory(memory: &Memory) -> Self {
        let header = &memory.header;
        let task = memory.task();
        let delegation = memory.delegation();

        Self {
            id: memory.id.clone(),
            memory_type: memory.memory_type,
            confidence: header.confidence,
            created_at: header.created_at,
            updated_at: header.updated_at,
            tags: header.tags.clone(),
            source: Some(header.source),
            project_root: header.project_root.clone(),
            category: header.category.clone(),
            sensitive: header.sensitive,
            relationships: header.relationships.clone(),

            status: task.map(|t| t.status),
            priority: task.map(|t| t.priority),
            assignee: task.and_then(|t| t.assignee.clone()),
            due_date: task.and_then(|t| t.due_date),
            dependencies: task.map(|t| t.dependencies.clone()).unwrap_or_default(),
            blocks: task.map(|t| t.blocks.clone()).unwrap_or_default(),

            delegation_status: delegation.map(|d| d.status),
            delegation_job_id: delegation.and_then(|d| d.job_id.clone()),
            delegation_agent: delegation.and_then(|d| d.agent.clone()),
            delegation_mode: delegation.and_then(|d| d.mode),
            delegation_queued_at: delegation.and_then(|d| d.queued_at),
            delegation_started_at: delegation.and_then(|d| d.started_at),
            delegation_completed_at: delegation.and_then(|d| d.completed_at),
            delegation_process_id: delegation.and_then(|d| d.process_id),
            delegation_output_file: delegation.and_then(|d| d.output_file.clone()),
            delegation_progress: delegation.and_then(|d| d.progress.clone()),
            delegation_error: delegation.and_then(|d| d.error.clone()),
            delegation_attempts: delegation.map(|d| d.attempts),
        }
    }

    fn into_memory(self, title: String, content: String) -> Memory {
        let kind = if self.memory_type.is_task_management() {
            let delegation = self.delegation_status.map(|status| Delegation {
                status,
                job_id: self.delegation_job_id,
                agent: self.delegation_agent,
                mode: self.delegation_mode,
                queued_at: self.delegation_queued_at,
                started_at: self.delegation_started_at,
                completed_at: self.delegation_completed_at,
                process_id: self.delegation_process_id,
                output_file: self.delegation_output_file,
                progress: self.delegation_progress,
                error: self.delegation_error,
                attempts: self.delegation_attempts.unwrap_or(0),
            });
            HeaderKind::Task(TaskFields {
                status: self.status.unwrap_or_default(),
                priority: self.priority.unwrap_or_default(),
                assignee: self.assignee,
                due_date: self.due_date,
                dependencies: self.dependencies,
                blocks: self.blocks,
                delegation,
            })
        } else {
            HeaderKind::Knowledge
        };

        Memory {
            id: self.id,
            memory_type: self.memory_type,
            title,
            content,
            header: MemoryHeader {
                confidence: self.confidence,
                created_at: self.created_at,
                updated_at: self.updated_at,
                tags: self.tags,
                source: self.source.unwrap_or_default(),
                project_root: self.project_root,
                category: self.category,
                sensitive: self.sensitive,
                relationships: self.relationships,
                kind,
            },
            file_path: None,
        }
    }
}

/// A decoded record and any non-fatal findings.
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub memory: Memory,
    pub warnings: Vec<String>,
}

/// Result of a non-mutating record check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

/// Service for encoding and decoding record documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownCodec;

impl MarkdownCodec {
    /// Create a new codec.
    pub fn new() -> Self {
        Self
    }

    /// Render a record as frontmatter followed by its body.
    pub fn serialize(&self, memory: &Memory) -> Result<String> {
        let yaml = serde_yaml::to_string(&Frontmatter::from_memory(memory))?;
        Ok(format!("---\n{}---\n\n{}", yaml, memory.content))
    }

    /// Parse a record document, validating the whole header first.
    pub fn deserialize(&self, text: &str) -> Result<ParsedRecord> {
        let text = text.replace("\r\n", "\n");
        let (header, body) = split_frontmatter(&text).ok_or_else(|| {
            Error::Validation(ValidationFailure {
                violations: vec![FieldViolation::new(
                    "frontmatter",
                    "document does not start with a closed '---' header block",
                )],
            })
        })?;

        let parsed = serde_yaml::from_str::<Value>(header).map_err(|e| {
            Error::Validation(ValidationFailure {
                violations: vec![FieldViolation::new(
                    "frontmatter",
                    format!("invalid YAML: {}", e),
                )],
            })
        })?;
        let map = match parsed {
            Value::Mapping(map) => map
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .collect::<Mapping>(),
            _ => {
                return Err(Error::Validation(ValidationFailure {
                    violations: vec![FieldViolation::new("frontmatter", "header must be a mapping")],
                }))
            }
        };

        let violations = validate_header(&map);
        if !violations.is_empty() {
            return Err(Error::Validation(ValidationFailure { violations }));
        }

        let frontmatter: Frontmatter = serde_yaml::from_value(Value::Mapping(map))?;
        let content = body.trim_start_matches('\n').to_string();

        let mut warnings = Vec::new();
        let title = match extract_title(&content) {
            Some(title) => title,
            None => {
                warnings.push(format!(
                    "no top-level heading in {}; using id as title",
                    frontmatter.id
                ));
                frontmatter.id.clone()
            }
        };

        Ok(ParsedRecord {
            memory: frontmatter.into_memory(title, content),
            warnings,
        })
    }

    /// Schema violations of the header `memory` would be written with.
    pub fn header_violations(&self, memory: &Memory) -> Vec<FieldViolation> {
        match serde_yaml::to_value(Frontmatter::from_memory(memory)) {
            Ok(Value::Mapping(map)) => validate_header(&map),
            Ok(_) => vec![FieldViolation::new("frontmatter", "header must be a mapping")],
            Err(e) => vec![FieldViolation::new(
                "frontmatter",
                format!("header failed to encode: {}", e),
            )],
        }
    }

    /// Check a record without changing it.
    pub fn validate(&self, memory: &Memory) -> ValidationResult {
        let mut result = ValidationResult::default();

        if memory.id.trim().is_empty() {
            result.errors.push("id: must not be empty".to_string());
        }

        result.errors.extend(
            self.header_violations(memory)
                .iter()
                .map(|v| v.to_string()),
        );

        if memory.title.trim().is_empty() {
            result
                .warnings
                .push("title is empty; the id will be used as the title".to_string());
        }
        if extract_title(&memory.content).is_none() {
            result
                .warnings
                .push("body has no top-level heading".to_string());
        }

        if memory.header.tags.is_empty() {
            result
                .suggestions
                .push("add tags so the record can be found by tag search".to_string());
        }
        if memory.header.confidence < 0.5 {
            result
                .suggestions
                .push("confidence is low; confirm the record or raise it".to_string());
        }

        result.is_valid = result.errors.is_empty();
        result
    }
}

/// Split a document into header text and body.
fn split_frontmatter(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let header = &rest[..end];
    let after = &rest[end + 4..];
    // The closing delimiter must end its line.
    let body = match after.find('\n') {
        Some(nl) if after[..nl].trim().is_empty() => &after[nl + 1..],
        None if after.trim().is_empty() => "",
        _ => return None,
    };
    Some((header, body))
}

// ============================================================================
// Header schema
// ============================================================================

/// Collects violations while walking a header mapping.
struct SchemaCheck<'a> {
    map: &'a Mapping,
    prefix: String,
    violations: Vec<FieldViolation>,
}

impl<'a> SchemaCheck<'a> {
    fn new(map: &'a Mapping, prefix: impl Into<String>) -> Self {
        Self {
            map,
            prefix: prefix.into(),
            violations: Vec::new(),
        }
    }

    fn name(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.prefix, key)
        }
    }

    fn fail(&mut self, key: &str, message: impl Into<String>) {
        let field = self.name(key);
        self.violations.push(FieldViolation::new(field, message));
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key)
    }

    fn known_fields(&mut self, allowed: &[&str]) {
        for key in self.map.keys() {
            match key.as_str() {
                Some(k) if allowed.contains(&k) => {}
                Some(k) => self.fail(k, "unknown field"),
                None => self.fail("?", "field names must be strings"),
            }
        }
    }

    fn required(&mut self, key: &str) -> bool {
        if self.get(key).is_none() {
            self.fail(key, "required field is missing");
            false
        } else {
            true
        }
    }

    fn string(&mut self, key: &str) -> Option<&'a str> {
        let value = self.get(key)?;
        match value.as_str() {
            Some(s) => Some(s),
            None => {
                self.fail(key, "must be a string");
                None
            }
        }
    }

    fn non_empty_string(&mut self, key: &str) -> Option<&'a str> {
        let s = self.string(key)?;
        if s.trim().is_empty() {
            self.fail(key, "must not be empty");
            return None;
        }
        Some(s)
    }

    fn timestamp(&mut self, key: &str) -> Option<DateTime<Utc>> {
        let s = self.string(key)?;
        match DateTime::parse_from_rfc3339(s) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(_) => {
                self.fail(key, "must be an RFC 3339 timestamp");
                None
            }
        }
    }

    fn unit_interval(&mut self, key: &str) {
        let Some(value) = self.get(key) else { return };
        match value.as_f64() {
            Some(n) if (0.0..=1.0).contains(&n) => {}
            Some(_) => self.fail(key, "must be between 0.0 and 1.0"),
            None => self.fail(key, "must be a number"),
        }
    }

    fn boolean(&mut self, key: &str) {
        if let Some(value) = self.get(key) {
            if value.as_bool().is_none() {
                self.fail(key, "must be a boolean");
            }
        }
    }

    fn unsigned(&mut self, key: &str) {
        let Some(value) = self.get(key) else { return };
        match value.as_u64() {
            Some(n) if n <= u64::from(u32::MAX) => {}
            _ => self.fail(key, "must be a non-negative integer"),
        }
    }

    fn string_list(&mut self, key: &str) {
        let Some(value) = self.get(key) else { return };
        match value.as_sequence() {
            Some(items) if items.iter().all(|v| v.as_str().is_some()) => {}
            _ => self.fail(key, "must be a list of strings"),
        }
    }

    fn one_of(&mut self, key: &str, valid: fn(&str) -> bool, allowed: &[&str]) {
        let Some(s) = self.string(key) else { return };
        if !valid(s) {
            self.fail(key, format!("must be one of: {}", allowed.join(", ")));
        }
    }
}

fn memory_type_names() -> Vec<&'static str> {
    MemoryType::all().iter().map(|t| t.as_str()).collect()
}

/// Check a header mapping against the record schema.
fn validate_header(map: &Mapping) -> Vec<FieldViolation> {
    let mut check = SchemaCheck::new(map, "");
    let type_names = memory_type_names();

    let memory_type = if check.required("type") {
        match check.string("type") {
            Some(s) => {
                let parsed = MemoryType::from_str(s);
                if parsed.is_none() {
                    check.fail("type", format!("must be one of: {}", type_names.join(", ")));
                }
                parsed
            }
            None => None,
        }
    } else {
        None
    };

    for key in map.keys() {
        let Some(k) = key.as_str() else {
            check.fail("?", "field names must be strings");
            continue;
        };
        if BASE_FIELDS.contains(&k) {
            continue;
        }
        if TASK_FIELDS.contains(&k) {
            if let Some(t) = memory_type {
                if !t.is_task_management() {
                    check.fail(k, format!("not allowed on {} records", t));
                }
            }
            continue;
        }
        check.fail(k, "unknown field");
    }

    if check.required("id") {
        check.non_empty_string("id");
    }

    let created = if check.required("created_at") {
        check.timestamp("created_at")
    } else {
        None
    };
    let updated = if check.required("updated_at") {
        check.timestamp("updated_at")
    } else {
        None
    };
    if let (Some(created), Some(updated)) = (created, updated) {
        if updated < created {
            check.fail("updated_at", "must not precede created_at");
        }
    }

    check.unit_interval("confidence");
    check.string_list("tags");
    check.one_of(
        "source",
        |s| MemorySource::from_str(s).is_some(),
        &["user", "agent", "code_analysis", "conversation", "import"],
    );
    check.string("project_root");
    if let Some(category) = check.string("category") {
        if category.contains('/') || category.contains('\\') || category.contains("..") {
            check.fail("category", "must not contain path separators");
        }
    }
    check.boolean("sensitive");

    // Task-management fields
    check.one_of(
        "status",
        |s| TaskStatus::from_str(s).is_some(),
        &["todo", "in_progress", "blocked", "done"],
    );
    check.one_of(
        "priority",
        |s| Priority::from_str(s).is_some(),
        &["low", "medium", "high", "urgent"],
    );
    check.string("assignee");
    check.timestamp("due_date");
    check.string_list("dependencies");
    check.string_list("blocks");

    check.one_of(
        "delegation_status",
        |s| DelegationStatus::from_str(s).is_some(),
        &["queued", "running", "completed", "failed", "cancelled"],
    );
    check.one_of(
        "delegation_mode",
        |s| PermissionMode::from_str(s).is_some(),
        &["read_only", "standard", "autonomous"],
    );
    for key in [
        "delegation_job_id",
        "delegation_agent",
        "delegation_output_file",
        "delegation_progress",
        "delegation_error",
    ] {
        check.string(key);
    }
    for key in [
        "delegation_queued_at",
        "delegation_started_at",
        "delegation_completed_at",
    ] {
        check.timestamp(key);
    }
    check.unsigned("delegation_process_id");
    check.unsigned("delegation_attempts");

    let has_delegation_fields = map
        .keys()
        .filter_map(Value::as_str)
        .any(|k| k.starts_with("delegation_") && k != "delegation_status");
    if has_delegation_fields && check.get("delegation_status").is_none() {
        check.fail(
            "delegation_status",
            "required when other delegation fields are present",
        );
    }

    let mut violations = check.violations;

    if let Some(value) = map.get("relationships") {
        match value.as_sequence() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    violations.extend(validate_relationship(i, item));
                }
            }
            None => violations.push(FieldViolation::new("relationships", "must be a list")),
        }
    }

    violations
}

fn validate_relationship(index: usize, value: &Value) -> Vec<FieldViolation> {
    let prefix = format!("relationships[{}]", index);
    let Some(map) = value.as_mapping() else {
        return vec![FieldViolation::new(prefix, "must be a mapping")];
    };

    let mut check = SchemaCheck::new(map, prefix);
    check.known_fields(RELATIONSHIP_FIELDS);

    if check.required("target_id") {
        check.non_empty_string("target_id");
    }
    let type_names = memory_type_names();
    if let Some(s) = check.string("target_type") {
        if MemoryType::from_str(s).is_none() {
            check.fail("target_type", format!("must be one of: {}", type_names.join(", ")));
        }
    }
    if check.required("kind") {
        if let Some(s) = check.string("kind") {
            if RelationshipKind::from_str(s).is_none() {
                let kinds: Vec<&str> = RelationshipKind::all().iter().map(|k| k.as_str()).collect();
                check.fail("kind", format!("must be one of: {}", kinds.join(", ")));
            }
        }
    }
    check.unit_interval("strength");
    check.unit_interval("confidence");
    check.boolean("validated");
    if check.required("created_at") {
        check.timestamp("created_at");
    }
    if let Some(metadata) = check.get("metadata") {
        if !metadata.is_mapping() {
            check.fail("metadata", "must be a mapping");
        }
    }

    check.violations
}
