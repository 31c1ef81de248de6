//! Memory service: the record store.
//!
//! CRUD over records stored as individual documents under the store base
//! directory. Knowledge records nest under their category; task-management
//! records always live flat in their type directory so lookups by id stay
//! predictable.
//!
//! Every read goes to disk. Read-modify-write sequences for a single record
//! are serialised by a per-record lock held for the duration of the
//! sequence; writes from outside this process still race with last writer
//! wins.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use mnemo_models::{
    HeaderKind, Memory, MemoryCreate, MemoryHeader, MemoryType, MemoryUpdate, TaskFields,
    TaskStatus,
};
use mnemo_storage::slug::slugify;
use mnemo_storage::StorageService;

use crate::config::StoreConfig;
use crate::error::{Error, Result, ValidationFailure};

use super::index::SearchIndex;
use super::markdown::{
    ensure_heading, extract_title, make_id, replace_heading, MarkdownCodec, RECORD_EXTENSION,
};

/// Aggregate counts over the whole store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub tags: BTreeMap<String, usize>,
    pub sensitive: usize,
    pub tasks: usize,
}

/// A record file that failed to parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub path: PathBuf,
    pub errors: Vec<String>,
}

type RecordLocks = Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Exclusive hold on one record id.
///
/// Dropping it removes the id's entry from the lock map unless another
/// caller is holding or waiting on the same lock.
struct RecordGuard {
    locks: RecordLocks,
    id: String,
    _held: OwnedMutexGuard<()>,
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference lives in the map, one in `_held`.
        if locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2)
        {
            locks.remove(&self.id);
        }
    }
}

/// Service for storing and retrieving records.
#[derive(Clone)]
pub struct MemoryService {
    storage: StorageService,
    codec: MarkdownCodec,
    config: Arc<StoreConfig>,
    record_locks: RecordLocks,
}

impl MemoryService {
    /// Create a new memory service.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            storage: StorageService::new(config.base_dir.clone()),
            codec: MarkdownCodec::new(),
            config: Arc::new(config),
            record_locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Create the on-disk layout.
    pub async fn initialize(&self) -> Result<()> {
        self.storage.ensure_layout().await?;
        info!(base_dir = %self.base_dir().display(), "Memory store ready");
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageService {
        &self.storage
    }

    pub fn codec(&self) -> &MarkdownCodec {
        &self.codec
    }

    pub fn base_dir(&self) -> &Path {
        self.storage.base_dir()
    }

    /// Directory a record of `memory_type` with `category` is placed in.
    pub fn directory_for(&self, memory_type: MemoryType, category: Option<&str>) -> PathBuf {
        let dir = self.base_dir().join(memory_type.directory());
        if memory_type.is_task_management() {
            return dir;
        }
        match category.map(slugify).filter(|c| !c.is_empty()) {
            Some(category) => dir.join(category),
            None => dir,
        }
    }

    /// File path a record is written to.
    pub fn path_for(&self, memory: &Memory) -> PathBuf {
        self.directory_for(memory.memory_type, memory.header.category.as_deref())
            .join(format!("{}.{}", memory.id, RECORD_EXTENSION))
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// Store a new record.
    ///
    /// Fills header defaults, places the title as the body's first heading
    /// when the body has none, and writes the document atomically. The
    /// returned record carries the file path it was written to.
    pub async fn store(&self, create: MemoryCreate) -> Result<Memory> {
        let memory_type = create.memory_type;
        let id = make_id(&create.title, memory_type);

        if self.get_by_id(memory_type, &id).await?.is_some() {
            return Err(Error::AlreadyExists(format!("{} {}", memory_type, id)));
        }

        let mut header = MemoryHeader::new(memory_type);
        header.confidence = create.confidence.unwrap_or(header.confidence);
        header.tags = normalize_tags(create.tags);
        header.source = create.source.unwrap_or_default();
        header.project_root = create
            .project_root
            .or_else(|| self.config.project_root.clone());
        header.category = create.category;
        header.sensitive = create.sensitive;
        header.relationships = create.relationships;
        if let HeaderKind::Task(task) = &mut header.kind {
            *task = create.task.unwrap_or_default();
        }

        let content = ensure_heading(&create.title, &create.content);
        let title = extract_title(&content).unwrap_or_else(|| create.title.trim().to_string());

        let mut memory = Memory {
            id,
            memory_type,
            title,
            content,
            header,
            file_path: None,
        };
        self.check(&memory)?;
        self.write(&mut memory).await?;

        info!(memory_id = %memory.id, memory_type = %memory_type, "Stored memory");
        Ok(memory)
    }

    /// Get a record by type and id. Returns `None` when absent.
    pub async fn get_by_id(&self, memory_type: MemoryType, id: &str) -> Result<Option<Memory>> {
        let direct = self
            .directory_for(memory_type, None)
            .join(format!("{}.{}", id, RECORD_EXTENSION));
        if let Some(memory) = self.load_matching(&direct, memory_type, id).await? {
            return Ok(Some(memory));
        }
        if memory_type.is_task_management() {
            return Ok(None);
        }

        // Knowledge records may sit in a category subdirectory.
        let files = self
            .storage
            .list_recursive(&self.base_dir().join(memory_type.directory()), Some(RECORD_EXTENSION))
            .await;
        for path in files {
            if path == direct || path.file_stem().is_some_and(|s| s != id) {
                continue;
            }
            if let Some(memory) = self.load_matching(&path, memory_type, id).await? {
                return Ok(Some(memory));
            }
        }
        Ok(None)
    }

    /// Find a record when its type is unknown.
    pub async fn find_by_id_across_types(&self, id: &str) -> Result<Option<Memory>> {
        for memory_type in MemoryType::all() {
            if let Some(memory) = self.get_by_id(*memory_type, id).await? {
                return Ok(Some(memory));
            }
        }
        Ok(None)
    }

    /// Update a record. Fails with `NotFound` when it does not exist.
    pub async fn update(
        &self,
        memory_type: MemoryType,
        id: &str,
        update: MemoryUpdate,
    ) -> Result<Memory> {
        self.modify(memory_type, id, move |memory| apply_update(memory, update))
            .await
    }

    /// Delete a record. Returns whether a file was removed.
    pub async fn delete(&self, memory_type: MemoryType, id: &str) -> Result<bool> {
        let _guard = self.lock_record(id).await;

        let Some(memory) = self.get_by_id(memory_type, id).await? else {
            debug!(memory_id = %id, "Delete of absent memory");
            return Ok(false);
        };
        let path = memory.file_path.unwrap_or_else(|| self.path_for_id(memory_type, id));
        let removed = self.storage.delete(&path).await?;
        info!(memory_id = %id, memory_type = %memory_type, "Deleted memory");
        Ok(removed)
    }

    /// Set the workflow status of a task-management record.
    pub async fn update_task_status(
        &self,
        memory_type: MemoryType,
        id: &str,
        status: TaskStatus,
    ) -> Result<Memory> {
        if !memory_type.is_task_management() {
            return Err(Error::InvalidInput(format!(
                "{} records have no task status",
                memory_type
            )));
        }
        self.modify(memory_type, id, move |memory| {
            task_fields(memory)?.status = status;
            Ok(())
        })
        .await
    }

    /// Read, change and write back one record under its lock.
    ///
    /// `updated_at` is bumped and never moves backwards. The record is
    /// moved when the change alters its path.
    pub async fn modify<F>(&self, memory_type: MemoryType, id: &str, change: F) -> Result<Memory>
    where
        F: FnOnce(&mut Memory) -> Result<()>,
    {
        let (memory, _) = self
            .modify_inner(memory_type, id, |memory| change(memory).map(|()| true))
            .await?;
        Ok(memory)
    }

    /// Like [`modify`](Self::modify), but `change` decides whether anything
    /// changed. Nothing is written and `None` is returned when it returns
    /// `false`.
    pub async fn modify_if<F>(
        &self,
        memory_type: MemoryType,
        id: &str,
        change: F,
    ) -> Result<Option<Memory>>
    where
        F: FnOnce(&mut Memory) -> Result<bool>,
    {
        let (memory, written) = self.modify_inner(memory_type, id, change).await?;
        Ok(written.then_some(memory))
    }

    async fn modify_inner<F>(
        &self,
        memory_type: MemoryType,
        id: &str,
        change: F,
    ) -> Result<(Memory, bool)>
    where
        F: FnOnce(&mut Memory) -> Result<bool>,
    {
        let _guard = self.lock_record(id).await;

        let mut memory = self
            .get_by_id(memory_type, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {}", memory_type, id)))?;

        if !change(&mut memory)? {
            debug!(memory_id = %id, "Memory unchanged");
            return Ok((memory, false));
        }
        memory.header.updated_at = mnemo_models::now().max(memory.header.updated_at);
        self.check(&memory)?;
        self.write(&mut memory).await?;

        debug!(memory_id = %id, "Updated memory");
        Ok((memory, true))
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// Every parseable record of one type. Malformed files are skipped.
    pub async fn list_memories(&self, memory_type: MemoryType) -> Result<Vec<Memory>> {
        let dir = self.base_dir().join(memory_type.directory());
        let mut memories = Vec::new();

        for path in self.storage.list_recursive(&dir, Some(RECORD_EXTENSION)).await {
            match self.load(&path).await {
                Ok(Some(memory)) if memory.memory_type == memory_type => memories.push(memory),
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable memory");
                }
            }
        }

        Ok(memories)
    }

    /// Every parseable record of the given types.
    pub async fn list_types(&self, types: &[MemoryType]) -> Result<Vec<Memory>> {
        let mut memories = Vec::new();
        for memory_type in unique(types) {
            memories.extend(self.list_memories(memory_type).await?);
        }
        Ok(memories)
    }

    /// Every parseable record in the store.
    pub async fn list_all(&self) -> Result<Vec<Memory>> {
        self.list_types(MemoryType::all()).await
    }

    /// Build a fresh search index over the given types.
    pub async fn build_index(&self, types: &[MemoryType]) -> Result<SearchIndex> {
        let memories = self.list_types(types).await?;
        let index = SearchIndex::build(memories);
        debug!(records = index.len(), tokens = index.token_count(), "Built search index");
        Ok(index)
    }

    /// Counts over every record in the store.
    pub async fn get_memory_stats(&self) -> Result<MemoryStats> {
        let mut stats = MemoryStats::default();
        for memory in self.list_all().await? {
            stats.total += 1;
            *stats
                .by_type
                .entry(memory.memory_type.as_str().to_string())
                .or_default() += 1;
            for tag in &memory.header.tags {
                *stats.tags.entry(tag.clone()).or_default() += 1;
            }
            if memory.header.is_sensitive() {
                stats.sensitive += 1;
            }
            if memory.memory_type.is_task_management() {
                stats.tasks += 1;
            }
        }
        Ok(stats)
    }

    /// Parse every record file and report the ones that fail.
    pub async fn validate_store(&self) -> Result<Vec<ValidationReport>> {
        let mut reports = Vec::new();
        let mut seen = HashSet::new();

        for memory_type in MemoryType::all() {
            let dir = self.base_dir().join(memory_type.directory());
            if !seen.insert(dir.clone()) {
                continue;
            }
            for path in self.storage.list_recursive(&dir, Some(RECORD_EXTENSION)).await {
                let Some(text) = self.storage.read(&path).await? else {
                    continue;
                };
                let errors = match self.codec.deserialize(&text) {
                    Ok(parsed) => {
                        let result = self.codec.validate(&parsed.memory);
                        result.errors
                    }
                    Err(Error::Validation(failure)) => {
                        failure.violations.iter().map(|v| v.to_string()).collect()
                    }
                    Err(e) => vec![e.to_string()],
                };
                if !errors.is_empty() {
                    reports.push(ValidationReport { path, errors });
                }
            }
        }

        info!(invalid = reports.len(), "Validated store");
        Ok(reports)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn path_for_id(&self, memory_type: MemoryType, id: &str) -> PathBuf {
        self.directory_for(memory_type, None)
            .join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    /// Reject a record whose header would not pass validation on read.
    fn check(&self, memory: &Memory) -> Result<()> {
        let violations = self.codec.header_violations(memory);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(ValidationFailure { violations }))
        }
    }

    /// Serialise and write a record, removing its previous file if the
    /// path changed.
    async fn write(&self, memory: &mut Memory) -> Result<()> {
        let path = self.path_for(memory);
        let text = self.codec.serialize(memory)?;
        self.storage.write_atomic(&path, &text).await?;

        if let Some(previous) = memory.file_path.as_ref().filter(|p| **p != path) {
            self.storage.delete(previous).await?;
            info!(
                memory_id = %memory.id,
                from = %previous.display(),
                to = %path.display(),
                "Moved memory"
            );
        }

        memory.file_path = Some(path);
        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<Option<Memory>> {
        let Some(text) = self.storage.read(path).await? else {
            return Ok(None);
        };
        let parsed = self.codec.deserialize(&text)?;
        for warning in &parsed.warnings {
            debug!(path = %path.display(), warning = %warning, "Memory parsed with warning");
        }
        let mut memory = parsed.memory;
        memory.file_path = Some(path.to_path_buf());
        Ok(Some(memory))
    }

    async fn load_matching(
        &self,
        path: &Path,
        memory_type: MemoryType,
        id: &str,
    ) -> Result<Option<Memory>> {
        Ok(self
            .load(path)
            .await?
            .filter(|m| m.memory_type == memory_type && m.id == id))
    }

    async fn lock_record(&self, id: &str) -> RecordGuard {
        let lock = {
            let mut locks = self
                .record_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        RecordGuard {
            locks: self.record_locks.clone(),
            id: id.to_string(),
            _held: lock.lock_owned().await,
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.record_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn apply_update(memory: &mut Memory, update: MemoryUpdate) -> Result<()> {
    if let Some(content) = update.content {
        memory.content = ensure_heading(&memory.title, &content);
    }
    if let Some(title) = update.title.filter(|t| !t.trim().is_empty()) {
        memory.content = replace_heading(&title, &memory.content);
    }
    memory.title = extract_title(&memory.content).unwrap_or_else(|| memory.id.clone());

    let header = &mut memory.header;
    if let Some(confidence) = update.confidence {
        header.confidence = confidence;
    }
    if let Some(tags) = update.tags {
        header.tags = normalize_tags(tags);
    }
    if let Some(source) = update.source {
        header.source = source;
    }
    if let Some(project_root) = update.project_root {
        header.project_root = Some(project_root);
    }
    if let Some(category) = update.category {
        header.category = Some(category).filter(|c| !c.trim().is_empty());
    }
    if let Some(sensitive) = update.sensitive {
        header.sensitive = Some(sensitive);
    }
    if let Some(task_update) = update.task {
        task_update.apply(task_fields(memory)?);
    }
    Ok(())
}

/// Task fields of a record, or an error for knowledge records.
pub(crate) fn task_fields(memory: &mut Memory) -> Result<&mut TaskFields> {
    let memory_type = memory.memory_type;
    let id = memory.id.clone();
    memory.task_mut().ok_or_else(|| {
        Error::InvalidInput(format!("{} {} is not a task-management record", memory_type, id))
    })
}

/// Trim tags and drop empty and repeated ones, keeping first-seen order.
fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

fn unique(types: &[MemoryType]) -> Vec<MemoryType> {
    let mut seen = HashSet::new();
    types.iter().copied().filter(|t| seen.insert(*t)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_models::{Priority, TaskUpdate};
    use tempfile::TempDir;

    async fn service() -> (TempDir, MemoryService) {
        let dir = TempDir::new().unwrap();
        let service = MemoryService::new(StoreConfig::new(dir.path().join(".mnemo")));
        service.initialize().await.unwrap();
        (dir, service)
    }

    #[tokio::test]
    async fn test_store_and_get_derives_title_from_heading() {
        let (_dir, service) = service().await;

        let stored = service
            .store(MemoryCreate::new(MemoryType::Insight, "Hello World", "# Hello\nWorld"))
            .await
            .unwrap();
        let path = stored.file_path.clone().unwrap();
        assert_eq!(path.extension().unwrap(), "mdx");
        assert_eq!(stored.id, "insight-hello-world");

        let loaded = service
            .get_by_id(MemoryType::Insight, &stored.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.title, "Hello");
        assert_eq!(loaded.header.confidence, mnemo_models::DEFAULT_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_store_prepends_heading_when_missing() {
        let (_dir, service) = service().await;

        let stored = service
            .store(MemoryCreate::new(MemoryType::Decision, "Use tokio", "Because async."))
            .await
            .unwrap();
        assert_eq!(stored.title, "Use tokio");
        assert!(stored.content.starts_with("# Use tokio\n"));
    }

    #[tokio::test]
    async fn test_placement_by_category_and_type() {
        let (_dir, service) = service().await;

        let knowledge = service
            .store(
                MemoryCreate::new(MemoryType::Pattern, "Retry loop", "# Retry loop")
                    .with_category("Error Handling"),
            )
            .await
            .unwrap();
        assert!(knowledge
            .file_path
            .unwrap()
            .ends_with("patterns/error-handling/pattern-retry-loop.mdx"));

        let task = service
            .store(
                MemoryCreate::new(MemoryType::Task, "Write docs", "# Write docs")
                    .with_category("Docs"),
            )
            .await
            .unwrap();
        assert!(task
            .file_path
            .unwrap()
            .ends_with("project/tasks/task-write-docs.mdx"));

        // Category-nested records are still found by id.
        assert!(service
            .get_by_id(MemoryType::Pattern, "pattern-retry-loop")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_store_rejects_duplicate_id() {
        let (_dir, service) = service().await;
        let create = MemoryCreate::new(MemoryType::Learning, "Same", "# Same");

        service.store(create.clone()).await.unwrap();
        let err = service.store(create).await.unwrap_err();
        assert_eq!(err.error_code(), "ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn test_store_rejects_invalid_header() {
        let (_dir, service) = service().await;
        let err = service
            .store(MemoryCreate::new(MemoryType::Insight, "Bad", "# Bad").with_confidence(1.5))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_get_absent_returns_none() {
        let (_dir, service) = service().await;
        assert!(service
            .get_by_id(MemoryType::Bug, "bug-nope")
            .await
            .unwrap()
            .is_none());
        assert!(service
            .find_by_id_across_types("anything")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_merges_and_moves() {
        let (_dir, service) = service().await;
        let stored = service
            .store(
                MemoryCreate::new(MemoryType::Insight, "Caching", "# Caching\nold body")
                    .with_tags(["perf"]),
            )
            .await
            .unwrap();
        let old_path = stored.file_path.clone().unwrap();

        let updated = service
            .update(
                MemoryType::Insight,
                &stored.id,
                MemoryUpdate {
                    title: Some("Caching rules".into()),
                    category: Some("performance".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.title, "Caching rules");
        assert!(updated.content.contains("old body"));
        assert_eq!(updated.header.tags, vec!["perf"]);
        assert!(updated.header.updated_at >= stored.header.updated_at);
        assert_eq!(updated.header.created_at, stored.header.created_at);

        let new_path = updated.file_path.unwrap();
        assert!(new_path.ends_with("insights/performance/insight-caching.mdx"));
        assert!(!old_path.exists());
        assert!(new_path.exists());
    }

    #[tokio::test]
    async fn test_update_missing_record_is_not_found() {
        let (_dir, service) = service().await;
        let err = service
            .update(MemoryType::Task, "task-ghost", MemoryUpdate::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_task_fields_update() {
        let (_dir, service) = service().await;
        let stored = service
            .store(MemoryCreate::new(MemoryType::Bug, "Crash on start", "# Crash on start"))
            .await
            .unwrap();

        let updated = service
            .update(
                MemoryType::Bug,
                &stored.id,
                MemoryUpdate {
                    task: Some(TaskUpdate {
                        priority: Some(Priority::Urgent),
                        assignee: Some("sam".into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let task = updated.task().unwrap();
        assert_eq!(task.priority, Priority::Urgent);
        assert_eq!(task.assignee.as_deref(), Some("sam"));

        let done = service
            .update_task_status(MemoryType::Bug, &stored.id, TaskStatus::Done)
            .await
            .unwrap();
        assert_eq!(done.task().unwrap().status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_task_update_on_knowledge_record_is_rejected() {
        let (_dir, service) = service().await;
        let stored = service
            .store(MemoryCreate::new(MemoryType::Preference, "Tabs", "# Tabs"))
            .await
            .unwrap();

        let err = service
            .update_task_status(MemoryType::Preference, &stored.id, TaskStatus::Done)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, service) = service().await;
        let stored = service
            .store(MemoryCreate::new(MemoryType::Reflection, "Sprint", "# Sprint"))
            .await
            .unwrap();

        assert!(service.delete(MemoryType::Reflection, &stored.id).await.unwrap());
        assert!(!service.delete(MemoryType::Reflection, &stored.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_listing_skips_malformed_files() {
        let (_dir, service) = service().await;
        service
            .store(MemoryCreate::new(MemoryType::Insight, "Good", "# Good"))
            .await
            .unwrap();
        let bad = service.base_dir().join("insights/broken.mdx");
        tokio::fs::write(&bad, "---\nid: broken\ntype: insight\ncolor: red\n---\n\n# Broken\n")
            .await
            .unwrap();

        let memories = service.list_memories(MemoryType::Insight).await.unwrap();
        assert_eq!(memories.len(), 1);

        let reports = service.validate_store().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].path, bad);
        assert!(reports[0].errors.iter().any(|e| e.starts_with("color")));
    }

    #[tokio::test]
    async fn test_memory_stats() {
        let (_dir, service) = service().await;
        service
            .store(MemoryCreate::new(MemoryType::Insight, "A", "# A").with_tags(["x", "y"]))
            .await
            .unwrap();
        service
            .store(
                MemoryCreate::new(MemoryType::Task, "B", "# B")
                    .with_tags(["x"])
                    .with_sensitive(true),
            )
            .await
            .unwrap();

        let stats = service.get_memory_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.tasks, 1);
        assert_eq!(stats.sensitive, 1);
        assert_eq!(stats.tags.get("x"), Some(&2));
        assert_eq!(stats.by_type.get("insight"), Some(&1));
    }

    #[tokio::test]
    async fn test_record_locks_released_after_edits() {
        let (_dir, service) = service().await;

        for round in 0..5 {
            let stored = service
                .store(MemoryCreate::new(
                    MemoryType::Task,
                    format!("Round {round}"),
                    "# Round",
                ))
                .await
                .unwrap();
            service
                .update_task_status(MemoryType::Task, &stored.id, TaskStatus::InProgress)
                .await
                .unwrap();
            assert!(service.delete(MemoryType::Task, &stored.id).await.unwrap());
            assert!(!service.delete(MemoryType::Task, &stored.id).await.unwrap());
        }
        let _ = service
            .update_task_status(MemoryType::Task, "task-ghost", TaskStatus::Done)
            .await
            .unwrap_err();

        assert_eq!(service.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_edits_share_one_lock() {
        let (_dir, service) = service().await;
        let stored = service
            .store(MemoryCreate::new(MemoryType::Task, "Shared", "# Shared"))
            .await
            .unwrap();

        let edits = (0..8).map(|i| {
            let service = service.clone();
            let id = stored.id.clone();
            tokio::spawn(async move {
                service
                    .modify(MemoryType::Task, &id, |memory| {
                        memory.header.tags.push(format!("t{i}"));
                        Ok(())
                    })
                    .await
            })
        });
        for edit in futures::future::join_all(edits).await {
            edit.unwrap().unwrap();
        }

        let loaded = service
            .get_by_id(MemoryType::Task, &stored.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.header.tags.len(), 8);
        assert_eq!(service.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_modify_if_skips_write_when_unchanged() {
        let (_dir, service) = service().await;
        let stored = service
            .store(MemoryCreate::new(MemoryType::Task, "Quiet", "# Quiet"))
            .await
            .unwrap();
        let before = service
            .get_by_id(MemoryType::Task, &stored.id)
            .await
            .unwrap()
            .unwrap();

        let skipped = service
            .modify_if(MemoryType::Task, &stored.id, |memory| {
                memory.header.tags.push("discarded".to_string());
                Ok(false)
            })
            .await
            .unwrap();
        assert!(skipped.is_none());

        let loaded = service
            .get_by_id(MemoryType::Task, &stored.id)
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.header.tags.is_empty());
        assert_eq!(loaded.header.updated_at, before.header.updated_at);

        let written = service
            .modify_if(MemoryType::Task, &stored.id, |memory| {
                memory.header.tags.push("kept".to_string());
                Ok(true)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written.header.tags, vec!["kept"]);
    }

    #[test]
    fn test_normalize_tags() {
        let tags = normalize_tags(vec![" a ".into(), "b".into(), "a".into(), "".into()]);
        assert_eq!(tags, vec!["a", "b"]);
    }
}
