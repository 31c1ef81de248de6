//! In-memory search index over records.
//!
//! Built from a snapshot of records and dropped after use; it is never
//! persisted and never shared between calls.

use std::collections::{HashMap, HashSet};

use mnemo_models::{Memory, MemoryType};

/// Minimum length of an indexed token.
pub const MIN_TOKEN_LEN: usize = 2;

/// Split text into lower-cased alphanumeric tokens.
///
/// Tokens shorter than [`MIN_TOKEN_LEN`] characters are dropped. Order is
/// preserved and repeats are kept.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
        .map(str::to_string)
        .collect()
}

/// Index of records by id, token, tag and type.
#[derive(Debug, Default)]
pub struct SearchIndex {
    memories: HashMap<String, Memory>,
    tokens: HashMap<String, HashSet<String>>,
    tags: HashMap<String, HashSet<String>>,
    types: HashMap<MemoryType, HashSet<String>>,
}

impl SearchIndex {
    /// Build an index from a set of records.
    pub fn build(memories: impl IntoIterator<Item = Memory>) -> Self {
        let mut index = Self::default();
        for memory in memories {
            index.insert(memory);
        }
        index
    }

    /// Add a record, replacing any previous record with the same id.
    pub fn insert(&mut self, memory: Memory) {
        let id = memory.id.clone();
        if self.memories.contains_key(&id) {
            self.remove(&id);
        }

        let text = format!(
            "{} {} {}",
            memory.title,
            memory.content,
            memory.header.tags.join(" ")
        );
        for token in tokenize(&text) {
            self.tokens.entry(token).or_default().insert(id.clone());
        }
        for tag in &memory.header.tags {
            self.tags.entry(tag.clone()).or_default().insert(id.clone());
        }
        self.types
            .entry(memory.memory_type)
            .or_default()
            .insert(id.clone());

        self.memories.insert(id, memory);
    }

    fn remove(&mut self, id: &str) {
        if self.memories.remove(id).is_none() {
            return;
        }
        for map in [&mut self.tokens, &mut self.tags] {
            map.retain(|_, ids| {
                ids.remove(id);
                !ids.is_empty()
            });
        }
        self.types.retain(|_, ids| {
            ids.remove(id);
            !ids.is_empty()
        });
    }

    pub fn get(&self, id: &str) -> Option<&Memory> {
        self.memories.get(id)
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Every indexed record.
    pub fn memories(&self) -> impl Iterator<Item = &Memory> {
        self.memories.values()
    }

    /// Every indexed record id.
    pub fn ids(&self) -> HashSet<String> {
        self.memories.keys().cloned().collect()
    }

    /// Every distinct token with the ids containing it.
    pub fn tokens(&self) -> impl Iterator<Item = (&String, &HashSet<String>)> {
        self.tokens.iter()
    }

    pub fn ids_with_token(&self, token: &str) -> Option<&HashSet<String>> {
        self.tokens.get(token)
    }

    pub fn ids_with_tag(&self, tag: &str) -> Option<&HashSet<String>> {
        self.tags.get(tag)
    }

    pub fn ids_of_type(&self, memory_type: MemoryType) -> Option<&HashSet<String>> {
        self.types.get(&memory_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_models::MemoryHeader;

    fn memory(id: &str, memory_type: MemoryType, content: &str, tags: &[&str]) -> Memory {
        let mut header = MemoryHeader::new(memory_type);
        header.tags = tags.iter().map(|t| t.to_string()).collect();
        Memory {
            id: id.to_string(),
            memory_type,
            title: id.to_string(),
            content: content.to_string(),
            header,
            file_path: None,
        }
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("The Tokenizer, v2 (a) splits_words!"),
            vec!["the", "tokenizer", "v2", "splits", "words"]
        );
        assert!(tokenize("a b c").is_empty());
    }

    #[test]
    fn test_index_maps() {
        let index = SearchIndex::build(vec![
            memory("one", MemoryType::Insight, "Rust async runtime", &["rust"]),
            memory("two", MemoryType::Bug, "Async deadlock", &["rust", "bug"]),
        ]);

        assert_eq!(index.len(), 2);
        assert_eq!(index.ids_with_token("async").unwrap().len(), 2);
        assert_eq!(index.ids_with_token("runtime").unwrap().len(), 1);
        assert_eq!(index.ids_with_tag("rust").unwrap().len(), 2);
        assert!(index.ids_with_tag("bug").unwrap().contains("two"));
        assert!(index.ids_of_type(MemoryType::Bug).unwrap().contains("two"));
        assert!(index.ids_of_type(MemoryType::Task).is_none());
    }

    #[test]
    fn test_reinsert_replaces_entries() {
        let mut index = SearchIndex::build(vec![memory("one", MemoryType::Insight, "alpha", &[])]);
        index.insert(memory("one", MemoryType::Insight, "beta", &[]));

        assert_eq!(index.len(), 1);
        assert!(index.ids_with_token("alpha").is_none());
        assert!(index.ids_with_token("beta").is_some());
    }
}
