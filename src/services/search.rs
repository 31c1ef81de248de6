//! Content, tag and fuzzy search over the record store.
//!
//! Every search rebuilds the index from disk, so results always reflect the
//! current files.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use mnemo_models::{Memory, MemoryType};

use crate::error::{Error, Result};

use super::index::{tokenize, SearchIndex};
use super::memory::MemoryService;

/// Score every candidate gets for matching at all.
pub const PRESENCE_SCORE: f64 = 1.0;
/// Bonus when the title contains a query token.
pub const TITLE_BONUS: f64 = 0.5;
/// Bonus when a tag equals a query token or a requested tag.
pub const TAG_BONUS: f64 = 0.3;

/// Search request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Free text; records containing any of its tokens are candidates
    #[serde(default)]
    pub text: String,
    /// Every tag must be present on a result
    #[serde(default)]
    pub tags: Vec<String>,
    /// Restrict to these types; all types when empty
    #[serde(default)]
    pub types: Vec<MemoryType>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub min_confidence: Option<f64>,
    pub max_confidence: Option<f64>,
    /// Sensitive records are excluded unless set
    #[serde(default)]
    pub include_sensitive: bool,
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
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

    pub fn with_types(mut self, types: impl Into<Vec<MemoryType>>) -> Self {
        self.types = types.into();
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn including_sensitive(mut self) -> Self {
        self.include_sensitive = true;
        self
    }
}

/// A matching record and its score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub memory: Memory,
    pub score: f64,
}

/// Service for searching the record store.
#[derive(Clone)]
pub struct SearchService {
    memory: MemoryService,
}

impl SearchService {
    /// Create a new search service.
    pub fn new(memory: MemoryService) -> Self {
        Self { memory }
    }

    /// Token and tag search with filters, best matches first.
    pub async fn search_by_content(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        if let (Some(min), Some(max)) = (query.min_confidence, query.max_confidence) {
            if min > max {
                return Err(Error::InvalidInput(format!(
                    "min_confidence {} exceeds max_confidence {}",
                    min, max
                )));
            }
        }

        let types = requested_types(&query.types);
        let index = self.memory.build_index(types).await?;
        let query_tokens = tokenize(&query.text);

        let mut candidates = if query_tokens.is_empty() {
            index.ids()
        } else {
            union_of_tokens(&index, &query_tokens)
        };

        for tag in &query.tags {
            let tagged = index.ids_with_tag(tag).cloned().unwrap_or_default();
            candidates.retain(|id| tagged.contains(id));
        }

        let mut results: Vec<SearchResult> = candidates
            .iter()
            .filter_map(|id| index.get(id))
            .filter(|m| matches_filters(m, query, types))
            .map(|m| SearchResult {
                score: score(m, &query_tokens, &query.tags),
                memory: m.clone(),
            })
            .collect();

        sort_results(&mut results);
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }

        debug!(
            text = %query.text,
            tags = ?query.tags,
            results = results.len(),
            "Content search"
        );
        Ok(results)
    }

    /// Records containing a token within `max_distance` edits of a query
    /// token. All matches share a flat score.
    pub async fn fuzzy_search(
        &self,
        text: &str,
        max_distance: usize,
        memory_type: Option<MemoryType>,
    ) -> Result<Vec<SearchResult>> {
        let types = match memory_type {
            Some(t) => vec![t],
            None => MemoryType::all().to_vec(),
        };
        let index = self.memory.build_index(&types).await?;

        let query_tokens: Vec<Vec<char>> = tokenize(text)
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .map(|t| t.chars().collect())
            .collect();

        let mut found = HashSet::new();
        for (token, ids) in index.tokens() {
            let matched = query_tokens
                .iter()
                .any(|q| levenshtein_within(token, q, max_distance) <= max_distance);
            if matched {
                found.extend(ids.iter().cloned());
            }
        }

        let mut results: Vec<SearchResult> = found
            .iter()
            .filter_map(|id| index.get(id))
            .map(|m| SearchResult {
                memory: m.clone(),
                score: PRESENCE_SCORE,
            })
            .collect();
        sort_results(&mut results);

        debug!(text, max_distance, results = results.len(), "Fuzzy search");
        Ok(results)
    }
}

fn requested_types(types: &[MemoryType]) -> &[MemoryType] {
    if types.is_empty() {
        MemoryType::all()
    } else {
        types
    }
}

fn union_of_tokens(index: &SearchIndex, tokens: &[String]) -> HashSet<String> {
    tokens
        .iter()
        .filter_map(|t| index.ids_with_token(t))
        .flat_map(|ids| ids.iter().cloned())
        .collect()
}

fn matches_filters(memory: &Memory, query: &SearchQuery, types: &[MemoryType]) -> bool {
    let header = &memory.header;
    if !types.contains(&memory.memory_type) {
        return false;
    }
    if query.date_from.is_some_and(|from| header.created_at < from) {
        return false;
    }
    if query.date_to.is_some_and(|to| header.created_at > to) {
        return false;
    }
    if query.min_confidence.is_some_and(|min| header.confidence < min) {
        return false;
    }
    if query.max_confidence.is_some_and(|max| header.confidence > max) {
        return false;
    }
    if header.is_sensitive() && !query.include_sensitive {
        return false;
    }
    true
}

fn score(memory: &Memory, query_tokens: &[String], requested_tags: &[String]) -> f64 {
    let mut score = PRESENCE_SCORE;

    let title = memory.title.to_lowercase();
    if query_tokens.iter().any(|t| title.contains(t.as_str())) {
        score += TITLE_BONUS;
    }

    let tag_hit = memory.header.tags.iter().any(|tag| {
        let tag = tag.to_lowercase();
        query_tokens.contains(&tag) || requested_tags.iter().any(|r| r.to_lowercase() == tag)
    });
    if tag_hit {
        score += TAG_BONUS;
    }

    score
}

/// Highest score first, then most recently updated, then id.
fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.memory.header.updated_at.cmp(&a.memory.header.updated_at))
            .then_with(|| a.memory.id.cmp(&b.memory.id))
    });
}

/// Edit distance between `value` and `needle`, giving up early.
///
/// Returns `max + 1` as soon as the distance is known to exceed `max`.
pub fn levenshtein_within(value: &str, needle: &[char], max: usize) -> usize {
    let value: Vec<char> = value.chars().collect();
    let n = needle.len();

    if value.len().abs_diff(n) > max {
        return max + 1;
    }
    if n == 0 {
        return value.len();
    }

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr: Vec<usize> = vec![0; n + 1];

    for (i, c) in value.iter().enumerate() {
        curr[0] = i + 1;
        let mut row_min = curr[0];

        for j in 1..=n {
            let cost = usize::from(*c != needle[j - 1]);
            let d = (prev[j] + 1)
                .min(curr[j - 1] + 1)
                .min(prev[j - 1] + cost);
            curr[j] = d;
            row_min = row_min.min(d);
        }

        if row_min > max {
            return max + 1;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}
