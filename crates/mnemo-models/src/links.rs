//! Typed relationships between records.
//!
//! Edges are directed and owned by the source record: they live in the
//! source header's `relationships` list and nothing is stored on the target.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::MemoryType;

// ============================================================================
// Relationship Kind
// ============================================================================

/// Kind of relationship between records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    #[default]
    RelatesTo,
    DependsOn,
    Implements,
    Extends,
    Supersedes,
    References,
    ConflictsWith,
    DerivedFrom,
    PartOf,
}

impl RelationshipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipKind::RelatesTo => "relates_to",
            RelationshipKind::DependsOn => "depends_on",
            RelationshipKind::Implements => "implements",
            RelationshipKind::Extends => "extends",
            RelationshipKind::Supersedes => "supersedes",
            RelationshipKind::References => "references",
            RelationshipKind::ConflictsWith => "conflicts_with",
            RelationshipKind::DerivedFrom => "derived_from",
            RelationshipKind::PartOf => "part_of",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "relates_to" => Some(RelationshipKind::RelatesTo),
            "depends_on" => Some(RelationshipKind::DependsOn),
            "implements" => Some(RelationshipKind::Implements),
            "extends" => Some(RelationshipKind::Extends),
            "supersedes" => Some(RelationshipKind::Supersedes),
            "references" => Some(RelationshipKind::References),
            "conflicts_with" => Some(RelationshipKind::ConflictsWith),
            "derived_from" => Some(RelationshipKind::DerivedFrom),
            "part_of" => Some(RelationshipKind::PartOf),
            _ => None,
        }
    }

    pub fn all() -> &'static [RelationshipKind] {
        &[
            RelationshipKind::RelatesTo,
            RelationshipKind::DependsOn,
            RelationshipKind::Implements,
            RelationshipKind::Extends,
            RelationshipKind::Supersedes,
            RelationshipKind::References,
            RelationshipKind::ConflictsWith,
            RelationshipKind::DerivedFrom,
            RelationshipKind::PartOf,
        ]
    }
}

impl std::fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Relationship
// ============================================================================

fn default_weight() -> f64 {
    1.0
}

/// A directed, weighted edge to another record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Relationship {
    pub target_id: String,
    /// Lets traversal skip the cross-type lookup when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<MemoryType>,
    pub kind: RelationshipKind,
    #[serde(default = "default_weight")]
    pub strength: f64,
    #[serde(default = "default_weight")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub validated: bool,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(target_id: impl Into<String>, kind: RelationshipKind) -> Self {
        Self {
            target_id: target_id.into(),
            target_type: None,
            kind,
            strength: default_weight(),
            confidence: default_weight(),
            metadata: BTreeMap::new(),
            validated: false,
            created_at: crate::now(),
        }
    }

    pub fn with_target_type(mut self, target_type: MemoryType) -> Self {
        self.target_type = Some(target_type);
        self
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Whether this edge occupies the same (target, kind) slot as `other`.
    pub fn same_slot(&self, other: &Relationship) -> bool {
        self.target_id == other.target_id && self.kind == other.kind
    }
}
