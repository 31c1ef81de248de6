//! Graph service for relationship queries.
//!
//! Relationships are directed edges stored on the source record only.
//! Adding or removing an edge rewrites the source; nothing is written to
//! the target.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use mnemo_models::{Memory, MemoryType, Relationship, RelationshipKind};

use crate::error::{Error, Result};

use super::memory::MemoryService;

/// A node in the graph result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub memory_type: MemoryType,
    pub title: String,
    pub depth: usize,
}

/// An edge in the graph result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source_id: String,
    pub target_id: String,
    pub kind: RelationshipKind,
    pub strength: f64,
}

/// Breadth-first view of the graph around one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipGraph {
    pub center_id: String,
    pub depth: usize,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl RelationshipGraph {
    /// Render as a line-based flowchart, one `A --> B` line per edge.
    pub fn to_diagram(&self) -> String {
        let mut lines = vec!["graph TD".to_string()];
        lines.extend(
            self.edges
                .iter()
                .map(|e| format!("    {} --> {}", e.source_id, e.target_id)),
        );
        lines.join("\n")
    }
}

/// An edge pointing at a record, with the record that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingRelationship {
    pub source_id: String,
    pub source_type: MemoryType,
    pub relationship: Relationship,
}

/// Service for editing and traversing relationships.
#[derive(Clone)]
pub struct GraphService {
    memory: MemoryService,
}

impl GraphService {
    /// Create a new graph service.
    pub fn new(memory: MemoryService) -> Self {
        Self { memory }
    }

    /// Add an edge from a record, replacing any edge of the same kind to
    /// the same target.
    ///
    /// The target must exist. Its type is filled in when the caller did
    /// not give one.
    pub async fn add_relationship(
        &self,
        source_type: MemoryType,
        source_id: &str,
        mut relationship: Relationship,
    ) -> Result<Memory> {
        if relationship.target_id == source_id {
            return Err(Error::InvalidInput(format!(
                "{} cannot relate to itself",
                source_id
            )));
        }

        let target = match relationship.target_type {
            Some(t) => self.memory.get_by_id(t, &relationship.target_id).await?,
            None => {
                self.memory
                    .find_by_id_across_types(&relationship.target_id)
                    .await?
            }
        }
        .ok_or_else(|| Error::NotFound(format!("target {}", relationship.target_id)))?;
        relationship.target_type = Some(target.memory_type);

        let target_id = relationship.target_id.clone();
        let kind = relationship.kind;
        let updated = self
            .memory
            .modify(source_type, source_id, move |memory| {
                let edges = &mut memory.header.relationships;
                match edges.iter_mut().find(|e| e.same_slot(&relationship)) {
                    Some(existing) => *existing = relationship,
                    None => edges.push(relationship),
                }
                Ok(())
            })
            .await?;

        info!(source_id, target_id = %target_id, kind = %kind, "Added relationship");
        Ok(updated)
    }

    /// Remove every edge from a record to `target_id`, whatever its kind.
    ///
    /// Returns how many edges were removed.
    pub async fn remove_relationship(
        &self,
        source_type: MemoryType,
        source_id: &str,
        target_id: &str,
    ) -> Result<usize> {
        let mut removed = 0;
        self.memory
            .modify(source_type, source_id, |memory| {
                let edges = &mut memory.header.relationships;
                let before = edges.len();
                edges.retain(|e| e.target_id != target_id);
                removed = before - edges.len();
                Ok(())
            })
            .await?;

        info!(source_id, target_id, removed, "Removed relationships");
        Ok(removed)
    }

    /// Edges stored on other records that point at `target_id`.
    pub async fn find_incoming_relationships(
        &self,
        target_id: &str,
    ) -> Result<Vec<IncomingRelationship>> {
        let mut incoming = Vec::new();
        for memory in self.memory.list_all().await? {
            for relationship in &memory.header.relationships {
                if relationship.target_id == target_id {
                    incoming.push(IncomingRelationship {
                        source_id: memory.id.clone(),
                        source_type: memory.memory_type,
                        relationship: relationship.clone(),
                    });
                }
            }
        }
        Ok(incoming)
    }

    /// Walk outgoing edges breadth-first from a record, up to `depth` hops.
    ///
    /// Each (type, id) is visited at most once, so cycles terminate. Edges
    /// whose target no longer exists are skipped. `None` when the center
    /// record does not exist.
    pub async fn generate_relationship_graph(
        &self,
        center_type: MemoryType,
        center_id: &str,
        depth: usize,
    ) -> Result<Option<RelationshipGraph>> {
        if self.memory.get_by_id(center_type, center_id).await?.is_none() {
            return Ok(None);
        }

        let mut visited: HashSet<(MemoryType, String)> = HashSet::new();
        let mut nodes: Vec<GraphNode> = Vec::new();
        let mut edges: Vec<GraphEdge> = Vec::new();
        let mut queue: VecDeque<(MemoryType, String, usize)> = VecDeque::new();

        queue.push_back((center_type, center_id.to_string(), 0));

        while let Some((memory_type, id, level)) = queue.pop_front() {
            if !visited.insert((memory_type, id.clone())) {
                continue;
            }
            let Some(memory) = self.memory.get_by_id(memory_type, &id).await? else {
                continue;
            };

            nodes.push(GraphNode {
                id: memory.id.clone(),
                memory_type,
                title: memory.title.clone(),
                depth: level,
            });

            if level >= depth {
                continue;
            }

            for relationship in &memory.header.relationships {
                let Some(target_type) = self.resolve_type(relationship).await? else {
                    warn!(
                        source_id = %memory.id,
                        target_id = %relationship.target_id,
                        "Skipping edge to missing record"
                    );
                    continue;
                };

                edges.push(GraphEdge {
                    source_id: memory.id.clone(),
                    target_id: relationship.target_id.clone(),
                    kind: relationship.kind,
                    strength: relationship.strength,
                });

                let key = (target_type, relationship.target_id.clone());
                if !visited.contains(&key) {
                    queue.push_back((key.0, key.1, level + 1));
                }
            }
        }

        debug!(
            center_id,
            depth,
            nodes = nodes.len(),
            edges = edges.len(),
            "Generated relationship graph"
        );

        Ok(Some(RelationshipGraph {
            center_id: center_id.to_string(),
            depth,
            nodes,
            edges,
        }))
    }

    async fn resolve_type(&self, relationship: &Relationship) -> Result<Option<MemoryType>> {
        match relationship.target_type {
            Some(t) => Ok(self
                .memory
                .get_by_id(t, &relationship.target_id)
                .await?
                .map(|_| t)),
            None => Ok(self
                .memory
                .find_by_id_across_types(&relationship.target_id)
                .await?
                .map(|m| m.memory_type)),
        }
    }
}
