//! Data models for mnemo.
//!
//! Defines the record types stored by the mnemo knowledge and task store:
//! memories and their headers, typed relationships, task fields and the
//! delegation state machine.

mod links;
mod memory;
mod task;

pub use links::*;
pub use memory::*;
pub use task::*;

use chrono::{DateTime, Utc};

/// Current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_type_strings() {
        for memory_type in MemoryType::all() {
            assert_eq!(MemoryType::from_str(memory_type.as_str()), Some(*memory_type));
        }
        assert_eq!(MemoryType::all().len(), 13);
        assert_eq!(
            MemoryType::all()
                .iter()
                .filter(|t| t.is_task_management())
                .count(),
            4
        );
    }

    #[test]
    fn test_task_types_use_project_directories() {
        for memory_type in MemoryType::task_types() {
            assert!(memory_type.directory().starts_with("project/"));
        }
        assert_eq!(MemoryType::Insight.directory(), "insights");
    }

    #[test]
    fn test_header_kind_follows_type() {
        let task = MemoryHeader::new(MemoryType::Bug);
        assert!(matches!(task.kind, HeaderKind::Task(_)));

        let knowledge = MemoryHeader::new(MemoryType::Decision);
        assert_eq!(knowledge.kind, HeaderKind::Knowledge);
        assert_eq!(knowledge.confidence, DEFAULT_CONFIDENCE);
        assert_eq!(knowledge.created_at, knowledge.updated_at);
    }

    #[test]
    fn test_relationship_slot() {
        let a = Relationship::new("x", RelationshipKind::DependsOn);
        let b = Relationship::new("x", RelationshipKind::DependsOn).with_strength(0.2);
        let c = Relationship::new("x", RelationshipKind::References);
        assert!(a.same_slot(&b));
        assert!(!a.same_slot(&c));
    }
}
