//! mnemo - knowledge and task record store
//!
//! Persists knowledge and task records as markdown files with YAML
//! frontmatter, searches and links them, and delegates tasks to external
//! agents in the background.

pub mod config;
pub mod error;
pub mod services;
pub mod state;

pub use config::config;
pub use error::{Error, Result};
pub use state::AppState;
