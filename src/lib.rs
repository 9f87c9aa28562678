//! Orchestration core for scripted short-video generation: plan a script,
//! generate and verify each segment through pluggable tools, and assemble the
//! accepted clips into one video. Every step is recorded in an append-only
//! context log that can be replayed to resume a task.

pub mod config;
pub mod core;
pub mod logging;

pub use crate::config::PipelineConfig;
pub use crate::core::context::{ContextStore, SqliteJournal};
pub use crate::core::pipeline::{Pipeline, TaskReport, TaskRun};
pub use crate::core::tools::ToolRegistry;
pub use crate::core::types::{Task, TaskMode, TaskRequest};
