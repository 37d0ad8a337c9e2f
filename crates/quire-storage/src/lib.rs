//! Quire storage - SQLite persistence for conversations.
//!
//! Provides a WAL-mode SQLite database with versioned migrations and a
//! repository that implements the engine's conversation store.

pub mod db;
pub mod migrations;
pub mod repository;

pub use db::Database;
pub use repository::{ConversationRepository, ConversationSummary};
