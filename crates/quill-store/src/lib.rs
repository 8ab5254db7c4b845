//! # quill-store
//!
//! SQLite persistence for the Quill agent server.
//!
//! The [`pool`] module enforces the serialization discipline `SQLite`
//! requires: one exclusive writer, a bounded set of parallel readers, and
//! scoped transactional access. [`migrations`] applies embedded schema
//! files idempotently. [`Store`] is the high-level API the rest of the
//! system uses: conversations, messages with per-conversation sequence
//! IDs, and process-wide settings.

pub mod errors;
pub mod migrations;
pub mod pool;
pub mod rows;
pub mod store;

pub use errors::{Result, StoreError};
pub use pool::{Pool, PoolConfig};
pub use rows::{ConversationRow, MessageRow, MessageType};
pub use store::{CreateMessageParams, Store};
