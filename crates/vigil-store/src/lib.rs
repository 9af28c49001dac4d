//! # vigil-store
//!
//! Durable task, event, and finding storage on SQLite.
//!
//! The [`AuditStore`] is the only cross-restart state in the engine. All
//! writes are single-row, task-scoped, and transactional; per-task write
//! serialization plus `UNIQUE(task_id, sequence)` keep the persisted event
//! log gap-free and duplicate-free under concurrent emitters.

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod migrations;
pub mod repositories;
pub mod store;

pub use connection::{ConnectionConfig, ConnectionPool, PooledConnection, new_file, new_in_memory};
pub use errors::{Result, StoreError};
pub use migrations::run_migrations;
pub use store::AuditStore;
