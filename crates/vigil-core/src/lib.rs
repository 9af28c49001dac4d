//! # vigil-core
//!
//! Foundation types for the Vigil audit engine.
//!
//! This crate provides the shared vocabulary that all other Vigil crates
//! depend on:
//!
//! - **Tasks**: [`task::AuditTask`], the [`task::TaskStatus`] transition graph,
//!   [`task::Phase`], and validated [`task::TaskConfig`]
//! - **Events**: [`events::AuditEvent`] with the closed [`events::EventKind`]
//!   union and typed payloads
//! - **Findings**: [`finding::Finding`] with fingerprint-based deduplication
//! - **Text**: UTF-8-safe truncation helpers for payloads and error messages
//! - **Logging**: [`logging::init`] tracing-subscriber bootstrap
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by all other vigil crates.

#![deny(unsafe_code)]

pub mod events;
pub mod finding;
pub mod logging;
pub mod task;
pub mod text;
