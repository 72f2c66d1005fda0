//! Core data models for the tape-archive engine.
//!
//! These entities map to SQLite tables via `sqlx::FromRow` and serialize
//! as JSON via `serde` for the metadata snapshot and the status endpoints.

pub mod archive;
pub mod bundle;
pub mod job;
pub mod media_file;
