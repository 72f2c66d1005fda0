//! Bulk archival of sensor media to tape-backed storage over SSH, and
//! retrieval of individual files from archived bundles.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
