//! Data models for stored files and in-flight chunked uploads.
//!
//! Rows map to SQLite tables via `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod file;
pub mod staging;
