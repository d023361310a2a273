//! Core data models for the resumable upload backend.
//!
//! These entities represent upload sessions in flight and the assets they
//! finalize into. They map cleanly to database tables via `sqlx::FromRow`
//! and serialize naturally as JSON via `serde`.

pub mod asset;
pub mod session;
