//! HTTP request handlers.
//!
//! - `ingest` - generic and GitHub-compatible event ingestion
//! - `health` - health and liveness probes

pub mod health;
pub mod ingest;

pub use health::{health_check, liveness_check};
pub use ingest::{ingest_event, ingest_github};
