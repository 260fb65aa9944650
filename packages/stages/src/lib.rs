//! Stage workers of the RSS story pipeline.
//!
//! ```text
//! fetcher[0..N) ──► meta_worker ──► indexer ──► archiver
//! ```
//!
//! Each binary in `src/bin/` wires one stage into a
//! [`pipeline::WorkerRuntime`]; everything they share lives here.

pub mod archive;
pub mod config;
pub mod exit;
pub mod feed;
pub mod fetch;
pub mod index;
pub mod layout;
pub mod logging;
pub mod metadata;
pub mod queues;

pub use config::{ConsumerArgs, FetchArgs, PipelineConfig};
