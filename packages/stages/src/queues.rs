//! Queue and stage names of the chain.
//!
//! ```text
//! fetch ──► metadata ──► index ──► archive
//! ```
//!
//! Each consuming stage reads the queue named after itself.

pub const FETCH: &str = "fetch";
pub const METADATA: &str = "metadata";
pub const INDEX: &str = "index";
pub const ARCHIVE: &str = "archive";

/// Where `--quarantine` parks failed batches of `queue`.
pub fn quarantine(queue: &str) -> String {
    format!("{queue}-quarantine")
}
