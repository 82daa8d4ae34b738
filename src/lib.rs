//! Real-time vessel-identification ingestion core.
//!
//! Maintains a pool of streaming sessions against the upstream AIS
//! feed, decodes identity and position frames, applies the admission
//! filter, and persists results with merge-preserving upserts.

pub mod backoff;
pub mod config;
pub mod database;
pub mod decode;
pub mod errors;
pub mod feed;
pub mod filter;
pub mod models;
pub mod pool;
pub mod session;
pub mod stats;

#[cfg(test)]
pub(crate) mod test_support;
