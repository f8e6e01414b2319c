//! Core job model: identifiers, records, and the backoff policy.

pub mod backoff;
pub mod job;
pub mod types;
