//! I/O utilities for file processing and data handling.
//!
//! This module provides utilities for reading NDJSON replay scripts and
//! driving them through a reader.

pub mod ndjson;
pub mod replay;

// Re-export commonly used types and functions
pub use ndjson::{parse_replay_file, parse_replay_str, ReplayError, ReplayEvent};
pub use replay::{ReplayDriver, ReplaySummary};
