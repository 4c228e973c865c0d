//! Progress and completion reporting for embedders.

use akravault_common::Error;

/// Receives progress for a top-level vault operation.
///
/// `on_end` is called exactly once per operation, with the error if it
/// failed.
pub trait ProgressSink: Send + Sync {
    /// Bytes processed so far out of `total_bytes`.
    fn on_progress(&self, _processed_bytes: u64, _total_bytes: u64) {}

    /// The operation finished.
    fn on_end(&self, _error: Option<&Error>) {}
}

/// Sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {}
