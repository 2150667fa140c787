mod consolidator;

pub use consolidator::{EventOutcome, SnapshotReport, StreamConsolidator};

use async_trait::async_trait;
use feed_core::TxSummary;
use thiserror::Error;

pub const DEFAULT_TIMEFRAME_SECS: u64 = 600;

const BLOCKS_PER_MINUTE: usize = 5;
const TXS_PER_MINUTE: usize = 60;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected response: {0}")]
    Response(String),
}

/// REST collaborator that provides the initial DAG contents.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_blocks(&self, count: usize) -> Result<Vec<TxSummary>, SourceError>;
    async fn fetch_transactions(&self, count: usize) -> Result<Vec<TxSummary>, SourceError>;
}

pub trait DrawSink {
    fn redraw(&mut self, blocks: &[TxSummary], transactions: &[TxSummary], window: Option<TimeWindow>);
    fn push(&mut self, item: &TxSummary, window: TimeWindow);
}

/// Visible interval `[max - timeframe, max]`, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub min: u64,
    pub max: u64,
}

impl TimeWindow {
    pub fn ending_at(max: u64, timeframe_secs: u64) -> Self {
        Self {
            min: max.saturating_sub(timeframe_secs),
            max,
        }
    }

    pub fn contains(&self, timestamp: u64) -> bool {
        timestamp >= self.min && timestamp <= self.max
    }
}

/// How many blocks and transactions to request for a timeframe.
pub fn snapshot_sizes(timeframe_secs: u64) -> (usize, usize) {
    let minutes = usize::try_from(timeframe_secs.div_ceil(60)).unwrap_or(usize::MAX);
    let factor = minutes.saturating_add(1);
    (
        BLOCKS_PER_MINUTE.saturating_mul(factor),
        TXS_PER_MINUTE.saturating_mul(factor),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sizes_scale_with_started_minutes() {
        assert_eq!(snapshot_sizes(0), (5, 60));
        assert_eq!(snapshot_sizes(1), (10, 120));
        assert_eq!(snapshot_sizes(60), (10, 120));
        assert_eq!(snapshot_sizes(61), (15, 180));
        assert_eq!(snapshot_sizes(600), (55, 660));
    }

    #[test]
    fn window_saturates_at_zero() {
        let window = TimeWindow::ending_at(30, 50);
        assert_eq!(window, TimeWindow { min: 0, max: 30 });
        assert!(window.contains(0));
        assert!(!window.contains(31));
    }
}
