use crate::{snapshot_sizes, DrawSink, SnapshotSource, TimeWindow};
use feed_core::{FeedItem, TxSummary};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Buffered,
    Applied,
    Duplicate,
    /// Older than the window start; dropped right after insertion.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotReport {
    pub blocks: usize,
    pub transactions: usize,
    pub degraded: bool,
}

/// Time-windowed DAG state fed by a REST snapshot and live stream events.
///
/// Visible blocks and transactions are kept ascending by timestamp. While
/// paused, stream events queue up unbounded and are replayed on resume,
/// blocks first.
pub struct StreamConsolidator<S, D> {
    source: S,
    sink: D,
    timeframe_secs: u64,
    timeframe_input: u64,
    paused: bool,
    blocks: Vec<TxSummary>,
    transactions: Vec<TxSummary>,
    paused_blocks: VecDeque<TxSummary>,
    paused_transactions: VecDeque<TxSummary>,
    window: Option<TimeWindow>,
}

impl<S: SnapshotSource, D: DrawSink> StreamConsolidator<S, D> {
    pub fn new(source: S, sink: D, timeframe_secs: u64) -> Self {
        Self {
            source,
            sink,
            timeframe_secs,
            timeframe_input: timeframe_secs,
            paused: false,
            blocks: Vec::new(),
            transactions: Vec::new(),
            paused_blocks: VecDeque::new(),
            paused_transactions: VecDeque::new(),
            window: None,
        }
    }

    pub fn timeframe_secs(&self) -> u64 {
        self.timeframe_secs
    }

    pub fn timeframe_input(&self) -> u64 {
        self.timeframe_input
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn blocks(&self) -> &[TxSummary] {
        &self.blocks
    }

    pub fn transactions(&self) -> &[TxSummary] {
        &self.transactions
    }

    pub fn window(&self) -> Option<TimeWindow> {
        self.window
    }

    pub fn paused_len(&self) -> usize {
        self.paused_blocks.len() + self.paused_transactions.len()
    }

    pub fn sink(&self) -> &D {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut D {
        &mut self.sink
    }

    pub async fn load_snapshot(&mut self) -> SnapshotReport {
        let (block_count, tx_count) = snapshot_sizes(self.timeframe_secs);
        let (blocks, transactions) = tokio::join!(
            self.source.fetch_blocks(block_count),
            self.source.fetch_transactions(tx_count)
        );
        let mut degraded = false;
        let mut blocks = blocks.unwrap_or_else(|err| {
            warn!(event = "dag_snapshot_failed", kind = "block", error = %err);
            degraded = true;
            Vec::new()
        });
        let mut transactions = transactions.unwrap_or_else(|err| {
            warn!(event = "dag_snapshot_failed", kind = "tx", error = %err);
            degraded = true;
            Vec::new()
        });
        blocks.sort_by_key(|item| item.timestamp);
        transactions.sort_by_key(|item| item.timestamp);
        self.blocks = blocks;
        self.transactions = transactions;
        self.recompute_window();
        self.sink.redraw(&self.blocks, &self.transactions, self.window);

        let report = SnapshotReport {
            blocks: self.blocks.len(),
            transactions: self.transactions.len(),
            degraded,
        };
        info!(
            event = "dag_snapshot_loaded",
            timeframe_secs = self.timeframe_secs,
            blocks = report.blocks,
            transactions = report.transactions,
            degraded = report.degraded
        );
        report
    }

    pub fn on_stream_event(&mut self, item: TxSummary) -> EventOutcome {
        if self.paused {
            if item.is_block() {
                self.paused_blocks.push_back(item);
            } else {
                self.paused_transactions.push_back(item);
            }
            return EventOutcome::Buffered;
        }
        self.apply(item)
    }

    /// Recomputes the window from the newest visible item and drops
    /// everything older than its start.
    pub fn recompute_window(&mut self) -> Option<TimeWindow> {
        let max = self
            .blocks
            .last()
            .into_iter()
            .chain(self.transactions.last())
            .map(|item| item.timestamp)
            .max();
        self.window = max.map(|max| TimeWindow::ending_at(max, self.timeframe_secs));
        if let Some(window) = self.window {
            drop_before(&mut self.blocks, window.min);
            drop_before(&mut self.transactions, window.min);
        }
        self.window
    }

    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            debug!(event = "dag_paused");
        }
    }

    /// Replays buffered events and returns how many were replayed.
    pub fn resume(&mut self) -> usize {
        if !self.paused {
            return 0;
        }
        self.paused = false;
        let mut replayed = 0;
        while let Some(item) = self.paused_blocks.pop_front() {
            self.apply(item);
            replayed += 1;
        }
        while let Some(item) = self.paused_transactions.pop_front() {
            self.apply(item);
            replayed += 1;
        }
        debug!(event = "dag_resumed", replayed = replayed);
        replayed
    }

    /// Forgets all state, adopts the configured timeframe and reloads.
    pub async fn reset(&mut self) -> SnapshotReport {
        self.paused = false;
        self.paused_blocks.clear();
        self.paused_transactions.clear();
        self.blocks.clear();
        self.transactions.clear();
        self.window = None;
        self.timeframe_secs = self.timeframe_input;
        info!(event = "dag_reset", timeframe_secs = self.timeframe_secs);
        self.load_snapshot().await
    }

    /// Takes effect on the next reset.
    pub fn set_timeframe_input(&mut self, secs: u64) {
        self.timeframe_input = secs;
    }

    fn apply(&mut self, item: TxSummary) -> EventOutcome {
        let list = if item.is_block() {
            &mut self.blocks
        } else {
            &mut self.transactions
        };
        if list.iter().any(|known| known.id() == item.id()) {
            return EventOutcome::Duplicate;
        }
        let at = list.partition_point(|known| known.timestamp <= item.timestamp);
        list.insert(at, item.clone());

        match self.recompute_window() {
            Some(window) if window.contains(item.timestamp) => {
                self.sink.push(&item, window);
                EventOutcome::Applied
            }
            _ => EventOutcome::Expired,
        }
    }
}

fn drop_before(items: &mut Vec<TxSummary>, min: u64) {
    let cut = items.partition_point(|item| item.timestamp < min);
    items.drain(..cut);
}
