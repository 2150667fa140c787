use crate::api::ApiClient;
use crate::format_timestamp;
use anyhow::{Context, Result};
use feed_core::filter::LiveFilter;
use feed_core::TxSummary;
use feed_dag::{DrawSink, SnapshotSource, StreamConsolidator, TimeWindow, DEFAULT_TIMEFRAME_SECS};
use feed_socket::{ConnectionManager, ConnectionState};
use std::io::{self, Write};
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

#[derive(clap::Args, Debug)]
pub struct DagArgs {
    /// Visible span in seconds, counted back from the newest item.
    #[arg(long, default_value_t = DEFAULT_TIMEFRAME_SECS)]
    timeframe: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DagCommand {
    Pause,
    Resume,
    Reset,
    Timeframe(u64),
    Quit,
}

impl FromStr for DagCommand {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut parts = input.split_whitespace();
        let command = parts.next().unwrap_or_default().to_lowercase();
        let arg = parts.next();
        match (command.as_str(), arg) {
            ("pause", None) => Ok(DagCommand::Pause),
            ("resume", None) => Ok(DagCommand::Resume),
            ("reset", None) => Ok(DagCommand::Reset),
            ("quit" | "exit", None) => Ok(DagCommand::Quit),
            ("timeframe", Some(secs)) => secs
                .parse()
                .map(DagCommand::Timeframe)
                .map_err(|_| format!("Invalid timeframe: {secs}")),
            ("timeframe", None) => Err("Usage: timeframe <seconds>".to_string()),
            _ => Err(format!(
                "Unknown command: {} (pause, resume, reset, timeframe <secs>, quit)",
                input.trim()
            )),
        }
    }
}

/// Prints full redraws and single-item updates as plain text.
pub struct TextSink<W> {
    out: W,
}

impl<W: Write> TextSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

fn window_label(window: Option<TimeWindow>) -> String {
    match window {
        Some(window) => format!(
            "{} .. {}",
            format_timestamp(window.min),
            format_timestamp(window.max)
        ),
        None => "empty".to_string(),
    }
}

impl<W: Write> DrawSink for TextSink<W> {
    fn redraw(&mut self, blocks: &[TxSummary], transactions: &[TxSummary], window: Option<TimeWindow>) {
        let _ = writeln!(
            self.out,
            "== dag {} | {} blocks, {} transactions",
            window_label(window),
            blocks.len(),
            transactions.len()
        );
        for item in blocks.iter().chain(transactions) {
            let _ = writeln!(
                self.out,
                "   {}  {:<5}  {}",
                format_timestamp(item.timestamp),
                item.kind().as_str(),
                item.tx_id
            );
        }
        let _ = self.out.flush();
    }

    fn push(&mut self, item: &TxSummary, window: TimeWindow) {
        let _ = writeln!(
            self.out,
            "+  {}  {:<5}  {}  [{}]",
            format_timestamp(item.timestamp),
            item.kind().as_str(),
            item.tx_id,
            window_label(Some(window))
        );
        let _ = self.out.flush();
    }
}

pub async fn run(args: DagArgs, manager: ConnectionManager, api: ApiClient) -> Result<()> {
    let (subscription, mut events) = manager.subscribe_channel("network");
    let filter = LiveFilter::default();
    let mut states = manager.watch_state();
    let mut dag = StreamConsolidator::new(api, TextSink::new(io::stdout()), args.timeframe);
    dag.load_snapshot().await;
    info!(event = "dag_start", timeframe_secs = args.timeframe);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let result = loop {
        tokio::select! {
            Some(message) = events.recv() => {
                if let Some(item) = filter.matches(&message) {
                    let outcome = dag.on_stream_event(item);
                    debug!(event = "dag_stream_event", outcome = ?outcome);
                }
            }
            line = lines.next_line(), if stdin_open => {
                let line = match line.context("Failed to read stdin") {
                    Ok(line) => line,
                    Err(err) => break Err(err),
                };
                let Some(line) = line else {
                    stdin_open = false;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<DagCommand>() {
                    Ok(DagCommand::Quit) => break Ok(()),
                    Ok(command) => apply_command(&mut dag, command).await,
                    Err(err) => eprintln!("{err}"),
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                if let ConnectionState::Failed { attempts } = *states.borrow_and_update() {
                    break Err(anyhow::anyhow!(
                        "Live updates unavailable after {attempts} connection attempts"
                    ));
                }
            }
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    manager.unsubscribe(&subscription);
    result
}

async fn apply_command<S, D>(dag: &mut StreamConsolidator<S, D>, command: DagCommand)
where
    S: SnapshotSource,
    D: DrawSink,
{
    match command {
        DagCommand::Pause => dag.pause(),
        DagCommand::Resume => {
            dag.resume();
        }
        DagCommand::Reset => {
            dag.reset().await;
        }
        DagCommand::Timeframe(secs) => dag.set_timeframe_input(secs),
        DagCommand::Quit => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use feed_core::ItemKind;
    use feed_dag::SourceError;

    struct OneBlock;

    #[async_trait]
    impl SnapshotSource for OneBlock {
        async fn fetch_blocks(&self, _count: usize) -> Result<Vec<TxSummary>, SourceError> {
            Ok(vec![TxSummary::new("b1", 100, ItemKind::Block)])
        }

        async fn fetch_transactions(&self, _count: usize) -> Result<Vec<TxSummary>, SourceError> {
            Err(SourceError::Response("not json".to_string()))
        }
    }

    #[test]
    fn parses_commands() {
        assert_eq!("pause".parse::<DagCommand>(), Ok(DagCommand::Pause));
        assert_eq!(" Resume ".parse::<DagCommand>(), Ok(DagCommand::Resume));
        assert_eq!("reset".parse::<DagCommand>(), Ok(DagCommand::Reset));
        assert_eq!("timeframe 120".parse::<DagCommand>(), Ok(DagCommand::Timeframe(120)));
        assert_eq!("exit".parse::<DagCommand>(), Ok(DagCommand::Quit));
        assert!("timeframe".parse::<DagCommand>().is_err());
        assert!("timeframe soon".parse::<DagCommand>().is_err());
        assert!("pause now".parse::<DagCommand>().is_err());
        assert!("zoom".parse::<DagCommand>().is_err());
    }

    #[test]
    fn text_sink_prints_redraws_and_pushes() {
        let mut sink = TextSink::new(Vec::new());
        let block = TxSummary::new("b1", 60, ItemKind::Block);
        let tx = TxSummary::new("t1", 120, ItemKind::Tx);
        sink.redraw(
            std::slice::from_ref(&block),
            std::slice::from_ref(&tx),
            Some(TimeWindow { min: 0, max: 120 }),
        );
        sink.push(&tx, TimeWindow { min: 60, max: 120 });
        let text = String::from_utf8(sink.out).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "== dag 1970-01-01 00:00:00 .. 1970-01-01 00:02:00 | 1 blocks, 1 transactions"
        );
        assert_eq!(lines[1], "   1970-01-01 00:01:00  block  b1");
        assert_eq!(lines[2], "   1970-01-01 00:02:00  tx     t1");
        assert_eq!(
            lines[3],
            "+  1970-01-01 00:02:00  tx     t1  [1970-01-01 00:01:00 .. 1970-01-01 00:02:00]"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn commands_drive_the_consolidator() {
        let mut dag = StreamConsolidator::new(OneBlock, TextSink::new(Vec::new()), 600);
        dag.load_snapshot().await;
        assert_eq!(dag.blocks().len(), 1);
        assert!(dag.transactions().is_empty());

        apply_command(&mut dag, DagCommand::Pause).await;
        assert_eq!(
            dag.on_stream_event(TxSummary::new("t1", 110, ItemKind::Tx)),
            feed_dag::EventOutcome::Buffered
        );
        apply_command(&mut dag, DagCommand::Resume).await;
        assert_eq!(dag.transactions().len(), 1);

        apply_command(&mut dag, DagCommand::Timeframe(60)).await;
        assert_eq!(dag.timeframe_secs(), 600);
        apply_command(&mut dag, DagCommand::Reset).await;
        assert_eq!(dag.timeframe_secs(), 60);
        assert!(dag.transactions().is_empty());
    }
}
