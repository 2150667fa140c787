use crate::api::ApiClient;
use crate::format_timestamp;
use anyhow::{Context, Result};
use feed_core::cursor::{relative_url, Cursor, PageRequest, UrlPagination};
use feed_core::filter::LiveFilter;
use feed_core::window::{FeedWindow, FetchOutcome, Generation, MergeOutcome};
use feed_core::{ItemKind, Page, TxSummary};
use feed_socket::{ConnectionManager, ConnectionState};
use std::fmt::Write as _;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

const LOCATION_BASE: &str = "http://explorer.local/";
const KIND_FIELD: &str = "type";

type FetchResult = (Generation, Result<Page<TxSummary>>);

#[derive(clap::Args, Debug)]
pub struct TickerArgs {
    /// Screen location whose query carries the page cursor.
    #[arg(long, default_value = "/transactions")]
    location: String,
    /// Defaults to the location's `type` field, else `tx`.
    #[arg(long)]
    kind: Option<ItemKind>,
    #[arg(long, default_value_t = 10)]
    count: usize,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    address: Option<String>,
}

pub async fn run(args: TickerArgs, manager: ConnectionManager, api: ApiClient) -> Result<()> {
    let pagination = UrlPagination::with_cursor_fields(&[KIND_FIELD]);
    let location = parse_location(&args.location)?;
    let request = pagination
        .page_request(&location)
        .with_context(|| format!("Invalid pagination in '{}'", args.location))?;
    let kind = resolve_kind(args.kind, &pagination, &location);
    let count = args.count.max(1);
    let mut filter = LiveFilter::for_kind(kind);
    if let Some(token) = args.token {
        filter = filter.with_token(token);
    }
    if let Some(address) = args.address {
        filter = filter.with_address(address);
    }
    info!(
        event = "ticker_start",
        kind = kind.as_str(),
        location = %relative_url(&location),
        count = count
    );

    let (subscription, mut events) = manager.subscribe_channel("network");
    let mut states = manager.watch_state();
    let (fetch_tx, mut fetch_rx) = mpsc::channel::<FetchResult>(4);
    let mut window = FeedWindow::for_request(&request, count);
    start_fetch(&api, &mut window, kind, count, &request, &fetch_tx);

    // The socket may have connected, or given up, before this subscription.
    let mut was_connected = false;
    let initial = *states.borrow_and_update();
    match on_state(was_connected, initial) {
        StateAction::Connected => was_connected = true,
        StateAction::Fail { attempts } => {
            manager.unsubscribe(&subscription);
            return Err(unavailable(attempts));
        }
        StateAction::Resync | StateAction::Ignore => {}
    }

    let result = loop {
        tokio::select! {
            Some((generation, fetched)) = fetch_rx.recv() => match fetched {
                Ok(page) => {
                    if let FetchOutcome::Applied { replayed } = window.complete_fetch(generation, page) {
                        debug!(event = "ticker_page", generation = generation.0, replayed = replayed);
                        println!("{}", render_window(&window));
                        let (older, newer) = page_links(&pagination, &location, &window);
                        if let Some(link) = older {
                            println!("older: {link}");
                        }
                        if let Some(link) = newer {
                            println!("newer: {link}");
                        }
                    }
                }
                Err(err) => {
                    eprintln!("fetch failed: {err:#}");
                    window.fail_fetch(generation);
                }
            },
            Some(message) = events.recv() => {
                let Some(item) = filter.matches(&message) else {
                    continue;
                };
                match window.apply_live(item) {
                    MergeOutcome::Merged { .. } => println!("{}", render_window(&window)),
                    outcome => debug!(event = "live_item_skipped", reason = skip_reason(&outcome)),
                }
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = *states.borrow_and_update();
                match on_state(was_connected, state) {
                    StateAction::Resync => {
                        info!(event = "ticker_resync");
                        start_fetch(&api, &mut window, kind, count, &request, &fetch_tx);
                    }
                    StateAction::Connected => was_connected = true,
                    StateAction::Fail { attempts } => break Err(unavailable(attempts)),
                    StateAction::Ignore => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    manager.unsubscribe(&subscription);
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateAction {
    /// First connection; the page fetched at startup is current.
    Connected,
    /// Reconnected after a drop; live items were missed meanwhile.
    Resync,
    Fail { attempts: u32 },
    Ignore,
}

fn on_state(was_connected: bool, state: ConnectionState) -> StateAction {
    match state {
        ConnectionState::Connected if was_connected => StateAction::Resync,
        ConnectionState::Connected => StateAction::Connected,
        ConnectionState::Failed { attempts } => StateAction::Fail { attempts },
        ConnectionState::Disconnected | ConnectionState::Connecting { .. } => StateAction::Ignore,
    }
}

fn unavailable(attempts: u32) -> anyhow::Error {
    anyhow::anyhow!("Live updates unavailable after {attempts} connection attempts")
}

/// Launches a page fetch tagged with a fresh generation; the result comes
/// back through `results`.
fn start_fetch(
    api: &ApiClient,
    window: &mut FeedWindow<TxSummary>,
    kind: ItemKind,
    count: usize,
    request: &PageRequest,
    results: &mpsc::Sender<FetchResult>,
) {
    let generation = window.begin_fetch();
    let api = api.clone();
    let request = request.clone();
    let results = results.clone();
    tokio::spawn(async move {
        let fetched = api.fetch_page(kind, count, &request).await;
        if results.send((generation, fetched)).await.is_err() {
            warn!(event = "ticker_fetch_orphaned", generation = generation.0);
        }
    });
}

fn parse_location(location: &str) -> Result<Url> {
    let base = Url::parse(LOCATION_BASE).context("Invalid location base")?;
    base.join(location)
        .with_context(|| format!("Invalid location '{location}'"))
}

fn resolve_kind(flag: Option<ItemKind>, pagination: &UrlPagination, location: &Url) -> ItemKind {
    if let Some(kind) = flag {
        return kind;
    }
    pagination
        .read_cursor(location)
        .get(KIND_FIELD)
        .and_then(|value| value.as_deref())
        .and_then(|value| value.parse().ok())
        .unwrap_or(ItemKind::Tx)
}

/// Links to the older and newer neighbour pages of what is displayed.
fn page_links(
    pagination: &UrlPagination,
    location: &Url,
    window: &FeedWindow<TxSummary>,
) -> (Option<String>, Option<String>) {
    let older = window
        .items()
        .last()
        .filter(|_| window.has_after())
        .and_then(|item| {
            let request = PageRequest::Next(Cursor::Hash(item.tx_id.clone()));
            pagination.write_page(location, &request).ok()
        });
    let newer = window
        .items()
        .first()
        .filter(|_| window.has_before())
        .and_then(|item| {
            let request = PageRequest::Previous(Cursor::Hash(item.tx_id.clone()));
            pagination.write_page(location, &request).ok()
        });
    (older, newer)
}

fn render_window(window: &FeedWindow<TxSummary>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "-- {} items (newer: {}, older: {})",
        window.len(),
        window.has_before(),
        window.has_after()
    );
    for item in window.items() {
        let _ = writeln!(
            out,
            "{}  {:<5}  {}",
            format_timestamp(item.timestamp),
            item.kind().as_str(),
            item.tx_id
        );
    }
    out.trim_end().to_string()
}

fn skip_reason(outcome: &MergeOutcome<TxSummary>) -> &'static str {
    match outcome {
        MergeOutcome::Merged { .. } => "merged",
        MergeOutcome::Duplicate => "duplicate",
        MergeOutcome::NotFirstPage => "not_first_page",
        MergeOutcome::Held => "held",
    }
}
