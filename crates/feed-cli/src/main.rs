mod api;
mod dag;
mod ticker;

use anyhow::{Context, Result};
use api::ApiClient;
use clap::{Parser, Subcommand};
use feed_socket::{ConnectionConfig, ConnectionManager};
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tracing::{info, warn};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriter},
    EnvFilter,
};

const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8080/v1a/ws/";
const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/v1a/";
const DEFAULT_LOG_DIR: &str = ".explorer-feed/logs";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
struct Config {
    command: &'static str,
    ws_url: String,
    api_url: String,
    debug: bool,
    log_dir: String,
    log_stdout: bool,
    heartbeat_interval: Duration,
    max_reconnect_attempts: Option<u32>,
    request_timeout: Duration,
}

#[derive(Parser, Debug)]
#[command(name = "explorer-feed", about = "Live explorer feeds in the terminal")]
struct Args {
    #[arg(long, default_value = "", global = true)]
    ws_url: String,
    #[arg(long, default_value = "", global = true)]
    api_url: String,
    #[arg(long, default_value = "", global = true)]
    log_dir: String,
    #[arg(long, default_value_t = false, global = true)]
    debug: bool,
    /// Seconds between heartbeats.
    #[arg(
        long,
        default_value_t = 30,
        global = true,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    heartbeat_interval: u64,
    /// Consecutive failed connection attempts before giving up; 0 retries forever.
    #[arg(long, default_value_t = 0, global = true)]
    max_reconnect_attempts: u32,
    #[arg(long, default_value_t = 10, global = true)]
    request_timeout: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow a transaction or block list page.
    Ticker(ticker::TickerArgs),
    /// Follow the time-windowed DAG stream.
    Dag(dag::DagArgs),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Ticker(_) => "ticker",
            Command::Dag(_) => "dag",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args);
    let _log_targets = init_logging(&config);

    let manager = ConnectionManager::new(connection_config(&config)?);
    let api = ApiClient::new(&config.api_url, config.request_timeout)?;
    info!(
        event = "feed_start",
        command = config.command,
        ws_url = %config.ws_url,
        api_url = %config.api_url
    );
    let handle = manager.start().context("Failed to start socket")?;

    let result = match args.command {
        Command::Ticker(cmd) => ticker::run(cmd, manager.clone(), api).await,
        Command::Dag(cmd) => dag::run(cmd, manager.clone(), api).await,
    };

    manager.shutdown();
    if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
        warn!(event = "socket_shutdown_timeout");
    }
    info!(event = "feed_stop");
    result
}

fn load_config(args: &Args) -> Config {
    Config {
        command: args.command.name(),
        ws_url: resolve_ws_url(&args.ws_url),
        api_url: resolve_api_url(&args.api_url),
        debug: args.debug || env_true("FEED_DEBUG"),
        log_dir: resolve_log_dir(&args.log_dir),
        log_stdout: env_true("FEED_LOG_STDOUT"),
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        max_reconnect_attempts: (args.max_reconnect_attempts > 0)
            .then_some(args.max_reconnect_attempts),
        request_timeout: Duration::from_secs(args.request_timeout),
    }
}

fn connection_config(config: &Config) -> Result<ConnectionConfig> {
    let mut connection = ConnectionConfig::parse(&config.ws_url)
        .with_context(|| format!("Invalid websocket url '{}'", config.ws_url))?;
    connection.heartbeat_interval = config.heartbeat_interval;
    connection.retry.max_attempts = config.max_reconnect_attempts;
    Ok(connection)
}

fn init_logging(config: &Config) -> Option<LogTargets> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("FEED_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let targets = LogTargets::open(&config.log_dir, config.command, config.log_stdout);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(BoxMakeWriter::new(targets.clone()))
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(targets)
}

/// Log destinations: one append-only file per subcommand under the log
/// directory, optionally echoed to stdout.
#[derive(Clone)]
struct LogTargets {
    file: Option<Arc<Mutex<File>>>,
    stdout: bool,
}

impl LogTargets {
    fn open(log_dir: &str, command: &str, stdout: bool) -> Self {
        let file = match open_log_file(log_dir, command) {
            Ok(file) => file.map(|file| Arc::new(Mutex::new(file))),
            Err(err) => {
                eprintln!("log_file_error: {err}");
                None
            }
        };
        Self { file, stdout }
    }
}

impl<'a> MakeWriter<'a> for LogTargets {
    type Writer = LogTargets;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for LogTargets {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout {
            let _ = io::stdout().write_all(buf);
        }
        if let Some(file) = &self.file {
            let _ = file
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout {
            let _ = io::stdout().flush();
        }
        if let Some(file) = &self.file {
            let _ = file.lock().unwrap_or_else(PoisonError::into_inner).flush();
        }
        Ok(())
    }
}

fn log_file_name(command: &str) -> String {
    format!("explorer-feed-{command}.log")
}

/// Opens `<log_dir>/explorer-feed-<command>.log` for appending and marks
/// where this run starts. An empty or uncreatable directory disables the file.
fn open_log_file(log_dir: &str, command: &str) -> io::Result<Option<File>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(None);
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(log_file_name(command)))?;
    writeln!(
        file,
        "# explorer-feed {command} pid={} started {}",
        std::process::id(),
        chrono::Utc::now().to_rfc3339()
    )?;
    Ok(Some(file))
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_from(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn resolve_ws_url(flag: &str) -> String {
    resolve_from(flag, "FEED_WS_URL", DEFAULT_WS_URL)
}

fn resolve_api_url(flag: &str) -> String {
    resolve_from(flag, "FEED_API_URL", DEFAULT_API_URL)
}

fn resolve_log_dir(flag: &str) -> String {
    resolve_from(flag, "FEED_LOG_DIR", DEFAULT_LOG_DIR)
}

/// Unix seconds as UTC wall time; out-of-range values print raw.
pub(crate) fn format_timestamp(timestamp: u64) -> String {
    i64::try_from(timestamp)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}
