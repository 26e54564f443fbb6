mod dispatch;
mod http;
mod line_server;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use dispatch::Dispatcher;
use line_server::LineServerConfig;
use portia_core::protocol::DEFAULT_MAX_FRAME_BYTES;
use portia_resolver::{PrefixTable, ResolutionEngine};
use portia_storage::{
    AnnotationStore, Backend, MemoryBackend, SqliteBackend, StoreConfig, DEFAULT_PREFIX,
};
use std::{
    fs::{File, OpenOptions},
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::MakeWriterExt, EnvFilter};

const DEFAULT_TCP_ADDR: &str = "127.0.0.1:8001";
const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8000";

#[derive(Parser, Debug)]
#[command(name = "portia", version, about = "Number portability annotation service")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Serve the line protocol and the HTTP shim.
    Run(RunArgs),
    /// Bulk-load external data into the store.
    #[command(subcommand)]
    Import(ImportCommand),
}

#[derive(Subcommand, Debug)]
enum ImportCommand {
    /// Import a porting database CSV export.
    PortingDb(PortingDbArgs),
}

#[derive(Args, Debug, Clone)]
struct StoreArgs {
    /// SQLite database path; in-memory when empty.
    #[arg(long, default_value = "")]
    db: String,
    #[arg(long, default_value = "")]
    prefix: String,
    #[arg(long, default_value_t = 0)]
    backend_timeout_ms: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    store: StoreArgs,
    #[arg(long, default_value = "")]
    tcp_addr: String,
    #[arg(long, default_value = "")]
    http_addr: String,
    /// Glob of prefix mapping JSON files; repeatable, applied in order.
    #[arg(long = "mapping")]
    mappings: Vec<String>,
    #[arg(long, default_value_t = 2_000)]
    write_timeout_ms: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
}

#[derive(Args, Debug)]
struct PortingDbArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// The CSV file has no header row.
    #[arg(long = "no-header", default_value_t = false)]
    no_header: bool,
    /// Accepted for symmetry with --no-header; a header is the default.
    #[arg(long, default_value_t = false, conflicts_with = "no_header")]
    header: bool,
    file: PathBuf,
}

#[derive(Clone, Debug)]
struct Config {
    db_path: Option<PathBuf>,
    prefix: String,
    backend_timeout: Duration,
    debug: bool,
    log_dir: String,
}

impl Config {
    fn from_args(args: &StoreArgs) -> Self {
        Self {
            db_path: resolve_db_path(&args.db),
            prefix: resolve_prefix(&args.prefix),
            backend_timeout: resolve_backend_timeout(args.backend_timeout_ms),
            debug: args.debug
                || env_value("PORTIA_DEBUG").is_some_and(|value| value.trim() == "1"),
            log_dir: resolve_log_dir(&args.log_dir),
        }
    }

    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            prefix: self.prefix.clone(),
            backend_timeout: self.backend_timeout,
        }
    }
}

#[derive(Clone, Debug)]
struct ServeConfig {
    tcp_addr: String,
    http_addr: String,
    mappings: Vec<String>,
    write_timeout: Duration,
    max_frame_bytes: usize,
}

impl ServeConfig {
    fn from_args(args: &RunArgs) -> Self {
        Self {
            tcp_addr: resolve_addr(&args.tcp_addr, "PORTIA_TCP_ADDR", DEFAULT_TCP_ADDR),
            http_addr: resolve_addr(&args.http_addr, "PORTIA_HTTP_ADDR", DEFAULT_HTTP_ADDR),
            mappings: resolve_mappings(&args.mappings),
            write_timeout: Duration::from_millis(args.write_timeout_ms.max(1)),
            max_frame_bytes: args.max_frame_bytes.max(1),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let (config, result) = match cli.command {
        CliCommand::Run(args) => {
            let config = Config::from_args(&args.store);
            init_logging(&config, "server");
            let serve = ServeConfig::from_args(&args);
            let result = run_server(&config, &serve).await;
            (config, result)
        }
        CliCommand::Import(ImportCommand::PortingDb(args)) => {
            let config = Config::from_args(&args.store);
            init_logging(&config, "import");
            let result = import_porting_db(&config, &args).await;
            (config, result)
        }
    };
    if let Err(err) = result {
        let message = format!("{err:#}");
        error!(event = "portia_error", prefix = %config.prefix, error = %message);
        std::process::exit(1);
    }
}

fn open_backend(config: &Config) -> anyhow::Result<Arc<dyn Backend>> {
    match &config.db_path {
        Some(path) => {
            let backend = SqliteBackend::open(path)
                .with_context(|| format!("failed to open database {}", path.display()))?;
            info!(event = "backend_open", kind = "sqlite", path = %path.display());
            Ok(Arc::new(backend))
        }
        None => {
            warn!(event = "backend_open", kind = "memory", "annotations will not survive restart");
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

async fn run_server(config: &Config, serve: &ServeConfig) -> anyhow::Result<()> {
    let tcp_addr: SocketAddr = serve
        .tcp_addr
        .parse()
        .with_context(|| format!("invalid tcp address {}", serve.tcp_addr))?;
    let http_addr: SocketAddr = serve
        .http_addr
        .parse()
        .with_context(|| format!("invalid http address {}", serve.http_addr))?;

    let table = PrefixTable::load(serve.mappings.as_slice())
        .context("failed to load prefix mappings")?;
    if table.is_empty() {
        warn!(event = "prefix_table_empty", "prefix fallback will always miss");
    }
    let store = AnnotationStore::new(open_backend(config)?, config.store_config());
    let engine = ResolutionEngine::new(store, Arc::new(table));
    let dispatcher = Arc::new(Dispatcher::new(engine, serve.max_frame_bytes));

    let tcp_listener = tokio::net::TcpListener::bind(tcp_addr)
        .await
        .with_context(|| format!("failed to bind {tcp_addr}"))?;
    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind {http_addr}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "shutdown_requested");
        let _ = shutdown_tx.send(true);
    });

    info!(
        event = "portia_start",
        tcp_addr = %tcp_addr,
        http_addr = %http_addr,
        prefix = %config.prefix,
        mappings = serve.mappings.len()
    );

    let line_config = LineServerConfig {
        write_timeout: serve.write_timeout,
        ..LineServerConfig::default()
    };
    let line_task = tokio::spawn(line_server::run(
        tcp_listener,
        dispatcher.clone(),
        line_config,
        shutdown_rx.clone(),
    ));

    let mut http_shutdown = shutdown_rx;
    axum::serve(http_listener, http::router(dispatcher))
        .with_graceful_shutdown(async move {
            while http_shutdown.changed().await.is_ok() {
                if *http_shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .context("http server failed")?;

    line_task
        .await
        .context("line server task failed")?
        .context("line server failed")?;
    info!(event = "portia_stop");
    Ok(())
}

async fn import_porting_db(config: &Config, args: &PortingDbArgs) -> anyhow::Result<()> {
    let file = File::open(&args.file)
        .with_context(|| format!("failed to open {}", args.file.display()))?;
    let store = AnnotationStore::new(open_backend(config)?, config.store_config());
    let has_header = !args.no_header;
    let imported = store
        .import_porting_file(file, has_header)
        .await
        .with_context(|| format!("failed to import {}", args.file.display()))?;
    for msisdn in &imported {
        info!(event = "porting_imported", msisdn = %msisdn);
    }
    info!(event = "porting_import_done", records = imported.len(), header = has_header);
    Ok(())
}

/// Logs go to stdout, and also to `<log_dir>/portia-<role>.log` when a log
/// directory is configured.
fn init_logging(config: &Config, role: &str) {
    let filter = if config.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(env_value("PORTIA_LOG_LEVEL").unwrap_or_else(|| "info".to_string()))
        })
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match open_log_file(&config.log_dir, role) {
        Ok(Some(file)) => builder
            .with_writer(io::stdout.and(Arc::new(file)))
            .try_init(),
        Ok(None) => builder.try_init(),
        Err(err) => {
            eprintln!("portia: cannot open log file in {}: {err}", config.log_dir);
            builder.try_init()
        }
    };
    if let Err(err) = installed {
        eprintln!("portia: logging not initialised: {err}");
    }
}

fn open_log_file(log_dir: &str, role: &str) -> io::Result<Option<File>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(log_dir)?;
    let path = PathBuf::from(log_dir).join(format!("portia-{role}.log"));
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Some)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_addr(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    env_value(env_key).unwrap_or_else(|| default.to_string())
}

fn resolve_db_path(flag: &str) -> Option<PathBuf> {
    if !flag.trim().is_empty() {
        return Some(PathBuf::from(flag));
    }
    env_value("PORTIA_DB").map(PathBuf::from)
}

fn resolve_prefix(flag: &str) -> String {
    if !flag.is_empty() {
        return flag.to_string();
    }
    env_value("PORTIA_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.to_string())
}

fn resolve_backend_timeout(flag_ms: u64) -> Duration {
    if flag_ms > 0 {
        return Duration::from_millis(flag_ms);
    }
    env_value("PORTIA_BACKEND_TIMEOUT_MS")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(portia_storage::DEFAULT_BACKEND_TIMEOUT)
}

fn resolve_mappings(flags: &[String]) -> Vec<String> {
    if !flags.is_empty() {
        return flags.to_vec();
    }
    env_value("PORTIA_MAPPINGS")
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|pattern| !pattern.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn resolve_log_dir(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    env_value("PORTIA_LOG_DIR").unwrap_or_default()
}
