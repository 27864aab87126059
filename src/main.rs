use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orderline::network::http_admin::run_http_admin;
use orderline::network::sync_status::shared_status;
use orderline::network::{
    ConnectivityMonitor, HttpOrderApi, HttpProbe, RealtimeChannel, SharedSyncStatus, SyncQueue,
    SyncWorker,
};
use orderline::storage::open_queue;
use orderline::{Config, OrderItem, OrderOutcome, OrderPayload, OrdersGateway};

struct RotatingFile {
    path: String,
    max_size: u64,
    max_files: u32,
    file: File,
    current_size: u64,
}

impl RotatingFile {
    fn new(path: String, max_size: u64, max_files: u32) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            max_files,
            file,
            current_size,
        })
    }

    // log -> log.1 -> ... -> log.N; the oldest file is overwritten.
    fn rotate(&mut self) -> io::Result<()> {
        for i in (1..self.max_files).rev() {
            let _ = std::fs::rename(
                format!("{}.{}", self.path, i),
                format!("{}.{}", self.path, i + 1),
            );
        }
        let _ = std::fs::rename(&self.path, format!("{}.1", self.path));

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.current_size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

fn init_logging() {
    let _ = LogTracer::init();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    // With ORDERLINE_LOG_FILE set, plain logs also go to a rotating file on
    // disk through env_logger.
    if let Ok(path) = std::env::var("ORDERLINE_LOG_FILE") {
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

        let max_size_mb: u64 = env_or("ORDERLINE_LOG_MAX_SIZE_MB", 10);
        let max_files: u32 = env_or("ORDERLINE_LOG_MAX_FILES", 3);
        if let Ok(rot) = RotatingFile::new(path, max_size_mb * 1024 * 1024, max_files) {
            builder.target(env_logger::Target::Pipe(Box::new(rot)));
        }

        let _ = builder.try_init();
    }

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

#[derive(Parser)]
#[command(name = "orderline")]
#[command(about = "Offline-first order sync and live updates for POS terminals")]
struct Cli {
    /// JSON config file; defaults are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the connectivity monitor, sync worker and realtime channel
    Run,

    /// Inspect or resolve the local order queue
    Queue {
        #[command(subcommand)]
        cmd: QueueCmd,
    },

    /// Create an order through the gateway
    Order {
        /// Table identifier, e.g. T5
        #[arg(short, long)]
        table: String,

        /// Menu item as id:qty (qty may be fractional); repeat for more items
        #[arg(short, long = "item", value_parser = parse_item, required = true)]
        items: Vec<OrderItem>,

        #[arg(short, long)]
        notes: Option<String>,
    },
}

#[derive(Subcommand)]
enum QueueCmd {
    /// Show queued orders, oldest first
    List,
    /// Show orders that need manual resolution
    Failed,
    /// Move a failed order back into the queue
    Retry { local_id: String },
    /// Drop a failed order for good
    Discard { local_id: String },
}

fn parse_item(raw: &str) -> Result<OrderItem, String> {
    let (id, qty) = match raw.split_once(':') {
        Some((id, qty)) => (id, qty),
        None => (raw, "1"),
    };
    if id.is_empty() {
        return Err(format!("missing item id in '{raw}'"));
    }
    let qty = match qty.parse::<u64>() {
        Ok(0) => return Err(format!("quantity must be positive in '{raw}'")),
        Ok(whole) => serde_json::Number::from(whole),
        Err(_) => {
            let value: f64 = qty
                .parse()
                .map_err(|_| format!("invalid quantity in '{raw}'"))?;
            if value <= 0.0 {
                return Err(format!("quantity must be positive in '{raw}'"));
            }
            serde_json::Number::from_f64(value)
                .ok_or_else(|| format!("invalid quantity in '{raw}'"))?
        }
    };
    Ok(OrderItem::new(id, qty))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

struct Runtime {
    _db: sled::Db,
    queue: SyncQueue,
    api: Arc<HttpOrderApi>,
    status: SharedSyncStatus,
}

fn build_runtime(config: &Config) -> Result<Runtime, Box<dyn std::error::Error>> {
    let (db, store) = open_queue(&config.data_dir)?;
    let status = shared_status();
    let policy = config.sync.retry_policy();
    let api = Arc::new(HttpOrderApi::new(
        &config.server_url,
        config.auth_token.clone(),
        policy.submit_timeout,
    )?);

    let queue = SyncQueue::new(Arc::new(store), api.clone(), policy)
        .with_confirm_grace(config.sync.confirm_grace())
        .with_stale_after(config.sync.stale_after())
        .with_status(Arc::clone(&status));

    Ok(Runtime {
        _db: db,
        queue,
        api,
        status,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run => run(config).await?,
        Command::Queue { cmd } => {
            let runtime = build_runtime(&config)?;
            match cmd {
                QueueCmd::List => print_json(&runtime.queue.optimistic_view()?)?,
                QueueCmd::Failed => print_json(&runtime.queue.failed_orders()?)?,
                QueueCmd::Retry { local_id } => {
                    match runtime.queue.retry_failed(&local_id).await? {
                        Some(record) => print_json(&record)?,
                        None => warn!("No failed order with id {local_id}"),
                    }
                }
                QueueCmd::Discard { local_id } => {
                    match runtime.queue.discard_failed(&local_id).await? {
                        Some(record) => print_json(&record)?,
                        None => warn!("No failed order with id {local_id}"),
                    }
                }
            }
        }
        Command::Order {
            table,
            items,
            notes,
        } => {
            let runtime = build_runtime(&config)?;
            let probe = HttpProbe::new(&config.server_url, config.connectivity.probe_timeout())?;
            let monitor = Arc::new(ConnectivityMonitor::new(
                probe.check_once().await,
                config.connectivity.flap_threshold,
            ));
            let realtime = Arc::new(RealtimeChannel::websocket(
                config.realtime.reconnect_policy(),
            ));
            let gateway = OrdersGateway::new(monitor, runtime.queue, runtime.api, realtime);

            let outcome = gateway
                .create_order(OrderPayload {
                    notes,
                    ..OrderPayload::new(table, items)
                })
                .await?;
            match outcome {
                OrderOutcome::Confirmed {
                    local_id,
                    server_id,
                } => println!("confirmed {local_id} as {server_id}"),
                OrderOutcome::Queued(record) => {
                    println!("queued {} (pending)", record.local_id)
                }
            }
        }
    }

    Ok(())
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Starting orderline against {} (data dir {})",
        config.server_url, config.data_dir
    );

    let runtime = build_runtime(&config)?;
    let shutdown = CancellationToken::new();

    let probe = Arc::new(HttpProbe::new(
        &config.server_url,
        config.connectivity.probe_timeout(),
    )?);
    let monitor = Arc::new(ConnectivityMonitor::new(
        probe.check_once().await,
        config.connectivity.flap_threshold,
    ));
    tokio::spawn(Arc::clone(&monitor).run(
        probe,
        config.connectivity.probe_interval(),
        shutdown.clone(),
    ));

    let worker = SyncWorker::new(
        runtime.queue.clone(),
        monitor.subscribe(),
        config.sync.interval(),
        shutdown.clone(),
    )
    .with_status(Arc::clone(&runtime.status));
    let worker_task = tokio::spawn(worker.run());

    let realtime = Arc::new(RealtimeChannel::websocket(
        config.realtime.reconnect_policy(),
    ));
    {
        let mut changes = realtime.state_changes();
        let status = Arc::clone(&runtime.status);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let state = *changes.borrow_and_update();
                status.lock().await.realtime = state;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    let gateway = OrdersGateway::new(
        Arc::clone(&monitor),
        runtime.queue.clone(),
        runtime.api.clone(),
        Arc::clone(&realtime),
    );
    let _new_orders = gateway.subscribe("new_order", |event| {
        info!("New order event: {}", event.payload);
        Ok(())
    });
    let _status_changes = gateway.subscribe("status_changed", |event| {
        info!("Order status changed: {}", event.payload);
        Ok(())
    });

    match &config.auth_token {
        Some(token) => {
            if let Err(e) = realtime.connect(&config.realtime_url, token) {
                error!("Realtime channel not started: {e}");
            }
        }
        None => warn!("ORDERLINE_AUTH_TOKEN not set, live updates disabled"),
    }

    if let Some(addr) = config.admin_addr {
        let queue = runtime.queue.clone();
        let status = Arc::clone(&runtime.status);
        tokio::spawn(async move {
            if let Err(e) = run_http_admin(addr, queue, status).await {
                error!("Admin endpoint error: {e}");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    gateway.realtime().disconnect().await;
    if let Err(e) = worker_task.await {
        error!("SyncWorker ended abnormally: {e}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_item_reads_id_and_quantity() {
        let item = parse_item("burger:2").unwrap();
        assert_eq!(item.id, "burger");
        assert_eq!(item.qty, serde_json::Number::from(2u32));
        assert_eq!(parse_item("fries").unwrap().qty.as_u64(), Some(1));
        assert_eq!(parse_item("cheese:0.5").unwrap().qty.as_f64(), Some(0.5));
    }

    #[test]
    fn parse_item_rejects_bad_input() {
        assert!(parse_item(":2").is_err());
        assert!(parse_item("burger:zero").is_err());
        assert!(parse_item("burger:0").is_err());
        assert!(parse_item("burger:-1.5").is_err());
        assert!(parse_item("burger:NaN").is_err());
    }
}
