//! livetuner-proxy: share one network tuner feed with many TCP clients.
//!
//! Tunes a channel on an HDHomeRun-style device, receives the RTP stream and
//! serves the raw transport stream to every client connecting to the listen
//! address.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use livetuner_protocol::CONTROL_PORT;
use livetuner_proxy::logging;
use livetuner_proxy::server::{Server, ServerConfig};
use livetuner_proxy::stream::{RelayConfig, StreamSupervisor, SupervisorConfig};
use livetuner_proxy::tuner::StreamSession;

const DEFAULT_CONFIG_FILE: &str = "livetuner-proxy.toml";
const DEFAULT_LISTEN: &str = "0.0.0.0:40772";
const DEFAULT_MAX_CONNECTIONS: usize = 16;
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_RETENTION_DAYS: u64 = 7;
const LOG_ROTATE_INTERVAL: Duration = Duration::from_secs(3600);

/// livetuner-proxy - Share one network tuner feed with many TCP clients
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tuner device IP address
    #[arg(short, long)]
    tuner: Option<IpAddr>,

    /// Channel to tune, e.g. ch5 or ch7-2
    #[arg(short = 'C', long)]
    channel: Option<String>,

    /// Number of tuners on the device
    #[arg(long)]
    tuner_count: Option<u32>,

    /// Local UDP port for the stream (0 picks a free one)
    #[arg(long)]
    local_port: Option<u16>,

    /// Address to serve the stream on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Maximum concurrent client connections
    #[arg(short = 'c', long)]
    max_connections: Option<usize>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    tuner: TunerSection,
    #[serde(default)]
    stream: StreamSection,
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct TunerSection {
    address: Option<IpAddr>,
    control_port: Option<u16>,
    tuner_count: Option<u32>,
    control_timeout_secs: Option<u64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct StreamSection {
    channel: Option<String>,
    local_port: Option<u16>,
    reconnect_delay_ms: Option<u64>,
    max_consecutive_failures: Option<u32>,
    datagram_timeout_secs: Option<u64>,
    backlog_chunks: Option<usize>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ServerSection {
    listen: Option<SocketAddr>,
    max_connections: Option<usize>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Effective settings after merging the command line over the config file.
#[derive(Debug)]
struct Settings {
    session: StreamSession,
    supervisor: SupervisorConfig,
    server: ServerConfig,
    log_dir: PathBuf,
    log_retention_days: u64,
    log_level: Option<String>,
}

impl Settings {
    fn resolve(args: &Args, file: ConfigFile) -> Result<Self, String> {
        let tuner = args
            .tuner
            .or(file.tuner.address)
            .ok_or("no tuner address given (--tuner or [tuner] address)")?;
        let channel = args
            .channel
            .clone()
            .or(file.stream.channel)
            .ok_or("no channel given (--channel or [stream] channel)")?;
        let tuner_count = args.tuner_count.or(file.tuner.tuner_count).unwrap_or(2);
        let local_port = args.local_port.or(file.stream.local_port).unwrap_or(0);

        let session = StreamSession::new(
            format!("{}-{}", channel, Local::now().format("%Y%m%d%H%M%S")),
            channel.clone(),
            tuner,
            local_port,
            channel,
            tuner_count,
        )
        .with_control_port(file.tuner.control_port.unwrap_or(CONTROL_PORT));

        let defaults = SupervisorConfig::default();
        let supervisor = SupervisorConfig {
            control_timeout: file
                .tuner
                .control_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.control_timeout),
            reconnect_delay: file
                .stream
                .reconnect_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_delay),
            max_consecutive_failures: file.stream.max_consecutive_failures,
            datagram_timeout: file.stream.datagram_timeout_secs.map(Duration::from_secs),
            relay: RelayConfig {
                backlog_chunks: file
                    .stream
                    .backlog_chunks
                    .unwrap_or(defaults.relay.backlog_chunks),
                ..defaults.relay
            },
        };

        let listen_addr = match args.listen.or(file.server.listen) {
            Some(addr) => addr,
            None => DEFAULT_LISTEN.parse().map_err(|e| format!("{}", e))?,
        };
        let server = ServerConfig {
            listen_addr,
            max_connections: args
                .max_connections
                .or(file.server.max_connections)
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
        };

        Ok(Self {
            session,
            supervisor,
            server,
            log_dir: args
                .log_dir
                .clone()
                .or(file.logging.log_dir.map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            log_retention_days: args
                .log_retention_days
                .or(file.logging.retention_days)
                .unwrap_or(DEFAULT_LOG_RETENTION_DAYS),
            log_level: file.logging.level,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };

    let settings = Settings::resolve(&args, file_config)?;

    logging::init_logging(
        &settings.log_dir,
        settings.log_retention_days,
        args.verbose,
        settings.log_level.as_deref(),
    )?;

    info!("livetuner-proxy starting...");
    info!("  Tuner: {}", settings.session.control_addr());
    info!("  Channel: {}", settings.session.feed_locator);
    info!("  Tuner count: {}", settings.session.tuner_count);
    info!("  Listen address: {}", settings.server.listen_addr);
    info!("  Max connections: {}", settings.server.max_connections);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown requested"),
                Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
            }
            shutdown.cancel();
        });
    }

    {
        let log_dir = settings.log_dir.clone();
        let retention_days = settings.log_retention_days;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LOG_ROTATE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = logging::rotate_logs(&log_dir, retention_days) {
                    warn!("Failed to prune old logs: {}", e);
                }
            }
        });
    }

    let supervisor = Arc::new(StreamSupervisor::new(settings.session, settings.supervisor));
    if let Err(e) = supervisor.open(&shutdown).await {
        error!("Failed to open stream: {}", e);
        return Err(e.into());
    }

    // The session can end on its own when the reconnect limit is hit.
    {
        let supervisor = Arc::clone(&supervisor);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            supervisor.closed().await;
            shutdown.cancel();
        });
    }

    let server = Server::new(settings.server, Arc::clone(&supervisor));
    let result = server.run(shutdown.clone()).await;

    shutdown.cancel();
    supervisor.close().await;
    info!("livetuner-proxy stopped");

    result?;
    Ok(())
}
