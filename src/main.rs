use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use scout_resilience::{
    backoff::BackoffPolicy,
    breaker::CircuitBreakerConfig,
    connection::zeromq::{ZmqTransport, ZmqTransportConfig},
    connection::{ConnectionState, ReconnectionConfig, ResilientConnection, SendOutcome},
};
use std::time::Duration;
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "scout-resilience")]
#[command(about = "Stream synthetic audio frames through a self-healing connection")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// ZeroMQ endpoint the frames are pushed to
    #[arg(long, default_value = "tcp://127.0.0.1:5555")]
    pub endpoint: String,

    /// ZeroMQ endpoint replies are pulled from
    #[arg(long)]
    pub reply_endpoint: Option<String>,

    /// Interval between frames in milliseconds
    #[arg(long, default_value = "20")]
    pub frame_interval: u64,

    /// Size of each synthetic frame in bytes
    #[arg(long, default_value = "640")]
    pub frame_bytes: usize,

    /// Consecutive failed connection attempts before giving up
    #[arg(long, default_value = "10")]
    pub max_attempts: u32,

    /// Failures within the window that open the circuit breaker
    #[arg(long, default_value = "5")]
    pub breaker_threshold: u32,

    /// Seconds the breaker stays open before a probe
    #[arg(long, default_value = "30")]
    pub reset_timeout: u64,

    /// Maximum reconnection delay in seconds
    #[arg(long, default_value = "60")]
    pub max_delay: u64,

    /// Outbound frames buffered while disconnected
    #[arg(long, default_value = "500")]
    pub buffer_capacity: usize,

    /// Stats report interval in seconds
    #[arg(long, default_value = "10")]
    pub stats_interval: u64,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl Args {
    fn reconnection_config(&self) -> ReconnectionConfig {
        let defaults = ReconnectionConfig::default();
        ReconnectionConfig {
            max_attempts: self.max_attempts,
            backoff: BackoffPolicy {
                max_delay: Duration::from_secs(self.max_delay),
                ..defaults.backoff
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: self.breaker_threshold,
                reset_timeout: Duration::from_secs(self.reset_timeout),
                ..defaults.circuit_breaker
            },
            message_buffer_capacity: self.buffer_capacity,
            ..defaults
        }
    }

    fn transport(&self) -> ZmqTransport {
        ZmqTransport::new(ZmqTransportConfig {
            reply_endpoint: self.reply_endpoint.clone(),
            ..Default::default()
        })
    }
}

/// Deterministic sawtooth so the receiving side sees changing samples
fn synthetic_frame(sequence: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (sequence as usize).wrapping_add(i) as u8)
        .collect()
}

async fn run(args: Args) -> Result<()> {
    let connection = ResilientConnection::new(
        args.endpoint.clone(),
        args.transport(),
        args.reconnection_config(),
    );
    info!("Connection id: {}", connection.id());

    let mut states = connection.subscribe();
    let state_logger = tokio::spawn(async move {
        while let Some(state) = states.recv().await {
            if state == ConnectionState::Failed {
                error!("Connection state: {}", state);
            } else {
                info!("Connection state: {}", state);
            }
        }
    });

    let reply_logger = connection.take_incoming().map(|mut incoming| {
        tokio::spawn(async move {
            while let Some(reply) = incoming.recv().await {
                debug!("Received {} byte reply", reply.len());
            }
        })
    });

    connection.connect();

    let mut frames = interval(Duration::from_millis(args.frame_interval.max(1)));
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reports = interval(Duration::from_secs(args.stats_interval.max(1)));
    reports.tick().await;

    let mut sequence: u64 = 0;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C signal");
                break;
            }
            _ = frames.tick() => {
                sequence += 1;
                let outcome = connection.send(synthetic_frame(sequence, args.frame_bytes)).await;
                if outcome == SendOutcome::Buffered && sequence % 50 == 0 {
                    debug!("Frame {} buffered while {}", sequence, connection.state());
                }
                if connection.state() == ConnectionState::Failed {
                    warn!("Connection failed permanently, stopping");
                    break;
                }
            }
            _ = reports.tick() => {
                let stats = connection.stats();
                info!(
                    "Frames: sent={}, buffered={}, flushed={}, dropped={}, failures={}",
                    stats.messages_sent,
                    stats.messages_buffered,
                    stats.messages_flushed,
                    stats.dropped_messages(),
                    stats.connection_failures
                );
            }
        }
    }

    connection.disconnect().await;
    state_logger.abort();
    if let Some(task) = reply_logger {
        task.abort();
    }

    let stats = connection.stats();
    let report = serde_json::to_string_pretty(&stats).context("Failed to serialize stats")?;
    println!("{}", report);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Starting Scout Resilience v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Endpoint: {}", args.endpoint);
    info!("  Reply endpoint: {:?}", args.reply_endpoint);
    info!("  Frame interval: {}ms", args.frame_interval);
    info!("  Max attempts: {}", args.max_attempts);
    info!("  Log level: {:?}", args.log_level);

    if let Err(e) = run(args).await {
        error!("Soak run error: {}", e);
        return Err(e);
    }

    Ok(())
}
