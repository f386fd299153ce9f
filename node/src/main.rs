//! framecast node
//!
//! Runs one engine instance: the frame loop, the RPC front (primary only)
//! and the snapshot stream. A node is primary unless a primary address is
//! configured.

use anyhow::{Context, Result};
use clap::Parser;
use framecast_core::{BroadcastChannelSink, Engine, EngineConfig, NodeRole, RpcServer, TickReport};
use framecast_env::{NodeId, TcpBackend, TokioContext};
use framecast_sim::KinematicSimulation;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod streaming;

/// Broadcasts a slow streaming client may fall behind before skipping
const STREAM_BUFFER: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "framecast-node")]
#[command(about = "Run a framecast primary or secondary node", long_about = None)]
struct Args {
    /// TOML config file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    rpc_port: Option<u16>,

    #[arg(long)]
    streaming_port: Option<u16>,

    /// Port this node listens on for secondaries (primary only)
    #[arg(long)]
    secondary_port: Option<u16>,

    /// Run as a secondary of this host
    #[arg(long)]
    primary_address: Option<String>,

    #[arg(long)]
    primary_port: Option<u16>,

    /// Start in synchronous (tick-cue) mode
    #[arg(long)]
    synchronous: bool,

    /// Fixed simulation step in seconds
    #[arg(long)]
    fixed_delta: Option<f64>,

    #[arg(long)]
    rpc_threads: Option<usize>,

    /// Host frame rate in Hz
    #[arg(long, default_value = "20")]
    fps: u32,

    /// Physics seed for the kinematic collaborator
    #[arg(long, default_value = "42")]
    seed: u64,
}

impl Args {
    fn resolve_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => EngineConfig::default(),
        };

        if let Some(port) = self.rpc_port {
            config.rpc_port = port;
        }
        if let Some(port) = self.streaming_port {
            config.streaming_port = port;
        }
        if let Some(port) = self.secondary_port {
            config.secondary_port = port;
        }
        if let Some(address) = &self.primary_address {
            config.primary_address = address.clone();
        }
        if let Some(port) = self.primary_port {
            config.primary_port = port;
        }
        if self.synchronous {
            config.episode.synchronous_mode = true;
        }
        if self.fixed_delta.is_some() {
            config.episode.fixed_delta_seconds = self.fixed_delta;
        }
        if self.rpc_threads.is_some() {
            config.rpc_threads = self.rpc_threads;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.resolve_config()?;

    let context = TokioContext::shared(tokio::runtime::Handle::current());
    let backend = Arc::new(TcpBackend::new(context.clone()));
    let local_id = NodeId::new();

    let streams = BroadcastChannelSink::new(STREAM_BUFFER);
    let frames = streams.sender();

    let mut engine = Engine::new(config.clone(), local_id, context, backend)
        .with_simulation(Box::new(KinematicSimulation::new(args.seed)));
    engine.add_sink(Box::new(streams));

    let session = engine.start_session().context("starting session")?;
    let role = engine
        .episodes()
        .session()
        .map(|s| s.role())
        .unwrap_or(NodeRole::Primary);
    info!("Node {} is {} (session {})", local_id, role.as_str(), session);

    let _rpc = match role {
        NodeRole::Primary => Some(
            RpcServer::start(config.rpc_port, config.rpc_threads(), engine.command_handle())
                .context("starting RPC server")?,
        ),
        NodeRole::Secondary => None,
    };

    let listener = TcpListener::bind(("0.0.0.0", config.streaming_port))
        .await
        .with_context(|| format!("binding streaming port {}", config.streaming_port))?;
    tokio::spawn(streaming::serve(listener, frames));

    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / args.fps.max(1) as f64));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut last = Instant::now();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Instant::now();
                let host_delta = now.duration_since(last).as_secs_f64();
                last = now;

                match engine.tick(host_delta) {
                    TickReport::Completed(summary) => {
                        if let Some(fan_out) = &summary.fan_out {
                            if !fan_out.failed.is_empty() {
                                warn!("Frame {}: {} secondaries missed it", summary.frame, fan_out.failed.len());
                            }
                        }
                        if summary.frame % 100 == 0 {
                            info!("Frame {} ({} actors)", summary.frame,
                                engine.episodes().session().map_or(0, |s| s.world().len()));
                        }
                    }
                    TickReport::Blocked { frame } => debug!("Frame {}: waiting for tick-cue", frame),
                    TickReport::Idle => {}
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Signal handler failed: {}", e);
                }
                break;
            }
        }
    }

    info!("Shutting down");
    engine.end_session().context("ending session")?;
    Ok(())
}
