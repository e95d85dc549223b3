mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tunrelay_stack::{
    DeviceConfig, Engine, EngineConfig, FdDevice, LogLevel, ThreadState, VirtualDevice,
};

/// tunrelay - user-space NAT relay for TUN devices
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "tunrelay.yaml")]
    config: String,

    /// Use an already open TUN descriptor instead of opening one
    #[arg(long)]
    tun_fd: Option<i32>,

    /// TUN interface name
    #[arg(long, default_value = "tun0")]
    tun_name: String,

    /// Override the configured log level (error, warn, info, debug, trace)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Seconds between monitor snapshots in the debug log (0 disables)
    #[arg(long, default_value_t = 30)]
    monitor_interval: u64,

    /// Test configuration and exit
    #[arg(short, long)]
    test_config: bool,
}

fn load_config(path: &str) -> Result<EngineConfig> {
    if Path::new(path).exists() {
        EngineConfig::load(path).with_context(|| format!("failed to load {}", path))
    } else {
        Ok(EngineConfig::default())
    }
}

fn parse_level(level: &str) -> Result<LogLevel> {
    serde_yaml::from_str(level).with_context(|| format!("unknown log level: {}", level))
}

fn open_device(args: &Args, mtu: usize) -> Result<Arc<dyn VirtualDevice>> {
    let config = DeviceConfig {
        name: args.tun_name.clone(),
        mtu,
    };
    let device = match args.tun_fd {
        // SAFETY: the descriptor is handed to us by the caller and owned from here on.
        Some(fd) => unsafe { FdDevice::from_raw_fd(fd, config)? },
        None => FdDevice::open(config)?,
    };
    Ok(Arc::new(device))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if let Some(level) = &args.log_level {
        config.log_level = parse_level(level)?;
    }
    logging::init_logging(config.log_level)?;

    if args.test_config {
        config.validate()?;
        println!("Configuration test passed!");
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, shutdown.clone())?;
    }

    let device = open_device(&args, config.mtu)?;
    let engine = Engine::builder().config(config).build()?;
    engine.start(device)?;
    info!("tunrelay started. Press Ctrl+C to stop.");

    let interval = Duration::from_secs(args.monitor_interval);
    let mut last_report = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
        if !interval.is_zero() && last_report.elapsed() >= interval {
            last_report = Instant::now();
            match serde_json::to_string(&engine.snapshot()) {
                Ok(json) => debug!("monitor: {}", json),
                Err(e) => warn!("monitor snapshot failed: {}", e),
            }
        }
        let failed = engine
            .snapshot()
            .threads
            .into_iter()
            .find(|t| t.state == ThreadState::Failed);
        if let Some(thread) = failed {
            warn!("worker thread {} failed, shutting down", thread.name);
            break;
        }
    }

    info!("Shutting down tunrelay...");
    engine.stop();
    let stats = engine.stats().snapshot();
    info!(
        "tunrelay stopped: {} packets in, {} out, {} tcp flows, {} udp flows",
        stats.packets_received,
        stats.packets_sent,
        stats.tcp_connections_total,
        stats.udp_sessions_total
    );
    Ok(())
}
