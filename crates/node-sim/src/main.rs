//! Sensor node simulator entry point.
//!
//! Runs the duty, sync and link tasks on threads against simulated hardware.
//! Extra threads stand in for the interrupt sources (wake alarm, time-request
//! line), the RTOS idle hook and a time master that answers every request
//! edge with its UNIX time.

use anyhow::{Context, Result};
use clap::Parser;
use node_common::config::NodeConfig;
use node_runtime::message::{Message, MessageHeader, Payload, BROADCAST_ID};
use node_runtime::node::{NodeContext, TaskNotifications};
use node_runtime::sim::SimHardware;
use node_runtime::{interrupts, tasks};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

/// Device id of the simulated time master.
const MASTER_ID: u16 = 1;

/// Polling period of the simulated interrupt and idle threads.
const POLL_PERIOD: Duration = Duration::from_millis(5);

/// Sensor node simulator command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "node-sim",
    about = "Sensor node simulator - duty cycling, time sync and scheduled board commands",
    version,
    long_about = None
)]
struct Args {
    /// Path to a node configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// How long to run the simulation.
    #[arg(long, short = 'd', default_value = "2m", value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Drift of the simulated local oscillator in ppm (positive: fast).
    #[arg(long, default_value = "30", allow_hyphen_values = true)]
    drift_ppm: i32,

    /// Interval between time requests from the simulated master.
    #[arg(long, default_value = "20s", value_parser = humantime::parse_duration)]
    sync_interval: Duration,

    /// Override the duty cycle wake period.
    #[arg(long, value_parser = humantime::parse_duration)]
    wake_period: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting node simulator");

    let mut config = load_config(&args)?;
    if let Some(period) = args.wake_period {
        config.wake_period = period;
    }
    config.validate().context("Invalid node configuration")?;

    info!(
        node_id = config.node_id,
        wake_period = %humantime::format_duration(config.wake_period),
        low_power_mode = ?config.low_power_mode,
        drift_ppm = args.drift_ppm,
        "Configuration loaded"
    );

    run_node(config, &args)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("node_sim={level},node_runtime={level},node_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_names(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `NODE_CONFIG_PATH` environment variable
/// 3. `config/node.toml` (local development)
/// 4. Built-in defaults
fn load_config(args: &Args) -> Result<NodeConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return NodeConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("NODE_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from NODE_CONFIG_PATH");
            return NodeConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from NODE_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "NODE_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    let local_path = PathBuf::from("config/node.toml");
    if local_path.exists() {
        info!(?local_path, "Loading config from local path");
        return NodeConfig::from_file(&local_path)
            .with_context(|| format!("Failed to load config from {local_path:?}"));
    }

    info!("No config file found, using built-in defaults");
    Ok(NodeConfig::default())
}

/// Current host time as UNIX microseconds.
fn unix_now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
}

fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .with_context(|| format!("Failed to spawn {name} thread"))
}

/// Boot the node, run it for the configured duration, then shut down.
fn run_node(config: NodeConfig, args: &Args) -> Result<()> {
    let sim = SimHardware::realtime(config.tick_frequency_hz, args.drift_ppm);
    let (node, notifications) = NodeContext::new(config, sim.hardware());
    let node = Arc::new(node);
    let TaskNotifications { duty, sync, link } = notifications;

    node.boot();

    let mut handles = Vec::new();

    let n = Arc::clone(&node);
    handles.push(spawn("duty", move || tasks::run_duty_task(&n, &duty))?);
    let n = Arc::clone(&node);
    handles.push(spawn("sync", move || tasks::run_sync_task(&n, &sync))?);
    let n = Arc::clone(&node);
    handles.push(spawn("link", move || tasks::run_link_task(&n, &link))?);

    // Wake alarm interrupt
    let (n, s) = (Arc::clone(&node), sim.clone());
    handles.push(spawn("wake-timer", move || {
        while !n.is_shutdown() {
            if let Some(at) = s.timer.armed_tick() {
                if n.ticks().now_tick() >= at {
                    s.timer.take_armed();
                    interrupts::on_wake_timer(&n);
                }
            }
            thread::sleep(POLL_PERIOD);
        }
    })?);

    // Time master: raise the request line, then answer with its UNIX time
    let (n, s) = (Arc::clone(&node), sim.clone());
    let sync_interval = args.sync_interval;
    handles.push(spawn("master", move || {
        let mut next = Instant::now() + sync_interval;
        let mut seq_no = 0u16;
        while !n.is_shutdown() {
            if Instant::now() < next {
                thread::sleep(POLL_PERIOD);
                continue;
            }
            next += sync_interval;

            let unix_time_us = unix_now_us();
            interrupts::on_time_request_edge(&n);
            s.link.push(Message {
                header: MessageHeader {
                    device_id: MASTER_ID,
                    target_id: BROADCAST_ID,
                    seq_no,
                    generation_time_us: unix_time_us,
                },
                payload: Payload::TimeSync { unix_time_us },
            });
            seq_no = seq_no.wrapping_add(1);
            // Data-ready indication from the transport
            n.notify_link();
        }
    })?);

    // Idle hook
    let n = Arc::clone(&node);
    handles.push(spawn("idle", move || {
        while !n.is_shutdown() {
            n.idle_hook();
            thread::sleep(POLL_PERIOD);
        }
    })?);

    thread::sleep(args.duration);
    node.shutdown();

    let mut failed = false;
    for handle in handles {
        let name = handle.thread().name().unwrap_or("?").to_string();
        if handle.join().is_err() {
            error!(thread = %name, "thread terminated abnormally");
            failed = true;
        }
    }

    let record = node.persisted();
    info!(
        mode = %node.power().current_mode(),
        synchronized = node.sync().is_synchronized(),
        average_drift_ppm = node.sync().average_drift_ppm(),
        duty_cycle_permyriad = node.power().duty_cycle_permyriad(),
        fail_safe_resets = node.power().fail_safe_count(),
        reset_count = record.reset_count,
        board_enabled = sim.board.state().enabled,
        messages_sent = sim.link.sent().len(),
        "Simulation complete"
    );

    if failed {
        anyhow::bail!("node simulation ended with a system reset");
    }
    Ok(())
}
