use anyhow::{anyhow, Context, Result};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use cooldownsync::clock::{Clock, SystemClock};
use cooldownsync::config::SystemConfig;
use cooldownsync::ntp::UdpTransport;
use cooldownsync::predictor::{
    cooldown_timestamp, is_expired, one_way_latency, seconds_left, should_deprioritize, SwapMode,
    NO_LATENCY,
};
use cooldownsync::status::SyncState;
use cooldownsync::TimeSyncClient;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Client = TimeSyncClient<UdpTransport, SystemClock>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file (defaults are used for anything it leaves out)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Time server to query; repeat to build a failover list
    #[arg(short, long = "server", global = true)]
    servers: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sync and print the resulting status as JSON
    Sync,
    /// Re-sync periodically and log the offset until Ctrl+C
    Watch {
        /// Seconds between syncs
        #[arg(short, long, default_value_t = 300)]
        interval: u64,
    },
    /// Predict when a cooldown that started at EVENT_MS expires
    Predict {
        /// Local Unix ms of the triggering event
        #[arg(long)]
        event_ms: i64,
        /// Cooldown kind from the profile table
        #[arg(long, default_value = "default")]
        profile: String,
        /// Measured round trip to the game server, ms
        #[arg(long)]
        latency_ms: Option<i64>,
        /// Override the configured buffer, ms
        #[arg(long, allow_hyphen_values = true)]
        buffer_ms: Option<i64>,
        /// Use the reduced duration
        #[arg(long)]
        reduced: bool,
        /// Skip the time sync and use the local clock only
        #[arg(long)]
        no_sync: bool,
        /// When to deprioritize the last obstacle: off, near_end, always
        #[arg(long)]
        swap_mode: Option<SwapMode>,
        /// Seconds added to the course lap time
        #[arg(long, allow_hyphen_values = true)]
        lap_buffer_secs: Option<i64>,
        /// Fixed lap time in seconds, replacing the course time
        #[arg(long, allow_hyphen_values = true)]
        custom_lap_secs: Option<i64>,
        /// The course shortcut is available
        #[arg(long)]
        shortcut: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };
    if !args.servers.is_empty() {
        config.sync.servers = args.servers.clone();
    }

    let client = TimeSyncClient::from_config(config.sync.clone());

    match args.command {
        Command::Sync => {
            sync_and_wait(&client);
            let status = client.status();
            println!("{}", serde_json::to_string_pretty(&status)?);
            if status.state != SyncState::Synced {
                return Err(anyhow!("time sync {}", status.state));
            }
        }
        Command::Watch { interval } => watch(&client, Duration::from_secs(interval.max(1)))?,
        Command::Predict {
            event_ms,
            profile,
            latency_ms,
            buffer_ms,
            reduced,
            no_sync,
            swap_mode,
            lap_buffer_secs,
            custom_lap_secs,
            shortcut,
        } => {
            let kind = config
                .cooldown
                .profiles
                .resolve(&profile)
                .with_context(|| {
                    let known: Vec<&str> = config.cooldown.profiles.kinds().collect();
                    format!("unknown profile '{}' (known: {})", profile, known.join(", "))
                })?;

            if !no_sync {
                sync_and_wait(&client);
                if client.sync_state() != SyncState::Synced {
                    warn!("Time sync {}, predicting from the local clock", client.sync_state());
                }
            }

            let latency = latency_ms.map(one_way_latency).unwrap_or(NO_LATENCY);
            let buffer = buffer_ms.unwrap_or(config.cooldown.buffer_ms);
            let request = kind.request_from(
                &client,
                event_ms,
                latency,
                buffer,
                reduced || config.cooldown.use_reduction,
            );
            let expiry = cooldown_timestamp(&request);

            let cooldown = &config.cooldown;
            let threshold = kind.lap_threshold_secs(
                shortcut || cooldown.use_shortcut,
                custom_lap_secs.or(cooldown.custom_lap_secs),
                lap_buffer_secs.unwrap_or(cooldown.lap_buffer_secs),
            );
            let swap_mode = swap_mode.unwrap_or(cooldown.swap_mode);

            let now = SystemClock.now_millis();
            let when = Local
                .timestamp_millis_opt(expiry)
                .single()
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "out of range".to_string());

            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "expires_ms": expiry,
                "expires": when,
                "seconds_left": seconds_left(expiry, now),
                "expired": is_expired(expiry, now),
                "lap_threshold_secs": threshold,
                "deprioritize": should_deprioritize(expiry, now, threshold, swap_mode),
                "clock_offset_ms": request.clock_offset_millis,
                "sync_state": client.sync_state(),
            }))?);
        }
    }

    Ok(())
}

fn sync_and_wait(client: &Client) {
    if let Some(worker) = client.start_sync() {
        if worker.join().is_err() {
            warn!("Sync worker panicked");
        }
    }
}

fn watch(client: &Client, interval: Duration) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let mut last_sync: Option<Instant> = None;
    let mut last_state = SyncState::NotSynced;

    while running.load(Ordering::SeqCst) {
        if last_sync.map_or(true, |t| t.elapsed() >= interval) {
            // Fire and forget; a still-running worker makes this a no-op.
            client.start_sync();
            last_sync = Some(Instant::now());
        }

        let status = client.status();
        if status.state != last_state {
            if status.state.is_terminal() {
                info!(
                    "[Status] {} | Offset: {} ms | Server: {}",
                    status.state,
                    status.offset_ms,
                    status.server.as_deref().unwrap_or("-")
                );
            } else {
                debug!("[Status] {}", status.state);
            }
            last_state = status.state;
        }

        thread::sleep(Duration::from_millis(200));
    }

    info!("Exiting.");
    Ok(())
}
