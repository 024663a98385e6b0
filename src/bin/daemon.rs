//! Plantcam daemon for scheduled monitoring.
//!
//! Runs the periodic capture loop in the background:
//! - captures every registered plant on the configured interval, within
//!   active hours and under the daily quota
//! - daily housekeeping (yesterday's capture count, temp-file pruning)
//! - weekly maintenance (stats log, disk usage warning)
//!
//! ## Usage
//!
//! ```bash
//! plantcam-daemon              # Run in foreground
//! plantcam-daemon --once       # Run one capture round and exit
//! ```
//!
//! ## systemd Service
//!
//! Install the service file and enable:
//! ```bash
//! sudo cp plantcam.service /etc/systemd/system/
//! sudo systemctl enable --now plantcam
//! ```

use anyhow::{Context, Result};
use chrono::Local;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use plantcam::camera::{Camera, CommandCamera, SpoolCamera};
use plantcam::config::{AppConfig, CameraBackend};
use plantcam::schedule::{week_of, CaptureSchedule, Decision};
use plantcam::{logging, PlantMonitor};

/// Pause between per-plant captures in a round, letting the camera settle.
const INTER_CAPTURE_PAUSE: Duration = Duration::from_secs(2);

/// Temp files older than this many days are pruned by daily housekeeping.
const TEMP_MAX_AGE_DAYS: u32 = 1;

/// Weekly maintenance warns above this data-tree size
/// (roughly 85% of a 32 GB SD card).
const DISK_WARN_BYTES: u64 = 27 * 1024 * 1024 * 1024;

/// Daemon configuration
struct DaemonConfig {
    /// Poll interval for schedule checks (seconds)
    poll_interval: u64,
    /// Run one capture round and exit
    once: bool,
    /// Config path override
    config_path: Option<PathBuf>,
    /// Data tree override
    base_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval: 60,
            once: false,
            config_path: None,
            base_path: None,
        }
    }
}

fn main() -> Result<()> {
    let daemon_config = parse_args();

    let app_config = match &daemon_config.config_path {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    let base = daemon_config
        .base_path
        .clone()
        .unwrap_or(app_config.base_path.clone());

    logging::init(Some(base.join("logs")))?;

    info!("Plantcam daemon starting...");

    let monitor = PlantMonitor::open(&base)
        .with_context(|| format!("failed to open data tree at {}", base.display()))?;
    info!("Data tree opened at {:?}", base);

    let mut camera = open_camera(&app_config, &monitor)?;

    if daemon_config.once {
        info!("Running in single-shot mode");
        let captured = capture_round(&monitor, camera.as_mut());
        info!("Capture round finished: {} capture(s)", captured);
    } else {
        info!(
            "Running in daemon mode, polling every {} seconds",
            daemon_config.poll_interval
        );
        run_daemon_loop(&monitor, camera.as_mut(), daemon_config.poll_interval);
    }

    info!("Plantcam daemon stopped");
    Ok(())
}

fn parse_args() -> DaemonConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = DaemonConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => {
                config.once = true;
            }
            "--interval" | "-i" => {
                if i + 1 < args.len() {
                    if let Ok(interval) = args[i + 1].parse() {
                        config.poll_interval = interval;
                    }
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--base" | "-b" => {
                if i + 1 < args.len() {
                    config.base_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

fn print_help() {
    println!(
        r#"plantcam-daemon - Scheduled monitoring loop for plantcam

USAGE:
    plantcam-daemon [OPTIONS]

OPTIONS:
    --once, -1          Run one capture round and exit
    --interval, -i N    Poll interval in seconds (default: 60)
    --config, -c PATH   Path to config file
    --base, -b PATH     Data tree root (overrides config)
    --help, -h          Show this help message

ENVIRONMENT:
    PLANTCAM_CONFIG     Path to config file (overrides default location)
    PLANTCAM_LOG        Log level (trace, debug, info, warn, error)

The daemon captures every registered plant on the interval configured in
the data tree's config.json, within active hours and under the daily
capture quota. Housekeeping runs daily; a stats summary is logged weekly.

Install as systemd service:
    sudo cp plantcam.service /etc/systemd/system/
    sudo systemctl enable --now plantcam
"#
    );
}

fn open_camera(config: &AppConfig, monitor: &PlantMonitor) -> Result<Box<dyn Camera>> {
    match config.camera.backend {
        CameraBackend::Command => Ok(Box::new(CommandCamera::new(
            config.camera.command.clone(),
            monitor.config().camera_settings,
            monitor.store().base().join("temp"),
        ))),
        CameraBackend::Spool => {
            let dir = config
                .camera
                .spool_dir
                .clone()
                .context("camera.spool_dir must be set for the spool backend")?;
            Ok(Box::new(SpoolCamera::new(dir)))
        }
    }
}

fn run_daemon_loop(monitor: &PlantMonitor, camera: &mut dyn Camera, poll_interval: u64) {
    let mut schedule = CaptureSchedule::from_settings(&monitor.config().monitoring);
    let mut current_week = week_of(Local::now());

    loop {
        let now = Local::now();

        // Day boundary: report yesterday, prune temp files.
        if let Some((date, count)) = schedule.take_finished_day(now) {
            info!("Captures on {}: {}", date, count);
            match monitor.store().prune_temp_files(TEMP_MAX_AGE_DAYS) {
                Ok(0) => {}
                Ok(removed) => info!("Pruned {} stale temp file(s)", removed),
                Err(e) => warn!("Temp pruning failed: {}", e),
            }
        }

        // Week boundary: stats summary and advisory cleanup reminder.
        let week = week_of(now);
        if week != current_week {
            current_week = week;
            weekly_maintenance(monitor);
        }

        match schedule.tick(now) {
            Decision::Capture => {
                let captured = capture_round(monitor, camera);
                schedule.record_captures(captured, now);
            }
            Decision::NotDue => {}
            Decision::OutsideActiveHours => {
                tracing::debug!("Outside active hours, skipping this cycle");
            }
            Decision::QuotaReached => {
                warn!("Daily capture quota reached, skipping this cycle");
            }
        }

        thread::sleep(Duration::from_secs(poll_interval));
    }
}

/// Capture every registered plant once (or a single general capture when
/// no plants are registered). Per-plant failures are logged and skipped;
/// returns the number of successful captures.
fn capture_round(monitor: &PlantMonitor, camera: &mut dyn Camera) -> u32 {
    let targets = monitor.registry().list_ids();

    if targets.is_empty() {
        info!("No plants registered, running a general capture");
        return match monitor.capture(camera, None, "scheduled capture") {
            Ok(metadata) => {
                info!("Captured {}", metadata.filename);
                1
            }
            Err(e) => {
                error!("Scheduled capture failed: {}", e);
                0
            }
        };
    }

    let mut captured = 0;
    for (index, plant_id) in targets.iter().enumerate() {
        match monitor.capture(camera, Some(plant_id), "scheduled capture") {
            Ok(metadata) => {
                info!("Captured {}: {}", plant_id, metadata.filename);
                captured += 1;
            }
            Err(e) => {
                error!("Capture failed for {}: {}", plant_id, e);
            }
        }
        if index + 1 < targets.len() {
            thread::sleep(INTER_CAPTURE_PAUSE);
        }
    }

    info!("Capture round: {}/{} succeeded", captured, targets.len());
    captured
}

fn weekly_maintenance(monitor: &PlantMonitor) {
    info!("Weekly maintenance");

    match monitor.stats() {
        Ok(stats) => {
            info!(
                "Stats: {} plant(s), {} image(s), {:.1} MB in {} files",
                stats.plants_registered,
                stats.total_images,
                stats.disk_usage.total_bytes as f64 / (1024.0 * 1024.0),
                stats.disk_usage.file_count
            );
            if stats.disk_usage.total_bytes > DISK_WARN_BYTES {
                warn!(
                    "Data tree is large ({:.1} GB); consider running 'plantcam cleanup'",
                    stats.disk_usage.total_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
                );
            }
        }
        Err(e) => warn!("Stats collection failed: {}", e),
    }

    // Retention is advisory by design: report what a cleanup would remove,
    // never delete from the maintenance path.
    let retain_days = monitor.config().monitoring.retain_days;
    match monitor.plan_cleanup(None) {
        Ok(plan) if plan.is_empty() => {}
        Ok(plan) => info!(
            "{} file(s) older than {} days; run 'plantcam cleanup --apply' to remove them",
            plan.len(),
            retain_days
        ),
        Err(e) => warn!("Cleanup planning failed: {}", e),
    }
}
