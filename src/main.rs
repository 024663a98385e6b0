use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;

use plantcam::camera::{Camera, CommandCamera, SpoolCamera};
use plantcam::config::{AppConfig, CameraBackend};
use plantcam::export::{self, ExportFormat};
use plantcam::{logging, PlantMonitor};

struct CliArgs {
    base_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    command: Vec<String>,
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        base_path: None,
        config_path: None,
        command: Vec::new(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" if cli.command.is_empty() => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("plantcam {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    cli.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--base" | "-b" => {
                if i + 1 < args.len() {
                    cli.base_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --base requires a path argument");
                    std::process::exit(1);
                }
            }
            _ => {
                cli.command.push(args[i].clone());
            }
        }
        i += 1;
    }

    cli
}

fn print_help() {
    println!(
        r#"plantcam - fixed-camera plant monitoring

USAGE:
    plantcam [OPTIONS] <COMMAND>

COMMANDS:
    register NAME [KEY=VALUE ...]   Register a plant (with optional info)
    capture [--plant ID] [--notes TEXT]
                                    Capture one frame and archive it
    analyze IMAGE_PATH              Analyze an archived raw image
    plants                          List registered plants
    timeline PLANT_ID [--days N] [--export FILE.csv|FILE.json]
                                    Show (or export) a plant's recent captures
    stats                           Registry and disk usage summary
    cleanup [--days N] [--apply]    Plan (or, with --apply, perform) cleanup

OPTIONS:
    --base, -b PATH     Data tree root (overrides config)
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PLANTCAM_CONFIG     Path to config file (overrides default location)
    PLANTCAM_LOG        Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/plantcam/config.toml

See also: plantcam-daemon --help"#
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

fn main() -> Result<()> {
    let cli = parse_args();

    let app_config = match &cli.config_path {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    let base = cli.base_path.clone().unwrap_or(app_config.base_path.clone());

    let _ = logging::init(Some(base.join("logs")));

    let monitor = PlantMonitor::open(&base)
        .with_context(|| format!("failed to open data tree at {}", base.display()))?;

    let mut cmd = cli.command.iter().map(String::as_str);
    match cmd.next() {
        Some("register") => {
            let name = cmd.next().context("register requires a plant name")?;
            let mut info = BTreeMap::new();
            for pair in cmd {
                let Some((key, value)) = pair.split_once('=') else {
                    bail!("info entries must be KEY=VALUE, got '{}'", pair);
                };
                info.insert(key.to_string(), serde_json::Value::from(value));
            }
            let record = monitor.register_plant(name, info)?;
            println!("Registered '{}' (id: {})", record.display_name, record.id);
        }
        Some("capture") => {
            let rest: Vec<&str> = cmd.collect();
            let plant = flag_value(&rest, "--plant");
            let notes = flag_value(&rest, "--notes").unwrap_or("");

            let mut camera = open_camera(&app_config, &monitor)?;
            let metadata = monitor.capture(camera.as_mut(), plant, notes)?;
            println!("Captured {}", metadata.relative_path);
            println!(
                "  {}x{}, {:.1} KB",
                metadata.image_properties.width,
                metadata.image_properties.height,
                metadata.image_properties.size_in_bytes as f64 / 1024.0
            );
        }
        Some("analyze") => {
            let path = cmd.next().context("analyze requires an image path")?;
            let record = monitor.analyze(std::path::Path::new(path), None)?;
            let detection = &record.analysis.plant_detection;
            println!(
                "Plant detected: {} ({:.2}% coverage)",
                if detection.plant_detected { "yes" } else { "no" },
                detection.green_coverage_percent
            );
            if let Some(overlay) = &record.overlay_image_path {
                println!("Overlay: {}", overlay.display());
            }
        }
        Some("plants") => {
            let ids = monitor.registry().list_ids();
            if ids.is_empty() {
                println!("No plants registered");
            }
            for id in ids {
                if let Some(plant) = monitor.registry().lookup(&id) {
                    println!(
                        "{:<20} {:<20} {} images",
                        plant.id, plant.display_name, plant.image_count
                    );
                }
            }
        }
        Some("timeline") => {
            let plant_id = cmd.next().context("timeline requires a plant id")?;
            let rest: Vec<&str> = cmd.collect();
            let days: u32 = flag_value(&rest, "--days")
                .map(str::parse)
                .transpose()
                .context("--days must be a number")?
                .unwrap_or(30);

            let timeline = monitor.timeline(plant_id, days)?;

            if let Some(output) = flag_value(&rest, "--export") {
                let output = PathBuf::from(output);
                let format = ExportFormat::from_extension(&output)
                    .context("--export file must end in .csv or .json")?;
                let count = export::export_timeline(&timeline, &output, format)?;
                println!("Exported {} captures to {}", count, output.display());
            } else {
                println!("{} captures in the last {} days", timeline.len(), days);
                for item in &timeline {
                    println!(
                        "  {}  {}",
                        item.capture_time.format("%Y-%m-%d %H:%M"),
                        item.filename
                    );
                }
            }
        }
        Some("stats") => {
            let stats = monitor.stats()?;
            println!("Plants registered: {}", stats.plants_registered);
            println!("Total images:      {}", stats.total_images);
            println!(
                "Data tree size:    {:.1} MB in {} files",
                stats.disk_usage.total_bytes as f64 / (1024.0 * 1024.0),
                stats.disk_usage.file_count
            );
        }
        Some("cleanup") => {
            let rest: Vec<&str> = cmd.collect();
            let days: Option<u32> = flag_value(&rest, "--days")
                .map(str::parse)
                .transpose()
                .context("--days must be a number")?;
            let apply = rest.contains(&"--apply");

            let plan = monitor.plan_cleanup(days)?;
            if plan.is_empty() {
                println!("Nothing to clean up");
            } else if apply {
                let result = monitor.apply_cleanup(&plan)?;
                println!(
                    "Removed {} files, freed {:.1} MB",
                    result.files_deleted,
                    result.bytes_freed as f64 / (1024.0 * 1024.0)
                );
            } else {
                for path in &plan {
                    println!("{}", path.display());
                }
                println!("{} files would be removed (rerun with --apply)", plan.len());
            }
        }
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            print_help();
            std::process::exit(1);
        }
        None => {
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Find the value following `flag` in an argument slice.
fn flag_value<'a>(args: &[&'a str], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| *a == flag)
        .and_then(|i| args.get(i + 1))
        .copied()
}
