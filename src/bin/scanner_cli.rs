//! Command-line control of the plate scanner: status, jog, fixed moves,
//! homing, calibration and offline image analysis.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver, Sender};
use platescanner::axis::Direction;
use platescanner::camera::{Frame, FrameSource};
use platescanner::config_loader::{self, ScannerSettings};
use platescanner::events::{EventBus, ScannerEvent};
use platescanner::image_log::ImageDataLog;
use platescanner::image_metrics::{analyze, ImageQuality};
use platescanner::scanner::Scanner;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Plate scanner control (strict config from plate_scanner.yaml)
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML file to read instead of the default plate_scanner.yaml
    #[arg(long)]
    config: Option<PathBuf>,
    /// Host block to use instead of this machine's hostname
    #[arg(long)]
    host: Option<String>,
    /// Run the axes on the simulated rig regardless of the host block
    #[arg(long, default_value_t = false)]
    simulate: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print axes, positions and hardware availability
    Status,
    /// Continuous motion for a while, then ramp down
    Jog {
        axis: String,
        direction: Direction,
        #[arg(long, default_value_t = 1000)]
        millis: u64,
    },
    /// Move a fixed number of steps (negative runs in reverse)
    Run {
        axis: String,
        #[arg(allow_hyphen_values = true)]
        steps: i64,
    },
    /// Drive an axis onto its home switch
    Home { axis: String },
    /// Home every axis and visit the configured calibration points
    Calibrate {
        #[arg(long, default_value_t = false)]
        parallel: bool,
    },
    /// Grid and blob metrics of image files
    Analyze {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Write <image>_IQM.csv and <image>_blobData.csv
        #[arg(long, default_value_t = false)]
        csv: bool,
        /// Print the metrics as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Serialize)]
struct AnalyzeReport<'a> {
    image: String,
    quality: &'a ImageQuality,
    blobs: usize,
}

fn load_settings(args: &Args) -> Result<ScannerSettings> {
    let hostname = args.host.clone().unwrap_or_else(config_loader::current_hostname);
    let path = args.config.clone().unwrap_or_else(config_loader::yaml_path);
    let mut settings = config_loader::load_scanner_settings_from(&path, &hostname)?;
    if args.simulate {
        settings.simulate = true;
        settings.gpio_enabled = false;
    }
    Ok(settings)
}

/// Print events as they arrive and forward snapshot requests to `snapshots`.
fn print_events(rx: Receiver<ScannerEvent>, snapshots: Sender<Vec<i64>>) {
    let spawned = std::thread::Builder::new().name("events".to_string()).spawn(move || {
        for event in rx {
            match event {
                // Per-phase transitions are too chatty for a terminal.
                ScannerEvent::StateChanged { .. } => {}
                ScannerEvent::SnapshotRequest { coordinates } => {
                    println!("snapshot requested at {:?}", coordinates);
                    let _ = snapshots.send(coordinates);
                }
                other => println!("{}", other),
            }
        }
    });
    if let Err(e) = spawned {
        log::warn!(target: "scanner_cli", "event printer unavailable: {}", e);
    }
}

fn status(scanner: &Scanner) {
    for axis in scanner.axes() {
        println!(
            "{:>4}: position {:>8}  {:<12} hardware={}",
            axis.name(),
            axis.position(),
            axis.state().to_string(),
            if axis.has_hardware() { "yes" } else { "no" }
        );
    }
    println!("active motors: {}", scanner.active_motors());
}

fn calibrate(scanner: &Scanner, settings: &ScannerSettings, snapshots: &Receiver<Vec<i64>>) -> Result<()> {
    let mut camera: Option<Box<dyn FrameSource>> = settings.camera.open()?;
    let mut archive = |coordinates: Vec<i64>| -> Result<()> {
        let frame = match camera.as_mut().map(|c| c.next_frame()) {
            Some(Ok(frame)) => Some(frame),
            Some(Err(e)) => {
                log::warn!(target: "scanner_cli", "no frame for {:?}: {:#}", coordinates, e);
                None
            }
            None => None,
        };
        scanner.handle_snapshot_request(&coordinates, frame.as_ref())?;
        Ok(())
    };

    if !scanner.calibrator().run() {
        return Err(anyhow!("Calibration did not start"));
    }
    // Archive each point as soon as it is requested.
    let mut handled = 0;
    while scanner.calibrator().is_running() {
        if let Ok(coordinates) = snapshots.recv_timeout(Duration::from_millis(50)) {
            archive(coordinates)?;
            handled += 1;
        }
    }
    let report = scanner
        .calibrator()
        .wait()
        .ok_or_else(|| anyhow!("Calibration thread ended without a report"))?;
    while handled < report.snapshots {
        let coordinates = snapshots
            .recv_timeout(Duration::from_secs(1))
            .map_err(|_| anyhow!("Snapshot request lost"))?;
        archive(coordinates)?;
        handled += 1;
    }

    if report.cancelled {
        return Err(anyhow!("Calibration cancelled"));
    }
    if !report.all_homed() {
        return Err(anyhow!("Calibration failed on {}", report.failed().join(", ")));
    }
    println!(
        "calibrated at {:?}, {} points logged to {:?}",
        report.coordinates,
        report.snapshots,
        scanner.calibration_log().log_path()
    );
    Ok(())
}

fn run_analyze(settings: &ScannerSettings, images: &[PathBuf], csv: bool, json: bool) -> Result<()> {
    for path in images {
        let frame = Frame::load(path)?;
        let analysis = analyze(&frame, &settings.image)?;
        let q = &analysis.quality;
        if json {
            let report = AnalyzeReport { image: path.display().to_string(), quality: q, blobs: analysis.blobs.len() };
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!(
                "{}: grid x={} y={}  sharpness x={:.2} y={:.2}  laplacian={:.2}  roi={}  blobs={}",
                path.display(),
                q.x.grid_found,
                q.y.grid_found,
                q.x.sharpness,
                q.y.sharpness,
                q.laplacian_variance,
                q.roi_area,
                analysis.blobs.len()
            );
        }
        if csv {
            ImageDataLog::write(&ImageDataLog::stem_of(path), q, &analysis.blobs)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut settings = load_settings(&args)?;

    if let Command::Analyze { images, csv, json } = &args.command {
        return run_analyze(&settings, images, *csv, *json);
    }
    if let Command::Calibrate { parallel: true } = &args.command {
        settings.calibration.mode = platescanner::calibration::SequenceMode::Parallel;
    }

    let (events, rx) = EventBus::new();
    let (snapshot_tx, snapshot_rx) = unbounded();
    print_events(rx, snapshot_tx);
    let scanner = Arc::new(Scanner::new(&settings, events)?);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let scanner = Arc::clone(&scanner);
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
            scanner.stop_all();
        })
        .map_err(|e| anyhow!("Failed to install Ctrl-C handler: {}", e))?;
    }

    let result = match &args.command {
        Command::Status => {
            status(&scanner);
            Ok(())
        }
        Command::Jog { axis, direction, millis } => {
            let axis = scanner.axis_or_err(axis)?;
            axis.activate(*direction);
            let deadline = Instant::now() + Duration::from_millis(*millis);
            while Instant::now() < deadline && axis.is_running() && !interrupted.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
            axis.stop();
            println!("{}: position {}", axis.name(), axis.position());
            Ok(())
        }
        Command::Run { axis, steps } => {
            let axis = scanner.axis_or_err(axis)?;
            let moved = axis.run(*steps)?;
            println!("{}: moved {} steps, position {}", axis.name(), moved, axis.position());
            Ok(())
        }
        Command::Home { axis } => {
            let axis = scanner.axis_or_err(axis)?;
            let outcome = axis.home()?;
            if outcome.is_homed() {
                Ok(())
            } else {
                Err(anyhow!("{}: homing {}", axis.name(), outcome))
            }
        }
        Command::Calibrate { .. } => calibrate(&scanner, &settings, &snapshot_rx),
        Command::Analyze { .. } => Ok(()),
    };

    scanner.shutdown();
    // Let the printer drain the last events.
    std::thread::sleep(Duration::from_millis(50));
    result
}
