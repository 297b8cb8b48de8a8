/// fern logger for the operator GUI: timestamped lines on stderr and in a
/// log file next to the calibration data.

use anyhow::{Context, Result};
use std::path::Path;

pub const LOG_NAME: &str = "platescanner.log";

fn level_from_env() -> log::LevelFilter {
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(log::LevelFilter::Info)
}

fn dispatch(level: log::LevelFilter) -> fern::Dispatch {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        // egui/winit chatter
        .level_for("eframe", log::LevelFilter::Warn)
        .level_for("egui_glow", log::LevelFilter::Warn)
        .level_for("winit", log::LevelFilter::Warn)
}

/// Install the global logger. `RUST_LOG` may name a level; default `info`.
pub fn init(log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir).with_context(|| format!("Failed to create log directory {:?}", log_dir))?;
    let path = log_dir.join(LOG_NAME);
    let file = fern::log_file(&path).with_context(|| format!("Failed to open log file {:?}", path))?;
    dispatch(level_from_env())
        .chain(std::io::stderr())
        .chain(file)
        .apply()
        .context("A logger is already installed")?;
    log::info!(target: "platescanner::logging", "logging to {:?}", path);
    Ok(())
}
