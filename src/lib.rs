/// Plate Scanner Library
/// 
/// Shared modules for the scanner CLI and operator GUI

pub mod axis;
pub mod blobs;
pub mod calibration;
pub mod calibration_log;
pub mod camera;
pub mod config_loader;
pub mod events;
pub mod gpio;
pub mod image_log;
pub mod image_metrics;
pub mod logging;
pub mod pulse;
pub mod ramp;
pub mod scanner;
pub mod sim;
