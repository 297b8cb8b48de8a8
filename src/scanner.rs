/// Scanner module - rig coordinator: one controller per configured axis, the
/// shared motor counter, the calibration sequencer and the calibration log

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::axis::{ActiveMotorCounter, AxisController, Direction, StepperHardware};
use crate::calibration::CalibrationSequencer;
use crate::calibration_log::CalibrationLog;
use crate::camera::Frame;
use crate::config_loader::{AxisSettings, ScannerSettings};
use crate::events::EventBus;
use crate::gpio::{self, GpioAxisPins};
use crate::sim::SimulatedStepper;

const SOURCE: &str = "scanner";

pub struct Scanner {
    axes: Vec<Arc<AxisController>>,
    counter: ActiveMotorCounter,
    calibrator: CalibrationSequencer,
    log: CalibrationLog,
    events: EventBus,
}

/// Mechanical model of a simulated axis. Switches exist only where the host
/// block wires one: home at 0, far switch at `SIM.TRAVEL` on the other side.
fn simulated_axis(axis: &AxisSettings) -> SimulatedStepper {
    let (start, travel) = match axis.home_direction {
        Direction::Reverse => (axis.sim.start, axis.sim.travel),
        Direction::Forward => (-axis.sim.start, axis.sim.travel.map(|t| -t)),
    };
    let mut sim = SimulatedStepper::new(start)
        .with_home_switch_at(axis.limit_pin.map(|_| 0))
        .with_home_direction(axis.home_direction)
        .with_far_switch_at(axis.safety_pin.and(travel));
    if axis.sim.time_scale > 0.0 {
        sim = sim.with_real_time(axis.sim.time_scale);
    }
    sim
}

fn open_hardware(settings: &ScannerSettings, axis: &AxisSettings, events: &EventBus) -> Option<Box<dyn StepperHardware>> {
    if settings.simulate {
        return Some(Box::new(simulated_axis(axis)));
    }
    if !settings.gpio_enabled {
        events.warn(&axis.name, "GPIO disabled for this host, axis has no hardware");
        return None;
    }
    match gpio::open_axis(settings.gpio_chip.as_deref(), &GpioAxisPins::from(axis)) {
        Ok(hardware) => Some(hardware),
        Err(e) => {
            events.warn(&axis.name, format!("GPIO unavailable: {}", e));
            None
        }
    }
}

impl Scanner {
    pub fn new(settings: &ScannerSettings, events: EventBus) -> Result<Self> {
        settings.validate()?;
        let ramp = settings.ramp.profile()?;
        let counter = ActiveMotorCounter::new();

        let axes: Vec<Arc<AxisController>> = settings
            .axes
            .iter()
            .map(|axis| {
                let hardware = open_hardware(settings, axis, &events);
                Arc::new(AxisController::new(
                    axis.axis_config(&ramp),
                    hardware,
                    counter.clone(),
                    events.clone(),
                ))
            })
            .collect();

        let calibrator = CalibrationSequencer::new(axes.clone(), settings.calibration.mode, events.clone())
            .with_points(settings.calibration.points.clone());
        let log = CalibrationLog::new(&settings.calibration.log_dir, &settings.calibration.app_name)?;

        log::info!(
            target: "platescanner::scanner",
            "{} axes ({}), calibration {:?}, log in {:?}",
            axes.len(),
            axes.iter().map(|a| a.name()).collect::<Vec<_>>().join(", "),
            calibrator.mode(),
            log.dir()
        );

        Ok(Self { axes, counter, calibrator, log, events })
    }

    pub fn axis(&self, name: &str) -> Option<&Arc<AxisController>> {
        self.axes.iter().find(|a| a.name().eq_ignore_ascii_case(name))
    }

    pub fn axis_or_err(&self, name: &str) -> Result<&Arc<AxisController>> {
        self.axis(name).ok_or_else(|| {
            let known: Vec<&str> = self.axes.iter().map(|a| a.name()).collect();
            anyhow!("Unknown axis '{}' (configured: {})", name, known.join(", "))
        })
    }

    pub fn axes(&self) -> &[Arc<AxisController>] {
        &self.axes
    }

    pub fn positions(&self) -> Vec<i64> {
        self.axes.iter().map(|a| a.position()).collect()
    }

    pub fn active_motors(&self) -> usize {
        self.counter.active()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn calibrator(&self) -> &CalibrationSequencer {
        &self.calibrator
    }

    pub fn calibration_log(&self) -> &CalibrationLog {
        &self.log
    }

    /// Relative move of every axis at once, `deltas` in axis order. Blocks
    /// until all moves end; each entry is that axis' executed step count.
    pub fn go_to(&self, deltas: &[i64]) -> Result<Vec<Result<i64>>> {
        if deltas.len() != self.axes.len() {
            return Err(anyhow!("Expected {} step counts, got {}", self.axes.len(), deltas.len()));
        }
        let results: Vec<Result<i64>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .axes
                .iter()
                .zip(deltas)
                .map(|(axis, &steps)| scope.spawn(move || axis.run(steps)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| Err(anyhow!("motion thread panicked"))))
                .collect()
        });
        Ok(results)
    }

    /// The same move backwards.
    pub fn return_to(&self, deltas: &[i64]) -> Result<Vec<Result<i64>>> {
        let reversed: Vec<i64> = deltas.iter().map(|d| -d).collect();
        self.go_to(&reversed)
    }

    /// STOP: cancel calibration and halt every axis.
    pub fn stop_all(&self) {
        self.calibrator.stop();
        for axis in &self.axes {
            axis.stop();
        }
        self.events.message(SOURCE, "all motion stopped");
    }

    /// Archive a calibration point: snapshot PNG (when a frame is given) plus
    /// a log line.
    pub fn handle_snapshot_request(&self, coordinates: &[i64], frame: Option<&Frame>) -> Result<String> {
        let filename = self.log.record(frame, coordinates)?;
        self.events.message(SOURCE, format!("calibration point saved as {}", filename));
        Ok(filename)
    }

    pub fn shutdown(&self) {
        self.calibrator.stop();
        let _ = self.calibrator.wait();
        for axis in &self.axes {
            axis.shutdown();
        }
        log::info!(target: "platescanner::scanner", "shut down");
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
