/// Calibration sequencer - homes every axis, then visits optional calibration
/// points, asking for a snapshot at home and at each point

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::axis::AxisController;
use crate::events::{EventBus, HomingOutcome, ScannerEvent};

const SOURCE: &str = "calibration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceMode {
    /// One axis after the other, in configuration order.
    #[default]
    Sequential,
    /// All axes at once, one scoped thread each.
    Parallel,
}

impl FromStr for SequenceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(SequenceMode::Sequential),
            "parallel" => Ok(SequenceMode::Parallel),
            other => Err(anyhow!("Unknown calibration mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationReport {
    pub outcomes: Vec<(String, HomingOutcome)>,
    /// Step coordinates when the sequence ended, one per axis.
    pub coordinates: Vec<i64>,
    pub snapshots: usize,
    pub cancelled: bool,
}

impl CalibrationReport {
    pub fn all_homed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|(_, o)| o.is_homed())
    }

    pub fn failed(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_homed())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

pub struct CalibrationSequencer {
    axes: Vec<Arc<AxisController>>,
    mode: SequenceMode,
    points: Vec<Vec<i64>>,
    events: EventBus,
    cancel: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<CalibrationReport>>>,
}

impl CalibrationSequencer {
    pub fn new(axes: Vec<Arc<AxisController>>, mode: SequenceMode, events: EventBus) -> Self {
        Self {
            axes,
            mode,
            points: Vec::new(),
            events,
            cancel: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Absolute step coordinates visited after homing, one value per axis.
    pub fn with_points(mut self, points: Vec<Vec<i64>>) -> Self {
        self.points = points;
        self
    }

    pub fn mode(&self) -> SequenceMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        match self.worker.lock() {
            Ok(worker) => worker.as_ref().map_or(false, |h| !h.is_finished()),
            Err(_) => false,
        }
    }

    /// Start the sequence on a background thread. Returns false when a
    /// sequence is already running.
    pub fn run(&self) -> bool {
        let mut worker = match self.worker.lock() {
            Ok(worker) => worker,
            Err(poisoned) => poisoned.into_inner(),
        };
        if worker.as_ref().map_or(false, |h| !h.is_finished()) {
            self.events.warn(SOURCE, "calibration already running");
            return false;
        }
        self.cancel.store(false, Ordering::SeqCst);

        let axes = self.axes.clone();
        let points = self.points.clone();
        let mode = self.mode;
        let events = self.events.clone();
        let cancel = Arc::clone(&self.cancel);
        let spawned = std::thread::Builder::new()
            .name("calibration".to_string())
            .spawn(move || sequence(&axes, mode, &points, &events, &cancel));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                true
            }
            Err(e) => {
                self.events.warn(SOURCE, format!("could not start calibration: {}", e));
                false
            }
        }
    }

    /// Wait for the running sequence. `None` when nothing was started.
    pub fn wait(&self) -> Option<CalibrationReport> {
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }?;
        match handle.join() {
            Ok(report) => Some(report),
            Err(_) => {
                self.events.warn(SOURCE, "calibration thread panicked");
                None
            }
        }
    }

    pub fn run_blocking(&self) -> Option<CalibrationReport> {
        if !self.run() {
            return None;
        }
        self.wait()
    }

    /// Cancel the sequence and any homing in progress.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        for axis in &self.axes {
            axis.stop();
        }
    }
}

impl Drop for CalibrationSequencer {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
            let _ = self.wait();
        }
    }
}

fn home_axis(axis: &AxisController, events: &EventBus, cancel: &AtomicBool) -> (String, HomingOutcome) {
    let name = axis.name().to_string();
    if cancel.load(Ordering::SeqCst) {
        return (name, HomingOutcome::Cancelled);
    }
    match axis.home() {
        Ok(outcome) => (name, outcome),
        Err(e) => {
            events.warn(&name, format!("homing error: {:#}", e));
            (name, HomingOutcome::Unavailable(e.to_string()))
        }
    }
}

fn move_to(axes: &[Arc<AxisController>], point: &[i64], mode: SequenceMode, events: &EventBus) {
    let step = |axis: &AxisController, target: i64| {
        let delta = target - axis.position();
        if let Err(e) = axis.run(delta) {
            events.warn(axis.name(), format!("move to calibration point failed: {:#}", e));
        }
    };
    match mode {
        SequenceMode::Sequential => {
            for (axis, &target) in axes.iter().zip(point) {
                step(axis.as_ref(), target);
            }
        }
        SequenceMode::Parallel => std::thread::scope(|s| {
            for (axis, &target) in axes.iter().zip(point) {
                let step = &step;
                s.spawn(move || step(axis.as_ref(), target));
            }
        }),
    }
}

fn positions(axes: &[Arc<AxisController>]) -> Vec<i64> {
    axes.iter().map(|a| a.position()).collect()
}

fn sequence(
    axes: &[Arc<AxisController>],
    mode: SequenceMode,
    points: &[Vec<i64>],
    events: &EventBus,
    cancel: &AtomicBool,
) -> CalibrationReport {
    events.message(SOURCE, format!("calibration started ({:?})", mode));
    let outcomes: Vec<(String, HomingOutcome)> = match mode {
        SequenceMode::Sequential => axes.iter().map(|a| home_axis(a, events, cancel)).collect(),
        SequenceMode::Parallel => std::thread::scope(|s| {
            let handles: Vec<_> = axes
                .iter()
                .map(|a| s.spawn(move || home_axis(a, events, cancel)))
                .collect();
            handles
                .into_iter()
                .zip(axes)
                .map(|(h, a)| {
                    h.join().unwrap_or_else(|_| {
                        (a.name().to_string(), HomingOutcome::Unavailable("homing thread panicked".to_string()))
                    })
                })
                .collect()
        }),
    };

    let mut report = CalibrationReport { outcomes, ..Default::default() };
    report.cancelled = cancel.load(Ordering::SeqCst);

    if !report.cancelled {
        events.emit(ScannerEvent::SnapshotRequest { coordinates: positions(axes) });
        report.snapshots += 1;

        if !points.is_empty() && !report.all_homed() {
            events.warn(SOURCE, "calibration points skipped, not every axis is homed");
        } else {
            for point in points {
                if cancel.load(Ordering::SeqCst) {
                    report.cancelled = true;
                    break;
                }
                if point.len() != axes.len() {
                    events.warn(SOURCE, format!("calibration point {:?} does not match {} axes", point, axes.len()));
                    continue;
                }
                move_to(axes, point, mode, events);
                if cancel.load(Ordering::SeqCst) {
                    report.cancelled = true;
                    break;
                }
                events.emit(ScannerEvent::SnapshotRequest { coordinates: positions(axes) });
                report.snapshots += 1;
            }
        }
    }

    report.coordinates = positions(axes);
    let failed = report.failed();
    for name in &failed {
        log::warn!(target: "platescanner::calibration", "{} not calibrated", name);
    }
    events.emit(ScannerEvent::CalibrationFinished { coordinates: report.coordinates.clone(), failed });
    if report.cancelled {
        events.message(SOURCE, "calibration cancelled");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::{ActiveMotorCounter, AxisConfig};
    use crate::sim::SimulatedStepper;
    use crossbeam_channel::Receiver;
    use std::time::Duration;

    fn axis(name: &str, sim: SimulatedStepper, events: &EventBus, counter: &ActiveMotorCounter) -> Arc<AxisController> {
        let mut config = AxisConfig::new(name);
        config.home_timeout = Duration::from_secs(2);
        Arc::new(AxisController::new(config, Some(Box::new(sim)), counter.clone(), events.clone()))
    }

    fn snapshots(rx: &Receiver<ScannerEvent>) -> Vec<Vec<i64>> {
        rx.try_iter()
            .filter_map(|e| match e {
                ScannerEvent::SnapshotRequest { coordinates } => Some(coordinates),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn sequential_homing_requests_a_snapshot_at_zero() {
        let (events, rx) = EventBus::new();
        let counter = ActiveMotorCounter::new();
        let axes = vec![
            axis("X", SimulatedStepper::new(40), &events, &counter),
            axis("Y", SimulatedStepper::new(75), &events, &counter),
        ];
        let sequencer = CalibrationSequencer::new(axes, SequenceMode::Sequential, events);
        let report = sequencer.run_blocking().unwrap();

        assert!(report.all_homed());
        assert_eq!(report.coordinates, vec![0, 0]);
        assert_eq!(report.snapshots, 1);
        assert_eq!(snapshots(&rx), vec![vec![0, 0]]);
        assert_eq!(counter.active(), 0);
    }

    #[test]
    fn timeout_on_one_axis_does_not_stop_the_others() {
        let (events, rx) = EventBus::new();
        let counter = ActiveMotorCounter::new();
        let axes = vec![
            axis("X", SimulatedStepper::new(10).with_home_switch_at(Some(-10_000_000)), &events, &counter),
            axis("Y", SimulatedStepper::new(20), &events, &counter),
        ];
        let sequencer = CalibrationSequencer::new(axes, SequenceMode::Parallel, events);
        let report = sequencer.run_blocking().unwrap();

        assert!(matches!(report.outcomes[0].1, HomingOutcome::TimedOut { .. }));
        assert_eq!(report.outcomes[1].1, HomingOutcome::Homed);
        assert_eq!(report.failed(), vec!["X".to_string()]);
        let finished = rx.try_iter().any(|e| {
            matches!(e, ScannerEvent::CalibrationFinished { ref failed, .. } if failed == &vec!["X".to_string()])
        });
        assert!(finished);
    }

    #[test]
    fn calibration_points_are_visited() {
        let (events, rx) = EventBus::new();
        let counter = ActiveMotorCounter::new();
        let axes = vec![
            axis("X", SimulatedStepper::new(5), &events, &counter),
            axis("Y", SimulatedStepper::new(5), &events, &counter),
        ];
        let sequencer = CalibrationSequencer::new(axes, SequenceMode::Parallel, events)
            .with_points(vec![vec![100, 50], vec![30, 200]]);
        let report = sequencer.run_blocking().unwrap();

        assert_eq!(report.snapshots, 3);
        assert_eq!(report.coordinates, vec![30, 200]);
        assert_eq!(snapshots(&rx), vec![vec![0, 0], vec![100, 50], vec![30, 200]]);
    }

    #[test]
    fn stop_cancels_homing() {
        let (events, _rx) = EventBus::new();
        let counter = ActiveMotorCounter::new();
        let slow = SimulatedStepper::new(100_000).with_real_time(1.0);
        let axes = vec![axis("X", slow, &events, &counter)];
        let sequencer = CalibrationSequencer::new(axes, SequenceMode::Sequential, events);

        assert!(sequencer.run());
        std::thread::sleep(Duration::from_millis(50));
        assert!(sequencer.is_running());
        assert!(!sequencer.run());
        sequencer.stop();
        let report = sequencer.wait().unwrap();

        assert!(report.cancelled);
        assert_eq!(report.outcomes[0].1, HomingOutcome::Cancelled);
        assert_eq!(report.snapshots, 0);
    }

    #[test]
    fn wait_without_run_is_none() {
        let sequencer = CalibrationSequencer::new(Vec::new(), SequenceMode::Sequential, EventBus::detached());
        assert!(sequencer.wait().is_none());
        assert!(!sequencer.is_running());
    }

    #[test]
    fn mode_parses_from_config_words() {
        assert_eq!("Parallel".parse::<SequenceMode>().unwrap(), SequenceMode::Parallel);
        assert!("both".parse::<SequenceMode>().is_err());
    }
}
