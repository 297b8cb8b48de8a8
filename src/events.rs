/// Event bus between the motion core and whoever collects its messages
/// (GUI log pane, CLI printer). Every warning is also written through `log`.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::time::Duration;

/// Axis controller state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisState {
    Idle,
    RampingUp,
    Steady,
    RampingDown,
    Homing,
}

impl fmt::Display for AxisState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AxisState::Idle => "idle",
            AxisState::RampingUp => "ramping up",
            AxisState::Steady => "steady",
            AxisState::RampingDown => "ramping down",
            AxisState::Homing => "homing",
        };
        f.write_str(name)
    }
}

/// How a homing attempt ended. Only `Homed` zeroes the step position.
#[derive(Debug, Clone, PartialEq)]
pub enum HomingOutcome {
    /// Home switch contact confirmed, position reset to zero.
    Homed,
    TimedOut { elapsed: Duration },
    /// Home switch was already closed before moving.
    AlreadyAtLimit,
    /// Both switches closed at start; nothing was moved.
    Unsafe,
    /// The switch at the far end of travel closed while homing.
    FarLimitHit,
    Cancelled,
    /// Another motion owns the axis.
    Busy,
    NoLimitSwitch,
    Unavailable(String),
}

impl HomingOutcome {
    pub fn is_homed(&self) -> bool {
        matches!(self, HomingOutcome::Homed)
    }
}

impl fmt::Display for HomingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HomingOutcome::Homed => write!(f, "homed"),
            HomingOutcome::TimedOut { elapsed } => {
                write!(f, "timed out after {:.1} s", elapsed.as_secs_f64())
            }
            HomingOutcome::AlreadyAtLimit => write!(f, "limit switch already closed"),
            HomingOutcome::Unsafe => write!(f, "both limit switches closed"),
            HomingOutcome::FarLimitHit => write!(f, "far limit switch hit"),
            HomingOutcome::Cancelled => write!(f, "cancelled"),
            HomingOutcome::Busy => write!(f, "axis busy"),
            HomingOutcome::NoLimitSwitch => write!(f, "no limit switch configured"),
            HomingOutcome::Unavailable(reason) => write!(f, "hardware unavailable: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScannerEvent {
    StateChanged { axis: String, state: AxisState },
    Message { source: String, text: String },
    Warning { source: String, text: String },
    HomingFinished { axis: String, outcome: HomingOutcome },
    /// Ask the image side to archive a frame at these step coordinates.
    SnapshotRequest { coordinates: Vec<i64> },
    CalibrationFinished { coordinates: Vec<i64>, failed: Vec<String> },
}

impl fmt::Display for ScannerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScannerEvent::StateChanged { axis, state } => write!(f, "{}: {}", axis, state),
            ScannerEvent::Message { source, text } => write!(f, "{}: {}", source, text),
            ScannerEvent::Warning { source, text } => write!(f, "{}: WARNING {}", source, text),
            ScannerEvent::HomingFinished { axis, outcome } => {
                write!(f, "{}: homing {}", axis, outcome)
            }
            ScannerEvent::SnapshotRequest { coordinates } => {
                write!(f, "snapshot requested at {:?}", coordinates)
            }
            ScannerEvent::CalibrationFinished { coordinates, failed } => {
                if failed.is_empty() {
                    write!(f, "calibration finished at {:?}", coordinates)
                } else {
                    write!(f, "calibration finished at {:?} (failed: {})", coordinates, failed.join(", "))
                }
            }
        }
    }
}

/// Cloneable sending side of the event channel. Sending never blocks and
/// never fails loudly: a missing collector must not stop a motor.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: Sender<ScannerEvent>,
}

impl EventBus {
    pub fn new() -> (Self, Receiver<ScannerEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    /// A bus whose events go nowhere (log lines are still written).
    pub fn detached() -> Self {
        let (bus, _rx) = Self::new();
        bus
    }

    pub fn emit(&self, event: ScannerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn message(&self, source: &str, text: impl Into<String>) {
        let text = text.into();
        log::info!(target: "platescanner::events", "{}: {}", source, text);
        self.emit(ScannerEvent::Message { source: source.to_string(), text });
    }

    pub fn warn(&self, source: &str, text: impl Into<String>) {
        let text = text.into();
        log::warn!(target: "platescanner::events", "{}: {}", source, text);
        self.emit(ScannerEvent::Warning { source: source.to_string(), text });
    }
}
