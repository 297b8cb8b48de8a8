/// GPIO module - stepper driver over libgpiod (gpiod feature)
/// 
/// One axis owns one output request (NEN, DIR, STP) and, when it has limit
/// switches, one input request with edge detection. Switches are wired to
/// ground with the internal pull-up, so a closed switch reads as active
/// (active low). A watcher thread forwards switch edges to the axis.
/// 
/// Pin assignments come from plate_scanner.yaml via config_loader.

use anyhow::{anyhow, Result};

use crate::axis::StepperHardware;
use crate::config_loader::AxisSettings;

#[cfg(feature = "gpiod")]
use crate::axis::{Direction, Edge, EdgeEvent, LimitHandle};
#[cfg(feature = "gpiod")]
use crate::pulse::PulseTimer;
#[cfg(feature = "gpiod")]
use gpiocdev::chip::Chip;
#[cfg(feature = "gpiod")]
use gpiocdev::line::{Bias, EdgeDetection, EdgeKind, Value};
#[cfg(feature = "gpiod")]
use gpiocdev::request::Request;
#[cfg(feature = "gpiod")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "gpiod")]
use std::sync::Arc;
#[cfg(feature = "gpiod")]
use std::thread::JoinHandle;
#[cfg(feature = "gpiod")]
use std::time::Duration;

#[cfg(feature = "gpiod")]
const CONSUMER: &str = "platescanner";

/// Pins of one axis, BCM numbering.
#[derive(Debug, Clone, PartialEq)]
pub struct GpioAxisPins {
    pub name: String,
    pub enable: u32,
    pub dir: u32,
    pub step: u32,
    pub limit: Option<u32>,
    pub safety: Option<u32>,
    pub invert_direction: bool,
}

impl From<&AxisSettings> for GpioAxisPins {
    fn from(axis: &AxisSettings) -> Self {
        Self {
            name: axis.name.clone(),
            enable: axis.enable_pin,
            dir: axis.dir_pin,
            step: axis.step_pin,
            limit: axis.limit_pin,
            safety: axis.safety_pin,
            invert_direction: axis.invert_direction,
        }
    }
}

impl GpioAxisPins {
    pub fn all(&self) -> Vec<u32> {
        let mut pins = vec![self.enable, self.dir, self.step];
        pins.extend(self.limit);
        pins.extend(self.safety);
        pins
    }

    /// Limit then safety switch, when wired.
    pub fn switches(&self) -> Vec<u32> {
        self.limit.iter().chain(self.safety.iter()).copied().collect()
    }
}

#[cfg(feature = "gpiod")]
pub struct GpioStepper {
    name: String,
    outputs: Request,
    limits: Option<Arc<Request>>,
    enable: u32,
    dir: u32,
    step: u32,
    limit: Option<u32>,
    safety: Option<u32>,
    invert_direction: bool,
    timer: PulseTimer,
    watcher_stop: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

#[cfg(feature = "gpiod")]
impl GpioStepper {
    /// Request the lines of one axis. `chip` of `None` searches /dev for a
    /// gpiochip exposing every pin.
    pub fn open(chip: Option<&str>, pins: &GpioAxisPins) -> Result<Self> {
        let chip_path = match chip {
            Some(path) => path.to_string(),
            None => find_gpio_chip(&pins.all())?,
        };

        // Driver starts disabled (NEN high) with STP low.
        let outputs = Request::builder()
            .on_chip(&chip_path)
            .with_consumer(CONSUMER)
            .with_line(pins.enable)
            .as_output(Value::Active)
            .with_line(pins.dir)
            .as_output(Value::Inactive)
            .with_line(pins.step)
            .as_output(Value::Inactive)
            .request()
            .map_err(|e| anyhow!("Axis {}: output lines unavailable on {}: {}", pins.name, chip_path, e))?;

        let switches = pins.switches();
        let limits = if switches.is_empty() {
            None
        } else {
            let request = Request::builder()
                .on_chip(&chip_path)
                .with_consumer(CONSUMER)
                .with_lines(&switches)
                .as_input()
                .with_bias(Bias::PullUp)
                .as_active_low()
                .with_edge_detection(EdgeDetection::BothEdges)
                // Glitch filter only; contact bounce is handled per switch by the axis.
                .with_debounce_period(Duration::from_millis(1))
                .request()
                .map_err(|e| anyhow!("Axis {}: limit switch lines unavailable on {}: {}", pins.name, chip_path, e))?;
            Some(Arc::new(request))
        };

        log::info!(
            target: "platescanner::gpio",
            "{}: NEN={} DIR={} STP={} LIM={:?} SAFETY={:?} on {}",
            pins.name,
            pins.enable,
            pins.dir,
            pins.step,
            pins.limit,
            pins.safety,
            chip_path
        );

        Ok(Self {
            name: pins.name.clone(),
            outputs,
            limits,
            enable: pins.enable,
            dir: pins.dir,
            step: pins.step,
            limit: pins.limit,
            safety: pins.safety,
            invert_direction: pins.invert_direction,
            timer: PulseTimer::new(),
            watcher_stop: Arc::new(AtomicBool::new(false)),
            watcher: None,
        })
    }

    fn switch_closed(&self, pin: Option<u32>) -> Result<bool> {
        match (pin, &self.limits) {
            (Some(pin), Some(request)) => Ok(request.value(pin)? == Value::Active),
            _ => Ok(false),
        }
    }
}

#[cfg(feature = "gpiod")]
impl StepperHardware for GpioStepper {
    fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        // NEN is inverse logic.
        let level = if enabled { Value::Inactive } else { Value::Active };
        self.outputs.set_value(self.enable, level)?;
        if !enabled {
            self.timer.reset();
        }
        Ok(())
    }

    fn set_direction(&mut self, direction: Direction) -> Result<()> {
        let forward = (direction == Direction::Forward) != self.invert_direction;
        let level = if forward { Value::Active } else { Value::Inactive };
        self.outputs.set_value(self.dir, level)?;
        Ok(())
    }

    fn pulse(&mut self, frequency_hz: f64) -> Result<()> {
        self.outputs.set_value(self.step, Value::Active)?;
        self.timer.wait_half_period(frequency_hz);
        self.outputs.set_value(self.step, Value::Inactive)?;
        self.timer.wait_half_period(frequency_hz);
        Ok(())
    }

    fn home_switch_closed(&self) -> Result<bool> {
        self.switch_closed(self.limit)
    }

    fn far_switch_closed(&self) -> Result<bool> {
        self.switch_closed(self.safety)
    }

    fn has_home_switch(&self) -> bool {
        self.limit.is_some()
    }

    fn elapsed(&self) -> Duration {
        self.timer.elapsed()
    }

    fn subscribe_limits(&mut self, handle: LimitHandle) -> Result<()> {
        let Some(request) = self.limits.clone() else {
            return Ok(());
        };
        let stop = Arc::clone(&self.watcher_stop);
        let name = self.name.clone();
        let watcher = std::thread::Builder::new()
            .name(format!("{}-limits", self.name))
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match request.wait_edge_event(Duration::from_millis(100)) {
                        Ok(true) => match request.read_edge_event() {
                            Ok(event) => {
                                let edge = match event.kind {
                                    EdgeKind::Rising => Edge::Rising,
                                    EdgeKind::Falling => Edge::Falling,
                                };
                                handle.notify(EdgeEvent {
                                    pin: event.offset,
                                    edge,
                                    timestamp: Duration::from_nanos(event.timestamp_ns),
                                });
                            }
                            Err(e) => log::warn!(target: "platescanner::gpio", "{}: edge read failed: {}", name, e),
                        },
                        Ok(false) => {}
                        Err(e) => {
                            log::error!(target: "platescanner::gpio", "{}: limit watcher stopped: {}", name, e);
                            break;
                        }
                    }
                }
            })?;
        self.watcher = Some(watcher);
        Ok(())
    }
}

#[cfg(feature = "gpiod")]
impl Drop for GpioStepper {
    fn drop(&mut self) {
        self.watcher_stop.store(true, Ordering::SeqCst);
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
        let _ = self.outputs.set_value(self.enable, Value::Active);
        log::info!(target: "platescanner::gpio", "{}: GPIO lines released", self.name);
    }
}

/// Open the libgpiod driver of one axis.
#[cfg(feature = "gpiod")]
pub fn open_axis(chip: Option<&str>, pins: &GpioAxisPins) -> Result<Box<dyn StepperHardware>> {
    Ok(Box::new(GpioStepper::open(chip, pins)?))
}

#[cfg(not(feature = "gpiod"))]
pub fn open_axis(_chip: Option<&str>, pins: &GpioAxisPins) -> Result<Box<dyn StepperHardware>> {
    Err(anyhow!("Axis {}: GPIO support not compiled in. Enable 'gpiod' feature.", pins.name))
}

/// Find a gpiochip that exposes all required pins
#[cfg(feature = "gpiod")]
pub fn find_gpio_chip(required_pins: &[u32]) -> Result<String> {
    use std::fs;

    let mut chip_paths: Vec<String> = fs::read_dir("/dev")?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let path = entry.path();
            let name = path.file_name()?.to_str()?;
            if name.starts_with("gpiochip") {
                Some(path.to_string_lossy().to_string())
            } else {
                None
            }
        })
        .collect();

    chip_paths.sort();

    for chip_path in &chip_paths {
        if let Ok(chip) = Chip::from_path(chip_path) {
            if required_pins.iter().all(|pin| chip.line_info(*pin).is_ok()) {
                return Ok(chip_path.clone());
            }
        }
    }

    Err(anyhow!("No gpiochip device exposes pins {:?}", required_pins))
}

#[cfg(not(feature = "gpiod"))]
pub fn find_gpio_chip(_required_pins: &[u32]) -> Result<String> {
    Err(anyhow!("GPIO support not compiled in"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Direction;
    use crate::config_loader::SimAxisSettings;

    fn settings() -> AxisSettings {
        AxisSettings {
            name: "X".to_string(),
            enable_pin: 17,
            dir_pin: 27,
            step_pin: 22,
            limit_pin: Some(5),
            safety_pin: None,
            invert_direction: true,
            steady_hz: 1000.0,
            home_timeout_s: 20.0,
            debounce_ms: 250,
            home_direction: Direction::Reverse,
            sim: SimAxisSettings::default(),
        }
    }

    #[test]
    fn pins_follow_axis_settings() {
        let pins = GpioAxisPins::from(&settings());
        assert_eq!(pins.all(), vec![17, 27, 22, 5]);
        assert_eq!(pins.switches(), vec![5]);
        assert!(pins.invert_direction);
    }

    #[cfg(not(feature = "gpiod"))]
    #[test]
    fn without_gpiod_the_axis_is_unavailable() {
        let err = open_axis(None, &GpioAxisPins::from(&settings())).err().unwrap();
        assert!(err.to_string().contains("Enable 'gpiod' feature"));
    }
}
