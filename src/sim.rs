/// Simulated stepper for running the scanner without a Raspberry Pi
/// 
/// The model keeps a physical step position and places the limit switches
/// on it. Time is virtual (one period per pulse) unless real-time pacing is
/// switched on, so tests of long moves and homing timeouts run instantly.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::axis::{Direction, Edge, LimitHandle, StepperHardware, SwitchRole};
use crate::pulse::PulseTimer;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseRecord {
    pub frequency_hz: f64,
    pub direction: Direction,
    /// Virtual time at the start of the pulse.
    pub at: Duration,
}

/// Shared record of every pulse a simulated axis emitted.
#[derive(Debug, Clone, Default)]
pub struct PulseLog {
    records: Arc<Mutex<Vec<PulseRecord>>>,
}

impl PulseLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: PulseRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    pub fn records(&self) -> Vec<PulseRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn frequencies(&self) -> Vec<f64> {
        self.records().iter().map(|r| r.frequency_hz).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }
}

/// A switch closed at `at` and everything past it on `side`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SwitchModel {
    at: i64,
    side: Direction,
}

impl SwitchModel {
    fn closed(&self, physical: i64) -> bool {
        match self.side {
            Direction::Reverse => physical <= self.at,
            Direction::Forward => physical >= self.at,
        }
    }
}

#[derive(Debug)]
pub struct SimulatedStepper {
    physical: i64,
    home: Option<SwitchModel>,
    far: Option<SwitchModel>,
    enabled: bool,
    direction: Direction,
    clock: Duration,
    timer: Option<PulseTimer>,
    handle: Option<LimitHandle>,
    log: Option<PulseLog>,
}

impl SimulatedStepper {
    /// Carriage at `physical_start`, home switch at 0 on the reverse side,
    /// no far switch.
    pub fn new(physical_start: i64) -> Self {
        Self {
            physical: physical_start,
            home: Some(SwitchModel { at: 0, side: Direction::Reverse }),
            far: None,
            enabled: false,
            direction: Direction::Forward,
            clock: Duration::ZERO,
            timer: None,
            handle: None,
            log: None,
        }
    }

    pub fn with_home_switch_at(mut self, at: Option<i64>) -> Self {
        let side = self.home.map(|s| s.side).unwrap_or(Direction::Reverse);
        self.home = at.map(|at| SwitchModel { at, side });
        self
    }

    /// Put the home switch on the `home_direction` end of travel and the far
    /// switch, if any, on the other.
    pub fn with_home_direction(mut self, home_direction: Direction) -> Self {
        if let Some(home) = self.home.as_mut() {
            home.side = home_direction;
        }
        if let Some(far) = self.far.as_mut() {
            far.side = home_direction.opposite();
        }
        self
    }

    pub fn with_far_switch_at(mut self, at: Option<i64>) -> Self {
        let side = self
            .home
            .map(|s| s.side.opposite())
            .unwrap_or(Direction::Forward);
        self.far = at.map(|at| SwitchModel { at, side });
        self
    }

    pub fn with_pulse_log(mut self, log: PulseLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Pace pulses on the wall clock, `time_scale` times real time.
    pub fn with_real_time(mut self, time_scale: f64) -> Self {
        self.timer = Some(PulseTimer::with_time_scale(time_scale));
        self
    }

    pub fn physical_position(&self) -> i64 {
        self.physical
    }

    fn switch_states(&self) -> (bool, bool) {
        (
            self.home.map_or(false, |s| s.closed(self.physical)),
            self.far.map_or(false, |s| s.closed(self.physical)),
        )
    }

    fn report(&self, role: SwitchRole, before: bool, after: bool) {
        if before == after {
            return;
        }
        if let Some(handle) = &self.handle {
            let edge = if after { Edge::Rising } else { Edge::Falling };
            handle.notify_switch(role, edge, self.clock);
        }
    }
}

impl StepperHardware for SimulatedStepper {
    fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        self.enabled = enabled;
        if !enabled {
            if let Some(timer) = self.timer.as_mut() {
                timer.reset();
            }
        }
        Ok(())
    }

    fn set_direction(&mut self, direction: Direction) -> Result<()> {
        self.direction = direction;
        Ok(())
    }

    fn pulse(&mut self, frequency_hz: f64) -> Result<()> {
        if !self.enabled {
            return Err(anyhow!("Step pulse with the driver disabled"));
        }
        if let Some(log) = &self.log {
            log.push(PulseRecord { frequency_hz, direction: self.direction, at: self.clock });
        }
        if let Some(timer) = self.timer.as_mut() {
            timer.wait_half_period(frequency_hz);
            timer.wait_half_period(frequency_hz);
        }
        self.clock += PulseTimer::half_period(frequency_hz) * 2;

        let (home_before, far_before) = self.switch_states();
        self.physical += self.direction.sign();
        let (home_after, far_after) = self.switch_states();
        self.report(SwitchRole::Home, home_before, home_after);
        self.report(SwitchRole::Far, far_before, far_after);
        Ok(())
    }

    fn home_switch_closed(&self) -> Result<bool> {
        Ok(self.switch_states().0)
    }

    fn far_switch_closed(&self) -> Result<bool> {
        Ok(self.switch_states().1)
    }

    fn has_home_switch(&self) -> bool {
        self.home.is_some()
    }

    fn elapsed(&self) -> Duration {
        self.clock
    }

    fn subscribe_limits(&mut self, handle: LimitHandle) -> Result<()> {
        self.handle = Some(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulses_need_an_enabled_driver() {
        let mut sim = SimulatedStepper::new(0);
        assert!(sim.pulse(1000.0).is_err());
        sim.set_enabled(true).unwrap();
        sim.pulse(1000.0).unwrap();
        assert_eq!(sim.physical_position(), 1);
        assert_eq!(sim.elapsed(), Duration::from_millis(1));
    }

    #[test]
    fn switches_follow_the_carriage() {
        let mut sim = SimulatedStepper::new(1).with_far_switch_at(Some(3));
        sim.set_enabled(true).unwrap();
        assert!(!sim.home_switch_closed().unwrap());

        sim.set_direction(Direction::Reverse).unwrap();
        sim.pulse(500.0).unwrap();
        assert!(sim.home_switch_closed().unwrap());

        sim.set_direction(Direction::Forward).unwrap();
        for _ in 0..3 {
            sim.pulse(500.0).unwrap();
        }
        assert!(!sim.home_switch_closed().unwrap());
        assert!(sim.far_switch_closed().unwrap());
    }

    #[test]
    fn mirrored_rig_homes_forward() {
        let sim = SimulatedStepper::new(-10)
            .with_home_direction(Direction::Forward)
            .with_far_switch_at(Some(-200));
        assert!(!sim.home_switch_closed().unwrap());
        assert!(!sim.far_switch_closed().unwrap());
        let at_home = SimulatedStepper::new(5).with_home_direction(Direction::Forward);
        assert!(at_home.home_switch_closed().unwrap());
    }

    #[test]
    fn pulse_log_records_direction() {
        let log = PulseLog::new();
        let mut sim = SimulatedStepper::new(50).with_pulse_log(log.clone());
        sim.set_enabled(true).unwrap();
        sim.set_direction(Direction::Reverse).unwrap();
        sim.pulse(57.0).unwrap();
        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].direction, Direction::Reverse);
        log.clear();
        assert!(log.is_empty());
    }
}
