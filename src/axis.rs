/// Axis module - one stepper motor, its step/direction/enable outputs and
/// its limit switches
/// 
/// Motion runs on whichever thread owns it (`run`, `home`) or on a pulse
/// worker (`activate`). Limit switch edges arrive through a [`LimitHandle`]
/// from any thread and trip a flag that the pulse loop checks before every
/// pulse, so a closed switch halts the train within one step.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::events::{AxisState, EventBus, HomingOutcome, ScannerEvent};
use crate::ramp::{RampLevel, RampProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Increments the step position.
    Forward,
    Reverse,
}

impl Direction {
    pub fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Reverse => -1,
        }
    }

    pub fn of_steps(steps: i64) -> Self {
        if steps < 0 {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "forward" | "fwd" | "right" | "cw" | "+" => Ok(Direction::Forward),
            "reverse" | "rev" | "left" | "ccw" | "-" => Ok(Direction::Reverse),
            other => Err(anyhow!("Unknown direction '{}' (use forward or reverse)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// Switch closed.
    Rising,
    Falling,
}

/// A digital input transition as delivered by an edge event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub pin: u32,
    pub edge: Edge,
    /// Monotonic timestamp from the source, used for debouncing.
    pub timestamp: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchRole {
    /// The switch homing drives toward.
    Home,
    /// End-of-travel switch on the opposite side.
    Far,
}

/// Hardware seam for one axis. Implementations own their pins exclusively.
pub trait StepperHardware: Send {
    fn set_enabled(&mut self, enabled: bool) -> Result<()>;
    fn set_direction(&mut self, direction: Direction) -> Result<()>;
    /// Emit one step pulse and block for one period at `frequency_hz`.
    fn pulse(&mut self, frequency_hz: f64) -> Result<()>;
    fn home_switch_closed(&self) -> Result<bool>;
    fn far_switch_closed(&self) -> Result<bool>;
    fn has_home_switch(&self) -> bool;
    /// Monotonic time on the hardware's own clock.
    fn elapsed(&self) -> Duration;
    /// Start delivering limit switch edges to `handle`.
    fn subscribe_limits(&mut self, handle: LimitHandle) -> Result<()>;
}

/// Explicit count of axes currently driving pulses.
#[derive(Debug, Clone, Default)]
pub struct ActiveMotorCounter {
    active: Arc<AtomicUsize>,
}

impl ActiveMotorCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn acquire(&self) -> MotorGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        MotorGuard { active: Arc::clone(&self.active) }
    }
}

/// Decrements the active motor count when dropped.
#[derive(Debug)]
pub struct MotorGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for MotorGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

const TRIP_NONE: u8 = 0;
const TRIP_HOME: u8 = 1;
const TRIP_FAR: u8 = 2;

#[derive(Debug)]
struct AxisShared {
    name: String,
    position: AtomicI64,
    running: AtomicBool,
    stop_requested: AtomicBool,
    tripped: AtomicU8,
    state: Mutex<AxisState>,
    /// Last accepted closing edge per switch (home, far).
    last_edge: Mutex<[Option<Duration>; 2]>,
    /// A closing edge fell inside the debounce window and the switch has not
    /// opened since. The pulse loop polls the switch while this is set.
    unconfirmed: [AtomicBool; 2],
    home_pin: Option<u32>,
    far_pin: Option<u32>,
    debounce: Duration,
    events: EventBus,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AxisShared {
    fn set_state(&self, state: AxisState) {
        let changed = {
            let mut current = lock(&self.state);
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            log::debug!(target: "platescanner::axis", "{} -> {}", self.name, state);
            self.events.emit(ScannerEvent::StateChanged { axis: self.name.clone(), state });
        }
    }

    fn clear_flags(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.tripped.store(TRIP_NONE, Ordering::SeqCst);
    }

    fn unconfirmed(&self, role: SwitchRole) -> bool {
        self.unconfirmed[slot(role)].load(Ordering::SeqCst)
    }
}

fn slot(role: SwitchRole) -> usize {
    match role {
        SwitchRole::Home => 0,
        SwitchRole::Far => 1,
    }
}

/// Thread-safe subscriber for limit switch edges of one axis.
#[derive(Debug, Clone)]
pub struct LimitHandle {
    shared: Arc<AxisShared>,
}

impl LimitHandle {
    pub fn home_pin(&self) -> Option<u32> {
        self.shared.home_pin
    }

    pub fn far_pin(&self) -> Option<u32> {
        self.shared.far_pin
    }

    /// Feed an edge from a pin-based source; see [`notify_switch`](Self::notify_switch).
    pub fn notify(&self, event: EdgeEvent) -> bool {
        let role = if Some(event.pin) == self.shared.home_pin {
            SwitchRole::Home
        } else if Some(event.pin) == self.shared.far_pin {
            SwitchRole::Far
        } else {
            log::debug!(target: "platescanner::axis", "{}: edge on unrelated pin {}", self.shared.name, event.pin);
            return false;
        };
        self.notify_switch(role, event.edge, event.timestamp)
    }

    /// Feed an edge of a known switch. Returns true when a closing edge was
    /// accepted; it trips the axis only while a motion is running.
    ///
    /// A closing edge inside the debounce window is not trusted but not
    /// dropped either: the pulse loop then reads the switch level itself, so a
    /// real contact shortly after backing off still halts the train.
    pub fn notify_switch(&self, role: SwitchRole, edge: Edge, timestamp: Duration) -> bool {
        let slot = slot(role);
        if edge == Edge::Falling {
            self.shared.unconfirmed[slot].store(false, Ordering::SeqCst);
            log::trace!(target: "platescanner::axis", "{}: {:?} switch opened", self.shared.name, role);
            return false;
        }
        {
            let mut last = lock(&self.shared.last_edge);
            if let Some(previous) = last[slot] {
                if timestamp >= previous && timestamp - previous < self.shared.debounce {
                    self.shared.unconfirmed[slot].store(true, Ordering::SeqCst);
                    log::debug!(target: "platescanner::axis", "{}: {:?} switch edge inside debounce window", self.shared.name, role);
                    return false;
                }
            }
            last[slot] = Some(timestamp);
        }
        self.shared.unconfirmed[slot].store(false, Ordering::SeqCst);
        if self.shared.running.load(Ordering::SeqCst) {
            let code = match role {
                SwitchRole::Home => TRIP_HOME,
                SwitchRole::Far => TRIP_FAR,
            };
            self.shared.tripped.store(code, Ordering::SeqCst);
        }
        log::info!(target: "platescanner::axis", "{}: {:?} limit switch closed", self.shared.name, role);
        true
    }
}

/// Runtime parameters of one axis.
#[derive(Debug, Clone)]
pub struct AxisConfig {
    pub name: String,
    pub ramp: RampProfile,
    pub steady_hz: f64,
    pub home_direction: Direction,
    pub home_timeout: Duration,
    pub debounce: Duration,
    pub home_pin: Option<u32>,
    pub far_pin: Option<u32>,
}

impl AxisConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ramp: RampProfile::default_table(),
            steady_hz: 1000.0,
            home_direction: Direction::Reverse,
            home_timeout: Duration::from_secs(20),
            debounce: Duration::from_millis(300),
            home_pin: None,
            far_pin: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Halt {
    Limit(SwitchRole),
    Stop,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Checks {
    All,
    LimitsOnly,
}

/// Pulse loop over one locked hardware handle.
struct Driver<'a> {
    shared: &'a AxisShared,
    hw: &'a mut dyn StepperHardware,
    direction: Direction,
    /// Switch in the direction of travel.
    ahead: SwitchRole,
    deadline: Option<Duration>,
    /// Acceleration actually executed, mirrored when stopping early.
    executed: Vec<RampLevel>,
}

impl<'a> Driver<'a> {
    fn new(
        shared: &'a AxisShared,
        hw: &'a mut dyn StepperHardware,
        direction: Direction,
        home_direction: Direction,
        deadline: Option<Duration>,
    ) -> Self {
        let ahead = if direction == home_direction { SwitchRole::Home } else { SwitchRole::Far };
        Self { shared, hw, direction, ahead, deadline, executed: Vec::new() }
    }

    fn ahead_closed(&self) -> Result<bool> {
        match self.ahead {
            SwitchRole::Home => self.hw.home_switch_closed(),
            SwitchRole::Far => self.hw.far_switch_closed(),
        }
    }

    fn check(&self, checks: Checks) -> Result<Option<Halt>> {
        match self.shared.tripped.load(Ordering::SeqCst) {
            TRIP_HOME => return Ok(Some(Halt::Limit(SwitchRole::Home))),
            TRIP_FAR => return Ok(Some(Halt::Limit(SwitchRole::Far))),
            _ => {}
        }
        if self.shared.unconfirmed(self.ahead) && self.ahead_closed()? {
            log::info!(target: "platescanner::axis", "{}: {:?} limit switch reads closed", self.shared.name, self.ahead);
            return Ok(Some(Halt::Limit(self.ahead)));
        }
        if checks == Checks::LimitsOnly {
            return Ok(None);
        }
        if self.shared.stop_requested.load(Ordering::SeqCst) {
            return Ok(Some(Halt::Stop));
        }
        match self.deadline {
            Some(deadline) if self.hw.elapsed() >= deadline => Ok(Some(Halt::Timeout)),
            _ => Ok(None),
        }
    }

    fn play(&mut self, level: RampLevel, checks: Checks) -> Result<(u32, Option<Halt>)> {
        let mut done = 0;
        while done < level.steps {
            if let Some(halt) = self.check(checks)? {
                return Ok((done, Some(halt)));
            }
            self.hw.pulse(level.frequency_hz)?;
            self.shared.position.fetch_add(self.direction.sign(), Ordering::SeqCst);
            done += 1;
        }
        Ok((done, None))
    }

    fn accelerate(&mut self, levels: &[RampLevel]) -> Result<Option<Halt>> {
        for level in levels.iter().filter(|l| l.steps > 0) {
            let (done, halt) = self.play(*level, Checks::All)?;
            if done > 0 {
                self.executed.push(RampLevel::new(level.frequency_hz, done));
            }
            if halt.is_some() {
                return Ok(halt);
            }
        }
        Ok(None)
    }

    fn cruise(&mut self, frequency_hz: f64) -> Result<Halt> {
        loop {
            if let Some(halt) = self.check(Checks::All)? {
                return Ok(halt);
            }
            self.hw.pulse(frequency_hz)?;
            self.shared.position.fetch_add(self.direction.sign(), Ordering::SeqCst);
        }
    }

    /// Mirror the executed acceleration. Only a limit trip cuts it short.
    fn decelerate(&mut self) -> Result<Option<Halt>> {
        let levels: Vec<RampLevel> = self.executed.iter().rev().copied().collect();
        self.executed.clear();
        for level in levels {
            let (_, halt) = self.play(level, Checks::LimitsOnly)?;
            if halt.is_some() {
                return Ok(halt);
            }
        }
        Ok(None)
    }
}

type SharedHardware = Arc<Mutex<Box<dyn StepperHardware>>>;

enum HomingStep {
    Contact,
    Finished(HomingOutcome),
}

pub struct AxisController {
    shared: Arc<AxisShared>,
    hardware: Option<SharedHardware>,
    ramp: RampProfile,
    steady_hz: f64,
    home_direction: Direction,
    home_timeout: Duration,
    counter: ActiveMotorCounter,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AxisController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AxisController")
            .field("name", &self.shared.name)
            .field("position", &self.position())
            .field("state", &self.state())
            .field("hardware", &self.hardware.is_some())
            .finish()
    }
}

impl AxisController {
    /// Build a controller. `hardware: None` models an unavailable handle:
    /// every motion is skipped with a warning.
    pub fn new(
        config: AxisConfig,
        hardware: Option<Box<dyn StepperHardware>>,
        counter: ActiveMotorCounter,
        events: EventBus,
    ) -> Self {
        let shared = Arc::new(AxisShared {
            name: config.name.clone(),
            position: AtomicI64::new(0),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            tripped: AtomicU8::new(TRIP_NONE),
            state: Mutex::new(AxisState::Idle),
            last_edge: Mutex::new([None, None]),
            unconfirmed: [AtomicBool::new(false), AtomicBool::new(false)],
            home_pin: config.home_pin,
            far_pin: config.far_pin,
            debounce: config.debounce,
            events,
        });

        let hardware = hardware.map(|mut hw| {
            let handle = LimitHandle { shared: Arc::clone(&shared) };
            if let Err(e) = hw.subscribe_limits(handle) {
                shared.events.warn(&shared.name, format!("limit switch events unavailable: {}", e));
            }
            Arc::new(Mutex::new(hw))
        });

        Self {
            shared,
            hardware,
            ramp: config.ramp,
            steady_hz: config.steady_hz,
            home_direction: config.home_direction,
            home_timeout: config.home_timeout,
            counter,
            worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn position(&self) -> i64 {
        self.shared.position.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> AxisState {
        *lock(&self.shared.state)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn has_hardware(&self) -> bool {
        self.hardware.is_some()
    }

    pub fn ramp(&self) -> &RampProfile {
        &self.ramp
    }

    pub fn limit_handle(&self) -> LimitHandle {
        LimitHandle { shared: Arc::clone(&self.shared) }
    }

    fn claim(&self) -> bool {
        self.shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn hardware_or_warn(&self, operation: &str) -> Option<&SharedHardware> {
        if self.hardware.is_none() {
            self.shared.events.warn(
                &self.shared.name,
                format!("hardware handle unavailable, {} skipped", operation),
            );
        }
        self.hardware.as_ref()
    }

    /// Start continuous motion; returns immediately. Pulses continue until
    /// [`stop`](Self::stop) or a limit switch.
    pub fn activate(&self, direction: Direction) {
        let Some(hardware) = self.hardware_or_warn("activate") else {
            return;
        };
        if !self.claim() {
            self.shared.events.warn(&self.shared.name, "already running, activate ignored");
            return;
        }
        // A finished worker may still hold its handle.
        if let Some(previous) = lock(&self.worker).take() {
            let _ = previous.join();
        }

        let shared = Arc::clone(&self.shared);
        let hardware = Arc::clone(hardware);
        let ramp = self.ramp.clone();
        let steady_hz = self.steady_hz;
        let home_direction = self.home_direction;
        let counter = self.counter.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("{}-pulses", self.shared.name))
            .spawn(move || {
                let _guard = counter.acquire();
                let mut hw = lock(&hardware);
                let result = jog(&shared, &mut **hw, &ramp, steady_hz, direction, home_direction);
                if let Err(e) = result {
                    shared.events.warn(&shared.name, format!("jog aborted: {}", e));
                }
                finish(&shared, &mut **hw);
                drop(hw);
                shared.running.store(false, Ordering::SeqCst);
            });

        match spawned {
            Ok(handle) => *lock(&self.worker) = Some(handle),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.events.warn(&self.shared.name, format!("could not start pulse worker: {}", e));
            }
        }
    }

    /// Ramp down and disable. Calling it while stopped does nothing.
    /// Waits for a jog started by `activate`; blocking `run`/`home` calls on
    /// other threads are only signalled.
    pub fn stop(&self) {
        if self.shared.running.load(Ordering::SeqCst) {
            self.shared.stop_requested.store(true, Ordering::SeqCst);
        }
        let worker = lock(&self.worker).take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                self.shared.events.warn(&self.shared.name, "pulse worker panicked");
            }
        }
    }

    /// Move exactly `steps` (signed) along the ramp plan. Blocks until the
    /// move ends and returns the signed number of steps made.
    pub fn run(&self, steps: i64) -> Result<i64> {
        if steps == 0 {
            return Ok(0);
        }
        let Some(hardware) = self.hardware_or_warn("run") else {
            return Ok(0);
        };
        if !self.claim() {
            self.shared.events.warn(&self.shared.name, "already running, run ignored");
            return Ok(0);
        }
        self.run_claimed(hardware, steps)
    }

    /// Body of [`run`](Self::run) once the axis is claimed. A stop requested
    /// after the claim is honoured.
    fn run_claimed(&self, hardware: &SharedHardware, steps: i64) -> Result<i64> {
        let _guard = self.counter.acquire();
        let start = self.position();
        let direction = Direction::of_steps(steps);

        let result = {
            let mut hw = lock(hardware);
            let result = self.run_locked(&mut **hw, steps.unsigned_abs(), direction);
            finish(&self.shared, &mut **hw);
            result
        };
        self.shared.running.store(false, Ordering::SeqCst);
        result?;

        let moved = self.position() - start;
        log::debug!(target: "platescanner::axis", "{}: moved {} of {} steps", self.shared.name, moved, steps);
        Ok(moved)
    }

    fn run_locked(&self, hw: &mut dyn StepperHardware, steps: u64, direction: Direction) -> Result<()> {
        if refuses_closed_switch(&self.shared, hw, direction, self.home_direction)? {
            return Ok(());
        }
        hw.set_enabled(true)?;
        hw.set_direction(direction)?;
        let plan = self.ramp.plan_move(steps, self.steady_hz);
        let mut driver = Driver::new(&self.shared, hw, direction, self.home_direction, None);

        for segment in &plan.segments {
            self.shared.set_state(segment.phase);
            let halt = match segment.phase {
                AxisState::RampingUp => driver.accelerate(&[segment.level])?,
                AxisState::RampingDown => driver.play(segment.level, Checks::LimitsOnly)?.1,
                _ => driver.play(segment.level, Checks::All)?.1,
            };
            match halt {
                None => {}
                Some(Halt::Limit(role)) => {
                    self.shared.events.warn(
                        &self.shared.name,
                        format!("{:?} limit switch closed during move, stopped at {}", role, self.position()),
                    );
                    return Ok(());
                }
                Some(_) => {
                    self.shared.set_state(AxisState::RampingDown);
                    if let Some(Halt::Limit(role)) = driver.decelerate()? {
                        self.shared.events.warn(
                            &self.shared.name,
                            format!("{:?} limit switch closed while stopping", role),
                        );
                    }
                    self.shared.events.message(&self.shared.name, format!("move stopped at {}", self.position()));
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Drive toward the home switch until contact or timeout. Blocks.
    pub fn home(&self) -> Result<HomingOutcome> {
        let outcome = self.home_inner()?;
        match &outcome {
            HomingOutcome::Homed => {
                self.shared.events.message(&self.shared.name, "home switch reached, position reset to zero")
            }
            HomingOutcome::Busy | HomingOutcome::Unavailable(_) => {}
            other => self.shared.events.warn(&self.shared.name, format!("homing failed: {}", other)),
        }
        self.shared.events.emit(ScannerEvent::HomingFinished {
            axis: self.shared.name.clone(),
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    fn home_inner(&self) -> Result<HomingOutcome> {
        let Some(hardware) = self.hardware_or_warn("homing") else {
            return Ok(HomingOutcome::Unavailable("no hardware handle".to_string()));
        };
        if !self.claim() {
            self.shared.events.warn(&self.shared.name, "already running, homing ignored");
            return Ok(HomingOutcome::Busy);
        }
        let _guard = self.counter.acquire();

        let result = {
            let mut hw = lock(hardware);
            let result = self.home_locked(&mut **hw);
            finish(&self.shared, &mut **hw);
            result
        };
        self.shared.running.store(false, Ordering::SeqCst);
        result
    }

    fn home_locked(&self, hw: &mut dyn StepperHardware) -> Result<HomingOutcome> {
        if !hw.has_home_switch() {
            return Ok(HomingOutcome::NoLimitSwitch);
        }
        let home_closed = hw.home_switch_closed()?;
        let far_closed = hw.far_switch_closed()?;
        if home_closed && far_closed {
            return Ok(HomingOutcome::Unsafe);
        }
        if home_closed {
            return Ok(HomingOutcome::AlreadyAtLimit);
        }

        self.shared.set_state(AxisState::Homing);
        hw.set_enabled(true)?;
        hw.set_direction(self.home_direction)?;
        let started = hw.elapsed();
        let deadline = started + self.home_timeout;

        loop {
            let step = {
                let mut driver = Driver::new(&self.shared, &mut *hw, self.home_direction, self.home_direction, Some(deadline));
                let halt = match driver.accelerate(self.ramp.ramp_up())? {
                    Some(halt) => halt,
                    None => driver.cruise(self.steady_hz)?,
                };
                match halt {
                    Halt::Limit(SwitchRole::Home) => HomingStep::Contact,
                    Halt::Limit(SwitchRole::Far) => HomingStep::Finished(HomingOutcome::FarLimitHit),
                    Halt::Stop => {
                        driver.decelerate()?;
                        HomingStep::Finished(HomingOutcome::Cancelled)
                    }
                    Halt::Timeout => {
                        driver.decelerate()?;
                        HomingStep::Finished(HomingOutcome::TimedOut {
                            elapsed: driver.hw.elapsed().saturating_sub(started),
                        })
                    }
                }
            };
            match step {
                HomingStep::Finished(outcome) => return Ok(outcome),
                HomingStep::Contact => {
                    if hw.home_switch_closed()? {
                        self.shared.position.store(0, Ordering::SeqCst);
                        return Ok(HomingOutcome::Homed);
                    }
                    log::warn!(target: "platescanner::axis", "{}: ghost limit edge, homing continues", self.shared.name);
                    self.shared.tripped.store(TRIP_NONE, Ordering::SeqCst);
                }
            }
        }
    }

    /// Stop and leave the outputs disabled.
    pub fn shutdown(&self) {
        self.stop();
        if let Some(hardware) = &self.hardware {
            if let Err(e) = lock(hardware).set_enabled(false) {
                log::warn!(target: "platescanner::axis", "{}: disable on shutdown failed: {}", self.shared.name, e);
            }
        }
    }
}

impl Drop for AxisController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn jog(
    shared: &AxisShared,
    hw: &mut dyn StepperHardware,
    ramp: &RampProfile,
    steady_hz: f64,
    direction: Direction,
    home_direction: Direction,
) -> Result<()> {
    if refuses_closed_switch(shared, hw, direction, home_direction)? {
        return Ok(());
    }
    hw.set_enabled(true)?;
    hw.set_direction(direction)?;
    let mut driver = Driver::new(shared, hw, direction, home_direction, None);

    shared.set_state(AxisState::RampingUp);
    let halt = match driver.accelerate(ramp.ramp_up())? {
        Some(halt) => halt,
        None => {
            shared.set_state(AxisState::Steady);
            driver.cruise(steady_hz)?
        }
    };
    if let Halt::Limit(role) = halt {
        shared.events.warn(&shared.name, format!("{:?} limit switch closed, jog halted", role));
        return Ok(());
    }
    shared.set_state(AxisState::RampingDown);
    if let Some(Halt::Limit(role)) = driver.decelerate()? {
        shared.events.warn(&shared.name, format!("{:?} limit switch closed while stopping", role));
    }
    Ok(())
}

/// Refuse to drive into a switch that is already closed.
fn refuses_closed_switch(
    shared: &AxisShared,
    hw: &mut dyn StepperHardware,
    direction: Direction,
    home_direction: Direction,
) -> Result<bool> {
    let closed = if direction == home_direction {
        hw.home_switch_closed()?
    } else {
        hw.far_switch_closed()?
    };
    if closed {
        shared.events.warn(&shared.name, format!("limit switch closed in {:?} direction, motion refused", direction));
    }
    Ok(closed)
}

/// End of a motion, still claimed: disable, go idle, and clear the stop and
/// trip flags for the next claim.
fn finish(shared: &AxisShared, hw: &mut dyn StepperHardware) {
    if let Err(e) = hw.set_enabled(false) {
        shared.events.warn(&shared.name, format!("disable failed: {}", e));
    }
    shared.set_state(AxisState::Idle);
    shared.clear_flags();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{PulseLog, SimulatedStepper};
    use crossbeam_channel::Receiver;
    use std::time::Instant;

    fn controller(sim: SimulatedStepper, config: AxisConfig) -> (AxisController, Receiver<ScannerEvent>, ActiveMotorCounter) {
        let (events, rx) = EventBus::new();
        let counter = ActiveMotorCounter::new();
        let axis = AxisController::new(config, Some(Box::new(sim)), counter.clone(), events);
        (axis, rx, counter)
    }

    fn states(rx: &Receiver<ScannerEvent>) -> Vec<AxisState> {
        rx.try_iter()
            .filter_map(|e| match e {
                ScannerEvent::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    fn warnings(rx: &Receiver<ScannerEvent>) -> Vec<String> {
        rx.try_iter()
            .filter_map(|e| match e {
                ScannerEvent::Warning { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn run_back_twenty_steps_from_120() {
        let (axis, rx, _) = controller(SimulatedStepper::new(500), AxisConfig::new("X"));
        assert_eq!(axis.run(120).unwrap(), 120);
        let _ = states(&rx);

        assert_eq!(axis.run(-20).unwrap(), -20);
        assert_eq!(axis.position(), 100);
        let seen = states(&rx);
        assert_eq!(
            seen,
            vec![AxisState::RampingUp, AxisState::Steady, AxisState::RampingDown, AxisState::Idle]
        );
        assert_eq!(axis.state(), AxisState::Idle);
    }

    #[test]
    fn run_round_trip_restores_position() {
        let (axis, _rx, _) = controller(SimulatedStepper::new(1000), AxisConfig::new("Y"));
        for n in [1, 3, 17, 250] {
            let before = axis.position();
            axis.run(n).unwrap();
            axis.run(-n).unwrap();
            assert_eq!(axis.position(), before);
        }
    }

    #[test]
    fn pulse_train_is_symmetric() {
        let log = PulseLog::new();
        let sim = SimulatedStepper::new(1000).with_pulse_log(log.clone());
        let (axis, _rx, _) = controller(sim, AxisConfig::new("X"));
        axis.run(40).unwrap();
        let freqs = log.frequencies();
        assert_eq!(freqs.len(), 40);
        let mut reversed = freqs.clone();
        reversed.reverse();
        assert_eq!(freqs, reversed);
        assert_eq!(freqs[0], 57.0);
        assert_eq!(freqs[20], 1000.0);
    }

    #[test]
    fn stop_is_idempotent() {
        let sim = SimulatedStepper::new(0).with_home_switch_at(None).with_real_time(0.01);
        let (axis, _rx, counter) = controller(sim, AxisConfig::new("X"));
        axis.activate(Direction::Forward);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(counter.active(), 1);

        axis.stop();
        let after_first = axis.position();
        assert!(after_first > 0);
        assert!(!axis.is_running());
        assert_eq!(axis.state(), AxisState::Idle);

        axis.stop();
        assert_eq!(axis.position(), after_first);
        assert_eq!(axis.state(), AxisState::Idle);
        assert_eq!(counter.active(), 0);
    }

    #[test]
    fn stop_while_idle_is_a_no_op() {
        let (axis, rx, _) = controller(SimulatedStepper::new(0), AxisConfig::new("X"));
        axis.stop();
        axis.stop();
        assert_eq!(axis.position(), 0);
        assert!(rx.try_iter().next().is_none());
    }

    #[test]
    fn jog_ramps_down_symmetrically() {
        let log = PulseLog::new();
        let sim = SimulatedStepper::new(0)
            .with_home_switch_at(None)
            .with_pulse_log(log.clone())
            .with_real_time(0.01);
        let (axis, rx, _) = controller(sim, AxisConfig::new("X"));
        axis.activate(Direction::Forward);
        std::thread::sleep(Duration::from_millis(20));
        axis.stop();

        let freqs = log.frequencies();
        let ramp: Vec<f64> = vec![57.0, 154.0, 354.0, 622.0, 832.0, 937.0, 978.0, 993.0];
        assert_eq!(&freqs[..8], &ramp[..]);
        let mut tail: Vec<f64> = freqs[freqs.len() - 8..].to_vec();
        tail.reverse();
        assert_eq!(tail, ramp);
        assert_eq!(axis.position(), freqs.len() as i64);

        let seen = states(&rx);
        assert_eq!(seen.last(), Some(&AxisState::Idle));
        assert!(seen.contains(&AxisState::RampingDown));
    }

    #[test]
    fn home_zeroes_position_on_contact() {
        let sim = SimulatedStepper::new(300);
        let mut config = AxisConfig::new("X");
        config.home_pin = Some(5);
        let (axis, rx, _) = controller(sim, config);
        axis.run(50).unwrap();
        assert_eq!(axis.position(), 50);

        assert_eq!(axis.home().unwrap(), HomingOutcome::Homed);
        assert_eq!(axis.position(), 0);
        assert_eq!(axis.state(), AxisState::Idle);
        let finished = rx.try_iter().any(|e| {
            matches!(e, ScannerEvent::HomingFinished { outcome: HomingOutcome::Homed, .. })
        });
        assert!(finished);
    }

    #[test]
    fn home_aborts_when_switch_already_closed() {
        let log = PulseLog::new();
        // Three steps past the switch, so it stays closed after moving 2 off.
        let sim = SimulatedStepper::new(-3).with_pulse_log(log.clone());
        let (axis, rx, _) = controller(sim, AxisConfig::new("Y"));
        assert_eq!(axis.run(2).unwrap(), 2);
        log.clear();

        assert_eq!(axis.home().unwrap(), HomingOutcome::AlreadyAtLimit);
        assert_eq!(axis.position(), 2);
        assert!(log.is_empty());
        assert!(warnings(&rx).iter().any(|w| w.contains("already closed")));
    }

    #[test]
    fn homing_again_soon_after_backing_off() {
        let mut config = AxisConfig::new("X");
        config.home_timeout = Duration::from_secs(5);
        let (axis, _rx, _) = controller(SimulatedStepper::new(50), config);

        assert_eq!(axis.home().unwrap(), HomingOutcome::Homed);
        assert_eq!(axis.run(5).unwrap(), 5);
        // The new contact lands well inside the debounce window of the first.
        assert_eq!(axis.home().unwrap(), HomingOutcome::Homed);
        assert_eq!(axis.position(), 0);
    }

    #[test]
    fn closing_edge_inside_debounce_window_halts_a_move() {
        let log = PulseLog::new();
        let sim = SimulatedStepper::new(1).with_pulse_log(log.clone());
        let (axis, _rx, _) = controller(sim, AxisConfig::new("X"));
        let handle = axis.limit_handle();
        handle.notify_switch(SwitchRole::Home, Edge::Rising, Duration::ZERO);
        handle.notify_switch(SwitchRole::Home, Edge::Falling, Duration::from_millis(5));

        // Two steps back: the switch closes on the first, inside the window.
        assert_eq!(axis.run(-2).unwrap(), -1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn stop_after_claim_is_not_lost() {
        let (axis, _rx, counter) = controller(SimulatedStepper::new(500), AxisConfig::new("X"));
        assert!(axis.claim());
        axis.stop();
        let hardware = axis.hardware.clone().unwrap();
        assert_eq!(axis.run_claimed(&hardware, 100).unwrap(), 0);
        assert!(!axis.is_running());
        assert_eq!(counter.active(), 0);

        // Flags were cleared when that move ended.
        assert_eq!(axis.run(100).unwrap(), 100);
    }

    #[test]
    fn limit_trip_does_not_outlive_the_move() {
        let sim = SimulatedStepper::new(0).with_home_switch_at(None).with_far_switch_at(Some(10));
        let (axis, _rx, _) = controller(sim, AxisConfig::new("X"));
        assert_eq!(axis.run(100).unwrap(), 10);
        assert_eq!(axis.run(-5).unwrap(), -5);
    }

    #[test]
    fn home_refuses_when_both_switches_closed() {
        let sim = SimulatedStepper::new(0).with_far_switch_at(Some(0));
        let log = PulseLog::new();
        let (axis, rx, _) = controller(sim.with_pulse_log(log.clone()), AxisConfig::new("X"));
        assert_eq!(axis.home().unwrap(), HomingOutcome::Unsafe);
        assert!(log.frequencies().is_empty());
        assert!(warnings(&rx).iter().any(|w| w.contains("both limit switches")));
    }

    #[test]
    fn home_times_out_on_the_hardware_clock() {
        let sim = SimulatedStepper::new(0).with_home_switch_at(Some(-1_000_000));
        let mut config = AxisConfig::new("X");
        config.home_timeout = Duration::from_millis(500);
        let (axis, rx, _) = controller(sim, config);

        let wall = Instant::now();
        let outcome = axis.home().unwrap();
        assert!(wall.elapsed() < Duration::from_secs(5));
        match outcome {
            HomingOutcome::TimedOut { elapsed } => {
                assert!(elapsed >= Duration::from_millis(500));
                assert!(elapsed < Duration::from_millis(600));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_ne!(axis.position(), 0);
        assert_eq!(axis.state(), AxisState::Idle);
        assert!(warnings(&rx).iter().any(|w| w.contains("timed out")));
    }

    #[test]
    fn far_switch_halts_a_move_immediately() {
        let log = PulseLog::new();
        let sim = SimulatedStepper::new(0).with_far_switch_at(Some(10)).with_pulse_log(log.clone());
        let (axis, rx, _) = controller(sim, AxisConfig::new("X"));
        let moved = axis.run(100).unwrap();
        assert_eq!(moved, 10);
        assert_eq!(log.frequencies().len(), 10);
        assert!(warnings(&rx).iter().any(|w| w.contains("Far limit switch")));
    }

    #[test]
    fn motion_into_closed_switch_is_refused() {
        let log = PulseLog::new();
        let sim = SimulatedStepper::new(0).with_pulse_log(log.clone());
        let (axis, _rx, _) = controller(sim, AxisConfig::new("X"));
        assert_eq!(axis.run(-5).unwrap(), 0);
        assert!(log.frequencies().is_empty());
    }

    #[test]
    fn missing_hardware_is_a_warning_not_an_error() {
        let (events, rx) = EventBus::new();
        let axis = AxisController::new(AxisConfig::new("Z"), None, ActiveMotorCounter::new(), events);
        axis.activate(Direction::Forward);
        assert_eq!(axis.run(10).unwrap(), 0);
        assert!(matches!(axis.home().unwrap(), HomingOutcome::Unavailable(_)));
        axis.stop();
        assert_eq!(warnings(&rx).len(), 3);
    }

    #[test]
    fn bouncing_edges_are_debounced() {
        let mut config = AxisConfig::new("X");
        config.home_pin = Some(17);
        config.far_pin = Some(27);
        let (axis, _rx, _) = controller(SimulatedStepper::new(0), config);
        let handle = axis.limit_handle();
        let edge = |ms: u64| EdgeEvent { pin: 17, edge: Edge::Rising, timestamp: Duration::from_millis(ms) };

        assert!(handle.notify(edge(1000)));
        assert!(!handle.notify(edge(1100)));
        assert!(handle.notify(edge(1400)));
        assert!(!handle.notify(EdgeEvent { pin: 4, edge: Edge::Rising, timestamp: Duration::from_secs(9) }));
        assert!(!handle.notify(EdgeEvent { pin: 27, edge: Edge::Falling, timestamp: Duration::from_secs(9) }));
    }

    #[test]
    fn external_edge_stops_a_jog() {
        let mut config = AxisConfig::new("X");
        config.far_pin = Some(27);
        let sim = SimulatedStepper::new(0).with_home_switch_at(None).with_real_time(0.01);
        let (axis, rx, _) = controller(sim, config);
        axis.activate(Direction::Forward);
        std::thread::sleep(Duration::from_millis(20));
        axis.limit_handle().notify(EdgeEvent { pin: 27, edge: Edge::Rising, timestamp: Duration::from_secs(1) });
        let deadline = Instant::now() + Duration::from_secs(2);
        while axis.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!axis.is_running());
        axis.stop();
        assert!(warnings(&rx).iter().any(|w| w.contains("jog halted")));
    }

    #[test]
    fn direction_parses_operator_words() {
        assert_eq!("left".parse::<Direction>().unwrap(), Direction::Reverse);
        assert_eq!("Forward".parse::<Direction>().unwrap(), Direction::Forward);
        assert!("up".parse::<Direction>().is_err());
    }
}
