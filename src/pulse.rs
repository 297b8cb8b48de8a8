//! Monotonic-clock pulse scheduling.
//!
//! Each step pulse is a high and a low half period. Edges are placed on
//! absolute deadlines so sleep jitter does not accumulate over a move.

use std::time::{Duration, Instant};

/// Below this the timer spins instead of sleeping.
const SPIN_THRESHOLD: Duration = Duration::from_micros(200);

#[derive(Debug)]
pub struct PulseTimer {
    origin: Instant,
    next_edge: Option<Instant>,
    /// Scales every half period; 1.0 is real time.
    time_scale: f64,
}

impl PulseTimer {
    pub fn new() -> Self {
        Self::with_time_scale(1.0)
    }

    pub fn with_time_scale(time_scale: f64) -> Self {
        Self {
            origin: Instant::now(),
            next_edge: None,
            time_scale: if time_scale.is_finite() && time_scale > 0.0 { time_scale } else { 1.0 },
        }
    }

    pub fn half_period(frequency_hz: f64) -> Duration {
        Duration::from_secs_f64(0.5 / frequency_hz.max(f64::MIN_POSITIVE))
    }

    /// Forget the previous deadline, so the next edge is scheduled from now.
    pub fn reset(&mut self) {
        self.next_edge = None;
    }

    /// Block until the next edge for a pulse train at `frequency_hz`.
    /// Returns how late the edge was served.
    pub fn wait_half_period(&mut self, frequency_hz: f64) -> Duration {
        let half = Self::half_period(frequency_hz).mul_f64(self.time_scale);
        let now = Instant::now();
        let deadline = match self.next_edge {
            // More than a full period behind: resynchronise instead of bursting.
            Some(prev) if prev + half * 2 >= now => prev + half,
            _ => now + half,
        };
        Self::sleep_until(deadline);
        self.next_edge = Some(deadline);
        Instant::now().saturating_duration_since(deadline)
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep_until(deadline: Instant) {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let remaining = deadline - now;
            if remaining > SPIN_THRESHOLD {
                std::thread::sleep(remaining - SPIN_THRESHOLD);
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

impl Default for PulseTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_period_of_one_khz() {
        assert_eq!(PulseTimer::half_period(1000.0), Duration::from_micros(500));
    }

    #[test]
    fn pulse_train_takes_at_least_its_period() {
        let mut timer = PulseTimer::new();
        let start = Instant::now();
        for _ in 0..20 {
            timer.wait_half_period(10_000.0);
            timer.wait_half_period(10_000.0);
        }
        // 20 pulses at 10 kHz = 2 ms
        assert!(start.elapsed() >= Duration::from_micros(1900));
    }

    #[test]
    fn time_scale_shrinks_periods() {
        let mut timer = PulseTimer::with_time_scale(0.001);
        let start = Instant::now();
        for _ in 0..10 {
            timer.wait_half_period(10.0);
        }
        // 50 ms half periods scaled to 50 us each
        assert!(start.elapsed() < Duration::from_millis(250));
    }
}
