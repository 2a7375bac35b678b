//! Dispenser-side collaborators.
//!
//! The protocol engine never touches GPIO. It drives an [`Actuator`] for
//! the physical dispense, reads its sensors, asks a [`DeviceControl`] to
//! restart the board and reports status through an [`Indicator`].
//! Simulated implementations back the tests and the CLI's `client` mode.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

/// One piece of candy left the dispenser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispensed;

/// The mechanism is jammed or the hopper is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("dispenser jammed or empty")]
pub struct Jammed;

/// Stepper-style dispenser.
pub trait Actuator: Send + Sync + 'static {
    /// Run the mechanism until one piece drops. Blocks the calling thread.
    fn rotate(&self) -> Result<Dispensed, Jammed>;

    /// Readiness sensor; `false` means jammed or empty.
    fn is_ready(&self) -> bool {
        true
    }

    /// Taken sensor; `true` while the pickup beam reports a collection.
    fn candy_taken(&self) -> bool;
}

/// Board-level control.
pub trait DeviceControl: Send + Sync + 'static {
    /// Full device restart after a session ends.
    fn restart(&self);
}

/// Status feedback (connection LED, dispense pixel).
pub trait Indicator: Send + Sync + 'static {
    /// Connection LED.
    fn set_connected(&self, connected: bool);

    /// Dispense indicator; switched off when its hold time passes.
    fn set_dispensing(&self, active: bool);
}

/// Indicator that shows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIndicator;

impl Indicator for NullIndicator {
    fn set_connected(&self, _connected: bool) {}

    fn set_dispensing(&self, _active: bool) {}
}

/// In-memory dispenser.
///
/// The taken sensor reports a pulse: [`take_candy`](Self::take_candy) arms
/// it and the next read consumes it.
#[derive(Debug, Default)]
pub struct SimulatedDispenser {
    rotate_delay: Duration,
    /// Remaining pieces; `None` is bottomless
    stock: Option<AtomicU32>,
    jam_next: AtomicBool,
    taken_pulse: AtomicBool,
    rotations: AtomicU64,
}

impl SimulatedDispenser {
    /// Bottomless dispenser that dispenses instantly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Time one rotation takes.
    pub fn with_rotate_delay(mut self, delay: Duration) -> Self {
        self.rotate_delay = delay;
        self
    }

    /// Limit the hopper to `pieces`.
    pub fn with_stock(mut self, pieces: u32) -> Self {
        self.stock = Some(AtomicU32::new(pieces));
        self
    }

    /// Make the next rotation jam.
    pub fn jam_next(&self) {
        self.jam_next.store(true, Ordering::SeqCst);
    }

    /// Someone reaches in and takes the candy.
    pub fn take_candy(&self) {
        self.taken_pulse.store(true, Ordering::SeqCst);
    }

    /// Successful rotations so far.
    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::SeqCst)
    }
}

impl Actuator for SimulatedDispenser {
    fn rotate(&self) -> Result<Dispensed, Jammed> {
        if !self.rotate_delay.is_zero() {
            std::thread::sleep(self.rotate_delay);
        }
        if self.jam_next.swap(false, Ordering::SeqCst) {
            return Err(Jammed);
        }
        if let Some(stock) = &self.stock {
            stock
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .map_err(|_| Jammed)?;
        }
        self.rotations.fetch_add(1, Ordering::SeqCst);
        Ok(Dispensed)
    }

    /// An empty hopper is visible up front; a jam only shows mid-rotation.
    fn is_ready(&self) -> bool {
        self.stock
            .as_ref()
            .map_or(true, |s| s.load(Ordering::SeqCst) > 0)
    }

    fn candy_taken(&self) -> bool {
        self.taken_pulse.swap(false, Ordering::SeqCst)
    }
}

/// Restart that only counts and logs; the embedding loop starts a new
/// client afterwards.
#[derive(Debug, Default)]
pub struct SoftRestart {
    restarts: AtomicU32,
}

impl SoftRestart {
    /// New counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restarts requested so far.
    pub fn count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl DeviceControl for SoftRestart {
    fn restart(&self) {
        let n = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(restarts = n, "Device restart requested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_dispense() {
        let sim = SimulatedDispenser::new();
        assert!(sim.is_ready());
        assert_eq!(sim.rotate(), Ok(Dispensed));
        assert_eq!(sim.rotations(), 1);
    }

    #[test]
    fn test_simulated_jam() {
        let sim = SimulatedDispenser::new();
        sim.jam_next();
        // A jam is only discovered by rotating.
        assert!(sim.is_ready());
        assert_eq!(sim.rotate(), Err(Jammed));
        assert_eq!(sim.rotate(), Ok(Dispensed));
    }

    #[test]
    fn test_simulated_stock_runs_out() {
        let sim = SimulatedDispenser::new().with_stock(1);
        assert_eq!(sim.rotate(), Ok(Dispensed));
        assert!(!sim.is_ready());
        assert_eq!(sim.rotate(), Err(Jammed));
        assert_eq!(sim.rotations(), 1);
    }

    #[test]
    fn test_taken_pulse_is_consumed() {
        let sim = SimulatedDispenser::new();
        assert!(!sim.candy_taken());
        sim.take_candy();
        assert!(sim.candy_taken());
        assert!(!sim.candy_taken());
    }

    #[test]
    fn test_soft_restart_counts() {
        let restart = SoftRestart::new();
        restart.restart();
        restart.restart();
        assert_eq!(restart.count(), 2);
    }
}
