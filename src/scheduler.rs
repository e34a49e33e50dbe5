//! Tick phase clock for the notification scheduler.
//!
//! Notification cadence is derived from a free-running tick by counting
//! phases modulo a small cycle length. Channels declare the phases they fire
//! in as a bitmask, so the cadence policy lives in the schema, not here.

/// Phase counter advanced once per tick.
///
/// The counter increments before it is read, so the first tick after reset
/// lands on phase 1, and phase 0 comes up at the end of the first full
/// cycle.
pub struct ScheduleClock {
    phase: u8,
    modulus: u8,
}

/// Default cycle length in ticks.
pub const DEFAULT_MODULUS: u8 = 8;

impl Default for ScheduleClock {
    fn default() -> Self {
        Self::new(DEFAULT_MODULUS)
    }
}

impl ScheduleClock {
    /// Create a clock with the given cycle length.
    pub fn new(modulus: u8) -> Self {
        assert!(modulus > 0 && modulus <= 8);
        Self { phase: 0, modulus }
    }

    /// Advance one tick and return the new phase.
    pub fn advance(&mut self) -> u8 {
        self.phase = (self.phase + 1) % self.modulus;
        self.phase
    }

    /// Phase of the last tick.
    pub fn phase(&self) -> u8 {
        self.phase
    }
}

/// Bitmask of phases a channel fires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseMask(u8);

impl PhaseMask {
    /// Mask matching the given phases.
    pub const fn of(phases: &[u8]) -> Self {
        let mut mask = 0u8;
        let mut i = 0;
        while i < phases.len() {
            mask |= 1 << phases[i];
            i += 1;
        }
        Self(mask)
    }

    /// Whether the mask contains the phase.
    pub fn contains(&self, phase: u8) -> bool {
        self.0 & (1 << phase) != 0
    }
}
