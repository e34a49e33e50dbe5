//! Sensor sampling and the single-slot value handoff.
//!
//! The sampler runs on its own cadence and publishes each reading into a
//! [`SensorSlot`]. Attribute records marked dynamic-on-read peek the slot
//! through the [`ValueSource`] trait, so a peer read never blocks on a
//! sensor transaction.

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Ticker};

use crate::indicator::{AirQuality, IndicatorSink};

/// Default sampling cadence.
pub const SAMPLE_PERIOD: Duration = Duration::from_secs(2);

/// Driver for a CO2 sensor.
pub trait SensorSource {
    /// Error type returned by a failed sample.
    type Error;
    /// Take one measurement, in parts per million.
    fn read(&mut self) -> Result<u16, Self::Error>;
}

/// Non-blocking view of the latest published value of a record.
///
/// `peek` writes the serialized value into `dst` and returns its length, or
/// `None` when nothing has been published yet. Implementations must not
/// block; this is called while the attribute table lock is held.
pub trait ValueSource {
    /// Serialize the latest value into `dst`.
    fn peek(&self, dst: &mut [u8]) -> Option<usize>;
}

/// Single-slot handoff carrying the latest CO2 reading in ppm.
///
/// Overwrite-on-publish: only the most recent value is retained, which is
/// exactly what a read-latest characteristic wants.
pub struct SensorSlot<M: RawMutex> {
    value: Mutex<M, Cell<Option<u16>>>,
}

impl<M: RawMutex> Default for SensorSlot<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex> SensorSlot<M> {
    /// Create an empty slot.
    pub const fn new() -> Self {
        Self {
            value: Mutex::new(Cell::new(None)),
        }
    }

    /// Publish a new reading, replacing any previous one.
    pub fn publish(&self, ppm: u16) {
        self.value.lock(|value| value.set(Some(ppm)));
    }

    /// Latest published reading, if any.
    pub fn latest(&self) -> Option<u16> {
        self.value.lock(|value| value.get())
    }
}

impl<M: RawMutex> ValueSource for SensorSlot<M> {
    fn peek(&self, dst: &mut [u8]) -> Option<usize> {
        let ppm = self.latest()?;
        if dst.len() < 2 {
            return None;
        }
        dst[..2].copy_from_slice(&ppm.to_le_bytes());
        Some(2)
    }
}

/// Periodically sample the sensor, publish into the slot and drive the air
/// quality indicator. Runs forever.
pub async fn run_sampler<S: SensorSource, M: RawMutex, I: IndicatorSink>(
    mut sensor: S,
    slot: &SensorSlot<M>,
    indicator: &mut I,
    period: Duration,
) {
    let mut ticker = Ticker::every(period);
    loop {
        ticker.next().await;
        match sensor.read() {
            Ok(ppm) => {
                slot.publish(ppm);
                info!("[sensor] co2 {} ppm", ppm);
                if let Some(quality) = AirQuality::classify(ppm) {
                    if indicator.show(quality).is_err() {
                        warn!("[sensor] indicator update failed");
                    }
                }
            }
            Err(_) => {
                warn!("[sensor] sample failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;

    #[test]
    fn empty_slot_peeks_nothing() {
        let slot: SensorSlot<NoopRawMutex> = SensorSlot::new();
        let mut dst = [0u8; 2];
        assert_eq!(slot.peek(&mut dst), None);
    }

    #[test]
    fn publish_overwrites_previous_value() {
        let slot: SensorSlot<NoopRawMutex> = SensorSlot::new();
        slot.publish(420);
        slot.publish(650);
        let mut dst = [0u8; 4];
        assert_eq!(slot.peek(&mut dst), Some(2));
        assert_eq!(&dst[..2], &[0x8a, 0x02]);
    }
}
