//! Test doubles for the boundary traits.

use core::cell::Cell;

use heapless::Vec;

use crate::connection::Advertiser;
use crate::indicator::{IndicatorSink, Rgb};
use crate::pool::ResponseBuffer;
use crate::sensor::ValueSource;
use crate::server::Transport;

/// Transport that records everything it is asked to send.
pub struct MockTransport {
    sent: Vec<Vec<u8, 64>, 8>,
    notified: Vec<(u16, u16, Vec<u8, 8>), 8>,
    fail_notify: bool,
}

pub struct TransportRefused;

impl MockTransport {
    pub fn new() -> Self {
        Self {
            sent: Vec::new(),
            notified: Vec::new(),
            fail_notify: false,
        }
    }

    pub fn sent(&self) -> &[Vec<u8, 64>] {
        &self.sent
    }

    pub fn notified(&self) -> &[(u16, u16, Vec<u8, 8>)] {
        &self.notified
    }

    pub fn fail_notifications(&mut self, fail: bool) {
        self.fail_notify = fail;
    }

    fn record(&mut self, pdu: &[u8]) -> Result<(), TransportRefused> {
        let pdu = Vec::from_slice(pdu).map_err(|_| TransportRefused)?;
        self.sent.push(pdu).map_err(|_| TransportRefused)
    }
}

impl Transport for MockTransport {
    type Error = TransportRefused;

    fn send(&mut self, _conn_id: u16, pdu: &[u8]) -> Result<(), Self::Error> {
        self.record(pdu)
    }

    fn send_pooled(&mut self, conn_id: u16, rsp: ResponseBuffer<'_>) -> Result<(), Self::Error> {
        // Copy out, then drop the buffer as a real transport would after
        // the bytes are queued.
        self.send(conn_id, rsp.payload())
    }

    fn notify(&mut self, conn_id: u16, handle: u16, value: &[u8]) -> Result<(), Self::Error> {
        if self.fail_notify {
            return Err(TransportRefused);
        }
        let value = Vec::from_slice(value).map_err(|_| TransportRefused)?;
        self.notified
            .push((conn_id, handle, value))
            .map_err(|_| TransportRefused)
    }
}

/// Advertiser that counts restarts and can be told to fail.
pub struct MockAdvertiser {
    restarts: u32,
    fail: bool,
}

pub struct AdvertiserDown;

impl MockAdvertiser {
    pub fn new() -> Self {
        Self { restarts: 0, fail: false }
    }

    pub fn failing() -> Self {
        Self { restarts: 0, fail: true }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}

impl Advertiser for MockAdvertiser {
    type Error = AdvertiserDown;

    fn restart(&mut self) -> Result<(), Self::Error> {
        if self.fail {
            return Err(AdvertiserDown);
        }
        self.restarts += 1;
        Ok(())
    }
}

/// Indicator that remembers the last staged color and counts flushes.
pub struct MockIndicator {
    staged: Option<(usize, Rgb)>,
    flushed: Option<(usize, Rgb)>,
    flushes: u32,
}

#[derive(Debug)]
pub struct IndicatorDown;

impl MockIndicator {
    pub fn new() -> Self {
        Self {
            staged: None,
            flushed: None,
            flushes: 0,
        }
    }

    /// Last color that made it through a flush.
    pub fn color(&self) -> Option<Rgb> {
        self.flushed.map(|(_, color)| color)
    }

    pub fn position(&self) -> Option<usize> {
        self.flushed.map(|(position, _)| position)
    }

    pub fn flushes(&self) -> u32 {
        self.flushes
    }
}

impl IndicatorSink for MockIndicator {
    type Error = IndicatorDown;

    fn set_color(&mut self, position: usize, color: Rgb) -> Result<(), Self::Error> {
        self.staged = Some((position, color));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.flushed = self.staged;
        self.flushes += 1;
        Ok(())
    }
}

/// Value source backed by a plain cell, no mutex involved.
pub struct FakeSlot {
    value: Cell<Option<u16>>,
}

impl FakeSlot {
    pub fn new() -> Self {
        Self { value: Cell::new(None) }
    }

    pub fn publish(&self, ppm: u16) {
        self.value.set(Some(ppm));
    }
}

impl ValueSource for FakeSlot {
    fn peek(&self, dst: &mut [u8]) -> Option<usize> {
        let ppm = self.value.get()?;
        if dst.len() < 2 {
            return None;
        }
        dst[..2].copy_from_slice(&ppm.to_le_bytes());
        Some(2)
    }
}
