//! The peripheral context: one attribute server, one connection, one tick
//! driven notification scheduler.

use core::cell::{Cell, RefCell};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Ticker};
use heapless::{LinearMap, Vec};

use crate::att::AttReq;
use crate::attribute::Characteristic;
use crate::connection::{Advertiser, ConnectionShared};
use crate::indicator::{self, IndicatorSink};
use crate::pool::BufferPool;
use crate::scheduler::{PhaseMask, ScheduleClock};
use crate::sensor::ValueSource;
use crate::server::{AttributeServer, Transport};
use crate::{Error, FatalError};

const MAX_CHANNELS: usize = 4;

fn set_status<I: IndicatorSink>(indicator: &mut I, color: crate::indicator::Rgb) -> Result<(), I::Error> {
    indicator.set_color(crate::indicator::STATUS_PIXEL, color)?;
    indicator.flush()
}

struct NotifyChannel<'d> {
    value_handle: u16,
    source: &'d dyn ValueSource,
    phases: PhaseMask,
}

/// A single-connection GATT peripheral.
///
/// Owns the dispatcher and all shared state; nothing in the crate lives in
/// ambient statics, so several independent instances can coexist in tests.
pub struct Peripheral<'d, M: RawMutex, const MAX: usize> {
    server: AttributeServer<'d, M, MAX>,
    conn: ConnectionShared<M, MAX_CHANNELS>,
    clock: Mutex<M, RefCell<ScheduleClock>>,
    channels: Vec<NotifyChannel<'d>, MAX_CHANNELS>,
    // cccd handle -> value handle
    cccds: LinearMap<u16, u16, MAX_CHANNELS>,
    dropped: Mutex<M, Cell<u32>>,
}

impl<'d, M: RawMutex, const MAX: usize> Peripheral<'d, M, MAX> {
    /// Create a peripheral over a populated attribute server.
    pub fn new(server: AttributeServer<'d, M, MAX>) -> Self {
        Self {
            server,
            conn: ConnectionShared::new(),
            clock: Mutex::new(RefCell::new(ScheduleClock::default())),
            channels: Vec::new(),
            cccds: LinearMap::new(),
            dropped: Mutex::new(Cell::new(0)),
        }
    }

    /// The attribute server.
    pub fn server(&self) -> &AttributeServer<'d, M, MAX> {
        &self.server
    }

    /// Connection state, exposed for the host glue.
    pub fn connection(&self) -> &ConnectionShared<M, MAX_CHANNELS> {
        &self.conn
    }

    /// Notifications dropped because the transport refused them.
    pub fn dropped_notifications(&self) -> u32 {
        self.dropped.lock(|counter| counter.get())
    }

    /// Register a notification channel for a characteristic.
    ///
    /// The channel fires in the phases of `phases`; on each firing tick the
    /// source is peeked, the table record updated, and a notification sent
    /// when the peer has subscribed through the paired descriptor.
    pub fn add_channel(
        &mut self,
        characteristic: &Characteristic,
        source: &'d dyn ValueSource,
        phases: PhaseMask,
    ) -> Result<(), Error> {
        let cccd = characteristic.cccd_handle().ok_or(Error::NotFound)?;
        self.channels
            .push(NotifyChannel {
                value_handle: characteristic.handle(),
                source,
                phases,
            })
            .map_err(|_| Error::Full)?;
        self.cccds
            .insert(cccd, characteristic.handle())
            .map_err(|_| Error::Full)?;
        Ok(())
    }

    /// Handle one inbound attribute protocol PDU.
    ///
    /// Subscription changes take effect here: after a write the dispatcher
    /// accepted, a write to a registered descriptor is folded into the
    /// connection state. Applying the hook only on accepted writes keeps
    /// rejected descriptor writes free of side effects.
    pub fn handle_att<T: Transport, const N: usize>(
        &self,
        conn_id: u16,
        pdu: &[u8],
        pool: &BufferPool<M, N>,
        transport: &mut T,
    ) -> Result<(), Error> {
        let req = AttReq::decode(pdu)?;
        if let Some(written) = self.server.process(conn_id, &req, pool, transport)? {
            if let Some(&value_handle) = self.cccds.get(&written) {
                let subscribed = self.server.table().get(written, |cccd| cccd[0] & 0x01 != 0)?;
                self.conn.set_subscription(value_handle, subscribed)?;
                info!(
                    "[peripheral] notifications for {:x} {}",
                    value_handle,
                    if subscribed { "on" } else { "off" }
                );
            }
        }
        Ok(())
    }

    /// Advance the schedule one tick and fire the channels due this phase.
    ///
    /// Firing is fire and forget: the table record is refreshed whether or
    /// not a peer is listening, and a transport refusal only bumps the drop
    /// counter. The tick cadence is never blocked on the link layer.
    pub fn handle_tick<T: Transport>(&self, transport: &mut T) {
        let phase = self.clock.lock(|clock| clock.borrow_mut().advance());
        for channel in self.channels.iter().filter(|c| c.phases.contains(phase)) {
            let mut value = [0u8; 8];
            let Some(n) = channel.source.peek(&mut value) else {
                continue;
            };
            if self.server.table().set(channel.value_handle, &value[..n]).is_err() {
                continue;
            }
            let Some(conn_id) = self.conn.conn_id() else {
                continue;
            };
            if !self.conn.subscribed(channel.value_handle) {
                continue;
            }
            if transport.notify(conn_id, channel.value_handle, &value[..n]).is_err() {
                warn!("[peripheral] notification for {:x} dropped", channel.value_handle);
                self.dropped.lock(|counter| counter.set(counter.get() + 1));
            }
        }
    }

    /// Record a new connection and show the connected color.
    pub fn connected<I: IndicatorSink>(&self, conn_id: u16, indicator: &mut I) {
        info!("[peripheral] connected, id {}", conn_id);
        self.server.reset_mtu();
        self.conn.connect(conn_id);
        if set_status(indicator, indicator::CONNECTED).is_err() {
            warn!("[peripheral] indicator update failed");
        }
    }

    /// Tear down the connection and go back to advertising.
    ///
    /// Subscription state, descriptor records and the negotiated MTU are all
    /// reset so the next peer starts from a clean slate. Failing to re-arm
    /// advertising is fatal; the peripheral would be unreachable forever.
    pub fn disconnected<A: Advertiser, I: IndicatorSink>(
        &self,
        advertiser: &mut A,
        indicator: &mut I,
    ) -> Result<(), Error> {
        info!("[peripheral] disconnected");
        self.conn.disconnect();
        self.conn.reset_subscriptions();
        for (cccd, _) in self.cccds.iter() {
            let _ = self.server.table().set(*cccd, &[0, 0]);
        }
        self.server.reset_mtu();
        advertiser
            .restart()
            .map_err(|_| Error::Fatal(FatalError::AdvertisingRestart))?;
        if set_status(indicator, indicator::IDLE).is_err() {
            warn!("[peripheral] indicator update failed");
        }
        Ok(())
    }

    /// Drive the schedule from a periodic ticker. Runs forever.
    pub async fn run_ticks<T: Transport>(&self, transport: &mut T, period: Duration) {
        let mut ticker = Ticker::every(period);
        loop {
            ticker.next().await;
            self.handle_tick(transport);
        }
    }
}
