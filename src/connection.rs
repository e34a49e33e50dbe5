//! Single-connection lifecycle state.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::LinearMap;

/// Control over the advertiser, re-armed after every disconnect.
pub trait Advertiser {
    /// Error type of the advertiser.
    type Error;

    /// Start advertising again. A failure here is fatal to the peripheral;
    /// without advertising the device can never be reached again.
    fn restart(&mut self) -> Result<(), Self::Error>;
}

struct State<const N: usize> {
    conn_id: Option<u16>,
    // value handle -> subscribed
    subscriptions: LinearMap<u16, bool, N>,
}

/// Connection identity and per-connection subscription state, shared between
/// the request path and the tick path.
///
/// The peripheral accepts a single connection; subscriptions are keyed by
/// value handle and dropped wholesale on disconnect.
pub struct ConnectionShared<M: RawMutex, const N: usize = 4> {
    state: Mutex<M, RefCell<State<N>>>,
}

impl<M: RawMutex, const N: usize> Default for ConnectionShared<M, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex, const N: usize> ConnectionShared<M, N> {
    /// Create the state with no connection and no subscriptions.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(State {
                conn_id: None,
                subscriptions: LinearMap::new(),
            })),
        }
    }

    /// Record a new connection.
    pub fn connect(&self, conn_id: u16) {
        self.state.lock(|state| {
            state.borrow_mut().conn_id = Some(conn_id);
        });
    }

    /// Forget the connection. Subscriptions are kept; the caller resets them
    /// as part of its disconnect sequence.
    pub fn disconnect(&self) {
        self.state.lock(|state| {
            state.borrow_mut().conn_id = None;
        });
    }

    /// Whether a peer is currently connected.
    pub fn is_connected(&self) -> bool {
        self.conn_id().is_some()
    }

    /// Identifier of the current connection, if any.
    pub fn conn_id(&self) -> Option<u16> {
        self.state.lock(|state| state.borrow().conn_id)
    }

    /// Record the subscription state of a value handle. Idempotent.
    pub fn set_subscription(&self, value_handle: u16, subscribed: bool) -> Result<(), crate::Error> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            match state.subscriptions.insert(value_handle, subscribed) {
                Ok(_) => Ok(()),
                Err(_) => Err(crate::Error::Full),
            }
        })
    }

    /// Whether the peer is subscribed to notifications for a value handle.
    pub fn subscribed(&self, value_handle: u16) -> bool {
        self.state.lock(|state| {
            *state.borrow().subscriptions.get(&value_handle).unwrap_or(&false)
        })
    }

    /// Drop all subscriptions; the next connection starts clean.
    pub fn reset_subscriptions(&self) {
        self.state.lock(|state| {
            state.borrow_mut().subscriptions.clear();
        });
    }
}
