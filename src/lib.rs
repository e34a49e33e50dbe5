#![no_std]

//! GATT attribute engine and notification scheduler for a single-connection
//! BLE air quality peripheral.
//!
//! The crate maps inbound attribute protocol requests onto a handle-indexed
//! attribute table, and pushes unsolicited notifications for the sampled gas
//! concentration on a fixed tick cadence. The link-layer stack, the physical
//! sensor driver and the indicator LED driver stay outside the crate, reduced
//! to the [`server::Transport`], [`sensor::SensorSource`],
//! [`connection::Advertiser`] and [`indicator::IndicatorSink`] traits.

use crate::codec::Error as CodecError;

/// Attribute protocol MTU. Response buffers and the per-request scratch
/// buffer are sized by this; the negotiated MTU can only shrink it.
pub const ATT_MTU: usize = 247;

mod fmt;

pub mod codec;
mod cursor;
pub mod types;

pub mod att;
pub mod attribute;
pub mod connection;
pub mod indicator;
pub mod peripheral;
pub mod pool;
pub mod scheduler;
pub mod sensor;
pub mod server;
pub mod service;

#[cfg(test)]
pub(crate) mod testutil;

/// Crate level error type.
///
/// Protocol errors answered to the peer are [`att::AttErrorCode`], not this
/// type; `Error` covers local failures, and fatal conditions are singled out
/// in [`FatalError`] so callers can tell an unrecoverable configuration
/// failure from a transient one.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// No attribute or characteristic with the given handle.
    NotFound,
    /// A bounded table or map ran out of capacity during setup.
    Full,
    /// A UUID was constructed from a slice of unsupported length.
    InvalidUuidLength(usize),
    /// Encoding or decoding a PDU failed.
    Codec(CodecError),
    /// The link layer transport rejected an outbound PDU.
    Transport,
    /// Unrecoverable error; there is no valid operating state without the
    /// failed facility, so the caller should halt.
    Fatal(FatalError),
}

/// Conditions with no recovery path (configuration-level errors).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FatalError {
    /// Re-arming advertising after a disconnect failed.
    AdvertisingRestart,
}

impl From<CodecError> for Error {
    fn from(error: CodecError) -> Self {
        Self::Codec(error)
    }
}

impl From<FatalError> for Error {
    fn from(error: FatalError) -> Self {
        Self::Fatal(error)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Error::NotFound => defmt::write!(fmt, "NotFound"),
            Error::Full => defmt::write!(fmt, "Full"),
            Error::InvalidUuidLength(l) => defmt::write!(fmt, "InvalidUuidLength({})", l),
            Error::Codec(_) => defmt::write!(fmt, "Codec"),
            Error::Transport => defmt::write!(fmt, "Transport"),
            Error::Fatal(_) => defmt::write!(fmt, "Fatal"),
        }
    }
}
