//! Handle-indexed attribute table.
//!
//! The table is the synchronization boundary of the peripheral: both the
//! request dispatcher and the tick-driven notification scheduler read and
//! write attribute values, so every access goes through a blocking mutex
//! scoped to the single operation.
//!
//! The table is created once at startup from a static schema and never
//! resized; only the value region of a record is ever mutated.

use core::cell::RefCell;
use core::fmt;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::att::AttErrorCode;
use crate::sensor::ValueSource;
pub use crate::types::uuid::Uuid;
use crate::Error;

/// UUID for generic access service
pub const GENERIC_ACCESS_SERVICE_UUID16: Uuid = Uuid::Uuid16(0x1800u16.to_le_bytes());

/// UUID for device name characteristic
pub const CHARACTERISTIC_DEVICE_NAME_UUID16: Uuid = Uuid::Uuid16(0x2A00u16.to_le_bytes());

/// UUID for primary service
pub const PRIMARY_SERVICE_UUID16: Uuid = Uuid::Uuid16(0x2800u16.to_le_bytes());

/// UUID for characteristic declaration
pub const CHARACTERISTIC_UUID16: Uuid = Uuid::Uuid16(0x2803u16.to_le_bytes());

/// UUID for the client characteristic configuration descriptor
pub const CHARACTERISTIC_CCCD_UUID16: Uuid = Uuid::Uuid16(0x2902u16.to_le_bytes());

/// Characteristic properties
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum CharacteristicProp {
    /// Broadcast
    Broadcast = 0x01,
    /// Read
    Read = 0x02,
    /// Write without response
    WriteWithoutResponse = 0x04,
    /// Write
    Write = 0x08,
    /// Notify
    Notify = 0x10,
    /// Indicate
    Indicate = 0x20,
    /// Authenticated writes
    AuthenticatedWrite = 0x40,
    /// Extended properties
    Extended = 0x80,
}

/// Attribute metadata.
pub struct Attribute<'d> {
    pub(crate) uuid: Uuid,
    pub(crate) handle: u16,
    pub(crate) data: AttributeData<'d>,
}

impl<'d> Attribute<'d> {
    const EMPTY: Option<Attribute<'d>> = None;
}

pub(crate) enum AttributeData<'d> {
    /// Service declaration; the value is the service UUID.
    Service { uuid: Uuid },
    /// Characteristic declaration; the value packs properties, the value
    /// handle and the characteristic UUID.
    Declaration {
        props: CharacteristicProps,
        handle: u16,
        uuid: Uuid,
    },
    /// Characteristic value with immutable storage.
    ReadOnlyData {
        props: CharacteristicProps,
        value: &'d [u8],
    },
    /// Characteristic value with borrowed mutable storage.
    ///
    /// `value.len()` is the maximum length, `len` the current one; only
    /// `value[..len]` is defined. `fixed_write_len` is an additional peer
    /// write contract, and `source` marks the record dynamic-on-read.
    Data {
        props: CharacteristicProps,
        value: &'d mut [u8],
        len: usize,
        fixed_write_len: Option<usize>,
        source: Option<&'d dyn ValueSource>,
    },
    /// Subscription configuration, a 2-byte little-endian bitmask.
    Cccd { value: [u8; 2] },
}

impl<'d> AttributeData<'d> {
    pub(crate) fn writable(&self) -> bool {
        match self {
            Self::Data { props, .. } => props.0
                & (CharacteristicProp::Write as u8
                    | CharacteristicProp::WriteWithoutResponse as u8
                    | CharacteristicProp::AuthenticatedWrite as u8)
                != 0,
            Self::Cccd { .. } => true,
            _ => false,
        }
    }

    /// Current value length; the only defined region of the value.
    pub(crate) fn value_len(&self) -> usize {
        match self {
            Self::Service { uuid } => uuid.as_raw().len(),
            Self::Declaration { uuid, .. } => 3 + uuid.as_raw().len(),
            Self::ReadOnlyData { value, .. } => value.len(),
            Self::Data { len, .. } => *len,
            Self::Cccd { .. } => 2,
        }
    }

    /// Refresh a dynamic-on-read record from its value source.
    ///
    /// Non-blocking; the source is a single-slot handoff, not a sensor
    /// transaction, so this is bounded in time and safe to run inside the
    /// request handling context.
    pub(crate) fn refresh(&mut self) {
        if let Self::Data {
            value, len, source: Some(source), ..
        } = self
        {
            if let Some(n) = source.peek(value) {
                *len = n;
            }
        }
    }

    pub(crate) fn read(&self, offset: usize, dst: &mut [u8]) -> Result<usize, AttErrorCode> {
        let total = self.value_len();
        if offset >= total {
            return Err(AttErrorCode::InvalidOffset);
        }
        let len = dst.len().min(total - offset);
        match self {
            Self::Service { uuid } => {
                dst[..len].copy_from_slice(&uuid.as_raw()[offset..offset + len]);
            }
            Self::Declaration { props, handle, uuid } => {
                let mut scratch = [0u8; 19];
                scratch[0] = props.0;
                scratch[1..3].copy_from_slice(&handle.to_le_bytes());
                scratch[3..total].copy_from_slice(uuid.as_raw());
                dst[..len].copy_from_slice(&scratch[offset..offset + len]);
            }
            Self::ReadOnlyData { value, .. } => {
                dst[..len].copy_from_slice(&value[offset..offset + len]);
            }
            Self::Data { value, .. } => {
                dst[..len].copy_from_slice(&value[offset..offset + len]);
            }
            Self::Cccd { value } => {
                dst[..len].copy_from_slice(&value[offset..offset + len]);
            }
        }
        Ok(len)
    }

    /// Peer-initiated write. Validation runs before any mutation so a
    /// rejected write leaves both length and data untouched.
    pub(crate) fn write(&mut self, data: &[u8]) -> Result<(), AttErrorCode> {
        if !self.writable() {
            return Err(AttErrorCode::WriteNotPermitted);
        }
        match self {
            Self::Data {
                value,
                len,
                fixed_write_len,
                ..
            } => {
                if let Some(fixed) = fixed_write_len {
                    if data.len() != *fixed {
                        return Err(AttErrorCode::InvalidAttrLen);
                    }
                }
                if data.len() > value.len() {
                    return Err(AttErrorCode::InvalidAttrLen);
                }
                value[..data.len()].copy_from_slice(data);
                *len = data.len();
                Ok(())
            }
            Self::Cccd { value } => {
                if data.len() != 2 {
                    return Err(AttErrorCode::InvalidAttrLen);
                }
                value.copy_from_slice(data);
                Ok(())
            }
            _ => Err(AttErrorCode::WriteNotPermitted),
        }
    }

    /// Trusted internal update, bypassing the peer write validation.
    pub(crate) fn set(&mut self, data: &[u8]) -> Result<(), Error> {
        match self {
            Self::Data { value, len, .. } => {
                if data.len() > value.len() {
                    return Err(Error::Codec(crate::codec::Error::InsufficientSpace));
                }
                value[..data.len()].copy_from_slice(data);
                *len = data.len();
                Ok(())
            }
            Self::Cccd { value } => {
                if data.len() != 2 {
                    return Err(Error::Codec(crate::codec::Error::InsufficientSpace));
                }
                value.copy_from_slice(data);
                Ok(())
            }
            _ => Err(Error::NotFound),
        }
    }
}

impl<'d> fmt::Debug for Attribute<'d> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("uuid", &self.uuid)
            .field("handle", &self.handle)
            .field("writable", &self.data.writable())
            .finish()
    }
}

#[cfg(feature = "defmt")]
impl<'d> defmt::Format for Attribute<'d> {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", defmt::Debug2Format(self))
    }
}

/// A table of attributes, handles strictly increasing and unique.
pub struct AttributeTable<'d, M: RawMutex, const MAX: usize> {
    inner: Mutex<M, RefCell<InnerTable<'d, MAX>>>,
    handle: u16,
}

pub(crate) struct InnerTable<'d, const MAX: usize> {
    attributes: [Option<Attribute<'d>>; MAX],
    len: usize,
}

impl<'d, const MAX: usize> InnerTable<'d, MAX> {
    fn push(&mut self, attribute: Attribute<'d>) {
        if self.len == MAX {
            panic!("no space for more attributes")
        }
        self.attributes[self.len].replace(attribute);
        self.len += 1;
    }
}

impl<'d, M: RawMutex, const MAX: usize> Default for AttributeTable<'d, M, MAX> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'d, M: RawMutex, const MAX: usize> AttributeTable<'d, M, MAX> {
    /// Create a new attribute table.
    pub fn new() -> Self {
        Self {
            handle: 1,
            inner: Mutex::new(RefCell::new(InnerTable {
                len: 0,
                attributes: [Attribute::EMPTY; MAX],
            })),
        }
    }

    pub(crate) fn iterate<F: FnMut(AttributeIterator<'_, 'd>) -> R, R>(&self, mut f: F) -> R {
        self.inner.lock(|inner| {
            let mut table = inner.borrow_mut();
            let len = table.len;
            let it = AttributeIterator {
                attributes: &mut table.attributes[..],
                pos: 0,
                len,
            };
            f(it)
        })
    }

    fn push(&mut self, mut attribute: Attribute<'d>) -> u16 {
        let handle = self.handle;
        attribute.handle = handle;
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            inner.push(attribute);
        });
        self.handle += 1;
        handle
    }

    /// Add a service to the attribute table (group of characteristics)
    pub fn add_service(&mut self, service: Service) -> ServiceBuilder<'_, 'd, M, MAX> {
        self.push(Attribute {
            uuid: PRIMARY_SERVICE_UUID16,
            handle: 0,
            data: AttributeData::Service { uuid: service.uuid },
        });
        ServiceBuilder { table: self }
    }

    /// First handle in `[start, end]` whose attribute type matches, in
    /// ascending handle order.
    ///
    /// The scan is restartable: after consuming a match, resume it from
    /// `handle + 1` to walk all matches incrementally.
    pub fn find_by_type_in_range(&self, start: u16, end: u16, attribute_type: &Uuid) -> Option<u16> {
        self.iterate(|mut it| {
            while let Some(att) = it.next() {
                if att.handle >= start && att.handle <= end && att.uuid == *attribute_type {
                    return Some(att.handle);
                }
            }
            None
        })
    }

    /// Read up to `dst.len()` bytes of the attribute value starting at
    /// `offset`, returning the number of bytes copied.
    ///
    /// Dynamic-on-read records are refreshed from their value source first;
    /// this is the only path by which a peer read causes a sensor poll.
    pub fn read(&self, handle: u16, offset: usize, dst: &mut [u8]) -> Result<usize, AttErrorCode> {
        self.iterate(|mut it| {
            while let Some(att) = it.next() {
                if att.handle == handle {
                    att.data.refresh();
                    return att.data.read(offset, dst);
                }
            }
            Err(AttErrorCode::InvalidHandle)
        })
    }

    /// Peer-initiated write of a complete attribute value.
    pub fn write(&self, handle: u16, data: &[u8]) -> Result<(), AttErrorCode> {
        self.iterate(|mut it| {
            while let Some(att) = it.next() {
                if att.handle == handle {
                    return att.data.write(data);
                }
            }
            Err(AttErrorCode::InvalidHandle)
        })
    }

    /// Trusted internal update of a value record (scheduler path); bypasses
    /// the peer write validation and the write property check.
    pub fn set(&self, handle: u16, data: &[u8]) -> Result<(), Error> {
        self.iterate(|mut it| {
            while let Some(att) = it.next() {
                if att.handle == handle {
                    return att.data.set(data);
                }
            }
            Err(Error::NotFound)
        })
    }

    /// Read the current value of a record and pass it to the provided closure.
    pub fn get<F: FnMut(&[u8]) -> T, T>(&self, handle: u16, mut f: F) -> Result<T, Error> {
        self.iterate(|mut it| {
            while let Some(att) = it.next() {
                if att.handle == handle {
                    return match &att.data {
                        AttributeData::ReadOnlyData { value, .. } => Ok(f(value)),
                        AttributeData::Data { value, len, .. } => Ok(f(&value[..*len])),
                        AttributeData::Cccd { value } => Ok(f(value)),
                        _ => Err(Error::NotFound),
                    };
                }
            }
            Err(Error::NotFound)
        })
    }

    fn with_data_mut<F: FnOnce(&mut AttributeData<'d>)>(&self, handle: u16, f: F) -> Result<(), Error> {
        let mut f = Some(f);
        self.iterate(|mut it| {
            while let Some(att) = it.next() {
                if att.handle == handle {
                    if let Some(f) = f.take() {
                        f(&mut att.data);
                    }
                    return Ok(());
                }
            }
            Err(Error::NotFound)
        })
    }
}

/// Builder for constructing GATT service definitions.
pub struct ServiceBuilder<'r, 'd, M: RawMutex, const MAX: usize> {
    table: &'r mut AttributeTable<'d, M, MAX>,
}

impl<'r, 'd, M: RawMutex, const MAX: usize> ServiceBuilder<'r, 'd, M, MAX> {
    fn add_characteristic_internal(
        &mut self,
        uuid: Uuid,
        props: CharacteristicProps,
        data: AttributeData<'d>,
    ) -> CharacteristicBuilder<'_, 'd, M, MAX> {
        // First the characteristic declaration
        let next = self.table.handle + 1;
        let cccd = self.table.handle + 2;
        self.table.push(Attribute {
            uuid: CHARACTERISTIC_UUID16,
            handle: 0,
            data: AttributeData::Declaration {
                props,
                handle: next,
                uuid: uuid.clone(),
            },
        });

        // Then the value declaration
        self.table.push(Attribute { uuid, handle: 0, data });

        // Add optional CCCD handle
        let cccd_handle = if props.any(&[CharacteristicProp::Notify, CharacteristicProp::Indicate]) {
            self.table.push(Attribute {
                uuid: CHARACTERISTIC_CCCD_UUID16,
                handle: 0,
                data: AttributeData::Cccd { value: [0, 0] },
            });
            Some(cccd)
        } else {
            None
        };

        CharacteristicBuilder {
            handle: Characteristic {
                handle: next,
                cccd_handle,
            },
            table: self.table,
        }
    }

    /// Add a characteristic to this service with a reference to a mutable storage buffer.
    pub fn add_characteristic<U: Into<Uuid>>(
        &mut self,
        uuid: U,
        props: &[CharacteristicProp],
        storage: &'d mut [u8],
    ) -> CharacteristicBuilder<'_, 'd, M, MAX> {
        let props = props.into();
        let len = storage.len();
        self.add_characteristic_internal(
            uuid.into(),
            props,
            AttributeData::Data {
                props,
                value: storage,
                len,
                fixed_write_len: None,
                source: None,
            },
        )
    }

    /// Add a characteristic to this service with a reference to an immutable storage buffer.
    pub fn add_characteristic_ro<U: Into<Uuid>>(
        &mut self,
        uuid: U,
        value: &'d [u8],
    ) -> CharacteristicBuilder<'_, 'd, M, MAX> {
        let props = (&[CharacteristicProp::Read][..]).into();
        self.add_characteristic_internal(uuid.into(), props, AttributeData::ReadOnlyData { props, value })
    }
}

/// A characteristic in the attribute table.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Characteristic {
    pub(crate) cccd_handle: Option<u16>,
    pub(crate) handle: u16,
}

impl Characteristic {
    /// Handle of the characteristic value record.
    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// Handle of the paired subscription configuration record, if any.
    pub fn cccd_handle(&self) -> Option<u16> {
        self.cccd_handle
    }
}

/// Builder for characteristics.
pub struct CharacteristicBuilder<'r, 'd, M: RawMutex, const MAX: usize> {
    handle: Characteristic,
    table: &'r mut AttributeTable<'d, M, MAX>,
}

impl<'r, 'd, M: RawMutex, const MAX: usize> CharacteristicBuilder<'r, 'd, M, MAX> {
    /// Require peer writes to carry exactly `len` bytes; anything else is
    /// rejected with `InvalidAttrLen` before any state changes.
    pub fn fixed_write_len(self, len: usize) -> Self {
        let _ = self.table.with_data_mut(self.handle.handle, |data| {
            if let AttributeData::Data { fixed_write_len, .. } = data {
                *fixed_write_len = Some(len);
            }
        });
        self
    }

    /// Set the initial value of the characteristic.
    pub fn value(self, value: &[u8]) -> Self {
        let _ = self.table.with_data_mut(self.handle.handle, |data| {
            let _ = data.set(value);
        });
        self
    }

    /// Mark the characteristic dynamic-on-read: each read refreshes the
    /// stored value from the source before serving.
    pub fn dynamic(self, source: &'d dyn ValueSource) -> Self {
        let _ = self.table.with_data_mut(self.handle.handle, |data| {
            if let AttributeData::Data { source: slot, .. } = data {
                *slot = Some(source);
            }
        });
        self
    }

    /// Return the built characteristic.
    pub fn build(self) -> Characteristic {
        self.handle
    }
}

/// Iterator over attributes.
pub struct AttributeIterator<'a, 'd> {
    attributes: &'a mut [Option<Attribute<'d>>],
    pos: usize,
    len: usize,
}

impl<'a, 'd> AttributeIterator<'a, 'd> {
    /// Return next attribute in iterator.
    pub fn next<'m>(&'m mut self) -> Option<&'m mut Attribute<'d>> {
        if self.pos < self.len {
            let i = self.attributes[self.pos].as_mut();
            self.pos += 1;
            i
        } else {
            None
        }
    }
}

/// A GATT service.
pub struct Service {
    /// UUID of the service.
    pub uuid: Uuid,
}

impl Service {
    /// Create a new service with a uuid.
    pub fn new<U: Into<Uuid>>(uuid: U) -> Self {
        Self { uuid: uuid.into() }
    }
}

/// Properties of a characteristic.
#[derive(Clone, Copy)]
pub struct CharacteristicProps(u8);

impl<'a> From<&'a [CharacteristicProp]> for CharacteristicProps {
    fn from(props: &'a [CharacteristicProp]) -> Self {
        let mut val: u8 = 0;
        for prop in props {
            val |= *prop as u8;
        }
        CharacteristicProps(val)
    }
}

impl CharacteristicProps {
    /// Check if any of the properties are set.
    pub fn any(&self, props: &[CharacteristicProp]) -> bool {
        for p in props {
            if (*p as u8) & self.0 != 0 {
                return true;
            }
        }
        false
    }
}
