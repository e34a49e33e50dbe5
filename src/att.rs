//! Attribute protocol PDUs.

use core::fmt::Display;

use crate::codec;
use crate::cursor::{ReadCursor, WriteCursor};
use crate::types::uuid::Uuid;

pub(crate) const ATT_ERROR_RSP: u8 = 0x01;
pub(crate) const ATT_EXCHANGE_MTU_REQ: u8 = 0x02;
pub(crate) const ATT_EXCHANGE_MTU_RSP: u8 = 0x03;
pub(crate) const ATT_READ_BY_TYPE_REQ: u8 = 0x08;
pub(crate) const ATT_READ_BY_TYPE_RSP: u8 = 0x09;
pub(crate) const ATT_READ_REQ: u8 = 0x0a;
pub(crate) const ATT_READ_RSP: u8 = 0x0b;
pub(crate) const ATT_READ_BLOB_REQ: u8 = 0x0c;
pub(crate) const ATT_READ_BLOB_RSP: u8 = 0x0d;
pub(crate) const ATT_WRITE_REQ: u8 = 0x12;
pub(crate) const ATT_WRITE_RSP: u8 = 0x13;
pub(crate) const ATT_WRITE_CMD: u8 = 0x52;

/// Attribute protocol error code.
///
/// The subset of the `ATT_ERROR_RSP` codes this server produces. Protocol
/// errors are always recovered locally by answering the peer with an error
/// response; they never terminate the connection.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum AttErrorCode {
    /// Attempted to use a handle that isn't valid on this server.
    InvalidHandle = 0x01,
    /// The attribute cannot be written.
    WriteNotPermitted = 0x03,
    /// Offset specified was past the end of the attribute value.
    InvalidOffset = 0x07,
    /// The attribute value length is invalid for the operation.
    InvalidAttrLen = 0x0d,
    /// Insufficient resources to complete the request.
    InsufficientResources = 0x11,
}

impl Display for AttErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidHandle => f.write_str("invalid handle"),
            Self::WriteNotPermitted => f.write_str("write not permitted"),
            Self::InvalidOffset => f.write_str("offset past the end of the attribute value"),
            Self::InvalidAttrLen => f.write_str("invalid attribute value length"),
            Self::InsufficientResources => f.write_str("insufficient resources"),
        }
    }
}

impl codec::FixedSize for AttErrorCode {
    const SIZE: usize = 1;
}

impl codec::Encode for AttErrorCode {
    fn encode(&self, dest: &mut [u8]) -> Result<(), codec::Error> {
        if dest.is_empty() {
            return Err(codec::Error::InsufficientSpace);
        }
        dest[0] = *self as u8;
        Ok(())
    }
}

/// An inbound attribute protocol request.
///
/// Each request is independent; the dispatcher keeps no state between them.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq)]
pub enum AttReq<'d> {
    ExchangeMtu {
        mtu: u16,
    },
    ReadByType {
        start: u16,
        end: u16,
        attribute_type: Uuid,
    },
    Read {
        handle: u16,
    },
    ReadBlob {
        handle: u16,
        offset: u16,
    },
    Write {
        handle: u16,
        data: &'d [u8],
    },
    WriteCmd {
        handle: u16,
        data: &'d [u8],
    },
}

impl<'d> AttReq<'d> {
    /// Request opcode, as echoed back in error responses.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::ExchangeMtu { .. } => ATT_EXCHANGE_MTU_REQ,
            Self::ReadByType { .. } => ATT_READ_BY_TYPE_REQ,
            Self::Read { .. } => ATT_READ_REQ,
            Self::ReadBlob { .. } => ATT_READ_BLOB_REQ,
            Self::Write { .. } => ATT_WRITE_REQ,
            Self::WriteCmd { .. } => ATT_WRITE_CMD,
        }
    }

    pub fn size(&self) -> usize {
        1 + match self {
            Self::ExchangeMtu { .. } => 2,
            Self::ReadByType { attribute_type, .. } => 4 + attribute_type.as_raw().len(),
            Self::Read { .. } => 2,
            Self::ReadBlob { .. } => 4,
            Self::Write { data, .. } => 2 + data.len(),
            Self::WriteCmd { data, .. } => 2 + data.len(),
        }
    }

    pub fn encode(&self, dest: &mut [u8]) -> Result<usize, codec::Error> {
        let mut w = WriteCursor::new(dest);
        match self {
            Self::ExchangeMtu { mtu } => {
                w.write(ATT_EXCHANGE_MTU_REQ)?;
                w.write(*mtu)?;
            }
            Self::ReadByType {
                start,
                end,
                attribute_type,
            } => {
                w.write(ATT_READ_BY_TYPE_REQ)?;
                w.write(*start)?;
                w.write(*end)?;
                w.write_ref(attribute_type)?;
            }
            Self::Read { handle } => {
                w.write(ATT_READ_REQ)?;
                w.write(*handle)?;
            }
            Self::ReadBlob { handle, offset } => {
                w.write(ATT_READ_BLOB_REQ)?;
                w.write(*handle)?;
                w.write(*offset)?;
            }
            Self::Write { handle, data } => {
                w.write(ATT_WRITE_REQ)?;
                w.write(*handle)?;
                w.append(data)?;
            }
            Self::WriteCmd { handle, data } => {
                w.write(ATT_WRITE_CMD)?;
                w.write(*handle)?;
                w.append(data)?;
            }
        }
        Ok(w.len())
    }

    pub fn decode(data: &'d [u8]) -> Result<AttReq<'d>, codec::Error> {
        let mut r = ReadCursor::new(data);
        let opcode: u8 = r.read()?;
        AttReq::decode_with_opcode(opcode, r)
    }

    pub fn decode_with_opcode(opcode: u8, r: ReadCursor<'d>) -> Result<AttReq<'d>, codec::Error> {
        let payload = r.remaining();
        match opcode {
            ATT_EXCHANGE_MTU_REQ => {
                if payload.len() < 2 {
                    return Err(codec::Error::InsufficientSpace);
                }
                let mtu = u16::from_le_bytes([payload[0], payload[1]]);
                Ok(Self::ExchangeMtu { mtu })
            }
            ATT_READ_BY_TYPE_REQ => {
                if payload.len() < 4 {
                    return Err(codec::Error::InsufficientSpace);
                }
                let start = u16::from_le_bytes([payload[0], payload[1]]);
                let end = u16::from_le_bytes([payload[2], payload[3]]);

                let attribute_type = if payload.len() == 6 {
                    Uuid::Uuid16([payload[4], payload[5]])
                } else if payload.len() == 20 {
                    let uuid = payload[4..20].try_into().map_err(|_| codec::Error::InvalidValue)?;
                    Uuid::Uuid128(uuid)
                } else {
                    return Err(codec::Error::InvalidValue);
                };

                Ok(Self::ReadByType {
                    start,
                    end,
                    attribute_type,
                })
            }
            ATT_READ_REQ => {
                if payload.len() < 2 {
                    return Err(codec::Error::InsufficientSpace);
                }
                let handle = u16::from_le_bytes([payload[0], payload[1]]);
                Ok(Self::Read { handle })
            }
            ATT_READ_BLOB_REQ => {
                if payload.len() < 4 {
                    return Err(codec::Error::InsufficientSpace);
                }
                let handle = u16::from_le_bytes([payload[0], payload[1]]);
                let offset = u16::from_le_bytes([payload[2], payload[3]]);
                Ok(Self::ReadBlob { handle, offset })
            }
            ATT_WRITE_REQ => {
                if payload.len() < 2 {
                    return Err(codec::Error::InsufficientSpace);
                }
                let handle = u16::from_le_bytes([payload[0], payload[1]]);
                Ok(Self::Write {
                    handle,
                    data: &payload[2..],
                })
            }
            ATT_WRITE_CMD => {
                if payload.len() < 2 {
                    return Err(codec::Error::InsufficientSpace);
                }
                let handle = u16::from_le_bytes([payload[0], payload[1]]);
                Ok(Self::WriteCmd {
                    handle,
                    data: &payload[2..],
                })
            }
            code => {
                warn!("[att] unknown opcode {:x}", code);
                Err(codec::Error::InvalidValue)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_exchange_mtu() {
        let pdu = [ATT_EXCHANGE_MTU_REQ, 0x40, 0x00];
        let req = AttReq::decode(&pdu).unwrap();
        assert_eq!(req, AttReq::ExchangeMtu { mtu: 64 });
    }

    #[test]
    fn decode_read() {
        let pdu = [ATT_READ_REQ, 0x03, 0x00];
        let req = AttReq::decode(&pdu).unwrap();
        assert_eq!(req, AttReq::Read { handle: 3 });
    }

    #[test]
    fn decode_read_blob() {
        let pdu = [ATT_READ_BLOB_REQ, 0x03, 0x00, 0x05, 0x00];
        let req = AttReq::decode(&pdu).unwrap();
        assert_eq!(req, AttReq::ReadBlob { handle: 3, offset: 5 });
    }

    #[test]
    fn decode_read_by_type_short_uuid() {
        let pdu = [ATT_READ_BY_TYPE_REQ, 0x01, 0x00, 0xff, 0xff, 0x8c, 0x2b];
        let req = AttReq::decode(&pdu).unwrap();
        assert_eq!(
            req,
            AttReq::ReadByType {
                start: 1,
                end: 0xffff,
                attribute_type: Uuid::new_short(0x2b8c),
            }
        );
    }

    #[test]
    fn decode_write_carries_payload() {
        let pdu = [ATT_WRITE_REQ, 0x04, 0x00, 0x01, 0x00];
        let req = AttReq::decode(&pdu).unwrap();
        assert_eq!(
            req,
            AttReq::Write {
                handle: 4,
                data: &[0x01, 0x00],
            }
        );
    }

    #[test]
    fn decode_unknown_opcode() {
        let pdu = [0x99, 0x00];
        assert!(AttReq::decode(&pdu).is_err());
    }

    #[test]
    fn encode_decode_round_trip() {
        let req = AttReq::WriteCmd {
            handle: 7,
            data: &[1, 2, 3],
        };
        let mut buf = [0u8; 16];
        let len = req.encode(&mut buf).unwrap();
        assert_eq!(len, req.size());
        assert_eq!(AttReq::decode(&buf[..len]).unwrap(), req);
    }
}
