//! Attribute protocol request dispatcher.

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::att::{self, AttErrorCode, AttReq};
use crate::attribute::AttributeTable;
use crate::cursor::WriteCursor;
use crate::pool::{BufferPool, ResponseBuffer};
use crate::{Error, ATT_MTU};

/// Default MTU before an exchange has taken place.
pub(crate) const DEFAULT_MTU: u16 = 23;

/// Outbound path to the link layer.
///
/// `send_pooled` takes the buffer by value; the transport hands it back to
/// the pool by dropping it once the bytes are queued.
pub trait Transport {
    /// Error type of the link layer.
    type Error;

    /// Queue a response PDU for the given connection.
    fn send(&mut self, conn_id: u16, pdu: &[u8]) -> Result<(), Self::Error>;

    /// Queue a pooled response PDU for the given connection.
    fn send_pooled(&mut self, conn_id: u16, rsp: ResponseBuffer<'_>) -> Result<(), Self::Error>;

    /// Queue an unsolicited handle/value notification.
    fn notify(&mut self, conn_id: u16, handle: u16, value: &[u8]) -> Result<(), Self::Error>;
}

/// A request dispatcher over an attribute table.
///
/// Each request produces at most one response PDU. Protocol violations are
/// answered with an error response and never surface as a crate error; only
/// local failures (transport, codec) do.
pub struct AttributeServer<'d, M: RawMutex, const MAX: usize> {
    table: AttributeTable<'d, M, MAX>,
    mtu: Mutex<M, Cell<u16>>,
}

impl<'d, M: RawMutex, const MAX: usize> AttributeServer<'d, M, MAX> {
    /// Create a dispatcher over the given table.
    pub fn new(table: AttributeTable<'d, M, MAX>) -> Self {
        Self {
            table,
            mtu: Mutex::new(Cell::new(DEFAULT_MTU)),
        }
    }

    /// The underlying attribute table.
    pub fn table(&self) -> &AttributeTable<'d, M, MAX> {
        &self.table
    }

    /// Currently negotiated MTU.
    pub fn mtu(&self) -> u16 {
        self.mtu.lock(|mtu| mtu.get())
    }

    /// Forget the negotiated MTU. Called on disconnect; MTU exchange is per
    /// connection.
    pub fn reset_mtu(&self) {
        self.mtu.lock(|mtu| mtu.set(DEFAULT_MTU));
    }

    /// Handle one inbound request, producing at most one outbound PDU.
    ///
    /// Returns the written handle when the request was a write that the
    /// table accepted, so the caller can run its post-write hooks.
    pub fn process<T: Transport, const N: usize>(
        &self,
        conn_id: u16,
        req: &AttReq<'_>,
        pool: &BufferPool<M, N>,
        transport: &mut T,
    ) -> Result<Option<u16>, Error> {
        match req {
            AttReq::ExchangeMtu { mtu } => {
                let effective = (*mtu).min(ATT_MTU as u16);
                self.mtu.lock(|mtu| mtu.set(effective));
                info!("[server] negotiated mtu {}", effective);
                // The response always carries the server's configured MTU;
                // the effective transfer cap is the minimum of the two.
                let rsp = [
                    att::ATT_EXCHANGE_MTU_RSP,
                    ATT_MTU as u8,
                    (ATT_MTU >> 8) as u8,
                ];
                transport.send(conn_id, &rsp).map_err(|_| Error::Transport)?;
                Ok(None)
            }
            AttReq::Read { handle } => {
                self.read_at(conn_id, req.opcode(), *handle, 0, att::ATT_READ_RSP, transport)?;
                Ok(None)
            }
            AttReq::ReadBlob { handle, offset } => {
                self.read_at(
                    conn_id,
                    req.opcode(),
                    *handle,
                    *offset as usize,
                    att::ATT_READ_BLOB_RSP,
                    transport,
                )?;
                Ok(None)
            }
            AttReq::ReadByType {
                start,
                end,
                attribute_type,
            } => {
                self.read_by_type(conn_id, req.opcode(), *start, *end, attribute_type, pool, transport)?;
                Ok(None)
            }
            AttReq::Write { handle, data } => match self.table.write(*handle, data) {
                Ok(()) => {
                    transport
                        .send(conn_id, &[att::ATT_WRITE_RSP])
                        .map_err(|_| Error::Transport)?;
                    Ok(Some(*handle))
                }
                Err(code) => {
                    self.error_response(conn_id, req.opcode(), *handle, code, transport)?;
                    Ok(None)
                }
            },
            AttReq::WriteCmd { handle, data } => {
                // Commands are fire and forget; failures are silent.
                match self.table.write(*handle, data) {
                    Ok(()) => Ok(Some(*handle)),
                    Err(code) => {
                        debug!("[server] write command to {:x} refused: {}", *handle, code);
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Serve a read or read blob from a stack scratch buffer; no pool
    /// allocation on this path.
    fn read_at<T: Transport>(
        &self,
        conn_id: u16,
        opcode: u8,
        handle: u16,
        offset: usize,
        rsp_opcode: u8,
        transport: &mut T,
    ) -> Result<(), Error> {
        let mut pdu = [0u8; ATT_MTU];
        pdu[0] = rsp_opcode;
        let window = (self.mtu() as usize - 1).min(ATT_MTU - 1);
        match self.table.read(handle, offset, &mut pdu[1..1 + window]) {
            Ok(n) => transport.send(conn_id, &pdu[..1 + n]).map_err(|_| Error::Transport),
            Err(code) => self.error_response(conn_id, opcode, handle, code, transport),
        }
    }

    fn read_by_type<T: Transport, const N: usize>(
        &self,
        conn_id: u16,
        opcode: u8,
        start: u16,
        end: u16,
        attribute_type: &crate::types::uuid::Uuid,
        pool: &BufferPool<M, N>,
        transport: &mut T,
    ) -> Result<(), Error> {
        let mtu = self.mtu() as usize;
        let Some(mut rsp) = pool.alloc(mtu) else {
            warn!("[server] response pool exhausted");
            return self.error_response(conn_id, opcode, start, AttErrorCode::InsufficientResources, transport);
        };

        let mut scratch = [0u8; ATT_MTU];
        let mut pair_value_len = None;
        let used = {
            let mut w = WriteCursor::new(rsp.payload_mut());
            let (mut header, mut body) = w.split(2)?;

            let mut next = start;
            loop {
                let Some(handle) = self.table.find_by_type_in_range(next, end, attribute_type) else {
                    break;
                };
                let n = match self.table.read(handle, 0, &mut scratch) {
                    Ok(n) => n,
                    Err(_) => break,
                };
                // All pairs in one response carry the same value length.
                match pair_value_len {
                    None => pair_value_len = Some(n),
                    Some(expected) if expected == n => {}
                    Some(_) => break,
                }
                if body.available() < 2 + n {
                    break;
                }
                body.write(handle)?;
                body.append(&scratch[..n])?;
                next = handle + 1;
            }

            match pair_value_len {
                Some(value_len) if body.len() > 0 => {
                    header.write(att::ATT_READ_BY_TYPE_RSP)?;
                    header.write((2 + value_len) as u8)?;
                    header.len() + body.len()
                }
                _ => 0,
            }
        };

        if used == 0 {
            // Buffer goes back to the pool on drop.
            return self.error_response(conn_id, opcode, start, AttErrorCode::InvalidHandle, transport);
        }
        rsp.truncate(used);
        transport.send_pooled(conn_id, rsp).map_err(|_| Error::Transport)
    }

    fn error_response<T: Transport>(
        &self,
        conn_id: u16,
        opcode: u8,
        handle: u16,
        code: AttErrorCode,
        transport: &mut T,
    ) -> Result<(), Error> {
        let mut pdu = [0u8; 5];
        let mut w = WriteCursor::new(&mut pdu);
        w.write(att::ATT_ERROR_RSP)?;
        w.write(opcode)?;
        w.write(handle)?;
        w.write(code)?;
        transport.send(conn_id, w.finish()).map_err(|_| Error::Transport)
    }
}

#[cfg(test)]
mod tests {
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use super::*;
    use crate::attribute::{AttributeTable, CharacteristicProp, Service};
    use crate::testutil::MockTransport;

    const CONN: u16 = 1;

    fn server<'d>(storage: &'d mut [u8; 8]) -> (AttributeServer<'d, NoopRawMutex, 8>, u16, u16) {
        let mut table: AttributeTable<'_, NoopRawMutex, 8> = AttributeTable::new();
        let mut svc = table.add_service(Service::new(0x181au16));
        let ch = svc
            .add_characteristic(
                0x2b8cu16,
                &[
                    CharacteristicProp::Read,
                    CharacteristicProp::Write,
                    CharacteristicProp::Notify,
                ],
                &mut storage[..],
            )
            .fixed_write_len(8)
            .value(&[0x8a, 0x02])
            .build();
        let cccd = ch.cccd_handle().unwrap();
        (AttributeServer::new(table), ch.handle(), cccd)
    }

    #[test]
    fn read_returns_value() {
        let mut storage = [0u8; 8];
        let (server, value, _) = server(&mut storage);
        let pool: BufferPool<NoopRawMutex, 1> = BufferPool::new();
        let mut transport = MockTransport::new();

        let written = server
            .process(CONN, &AttReq::Read { handle: value }, &pool, &mut transport)
            .unwrap();
        assert_eq!(written, None);
        assert_eq!(transport.sent(), &[&[att::ATT_READ_RSP, 0x8a, 0x02][..]]);
    }

    #[test]
    fn read_blob_resumes_at_offset() {
        let mut storage = [0u8; 8];
        let (server, value, _) = server(&mut storage);
        let pool: BufferPool<NoopRawMutex, 1> = BufferPool::new();
        let mut transport = MockTransport::new();

        server
            .process(CONN, &AttReq::ReadBlob { handle: value, offset: 1 }, &pool, &mut transport)
            .unwrap();
        assert_eq!(transport.sent(), &[&[att::ATT_READ_BLOB_RSP, 0x02][..]]);
    }

    #[test]
    fn read_unknown_handle_answers_error() {
        let mut storage = [0u8; 8];
        let (server, _, _) = server(&mut storage);
        let pool: BufferPool<NoopRawMutex, 1> = BufferPool::new();
        let mut transport = MockTransport::new();

        server
            .process(CONN, &AttReq::Read { handle: 0x42 }, &pool, &mut transport)
            .unwrap();
        assert_eq!(
            transport.sent(),
            &[&[att::ATT_ERROR_RSP, att::ATT_READ_REQ, 0x42, 0x00, 0x01][..]]
        );
    }

    #[test]
    fn write_accepted_reports_handle() {
        let mut storage = [0u8; 8];
        let (server, value, _) = server(&mut storage);
        let pool: BufferPool<NoopRawMutex, 1> = BufferPool::new();
        let mut transport = MockTransport::new();

        let written = server
            .process(
                CONN,
                &AttReq::Write {
                    handle: value,
                    data: &[1, 2, 3, 4, 5, 6, 7, 8],
                },
                &pool,
                &mut transport,
            )
            .unwrap();
        assert_eq!(written, Some(value));
        assert_eq!(transport.sent(), &[&[att::ATT_WRITE_RSP][..]]);
    }

    #[test]
    fn write_wrong_length_answers_error() {
        let mut storage = [0u8; 8];
        let (server, value, _) = server(&mut storage);
        let pool: BufferPool<NoopRawMutex, 1> = BufferPool::new();
        let mut transport = MockTransport::new();

        let written = server
            .process(
                CONN,
                &AttReq::Write {
                    handle: value,
                    data: &[1, 2, 3],
                },
                &pool,
                &mut transport,
            )
            .unwrap();
        assert_eq!(written, None);
        let expected = [
            att::ATT_ERROR_RSP,
            att::ATT_WRITE_REQ,
            value as u8,
            (value >> 8) as u8,
            0x0d,
        ];
        assert_eq!(transport.sent(), &[&expected[..]]);
    }

    #[test]
    fn write_command_is_silent_either_way() {
        let mut storage = [0u8; 8];
        let (server, value, cccd) = server(&mut storage);
        let pool: BufferPool<NoopRawMutex, 1> = BufferPool::new();
        let mut transport = MockTransport::new();

        let written = server
            .process(
                CONN,
                &AttReq::WriteCmd {
                    handle: cccd,
                    data: &[0x01, 0x00],
                },
                &pool,
                &mut transport,
            )
            .unwrap();
        assert_eq!(written, Some(cccd));

        let refused = server
            .process(
                CONN,
                &AttReq::WriteCmd {
                    handle: value,
                    data: &[1],
                },
                &pool,
                &mut transport,
            )
            .unwrap();
        assert_eq!(refused, None);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn exchange_mtu_clamps_to_local_maximum() {
        let mut storage = [0u8; 8];
        let (server, _, _) = server(&mut storage);
        let pool: BufferPool<NoopRawMutex, 1> = BufferPool::new();
        let mut transport = MockTransport::new();

        server
            .process(CONN, &AttReq::ExchangeMtu { mtu: 512 }, &pool, &mut transport)
            .unwrap();
        assert_eq!(server.mtu(), ATT_MTU as u16);

        server
            .process(CONN, &AttReq::ExchangeMtu { mtu: 64 }, &pool, &mut transport)
            .unwrap();
        assert_eq!(server.mtu(), 64);

        // The response carries the configured MTU no matter what the peer
        // offered; only the internal cap tracks the minimum.
        let expected = [att::ATT_EXCHANGE_MTU_RSP, ATT_MTU as u8, (ATT_MTU >> 8) as u8];
        assert_eq!(transport.sent(), &[&expected[..], &expected[..]]);

        server.reset_mtu();
        assert_eq!(server.mtu(), DEFAULT_MTU);
    }

    #[test]
    fn read_by_type_packs_uniform_pairs() {
        let mut a = [0u8; 2];
        let mut b = [0u8; 2];
        let mut table: AttributeTable<'_, NoopRawMutex, 8> = AttributeTable::new();
        let mut svc = table.add_service(Service::new(0x181au16));
        let first = svc
            .add_characteristic(0x2a6eu16, &[CharacteristicProp::Read], &mut a[..])
            .value(&[0x11, 0x22])
            .build();
        let second = svc
            .add_characteristic(0x2a6eu16, &[CharacteristicProp::Read], &mut b[..])
            .value(&[0x33, 0x44])
            .build();
        let server: AttributeServer<'_, NoopRawMutex, 8> = AttributeServer::new(table);
        let pool: BufferPool<NoopRawMutex, 1> = BufferPool::new();
        let mut transport = MockTransport::new();

        server
            .process(
                CONN,
                &AttReq::ReadByType {
                    start: 1,
                    end: 0xffff,
                    attribute_type: crate::types::uuid::Uuid::new_short(0x2a6e),
                },
                &pool,
                &mut transport,
            )
            .unwrap();

        let mut expected = heapless::Vec::<u8, 16>::new();
        expected.extend_from_slice(&[att::ATT_READ_BY_TYPE_RSP, 4]).unwrap();
        expected.extend_from_slice(&first.handle().to_le_bytes()).unwrap();
        expected.extend_from_slice(&[0x11, 0x22]).unwrap();
        expected.extend_from_slice(&second.handle().to_le_bytes()).unwrap();
        expected.extend_from_slice(&[0x33, 0x44]).unwrap();
        assert_eq!(transport.sent(), &[&expected[..]]);
        // The pooled buffer was handed back after transmission.
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn read_by_type_truncates_to_whole_pairs() {
        let mut a = [0u8; 2];
        let mut b = [0u8; 2];
        let mut table: AttributeTable<'_, NoopRawMutex, 8> = AttributeTable::new();
        let mut svc = table.add_service(Service::new(0x181au16));
        let first = svc
            .add_characteristic(0x2a6eu16, &[CharacteristicProp::Read], &mut a[..])
            .value(&[0x11, 0x22])
            .build();
        svc.add_characteristic(0x2a6eu16, &[CharacteristicProp::Read], &mut b[..])
            .value(&[0x33, 0x44])
            .build();
        let server: AttributeServer<'_, NoopRawMutex, 8> = AttributeServer::new(table);
        let pool: BufferPool<NoopRawMutex, 1> = BufferPool::new();
        let mut transport = MockTransport::new();

        // With an 8-byte MTU the body holds one 4-byte pair, not two.
        server
            .process(CONN, &AttReq::ExchangeMtu { mtu: 8 }, &pool, &mut transport)
            .unwrap();
        server
            .process(
                CONN,
                &AttReq::ReadByType {
                    start: 1,
                    end: 0xffff,
                    attribute_type: crate::types::uuid::Uuid::new_short(0x2a6e),
                },
                &pool,
                &mut transport,
            )
            .unwrap();

        let mut expected = heapless::Vec::<u8, 8>::new();
        expected.extend_from_slice(&[att::ATT_READ_BY_TYPE_RSP, 4]).unwrap();
        expected.extend_from_slice(&first.handle().to_le_bytes()).unwrap();
        expected.extend_from_slice(&[0x11, 0x22]).unwrap();
        assert_eq!(transport.sent()[1], expected[..]);
    }

    #[test]
    fn read_by_type_stops_at_a_deviating_value_length() {
        let mut a = [0u8; 2];
        let mut b = [0u8; 3];
        let mut table: AttributeTable<'_, NoopRawMutex, 8> = AttributeTable::new();
        let mut svc = table.add_service(Service::new(0x181au16));
        let first = svc
            .add_characteristic(0x2a6eu16, &[CharacteristicProp::Read], &mut a[..])
            .value(&[0x11, 0x22])
            .build();
        svc.add_characteristic(0x2a6eu16, &[CharacteristicProp::Read], &mut b[..])
            .value(&[0x33, 0x44, 0x55])
            .build();
        let server: AttributeServer<'_, NoopRawMutex, 8> = AttributeServer::new(table);
        let pool: BufferPool<NoopRawMutex, 1> = BufferPool::new();
        let mut transport = MockTransport::new();

        server
            .process(
                CONN,
                &AttReq::ReadByType {
                    start: 1,
                    end: 0xffff,
                    attribute_type: crate::types::uuid::Uuid::new_short(0x2a6e),
                },
                &pool,
                &mut transport,
            )
            .unwrap();

        // The 3-byte record does not match the established pair length, so
        // the response ends with the first pair.
        let mut expected = heapless::Vec::<u8, 8>::new();
        expected.extend_from_slice(&[att::ATT_READ_BY_TYPE_RSP, 4]).unwrap();
        expected.extend_from_slice(&first.handle().to_le_bytes()).unwrap();
        expected.extend_from_slice(&[0x11, 0x22]).unwrap();
        assert_eq!(transport.sent(), &[&expected[..]]);
    }

    #[test]
    fn read_by_type_with_no_match_answers_invalid_handle() {
        let mut storage = [0u8; 8];
        let (server, _, _) = server(&mut storage);
        let pool: BufferPool<NoopRawMutex, 1> = BufferPool::new();
        let mut transport = MockTransport::new();

        server
            .process(
                CONN,
                &AttReq::ReadByType {
                    start: 1,
                    end: 0xffff,
                    attribute_type: crate::types::uuid::Uuid::new_short(0x2a6e),
                },
                &pool,
                &mut transport,
            )
            .unwrap();
        assert_eq!(
            transport.sent(),
            &[&[att::ATT_ERROR_RSP, att::ATT_READ_BY_TYPE_REQ, 0x01, 0x00, 0x01][..]]
        );
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn read_by_type_without_buffers_answers_insufficient_resources() {
        let mut storage = [0u8; 8];
        let (server, _, _) = server(&mut storage);
        let pool: BufferPool<NoopRawMutex, 1> = BufferPool::new();
        let held = pool.alloc(16).unwrap();
        let mut transport = MockTransport::new();

        server
            .process(
                CONN,
                &AttReq::ReadByType {
                    start: 1,
                    end: 0xffff,
                    attribute_type: crate::types::uuid::Uuid::new_short(0x2b8c),
                },
                &pool,
                &mut transport,
            )
            .unwrap();
        assert_eq!(
            transport.sent(),
            &[&[att::ATT_ERROR_RSP, att::ATT_READ_BY_TYPE_REQ, 0x01, 0x00, 0x11][..]]
        );
        drop(held);
    }
}
