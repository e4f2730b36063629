use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

use super::memory::{ArenaId, VirtualMemoryStore};
use super::ServerOptions;
use crate::connection::iso::{
    OFFSET_COTP_TYPE, PDU_TYPE_CC, PDU_TYPE_CR, PDU_TYPE_DC, PDU_TYPE_DR,
};
use crate::errors::{Error, Result};
use crate::s7_protocol::header::{
    put_header, ACK_HEADER_LEN, JOB_HEADER_LEN, OFFSET_FUNCTION, OFFSET_ITEM_COUNT,
    OFFSET_PDU_REF, OFFSET_ROSCTR, ROSCTR_ACK_DATA, ROSCTR_JOB,
};
use crate::s7_protocol::types::{
    DataItemTransportSize, RequestItem, S7DataTypes, ITEM_SUCCESS, READ_OPERATION,
    SETUP_COMMUNICATION, WRITE_OPERATION,
};

const STATUS_ACCESS_DENIED: u8 = 0x03;
const STATUS_OUT_OF_RANGE: u8 = 0x05;
const STATUS_TYPE_NOT_SUPPORTED: u8 = 0x06;
const STATUS_NO_OBJECT: u8 = 0x0A;

const OFFSET_FIRST_ITEM: usize = OFFSET_ITEM_COUNT + 1;

/// Handshake progress of one server connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    AwaitingHandshake1,
    AwaitingHandshake2,
    Serving,
}

/// What the connection loop does with a handled frame
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Reply(BytesMut),
    ReplyAndClose(BytesMut),
    Close,
}

/// Answers the frames of every connection against the shared memory arenas
#[derive(Debug, Clone)]
pub(crate) struct RequestDispatcher {
    memory: Arc<VirtualMemoryStore>,
    pdu_size: u16,
    write_enabled: bool,
    served: Arc<AtomicU64>,
}

impl RequestDispatcher {
    pub(crate) fn new(
        memory: Arc<VirtualMemoryStore>,
        options: &ServerOptions,
        served: Arc<AtomicU64>,
    ) -> Self {
        Self {
            memory,
            pdu_size: options.pdu_size,
            write_enabled: options.write_enabled,
            served,
        }
    }

    pub(crate) fn handle(&self, state: &mut ConnectionState, frame: &[u8]) -> Outcome {
        let cotp_type = frame.get(OFFSET_COTP_TYPE).copied();
        if cotp_type == Some(PDU_TYPE_DR) {
            debug!("disconnect requested");
            return Outcome::ReplyAndClose(disconnect_confirm());
        }

        match *state {
            ConnectionState::AwaitingHandshake1 if cotp_type == Some(PDU_TYPE_CR) => {
                *state = ConnectionState::AwaitingHandshake2;
                Outcome::Reply(connection_confirm())
            }
            ConnectionState::AwaitingHandshake2
                if is_job(frame) && frame[OFFSET_FUNCTION] == SETUP_COMMUNICATION =>
            {
                *state = ConnectionState::Serving;
                Outcome::Reply(setup_communication_ack(pdu_ref(frame), self.pdu_size))
            }
            ConnectionState::Serving => match self.serve(frame) {
                Ok(reply) => {
                    self.served.fetch_add(1, Ordering::Relaxed);
                    Outcome::Reply(reply)
                }
                Err(err) => {
                    warn!(%err, "dropping connection after an undecodable request");
                    Outcome::Close
                }
            },
            _ => {
                warn!(?state, frame = %hex::encode_upper(frame), "unexpected handshake frame");
                Outcome::Close
            }
        }
    }

    fn serve(&self, frame: &[u8]) -> Result<BytesMut> {
        if !is_job(frame) {
            return Err(Error::length_check("Not an S7 job", frame));
        }
        match frame[OFFSET_FUNCTION] {
            READ_OPERATION => self.read(frame),
            WRITE_OPERATION => self.write(frame),
            function => Err(Error::length_check(
                format!("Unsupported function 0x{function:02X}"),
                frame,
            )),
        }
    }

    fn read(&self, frame: &[u8]) -> Result<BytesMut> {
        let items = request_items(frame)?;

        let mut data = BytesMut::new();
        for (i, item) in items.iter().enumerate() {
            self.read_item(item, &mut data);
            // every item but the last starts at an even offset
            if i + 1 < items.len() && data.len() % 2 != 0 {
                data.put_u8(0x00);
            }
        }

        ack(frame, READ_OPERATION, items.len(), &data)
    }

    fn read_item(&self, item: &RequestItem, data: &mut BytesMut) {
        let arena = match ArenaId::resolve_code(item.area, item.db_number) {
            Ok(arena) => arena,
            Err(_) => return put_failed_item(data, STATUS_NO_OBJECT),
        };
        let address = item.address as usize;
        let length = usize::from(item.data_length);

        let result = match (arena, S7DataTypes::from_code(item.var_type)) {
            (ArenaId::Counter | ArenaId::Timer, _) => {
                let record_len = if arena == ArenaId::Counter { 3 } else { 5 };
                self.memory
                    .read(arena, address * 2, length * 2)
                    .and_then(|words| {
                        let mut records = Vec::with_capacity(length * record_len);
                        for word in words.chunks_exact(2) {
                            records.resize(records.len() + record_len - 2, 0);
                            records.extend_from_slice(word);
                        }
                        put_item(data, DataItemTransportSize::OctetString, records.len(), &records)
                    })
            }
            (_, Some(S7DataTypes::S7BIT)) => self
                .memory
                .get_bit(arena, address)
                .and_then(|bit| put_item(data, DataItemTransportSize::Bit, 1, &[u8::from(bit)])),
            (_, Some(S7DataTypes::S7BYTE)) => self
                .memory
                .read(arena, address / 8, length)
                .and_then(|bytes| put_item(data, DataItemTransportSize::Byte, length * 8, &bytes)),
            _ => return put_failed_item(data, STATUS_TYPE_NOT_SUPPORTED),
        };

        if let Err(err) = result {
            debug!(%err, "read item failed");
            put_failed_item(data, item_status(&err));
        }
    }

    fn write(&self, frame: &[u8]) -> Result<BytesMut> {
        let items = request_items(frame)?;
        let param_len = usize::from(u16::from_be_bytes([frame[13], frame[14]]));

        // decode everything before touching the arenas
        let mut cursor = JOB_HEADER_LEN + param_len;
        let mut payloads = Vec::with_capacity(items.len());
        for i in 0..items.len() {
            let Some(&[_, tag, len_hi, len_lo]) = frame.get(cursor..cursor + 4) else {
                return Err(Error::length_check("Write data item missing", frame));
            };
            let transport_size = DataItemTransportSize::from(tag);
            let payload_len = transport_size.payload_len(u16::from_be_bytes([len_hi, len_lo]));
            let payload = frame
                .get(cursor + 4..cursor + 4 + payload_len)
                .ok_or_else(|| Error::length_check("Write data item truncated", frame))?;
            payloads.push((transport_size, payload));

            cursor += 4 + payload_len;
            if i + 1 < items.len() && payload_len % 2 != 0 {
                cursor += 1;
            }
        }

        let statuses: Vec<u8> = items
            .iter()
            .zip(payloads)
            .map(|(item, (transport_size, payload))| {
                match self.write_item(item, transport_size, payload) {
                    Ok(()) => ITEM_SUCCESS,
                    Err(err) => {
                        debug!(%err, "write item failed");
                        item_status(&err)
                    }
                }
            })
            .collect();

        ack(frame, WRITE_OPERATION, items.len(), &statuses)
    }

    fn write_item(
        &self,
        item: &RequestItem,
        transport_size: DataItemTransportSize,
        payload: &[u8],
    ) -> Result<()> {
        if !self.write_enabled {
            return Err(Error::WriteDisabled);
        }
        let arena = ArenaId::resolve_code(item.area, item.db_number)?;
        let address = item.address as usize;

        match (arena, transport_size) {
            (ArenaId::Counter | ArenaId::Timer, _) => {
                self.memory.write(arena, address * 2, payload);
                Ok(())
            }
            (_, DataItemTransportSize::Bit) => match payload.first() {
                Some(value) => self.memory.set_bit(arena, address, value & 0x01 != 0),
                None => Err(Error::InvalidValue("bit write without a value".to_string())),
            },
            (_, DataItemTransportSize::Byte | DataItemTransportSize::OctetString) => {
                self.memory.write(arena, address / 8, payload);
                Ok(())
            }
            (_, DataItemTransportSize::Null) => {
                Err(Error::InvalidValue("unknown transport size".to_string()))
            }
        }
    }
}

fn is_job(frame: &[u8]) -> bool {
    frame.len() > OFFSET_ITEM_COUNT && frame[7] == 0x32 && frame[OFFSET_ROSCTR] == ROSCTR_JOB
}

fn pdu_ref(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[OFFSET_PDU_REF], frame[OFFSET_PDU_REF + 1]])
}

fn request_items(frame: &[u8]) -> Result<Vec<RequestItem>> {
    let count = usize::from(frame[OFFSET_ITEM_COUNT]);
    (0..count)
        .map(|i| {
            let start = OFFSET_FIRST_ITEM + i * RequestItem::len();
            RequestItem::decode(frame.get(start..).unwrap_or_default())
        })
        .collect()
}

fn item_status(err: &Error) -> u8 {
    match err {
        Error::UnsupportedArea { .. } => STATUS_NO_OBJECT,
        Error::InvalidLength(_) => STATUS_OUT_OF_RANGE,
        Error::WriteDisabled => STATUS_ACCESS_DENIED,
        _ => STATUS_TYPE_NOT_SUPPORTED,
    }
}

fn put_item(
    data: &mut BytesMut,
    transport_size: DataItemTransportSize,
    length: usize,
    payload: &[u8],
) -> Result<()> {
    let length = u16::try_from(length)
        .map_err(|_| Error::InvalidLength(format!("{length} exceeds a single data item")))?;
    data.put_u8(ITEM_SUCCESS);
    data.put_u8(transport_size as u8);
    data.put_u16(length);
    data.put_slice(payload);
    Ok(())
}

fn put_failed_item(data: &mut BytesMut, status: u8) {
    data.put_slice(&[status, 0x00, 0x00, 0x00]);
}

/// Ack-data frame answering the job in `request`
fn ack(request: &[u8], function: u8, count: usize, data: &[u8]) -> Result<BytesMut> {
    let data_len = u16::try_from(data.len())
        .ok()
        .filter(|len| usize::from(*len) + ACK_HEADER_LEN + 2 <= usize::from(u16::MAX))
        .ok_or_else(|| Error::InvalidLength("response exceeds a single frame".to_string()))?;

    let mut bytes = BytesMut::with_capacity(ACK_HEADER_LEN + 2 + data.len());
    put_header(&mut bytes, ROSCTR_ACK_DATA, pdu_ref(request), 2, data_len);
    bytes.put_u8(function);
    bytes.put_u8(count as u8);
    bytes.put_slice(data);
    Ok(bytes)
}

fn connection_confirm() -> BytesMut {
    BytesMut::from(
        &[
            0x03, 0x00, 0x00, 0x16, 0x11, PDU_TYPE_CC, 0x00, 0x01, 0x00, 0x0C, 0x00, 0xC0, 0x01,
            0x0A, 0xC1, 0x02, 0x01, 0x02, 0xC2, 0x02, 0x01, 0x00,
        ][..],
    )
}

fn setup_communication_ack(pdu_ref: u16, pdu_size: u16) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(27);
    put_header(&mut bytes, ROSCTR_ACK_DATA, pdu_ref, 8, 0);
    bytes.put_u8(SETUP_COMMUNICATION);
    bytes.put_u8(0x00);
    bytes.put_u16(1); // max AMQ calling
    bytes.put_u16(1); // max AMQ called
    bytes.put_u16(pdu_size);
    bytes
}

fn disconnect_confirm() -> BytesMut {
    BytesMut::from(&[0x03, 0x00, 0x00, 0x0B, 0x06, PDU_TYPE_DC, 0x00, 0x01, 0x00, 0x01, 0x80][..])
}

/// In-process exchange straight into a dispatcher, for protocol tests
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct Loopback {
    dispatcher: RequestDispatcher,
    state: ConnectionState,
    pdu_length: u16,
    pdu_ref: u16,
    item_counts: Vec<u8>,
}

#[cfg(test)]
impl Loopback {
    pub(crate) fn new(pdu_length: u16) -> Self {
        Self::with_options(pdu_length, ServerOptions::default())
    }

    pub(crate) fn read_only(pdu_length: u16) -> Self {
        Self::with_options(pdu_length, ServerOptions::default().write_enabled(false))
    }

    fn with_options(pdu_length: u16, options: ServerOptions) -> Self {
        Self {
            dispatcher: RequestDispatcher::new(
                Arc::new(VirtualMemoryStore::new()),
                &options,
                Arc::default(),
            ),
            state: ConnectionState::Serving,
            pdu_length,
            pdu_ref: 0,
            item_counts: Vec::new(),
        }
    }

    pub(crate) fn memory(&self) -> &VirtualMemoryStore {
        &self.dispatcher.memory
    }

    pub(crate) fn exchanges(&self) -> usize {
        self.item_counts.len()
    }

    pub(crate) fn item_counts(&self) -> Vec<u8> {
        self.item_counts.clone()
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl crate::connection::Exchange for Loopback {
    fn pdu_length(&self) -> u16 {
        self.pdu_length
    }

    fn next_pdu_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    async fn exchange(&mut self, request: BytesMut) -> Result<BytesMut> {
        self.item_counts.push(request[OFFSET_ITEM_COUNT]);
        match self.dispatcher.handle(&mut self.state, &request) {
            Outcome::Reply(reply) | Outcome::ReplyAndClose(reply) => Ok(reply),
            Outcome::Close => Err(Error::Connection("closed by the server".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::iso::{
        connection_request, disconnect_request, negotiated_pdu_length, setup_communication,
    };
    use crate::s7_protocol::address::AddressSpec;
    use crate::s7_protocol::read_area::build_read_command;
    use crate::s7_protocol::response::analyze_read;
    use crate::S7Types;

    fn dispatcher(options: &ServerOptions) -> RequestDispatcher {
        RequestDispatcher::new(
            Arc::new(VirtualMemoryStore::new()),
            options,
            Arc::default(),
        )
    }

    #[test]
    fn handshake_state_machine() {
        let dispatcher = dispatcher(&ServerOptions::default().pdu_size(228));
        let mut state = ConnectionState::AwaitingHandshake1;

        let Outcome::Reply(confirm) =
            dispatcher.handle(&mut state, &connection_request(S7Types::S71200, 0x0100, 0x0100))
        else {
            panic!("no connection confirm");
        };
        assert_eq!(confirm[OFFSET_COTP_TYPE], PDU_TYPE_CC);
        assert_eq!(state, ConnectionState::AwaitingHandshake2);

        let Outcome::Reply(ack) =
            dispatcher.handle(&mut state, &setup_communication(S7Types::S71200))
        else {
            panic!("no setup ack");
        };
        assert_eq!(ack.len(), 27);
        assert_eq!(&ack[11..13], &[0x04, 0x00]);
        assert_eq!(negotiated_pdu_length(&ack), Ok(200));
        assert_eq!(state, ConnectionState::Serving);

        let Outcome::ReplyAndClose(confirm) = dispatcher.handle(&mut state, &disconnect_request())
        else {
            panic!("no disconnect confirm");
        };
        assert_eq!(confirm[OFFSET_COTP_TYPE], PDU_TYPE_DC);
    }

    #[test]
    fn out_of_order_frames_close_the_connection() {
        let dispatcher = dispatcher(&ServerOptions::default());
        let mut state = ConnectionState::AwaitingHandshake1;
        assert_eq!(
            dispatcher.handle(&mut state, &setup_communication(S7Types::S7300)),
            Outcome::Close
        );

        let mut state = ConnectionState::Serving;
        let mut garbage = setup_communication(S7Types::S7300).to_vec();
        garbage[OFFSET_FUNCTION] = 0x29;
        assert_eq!(dispatcher.handle(&mut state, &garbage), Outcome::Close);

        let mut truncated = build_read_command(
            &[AddressSpec::parse("M0", 1).unwrap(); 2],
            1,
        )
        .unwrap();
        truncated.truncate(30);
        assert_eq!(dispatcher.handle(&mut state, &truncated), Outcome::Close);
        assert_eq!(dispatcher.served.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn read_past_the_arena_end() {
        let dispatcher = dispatcher(&ServerOptions::default());
        let mut state = ConnectionState::Serving;
        let items = [AddressSpec::parse("DB1.65535", 2).unwrap()];

        let request = build_read_command(&items, 3).unwrap();
        let Outcome::Reply(reply) = dispatcher.handle(&mut state, &request) else {
            panic!("no reply");
        };
        assert_eq!(&reply[11..13], &[0x00, 0x03]);
        assert_eq!(analyze_read(&reply, &items), Err(Error::status(STATUS_OUT_OF_RANGE)));
        assert_eq!(dispatcher.served.load(Ordering::Relaxed), 1);
    }
}
