use bytes::{BufMut, BytesMut};
use tracing::debug;

use super::address::AddressSpec;
use super::header::{put_header, JOB_HEADER_LEN, ROSCTR_JOB};
use super::read_area::split_transfer;
use super::response::analyze_write;
use super::types::{DataItemTransportSize, RequestItem, S7DataTypes, WRITE_OPERATION};
use crate::connection::Exchange;
use crate::errors::{Error, Result};

/// Function, item count and one descriptor
const WRITE_PARAM_LEN: usize = 14;
/// Reserved byte, transport size and length in front of the payload
const DATA_ITEM_HEADER_LEN: usize = 4;

/// Write job for `data`, `spec.length` must describe the same number of bytes
pub(crate) fn build_write_command(
    spec: &AddressSpec,
    data: &[u8],
    pdu_ref: u16,
) -> Result<BytesMut> {
    if data.is_empty() || spec.byte_len() != data.len() {
        return Err(Error::InvalidLength(format!(
            "{} bytes do not match the {} bytes addressed at {spec}",
            data.len(),
            spec.byte_len()
        )));
    }
    // counters and timers count bytes, everything else bits
    let (transport_size, length) = if spec.area.is_word_area() {
        (DataItemTransportSize::OctetString, data.len())
    } else {
        (DataItemTransportSize::Byte, data.len() * 8)
    };
    let length = u16::try_from(length).map_err(|_| {
        Error::InvalidLength(format!("{} bytes exceed a single write job", data.len()))
    })?;

    Ok(write_job(
        &RequestItem::from_spec(spec)?,
        transport_size,
        length,
        data,
        pdu_ref,
    ))
}

/// Write job setting a single bit
pub(crate) fn build_write_bit_command(
    spec: &AddressSpec,
    value: bool,
    pdu_ref: u16,
) -> Result<BytesMut> {
    if spec.area.is_word_area() {
        return Err(Error::address(
            &spec.to_string(),
            "counters and timers have no bit access",
        ));
    }
    let item = RequestItem {
        var_type: S7DataTypes::S7BIT as u8,
        data_length: 1,
        ..RequestItem::from_spec(spec)?
    };
    Ok(write_job(
        &item,
        DataItemTransportSize::Bit,
        1,
        &[u8::from(value)],
        pdu_ref,
    ))
}

fn write_job(
    item: &RequestItem,
    transport_size: DataItemTransportSize,
    length: u16,
    payload: &[u8],
    pdu_ref: u16,
) -> BytesMut {
    let data_len = DATA_ITEM_HEADER_LEN + payload.len();
    let mut bytes = BytesMut::with_capacity(JOB_HEADER_LEN + WRITE_PARAM_LEN + data_len);
    put_header(
        &mut bytes,
        ROSCTR_JOB,
        pdu_ref,
        WRITE_PARAM_LEN as u16,
        data_len as u16,
    );
    bytes.put_u8(WRITE_OPERATION);
    bytes.put_u8(1);
    item.put(&mut bytes);

    bytes.put_u8(0x00);
    bytes.put_u8(transport_size as u8);
    bytes.put_u16(length);
    bytes.put_slice(payload);
    bytes
}

/// Write `data` starting at `spec`, split over as many jobs as the PDU length requires
pub(crate) async fn write_area<E: Exchange>(
    ex: &mut E,
    spec: AddressSpec,
    data: &[u8],
) -> Result<()> {
    let rounds = split_transfer(spec, data.len(), ex.pdu_length())?;

    let mut offset = 0;
    for round in rounds {
        let chunk = &data[offset..offset + round.byte_len()];
        debug!(address = %round, bytes = chunk.len(), "write");
        let request = build_write_command(&round, chunk, ex.next_pdu_ref())?;
        let response = ex.exchange(request).await?;
        analyze_write(&response)?;
        offset += chunk.len();
    }
    Ok(())
}

/// Set or clear the single bit addressed by `spec`
pub(crate) async fn write_bit<E: Exchange>(
    ex: &mut E,
    spec: &AddressSpec,
    value: bool,
) -> Result<()> {
    debug!(address = %spec, value, "write bit");
    let request = build_write_bit_command(spec, value, ex.next_pdu_ref())?;
    let response = ex.exchange(request).await?;
    analyze_write(&response)
}
