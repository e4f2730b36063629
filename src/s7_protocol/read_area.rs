use bytes::{BufMut, BytesMut};
use tracing::debug;

use super::address::AddressSpec;
use super::header::{put_header, JOB_HEADER_LEN, ROSCTR_JOB};
use super::response::{analyze_read, analyze_read_bit};
use super::types::{Area, RequestItem, S7DataTypes, MAX_ITEMS_PER_REQUEST, READ_OPERATION};
use crate::connection::Exchange;
use crate::errors::{Error, Result};

/// Status, transport size and length in front of every payload of a read response
const ITEM_HEADER_LEN: usize = 4;

impl RequestItem {
    pub(crate) fn from_spec(spec: &AddressSpec) -> Result<Self> {
        spec.check_wire_address()?;
        Ok(Self {
            var_type: spec.area.transport_unit() as u8,
            data_length: spec.length,
            db_number: spec.db_number,
            area: spec.area.code(),
            address: spec.start,
        })
    }

    fn bit(spec: &AddressSpec) -> Result<Self> {
        if spec.area.is_word_area() {
            return Err(Error::address(
                &spec.to_string(),
                "counters and timers have no bit access",
            ));
        }
        Ok(Self {
            var_type: S7DataTypes::S7BIT as u8,
            data_length: 1,
            ..Self::from_spec(spec)?
        })
    }
}

/// Read job with one descriptor per item, at most 19 items
pub(crate) fn build_read_command(items: &[AddressSpec], pdu_ref: u16) -> Result<BytesMut> {
    if items.is_empty() || items.len() > MAX_ITEMS_PER_REQUEST {
        return Err(Error::InvalidLength(format!(
            "a read job carries 1 to {MAX_ITEMS_PER_REQUEST} items, got {}",
            items.len()
        )));
    }
    let request_items = items
        .iter()
        .map(|item| {
            if item.length == 0 {
                return Err(Error::InvalidLength(format!("nothing to read at {item}")));
            }
            RequestItem::from_spec(item)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(read_job(&request_items, pdu_ref))
}

/// Read job for a single bit
pub(crate) fn build_read_bit_command(spec: &AddressSpec, pdu_ref: u16) -> Result<BytesMut> {
    Ok(read_job(&[RequestItem::bit(spec)?], pdu_ref))
}

fn read_job(items: &[RequestItem], pdu_ref: u16) -> BytesMut {
    let param_len = 2 + RequestItem::len() * items.len();
    let mut bytes = BytesMut::with_capacity(JOB_HEADER_LEN + param_len);
    put_header(&mut bytes, ROSCTR_JOB, pdu_ref, param_len as u16, 0);
    bytes.put_u8(READ_OPERATION);
    bytes.put_u8(items.len() as u8);
    for item in items {
        item.put(&mut bytes);
    }
    bytes
}

/// Split a transfer of `total` bytes into rounds of at most `pdu_length` bytes.
///
/// Each round starts where the previous one ended: counters and timers move
/// by `sent / 2` words, every other area by `sent * 8` bits.
pub(crate) fn split_transfer(
    spec: AddressSpec,
    total: usize,
    pdu_length: u16,
) -> Result<Vec<AddressSpec>> {
    if total == 0 {
        return Err(Error::InvalidLength(format!("nothing to transfer at {spec}")));
    }
    if spec.area.is_word_area() && total % 2 != 0 {
        return Err(Error::InvalidLength(format!(
            "counters and timers are transferred in words, {total} bytes requested"
        )));
    }

    let mut round_len = usize::from(pdu_length);
    if spec.area.is_word_area() {
        round_len -= round_len % 2;
    }

    let mut cursor = spec;
    let mut rounds = Vec::with_capacity(total.div_ceil(round_len));
    let mut remaining = total;
    while remaining > 0 {
        let sent = remaining.min(round_len);
        let mut round = cursor;
        round.set_byte_len(sent)?;
        round.check_wire_address()?;
        rounds.push(round);

        cursor.advance(sent);
        remaining -= sent;
    }
    Ok(rounds)
}

/// Bytes `item` takes in the data section of a read response, fill byte included
fn response_len(item: &AddressSpec) -> usize {
    let payload = match item.area {
        Area::Counter => usize::from(item.length) * 3,
        Area::Timer => usize::from(item.length) * 5,
        _ => item.byte_len(),
    };
    ITEM_HEADER_LEN + payload + payload % 2
}

/// Group `items` in order into jobs of at most 19 items whose responses fit the PDU.
///
/// One response carries at most `pdu_length` payload bytes plus one item
/// header, which is the largest round of a split transfer.
fn batches(items: &[AddressSpec], pdu_length: u16) -> Result<Vec<&[AddressSpec]>> {
    let budget = usize::from(pdu_length) + ITEM_HEADER_LEN;
    let mut batches = Vec::new();
    let mut first = 0;
    let mut used = 0;
    for (i, item) in items.iter().enumerate() {
        let len = response_len(item);
        if len > budget {
            return Err(Error::InvalidLength(format!(
                "the response for {item} exceeds the PDU length of {pdu_length} bytes"
            )));
        }
        if i - first == MAX_ITEMS_PER_REQUEST || used + len > budget {
            batches.push(&items[first..i]);
            first = i;
            used = 0;
        }
        used += len;
    }
    if first < items.len() {
        batches.push(&items[first..]);
    }
    Ok(batches)
}

/// Read `bytes` bytes starting at `spec`, split over as many jobs as the PDU length requires
pub(crate) async fn read_area<E: Exchange>(
    ex: &mut E,
    spec: AddressSpec,
    bytes: usize,
) -> Result<Vec<u8>> {
    let rounds = split_transfer(spec, bytes, ex.pdu_length())?;

    let mut buffer = Vec::with_capacity(bytes);
    for round in rounds {
        debug!(address = %round, bytes = round.byte_len(), "read");
        let request = build_read_command(&[round], ex.next_pdu_ref())?;
        let response = ex.exchange(request).await?;
        buffer.extend(analyze_read(&response, &[round])?);
    }
    Ok(buffer)
}

/// Read several items, at most 19 per job, and concatenate their payloads in order.
///
/// A job takes fewer items when their responses would not fit the PDU. The
/// first failing job aborts the call.
pub(crate) async fn read_area_multi<E: Exchange>(
    ex: &mut E,
    items: &[AddressSpec],
) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(items.iter().map(AddressSpec::byte_len).sum());
    for chunk in batches(items, ex.pdu_length())? {
        debug!(items = chunk.len(), "read multiple items");
        let request = build_read_command(chunk, ex.next_pdu_ref())?;
        let response = ex.exchange(request).await?;
        buffer.extend(analyze_read(&response, chunk)?);
    }
    Ok(buffer)
}

/// Read the single bit addressed by `spec`
pub(crate) async fn read_bit<E: Exchange>(ex: &mut E, spec: &AddressSpec) -> Result<bool> {
    debug!(address = %spec, "read bit");
    let request = build_read_bit_command(spec, ex.next_pdu_ref())?;
    let response = ex.exchange(request).await?;
    analyze_read_bit(&response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::dispatcher::Loopback;
    use crate::server::memory::ArenaId;

    fn spec(text: &str, length: u16) -> AddressSpec {
        AddressSpec::parse(text, length).unwrap()
    }

    #[test]
    fn read_frame_layout() {
        let frame = build_read_command(&[spec("DB20.40.3", 4), spec("T5", 2)], 7).unwrap();
        assert_eq!(frame.len(), 17 + 2 + 24);
        assert_eq!(&frame[2..4], &[0x00, 0x2B]);
        assert_eq!(&frame[11..17], &[0x00, 0x07, 0x00, 0x1A, 0x00, 0x00]);
        assert_eq!(&frame[17..19], &[0x04, 0x02]);
        assert_eq!(
            &frame[19..31],
            &[0x12, 0x0A, 0x10, 0x02, 0x00, 0x04, 0x00, 0x14, 0x84, 0x00, 0x01, 0x43]
        );
        assert_eq!(
            &frame[31..43],
            &[0x12, 0x0A, 0x10, 0x1D, 0x00, 0x02, 0x00, 0x00, 0x1D, 0x00, 0x00, 0x05]
        );
    }

    #[test]
    fn bit_frame_layout() {
        let frame = build_read_bit_command(&spec("M100.3", 1), 1).unwrap();
        assert_eq!(
            &frame[19..31],
            &[0x12, 0x0A, 0x10, 0x01, 0x00, 0x01, 0x00, 0x00, 0x83, 0x00, 0x03, 0x23]
        );
        assert!(build_read_bit_command(&spec("C1", 1), 1).is_err());
    }

    #[test]
    fn item_count_is_bounded() {
        let items = vec![spec("M0", 1); MAX_ITEMS_PER_REQUEST + 1];
        assert!(matches!(
            build_read_command(&items, 1),
            Err(Error::InvalidLength(_))
        ));
        assert!(build_read_command(&items[..MAX_ITEMS_PER_REQUEST], 1).is_ok());
        assert!(build_read_command(&[], 1).is_err());
        assert!(build_read_command(&[spec("M0", 0)], 1).is_err());
    }

    #[test]
    fn split_advances_the_cursor() {
        let rounds = split_transfer(spec("DB1.0", 0), 1000, 200).unwrap();
        assert_eq!(rounds.len(), 5);
        for (i, round) in rounds.iter().enumerate() {
            assert_eq!(round.length, 200);
            assert_eq!(round.byte_offset() as usize, i * 200);
        }

        let rounds = split_transfer(spec("M10", 0), 450, 200).unwrap();
        assert_eq!(
            rounds.iter().map(|r| r.length).collect::<Vec<_>>(),
            vec![200, 200, 50]
        );
        assert_eq!(rounds[2].start, (10 + 400) * 8);

        let timers = split_transfer(spec("T10", 0), 500, 201).unwrap();
        assert_eq!(
            timers.iter().map(|r| (r.start, r.length)).collect::<Vec<_>>(),
            vec![(10, 100), (110, 100), (210, 50)]
        );

        assert!(split_transfer(spec("C0", 0), 3, 200).is_err());
        assert!(split_transfer(spec("M0", 0), 0, 200).is_err());
    }

    #[tokio::test]
    async fn long_reads_are_split() {
        let mut ex = Loopback::new(200);
        let pattern: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        ex.memory().write(ArenaId::Db1, 0, &pattern);

        let data = read_area(&mut ex, spec("DB1.0", 0), 1000).await.unwrap();
        assert_eq!(ex.exchanges(), 5);
        assert_eq!(data, ex.memory().read(ArenaId::Db1, 0, 1000).unwrap());
    }

    #[tokio::test]
    async fn many_items_are_batched() {
        let mut ex = Loopback::new(480);
        let pattern: Vec<u8> = (0..45).collect();
        ex.memory().write(ArenaId::Memory, 0, &pattern);

        let items: Vec<AddressSpec> = (0..45).map(|i| spec(&format!("M{i}"), 1)).collect();
        let batched = read_area_multi(&mut ex, &items).await.unwrap();
        assert_eq!(ex.exchanges(), 3);
        assert_eq!(ex.item_counts(), vec![19, 19, 7]);

        let mut single = Vec::new();
        for item in &items {
            single.extend(read_area_multi(&mut ex, &[*item]).await.unwrap());
        }
        assert_eq!(batched, single);
        assert_eq!(batched, pattern);
    }

    #[tokio::test]
    async fn first_failing_batch_aborts() {
        let mut ex = Loopback::new(480);
        let mut items: Vec<AddressSpec> = (0..20).map(|i| spec(&format!("M{i}"), 1)).collect();
        items.push(spec("AI0", 1));
        items.extend((0..19).map(|i| spec(&format!("M{i}"), 1)));

        let result = read_area_multi(&mut ex, &items).await;
        assert_eq!(result, Err(Error::status(0x0A)));
        assert_eq!(ex.exchanges(), 2);
    }

    #[tokio::test]
    async fn counters_and_timers_round_trip_words() {
        let mut ex = Loopback::new(480);
        ex.memory().write(ArenaId::Counter, 4, &[0x00, 0x2A, 0x01, 0x00]);
        ex.memory().write(ArenaId::Timer, 0, &[0x12, 0x34]);

        let data = read_area_multi(&mut ex, &[spec("C2", 2), spec("T0", 1)])
            .await
            .unwrap();
        assert_eq!(data, vec![0x00, 0x2A, 0x01, 0x00, 0x12, 0x34]);
    }

    #[tokio::test]
    async fn single_bits() {
        let mut ex = Loopback::new(480);
        ex.memory().write(ArenaId::Input, 3, &[0b0000_0100]);
        assert!(read_bit(&mut ex, &spec("I3.2", 1)).await.unwrap());
        assert!(!read_bit(&mut ex, &spec("I3.1", 1)).await.unwrap());
    }

    #[tokio::test]
    async fn batches_respect_the_pdu_length() {
        let mut ex = Loopback::new(200);
        let pattern: Vec<u8> = (0..60).collect();
        ex.memory().write(ArenaId::Db1, 0, &pattern);

        // 64 response bytes per item, three fit into one PDU
        let items = vec![spec("DB1.0", 60); 7];
        let data = read_area_multi(&mut ex, &items).await.unwrap();
        assert_eq!(ex.item_counts(), vec![3, 3, 1]);
        assert_eq!(data, pattern.repeat(7));

        assert!(matches!(
            read_area_multi(&mut ex, &[spec("C0", 100)]).await,
            Err(Error::InvalidLength(_))
        ));
        assert_eq!(ex.exchanges(), 3);
    }
}
