//! Decoding of read and write responses.

use super::address::AddressSpec;
use super::header::{check_ack_header, OFFSET_ACK_FUNCTION, OFFSET_ACK_ITEM_COUNT};
use super::types::{DataItemTransportSize, ITEM_SUCCESS, READ_OPERATION, WRITE_OPERATION};
use crate::errors::{Error, Result};

/// First data item of a read or write response
const OFFSET_FIRST_ITEM: usize = OFFSET_ACK_ITEM_COUNT + 1;

/// Check the header, the function and the item count of an ack-data frame.
///
/// Header level errors are reported before anything behind the header is looked at.
fn check_parameters(frame: &[u8], function: u8, count: usize) -> Result<()> {
    check_ack_header(frame)?;
    match frame.get(OFFSET_ACK_FUNCTION..OFFSET_FIRST_ITEM) {
        Some(&[answered, items]) if answered == function && usize::from(items) == count => Ok(()),
        Some(&[answered, _]) if answered != function => Err(Error::length_check(
            format!("Expected function 0x{function:02X}, got 0x{answered:02X}"),
            frame,
        )),
        _ => Err(Error::length_check(
            format!("Expected a response with {count} items"),
            frame,
        )),
    }
}

/// Decode the payloads of a multi-item read response into one buffer, in
/// request order.
///
/// Either every item is present, successful and of the requested size, or the
/// whole response fails.
pub(crate) fn analyze_read(frame: &[u8], items: &[AddressSpec]) -> Result<Vec<u8>> {
    check_parameters(frame, READ_OPERATION, items.len())?;

    let mut buffer = Vec::with_capacity(items.iter().map(AddressSpec::byte_len).sum());
    let mut index = OFFSET_FIRST_ITEM;
    for (position, item) in items.iter().enumerate() {
        let Some(&[status, tag, len_hi, len_lo]) = frame.get(index..index + 4) else {
            return Err(Error::length_check(
                format!("Response ends before item {position}"),
                frame,
            ));
        };
        if status != ITEM_SUCCESS {
            return Err(Error::status(status));
        }
        index += 4;

        let transport_size = DataItemTransportSize::from(tag);
        if transport_size == DataItemTransportSize::Null {
            return Err(Error::length_check(
                format!("Unknown transport size 0x{tag:02X} in item {position}"),
                frame,
            ));
        }
        let payload_len = transport_size.payload_len(u16::from_be_bytes([len_hi, len_lo]));
        let payload = frame
            .get(index..index + payload_len)
            .ok_or_else(|| Error::length_check(format!("Item {position} is truncated"), frame))?;

        if transport_size == DataItemTransportSize::OctetString {
            decode_word_records(payload, item.length, &mut buffer).map_err(|message| {
                Error::length_check(format!("Item {position}: {message}"), frame)
            })?;
        } else if payload_len == item.byte_len() {
            buffer.extend_from_slice(payload);
        } else {
            return Err(Error::length_check(
                format!(
                    "Item {position} carries {payload_len} bytes, {} were requested",
                    item.byte_len()
                ),
                frame,
            ));
        }
        index += payload_len;

        // odd sized items are followed by a fill byte, except the last one
        if position + 1 < items.len() && payload_len % 2 != 0 {
            index += 1;
        }
    }

    Ok(buffer)
}

/// Counter and timer values come as 3 or 5 byte records, the last two bytes
/// of a record hold the word.
fn decode_word_records(
    records: &[u8],
    words: u16,
    buffer: &mut Vec<u8>,
) -> std::result::Result<(), String> {
    let words = usize::from(words);
    let record_len = match records.len() {
        len if words > 0 && len == words * 3 => 3,
        len if words > 0 && len == words * 5 => 5,
        len => return Err(format!("{len} bytes do not hold {words} counter or timer records")),
    };
    for record in records.chunks_exact(record_len) {
        buffer.extend_from_slice(&record[record_len - 2..]);
    }
    Ok(())
}

/// Decode the single item of a bit read response
pub(crate) fn analyze_read_bit(frame: &[u8]) -> Result<bool> {
    check_parameters(frame, READ_OPERATION, 1)?;

    match frame.get(OFFSET_FIRST_ITEM..) {
        Some(&[ITEM_SUCCESS, 0x03, _, _, value, ..]) => Ok(value & 0x01 != 0),
        Some(&[ITEM_SUCCESS, ..]) => Err(Error::length_check("Truncated bit item", frame)),
        Some(&[status, ..]) => Err(Error::status(status)),
        _ => Err(Error::length_check("Response ends before the bit item", frame)),
    }
}

/// Check the status of a single item write response
pub(crate) fn analyze_write(frame: &[u8]) -> Result<()> {
    check_parameters(frame, WRITE_OPERATION, 1)?;

    match frame.get(OFFSET_FIRST_ITEM) {
        Some(&ITEM_SUCCESS) => Ok(()),
        Some(&code) => Err(Error::write_status(code)),
        None => Err(Error::length_check("Write response too short", frame)),
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::s7_protocol::header::{put_header, OFFSET_ERROR_CLASS, ROSCTR_ACK_DATA};

    fn frame(count: u8, items: &[u8]) -> Vec<u8> {
        let mut frame = vec![
            0x03, 0x00, 0x00, 0x00, 0x02, 0xF0, 0x80, 0x32, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00,
            0x02, 0x00, 0x00, 0x00, 0x00, 0x04, count,
        ];
        frame.extend_from_slice(items);
        let len = frame.len() as u16;
        frame[2..4].copy_from_slice(&len.to_be_bytes());
        frame
    }

    fn spec(text: &str, length: u16) -> AddressSpec {
        AddressSpec::parse(text, length).unwrap()
    }

    #[test]
    fn byte_items_with_fill_byte() {
        let frame = frame(
            2,
            &[
                0xFF, 0x04, 0x00, 0x18, 1, 2, 3, 0x00, // 3 bytes + fill
                0xFF, 0x04, 0x00, 0x10, 4, 5,
            ],
        );
        let data = analyze_read(&frame, &[spec("M0", 3), spec("DB1.0", 2)]).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn counter_and_timer_records() {
        let frame = frame(
            2,
            &[
                0xFF, 0x09, 0x00, 0x06, 0x00, 0x12, 0x34, 0x00, 0x56, 0x78, // 2 counters
                0xFF, 0x09, 0x00, 0x0F, 0, 0, 0, 0x00, 0x01, 0, 0, 0, 0x00, 0x02, 0, 0, 0, 0x00,
                0x03, // 3 timers
            ],
        );
        let data = analyze_read(&frame, &[spec("C0", 2), spec("T0", 3)]).unwrap();
        assert_eq!(data, vec![0x12, 0x34, 0x56, 0x78, 0, 1, 0, 2, 0, 3]);
    }

    #[test]
    fn item_count_mismatch_fails_whole_read() {
        let frame = frame(1, &[0xFF, 0x04, 0x00, 0x08, 1]);
        match analyze_read(&frame, &[spec("M0", 1), spec("M1", 1)]) {
            Err(Error::DataLengthCheckFailed { raw_hex, .. }) => {
                assert!(raw_hex.ends_with("FF04000801"))
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn item_status_errors() {
        for code in [0x05_u8, 0x06, 0x0A, 0x03] {
            let frame = frame(2, &[0xFF, 0x04, 0x00, 0x08, 1, 0x00, code, 0x00, 0x00, 0x00]);
            assert_eq!(
                analyze_read(&frame, &[spec("M0", 1), spec("M1", 1)])
                    .unwrap_err()
                    .to_string(),
                Error::status(code).to_string()
            );
        }
    }

    #[test]
    fn truncated_items_fail() {
        let frame = frame(1, &[0xFF, 0x04, 0x00, 0x20, 1, 2]);
        assert!(matches!(
            analyze_read(&frame, &[spec("M0", 4)]),
            Err(Error::DataLengthCheckFailed { .. })
        ));
    }

    #[test]
    fn bit_responses() {
        assert!(analyze_read_bit(&frame(1, &[0xFF, 0x03, 0x00, 0x01, 0x01])).unwrap());
        assert!(!analyze_read_bit(&frame(1, &[0xFF, 0x03, 0x00, 0x01, 0x00])).unwrap());
        assert_eq!(
            analyze_read_bit(&frame(1, &[0x0A, 0x00, 0x00, 0x00])),
            Err(Error::status(0x0A))
        );
        assert!(analyze_read_bit(&frame(2, &[])).is_err());
    }

    #[test]
    fn write_responses() {
        let mut ok = frame(1, &[0xFF]);
        ok[19] = 0x05;
        assert_eq!(analyze_write(&ok), Ok(()));

        let mut rejected = frame(1, &[0x03]);
        rejected[19] = 0x05;
        assert_eq!(analyze_write(&rejected), Err(Error::write_status(0x03)));

        assert!(analyze_write(&ok[..20]).is_err());
    }

    #[test]
    fn header_errors_win_over_item_checks() {
        let mut rejected = BytesMut::new();
        put_header(&mut rejected, ROSCTR_ACK_DATA, 1, 0, 0);
        rejected[OFFSET_ERROR_CLASS] = 0x85;

        for result in [
            analyze_read(&rejected, &[spec("M0", 1)]).map(|_| ()),
            analyze_read_bit(&rejected).map(|_| ()),
            analyze_write(&rejected),
        ] {
            match result {
                Err(Error::ProtocolStatus { code, message }) => {
                    assert_eq!(code, 0x8500);
                    assert!(message.contains("Error on supplies"));
                }
                other => panic!("unexpected result {other:?}"),
            }
        }
    }

    #[test]
    fn short_byte_items_fail_whole_read() {
        let frame = frame(
            2,
            &[
                0xFF, 0x04, 0x00, 0x10, 1, 2, // 2 of 4 bytes
                0xFF, 0x04, 0x00, 0x10, 3, 4,
            ],
        );
        assert!(matches!(
            analyze_read(&frame, &[spec("M0", 4), spec("M10", 2)]),
            Err(Error::DataLengthCheckFailed { .. })
        ));
    }

    #[test]
    fn short_counter_items_fail_whole_read() {
        // one counter record where two were requested
        let counters = frame(1, &[0xFF, 0x09, 0x00, 0x03, 0x00, 0x12, 0x34]);
        assert!(matches!(
            analyze_read(&counters, &[spec("C0", 2)]),
            Err(Error::DataLengthCheckFailed { .. })
        ));

        let timers = frame(1, &[0xFF, 0x09, 0x00, 0x07, 0, 0, 0, 0x00, 0x01, 0, 0x02]);
        assert!(matches!(
            analyze_read(&timers, &[spec("T0", 2)]),
            Err(Error::DataLengthCheckFailed { .. })
        ));
    }

    #[test]
    fn zero_status_is_an_item_error() {
        // even sized first item, so the 0x00 is the status of the second one
        let frame = frame(
            2,
            &[0xFF, 0x04, 0x00, 0x10, 1, 2, 0x00, 0x00, 0x00, 0x00],
        );
        assert_eq!(
            analyze_read(&frame, &[spec("M0", 2), spec("M2", 1)]),
            Err(Error::status(0x00))
        );
    }

    #[test]
    fn wrong_function_is_rejected() {
        let mut frame = frame(1, &[0xFF, 0x04, 0x00, 0x08, 1]);
        frame[19] = 0x05;
        assert!(matches!(
            analyze_read(&frame, &[spec("M0", 1)]),
            Err(Error::DataLengthCheckFailed { .. })
        ));
    }
}
