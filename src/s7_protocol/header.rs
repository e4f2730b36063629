use bytes::{BufMut, BytesMut};

use crate::connection::iso::{COTP_DATA, ISO_TCP_VERSION};
use crate::errors::{Error, Result, S7ProtocolError};

const PROTOCOL_ID: u8 = 0x32;
pub(crate) const ROSCTR_JOB: u8 = 0x01;
pub(crate) const ROSCTR_ACK_DATA: u8 = 0x03;

/// TPKT (4) + COTP data (3) + S7 job header (10)
pub(crate) const JOB_HEADER_LEN: usize = 17;
/// TPKT (4) + COTP data (3) + S7 ack-data header (12)
pub(crate) const ACK_HEADER_LEN: usize = 19;

/// Offsets inside a complete frame
pub(crate) const OFFSET_ROSCTR: usize = 8;
pub(crate) const OFFSET_PDU_REF: usize = 11;
pub(crate) const OFFSET_ERROR_CLASS: usize = 17;
/// Function and item count of a job frame
pub(crate) const OFFSET_FUNCTION: usize = JOB_HEADER_LEN;
pub(crate) const OFFSET_ITEM_COUNT: usize = JOB_HEADER_LEN + 1;
/// Function and item count of an ack-data frame, behind error class and code
pub(crate) const OFFSET_ACK_FUNCTION: usize = ACK_HEADER_LEN;
pub(crate) const OFFSET_ACK_ITEM_COUNT: usize = ACK_HEADER_LEN + 1;

/// Write TPKT, COTP and S7 header of a frame. The total length is
/// `header_len + param_len + data_len`.
pub(crate) fn put_header(
    bytes: &mut BytesMut,
    rosctr: u8,
    pdu_ref: u16,
    param_len: u16,
    data_len: u16,
) {
    let header_len = if rosctr == ROSCTR_JOB {
        JOB_HEADER_LEN
    } else {
        ACK_HEADER_LEN
    };
    let total = header_len + usize::from(param_len) + usize::from(data_len);

    // TPKT
    bytes.put_u8(ISO_TCP_VERSION);
    bytes.put_u8(0);
    bytes.put_u16(total as u16);
    // COTP data, last data unit
    bytes.put_slice(&COTP_DATA);
    // S7
    bytes.put_u8(PROTOCOL_ID);
    bytes.put_u8(rosctr);
    bytes.put_u16(0); // redundancy identification
    bytes.put_u16(pdu_ref);
    bytes.put_u16(param_len);
    bytes.put_u16(data_len);
    if rosctr != ROSCTR_JOB {
        // error class + error code
        bytes.put_u16(0);
    }
}

/// Validate the S7 header of an ack-data frame and report header level errors
pub(crate) fn check_ack_header(frame: &[u8]) -> Result<()> {
    if frame.len() < ACK_HEADER_LEN || frame[7] != PROTOCOL_ID {
        return Err(Error::length_check("Response is not an S7 frame", frame));
    }
    if frame[OFFSET_ROSCTR] != ROSCTR_ACK_DATA {
        return Err(Error::length_check(
            format!("Unexpected S7 message type 0x{:02X}", frame[OFFSET_ROSCTR]),
            frame,
        ));
    }
    let (class, code) = (frame[OFFSET_ERROR_CLASS], frame[OFFSET_ERROR_CLASS + 1]);
    if class != 0 || code != 0 {
        return Err(Error::ProtocolStatus {
            code: u16::from_be_bytes([class, code]),
            message: S7ProtocolError::from_codes(Some(class), Some(code)).to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_header_layout() {
        let mut bytes = BytesMut::new();
        put_header(&mut bytes, ROSCTR_JOB, 1, 14, 6);
        assert_eq!(
            bytes.as_ref(),
            &[
                0x03, 0x00, 0x00, 0x25, 0x02, 0xF0, 0x80, 0x32, 0x01, 0x00, 0x00, 0x00, 0x01,
                0x00, 0x0E, 0x00, 0x06
            ]
        );
    }

    #[test]
    fn ack_header_errors() {
        let mut bytes = BytesMut::new();
        put_header(&mut bytes, ROSCTR_ACK_DATA, 7, 2, 0);
        assert_eq!(bytes.len(), ACK_HEADER_LEN);
        assert!(check_ack_header(&bytes).is_ok());

        bytes[OFFSET_ERROR_CLASS] = 0x85;
        bytes[OFFSET_ERROR_CLASS + 1] = 0x00;
        match check_ack_header(&bytes) {
            Err(Error::ProtocolStatus { code, message }) => {
                assert_eq!(code, 0x8500);
                assert!(message.contains("Error on supplies"));
            }
            other => panic!("unexpected result {other:?}"),
        }

        assert!(matches!(
            check_ack_header(&bytes[..10]),
            Err(Error::DataLengthCheckFailed { .. })
        ));
    }
}
