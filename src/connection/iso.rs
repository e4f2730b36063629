use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

// PDU Type constants (Code + Credit)
pub(crate) const PDU_TYPE_CR: u8 = 0xE0; // Connection request
pub(crate) const PDU_TYPE_CC: u8 = 0xD0; // Connection confirm
pub(crate) const PDU_TYPE_DR: u8 = 0x80; // Disconnect request
pub(crate) const PDU_TYPE_DC: u8 = 0xC0; // Disconnect confirm
pub(crate) const PDU_TYPE_DT: u8 = 0xF0; // Data transfer

pub(crate) const PDU_EOT: u8 = 0x80; // End of Transmission Packet (This packet is complete)

pub(crate) const ISO_TCP_VERSION: u8 = 3; // RFC 1006

/// COTP header of a data transfer: length, type, last data unit
pub(crate) const COTP_DATA: [u8; 3] = [0x02, PDU_TYPE_DT, PDU_EOT];

/// Offset of the COTP PDU type inside a complete frame
pub(crate) const OFFSET_COTP_TYPE: usize = 5;
/// Offset of the EOT flag of a COTP data header
pub(crate) const OFFSET_COTP_EOT: usize = 6;

/// TPKT length of a bare COTP data header, sent by some devices as keep-alive
pub(crate) const KEEP_ALIVE_LENGTH: u16 = 7;

/// Smallest usable PDU length of a session
pub(crate) const MIN_PDU_LENGTH: u16 = 200;
/// Header overhead subtracted from the PDU size proposed by the device
const PDU_OVERHEAD: u16 = 28;

/// Local TSAP used unless configured otherwise
pub(crate) const DEFAULT_LOCAL_TSAP: u16 = 0x0100;

/// Supported PLC devices from the S7 family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum S7Types {
    /// Choose this if you want to connect to a S7 200
    S7200,
    /// Choose this if you want to connect to a S7 200 Smart
    S7200Smart,
    /// Choose this if you want to connect to a S7 300
    S7300,
    /// Choose this if you want to connect to a S7 400
    S7400,
    /// Choose this if you want to connect to a S7 1200.
    ///
    /// You need to activate the [PUT/GET communication](https://cache.industry.siemens.com/dl/files/115/82212115/att_108330/v2/82212115_s7_communication_s7-1500_en.pdf) method in order for this to work
    S71200,
    /// Choose this if you want to connect to a S7 1500.
    ///
    /// You need to activate the [PUT/GET communication](https://cache.industry.siemens.com/dl/files/115/82212115/att_108330/v2/82212115_s7_communication_s7-1500_en.pdf) method in order for this to work
    S71500,
}

impl S7Types {
    /// Rack and slot of the CPU in a default hardware configuration
    pub fn default_rack_slot(self) -> (u8, u8) {
        match self {
            Self::S7200 | Self::S7200Smart | Self::S7300 => (0, 2),
            Self::S7400 => (0, 3),
            Self::S71200 | Self::S71500 => (0, 0),
        }
    }

    fn is_200_family(self) -> bool {
        matches!(self, Self::S7200 | Self::S7200Smart)
    }
}

/// Client connection type, the high byte of the destination TSAP
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    /// Connect to the PLC programming console (Programmiergeräte)
    #[default]
    PG = 1,
    /// Connect to the PLC Siemens HMI panel
    OP = 2,
    /// Basic connection for generic data transfer connection
    Basic = 3,
}

/// Destination TSAP addressing the CPU in `rack`/`slot`
pub(crate) fn dest_tsap(connection_type: ConnectionType, rack: u8, slot: u8) -> u16 {
    ((connection_type as u16) << 8) + u16::from(rack) * 0x20 + u16::from(slot)
}

/// 22 byte ISO connection request.
///
/// The S7 200 family uses fixed TSAPs, every other device gets the given ones
/// at offsets 16..17 (local) and 20..21 (destination).
pub(crate) fn connection_request(s7_type: S7Types, local_tsap: u16, dest_tsap: u16) -> [u8; 22] {
    match s7_type {
        S7Types::S7200 => [
            0x03, 0x00, 0x00, 0x16, 0x11, PDU_TYPE_CR, 0x00, 0x00, 0x00, 0x01, 0x00, 0xC1, 0x02,
            0x4D, 0x57, 0xC2, 0x02, 0x4D, 0x57, 0xC0, 0x01, 0x09,
        ],
        S7Types::S7200Smart => [
            0x03, 0x00, 0x00, 0x16, 0x11, PDU_TYPE_CR, 0x00, 0x00, 0x00, 0x01, 0x00, 0xC1, 0x02,
            0x10, 0x00, 0xC2, 0x02, 0x03, 0x00, 0xC0, 0x01, 0x0A,
        ],
        _ => {
            let [local_hi, local_lo] = local_tsap.to_be_bytes();
            let [dest_hi, dest_lo] = dest_tsap.to_be_bytes();
            [
                0x03, 0x00, 0x00, 0x16, // TPKT
                0x11,        // COTP header length
                PDU_TYPE_CR, // connection request
                0x00, 0x00, // destination reference
                0x00, 0x01, // source reference
                0x00, // class + option
                0xC0, 0x01, 0x0A, // TPDU size 1024
                0xC1, 0x02, local_hi, local_lo, // source TSAP
                0xC2, 0x02, dest_hi, dest_lo, // destination TSAP
            ]
        }
    }
}

/// 25 byte setup communication job proposing a PDU size of 480 (240 on the 200 family)
pub(crate) fn setup_communication(s7_type: S7Types) -> [u8; 25] {
    if s7_type.is_200_family() {
        [
            0x03, 0x00, 0x00, 0x19, 0x02, 0xF0, 0x80, 0x32, 0x01, 0x00, 0x00, 0xCC, 0xC1, 0x00,
            0x08, 0x00, 0x00, 0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x03, 0xC0,
        ]
    } else {
        [
            0x03, 0x00, 0x00, 0x19, 0x02, 0xF0, 0x80, 0x32, 0x01, 0x00, 0x00, 0x04, 0x00, 0x00,
            0x08, 0x00, 0x00, 0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x01, 0xE0,
        ]
    }
}

/// 11 byte ISO disconnect request, reason "normal disconnect"
pub(crate) fn disconnect_request() -> [u8; 11] {
    [
        0x03, 0x00, 0x00, 0x0B, 0x06, PDU_TYPE_DR, 0x00, 0x00, 0x00, 0x01, 0x80,
    ]
}

/// Check that `frame` is a COTP PDU of the given type
pub(crate) fn check_cotp_type(frame: &[u8], expected: u8) -> Result<()> {
    match frame.get(OFFSET_COTP_TYPE) {
        Some(pdu_type) if *pdu_type == expected => Ok(()),
        Some(pdu_type) => Err(Error::ConnectionSetup(format!(
            "Expected COTP PDU type 0x{expected:02X}, got 0x{pdu_type:02X}"
        ))),
        None => Err(Error::ConnectionSetup(format!(
            "COTP frame too short: {}",
            hex::encode_upper(frame)
        ))),
    }
}

/// Usable PDU length from a setup communication response: the proposed size in
/// the last two bytes minus the header overhead, at least 200
pub(crate) fn negotiated_pdu_length(frame: &[u8]) -> Result<u16> {
    match frame {
        [_, _, _, _, _, _, _, 0x32, 0x03, .., hi, lo] if frame.len() >= 27 => {
            let proposed = u16::from_be_bytes([*hi, *lo]);
            Ok(proposed.saturating_sub(PDU_OVERHEAD).max(MIN_PDU_LENGTH))
        }
        _ => Err(Error::ConnectionSetup(format!(
            "Unexpected response to the PDU negotiation: {}",
            hex::encode_upper(frame)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_connection_request() {
        let (rack, slot) = S7Types::S7300.default_rack_slot();
        let frame = connection_request(
            S7Types::S7300,
            DEFAULT_LOCAL_TSAP,
            dest_tsap(ConnectionType::PG, rack, slot),
        );
        assert_eq!(frame.len(), 22);
        assert_eq!(&frame[16..18], &[0x01, 0x00]);
        assert_eq!(&frame[20..22], &[0x01, 0x02]);

        assert_eq!(dest_tsap(ConnectionType::Basic, 1, 3), 0x0323);
    }

    #[test]
    fn s7_200_templates_ignore_tsaps() {
        let frame = connection_request(S7Types::S7200, 0xAAAA, 0xBBBB);
        assert_eq!(&frame[13..15], &[0x4D, 0x57]);
        assert_eq!(&frame[17..19], &[0x4D, 0x57]);

        let smart = connection_request(S7Types::S7200Smart, 0xAAAA, 0xBBBB);
        assert_eq!(&smart[13..15], &[0x10, 0x00]);
        assert_eq!(&smart[17..19], &[0x03, 0x00]);

        assert_eq!(&setup_communication(S7Types::S7200)[23..], &[0x03, 0xC0]);
        assert_eq!(&setup_communication(S7Types::S71500)[23..], &[0x01, 0xE0]);
    }

    fn setup_ack(pdu: u16) -> Vec<u8> {
        let mut frame = vec![
            0x03, 0x00, 0x00, 0x1B, 0x02, 0xF0, 0x80, 0x32, 0x03, 0x00, 0x00, 0x04, 0x00, 0x00,
            0x08, 0x00, 0x00, 0x00, 0x00, 0xF0, 0x00, 0x00, 0x01, 0x00, 0x01,
        ];
        frame.extend_from_slice(&pdu.to_be_bytes());
        frame
    }

    #[test]
    fn pdu_length_is_floored() {
        assert_eq!(negotiated_pdu_length(&setup_ack(480)), Ok(452));
        assert_eq!(negotiated_pdu_length(&setup_ack(228)), Ok(200));
        assert_eq!(negotiated_pdu_length(&setup_ack(100)), Ok(200));
        assert!(matches!(
            negotiated_pdu_length(&setup_ack(480)[..20]),
            Err(Error::ConnectionSetup(_))
        ));
    }

    #[test]
    fn cotp_types() {
        let confirm = [
            0x03, 0x00, 0x00, 0x16, 0x11, 0xD0, 0x00, 0x01, 0x00, 0x0C, 0x00, 0xC0, 0x01, 0x0A,
        ];
        assert!(check_cotp_type(&confirm, PDU_TYPE_CC).is_ok());
        assert!(check_cotp_type(&confirm, PDU_TYPE_DC).is_err());
        assert!(check_cotp_type(&confirm[..4], PDU_TYPE_CC).is_err());
        assert_eq!(disconnect_request()[OFFSET_COTP_TYPE], PDU_TYPE_DR);
    }
}
