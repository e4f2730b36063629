use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::iso::{
    check_cotp_type, connection_request, disconnect_request, negotiated_pdu_length,
    setup_communication, KEEP_ALIVE_LENGTH, OFFSET_COTP_EOT, OFFSET_COTP_TYPE, PDU_EOT,
    PDU_TYPE_CC, PDU_TYPE_DC, PDU_TYPE_DT,
};
use crate::client::create::ClientOptions;
use crate::errors::{Error, Result};

const TPKT_HEADER_LEN: usize = 4;
/// TPKT header plus COTP data header in front of every data fragment
const DATA_HEADER_LEN: usize = TPKT_HEADER_LEN + 3;

/// Open the ISO connection and negotiate the PDU length on an established TCP stream.
///
/// Returns the usable PDU length of the session.
pub(crate) async fn connect(conn: &mut TcpStream, options: &ClientOptions) -> Result<u16> {
    let handshake = async {
        // send connection request
        let request =
            connection_request(options.s7_type, options.local_tsap, options.dest_tsap());
        let confirm = exchange_buffer(conn, &request, None).await?;
        check_cotp_type(&confirm, PDU_TYPE_CC)?;

        let response = exchange_buffer(conn, &setup_communication(options.s7_type), None).await?;
        negotiated_pdu_length(&response)
    };

    let pdu_length = match timeout(options.connect_timeout, handshake).await {
        Ok(Ok(pdu_length)) => pdu_length,
        Ok(Err(Error::ConnectionSetup(message))) => return Err(Error::ConnectionSetup(message)),
        Ok(Err(err)) => return Err(Error::ConnectionSetup(err.to_string())),
        Err(_) => {
            return Err(Error::ConnectionSetup(format!(
                "Handshake timed out after {} ms",
                options.connect_timeout.as_millis()
            )))
        }
    };
    debug!(pdu_length, "negotiated PDU length");

    Ok(pdu_length)
}

/// Send the ISO disconnect request and wait for the confirm
pub(crate) async fn disconnect(conn: &mut TcpStream, wait: Option<Duration>) -> Result<()> {
    let confirm = exchange_buffer(conn, &disconnect_request(), wait).await?;
    check_cotp_type(&confirm, PDU_TYPE_DC)
        .map_err(|err| Error::Connection(format!("Disconnect not confirmed: {err}")))
}

/// Write one complete frame
pub(crate) async fn send_frame<S>(conn: &mut S, frame: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    trace!(frame = %hex::encode_upper(frame), "send");
    conn.write_all(frame).await?;
    Ok(())
}

/// Read one complete frame, header included.
///
/// Keep-alive frames (a bare COTP data header) are skipped. Data units sent
/// in several fragments are joined until the fragment carrying the EOT flag,
/// the result looks like a single TPKT frame.
pub(crate) async fn recv_frame<S>(conn: &mut S) -> Result<BytesMut>
where
    S: AsyncRead + Unpin,
{
    let mut frame = recv_data_unit(conn).await?;

    // if not last wait for the others till last
    while is_fragment(&frame) {
        let fragment = recv_data_unit(conn).await?;
        if fragment[OFFSET_COTP_TYPE] != PDU_TYPE_DT {
            return Err(Error::length_check(
                "Fragmented data unit interrupted",
                &fragment,
            ));
        }
        frame.put_slice(&fragment[DATA_HEADER_LEN..]);
        frame[OFFSET_COTP_EOT] = fragment[OFFSET_COTP_EOT];
    }

    let length = u16::try_from(frame.len()).map_err(|_| {
        Error::length_check(
            "Reassembled data unit exceeds a TPKT frame",
            &frame[..DATA_HEADER_LEN],
        )
    })?;
    frame[2..4].copy_from_slice(&length.to_be_bytes());
    trace!(frame = %hex::encode_upper(&frame), "recv");
    Ok(frame)
}

/// Read the next TPKT frame that is not a keep-alive
async fn recv_data_unit<S>(conn: &mut S) -> Result<BytesMut>
where
    S: AsyncRead + Unpin,
{
    loop {
        let mut header = [0_u8; TPKT_HEADER_LEN];
        conn.read_exact(&mut header).await?;
        let length = u16::from_be_bytes([header[2], header[3]]);
        if usize::from(length) < DATA_HEADER_LEN {
            return Err(Error::length_check("Invalid TPKT length", &header));
        }

        let mut frame = BytesMut::with_capacity(usize::from(length));
        frame.put_slice(&header);
        frame.resize(usize::from(length), 0);
        conn.read_exact(&mut frame[TPKT_HEADER_LEN..]).await?;

        if length == KEEP_ALIVE_LENGTH {
            trace!("skipped keep-alive frame");
            continue;
        }
        return Ok(frame);
    }
}

/// A COTP data unit without the EOT flag is continued by the next one
fn is_fragment(frame: &[u8]) -> bool {
    frame[OFFSET_COTP_TYPE] == PDU_TYPE_DT && frame[OFFSET_COTP_EOT] & PDU_EOT == 0
}

/// Send a request and wait for its response, within `wait` if given
pub(crate) async fn exchange_buffer<S>(
    conn: &mut S,
    request: &[u8],
    wait: Option<Duration>,
) -> Result<BytesMut>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        send_frame(conn, request).await?;
        recv_frame(conn).await
    };
    match wait {
        Some(wait) => timeout(wait, exchange).await.map_err(|_| Error::Timeout)?,
        None => exchange.await,
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn keep_alive_frames_are_skipped() {
        let (mut client, mut server) = duplex(256);
        let response = [0x03, 0x00, 0x00, 0x08, 0x02, 0xF0, 0x80, 0x42];
        server
            .write_all(&[0x03, 0x00, 0x00, 0x07, 0x02, 0xF0, 0x80])
            .await
            .unwrap();
        server.write_all(&response).await.unwrap();

        let frame = recv_frame(&mut client).await.unwrap();
        assert_eq!(frame.as_ref(), &response);
    }

    #[tokio::test]
    async fn fragmented_data_units_are_reassembled() {
        let (mut client, mut server) = duplex(256);
        server
            .write_all(&[0x03, 0x00, 0x00, 0x0A, 0x02, 0xF0, 0x00, 0x32, 0x03, 0x00])
            .await
            .unwrap();
        server
            .write_all(&[0x03, 0x00, 0x00, 0x09, 0x02, 0xF0, 0x80, 0x00, 0x01])
            .await
            .unwrap();

        let frame = recv_frame(&mut client).await.unwrap();
        assert_eq!(
            frame.as_ref(),
            &[0x03, 0x00, 0x00, 0x0C, 0x02, 0xF0, 0x80, 0x32, 0x03, 0x00, 0x00, 0x01]
        );
    }

    #[tokio::test]
    async fn exchange_times_out() {
        let (mut client, _server) = duplex(256);
        let result = exchange_buffer(
            &mut client,
            &[0x03, 0x00, 0x00, 0x07, 0x02, 0xF0, 0x80],
            Some(Duration::from_millis(20)),
        )
        .await;
        assert_eq!(result, Err(Error::Timeout));
    }

    #[tokio::test]
    async fn closed_stream_is_a_transport_error() {
        let (mut client, server) = duplex(256);
        drop(server);
        assert!(matches!(
            recv_frame(&mut client).await,
            Err(Error::Transport { .. })
        ));
    }
}
