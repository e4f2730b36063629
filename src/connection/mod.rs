use async_trait::async_trait;
use bytes::BytesMut;

use crate::errors::Result;

pub(crate) mod iso;
pub(crate) mod tcp;

/// One request/response round trip on an open session
#[async_trait]
pub(crate) trait Exchange: Send {
    /// Usable PDU length negotiated for the session
    fn pdu_length(&self) -> u16;

    /// Reference number for the next job
    fn next_pdu_ref(&mut self) -> u16;

    async fn exchange(&mut self, request: BytesMut) -> Result<BytesMut>;
}
