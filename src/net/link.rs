use std::net::SocketAddr;

use quinn::{Connecting, RecvStream, SendStream};
use tracing::{debug, debug_span, trace, Instrument};

use super::{
    wire::{decode_payload, encode_frame, FrameHeader, Message, HEADER_LEN},
    SERVER_NAME,
};
use crate::Error;

/// A QUIC connection between two gridcast processes.
///
/// Every call runs on its own bidirectional stream, so a long `Run` never
/// holds up a `Pause` sent over the same link.
///
/// Can be cloned to obtain another handle to the same link.
#[derive(Clone)]
pub struct Link {
    conn: quinn::Connection,
    remote_addr: SocketAddr,
}

impl Link {
    /// Dials `remote` from `ep`.
    pub async fn connect(
        ep: &quinn::Endpoint,
        remote: SocketAddr,
    ) -> Result<Self, Error> {
        let span = debug_span!("link", remote = %remote);
        async move {
            debug!("establishing QUIC connection");
            let conn = ep.connect(remote, SERVER_NAME)?.await?;
            debug!("connected via QUIC");
            Ok(Self {
                conn,
                remote_addr: remote,
            })
        }
        .instrument(span)
        .await
    }

    /// Completes an incoming connection.
    pub async fn accept(in_progress: Connecting) -> Result<Self, Error> {
        let remote_addr = in_progress.remote_address();
        let conn = in_progress.await?;
        debug!(remote = %remote_addr, "accepted QUIC connection");
        Ok(Self { conn, remote_addr })
    }

    /// Sends `req` on a new stream and waits for the single response.
    pub async fn call<Req: Message, Resp: Message>(
        &self,
        req: &Req,
    ) -> Result<Resp, Error> {
        let (raw_tx, raw_rx) = self.conn.open_bi().await?;
        let mut tx = FrameSendStream::new(raw_tx);
        tx.send(req).await?;
        tx.finish().await?;
        FrameRecvStream::new(raw_rx).receive().await
    }

    /// Waits for the peer to open the next call stream.
    pub async fn next_call(
        &self,
    ) -> Result<(FrameSendStream, FrameRecvStream), Error> {
        let (raw_tx, raw_rx) = self.conn.accept_bi().await?;
        Ok((FrameSendStream::new(raw_tx), FrameRecvStream::new(raw_rx)))
    }

    pub fn id(&self) -> usize {
        self.conn.stable_id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn close(&self) {
        self.conn.close(0u32.into(), b"link closed");
    }
}

pub struct FrameSendStream(SendStream);

impl FrameSendStream {
    pub fn new(stream: SendStream) -> Self {
        Self(stream)
    }

    pub async fn send<M: Message>(&mut self, msg: &M) -> Result<(), Error> {
        let buf = encode_frame(msg)?;
        self.0.write_all(&buf).await?;
        Ok(())
    }

    /// Marks the stream complete once everything sent so far is delivered.
    pub async fn finish(&mut self) -> Result<(), Error> {
        self.0.finish().await?;
        Ok(())
    }
}

pub struct FrameRecvStream(RecvStream);

impl FrameRecvStream {
    pub fn new(stream: RecvStream) -> Self {
        Self(stream)
    }

    pub async fn receive<M: Message>(&mut self) -> Result<M, Error> {
        let mut header_buf = [0u8; HEADER_LEN];
        self.0.read_exact(&mut header_buf).await?;
        let header = FrameHeader::parse(&header_buf)?;
        let mut payload = vec![0u8; header.len];
        self.0.read_exact(&mut payload).await?;
        trace!(
            len = header.len,
            age_us = header.age_micros(),
            "received frame"
        );
        decode_payload(&payload)
    }
}
