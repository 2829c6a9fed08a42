//! A single connection to a server.
//!
//! The session owns the socket, the current protocol state and the
//! negotiated compression threshold. All I/O is cooperative: one request or
//! response at a time, every read and write guarded by the session timeout
//! so a stalled peer surfaces as [`TransportError::Timeout`] instead of
//! hanging the caller.

use std::{future::Future, io, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, lookup_host},
};
use tracing::trace;

use super::{
    Endpoint, ProtocolError, ProtocolState, TransportError,
    codec::MAX_VARINT_BYTES,
    frame,
    packet::{Clientbound, Handshake, NextState, Serverbound},
};

/// Frames longer than this are treated as garbage rather than allocated.
const MAX_FRAME_LEN: i32 = 1 << 21;

pub struct Session {
    stream: TcpStream,
    endpoint: Endpoint,
    state: ProtocolState,
    /// `-1` until the server sends Set Compression, then the negotiated
    /// threshold for the rest of the session, both directions.
    compression: i32,
    pub protocol_version: i32,
    timeout: Duration,
}

impl Session {
    /// Opens a TCP connection. DNS failures, refused connections and
    /// timeouts are reported as distinct [`TransportError`]s.
    pub async fn connect(
        endpoint: Endpoint,
        protocol_version: i32,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        // the lookup iterator borrows the host, resolve before taking
        // ownership of the endpoint below
        let addr = {
            let mut addrs = lookup_host((endpoint.host.as_str(), endpoint.port))
                .await
                .map_err(|_| TransportError::Dns(endpoint.host.clone()))?;
            addrs
                .next()
                .ok_or_else(|| TransportError::Dns(endpoint.host.clone()))?
        };

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(TransportError::from_io(err)),
            Err(_) => return Err(TransportError::Timeout),
        };

        Ok(Self {
            stream,
            endpoint,
            state: ProtocolState::Handshake,
            compression: frame::COMPRESSION_OFF,
            protocol_version,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn compression(&self) -> i32 {
        self.compression
    }

    pub fn set_compression(&mut self, threshold: i32) {
        trace!(addr = %self.endpoint, threshold, "compression negotiated");
        self.compression = threshold;
    }

    /// Sends the handshake and moves to the selected state. Must be the
    /// first packet of the session; the server never answers it directly.
    pub async fn handshake(&mut self, next_state: NextState) -> Result<(), ProtocolError> {
        debug_assert_eq!(self.state, ProtocolState::Handshake);
        // encode first so the packet's borrow of the endpoint ends before
        // the mutable send
        let mut body = Vec::new();
        Handshake {
            protocol_version: self.protocol_version,
            server_address: &self.endpoint.host,
            server_port: self.endpoint.port,
            next_state,
        }
        .encode(&mut body);
        self.send_body(&body).await?;
        self.state = match next_state {
            NextState::Status => ProtocolState::Status,
            NextState::Login => ProtocolState::Login,
        };
        Ok(())
    }

    pub async fn send(&mut self, packet: &impl Serverbound) -> Result<(), ProtocolError> {
        let mut body = Vec::new();
        packet.encode(&mut body);
        self.send_body(&body).await
    }

    async fn send_body(&mut self, body: &[u8]) -> Result<(), ProtocolError> {
        let framed = frame::encode(body, self.compression)?;
        io(self.timeout, self.stream.write_all(&framed)).await?;
        io(self.timeout, self.stream.flush()).await?;
        Ok(())
    }

    /// Reads one frame and returns its body (`packet_id || fields`),
    /// decompressed if the session negotiated compression.
    pub async fn recv_body(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let length = self.read_frame_length().await?;
        if !(0..=MAX_FRAME_LEN).contains(&length) {
            return Err(ProtocolError::MalformedFrame(format!(
                "frame length {length} out of range"
            )));
        }
        let payload = self.read_exact(length as usize).await?;
        frame::decode(&payload, self.compression)
    }

    /// Reads one frame and decodes it for the current state.
    pub async fn recv(&mut self) -> Result<Clientbound, ProtocolError> {
        let body = self.recv_body().await?;
        let packet = Clientbound::decode(self.state, &body)?;
        trace!(addr = %self.endpoint, state = ?self.state, ?packet, "received");
        Ok(packet)
    }

    async fn read_frame_length(&mut self) -> Result<i32, TransportError> {
        let mut result: u32 = 0;
        for i in 0..MAX_VARINT_BYTES {
            let byte = io(self.timeout, self.stream.read_u8()).await?;
            result |= ((byte & 0x7F) as u32) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result as i32);
            }
        }
        // bubbled up as a malformed frame by the caller
        Ok(-1)
    }

    async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = io(self.timeout, self.stream.read(&mut buf[filled..])).await?;
            if n == 0 {
                return Err(TransportError::Closed {
                    missing: len - filled,
                });
            }
            filled += n;
        }
        Ok(buf)
    }

}

async fn io<T>(
    timeout: Duration,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T, TransportError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TransportError::from_io(err)),
        Err(_) => Err(TransportError::Timeout),
    }
}
