//! Request/response codecs
//!
//! `PayloadCodec` writes requests and responses as-is and reads until the
//! remote closes its side of the stream, so each stream carries exactly one
//! exchange. `PingCodec` speaks the fixed-size echo of `/ipfs/ping/1.0.0`.

use std::io;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::request_response;
use libp2p::StreamProtocol;

/// Upper bound on a single request or response.
pub const MAX_PAYLOAD_BYTES: u64 = 64 * 1024;

pub const PING_PROTOCOL: &str = "/ipfs/ping/1.0.0";
pub const PING_SIZE: usize = 32;

#[derive(Debug, Clone, Default)]
pub struct PayloadCodec;

#[async_trait]
impl request_response::Codec for PayloadCodec {
    type Protocol = StreamProtocol;
    type Request = Vec<u8>;
    type Response = Vec<u8>;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Vec<u8>>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_payload(io).await
    }

    async fn read_response<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Vec<u8>>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_payload(io).await
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        request: Vec<u8>,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_payload(io, &request).await
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        response: Vec<u8>,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_payload(io, &response).await
    }
}

/// One ping per stream: 32 random bytes out, the same 32 bytes back.
#[derive(Debug, Clone, Default)]
pub struct PingCodec;

#[async_trait]
impl request_response::Codec for PingCodec {
    type Protocol = StreamProtocol;
    type Request = [u8; PING_SIZE];
    type Response = [u8; PING_SIZE];

    async fn read_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> io::Result<[u8; PING_SIZE]>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_ping(io).await
    }

    async fn read_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> io::Result<[u8; PING_SIZE]>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_ping(io).await
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        request: [u8; PING_SIZE],
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_payload(io, &request).await
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        response: [u8; PING_SIZE],
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_payload(io, &response).await
    }
}

async fn read_ping<T>(io: &mut T) -> io::Result<[u8; PING_SIZE]>
where
    T: AsyncRead + Unpin + Send,
{
    let mut payload = [0u8; PING_SIZE];
    io.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn read_payload<T>(io: &mut T) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut payload = Vec::new();
    // Read one byte past the limit to tell "exactly at limit" from "too large"
    (&mut *io)
        .take(MAX_PAYLOAD_BYTES + 1)
        .read_to_end(&mut payload)
        .await?;
    if payload.len() as u64 > MAX_PAYLOAD_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload exceeds {} bytes", MAX_PAYLOAD_BYTES),
        ));
    }
    Ok(payload)
}

async fn write_payload<T>(io: &mut T, payload: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    io.write_all(payload).await?;
    io.flush().await
}
