use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::wire::{Frame, RequestCode};
use crate::error::{Error, Result};

/// Upper bound on `totalLen`. Anything larger is treated as garbage and
/// drops the connection.
pub const DEFAULT_MAX_FRAME: usize = 8 * 1024 * 1024;

/// Reads `[i32 totalLen][i32 requestCode][payload]` frames off a stream.
/// `totalLen` counts every byte after the length field itself.
pub struct FrameReader<R> {
    inner: R,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, max_frame: DEFAULT_MAX_FRAME }
    }

    pub async fn read(&mut self) -> Result<Frame> {
        let mut header = [0u8; 8];
        self.inner.read_exact(&mut header).await?;
        let total_len = BigEndian::read_u32(&header[0..4]) as usize;
        let code = BigEndian::read_u32(&header[4..8]);
        if total_len < 4 || total_len > self.max_frame {
            return Err(Error::Protocol(format!(
                "bad frame length {total_len}"
            )));
        }
        let mut body = vec![0u8; total_len - 4];
        self.inner.read_exact(&mut body).await?;
        Ok(Frame::new(RequestCode::try_from(code)?, body))
    }
}

/// Writes frames to a stream. A writer must only ever be driven by one
/// task at a time (callers wrap it in a mutex or give it a dedicated
/// task); the protocol has no application-level multiplexing, so an
/// interleaved partial write would corrupt framing for good.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write(&mut self, frame: &Frame) -> Result<()> {
        self.inner.write_all(&encode_frame(frame)).await?;
        Ok(())
    }
}

/// Builds the full on-wire byte image of a frame, for `write_all` and for
/// the UDP datagram path which shares the same layout.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let total_len = (4 + frame.body.len()) as u32;
    let mut buf = Vec::with_capacity(8 + frame.body.len());
    buf.extend_from_slice(&total_len.to_be_bytes());
    buf.extend_from_slice(&(frame.code as u32).to_be_bytes());
    buf.extend_from_slice(&frame.body);
    buf
}

/// Decodes a datagram that carries one whole frame.
pub fn decode_datagram(buf: &[u8]) -> Result<Frame> {
    if buf.len() < 8 {
        return Err(Error::Protocol("datagram shorter than header".into()));
    }
    let total_len = BigEndian::read_u32(&buf[0..4]) as usize;
    let code = BigEndian::read_u32(&buf[4..8]);
    if total_len < 4 || 4 + total_len != buf.len() {
        return Err(Error::Protocol(format!(
            "datagram length {} does not match header {total_len}",
            buf.len()
        )));
    }
    Ok(Frame::new(RequestCode::try_from(code)?, buf[8..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let frame = Frame::new(RequestCode::Send, vec![1, 2, 3, 4]);
        writer.write(&frame).await.unwrap();
        let got = reader.read().await.unwrap();
        assert_eq!(got.code, RequestCode::Send);
        assert_eq!(got.body, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);
        reader.max_frame = 16;

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = client.write_all(&1024u32.to_be_bytes()).await;
            let _ = client
                .write_all(&(RequestCode::Send as u32).to_be_bytes())
                .await;
        });
        assert!(matches!(reader.read().await, Err(Error::Protocol(_))));
    }

    #[test]
    fn datagram_mirrors_stream_layout() {
        let frame = Frame::new(RequestCode::Send, vec![9, 9]);
        let bytes = encode_frame(&frame);
        let got = decode_datagram(&bytes).unwrap();
        assert_eq!(got.code, RequestCode::Send);
        assert_eq!(got.body, vec![9, 9]);
    }
}
