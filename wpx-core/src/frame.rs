use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::connection::ConnectionError;

pub const MAGIC: &[u8; 4] = b"WPXC";
pub const VERSION: u8 = 1;
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 12;
const KIND_MESSAGE: u8 = 1;
const KIND_STOP: u8 = 2;

/// One unit on an object connection: a message for a named protocol, or the
/// end-of-stream marker a peer sends when it stops cleanly.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message { protocol: String, body: Bytes },
    Stop,
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), ConnectionError> {
    let (kind, name, body): (u8, &[u8], &[u8]) = match frame {
        Frame::Message { protocol, body } => (KIND_MESSAGE, protocol.as_bytes(), body),
        Frame::Stop => (KIND_STOP, &[], &[]),
    };
    if body.len() > MAX_FRAME_BYTES {
        return Err(ConnectionError::FrameTooLarge(body.len()));
    }
    let name_len = u16::try_from(name.len())
        .map_err(|_| ConnectionError::UnknownProtocol(String::from_utf8_lossy(name).into_owned()))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + name.len() + body.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(kind);
    buf.put_u16_le(name_len);
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(name);
    buf.put_slice(body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next frame. `Ok(None)` means the peer closed the stream on a
/// frame boundary without sending [`Frame::Stop`].
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, ConnectionError> {
    let mut header = [0u8; HEADER_LEN];
    let first = reader.read(&mut header).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[first..]).await?;

    if &header[0..4] != MAGIC {
        return Err(ConnectionError::BadMagic);
    }
    if header[4] != VERSION {
        return Err(ConnectionError::UnsupportedVersion(header[4]));
    }
    let kind = header[5];
    let name_len = u16::from_le_bytes([header[6], header[7]]) as usize;
    let body_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if body_len > MAX_FRAME_BYTES {
        return Err(ConnectionError::FrameTooLarge(body_len));
    }

    let mut name = vec![0u8; name_len];
    reader.read_exact(&mut name).await?;
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;

    match kind {
        KIND_MESSAGE => {
            let protocol = String::from_utf8(name)
                .map_err(|e| ConnectionError::UnknownProtocol(e.to_string()))?;
            Ok(Some(Frame::Message {
                protocol,
                body: Bytes::from(body),
            }))
        }
        KIND_STOP => Ok(Some(Frame::Stop)),
        other => Err(ConnectionError::UnknownFrameKind(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let message = Frame::Message {
            protocol: "request".into(),
            body: Bytes::from_static(b"{\"x\":1}"),
        };
        write_frame(&mut a, &message).await.unwrap();
        write_frame(&mut a, &Frame::Stop).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(message));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(Frame::Stop));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"NOPE\x01\x01\x00\x00\x00\x00\x00\x00").await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(ConnectionError::BadMagic)
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&MAGIC[..]).await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(ConnectionError::Io(_))));
    }
}
