//! Frame reading and writing over any async byte stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::message::{MessageKind, WireMessage};

/// Maximum payload size (1 MB)
pub const MAX_PAYLOAD_LEN: usize = 1_048_576;

const HEADER_LEN: usize = 1 + 4;

/// Serializes a message into a single contiguous frame.
fn encode(msg: &WireMessage) -> Result<Vec<u8>, ProtocolError> {
    let len = msg.payload.len();
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_PAYLOAD_LEN,
        });
    }
    // Bounded by MAX_PAYLOAD_LEN above
    let wire_len = len as u32;

    let mut frame = Vec::with_capacity(HEADER_LEN + len + 1);
    frame.push(msg.kind.as_byte());
    frame.extend_from_slice(&wire_len.to_ne_bytes());
    if len > 0 {
        frame.extend_from_slice(&msg.payload);
        frame.push(0);
    }
    Ok(frame)
}

/// Writes one message and flushes the writer.
///
/// The frame is assembled first and written with a single `write_all`, so
/// a caller holding exclusive access to the writer never emits a partial
/// header followed by another frame.
pub async fn write_message<W>(writer: &mut W, msg: &WireMessage) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next application message, skipping PING frames.
///
/// A trailing newline in the payload is trimmed. End of stream before the
/// first header byte is [`ProtocolError::Closed`]; inside a frame it is
/// [`ProtocolError::Truncated`].
pub async fn read_message<R>(reader: &mut R) -> Result<WireMessage, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        let tag = match reader.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::Closed)
            }
            Err(e) => return Err(e.into()),
        };

        let mut len_buf = [0u8; 4];
        read_exact_in_frame(reader, &mut len_buf).await?;
        let len = u32::from_ne_bytes(len_buf) as usize;

        if len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: MAX_PAYLOAD_LEN,
            });
        }

        let mut payload = Vec::new();
        if len > 0 {
            payload.resize(len + 1, 0);
            read_exact_in_frame(reader, &mut payload).await?;
            if payload.pop() != Some(0) {
                return Err(ProtocolError::MissingTerminator);
            }
            if payload.last() == Some(&b'\n') {
                payload.pop();
            }
        }

        let kind = MessageKind::from_byte(tag).ok_or(ProtocolError::UnknownKind(tag))?;
        if kind == MessageKind::Ping {
            continue;
        }

        return Ok(WireMessage { kind, payload });
    }
}

async fn read_exact_in_frame<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ProtocolError::Truncated),
        Err(e) => Err(e.into()),
    }
}
