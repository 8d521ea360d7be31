// Async frame IO over any byte stream.
use bytes::Bytes;
use prost::Message as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Message, Result, LENGTH_PREFIX_LEN};

/// Read one length-prefixed frame and return its payload bytes.
///
/// Returns `Ok(None)` on a clean end of stream, i.e. the peer closed the
/// connection at a frame boundary. An end of stream in the middle of a frame
/// is reported as [`Error::Truncated`].
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_LEN {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Truncated);
        }
        filled += n;
    }

    let length = u32::from_be_bytes(prefix) as usize;
    if length > max_frame_bytes {
        return Err(Error::FrameTooLarge {
            length,
            cap: max_frame_bytes,
        });
    }

    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::Truncated,
            _ => Error::Io(err),
        })?;
    Ok(Some(payload.into()))
}

/// Read one frame and decode its envelope. The raw payload bytes are returned
/// alongside so forwarding paths can resend them without re-encoding.
pub async fn read_message<R>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<(Bytes, Message)>>
where
    R: AsyncRead + Unpin,
{
    let raw = match read_frame(reader, max_frame_bytes).await? {
        Some(raw) => raw,
        None => return Ok(None),
    };
    let message = Message::decode(raw.clone())?;
    Ok(Some((raw, message)))
}

/// Write one complete frame (length prefix already included).
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
