use std::io;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum accepted message size (16 MiB).
///
/// Full frames carry particle positions for large systems, so the limit is
/// generous compared to control traffic.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Writes one length-prefixed (u32, big-endian) message with a bincode payload.
///
/// Layout:
/// - 4 bytes: payload length (u32, big-endian)
/// - N bytes: payload
///
/// The writer is not flushed; batch several messages and flush once.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message).context("bincode serialize failed")?;
    write_payload(writer, &payload).await
}

/// Reads one message. Returns `Ok(None)` when the peer closed the stream
/// cleanly on a message boundary.
///
/// `max_size` guards against malicious or accidental large allocations.
pub async fn read_message<R, T>(reader: &mut R, max_size: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let Some(payload) = read_payload(reader, max_size).await? else {
        return Ok(None);
    };
    let message =
        bincode::deserialize::<T>(&payload).context("bincode deserialize failed for message")?;
    Ok(Some(message))
}

/// Low-level helper: write a raw length-prefixed payload.
pub async fn write_payload<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let Ok(len) = u32::try_from(payload.len()) else {
        bail!(
            "message too large for u32 length prefix: {} bytes",
            payload.len()
        );
    };

    writer
        .write_all(&len.to_be_bytes())
        .await
        .context("failed to write message length")?;
    writer
        .write_all(payload)
        .await
        .context("failed to write message payload")?;
    Ok(())
}

/// Low-level helper: read a raw length-prefixed payload.
pub async fn read_payload<R>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("failed to read message length"),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        bail!("incoming message length {len} exceeds max size {max_size}");
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .context("failed to read message payload")?;
    Ok(Some(buf))
}
