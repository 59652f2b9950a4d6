//! Consumer side of the multiplexed stream.

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::FramedRead;

use super::codec::{CodecError, FrameCodec};
use super::frame::StreamKind;

/// Read frames from `source` until it is exhausted, writing each payload to
/// the sink for its stream.
///
/// stdin frames are written to `stdout`, matching the reference demultiplexer.
/// Returns the number of payload bytes written. A frame's payload is written
/// only once it has been read completely, so a malformed or truncated frame
/// delivers nothing.
///
/// Frames may declare up to `u32::MAX` bytes; use [`decode_stream_with`] and
/// [`FrameCodec::with_max_payload`] to bound what an untrusted source can make
/// this buffer.
pub async fn decode_stream<R, O, E>(
    source: R,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<u64, CodecError>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin + ?Sized,
    E: AsyncWrite + Unpin + ?Sized,
{
    decode_stream_with(FrameCodec::new(), source, stdout, stderr).await
}

/// [`decode_stream`] with a caller-configured codec. Frames longer than the
/// codec's `max_payload` fail with a protocol error before any of their
/// payload is buffered.
pub async fn decode_stream_with<R, O, E>(
    codec: FrameCodec,
    source: R,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<u64, CodecError>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin + ?Sized,
    E: AsyncWrite + Unpin + ?Sized,
{
    let mut frames = FramedRead::new(source, codec);
    let mut written: u64 = 0;

    while let Some(frame) = frames.next().await {
        let frame = frame?;
        match frame.kind {
            StreamKind::Stdin | StreamKind::Stdout => stdout.write_all(&frame.payload).await?,
            StreamKind::Stderr => stderr.write_all(&frame.payload).await?,
        }
        written += frame.payload.len() as u64;
    }

    stdout.flush().await?;
    stderr.flush().await?;
    tracing::trace!(written, "Demultiplexed stream exhausted");
    Ok(written)
}
