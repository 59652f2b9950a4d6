//! Frame codec for multiplexed output.
//!
//! `FrameCodec` implements both halves of the wire format so it works with
//! `FramedRead`/`FramedWrite` over any AsyncRead/AsyncWrite. `OutputCodec`
//! picks raw or framed encoding per consumer.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{Frame, HEADER_LEN, StreamKind, StreamMode};

/// Largest payload a single header can describe.
const MAX_FRAME_PAYLOAD: usize = u32::MAX as usize;

/// Upper bound on speculative buffer growth while waiting for a payload.
/// The length field is untrusted input.
const MAX_RESERVE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unexpected end of stream with {buffered} bytes of an incomplete frame")]
    UnexpectedEof { buffered: usize },
    #[error("payload of {0} bytes does not fit a 32-bit frame length")]
    PayloadTooLarge(usize),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    pub fn is_unexpected_eof(&self) -> bool {
        matches!(self, Self::UnexpectedEof { .. })
    }
}

/// Encode one frame's wire bytes.
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Result<Bytes, CodecError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }
    let mut dst = BytesMut::with_capacity(HEADER_LEN + payload.len());
    put_header(&mut dst, kind, payload.len() as u32);
    dst.extend_from_slice(payload);
    Ok(dst.freeze())
}

/// Encode a batch of frames (e.g. a backlog snapshot) into one buffer.
pub fn encode_all(
    mode: StreamMode,
    frames: impl IntoIterator<Item = Frame>,
) -> Result<Bytes, CodecError> {
    let mut codec = OutputCodec::new(mode);
    let mut dst = BytesMut::new();
    for frame in frames {
        codec.encode(frame, &mut dst)?;
    }
    Ok(dst.freeze())
}

fn put_header(dst: &mut BytesMut, kind: StreamKind, len: u32) {
    dst.put_u8(kind.as_byte());
    dst.put_slice(&[0, 0, 0]);
    dst.put_u32(len);
}

/// Encoder/decoder for the 8-byte-header frame format.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_payload: MAX_FRAME_PAYLOAD,
        }
    }

    /// Split encoded payloads into frames of at most `max` bytes, and reject
    /// decoded frames that declare more.
    ///
    /// A decoder buffers a whole payload before yielding the frame, so this is
    /// also the most memory one frame can claim. Clamped to `1..=u32::MAX`.
    pub fn with_max_payload(max: usize) -> Self {
        Self {
            max_payload: max.clamp(1, MAX_FRAME_PAYLOAD),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = StreamKind::from_byte(src[0])
            .ok_or_else(|| CodecError::Protocol(format!("invalid stream kind {}", src[0])))?;
        if src[1..4] != [0, 0, 0] {
            return Err(CodecError::Protocol(format!(
                "reserved header bytes must be zero, got {:?}",
                &src[1..4]
            )));
        }
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > self.max_payload {
            return Err(CodecError::Protocol(format!(
                "frame of {len} bytes exceeds the {} byte limit",
                self.max_payload
            )));
        }

        let needed = HEADER_LEN + len;
        if src.len() < needed {
            src.reserve((needed - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        tracing::trace!(kind = %kind, len, "Decoded frame");
        Ok(Some(Frame { kind, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::UnexpectedEof {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.is_empty() {
            dst.reserve(HEADER_LEN);
            put_header(dst, frame.kind, 0);
            return Ok(());
        }

        // Oversized payloads become consecutive frames of the same kind, in order.
        for chunk in frame.payload.chunks(self.max_payload) {
            dst.reserve(HEADER_LEN + chunk.len());
            put_header(dst, frame.kind, chunk.len() as u32);
            dst.extend_from_slice(chunk);
        }
        Ok(())
    }
}

/// Per-consumer output encoder: raw passthrough for TTY, framed otherwise.
#[derive(Debug, Clone)]
pub struct OutputCodec {
    mode: StreamMode,
    frames: FrameCodec,
}

impl OutputCodec {
    pub fn new(mode: StreamMode) -> Self {
        Self {
            mode,
            frames: FrameCodec::new(),
        }
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }
}

impl Encoder<Frame> for OutputCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self.mode {
            StreamMode::Raw => {
                dst.extend_from_slice(&frame.payload);
                Ok(())
            }
            StreamMode::Multiplexed => self.frames.encode(frame, dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Result<Vec<Frame>, CodecError> {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode_eof(&mut buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    #[test]
    fn encode_frame_writes_header_then_payload() {
        let bytes = encode_frame(StreamKind::Stderr, b"oops").unwrap();
        assert_eq!(&bytes[..], &[2, 0, 0, 0, 0, 0, 0, 4, b'o', b'o', b'p', b's']);
    }

    #[test]
    fn empty_payload_is_a_bare_header() {
        let bytes = encode_frame(StreamKind::Stdout, b"").unwrap();
        assert_eq!(&bytes[..], &[1, 0, 0, 0, 0, 0, 0, 0]);

        let frames = decode_all(&bytes).unwrap();
        assert_eq!(frames, vec![Frame::new(StreamKind::Stdout, Bytes::new())]);
    }

    #[test]
    fn header_length_matches_payload_for_every_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        for (kind, payload) in [
            (StreamKind::Stdout, &b"first"[..]),
            (StreamKind::Stderr, &b""[..]),
            (StreamKind::Stdout, &b"a somewhat longer second payload"[..]),
        ] {
            codec.encode(Frame::new(kind, payload.to_vec()), &mut buf).unwrap();
        }

        let mut raw = &buf[..];
        while !raw.is_empty() {
            let declared = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
            let frame = codec
                .decode(&mut BytesMut::from(&raw[..HEADER_LEN + declared]))
                .unwrap()
                .unwrap();
            assert_eq!(frame.len(), declared);
            raw = &raw[HEADER_LEN + declared..];
        }
    }

    #[test]
    fn decode_waits_for_complete_header_and_payload() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[1u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0, 0, 0, 0, 5, b'h', b'e']);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"llo");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::new(StreamKind::Stdout, &b"hello"[..]));
        assert!(buf.is_empty());
    }

    #[test]
    fn invalid_kind_is_protocol_error() {
        let err = decode_all(&[3, 0, 0, 0, 0, 0, 0, 1, b'x']).unwrap_err();
        assert!(err.is_protocol(), "{err}");
    }

    #[test]
    fn nonzero_reserved_bytes_are_protocol_error() {
        let err = decode_all(&[1, 0, 7, 0, 0, 0, 0, 1, b'x']).unwrap_err();
        assert!(err.is_protocol(), "{err}");
    }

    #[test]
    fn truncated_header_is_unexpected_eof() {
        let err = decode_all(&[1, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedEof { buffered: 4 }));
    }

    #[test]
    fn truncated_payload_is_unexpected_eof() {
        let err = decode_all(&[1, 0, 0, 0, 0, 0, 0, 10, b'a', b'b']).unwrap_err();
        assert!(err.is_unexpected_eof(), "{err}");
    }

    #[test]
    fn oversized_payload_splits_in_order() {
        let mut codec = FrameCodec::with_max_payload(4);
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(StreamKind::Stdout, &b"hello world"[..]), &mut buf)
            .unwrap();

        let frames = decode_all(&buf).unwrap();
        let lens: Vec<usize> = frames.iter().map(Frame::len).collect();
        assert_eq!(lens, vec![4, 4, 3]);
        assert!(frames.iter().all(|f| f.kind == StreamKind::Stdout));

        let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(joined, b"hello world");
    }

    #[test]
    fn max_payload_is_clamped() {
        assert_eq!(FrameCodec::with_max_payload(0).max_payload(), 1);
        assert_eq!(FrameCodec::new().max_payload(), u32::MAX as usize);
    }

    #[test]
    fn frame_longer_than_limit_is_protocol_error() {
        let mut codec = FrameCodec::with_max_payload(4);
        let mut buf = BytesMut::from(&[2u8, 0, 0, 0, 0xff, 0xff, 0xff, 0xff][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.is_protocol(), "{err}");

        let mut buf = BytesMut::from(&[1u8, 0, 0, 0, 0, 0, 0, 4, b'o', b'k', b'!', b'!'][..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().len(), 4);
    }

    #[test]
    fn raw_output_has_no_headers() {
        let bytes = encode_all(
            StreamMode::Raw,
            [
                Frame::new(StreamKind::Stdout, &b"out "[..]),
                Frame::new(StreamKind::Stderr, &b"err"[..]),
            ],
        )
        .unwrap();
        assert_eq!(&bytes[..], b"out err");
    }

    #[test]
    fn multiplexed_output_prefixes_each_payload_with_one_header() {
        let bytes = encode_all(
            StreamMode::Multiplexed,
            [
                Frame::new(StreamKind::Stdout, &b"out"[..]),
                Frame::new(StreamKind::Stderr, &b"err"[..]),
            ],
        )
        .unwrap();
        assert_eq!(bytes.len(), 2 * HEADER_LEN + 6);

        let frames = decode_all(&bytes).unwrap();
        assert_eq!(
            frames,
            vec![
                Frame::new(StreamKind::Stdout, &b"out"[..]),
                Frame::new(StreamKind::Stderr, &b"err"[..]),
            ]
        );
    }
}
