//! Multiplexed stream format for combined stdout/stderr output.
//!
//! When a container runs without a TTY, its stdout and stderr travel over one
//! transport as a sequence of frames, each tagged with the stream it came from.
//! With a TTY the terminal has already merged both streams, so bytes are sent
//! unmodified and no framing is applied.
//!
//! # Architecture
//!
//! - **frame**: Wire types (StreamKind, Frame, StreamSelection, StreamMode)
//! - **codec**: Frame encoder/decoder for FramedRead/FramedWrite
//! - **demux**: Reads a framed stream back into separate stdout/stderr sinks

pub mod codec;
pub mod demux;
pub mod frame;

pub use codec::{CodecError, FrameCodec, OutputCodec, encode_all, encode_frame};
pub use demux::{decode_stream, decode_stream_with};
pub use frame::{
    Frame, HEADER_LEN, MULTIPLEXED_STREAM_MEDIA_TYPE, RAW_STREAM_MEDIA_TYPE, StreamKind, StreamMode,
    StreamSelection,
};
