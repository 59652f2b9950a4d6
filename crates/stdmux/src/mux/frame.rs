//! Wire types for the multiplexed stream.
//!
//! Each frame is an 8-byte header followed by its payload:
//!
//! ```text
//! [kind: u8][0x00 0x00 0x00][length: u32 big-endian][payload: length bytes]
//! ```

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

/// Size of a frame header on the wire.
pub const HEADER_LEN: usize = 8;

/// Media type for raw (TTY) attach streams.
pub const RAW_STREAM_MEDIA_TYPE: &str = "application/vnd.docker.raw-stream";

/// Media type for framed (non-TTY) attach streams.
pub const MULTIPLEXED_STREAM_MEDIA_TYPE: &str = "application/vnd.docker.multiplexed-stream";

/// Standard stream a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum StreamKind {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

impl StreamKind {
    /// Parse a header kind byte. Anything outside 0..=2 is invalid.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One payload tagged with the stream it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: StreamKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Output streams a consumer asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamSelection {
    pub stdout: bool,
    pub stderr: bool,
}

impl StreamSelection {
    pub const ALL: Self = Self {
        stdout: true,
        stderr: true,
    };

    pub const NONE: Self = Self {
        stdout: false,
        stderr: false,
    };

    pub fn new(stdout: bool, stderr: bool) -> Self {
        Self { stdout, stderr }
    }

    /// stdin frames are never part of container output.
    pub fn includes(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Stdout => self.stdout,
            StreamKind::Stderr => self.stderr,
            StreamKind::Stdin => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.stdout && !self.stderr
    }
}

/// How output is written to an attached consumer.
///
/// Fixed per container: a TTY container always streams raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Bytes forwarded unmodified (TTY already merged stdout/stderr).
    Raw,
    /// Each payload preceded by a frame header.
    Multiplexed,
}

impl StreamMode {
    pub fn from_tty(tty: bool) -> Self {
        if tty { Self::Raw } else { Self::Multiplexed }
    }

    pub fn is_multiplexed(&self) -> bool {
        matches!(self, Self::Multiplexed)
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Raw => RAW_STREAM_MEDIA_TYPE,
            Self::Multiplexed => MULTIPLEXED_STREAM_MEDIA_TYPE,
        }
    }

    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            RAW_STREAM_MEDIA_TYPE => Some(Self::Raw),
            MULTIPLEXED_STREAM_MEDIA_TYPE => Some(Self::Multiplexed),
            _ => None,
        }
    }
}
