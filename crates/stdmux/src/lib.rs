//! stdmux: attach to container standard streams and multiplex stdout/stderr
//! over a single duplex transport.

pub mod broadcast;
mod checksum_cache;
pub mod container;
pub mod launcher;
pub mod mux;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use broadcast::{
    BroadcastConfig, BroadcasterClosed, ExitReason, OutputBroadcaster, SinkError, SinkHandle,
    SinkId, SinkOutcome,
};
pub use checksum_cache::{CacheError, ChecksumCache};
pub use container::{ContainerConfig, ContainerIo, ProcessIo, RunState};
pub use launcher::{CommandLauncher, LaunchError, LaunchSpec, ProcessLauncher};
pub use mux::{
    CodecError, Frame, FrameCodec, StreamKind, StreamMode, StreamSelection, decode_stream,
    decode_stream_with,
};
pub use registry::{ContainerRegistry, RegistryError, StartError, StartOutcome};
pub use session::{
    AttachError, AttachOptions, AttachSession, CloseReason, SessionId, SessionState,
    SessionSummary,
};
pub use transport::{AttachStream, ServerConfig, serve};
