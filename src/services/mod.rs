//! Session services: credentials, resolution, the muxer pipeline and
//! session lifecycle.

pub mod chunk_channel;
pub mod credential_store;
pub mod ffmpeg_command_builder;
pub mod muxing_process;
pub mod session_manager;
pub mod stderr_log;
pub mod stream_session;
pub mod upstream_resolver;

pub use chunk_channel::{ChunkChannel, PutResult, Received};
pub use credential_store::{CredentialStore, SharedCredentials};
pub use muxing_process::{MuxerEvent, MuxingProcess};
pub use session_manager::{PlaybackHandle, SessionManager};
pub use stream_session::{Readiness, SessionStats, StreamSession};
pub use upstream_resolver::{BilibiliResolver, StaticResolver, UpstreamResolver};
