//! Streaming engine: opens radio streams through a decoder backend,
//! crossfades between stations, watches connection health and turns raw
//! stream tags into now-playing metadata.

pub mod backend;
pub mod controller;
pub mod crossfade;
pub mod encoding;
pub mod error;
pub mod headers;
pub mod health;
pub mod metadata;
pub mod scheduler;
pub mod session;

pub use backend::{Channel, ChannelState, MpvBackend, StreamBackend};
pub use controller::{EngineEvent, PlaybackController};
pub use error::{Error, Result};
pub use ether_proto::protocol::PlaybackState;
pub use headers::StreamFormat;
pub use metadata::{MetadataSnapshot, NowPlaying};
