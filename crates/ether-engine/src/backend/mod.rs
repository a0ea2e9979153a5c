//! Decoder backends.
//!
//! The engine never decodes audio itself.  A [`StreamBackend`] opens network
//! streams into [`Channel`]s: independent decode-and-play units with their
//! own volume, state and captured tags.  Two channels can play at once,
//! which is what makes crossfading possible.

pub mod icy;
pub mod mpv;
pub mod tap;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::headers::StreamFormat;
use crate::metadata::TagSet;

pub use mpv::MpvBackend;

/// Decoder-level state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not started, ended, or the connection is gone.
    Stopped,
    Playing,
    Paused,
    /// Playing but the buffer ran dry.
    Stalled,
}

#[async_trait]
pub trait StreamBackend: Send + Sync + 'static {
    type Channel: Channel;

    /// Connect to `url` and create a channel for it.  The channel is silent
    /// until [`Channel::play`].
    async fn open(&self, url: &str) -> anyhow::Result<Self::Channel>;
}

#[async_trait]
pub trait Channel: Send + Sync + 'static {
    fn url(&self) -> &str;

    async fn state(&self) -> ChannelState;

    /// Bytes of audio delivered to the decoder so far.  Frozen while the
    /// network is dead, advancing while it merely re-buffers.
    fn byte_position(&self) -> u64;

    /// `volume` is linear, 0.0–1.0.
    async fn set_volume(&self, volume: f32) -> anyhow::Result<()>;

    async fn play(&self) -> anyhow::Result<()>;

    async fn pause(&self) -> anyhow::Result<()>;

    async fn resume(&self) -> anyhow::Result<()>;

    /// Release decoder resources.  Must not fail, even on a dead channel.
    async fn close(&self);

    /// Snapshot of the raw tag buffers captured so far.
    fn tags(&self) -> TagSet;

    fn format(&self) -> Option<StreamFormat>;

    /// Ticks every time a new tag buffer was captured.
    fn tag_updates(&self) -> watch::Receiver<u64>;
}
