//! One decode-and-play handle bound to one URL.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ether_proto::config::EngineConfig;

use crate::backend::{Channel, ChannelState, StreamBackend};
use crate::crossfade;
use crate::error::{Error, Result};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// An open channel plus the bookkeeping the engine needs around it.
///
/// Owned by exactly one deck slot at a time.  Dropping it without
/// [`StreamHandle::close`] leaves cleanup to the backend.
pub struct StreamHandle<C: Channel> {
    id: u64,
    channel: C,
    /// Last volume written to the channel, as `f32` bits.
    volume: AtomicU32,
}

impl<C: Channel> StreamHandle<C> {
    fn new(channel: C) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            channel,
            volume: AtomicU32::new(0f32.to_bits()),
        }
    }

    /// Open `url`, retrying once after `open_retry`.
    pub async fn open<B>(
        backend: &B,
        url: &str,
        timing: &EngineConfig,
        cancel: &CancellationToken,
    ) -> Result<Self>
    where
        B: StreamBackend<Channel = C>,
    {
        let aborted = || Error::TransitionAborted { url: url.to_string() };
        let mut reason = String::new();

        for attempt in 0..2 {
            if attempt > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(aborted()),
                    _ = sleep(timing.open_retry()) => {}
                }
            }
            let opened = tokio::select! {
                _ = cancel.cancelled() => return Err(aborted()),
                r = backend.open(url) => r,
            };
            match opened {
                Ok(channel) => {
                    let handle = Self::new(channel);
                    debug!("session: opened handle {} for {}", handle.id, url);
                    return Ok(handle);
                }
                Err(e) => {
                    debug!("session: open attempt {} for {} failed: {:#}", attempt + 1, url, e);
                    reason = format!("{:#}", e);
                }
            }
        }

        Err(Error::ConnectFailed {
            url: url.to_string(),
            reason,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        self.channel.url()
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub async fn set_volume(&self, volume: f32) -> Result<()> {
        let volume = volume.clamp(0.0, 1.0);
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
        self.channel.set_volume(volume).await?;
        Ok(())
    }

    /// Prime at `volume` and start decoding.
    pub async fn start(&self, volume: f32) -> Result<()> {
        self.set_volume(volume).await?;
        self.channel.play().await?;
        Ok(())
    }

    /// Poll until the channel produces audio or ICY tags show up.
    ///
    /// Must be called right after [`StreamHandle::start`].
    pub async fn wait_until_ready(
        &self,
        timing: &EngineConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timing.ready_timeout();

        loop {
            if self.channel.tags().has_icy() {
                debug!("session: {} ready on ICY tags", self.url());
                return Ok(());
            }
            let state = self.channel.state().await;
            if matches!(state, ChannelState::Playing | ChannelState::Stalled)
                && started.elapsed() >= timing.min_ready()
            {
                debug!("session: {} ready in state {:?}", self.url(), state);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::NotReadyTimeout {
                    url: self.url().to_string(),
                    timeout_ms: timing.ready_timeout_ms,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::TransitionAborted { url: self.url().to_string() });
                }
                _ = sleep(timing.ready_poll()) => {}
            }
        }
    }

    pub async fn pause(&self) {
        if self.channel.state().await == ChannelState::Paused {
            return;
        }
        if let Err(e) = self.channel.pause().await {
            debug!("session: pause {} failed: {:#}", self.url(), e);
        }
    }

    pub async fn resume(&self) {
        if self.channel.state().await != ChannelState::Paused {
            return;
        }
        if let Err(e) = self.channel.resume().await {
            debug!("session: resume {} failed: {:#}", self.url(), e);
        }
    }

    /// Fade to silence, then release.  Never fails.
    pub async fn close(&self, timing: &EngineConfig) {
        crossfade::fade_out(self, timing.crossfade_step()).await;
        self.release().await;
    }

    /// Release without fading; for handles whose connection is already gone.
    pub async fn release(&self) {
        self.channel.close().await;
        info!("session: closed handle {} ({})", self.id, self.url());
    }
}
