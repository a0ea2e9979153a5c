#![allow(dead_code)]

//! Scripted in-memory decoder backend for controller tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use ether_engine::metadata::TagSet;
use ether_engine::{Channel, ChannelState, EngineEvent, StreamBackend, StreamFormat};
use ether_proto::config::EngineConfig;

pub const STATION_A: &str = "http://radio.test/a";
pub const STATION_B: &str = "http://radio.test/b";
pub const STATION_C: &str = "http://radio.test/c";

/// Bytes a playing fake channel advances per position read.
const BYTES_PER_READ: u64 = 4096;

// ── channel ───────────────────────────────────────────────────────────────────

pub struct FakeState {
    pub url: String,
    state: Mutex<ChannelState>,
    position: AtomicU64,
    advancing: AtomicBool,
    volumes: Mutex<Vec<f32>>,
    closed: AtomicBool,
    tags: Mutex<TagSet>,
    tag_tx: watch::Sender<u64>,
}

impl FakeState {
    fn new(url: &str, tags: TagSet) -> Self {
        let (tag_tx, _) = watch::channel(0);
        Self {
            url: url.to_string(),
            state: Mutex::new(ChannelState::Stopped),
            position: AtomicU64::new(0),
            advancing: AtomicBool::new(true),
            volumes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            tags: Mutex::new(tags),
            tag_tx,
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap() = state;
    }

    /// Stall with a frozen byte position: the connection is dead.
    pub fn freeze(&self) {
        self.advancing.store(false, Ordering::SeqCst);
        self.set_state(ChannelState::Stalled);
    }

    /// Stall while bytes keep trickling in: legitimate re-buffering.
    pub fn rebuffer(&self) {
        self.advancing.store(true, Ordering::SeqCst);
        self.set_state(ChannelState::Stalled);
    }

    pub fn volume(&self) -> f32 {
        self.volumes.lock().unwrap().last().copied().unwrap_or(0.0)
    }

    pub fn volume_history(&self) -> Vec<f32> {
        self.volumes.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_tags(&self, tags: TagSet) {
        *self.tags.lock().unwrap() = tags;
        self.tag_tx.send_modify(|n| *n += 1);
    }
}

pub struct FakeChannel(Arc<FakeState>);

#[async_trait]
impl Channel for FakeChannel {
    fn url(&self) -> &str {
        &self.0.url
    }

    async fn state(&self) -> ChannelState {
        self.0.state()
    }

    fn byte_position(&self) -> u64 {
        if self.0.advancing.load(Ordering::SeqCst) && self.0.state() != ChannelState::Stopped {
            self.0.position.fetch_add(BYTES_PER_READ, Ordering::SeqCst) + BYTES_PER_READ
        } else {
            self.0.position.load(Ordering::SeqCst)
        }
    }

    async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        if self.0.is_closed() {
            anyhow::bail!("channel closed");
        }
        self.0.volumes.lock().unwrap().push(volume);
        Ok(())
    }

    async fn play(&self) -> anyhow::Result<()> {
        self.0.set_state(ChannelState::Playing);
        Ok(())
    }

    async fn pause(&self) -> anyhow::Result<()> {
        self.0.set_state(ChannelState::Paused);
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.0.set_state(ChannelState::Playing);
        Ok(())
    }

    async fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
        self.0.set_state(ChannelState::Stopped);
    }

    fn tags(&self) -> TagSet {
        self.0.tags.lock().unwrap().clone()
    }

    fn format(&self) -> Option<StreamFormat> {
        Some(StreamFormat::Mp3)
    }

    fn tag_updates(&self) -> watch::Receiver<u64> {
        self.0.tag_tx.subscribe()
    }
}

// ── backend ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    failing: HashSet<String>,
    seeded_tags: HashMap<String, TagSet>,
    opened: Vec<Arc<FakeState>>,
    attempts: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    script: Arc<Mutex<Script>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every open of `url` fails until [`FakeBackend::heal`].
    pub fn fail(&self, url: &str) {
        self.script.lock().unwrap().failing.insert(url.to_string());
    }

    pub fn heal(&self, url: &str) {
        self.script.lock().unwrap().failing.remove(url);
    }

    /// Tags every future channel for `url` starts with.
    pub fn seed_tags(&self, url: &str, tags: TagSet) {
        self.script
            .lock()
            .unwrap()
            .seeded_tags
            .insert(url.to_string(), tags);
    }

    /// Open calls for `url`, failed ones included.
    pub fn open_attempts(&self, url: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .attempts
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn channels(&self, url: &str) -> Vec<Arc<FakeState>> {
        self.script
            .lock()
            .unwrap()
            .opened
            .iter()
            .filter(|c| c.url == url)
            .cloned()
            .collect()
    }

    pub fn latest(&self, url: &str) -> Arc<FakeState> {
        self.channels(url)
            .pop()
            .unwrap_or_else(|| panic!("no channel was opened for {url}"))
    }
}

#[async_trait]
impl StreamBackend for FakeBackend {
    type Channel = FakeChannel;

    async fn open(&self, url: &str) -> anyhow::Result<FakeChannel> {
        let mut script = self.script.lock().unwrap();
        *script.attempts.entry(url.to_string()).or_default() += 1;
        if script.failing.contains(url) {
            anyhow::bail!("connection refused");
        }
        let tags = script.seeded_tags.get(url).cloned().unwrap_or_default();
        let state = Arc::new(FakeState::new(url, tags));
        script.opened.push(state.clone());
        Ok(FakeChannel(state))
    }
}

// ── helpers ───────────────────────────────────────────────────────────────────

pub fn timing() -> EngineConfig {
    EngineConfig::default()
}

pub fn icy_title(title: &str) -> TagSet {
    TagSet {
        meta: Some(format!("StreamTitle='{}';", title).into_bytes()),
        ..TagSet::default()
    }
}

/// Wait (in virtual time) for the first event matching `pred`.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<EngineEvent>,
    within: Duration,
    pred: impl Fn(&EngineEvent) -> bool,
) -> Option<EngineEvent> {
    tokio::time::timeout(within, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Every event emitted during the next `window` of virtual time.
pub async fn collect_for(
    rx: &mut broadcast::Receiver<EngineEvent>,
    window: Duration,
) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        events.push(event);
    }
    events
}

pub fn playing(is_playing: bool) -> impl Fn(&EngineEvent) -> bool {
    move |e| matches!(e, EngineEvent::PlaybackStateChanged { is_playing: p } if *p == is_playing)
}

pub fn count_reconnects(events: &[EngineEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, EngineEvent::ReconnectRequired { .. }))
        .count()
}
