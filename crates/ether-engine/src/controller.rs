//! Public façade of the engine.
//!
//! ```text
//!   play(url) ──► transition task ──► StreamHandle::open ─► start(0) ─► wait_until_ready
//!                      │                                                    │
//!                      │               current? ──yes──► crossfade::run ◄───┘
//!                      │                                     │
//!                      └──────────────────────────────► promote ─► health + metadata polls
//!
//!   health poll ─► Dead/Disconnected ─► reconnect task ─► backoff ─► reopen ─► promote
//! ```
//!
//! Commands never fail: every backend error is logged and turned into a
//! state change or an [`EngineEvent`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ether_proto::config::EngineConfig;
use ether_proto::protocol::PlaybackState;

use crate::backend::{Channel, StreamBackend};
use crate::crossfade;
use crate::error::{Error, Result};
use crate::headers::{self, StreamFormat};
use crate::health::{ReconnectContext, StallLimits, StallTracker, Verdict};
use crate::metadata::{self, ChangeFilter, MetadataSnapshot, NowPlaying, TagClass};
use crate::scheduler::{Scheduler, TimerKind};
use crate::session::StreamHandle;

const EVENT_CAPACITY: usize = 256;

// ── events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    MetadataReceived {
        title: String,
        artist: String,
        source_url: String,
    },
    PlaybackStateChanged {
        is_playing: bool,
    },
    /// The connection to `url` died; an automatic reopen is scheduled.
    ReconnectRequired {
        url: String,
    },
    StateChanged {
        state: PlaybackState,
    },
}

impl From<MetadataSnapshot> for EngineEvent {
    fn from(s: MetadataSnapshot) -> Self {
        EngineEvent::MetadataReceived {
            title: s.title,
            artist: s.artist,
            source_url: s.source_url,
        }
    }
}

// ── internal state ────────────────────────────────────────────────────────────

type Handle<B> = Arc<StreamHandle<<B as StreamBackend>::Channel>>;

/// Handle slots.  `incoming` only exists while a transition is in flight.
struct Deck<C: Channel> {
    current: Option<Arc<StreamHandle<C>>>,
    incoming: Option<Arc<StreamHandle<C>>>,
}

struct InFlight {
    url: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl InFlight {
    /// Cancel and wait until the transition has cleaned up after itself.
    async fn abort(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("controller: transition to {} ended abnormally: {}", self.url, e);
        }
    }
}

#[derive(Default)]
struct Status {
    state: PlaybackState,
    /// Handle announced as playing, `None` once stop was announced.
    announced: Option<u64>,
}

fn guard<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct Inner<B: StreamBackend> {
    backend: B,
    timing: EngineConfig,
    deck: Mutex<Deck<B::Channel>>,
    inflight: Mutex<Option<InFlight>>,
    scheduler: Scheduler,
    events: broadcast::Sender<EngineEvent>,
    volume: StdMutex<f32>,
    fading: AtomicBool,
    status: StdMutex<Status>,
    now_playing: StdMutex<NowPlaying>,
    filter: StdMutex<ChangeFilter>,
    pending_meta: StdMutex<Option<(String, String)>>,
    tracker: StdMutex<Option<StallTracker>>,
    reconnect: StdMutex<Option<ReconnectContext>>,
    tag_watch: StdMutex<Option<JoinHandle<()>>>,
}

// ── public controller ─────────────────────────────────────────────────────────

/// Plays one stream at a time, crossfading between stations and recovering
/// from dropped connections.  Cheap to clone.
pub struct PlaybackController<B: StreamBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: StreamBackend> Clone for PlaybackController<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: StreamBackend> PlaybackController<B> {
    pub fn new(backend: B, timing: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let volume = timing.default_volume.clamp(0.0, 1.0);
        Self {
            inner: Arc::new(Inner {
                backend,
                timing,
                deck: Mutex::new(Deck {
                    current: None,
                    incoming: None,
                }),
                inflight: Mutex::new(None),
                scheduler: Scheduler::new(),
                events,
                volume: StdMutex::new(volume),
                fading: AtomicBool::new(false),
                status: StdMutex::new(Status::default()),
                now_playing: StdMutex::new(NowPlaying::default()),
                filter: StdMutex::new(ChangeFilter::default()),
                pending_meta: StdMutex::new(None),
                tracker: StdMutex::new(None),
                reconnect: StdMutex::new(None),
                tag_watch: StdMutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Play a bare URL.  The URL doubles as the fallback title.
    pub async fn play(&self, url: &str) {
        self.inner.play("", url).await;
    }

    pub async fn play_station(&self, title: &str, url: &str) {
        self.inner.play(title, url).await;
    }

    pub async fn pause(&self) {
        self.inner.pause().await;
    }

    pub async fn resume(&self) {
        self.inner.resume().await;
    }

    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Linear 0.0–1.0.  Queued while a crossfade is running.
    pub async fn set_volume(&self, volume: f32) {
        self.inner.set_volume(volume).await;
    }

    pub fn volume(&self) -> f32 {
        self.inner.volume()
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.state()
    }

    pub fn now_playing(&self) -> NowPlaying {
        guard(&self.inner.now_playing).clone()
    }

    pub async fn current_url(&self) -> Option<String> {
        let deck = self.inner.deck.lock().await;
        deck.current.as_ref().map(|h| h.url().to_string())
    }

    pub async fn current_format(&self) -> Option<StreamFormat> {
        let current = self.inner.deck.lock().await.current.clone();
        current.and_then(|h| h.channel().format())
    }

    /// Decoded response headers of the current stream.
    pub async fn http_headers(&self) -> Vec<(String, String)> {
        let Some(current) = self.inner.deck.lock().await.current.clone() else {
            return Vec::new();
        };
        let tags = current.channel().tags();
        tags.get(TagClass::Http)
            .or_else(|| tags.get(TagClass::Icy))
            .map(headers::parse)
            .unwrap_or_default()
    }
}

// ── controller internals ──────────────────────────────────────────────────────

impl<B: StreamBackend> Inner<B> {
    fn emit(&self, event: EngineEvent) {
        debug!("controller: emit {:?}", event);
        let _ = self.events.send(event);
    }

    fn volume(&self) -> f32 {
        *guard(&self.volume)
    }

    fn state(&self) -> PlaybackState {
        guard(&self.status).state
    }

    fn set_state(&self, state: PlaybackState) {
        let changed = {
            let mut status = guard(&self.status);
            let changed = status.state != state;
            status.state = state;
            changed
        };
        if changed {
            self.emit(EngineEvent::StateChanged { state });
        }
    }

    fn announce_playing(&self, handle_id: u64) {
        let changed = {
            let mut status = guard(&self.status);
            let changed = status.announced != Some(handle_id);
            status.announced = Some(handle_id);
            changed
        };
        if changed {
            self.emit(EngineEvent::PlaybackStateChanged { is_playing: true });
        }
    }

    fn announce_stopped(&self) {
        let was_playing = guard(&self.status).announced.take().is_some();
        if was_playing {
            self.emit(EngineEvent::PlaybackStateChanged { is_playing: false });
        }
    }

    fn stall_limits(&self) -> StallLimits {
        StallLimits {
            grace: self.timing.stall_grace(),
            frozen: self.timing.stall_frozen(),
        }
    }

    // ── play ──────────────────────────────────────────────────────────────────

    async fn play(self: &Arc<Self>, title: &str, url: &str) {
        let url = url.trim();
        if url.is_empty() {
            warn!("controller: ignoring play with empty URL");
            return;
        }

        let mut inflight = self.inflight.lock().await;

        let current = self.deck.lock().await.current.clone();
        if current.as_ref().is_some_and(|h| h.url() == url) {
            if let Some(prev) = inflight.take() {
                prev.abort().await;
            }
            drop(inflight);
            if self.state() == PlaybackState::Paused {
                self.resume().await;
            }
            return;
        }

        if inflight
            .as_ref()
            .is_some_and(|f| f.url == url && !f.task.is_finished())
        {
            debug!("controller: {} is already being prepared", url);
            return;
        }
        if let Some(prev) = inflight.take() {
            debug!("controller: superseding transition to {}", prev.url);
            prev.abort().await;
        }

        // An explicit play supersedes automatic recovery.
        self.scheduler.cancel(TimerKind::Reconnect);
        *guard(&self.reconnect) = None;
        let orphan = self.deck.lock().await.incoming.take();
        if let Some(handle) = orphan {
            handle.close(&self.timing).await;
        }

        let previous = std::mem::replace(&mut *guard(&self.now_playing), NowPlaying::begin(title, url));
        guard(&self.filter).reset();
        self.arm_connection_timeout();
        if current.is_none() {
            self.set_state(PlaybackState::Connecting);
        }

        info!("controller: play {}", url);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            self.clone()
                .transition(url.to_string(), previous, cancel.clone()),
        );
        *inflight = Some(InFlight {
            url: url.to_string(),
            cancel,
            task,
        });
    }

    async fn transition(self: Arc<Self>, url: String, previous: NowPlaying, cancel: CancellationToken) {
        match self.run_transition(&url, &cancel).await {
            Ok(()) => {}
            Err(Error::TransitionAborted { .. }) => {
                debug!("controller: transition to {} aborted", url);
            }
            Err(e) => {
                warn!("controller: {}", e);
                self.transition_failed(&url, previous).await;
            }
        }
    }

    async fn run_transition(self: &Arc<Self>, url: &str, cancel: &CancellationToken) -> Result<()> {
        let handle = Arc::new(StreamHandle::open(&self.backend, url, &self.timing, cancel).await?);
        let outgoing = {
            let mut deck = self.deck.lock().await;
            deck.incoming = Some(handle.clone());
            deck.current.clone()
        };

        if let Err(e) = self.prepare(&handle, outgoing.as_deref(), cancel).await {
            self.discard_incoming(&handle, outgoing.as_deref()).await;
            return Err(e);
        }

        self.promote(handle).await;

        if let Some(old) = outgoing {
            sleep(self.timing.settle()).await;
            old.release().await;
        }
        Ok(())
    }

    /// Start the incoming handle silent, wait for it, and fade it in.
    async fn prepare(
        &self,
        handle: &StreamHandle<B::Channel>,
        outgoing: Option<&StreamHandle<B::Channel>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        handle.start(0.0).await?;
        handle.wait_until_ready(&self.timing, cancel).await?;

        let Some(old) = outgoing else {
            return Ok(());
        };
        self.fading.store(true, Ordering::SeqCst);
        let faded = crossfade::run(
            handle,
            old,
            self.volume(),
            self.timing.crossfade(),
            self.timing.crossfade_step(),
            cancel,
        )
        .await;
        self.fading.store(false, Ordering::SeqCst);
        faded
    }

    /// Abort path: silence and free the incoming handle, restore the
    /// outgoing one.
    async fn discard_incoming(
        &self,
        handle: &StreamHandle<B::Channel>,
        outgoing: Option<&StreamHandle<B::Channel>>,
    ) {
        {
            let mut deck = self.deck.lock().await;
            if deck.incoming.as_ref().is_some_and(|h| h.id() == handle.id()) {
                deck.incoming = None;
            }
        }
        handle.close(&self.timing).await;
        if let Some(old) = outgoing {
            if let Err(e) = old.set_volume(self.volume()).await {
                debug!("controller: restoring volume on {} failed: {}", old.url(), e);
            }
        }
    }

    async fn transition_failed(&self, url: &str, previous: NowPlaying) {
        let has_current = self.deck.lock().await.current.is_some();
        if has_current {
            let mut now_playing = guard(&self.now_playing);
            if now_playing.source_url == url {
                *now_playing = previous;
            }
        } else {
            self.announce_stopped();
            self.set_state(PlaybackState::Failed);
        }
    }

    /// Make `handle` current and start watching it.
    async fn promote(self: &Arc<Self>, handle: Handle<B>) {
        self.detach_tags();
        {
            let mut deck = self.deck.lock().await;
            deck.current = Some(handle.clone());
            if deck.incoming.as_ref().is_some_and(|h| h.id() == handle.id()) {
                deck.incoming = None;
            }
        }
        // Volume changes queued during the fade land here.
        if let Err(e) = handle.set_volume(self.volume()).await {
            warn!("controller: setting volume on {} failed: {}", handle.url(), e);
        }

        info!("controller: now playing {}", handle.url());
        guard(&self.filter).reset();
        self.set_state(PlaybackState::Playing);
        self.announce_playing(handle.id());
        self.start_monitoring(&handle);
        self.attach_tags(&handle);
        self.poll_metadata(&handle);
    }

    // ── monitoring ────────────────────────────────────────────────────────────

    fn start_monitoring(self: &Arc<Self>, handle: &Handle<B>) {
        *guard(&self.tracker) = Some(StallTracker::attach(
            self.stall_limits(),
            Instant::now(),
            handle.channel().byte_position(),
        ));

        let weak = Arc::downgrade(self);
        self.scheduler
            .every(TimerKind::HealthPoll, self.timing.health_poll(), move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return false;
                    };
                    inner.health_tick().await;
                    true
                }
            });

        let weak = Arc::downgrade(self);
        self.scheduler
            .every(TimerKind::MetadataPoll, self.timing.metadata_poll(), move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return false;
                    };
                    inner.metadata_tick().await;
                    true
                }
            });
    }

    fn stop_monitoring(&self) {
        self.scheduler.cancel(TimerKind::HealthPoll);
        self.scheduler.cancel(TimerKind::MetadataPoll);
        *guard(&self.tracker) = None;
    }

    /// A `play()` that is still preparing its handle.
    fn transition_running(inflight: &Option<InFlight>) -> bool {
        inflight.as_ref().is_some_and(|f| !f.task.is_finished())
    }

    async fn health_tick(self: &Arc<Self>) {
        if self.scheduler.is_armed(TimerKind::Reconnect) {
            return;
        }
        // The handle being watched is about to be replaced.
        match self.inflight.try_lock() {
            Ok(inflight) if !Self::transition_running(&inflight) => {}
            _ => return,
        }
        let Some(handle) = self.deck.lock().await.current.clone() else {
            return;
        };
        let state = handle.channel().state().await;
        let position = handle.channel().byte_position();
        let verdict = match guard(&self.tracker).as_mut() {
            Some(tracker) => tracker.observe(state, position, Instant::now()),
            None => return,
        };

        match verdict {
            Verdict::Healthy => {
                if let Some(ctx) = guard(&self.reconnect).as_mut() {
                    ctx.reset();
                }
                if self.state() == PlaybackState::Stalled {
                    info!("controller: {} recovered from buffering", handle.url());
                    self.set_state(PlaybackState::Playing);
                }
            }
            Verdict::Buffering => {
                if self.state() != PlaybackState::Stalled {
                    info!("controller: {} stalled, watching byte position", handle.url());
                    self.set_state(PlaybackState::Stalled);
                }
            }
            Verdict::Dead => {
                let err = Error::StallDisconnect {
                    url: handle.url().to_string(),
                };
                warn!("controller: {}", err);
                self.begin_reconnect(handle.url());
            }
            Verdict::Disconnected => {
                warn!("controller: {} stopped unexpectedly", handle.url());
                self.begin_reconnect(handle.url());
            }
            Verdict::Idle => {}
        }
    }

    async fn metadata_tick(self: &Arc<Self>) {
        if !matches!(self.state(), PlaybackState::Playing | PlaybackState::Stalled) {
            return;
        }
        let Some(handle) = self.deck.lock().await.current.clone() else {
            return;
        };
        self.poll_metadata(&handle);
    }

    // ── metadata ──────────────────────────────────────────────────────────────

    /// No tag text counts as an empty title, which the debounce turns into
    /// the station-title fallback.
    fn poll_metadata(self: &Arc<Self>, handle: &Handle<B>) {
        match metadata::read(&handle.channel().tags()) {
            Some((class, text)) => {
                debug!("controller: {:?} tag on {}: {:?}", class, handle.url(), text);
                self.on_raw_metadata(handle.url(), &text);
            }
            None => self.on_raw_metadata(handle.url(), ""),
        }
    }

    fn on_raw_metadata(self: &Arc<Self>, url: &str, raw: &str) {
        if !guard(&self.filter).is_new(url, raw) {
            return;
        }
        *guard(&self.pending_meta) = Some((url.to_string(), raw.to_string()));

        let weak = Arc::downgrade(self);
        self.scheduler.arm(
            TimerKind::Debounce,
            self.timing.metadata_debounce(),
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.flush_metadata().await;
                }
            },
        );
    }

    /// Apply the last raw text of a burst, unless its URL went stale.
    async fn flush_metadata(&self) {
        let Some((url, raw)) = guard(&self.pending_meta).take() else {
            return;
        };
        let current_url = {
            let deck = self.deck.lock().await;
            deck.current.as_ref().map(|h| h.url().to_string())
        };
        if current_url.as_deref() != Some(url.as_str()) {
            debug!("controller: dropping metadata for stale {}", url);
            return;
        }
        let snapshot = {
            let mut now_playing = guard(&self.now_playing);
            if now_playing.source_url != url {
                None
            } else {
                now_playing.apply(&raw)
            }
        };
        if let Some(snapshot) = snapshot {
            self.emit(snapshot.into());
        }
    }

    /// Watch the handle's tag updates; the stand-in for a decoder-side
    /// metadata callback.
    fn attach_tags(self: &Arc<Self>, handle: &Handle<B>) {
        let mut updates = handle.channel().tag_updates();
        let weak = Arc::downgrade(self);
        let handle = handle.clone();
        let task = tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.poll_metadata(&handle);
            }
        });
        if let Some(old) = guard(&self.tag_watch).replace(task) {
            old.abort();
        }
    }

    fn detach_tags(&self) {
        if let Some(task) = guard(&self.tag_watch).take() {
            task.abort();
        }
    }

    fn arm_connection_timeout(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.scheduler.arm(
            TimerKind::ConnectionTimeout,
            self.timing.connection_timeout(),
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let snapshot = guard(&inner.now_playing).fallback();
                if let Some(snapshot) = snapshot {
                    debug!("controller: no metadata in time, showing station title");
                    inner.emit(snapshot.into());
                }
            },
        );
    }

    // ── reconnection ──────────────────────────────────────────────────────────

    fn begin_reconnect(self: &Arc<Self>, url: &str) {
        let inner = self.clone();
        let url = url.to_string();
        self.scheduler
            .arm(TimerKind::Reconnect, Duration::ZERO, async move {
                inner.reconnect_loop(url).await;
            });
    }

    /// Claim the next attempt for `url`; `None` once exhausted.
    fn next_attempt(&self, url: &str) -> Option<u32> {
        let mut ctx = guard(&self.reconnect);
        if ctx.as_ref().map_or(true, |c| c.url != url) {
            *ctx = Some(ReconnectContext::new(url, self.timing.max_reconnect_attempts));
        }
        ctx.as_mut().and_then(|c| c.next_attempt())
    }

    async fn reconnect_loop(self: Arc<Self>, url: String) {
        self.stop_monitoring();
        let max = self.timing.max_reconnect_attempts;

        loop {
            let Some(attempt) = self.next_attempt(&url) else {
                let err = Error::ReconnectExhausted {
                    url: url.clone(),
                    attempts: max,
                };
                warn!("controller: {}", err);
                *guard(&self.reconnect) = None;
                self.teardown_current(&url).await;
                self.announce_stopped();
                self.set_state(PlaybackState::Failed);
                return;
            };

            info!("controller: reconnect attempt {}/{} for {}", attempt, max, url);
            self.teardown_current(&url).await;
            self.announce_stopped();
            self.set_state(PlaybackState::Stopped);
            self.emit(EngineEvent::ReconnectRequired { url: url.clone() });

            sleep(self.timing.reconnect_backoff(attempt)).await;
            self.set_state(PlaybackState::Connecting);

            match self.reopen(&url).await {
                Ok(handle) => {
                    // Held across promote so a concurrent play() either sees
                    // the reopened handle as current or supersedes it here.
                    let inflight = self.inflight.lock().await;
                    let wanted = guard(&self.now_playing).source_url == url;
                    if Self::transition_running(&inflight) || !wanted {
                        drop(inflight);
                        info!("controller: {} was superseded, dropping reconnect", url);
                        self.discard_incoming(&handle, None).await;
                        return;
                    }
                    if let Some(ctx) = guard(&self.reconnect).as_mut() {
                        ctx.reset();
                    }
                    self.promote(handle).await;
                    return;
                }
                Err(e) => warn!("controller: reconnect to {} failed: {}", url, e),
            }
        }
    }

    /// The reopened handle sits in the incoming slot while it gets ready,
    /// so a `play()` or `stop()` arriving meanwhile closes it.
    async fn reopen(&self, url: &str) -> Result<Handle<B>> {
        let cancel = CancellationToken::new();
        let handle = Arc::new(StreamHandle::open(&self.backend, url, &self.timing, &cancel).await?);
        self.deck.lock().await.incoming = Some(handle.clone());
        if let Err(e) = self.prepare(&handle, None, &cancel).await {
            self.discard_incoming(&handle, None).await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Detach and free the current handle if it still plays `url`.
    async fn teardown_current(&self, url: &str) {
        self.detach_tags();
        let dead = {
            let mut deck = self.deck.lock().await;
            if deck.current.as_ref().is_some_and(|h| h.url() == url) {
                deck.current.take()
            } else {
                None
            }
        };
        if let Some(handle) = dead {
            handle.release().await;
        }
    }

    // ── transport ─────────────────────────────────────────────────────────────

    async fn pause(&self) {
        if !matches!(self.state(), PlaybackState::Playing | PlaybackState::Stalled) {
            return;
        }
        let Some(handle) = self.deck.lock().await.current.clone() else {
            return;
        };
        handle.pause().await;
        self.stop_monitoring();
        self.set_state(PlaybackState::Paused);
        self.announce_stopped();
    }

    async fn resume(self: &Arc<Self>) {
        if self.state() != PlaybackState::Paused {
            return;
        }
        let Some(handle) = self.deck.lock().await.current.clone() else {
            return;
        };
        handle.resume().await;
        self.set_state(PlaybackState::Playing);
        self.announce_playing(handle.id());
        self.start_monitoring(&handle);
    }

    async fn stop(&self) {
        let mut inflight = self.inflight.lock().await;
        if let Some(prev) = inflight.take() {
            prev.abort().await;
        }

        self.scheduler.cancel_all();
        self.detach_tags();
        *guard(&self.reconnect) = None;
        *guard(&self.tracker) = None;
        *guard(&self.pending_meta) = None;

        let (current, incoming) = {
            let mut deck = self.deck.lock().await;
            (deck.current.take(), deck.incoming.take())
        };
        if let Some(handle) = incoming {
            handle.close(&self.timing).await;
        }
        if let Some(handle) = current {
            handle.close(&self.timing).await;
        }
        drop(inflight);

        self.announce_stopped();
        self.set_state(PlaybackState::Stopped);
        info!("controller: stopped");
    }

    async fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        *guard(&self.volume) = volume;

        if self.fading.load(Ordering::SeqCst) {
            debug!("controller: crossfade running, volume {:.2} queued", volume);
            return;
        }
        let current = self.deck.lock().await.current.clone();
        if let Some(handle) = current {
            if let Err(e) = handle.set_volume(volume).await {
                warn!("controller: setting volume on {} failed: {}", handle.url(), e);
            }
        }
    }
}
