/// mpv-backed decoder channels.
///
/// Each channel owns its own mpv process, so two can play side by side
/// during a crossfade.  mpv never talks to the station directly: it plays
/// the channel's tap URL, and the tap supplies tags and byte counts.
///
/// ```text
///   MpvBackend::open(url)
///         │
///         ├── TapServer::connect(url)        ← upstream opened, headers captured
///         └── spawn mpv (--volume=0 --idle)
///                 ├── writer_task  ← MpvRequest via mpsc → socket
///                 └── reader_task  ← JSON lines from socket
///                                     ├── response (request_id) → oneshot
///                                     └── event                 → event log
/// ```
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use ether_proto::config::BackendConfig;
use ether_proto::platform;

use super::tap::{TapServer, TapStream};
use super::{Channel, ChannelState, StreamBackend};
use crate::headers::StreamFormat;
use crate::metadata::TagSet;

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

const IPC_TIMEOUT: Duration = Duration::from_secs(5);
const QUIT_GRACE: Duration = Duration::from_secs(1);

// ── internal channel types ────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// `Some(reason)` for end-file events.
    pub fn end_reason(&self) -> Option<&str> {
        if self.event_name()? == "end-file" {
            self.raw.get("reason")?.as_str()
        } else {
            None
        }
    }
}

// ── IPC handle ────────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(IPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn load(&self, url: &str) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, vol: f32) -> anyhow::Result<()> {
        let vol_pct = (vol * 100.0).clamp(0.0, 100.0);
        self.send(json!(["set_property", "volume", vol_pct])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    /// `Ok(None)` when mpv answers but the property is unavailable.
    pub async fn get_flag(&self, name: &str) -> anyhow::Result<Option<bool>> {
        match self.send(json!(["get_property", name])).await {
            Ok(resp) => Ok(resp["data"].as_bool()),
            Err(e) if e.to_string().contains("property unavailable") => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ── backend ───────────────────────────────────────────────────────────────────

pub struct MpvBackend {
    tap: TapServer,
    mpv_binary: PathBuf,
}

impl MpvBackend {
    /// Locate mpv and start the tap server.
    pub async fn start(config: &BackendConfig) -> anyhow::Result<Self> {
        let mpv_binary = platform::find_mpv_binary(config.mpv_binary.as_deref())
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        info!("mpv: using {}", mpv_binary.display());
        let tap = TapServer::start(&config.tap_bind_address, config.tap_port).await?;
        Ok(Self { tap, mpv_binary })
    }

    async fn spawn_channel(&self, stream: &Arc<TapStream>) -> anyhow::Result<MpvChannel> {
        let id = stream.id;

        #[cfg(unix)]
        let _ = tokio::fs::remove_file(platform::mpv_socket_name(id)).await;

        debug!("mpv: spawning process for channel {}", id);
        let child = tokio::process::Command::new(&self.mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--volume=0")
            .arg("--cache=yes")
            .arg(platform::mpv_socket_arg(id))
            .arg("--quiet")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let (event_tx, event_rx) = mpsc::channel::<MpvEvent>(64);
        let handle = connect_ipc(id, event_tx).await?;
        tokio::spawn(log_events(id, event_rx));

        Ok(MpvChannel {
            url: stream.url.clone(),
            stream: stream.clone(),
            tap: self.tap.clone(),
            handle,
            process: Mutex::new(Some(child)),
            loaded: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl StreamBackend for MpvBackend {
    type Channel = MpvChannel;

    async fn open(&self, url: &str) -> anyhow::Result<MpvChannel> {
        let stream = self.tap.connect(url).await?;
        match self.spawn_channel(&stream).await {
            Ok(channel) => Ok(channel),
            Err(e) => {
                self.tap.release(stream.id).await;
                Err(e)
            }
        }
    }
}

async fn log_events(id: u64, mut rx: mpsc::Receiver<MpvEvent>) {
    while let Some(event) = rx.recv().await {
        match event.end_reason() {
            Some("error") => warn!("mpv[{}]: playback ended with error: {}", id, event.raw),
            Some(reason) => debug!("mpv[{}]: end-file reason={}", id, reason),
            None => {
                if let Some(name) = event.event_name() {
                    debug!("mpv[{}]: event {}", id, name);
                }
            }
        }
    }
}

// ── channel ───────────────────────────────────────────────────────────────────

pub struct MpvChannel {
    url: String,
    stream: Arc<TapStream>,
    tap: TapServer,
    handle: MpvHandle,
    process: Mutex<Option<tokio::process::Child>>,
    loaded: AtomicBool,
}

impl MpvChannel {
    async fn process_alive(&self) -> bool {
        match self.process.lock().await.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }
}

#[async_trait]
impl Channel for MpvChannel {
    fn url(&self) -> &str {
        &self.url
    }

    async fn state(&self) -> ChannelState {
        if !self.loaded.load(Ordering::Relaxed) || !self.process_alive().await {
            return ChannelState::Stopped;
        }
        match self.handle.get_flag("idle-active").await {
            Ok(Some(false)) => {}
            _ => return ChannelState::Stopped,
        }
        if matches!(self.handle.get_flag("pause").await, Ok(Some(true))) {
            return ChannelState::Paused;
        }
        let starved = matches!(self.handle.get_flag("paused-for-cache").await, Ok(Some(true)))
            || matches!(self.handle.get_flag("core-idle").await, Ok(Some(true)));
        if starved {
            ChannelState::Stalled
        } else {
            ChannelState::Playing
        }
    }

    fn byte_position(&self) -> u64 {
        self.stream.bytes_forwarded()
    }

    async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        self.handle.set_volume(volume).await
    }

    async fn play(&self) -> anyhow::Result<()> {
        if !self.loaded.swap(true, Ordering::Relaxed) {
            self.handle.load(&self.tap.tap_url(self.stream.id)).await?;
        }
        self.handle.set_pause(false).await
    }

    async fn pause(&self) -> anyhow::Result<()> {
        self.handle.set_pause(true).await
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.handle.set_pause(false).await
    }

    async fn close(&self) {
        let _ = tokio::time::timeout(QUIT_GRACE, self.handle.send(json!(["quit"]))).await;
        if let Some(mut child) = self.process.lock().await.take() {
            if tokio::time::timeout(QUIT_GRACE, child.wait()).await.is_err() {
                let _ = child.kill().await;
            }
        }
        self.tap.release(self.stream.id).await;

        #[cfg(unix)]
        let _ = tokio::fs::remove_file(platform::mpv_socket_name(self.stream.id)).await;

        debug!("mpv: channel {} closed", self.stream.id);
    }

    fn tags(&self) -> TagSet {
        self.stream.tags()
    }

    fn format(&self) -> Option<StreamFormat> {
        self.stream.format.clone()
    }

    fn tag_updates(&self) -> watch::Receiver<u64> {
        self.stream.tag_updates()
    }
}

impl Drop for MpvChannel {
    fn drop(&mut self) {
        // The process dies with `kill_on_drop`; the tap entry needs a task.
        self.stream.cancel();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let tap = self.tap.clone();
            let id = self.stream.id;
            rt.spawn(async move { tap.release(id).await });
        }
    }
}

// ── IPC connection ────────────────────────────────────────────────────────────

#[cfg(unix)]
async fn connect_ipc(id: u64, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
    let socket_path = PathBuf::from(platform::mpv_socket_name(id));

    // Wait for socket to appear
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if socket_path.exists() {
            break;
        }
    }
    if !socket_path.exists() {
        anyhow::bail!("mpv IPC socket did not appear");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = UnixStream::connect(&socket_path).await?;
    debug!("mpv[{}]: connected to IPC socket", id);
    let (read_half, write_half) = stream.into_split();
    Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx))
}

#[cfg(windows)]
async fn connect_ipc(id: u64, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
    let pipe_path = format!(r"\\.\pipe\{}", platform::mpv_socket_name(id));
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(client) = ClientOptions::new().open(&pipe_path) {
            debug!("mpv[{}]: connected to named pipe", id);
            let (read_half, write_half) = tokio::io::split(client);
            return Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx));
        }
    }
    anyhow::bail!("mpv named pipe did not appear")
}

fn start_io_tasks<R, W>(
    reader: BufReader<R>,
    writer: W,
    event_tx: mpsc::Sender<MpvEvent>,
) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        pending.lock().await.insert(req.req_id, req.reply);
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_file_reason() {
        let ev = MpvEvent {
            raw: json!({"event": "end-file", "reason": "error", "file_error": "loading failed"}),
        };
        assert_eq!(ev.event_name(), Some("end-file"));
        assert_eq!(ev.end_reason(), Some("error"));

        let ev = MpvEvent {
            raw: json!({"event": "file-loaded"}),
        };
        assert_eq!(ev.end_reason(), None);
    }

    #[tokio::test]
    async fn replies_are_routed_by_request_id() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let handle = start_io_tasks(BufReader::new(client_r), client_w, event_tx);

        // Fake mpv: echo success for every request, and emit one event first.
        let (server_r, mut server_w) = tokio::io::split(server);
        tokio::spawn(async move {
            let mut lines = BufReader::new(server_r).lines();
            server_w
                .write_all(b"{\"event\":\"idle\"}\n")
                .await
                .unwrap();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let reply = json!({
                    "request_id": req["request_id"],
                    "error": "success",
                    "data": req["command"][1] == "pause",
                });
                server_w
                    .write_all(format!("{}\n", reply).as_bytes())
                    .await
                    .unwrap();
            }
        });

        assert_eq!(handle.get_flag("pause").await.unwrap(), Some(true));
        assert_eq!(handle.get_flag("core-idle").await.unwrap(), Some(false));
        let ev = event_rx.recv().await.unwrap();
        assert_eq!(ev.event_name(), Some("idle"));
    }
}
