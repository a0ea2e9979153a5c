/// Local HTTP tap between the network and the decoder.
///
/// `TapServer::connect(url)` opens the upstream connection itself, so a dead
/// URL fails at open time and the response headers are known before any
/// audio flows.  The decoder is then pointed at
/// `http://127.0.0.1:8990/tap/{id}`, and the handler streams the held
/// response body through:
///
/// ```text
///   upstream ──► IcyDemuxer ──► audio bytes ──► decoder
///                     │
///                     ├── ICY metadata blocks ──► TagSet.meta
///                     └── OGG comment headers ──► TagSet.ogg
/// ```
///
/// Every audio byte handed to the decoder is counted; that counter is what
/// stall detection watches.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::icy::{IcyDemuxer, OggCommentScanner};
use crate::headers::StreamFormat;
use crate::metadata::{TagClass, TagSet};

pub const TAP_HOST: &str = "127.0.0.1";

// ── one tapped stream ─────────────────────────────────────────────────────────

pub struct TapStream {
    pub id: u64,
    pub url: String,
    pub format: Option<StreamFormat>,
    metaint: Option<usize>,
    /// Response held from `connect` until the decoder asks for it.
    pending: Mutex<Option<reqwest::Response>>,
    bytes_forwarded: AtomicU64,
    tags: StdMutex<TagSet>,
    tag_tx: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl TapStream {
    pub fn bytes_forwarded(&self) -> u64 {
        self.bytes_forwarded.load(Ordering::Relaxed)
    }

    pub fn tags(&self) -> TagSet {
        self.tags
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    pub fn tag_updates(&self) -> watch::Receiver<u64> {
        self.tag_tx.subscribe()
    }

    fn store_tag(&self, class: TagClass, raw: Vec<u8>) {
        if let Ok(mut tags) = self.tags.lock() {
            let slot = match class {
                TagClass::Meta => &mut tags.meta,
                TagClass::Icy => &mut tags.icy,
                TagClass::Http => &mut tags.http,
                TagClass::Ogg => &mut tags.ogg,
            };
            *slot = Some(raw);
        }
        self.tag_tx.send_modify(|generation| *generation += 1);
    }

    /// Stops the body pump; the decoder sees end-of-stream.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Rebuild the raw header blocks the tag reader expects from a parsed
/// response.  Values keep their original bytes.
fn raw_header_blocks(resp: &reqwest::Response) -> (Vec<u8>, Vec<u8>) {
    let mut http = format!("{:?} {}\r\n", resp.version(), resp.status()).into_bytes();
    let mut icy = Vec::new();
    for (name, value) in resp.headers() {
        let mut line = Vec::with_capacity(name.as_str().len() + value.len() + 4);
        line.extend_from_slice(name.as_str().as_bytes());
        line.extend_from_slice(b": ");
        line.extend_from_slice(value.as_bytes());
        line.extend_from_slice(b"\r\n");
        if name.as_str().starts_with("icy-") {
            icy.extend_from_slice(&line);
        }
        http.extend_from_slice(&line);
    }
    (http, icy)
}

// ── server ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TapServer {
    client: Client,
    port: u16,
    streams: Arc<Mutex<HashMap<u64, Arc<TapStream>>>>,
    next_id: Arc<AtomicU64>,
}

impl TapServer {
    /// Bind the tap listener and start serving.
    pub async fn start(bind_address: &str, port: u16) -> anyhow::Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .default_headers({
                let mut h = reqwest::header::HeaderMap::new();
                h.insert(
                    "Icy-MetaData",
                    reqwest::header::HeaderValue::from_static("1"),
                );
                h
            })
            .build()?;

        let addr = format!("{}:{}", bind_address, port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        let server = Self {
            client,
            port,
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        };

        let app = Router::new()
            .route("/tap/:id", get(serve_tap))
            .with_state(server.clone());

        info!("Stream tap listening on http://{}", listener.local_addr()?);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("Stream tap error: {}", e);
            }
        });

        Ok(server)
    }

    pub fn tap_url(&self, id: u64) -> String {
        format!("http://{}:{}/tap/{}", TAP_HOST, self.port, id)
    }

    /// Open the upstream connection for `url` and register it.
    pub async fn connect(&self, url: &str) -> anyhow::Result<Arc<TapStream>> {
        let upstream = self.client.get(url).send().await?;
        let status = upstream.status();
        if !status.is_success() {
            anyhow::bail!("upstream returned {}", status);
        }

        let header = |name: &str| {
            upstream
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let format = header("content-type").map(|ct| StreamFormat::from_content_type(&ct));
        let metaint = header("icy-metaint").and_then(|v| v.trim().parse::<usize>().ok());
        let (http, icy) = raw_header_blocks(&upstream);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            "tap: upstream {} for id={} format={:?} metaint={:?}",
            status, id, format, metaint
        );

        let (tag_tx, _) = watch::channel(0u64);
        let stream = Arc::new(TapStream {
            id,
            url: url.to_string(),
            format,
            metaint,
            pending: Mutex::new(Some(upstream)),
            bytes_forwarded: AtomicU64::new(0),
            tags: StdMutex::new(TagSet::default()),
            tag_tx,
            cancel: CancellationToken::new(),
        });
        stream.store_tag(TagClass::Http, http);
        if !icy.is_empty() {
            stream.store_tag(TagClass::Icy, icy);
        }

        self.streams.lock().await.insert(id, stream.clone());
        Ok(stream)
    }

    pub async fn release(&self, id: u64) {
        if let Some(stream) = self.streams.lock().await.remove(&id) {
            stream.cancel();
            debug!("tap: released id={}", id);
        }
    }

    async fn lookup(&self, id: u64) -> Option<Arc<TapStream>> {
        self.streams.lock().await.get(&id).cloned()
    }
}

// ── route handler ─────────────────────────────────────────────────────────────

async fn serve_tap(Path(id): Path<u64>, State(server): State<TapServer>) -> impl IntoResponse {
    let Some(stream) = server.lookup(id).await else {
        warn!("tap: unknown id={}", id);
        return StatusCode::NOT_FOUND.into_response();
    };

    // The first request takes the held response; a decoder-side reconnect
    // opens a fresh upstream.
    let held = stream.pending.lock().await.take();
    let upstream = match held {
        Some(r) => r,
        None => match server.client.get(&stream.url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!("tap: upstream returned {} on reopen id={}", r.status(), id);
                return StatusCode::BAD_GATEWAY.into_response();
            }
            Err(e) => {
                warn!("tap: upstream reopen failed id={}: {}", id, e);
                return StatusCode::BAD_GATEWAY.into_response();
            }
        },
    };

    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(ct) = upstream.headers().get("content-type") {
        builder = builder.header("content-type", ct.clone());
    }

    let mut demuxer = IcyDemuxer::new(stream.metaint);
    let mut ogg = matches!(stream.format, Some(StreamFormat::Ogg)).then(OggCommentScanner::new);
    let pump = stream.clone();
    let body = upstream
        .bytes_stream()
        .take_until(stream.cancel.clone().cancelled_owned())
        .map(move |chunk| {
            let chunk = chunk.map_err(std::io::Error::other)?;
            let out = demuxer.push(&chunk);
            for block in out.metadata {
                pump.store_tag(TagClass::Meta, block);
            }
            if let Some(scanner) = ogg.as_mut() {
                for block in scanner.push(&out.audio) {
                    pump.store_tag(TagClass::Ogg, block);
                }
            }
            pump.bytes_forwarded
                .fetch_add(out.audio.len() as u64, Ordering::Relaxed);
            Ok::<_, std::io::Error>(out.audio)
        });

    builder
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
