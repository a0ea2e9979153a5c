//! In-band tag extraction for tapped streams.
//!
//! [`IcyDemuxer`] strips Shoutcast/Icecast metadata blocks out of the audio
//! byte stream.  [`OggCommentScanner`] watches OGG streams for Vorbis/Opus
//! comment headers, which chained streams repeat for every new track.

use bytes::{Bytes, BytesMut};

/// Upper bound for one ICY metadata block (length byte × 16).
const MAX_META_BLOCK: usize = 255 * 16;

/// How much OGG data the comment scanner keeps around while waiting for a
/// complete comment packet.
const OGG_SCAN_WINDOW: usize = 64 * 1024;

const VORBIS_COMMENT_MAGIC: &[u8] = b"\x03vorbis";
const OPUS_TAGS_MAGIC: &[u8] = b"OpusTags";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Audio,
    Length,
    Meta,
}

/// Output of one [`IcyDemuxer::push`].
#[derive(Debug, Default)]
pub struct Demuxed {
    pub audio: Bytes,
    /// Complete, non-empty metadata blocks in arrival order.  Trailing NUL
    /// padding is left in place.
    pub metadata: Vec<Vec<u8>>,
}

/// Splits an `icy-metaint` interleaved stream into audio and metadata.
///
/// Without a metaint every byte is audio.
pub struct IcyDemuxer {
    metaint: Option<usize>,
    phase: Phase,
    audio_left: usize,
    meta_left: usize,
    meta: Vec<u8>,
}

impl IcyDemuxer {
    pub fn new(metaint: Option<usize>) -> Self {
        let metaint = metaint.filter(|&n| n > 0);
        Self {
            metaint,
            phase: Phase::Audio,
            audio_left: metaint.unwrap_or(0),
            meta_left: 0,
            meta: Vec::with_capacity(MAX_META_BLOCK),
        }
    }

    pub fn push(&mut self, mut chunk: &[u8]) -> Demuxed {
        let Some(metaint) = self.metaint else {
            return Demuxed {
                audio: Bytes::copy_from_slice(chunk),
                metadata: Vec::new(),
            };
        };

        let mut audio = BytesMut::with_capacity(chunk.len());
        let mut metadata = Vec::new();

        while !chunk.is_empty() {
            match self.phase {
                Phase::Audio => {
                    let n = self.audio_left.min(chunk.len());
                    audio.extend_from_slice(&chunk[..n]);
                    chunk = &chunk[n..];
                    self.audio_left -= n;
                    if self.audio_left == 0 {
                        self.phase = Phase::Length;
                    }
                }
                Phase::Length => {
                    self.meta_left = chunk[0] as usize * 16;
                    chunk = &chunk[1..];
                    if self.meta_left == 0 {
                        self.phase = Phase::Audio;
                        self.audio_left = metaint;
                    } else {
                        self.meta.clear();
                        self.phase = Phase::Meta;
                    }
                }
                Phase::Meta => {
                    let n = self.meta_left.min(chunk.len());
                    self.meta.extend_from_slice(&chunk[..n]);
                    chunk = &chunk[n..];
                    self.meta_left -= n;
                    if self.meta_left == 0 {
                        if self.meta.iter().any(|&b| b != 0) {
                            metadata.push(std::mem::take(&mut self.meta));
                        }
                        self.phase = Phase::Audio;
                        self.audio_left = metaint;
                    }
                }
            }
        }

        Demuxed {
            audio: audio.freeze(),
            metadata,
        }
    }
}

/// Finds comment headers in an OGG byte stream and renders them as
/// `KEY=value` lines.
#[derive(Default)]
pub struct OggCommentScanner {
    window: Vec<u8>,
}

impl OggCommentScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed stream bytes; returns every complete comment block found.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.window.extend_from_slice(chunk);
        let mut found = Vec::new();

        loop {
            let Some((start, magic_len)) = find_comment_header(&self.window) else {
                // Keep enough tail to catch a magic split across chunks.
                let keep = OPUS_TAGS_MAGIC.len().max(VORBIS_COMMENT_MAGIC.len());
                if self.window.len() > keep {
                    let cut = self.window.len() - keep;
                    self.window.drain(..cut);
                }
                break;
            };
            match parse_comments(&self.window[start + magic_len..]) {
                Some((lines, used)) => {
                    if !lines.is_empty() {
                        found.push(lines);
                    }
                    self.window.drain(..start + magic_len + used);
                }
                None => {
                    if self.window.len() - start > OGG_SCAN_WINDOW {
                        // Never completes; skip past this header.
                        self.window.drain(..start + magic_len);
                        continue;
                    }
                    self.window.drain(..start);
                    break;
                }
            }
        }
        found
    }
}

fn find_comment_header(buf: &[u8]) -> Option<(usize, usize)> {
    [VORBIS_COMMENT_MAGIC, OPUS_TAGS_MAGIC]
        .into_iter()
        .filter_map(|magic| {
            buf.windows(magic.len())
                .position(|w| w == magic)
                .map(|pos| (pos, magic.len()))
        })
        .min_by_key(|(pos, _)| *pos)
}

fn read_u32_le(buf: &[u8], at: usize) -> Option<usize> {
    let bytes: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes) as usize)
}

/// Parse a comment packet body (after the magic).  Returns the rendered
/// lines and the number of bytes consumed, or `None` if incomplete.
fn parse_comments(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    let vendor_len = read_u32_le(buf, 0)?;
    let mut at = 4usize.checked_add(vendor_len)?;
    let count = read_u32_le(buf, at)?;
    at += 4;

    let mut lines = Vec::new();
    for _ in 0..count {
        let len = read_u32_le(buf, at)?;
        at += 4;
        let end = at.checked_add(len)?;
        let comment = buf.get(at..end)?;
        at = end;
        if comment.contains(&b'=') {
            lines.extend_from_slice(comment);
            lines.push(b'\n');
        }
    }
    Some((lines, at))
}
