//! Now-playing metadata: tag extraction, title splitting and the
//! placeholder/fallback rules for the displayed track.

use std::sync::OnceLock;

use chrono::{DateTime, Local};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::encoding::{self, EncodingCandidate};

/// Shown from a station switch until metadata (or the fallback) arrives.
pub const CONNECTING_PLACEHOLDER: &str = "Connecting…";

// ── tag classes ───────────────────────────────────────────────────────────────

/// Where a raw tag buffer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TagClass {
    /// In-band ICY metadata block (`StreamTitle='…';`).
    Meta,
    /// `icy-*` response headers.
    Icy,
    /// All HTTP response headers.
    Http,
    /// Vorbis / Opus comments.
    Ogg,
}

impl TagClass {
    /// Read order; the first class yielding text wins.
    pub const PRIORITY: [TagClass; 4] = [TagClass::Meta, TagClass::Icy, TagClass::Http, TagClass::Ogg];
}

/// Undecoded tag buffers of one channel, as captured off the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagSet {
    pub meta: Option<Vec<u8>>,
    pub icy: Option<Vec<u8>>,
    pub http: Option<Vec<u8>>,
    pub ogg: Option<Vec<u8>>,
}

impl TagSet {
    pub fn get(&self, class: TagClass) -> Option<&[u8]> {
        match class {
            TagClass::Meta => self.meta.as_deref(),
            TagClass::Icy => self.icy.as_deref(),
            TagClass::Http => self.http.as_deref(),
            TagClass::Ogg => self.ogg.as_deref(),
        }
        .filter(|b| !b.is_empty())
    }

    /// In-band or header ICY data is present; enough to call a stream ready.
    pub fn has_icy(&self) -> bool {
        self.get(TagClass::Meta).is_some() || self.get(TagClass::Icy).is_some()
    }
}

// ── extraction rules ──────────────────────────────────────────────────────────

const ALL: &[TagClass] = &[TagClass::Meta, TagClass::Icy, TagClass::Http, TagClass::Ogg];
const HEADERS: &[TagClass] = &[TagClass::Icy, TagClass::Http, TagClass::Ogg];
const COMMENTS: &[TagClass] = &[TagClass::Ogg];

/// One pattern of the extraction table.  Patterns capture `title` and
/// optionally `artist`; the result is `title` or `title - artist`.
pub struct Rule {
    pub name: &'static str,
    pub pattern: &'static str,
    pub classes: &'static [TagClass],
}

/// Ordered by priority: the first rule that matches a decoded buffer wins.
pub static RULES: &[Rule] = &[
    Rule {
        name: "stream-title-quoted",
        pattern: r"(?i)StreamTitle\s*=\s*'(?P<title>.*?)';",
        classes: ALL,
    },
    Rule {
        name: "stream-title-quoted-loose",
        pattern: r#"(?i)StreamTitle\s*=\s*['"](?P<title>[^'"]+)['"]"#,
        classes: ALL,
    },
    Rule {
        name: "stream-title-bare",
        pattern: r"(?i)StreamTitle\s*=\s*(?P<title>[^;\r\n]+)",
        classes: ALL,
    },
    Rule {
        name: "icy-title",
        pattern: r"(?im)^icy-title\s*:\s*(?P<title>[^\r\n]+)",
        classes: HEADERS,
    },
    Rule {
        name: "vorbis-title-artist",
        pattern: r"(?ims)^title=(?P<title>[^\r\n]+)$.*?^artist=(?P<artist>[^\r\n]+)$",
        classes: COMMENTS,
    },
    Rule {
        name: "vorbis-artist-title",
        pattern: r"(?ims)^artist=(?P<artist>[^\r\n]+)$.*?^title=(?P<title>[^\r\n]+)$",
        classes: COMMENTS,
    },
    Rule {
        name: "vorbis-title",
        pattern: r"(?im)^title=(?P<title>[^\r\n]+)$",
        classes: COMMENTS,
    },
    Rule {
        name: "icy-name",
        pattern: r"(?im)^icy-name\s*[:=]\s*(?P<title>[^\r\n]+)",
        classes: HEADERS,
    },
];

fn compiled_rules() -> &'static [(&'static Rule, Regex)] {
    static COMPILED: OnceLock<Vec<(&'static Rule, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        RULES
            .iter()
            .filter_map(|rule| match Regex::new(rule.pattern) {
                Ok(re) => Some((rule, re)),
                Err(e) => {
                    tracing::error!("metadata rule {} does not compile: {}", rule.name, e);
                    None
                }
            })
            .collect()
    })
}

fn clean(value: &str) -> String {
    value
        .trim()
        .trim_matches(|c| c == '\'' || c == '"' || c == '\0')
        .trim()
        .to_string()
}

/// Run the rule table over one decoded buffer.
pub fn apply_rules(class: TagClass, decoded: &str) -> Option<String> {
    for (rule, re) in compiled_rules() {
        if !rule.classes.contains(&class) {
            continue;
        }
        let Some(caps) = re.captures(decoded) else {
            continue;
        };
        let title = caps.name("title").map(|m| clean(m.as_str())).unwrap_or_default();
        let artist = caps.name("artist").map(|m| clean(m.as_str())).unwrap_or_default();
        let text = match (title.is_empty(), artist.is_empty()) {
            (false, false) => format!("{} - {}", title, artist),
            (false, true) => title,
            (true, false) => artist,
            (true, true) => continue,
        };
        debug!("metadata: rule {} matched {:?}", rule.name, text);
        return Some(text);
    }
    None
}

/// Decode one tag buffer and extract its title text.
pub fn extract(class: TagClass, raw: &[u8]) -> Option<EncodingCandidate> {
    encoding::resolve(raw, |decoded| apply_rules(class, decoded))
}

/// Walk the tag classes in priority order and return the first extraction.
pub fn read(tags: &TagSet) -> Option<(TagClass, String)> {
    TagClass::PRIORITY.into_iter().find_map(|class| {
        let raw = tags.get(class)?;
        extract(class, raw).map(|c| (class, c.text))
    })
}

// ── title splitting ───────────────────────────────────────────────────────────

fn dash_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*[—–-]\s*").expect("static regex"))
}

fn slash_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*/\s*").expect("static regex"))
}

fn split_on<'a>(re: &Regex, text: &'a str) -> Vec<&'a str> {
    re.split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Split a stream title into `(track, artist)`.
///
/// The first dash-separated part is the track and the rest (re-joined with
/// `" - "`) the artist.  Without a dash a slash is tried; otherwise the whole
/// text is the track.
pub fn split_title(text: &str) -> (String, String) {
    let mut text = text.trim();
    if text
        .get(..12)
        .is_some_and(|p| p.eq_ignore_ascii_case("StreamTitle="))
    {
        text = text[12..].trim_matches(|c| c == '\'' || c == '"' || c == ' ' || c == ';');
    }

    let parts = split_on(dash_separator(), text);
    if parts.len() >= 2 {
        return (parts[0].to_string(), parts[1..].join(" - "));
    }

    let parts = split_on(slash_separator(), text);
    if parts.len() >= 2 {
        return (parts[0].to_string(), parts[1..].join(" / "));
    }

    (parts.first().copied().unwrap_or_default().to_string(), String::new())
}

// ── snapshots ─────────────────────────────────────────────────────────────────

/// One published now-playing value.  Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataSnapshot {
    pub title: String,
    pub artist: String,
    pub source_url: String,
    pub timestamp: DateTime<Local>,
}

/// Suppresses repeats of the same raw text for the same URL.
#[derive(Debug, Default)]
pub struct ChangeFilter {
    last: Option<(String, String)>,
}

impl ChangeFilter {
    /// True when `(url, raw)` differs from the previous call.
    pub fn is_new(&mut self, url: &str, raw: &str) -> bool {
        if self
            .last
            .as_ref()
            .is_some_and(|(u, r)| u == url && r == raw)
        {
            return false;
        }
        self.last = Some((url.to_string(), raw.to_string()));
        true
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// What is displayed for the current stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NowPlaying {
    pub station_title: String,
    pub source_url: String,
    pub track: String,
    pub artist: String,
}

impl NowPlaying {
    /// A new station was selected; show the placeholder.
    pub fn begin(station_title: &str, source_url: &str) -> Self {
        Self {
            station_title: station_title.to_string(),
            source_url: source_url.to_string(),
            track: CONNECTING_PLACEHOLDER.to_string(),
            artist: String::new(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.track == CONNECTING_PLACEHOLDER
    }

    /// Apply the final raw text of a debounced burst.  Returns the snapshot
    /// to publish, or `None` when nothing visible changed.
    pub fn apply(&mut self, raw: &str) -> Option<MetadataSnapshot> {
        let raw = raw.trim();
        if raw.is_empty() {
            return self.fallback();
        }
        let repaired = encoding::repair(raw);
        let (track, artist) = split_title(&repaired);
        let track = encoding::repair(&track);
        let artist = encoding::repair(&artist);
        if track.is_empty() {
            return self.fallback();
        }
        self.track = track;
        self.artist = artist;
        Some(self.snapshot())
    }

    /// Replace the placeholder with the station title.  No-op once real
    /// metadata has been shown.
    pub fn fallback(&mut self) -> Option<MetadataSnapshot> {
        if !self.is_placeholder() {
            return None;
        }
        self.track = if self.station_title.is_empty() {
            self.source_url.clone()
        } else {
            self.station_title.clone()
        };
        self.artist.clear();
        Some(self.snapshot())
    }

    pub fn snapshot(&self) -> MetadataSnapshot {
        MetadataSnapshot {
            title: self.track.clone(),
            artist: self.artist.clone(),
            source_url: self.source_url.clone(),
            timestamp: Local::now(),
        }
    }
}
