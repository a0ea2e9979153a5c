//! Recovering readable text from tag bytes of unknown code page.
//!
//! Radio servers send `StreamTitle` in whatever encoding the playout software
//! happened to use: UTF-8, windows-1251, KOI8-R, CP866 and Latin-1 are all
//! common, and some strings were mangled once already (windows-1251 bytes
//! shown as windows-1252 and re-encoded as UTF-8).  The resolver decodes the
//! buffer under every candidate, lets the caller extract the interesting part
//! and keeps the decode with the highest [`score`].

use encoding_rs::{Encoding, IBM866, KOI8_R, WINDOWS_1251, WINDOWS_1252};
use tracing::debug;

/// Tag buffers are never read past this many bytes.
pub const MAX_TAG_BYTES: usize = 8192;

/// Below this score a result containing mojibake characters is re-decoded.
const FIX_THRESHOLD: i32 = 20;

/// Latin-1 characters that show up when windows-1251 text is displayed as
/// windows-1252.
const MOJIBAKE_CHARS: &str = "ÐÒÍÃàáâãäåæçèéêëìíîïðñòóôõö÷øùúûüýþÞÊÀËÓŽÿÑî";

/// Lowercase letters frequent in Russian text; each earns a bonus.
const COMMON_CYRILLIC: &str = "аеиоуыэюябвгджийклмнопрстуфхцчшщъьё";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codepage {
    Utf8,
    Windows1251,
    Koi8R,
    Ibm866,
    Latin1,
    Windows1252,
}

impl Codepage {
    /// Decode order.  Ties in score go to the earlier entry.
    pub const CANDIDATES: [Codepage; 6] = [
        Codepage::Utf8,
        Codepage::Windows1251,
        Codepage::Koi8R,
        Codepage::Ibm866,
        Codepage::Latin1,
        Codepage::Windows1252,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Codepage::Utf8 => "utf-8",
            Codepage::Windows1251 => "windows-1251",
            Codepage::Koi8R => "koi8-r",
            Codepage::Ibm866 => "ibm866",
            Codepage::Latin1 => "iso-8859-1",
            Codepage::Windows1252 => "windows-1252",
        }
    }

    fn single_byte(self) -> Option<&'static Encoding> {
        match self {
            Codepage::Windows1251 => Some(WINDOWS_1251),
            Codepage::Koi8R => Some(KOI8_R),
            Codepage::Ibm866 => Some(IBM866),
            Codepage::Windows1252 => Some(WINDOWS_1252),
            Codepage::Utf8 | Codepage::Latin1 => None,
        }
    }

    /// `None` means the bytes are not valid in this code page.  Only UTF-8
    /// can fail; single-byte tables map every byte to something.
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            Codepage::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_owned),
            // encoding_rs maps the "iso-8859-1" label to windows-1252, so the
            // real Latin-1 table is done by hand.
            Codepage::Latin1 => Some(bytes.iter().map(|&b| char::from(b)).collect()),
            other => {
                let encoding = other.single_byte()?;
                let (text, _) = encoding.decode_without_bom_handling(bytes);
                Some(text.into_owned())
            }
        }
    }

    /// Inverse of [`Codepage::decode`]; `None` when `text` has characters
    /// the code page cannot represent.
    pub fn encode(self, text: &str) -> Option<Vec<u8>> {
        match self {
            Codepage::Utf8 => Some(text.as_bytes().to_vec()),
            Codepage::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).ok())
                .collect(),
            other => {
                let encoding = other.single_byte()?;
                let (bytes, _, unmappable) = encoding.encode(text);
                (!unmappable).then(|| bytes.into_owned())
            }
        }
    }
}

/// One decode of a tag buffer together with what the extractor found in it.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingCandidate {
    pub codepage: Codepage,
    pub text: String,
    pub score: i32,
}

/// Clamp raw tag bytes the way the decoder exposes them: NUL-terminated and
/// at most [`MAX_TAG_BYTES`] long.
pub fn tag_bytes(raw: &[u8]) -> &[u8] {
    let raw = &raw[..raw.len().min(MAX_TAG_BYTES)];
    match raw.iter().position(|&b| b == 0) {
        Some(nul) => &raw[..nul],
        None => raw,
    }
}

/// Decode `raw` under every candidate code page and return the best-scoring
/// extraction.  `extract` pulls the interesting substring (e.g. the
/// `StreamTitle` value) out of a decoded buffer.
///
/// Returns `None` when nothing could be extracted under any code page.
pub fn resolve<F>(raw: &[u8], extract: F) -> Option<EncodingCandidate>
where
    F: Fn(&str) -> Option<String>,
{
    let bytes = tag_bytes(raw);
    if bytes.is_empty() {
        return None;
    }

    if bytes.is_ascii() {
        // ASCII decodes identically everywhere
        let ascii = String::from_utf8_lossy(bytes);
        if let Some(text) = extract(&ascii).filter(|t| !t.is_empty()) {
            let score = score(&text);
            return Some(EncodingCandidate {
                codepage: Codepage::Utf8,
                text,
                score,
            });
        }
    }

    let mut best: Option<EncodingCandidate> = None;
    for codepage in Codepage::CANDIDATES {
        let Some(decoded) = codepage.decode(bytes) else {
            continue;
        };
        let Some(text) = extract(&decoded).filter(|t| !t.is_empty()) else {
            continue;
        };
        let candidate_score = score(&text);
        debug!(
            "encoding: {} -> {:?} (score {})",
            codepage.name(),
            text,
            candidate_score
        );
        if best.as_ref().map_or(true, |b| candidate_score > b.score) {
            best = Some(EncodingCandidate {
                codepage,
                text,
                score: candidate_score,
            });
        }
        if codepage == Codepage::Utf8 {
            break;
        }
    }

    let mut best = best?;
    if best.score < FIX_THRESHOLD && has_mojibake(&best.text) {
        if let Some(fixed) = fix_mojibake(&best.text) {
            let fixed_score = score(&fixed);
            if fixed_score > best.score {
                debug!("encoding: repaired {:?} -> {:?}", best.text, fixed);
                best.text = fixed;
                best.score = fixed_score;
            }
        }
    }
    Some(best)
}

fn is_cyrillic(c: char) -> bool {
    ('\u{0400}'..='\u{052F}').contains(&c)
}

/// Plausibility of `text` as a human-readable title, biased towards Cyrillic.
pub fn score(text: &str) -> i32 {
    if text.is_empty() {
        return -10;
    }

    let mut score = 0i32;
    let mut cyrillic = 0usize;
    let mut invalid = 0usize;
    let mut total = 0usize;

    for c in text.chars() {
        total += 1;
        if is_cyrillic(c) {
            cyrillic += 1;
            score += 5;
            if c.to_lowercase().any(|l| COMMON_CYRILLIC.contains(l)) {
                score += 2;
            }
        } else if c.is_alphanumeric() && u32::from(c) < 0x100 {
            score += 1;
        } else if c.is_whitespace() {
            // neutral
        } else if matches!(c, '\u{FFFD}' | '?' | '\0') {
            invalid += 3;
            score -= 3;
        } else {
            invalid += 1;
            score -= 2;
        }
    }

    let total = total as f64;
    if cyrillic as f64 > total * 0.3 {
        score += 20;
    }
    if invalid as f64 > total * 0.1 {
        score -= 15;
    }
    if text.contains('-') || text.contains("feat.") || text.contains('&') {
        score += 5;
    }
    score
}

fn has_mojibake(text: &str) -> bool {
    text.chars().any(|c| MOJIBAKE_CHARS.contains(c))
}

fn has_cyrillic(text: &str) -> bool {
    text.chars().any(is_cyrillic)
}

/// More than a tenth of the letters are accented Latin, typical of
/// windows-1251 bytes read as windows-1252.
fn has_wrong_latin(text: &str) -> bool {
    let mut letters = 0usize;
    let mut suspicious = 0usize;
    for c in text.chars().filter(|c| c.is_alphabetic()) {
        letters += 1;
        let cp = u32::from(c);
        if (0xC0..=0x1FF).contains(&cp) && c != '×' && c != '÷' {
            suspicious += 1;
        }
    }
    letters > 0 && suspicious as f64 / letters as f64 > 0.1
}

/// Share of letters that are Cyrillic.
fn cyrillic_density(text: &str) -> f64 {
    let mut letters = 0usize;
    let mut cyrillic = 0usize;
    for c in text.chars().filter(|c| c.is_alphabetic()) {
        letters += 1;
        if is_cyrillic(c) {
            cyrillic += 1;
        }
    }
    if letters == 0 {
        0.0
    } else {
        cyrillic as f64 / letters as f64
    }
}

/// Undo a windows-1251 → windows-1252 (or Latin-1) misreading.
///
/// The result must be mostly Cyrillic; a French or Icelandic title with a
/// couple of accented letters is left alone.
fn fix_mojibake(text: &str) -> Option<String> {
    let mut best: Option<(String, i32)> = None;
    for source in [Codepage::Windows1252, Codepage::Latin1] {
        let Some(bytes) = source.encode(text) else {
            continue;
        };
        let Some(fixed) = Codepage::Windows1251.decode(&bytes) else {
            continue;
        };
        if !has_cyrillic(&fixed) || cyrillic_density(&fixed) <= 0.3 {
            continue;
        }
        if !has_wrong_latin(&fixed) {
            return Some(fixed);
        }
        let fixed_score = score(&fixed);
        if best.as_ref().map_or(true, |(_, s)| fixed_score > *s) {
            best = Some((fixed, fixed_score));
        }
    }
    best.filter(|(_, s)| *s > 0).map(|(t, _)| t)
}

/// Repair a string that went through a wrong code page somewhere before it
/// reached us (station titles, persisted history).
///
/// Idempotent: correct Cyrillic, plain ASCII and genuine Latin text come
/// back unchanged, and a repaired string is correct Cyrillic.
pub fn repair(text: &str) -> String {
    if text.is_empty() || (has_cyrillic(text) && !has_wrong_latin(text)) {
        return text.to_string();
    }
    if !has_mojibake(text) && !has_wrong_latin(text) {
        return text.to_string();
    }
    match fix_mojibake(text) {
        Some(fixed) => {
            debug!("encoding: repaired {:?} -> {:?}", text, fixed);
            fixed
        }
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_title(s: &str) -> Option<String> {
        let start = s.find("StreamTitle='")? + "StreamTitle='".len();
        let end = s[start..].find("';")? + start;
        Some(s[start..end].to_string())
    }

    fn cp1251(text: &str) -> Vec<u8> {
        Codepage::Windows1251.encode(text).unwrap()
    }

    #[test]
    fn ascii_takes_the_fast_path() {
        let got = resolve(b"StreamTitle='Journey - Don't Stop';", stream_title).unwrap();
        assert_eq!(got.text, "Journey - Don't Stop");
        let got = resolve(b"StreamTitle='Midnight City';\0garbage", stream_title).unwrap();
        assert_eq!(got.text, "Midnight City");
    }

    #[test]
    fn windows_1251_is_recovered() {
        let raw = cp1251("StreamTitle='Кино - Группа крови';");
        let got = resolve(&raw, stream_title).unwrap();
        assert_eq!(got.codepage, Codepage::Windows1251);
        assert_eq!(got.text, "Кино - Группа крови");
    }

    #[test]
    fn utf8_short_circuits() {
        let raw = "StreamTitle='Ленинград - Экспонат';".as_bytes();
        let got = resolve(raw, stream_title).unwrap();
        assert_eq!(got.codepage, Codepage::Utf8);
        assert_eq!(got.text, "Ленинград - Экспонат");
    }

    #[test]
    fn double_encoded_utf8_is_repaired() {
        // windows-1251 bytes read as windows-1252, then stored as UTF-8
        let mangled = Codepage::Windows1252.decode(&cp1251("Музыка")).unwrap();
        assert_eq!(mangled, "Ìóçûêà");
        let raw = format!("StreamTitle='{}';", mangled);
        let got = resolve(raw.as_bytes(), stream_title).unwrap();
        assert_eq!(got.text, "Музыка");
    }

    #[test]
    fn nothing_extractable_is_none() {
        assert!(resolve(b"", stream_title).is_none());
        assert!(resolve(b"\0StreamTitle='x';", stream_title).is_none());
        assert!(resolve(&cp1251("просто текст"), stream_title).is_none());
    }

    #[test]
    fn buffer_is_clamped() {
        let mut raw = vec![b'a'; MAX_TAG_BYTES + 10];
        raw[5] = 0;
        assert_eq!(tag_bytes(&raw).len(), 5);
        let raw = vec![b'a'; MAX_TAG_BYTES + 10];
        assert_eq!(tag_bytes(&raw).len(), MAX_TAG_BYTES);
    }

    #[test]
    fn score_prefers_cyrillic() {
        assert!(score("Группа крови") > score("Ãðóïïà êðîâè"));
        assert!(score("Artist - Title") > score("Artist ? Title"));
        assert_eq!(score(""), -10);
    }

    #[test]
    fn repair_fixes_mojibake() {
        assert_eq!(repair("Ãðóïïà êðîâè"), "Группа крови");
    }

    #[test]
    fn repair_is_idempotent() {
        for text in [
            "Группа крови",
            "Ãðóïïà êðîâè",
            "Midnight City",
            "Café del Mar",
            "Björk - Jóga",
            "",
        ] {
            let once = repair(text);
            assert_eq!(repair(&once), once, "not idempotent for {:?}", text);
        }
    }

    #[test]
    fn repair_leaves_genuine_latin_alone() {
        assert_eq!(repair("Café del Mar"), "Café del Mar");
        assert_eq!(repair("Björk - Jóga"), "Björk - Jóga");
        assert_eq!(repair("Sigur Rós"), "Sigur Rós");
    }

    #[test]
    fn latin1_roundtrip_rejects_wide_chars() {
        assert_eq!(Codepage::Latin1.encode("é"), Some(vec![0xE9]));
        assert_eq!(Codepage::Latin1.encode("Ж"), None);
    }
}
