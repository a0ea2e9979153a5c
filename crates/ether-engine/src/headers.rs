//! Diagnostic view of a stream's HTTP response: decoded header pairs and
//! the container format.

use std::fmt;

use serde::Serialize;

use crate::encoding::{tag_bytes, Codepage};

/// Lines that prove a decode produced real header text.
const HEADER_PREFIXES: [&str; 5] = ["icy-", "content-", "server:", "date:", "http/"];

fn looks_like_headers(text: &str) -> bool {
    text.lines().any(|line| {
        let line = line.trim().to_ascii_lowercase();
        HEADER_PREFIXES.iter().any(|p| line.starts_with(p))
    })
}

/// Parse raw response header bytes into ordered `(name, value)` pairs.
///
/// The first occurrence of a name wins and the status line is reported
/// under `Status`.  Valid UTF-8 is taken as such; otherwise windows-1251 and
/// then Latin-1 are tried.
pub fn parse(raw: &[u8]) -> Vec<(String, String)> {
    let bytes = tag_bytes(raw);
    if bytes.is_empty() {
        return Vec::new();
    }

    let Some(text) = [Codepage::Utf8, Codepage::Windows1251, Codepage::Latin1]
        .into_iter()
        .filter_map(|cp| cp.decode(bytes))
        .find(|text| looks_like_headers(text))
    else {
        return Vec::new();
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in text.split(['\r', '\n']) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.find(':') {
            Some(colon) if colon > 0 => (line[..colon].trim(), line[colon + 1..].trim()),
            _ if line.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("http/")) => ("Status", line),
            _ => continue,
        };
        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(key)) {
            headers.push((key.to_string(), value.to_string()));
        }
    }
    headers
}

/// Container/codec of a stream as announced by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StreamFormat {
    Mp3,
    Aac,
    Ogg,
    Other(String),
}

impl StreamFormat {
    pub fn from_content_type(content_type: &str) -> Self {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "audio/mpeg" | "audio/mp3" | "audio/mpeg3" | "audio/x-mpeg" => StreamFormat::Mp3,
            "audio/aac" | "audio/aacp" | "audio/x-aac" | "audio/mp4" | "audio/x-m4a" => {
                StreamFormat::Aac
            }
            "application/ogg" | "audio/ogg" | "audio/x-ogg" | "audio/opus" | "audio/vorbis" => {
                StreamFormat::Ogg
            }
            _ => StreamFormat::Other(mime),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            StreamFormat::Mp3 => "MP3",
            StreamFormat::Aac => "AAC",
            StreamFormat::Ogg => "OGG",
            StreamFormat::Other(mime) => mime,
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_and_first_wins() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Type: audio/mpeg\r\nicy-name: One\r\nicy-name: Two\r\nicy-metaint:16000\r\n\r\n";
        let headers = parse(raw);
        assert_eq!(headers[0], ("Status".into(), "HTTP/1.0 200 OK".into()));
        assert_eq!(headers[1], ("Content-Type".into(), "audio/mpeg".into()));
        assert_eq!(headers[2], ("icy-name".into(), "One".into()));
        assert_eq!(headers[3], ("icy-metaint".into(), "16000".into()));
        assert_eq!(headers.len(), 4);
    }

    #[test]
    fn cyrillic_header_values() {
        let mut raw = b"ICY 200 OK\r\nicy-name: ".to_vec();
        raw.extend(Codepage::Windows1251.encode("Русское Радио").unwrap());
        raw.extend(b"\r\n");
        let headers = parse(&raw);
        assert_eq!(headers, vec![("icy-name".to_string(), "Русское Радио".to_string())]);

        let raw = "icy-name: Наше Радио\r\n".as_bytes();
        assert_eq!(parse(raw)[0].1, "Наше Радио");
    }

    #[test]
    fn garbage_yields_nothing() {
        assert!(parse(b"").is_empty());
        assert!(parse(b"\x01\x02 not headers at all").is_empty());
    }

    #[test]
    fn format_from_content_type() {
        assert_eq!(StreamFormat::from_content_type("audio/mpeg"), StreamFormat::Mp3);
        assert_eq!(StreamFormat::from_content_type("audio/aacp"), StreamFormat::Aac);
        assert_eq!(
            StreamFormat::from_content_type("application/ogg; codecs=opus"),
            StreamFormat::Ogg
        );
        assert_eq!(
            StreamFormat::from_content_type("audio/flac").label(),
            "audio/flac"
        );
    }
}
