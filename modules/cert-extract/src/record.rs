//! Zero-copy walk over captured TLS bytes: record layer, handshake layer and
//! the Certificate message's container of DER blobs.
//!
//! Nothing here trusts a length field. Every slice is bounds-checked against
//! its enclosing buffer, and malformed framing truncates the walk instead of
//! failing it; whatever was extracted before the damage is kept.

use serde::Serialize;
use thiserror::Error;

pub const CONTENT_TYPE_HANDSHAKE: u8 = 22;
pub const HANDSHAKE_CERTIFICATE: u8 = 11;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
const U24_LEN: usize = 3;

/// A record-layer frame borrowed from the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsRecordView<'a> {
    pub content_type: u8,
    pub legacy_version: u16,
    pub fragment: &'a [u8],
}

impl TlsRecordView<'_> {
    pub fn length(&self) -> usize {
        self.fragment.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeMessageView<'a> {
    pub msg_type: u8,
    pub payload: &'a [u8],
}

impl HandshakeMessageView<'_> {
    pub fn length(&self) -> usize {
        self.payload.len()
    }
}

/// Framing damage found while walking a capture. Offsets are into the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
pub enum ParseIssue {
    #[error("record at offset {offset} runs past the end of the capture")]
    TruncatedRecord { offset: usize },
    #[error("handshake message at offset {offset} runs past its record")]
    TruncatedHandshakeMessage { offset: usize },
    #[error("certificate list at offset {offset} runs past its message")]
    TruncatedCertificateContainer { offset: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction<'a> {
    pub certificates: Vec<&'a [u8]>,
    pub issues: Vec<ParseIssue>,
    pub records: usize,
}

fn read_u16(b: &[u8]) -> usize {
    (usize::from(b[0]) << 8) | usize::from(b[1])
}

fn read_u24(b: &[u8]) -> usize {
    (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2])
}

/// Reads the record header at `offset` and borrows its fragment.
pub fn record_at(buf: &[u8], offset: usize) -> Result<TlsRecordView<'_>, ParseIssue> {
    let header = buf.get(offset..offset + RECORD_HEADER_LEN).ok_or(ParseIssue::TruncatedRecord { offset })?;
    let len = read_u16(&header[3..5]);
    let body_start = offset + RECORD_HEADER_LEN;
    let fragment = buf.get(body_start..body_start + len).ok_or(ParseIssue::TruncatedRecord { offset })?;
    Ok(TlsRecordView { content_type: header[0], legacy_version: read_u16(&header[1..3]) as u16, fragment })
}

/// Iterates back-to-back handshake messages of one fragment.
pub struct HandshakeMessages<'a> {
    fragment: &'a [u8],
    pos: usize,
    base: usize,
    done: bool,
}

impl<'a> HandshakeMessages<'a> {
    /// `base` is the fragment's offset in the capture, used for issue offsets.
    pub fn new(fragment: &'a [u8], base: usize) -> Self {
        HandshakeMessages { fragment, pos: 0, base, done: false }
    }
}

impl<'a> Iterator for HandshakeMessages<'a> {
    type Item = Result<(usize, HandshakeMessageView<'a>), ParseIssue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.fragment.len() {
            return None;
        }
        let offset = self.base + self.pos;
        let truncated = ParseIssue::TruncatedHandshakeMessage { offset };
        let Some(header) = self.fragment.get(self.pos..self.pos + HANDSHAKE_HEADER_LEN) else {
            self.done = true;
            return Some(Err(truncated));
        };
        let len = read_u24(&header[1..4]);
        let start = self.pos + HANDSHAKE_HEADER_LEN;
        let Some(payload) = self.fragment.get(start..start + len) else {
            self.done = true;
            return Some(Err(truncated));
        };
        self.pos = start + len;
        Some(Ok((offset + HANDSHAKE_HEADER_LEN, HandshakeMessageView { msg_type: header[0], payload })))
    }
}

/// Splits a Certificate message body into its DER entries. Zero-length
/// entries are skipped. A bad total drops the whole message; a bad entry
/// keeps the entries before it.
pub fn certificate_entries<'a>(payload: &'a [u8], base: usize, out: &mut Vec<&'a [u8]>) -> Option<ParseIssue> {
    let truncated = ParseIssue::TruncatedCertificateContainer { offset: base };
    let Some(total_bytes) = payload.get(..U24_LEN) else {
        return Some(truncated);
    };
    let total = read_u24(total_bytes);
    let Some(list) = payload.get(U24_LEN..U24_LEN + total) else {
        return Some(truncated);
    };
    let mut pos = 0;
    while pos < list.len() {
        let entry_issue = ParseIssue::TruncatedCertificateContainer { offset: base + U24_LEN + pos };
        let Some(len_bytes) = list.get(pos..pos + U24_LEN) else {
            return Some(entry_issue);
        };
        let len = read_u24(len_bytes);
        let start = pos + U24_LEN;
        let Some(der) = list.get(start..start + len) else {
            return Some(entry_issue);
        };
        if !der.is_empty() {
            out.push(der);
        }
        pos = start + len;
    }
    None
}

/// Extracts every certificate blob from a raw capture, in order.
pub fn extract_certificates(buf: &[u8]) -> Extraction<'_> {
    let mut extraction = Extraction::default();
    let mut i = 0;
    while i < buf.len() {
        if buf[i] != CONTENT_TYPE_HANDSHAKE {
            i += 1;
            continue;
        }
        let record = match record_at(buf, i) {
            Ok(r) => r,
            Err(issue) => {
                extraction.issues.push(issue);
                break;
            }
        };
        extraction.records += 1;
        let body = i + RECORD_HEADER_LEN;
        for message in HandshakeMessages::new(record.fragment, body) {
            match message {
                Ok((offset, msg)) if msg.msg_type == HANDSHAKE_CERTIFICATE => {
                    if let Some(issue) = certificate_entries(msg.payload, offset, &mut extraction.certificates) {
                        extraction.issues.push(issue);
                    }
                }
                Ok(_) => {}
                Err(issue) => extraction.issues.push(issue),
            }
        }
        i = body + record.length();
    }
    extraction
}

/// Coarse classification of a stored response by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// Nothing captured.
    Empty,
    /// Starts with a handshake record.
    Handshake,
    /// Something else answered (alert, HTTP, SSH banner, ...).
    Other,
}

impl ResponseKind {
    pub fn of(response: &[u8]) -> Self {
        match response.first() {
            None => ResponseKind::Empty,
            Some(&CONTENT_TYPE_HANDSHAKE) => ResponseKind::Handshake,
            Some(_) => ResponseKind::Other,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ResponseKind::Empty => "invalid",
            ResponseKind::Handshake => "valid",
            ResponseKind::Other => "error",
        }
    }
}
