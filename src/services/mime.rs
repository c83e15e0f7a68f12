/// Number of leading bytes inspected when sniffing content
pub const SNIFF_LEN: usize = 512;

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Detects a content type from the first bytes of an upload
pub trait MimeSniffer: Send + Sync {
    fn sniff(&self, head: &[u8]) -> String;
}

/// Magic-number table with a printable-text fallback
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureSniffer;

const SIGNATURES: &[(&[u8], &str)] = &[
    // Images
    (&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A], "image/png"),
    (&[0xFF, 0xD8, 0xFF], "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"BM", "image/bmp"),
    (&[0x00, 0x00, 0x01, 0x00], "image/x-icon"),
    // Documents and archives
    (b"%PDF-", "application/pdf"),
    (b"%!PS-Adobe-", "application/postscript"),
    (&[0x50, 0x4B, 0x03, 0x04], "application/zip"),
    (&[0x1F, 0x8B, 0x08], "application/x-gzip"),
    (b"Rar!\x1A\x07", "application/x-rar-compressed"),
    (&[0x00, 0x61, 0x73, 0x6D], "application/wasm"),
    // Audio and video
    (b"ID3", "audio/mpeg"),
    (b"OggS\x00", "application/ogg"),
    (b"fLaC", "audio/flac"),
    (&[0x1A, 0x45, 0xDF, 0xA3], "video/webm"),
];

impl MimeSniffer for SignatureSniffer {
    fn sniff(&self, head: &[u8]) -> String {
        let head = &head[..head.len().min(SNIFF_LEN)];

        if let Some(mime) = sniff_riff(head).or_else(|| sniff_ftyp(head)) {
            return mime.to_string();
        }

        for &(magic, mime) in SIGNATURES {
            if head.starts_with(magic) {
                return mime.to_string();
            }
        }

        if let Some(mime) = sniff_markup(head) {
            return mime.to_string();
        }

        if head.starts_with(&[0xEF, 0xBB, 0xBF]) || is_text(head) {
            return TEXT_PLAIN.to_string();
        }

        OCTET_STREAM.to_string()
    }
}

/// RIFF containers carry their format at offset 8
fn sniff_riff(head: &[u8]) -> Option<&'static str> {
    if head.len() < 12 || !head.starts_with(b"RIFF") {
        return None;
    }
    match &head[8..12] {
        b"WEBP" => Some("image/webp"),
        b"WAVE" => Some("audio/wave"),
        b"AVI " => Some("video/avi"),
        _ => None,
    }
}

/// ISO base media files: box size, then `ftyp`
fn sniff_ftyp(head: &[u8]) -> Option<&'static str> {
    if head.len() < 12 || &head[4..8] != b"ftyp" {
        return None;
    }
    match &head[8..11] {
        b"mp4" | b"iso" | b"avc" => Some("video/mp4"),
        b"M4A" => Some("audio/mp4"),
        b"hei" | b"mif" => Some("image/heic"),
        _ => Some("video/mp4"),
    }
}

fn sniff_markup(head: &[u8]) -> Option<&'static str> {
    let start = head
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(head.len());
    let trimmed = &head[start..];

    if starts_with_ci(trimmed, b"<!doctype html") || starts_with_ci(trimmed, b"<html") {
        Some("text/html; charset=utf-8")
    } else if starts_with_ci(trimmed, b"<?xml") {
        Some("text/xml; charset=utf-8")
    } else if starts_with_ci(trimmed, b"<svg") {
        Some("image/svg+xml")
    } else {
        None
    }
}

fn starts_with_ci(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len() && data[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// No control bytes other than tab, newline, vertical tab, form feed and
/// carriage return
fn is_text(data: &[u8]) -> bool {
    data.iter().all(|&b| b >= 9 && !(14..32).contains(&b))
}

/// Type without parameters, lowercased
pub fn base_type(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Whether a client-declared type is consistent with the sniffed one.
///
/// No declaration, or `application/octet-stream`, claims nothing. Otherwise
/// the base types must agree; a declared textual type is accepted for content
/// that sniffed as generic text.
pub fn mime_matches(declared: Option<&str>, sniffed: &str) -> bool {
    let declared = match declared.map(base_type) {
        Some(d) if !d.is_empty() && d != OCTET_STREAM => d,
        _ => return true,
    };
    let sniffed = base_type(sniffed);

    if declared == sniffed {
        return true;
    }

    sniffed == "text/plain" && is_textual(&declared)
}

fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/")
        || matches!(
            mime,
            "application/json" | "application/xml" | "application/javascript" | "application/x-yaml"
        )
}

/// Files that can be rendered inline by a previewer
pub fn preview_eligible(mime: &str) -> bool {
    let base = base_type(mime);
    base.starts_with("image/") || base.starts_with("text/") || base == "application/pdf"
}
