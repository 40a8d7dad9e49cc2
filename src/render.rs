use std::fmt::Write as _;

use crate::response::HttpResponse;

const HEX_PREVIEW_BYTES: usize = 128;
const HEX_ROW: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Text,
    Binary,
}

/// Decides how a body is shown to a person.
pub fn classify(content_type: Option<&str>, body: &[u8]) -> BodyKind {
    if let Some(content_type) = content_type {
        let lower = content_type.to_ascii_lowercase();
        return if ["text", "json", "xml"].iter().any(|kind| lower.contains(kind)) {
            BodyKind::Text
        } else {
            BodyKind::Binary
        };
    }
    // Untyped bodies that look like HTML are still text.
    let head: Vec<u8> = body
        .iter()
        .skip_while(|b| b.is_ascii_whitespace())
        .take(9)
        .map(|b| b.to_ascii_lowercase())
        .collect();
    if head.starts_with(b"<!doctype") || head.starts_with(b"<html") {
        BodyKind::Text
    } else {
        BodyKind::Binary
    }
}

/// Offset, hex columns and printable ASCII for the first 128 bytes.
pub fn hex_preview(body: &[u8]) -> String {
    let mut out = String::new();
    let shown = &body[..body.len().min(HEX_PREVIEW_BYTES)];
    for (row, chunk) in shown.chunks(HEX_ROW).enumerate() {
        let _ = write!(out, "{:08x} ", row * HEX_ROW);
        for i in 0..HEX_ROW {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, " {:02x}", b);
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    if body.len() > HEX_PREVIEW_BYTES {
        let _ = writeln!(out, "... {} more bytes", body.len() - HEX_PREVIEW_BYTES);
    }
    out
}

/// Human-readable result of a successful fetch: status, headers, body.
pub fn render_response(response: &HttpResponse) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", response.status_line().trim_end());
    for (name, value) in response.headers.iter() {
        let _ = writeln!(out, "{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Received {} body bytes", response.body.len());
    if response.body.is_empty() {
        return out;
    }
    out.push('\n');
    match classify(response.content_type(), &response.body) {
        BodyKind::Text => out.push_str(&String::from_utf8_lossy(&response.body)),
        BodyKind::Binary => {
            let _ = writeln!(
                out,
                "[binary content, first {} bytes as hex]",
                response.body.len().min(HEX_PREVIEW_BYTES)
            );
            out.push_str(&hex_preview(&response.body));
        }
    }
    out
}
