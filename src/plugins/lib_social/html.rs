use crate::plugins::xml::decode_entities;
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtmlPiece {
    Text(String),
    Image(String),
}

fn block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["'][^>]*>|<(p|h[1-6]|div|li|blockquote)\b[^>]*>(.*?)</(?:p|h[1-6]|div|li|blockquote)>"#)
            .expect("static regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("static regex"))
}

fn br_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<br\s*/?>").expect("static regex"))
}

fn clean_text(fragment: &str) -> String {
    let with_breaks = br_re().replace_all(fragment, "\n");
    let stripped = tag_re().replace_all(&with_breaks, "");
    decode_entities(&stripped)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Flattens chapter HTML into paragraphs and image references in document order.
pub fn html_to_pieces(html: &str) -> Vec<HtmlPiece> {
    let mut pieces = Vec::new();
    for caps in block_re().captures_iter(html) {
        if let Some(src) = caps.get(1) {
            pieces.push(HtmlPiece::Image(decode_entities(src.as_str())));
            continue;
        }
        let inner = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        // images nested inside a paragraph
        for piece in html_to_pieces_inline(inner) {
            pieces.push(piece);
        }
    }

    if pieces.is_empty() {
        let text = clean_text(html);
        pieces.extend(text.lines().map(|l| HtmlPiece::Text(l.to_string())));
    }
    pieces
}

fn html_to_pieces_inline(inner: &str) -> Vec<HtmlPiece> {
    let mut pieces = Vec::new();
    let mut last = 0;
    for caps in block_re().captures_iter(inner) {
        let Some(src) = caps.get(1) else { continue };
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(src.range());
        let text = clean_text(&inner[last..whole.start]);
        if !text.is_empty() {
            pieces.push(HtmlPiece::Text(text));
        }
        pieces.push(HtmlPiece::Image(decode_entities(src.as_str())));
        last = whole.end;
    }
    let text = clean_text(&inner[last..]);
    if !text.is_empty() {
        pieces.push(HtmlPiece::Text(text));
    }
    pieces
}
