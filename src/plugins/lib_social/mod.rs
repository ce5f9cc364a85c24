//! Content services for the lib.social API family (RanobeLib, MangaLib).

mod client;
mod html;
mod manga;
mod ranobe;

pub use client::{absolute_url, sniff_mime, LibSocialClient, LibSocialError, Site};
pub use html::{html_to_pieces, HtmlPiece};
pub use manga::MangaLibService;
pub use ranobe::RanobeLibService;

use crate::core::model::{ChapterRef, Manga};
use serde_json::Value;
use url::Url;

/// Slug that follows `marker` in the URL path on one of `hosts`.
pub(crate) fn slug_after(url: &Url, hosts: &[&str], marker: &str) -> Option<String> {
    let host = url.host_str()?.trim_start_matches("www.");
    if !hosts.iter().any(|h| host.eq_ignore_ascii_case(h)) {
        return None;
    }
    let segs: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    let pos = segs.iter().position(|s| *s == marker)?;
    segs.get(pos + 1).map(|s| s.to_string())
}

pub(crate) fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn parse_manga(data: &Value) -> Manga {
    let pick = |k: &str| data.get(k).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty());
    let title = pick("rus_name")
        .or_else(|| pick("name"))
        .or_else(|| pick("eng_name"))
        .unwrap_or("Untitled")
        .to_string();

    let cover = data
        .get("cover")
        .and_then(|c| c.get("default").or_else(|| c.get("thumbnail")))
        .and_then(Value::as_str)
        .map(str::to_string);

    let authors = data
        .get("authors")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|a| a.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Manga { title, cover, authors, summary: pick("summary").map(str::to_string) }
}

pub(crate) fn parse_chapter_list(data: &Value) -> Vec<ChapterRef> {
    data.as_array()
        .map(|list| {
            list.iter()
                .map(|c| ChapterRef {
                    volume: c.get("volume").and_then(value_to_string),
                    number: c.get("number").and_then(value_to_string),
                    name: c.get("name").and_then(Value::as_str).map(str::to_string).filter(|s| !s.is_empty()),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn chapter_path(slug: &str, number: &str, volume: &str) -> String {
    let enc = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
    format!("/manga/{}/chapter?number={}&volume={}", slug, enc(number), enc(volume))
}

pub(crate) fn metadata_path(slug: &str) -> String {
    format!("/manga/{}?fields[]=summary&fields[]=authors", slug)
}
