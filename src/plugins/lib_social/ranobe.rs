use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use super::client::{absolute_url, LibSocialClient, Site};
use super::html::{html_to_pieces, HtmlPiece};
use super::{chapter_path, metadata_path, parse_chapter_list, parse_manga, slug_after};
use crate::core::chapters::error_block;
use crate::core::model::{ChapterRef, ContentBlock, CoverImage, Manga};
use crate::plugins::registry::{ChapterContext, ContentService, ProgressSink};
use crate::plugins::xml::decode_entities;

/// Text novels from RanobeLib. Chapters arrive either as HTML or as a
/// ProseMirror-style `doc` tree with images listed in `attachments`.
pub struct RanobeLibService {
    client: LibSocialClient,
}

impl RanobeLibService {
    pub fn new(client: LibSocialClient) -> Self {
        Self { client }
    }

    async fn image_block(&self, src: &str) -> ContentBlock {
        let url = absolute_url(Site::Ranobe.origin(), src);
        match self.client.fetch_image(Site::Ranobe, &url).await {
            Ok(img) => ContentBlock::Image {
                data: crate::core::model::ImageData { base64: Some(img.base64), mime: Some(img.mime), url: Some(url) },
            },
            Err(e) => {
                tracing::warn!(url = %url, "image fetch failed: {:#}", e);
                error_block(&format!("image {}: {:#}", url, e))
            }
        }
    }
}

/// Plain text of a doc node, with hard breaks kept as newlines.
fn node_text(node: &Value) -> String {
    match node.get("type").and_then(Value::as_str) {
        Some("text") => node.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
        Some("hardBreak") => "\n".to_string(),
        _ => node
            .get("content")
            .and_then(Value::as_array)
            .map(|children| children.iter().map(node_text).collect::<String>())
            .unwrap_or_default(),
    }
}

fn attachment_url(attachments: &Value, name: &str) -> Option<String> {
    attachments.as_array()?.iter().find_map(|a| {
        let matches = ["name", "filename", "id"]
            .iter()
            .any(|k| a.get(*k).and_then(super::value_to_string).as_deref() == Some(name));
        if matches {
            a.get("url").and_then(Value::as_str).map(str::to_string)
        } else {
            None
        }
    })
}

/// Walks a doc tree into pieces in reading order.
fn doc_pieces(node: &Value, attachments: &Value, out: &mut Vec<HtmlPiece>) {
    match node.get("type").and_then(Value::as_str) {
        Some("paragraph") | Some("heading") => {
            let text = decode_entities(node_text(node).trim());
            if !text.is_empty() {
                out.push(HtmlPiece::Text(text));
            }
        }
        Some("image") => {
            let images = node.pointer("/attrs/images").and_then(Value::as_array);
            for img in images.into_iter().flatten() {
                let name = img.get("image").and_then(super::value_to_string);
                if let Some(url) = name.as_deref().and_then(|n| attachment_url(attachments, n)) {
                    out.push(HtmlPiece::Image(url));
                }
            }
        }
        Some("horizontalRule") => out.push(HtmlPiece::Text("* * *".to_string())),
        _ => {
            for child in node.get("content").and_then(Value::as_array).into_iter().flatten() {
                doc_pieces(child, attachments, out);
            }
        }
    }
}

pub(crate) fn content_pieces(extracted: &Value) -> Vec<HtmlPiece> {
    let attachments = extracted.get("attachments").cloned().unwrap_or(Value::Null);
    match extracted.get("content") {
        Some(Value::String(html)) => html_to_pieces(html),
        Some(doc @ Value::Object(_)) => {
            let mut out = Vec::new();
            doc_pieces(doc, &attachments, &mut out);
            out
        }
        _ => vec![],
    }
}

#[async_trait]
impl ContentService for RanobeLibService {
    fn key(&self) -> &'static str {
        "ranobelib"
    }

    fn slug_from_url(&self, url: &Url) -> Option<String> {
        slug_after(url, &["ranobelib.me", "ranobelib.org"], "book")
    }

    async fn fetch_metadata(&self, slug: &str) -> anyhow::Result<Manga> {
        let data = self.client.get_data(Site::Ranobe, &metadata_path(slug)).await?;
        Ok(parse_manga(&data))
    }

    async fn fetch_chapter_list(&self, slug: &str) -> anyhow::Result<Vec<ChapterRef>> {
        let data = self.client.get_data(Site::Ranobe, &format!("/manga/{}/chapters", slug)).await?;
        Ok(parse_chapter_list(&data))
    }

    async fn fetch_chapter_content(&self, slug: &str, number: &str, volume: &str) -> anyhow::Result<Value> {
        self.client.get_data(Site::Ranobe, &chapter_path(slug, number, volume)).await
    }

    async fn fetch_cover(&self, manga: &Manga) -> anyhow::Result<Option<CoverImage>> {
        match manga.cover.as_deref() {
            Some(url) => Ok(Some(self.client.fetch_image(Site::Ranobe, url).await?)),
            None => Ok(None),
        }
    }

    fn extract(&self, raw: Value) -> anyhow::Result<Value> {
        let content = raw.get("content").cloned().unwrap_or(Value::Null);
        if content.is_null() {
            anyhow::bail!("chapter payload has no content");
        }
        let attachments = raw.get("attachments").cloned().unwrap_or(Value::Null);
        Ok(serde_json::json!({ "content": content, "attachments": attachments }))
    }

    async fn process_content(
        &self,
        extracted: Value,
        sink: &dyn ProgressSink,
        _ctx: &ChapterContext<'_>,
    ) -> anyhow::Result<Vec<ContentBlock>> {
        let pieces = content_pieces(&extracted);
        let images = pieces.iter().filter(|p| matches!(p, HtmlPiece::Image(_))).count();

        let mut blocks = Vec::with_capacity(pieces.len());
        let mut done = 0;
        for piece in pieces {
            match piece {
                HtmlPiece::Text(t) => blocks.push(ContentBlock::text(t)),
                HtmlPiece::Image(src) => {
                    done += 1;
                    sink.report(&format!("image {}/{}", done, images));
                    blocks.push(self.image_block(&src).await);
                }
            }
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn doc_tree_flattens_in_order() {
        let extracted = json!({
            "content": {
                "type": "doc",
                "content": [
                    { "type": "paragraph", "content": [{ "type": "text", "text": "Привет" }, { "type": "hardBreak" }, { "type": "text", "text": "мир" }] },
                    { "type": "paragraph" },
                    { "type": "image", "attrs": { "images": [{ "image": "abc" }] } },
                    { "type": "horizontalRule" }
                ]
            },
            "attachments": [{ "name": "abc", "url": "/uploads/abc.jpg" }]
        });
        assert_eq!(
            content_pieces(&extracted),
            vec![
                HtmlPiece::Text("Привет\nмир".into()),
                HtmlPiece::Image("/uploads/abc.jpg".into()),
                HtmlPiece::Text("* * *".into()),
            ]
        );
    }

    #[test]
    fn html_content_is_supported() {
        let extracted = json!({ "content": "<p>one</p><p>two</p>", "attachments": [] });
        assert_eq!(content_pieces(&extracted).len(), 2);
    }

    #[test]
    fn extract_requires_content() {
        let svc = RanobeLibService::new(LibSocialClient::new(Default::default()).unwrap());
        assert!(svc.extract(json!({ "id": 1 })).is_err());
        let e = svc.extract(json!({ "content": "<p>x</p>" })).unwrap();
        assert_eq!(e["content"], "<p>x</p>");
    }
}
