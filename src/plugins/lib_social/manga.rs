use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use url::Url;

use super::client::{absolute_url, LibSocialClient, Site};
use super::{chapter_path, metadata_path, parse_chapter_list, parse_manga, slug_after};
use crate::core::chapters::error_block;
use crate::core::model::{ChapterRef, ContentBlock, CoverImage, ImageData, Manga};
use crate::plugins::registry::{ChapterContext, ContentService, ProgressSink};

const MAX_CHAPTERS_PER_FILE: usize = 80;
const PAGE_FETCH_CONCURRENCY: usize = 4;

/// Image chapters from MangaLib; every page is fetched and inlined.
pub struct MangaLibService {
    client: LibSocialClient,
}

impl MangaLibService {
    pub fn new(client: LibSocialClient) -> Self {
        Self { client }
    }
}

pub(crate) fn page_urls(extracted: &Value) -> Vec<String> {
    extracted
        .as_array()
        .map(|pages| {
            pages
                .iter()
                .filter_map(|p| {
                    p.get("url")
                        .or_else(|| p.get("image"))
                        .and_then(Value::as_str)
                        .or_else(|| p.as_str())
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ContentService for MangaLibService {
    fn key(&self) -> &'static str {
        "mangalib"
    }

    fn slug_from_url(&self, url: &Url) -> Option<String> {
        slug_after(url, &["mangalib.me", "mangalib.org"], "manga")
    }

    fn max_chapters_per_file(&self) -> Option<usize> {
        Some(MAX_CHAPTERS_PER_FILE)
    }

    async fn fetch_metadata(&self, slug: &str) -> anyhow::Result<Manga> {
        let data = self.client.get_data(Site::Manga, &metadata_path(slug)).await?;
        Ok(parse_manga(&data))
    }

    async fn fetch_chapter_list(&self, slug: &str) -> anyhow::Result<Vec<ChapterRef>> {
        let data = self.client.get_data(Site::Manga, &format!("/manga/{}/chapters", slug)).await?;
        Ok(parse_chapter_list(&data))
    }

    async fn fetch_chapter_content(&self, slug: &str, number: &str, volume: &str) -> anyhow::Result<Value> {
        self.client.get_data(Site::Manga, &chapter_path(slug, number, volume)).await
    }

    async fn fetch_cover(&self, manga: &Manga) -> anyhow::Result<Option<CoverImage>> {
        match manga.cover.as_deref() {
            Some(url) => Ok(Some(self.client.fetch_image(Site::Manga, url).await?)),
            None => Ok(None),
        }
    }

    fn extract(&self, raw: Value) -> anyhow::Result<Value> {
        match raw.get("pages") {
            Some(pages @ Value::Array(_)) => Ok(pages.clone()),
            _ => anyhow::bail!("chapter payload has no pages"),
        }
    }

    async fn process_content(
        &self,
        extracted: Value,
        sink: &dyn ProgressSink,
        _ctx: &ChapterContext<'_>,
    ) -> anyhow::Result<Vec<ContentBlock>> {
        let urls = page_urls(&extracted);
        let total = urls.len();
        let image_base = self.client.ctx().image_base.clone();

        let blocks = stream::iter(urls.into_iter().enumerate())
            .map(|(i, page)| {
                let url = absolute_url(&image_base, &page);
                async move {
                    sink.report(&format!("page {}/{}", i + 1, total));
                    match self.client.fetch_image(Site::Manga, &url).await {
                        Ok(img) => ContentBlock::Image {
                            data: ImageData { base64: Some(img.base64), mime: Some(img.mime), url: Some(url) },
                        },
                        Err(e) => {
                            tracing::warn!(url = %url, "page fetch failed: {:#}", e);
                            error_block(&format!("page {}: {:#}", i + 1, e))
                        }
                    }
                }
            })
            .buffered(PAGE_FETCH_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pages_accept_objects_and_strings() {
        let pages = json!([{ "url": "/a/1.jpg" }, { "image": "2.jpg" }, "3.jpg", { "other": 1 }]);
        assert_eq!(page_urls(&pages), vec!["/a/1.jpg", "2.jpg", "3.jpg"]);
    }

    #[test]
    fn capped_at_eighty_chapters() {
        let svc = MangaLibService::new(LibSocialClient::new(Default::default()).unwrap());
        assert_eq!(svc.max_chapters_per_file(), Some(80));
        assert!(svc.extract(json!({ "pages": "x" })).is_err());
        assert_eq!(svc.extract(json!({ "pages": [] })).unwrap(), json!([]));
    }
}
