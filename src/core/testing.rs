//! In-memory collaborators for engine tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use url::Url;

use crate::core::model::{ChapterRef, CoverImage, Manga};
use crate::plugins::epub::EpubExporter;
use crate::plugins::fb2::Fb2Exporter;
use crate::plugins::pdf::PdfExporter;
use crate::plugins::registry::{ContentService, PluginRegistry};

#[derive(Default)]
pub struct FakeService {
    chapters: Vec<ChapterRef>,
    failing: HashSet<String>,
    fail_metadata: bool,
    fail_cover: bool,
    cap: Option<usize>,
    fetched: Mutex<Vec<String>>,
}

impl FakeService {
    /// `count` chapters numbered 1..=count in volume 1, served in reverse
    /// order so callers have to sort.
    pub fn new(count: usize) -> Self {
        let mut chapters = Self::chapter_refs(count);
        chapters.reverse();
        Self { chapters, ..Default::default() }
    }

    pub fn chapter_refs(count: usize) -> Vec<ChapterRef> {
        (1..=count).map(|i| ChapterRef::new("1", i.to_string())).collect()
    }

    pub fn failing(mut self, number: &str) -> Self {
        self.failing.insert(number.to_string());
        self
    }

    pub fn failing_metadata(mut self) -> Self {
        self.fail_metadata = true;
        self
    }

    pub fn failing_cover(mut self) -> Self {
        self.fail_cover = true;
        self
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = Some(cap);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetched.lock().unwrap().len()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentService for FakeService {
    fn key(&self) -> &'static str {
        "fake"
    }

    fn slug_from_url(&self, url: &Url) -> Option<String> {
        if url.host_str() != Some("fake.test") {
            return None;
        }
        url.path_segments()?.last().filter(|s| !s.is_empty()).map(str::to_string)
    }

    fn max_chapters_per_file(&self) -> Option<usize> {
        self.cap
    }

    async fn fetch_metadata(&self, slug: &str) -> anyhow::Result<Manga> {
        if self.fail_metadata {
            anyhow::bail!("metadata unavailable for {}", slug);
        }
        Ok(Manga {
            title: format!("Book {}", slug),
            cover: Some("https://fake.test/cover.jpg".into()),
            authors: vec!["Author".into()],
            summary: Some("About".into()),
        })
    }

    async fn fetch_chapter_list(&self, _slug: &str) -> anyhow::Result<Vec<ChapterRef>> {
        Ok(self.chapters.clone())
    }

    async fn fetch_chapter_content(&self, _slug: &str, number: &str, _volume: &str) -> anyhow::Result<Value> {
        self.fetched.lock().unwrap().push(number.to_string());
        if self.failing.contains(number) {
            anyhow::bail!("boom on {}", number);
        }
        Ok(Value::String(format!("Text of chapter {}", number)))
    }

    async fn fetch_cover(&self, _manga: &Manga) -> anyhow::Result<Option<CoverImage>> {
        if self.fail_cover {
            anyhow::bail!("cover host down");
        }
        Ok(Some(CoverImage { base64: "Q09WRVI=".into(), mime: "image/jpeg".into() }))
    }
}

pub fn registry(service: Arc<FakeService>) -> PluginRegistry {
    let mut reg = PluginRegistry::empty();
    reg.register_service(service);
    reg.register_exporter(Arc::new(Fb2Exporter::new()));
    reg.register_exporter(Arc::new(EpubExporter::new()));
    reg.register_exporter(Arc::new(PdfExporter::new()));
    reg
}
