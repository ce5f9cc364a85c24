use async_trait::async_trait;
use bytes::Bytes;
use crate::core::error::EngineError;
use crate::core::model::{ChapterRef, ChapterResult, ContentBlock, CoverImage, ExportFormat, Manga};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub api_base: String,
    pub image_base: String,
}

impl Default for ServiceContext {
    fn default() -> Self {
        Self {
            user_agent: format!("chapter-downloader/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 60,
            retries: 2,
            retry_backoff_ms: 400,
            api_base: "https://api.lib.social/api".to_string(),
            image_base: "https://img2.imglib.info".to_string(),
        }
    }
}

/// Where the pipeline is when a service normalizes one chapter.
#[derive(Debug, Clone, Copy)]
pub struct ChapterContext<'a> {
    pub slug: &'a str,
    pub chapter: &'a ChapterRef,
    pub index: usize,
    pub total: usize,
}

/// Fine-grained progress from inside a service hook (e.g. "image 3/20").
pub trait ProgressSink: Send + Sync {
    fn report(&self, message: &str);
}

pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn report(&self, _message: &str) {}
}

#[async_trait]
pub trait ContentService: Send + Sync {
    fn key(&self) -> &'static str;

    /// Returns the work slug when `url` points at this service.
    fn slug_from_url(&self, url: &Url) -> Option<String>;

    /// Chapters per exported file; `None` exports everything into one file.
    fn max_chapters_per_file(&self) -> Option<usize> {
        None
    }

    async fn fetch_metadata(&self, slug: &str) -> anyhow::Result<Manga>;

    async fn fetch_chapter_list(&self, slug: &str) -> anyhow::Result<Vec<ChapterRef>>;

    async fn fetch_chapter_content(&self, slug: &str, number: &str, volume: &str) -> anyhow::Result<Value>;

    /// Cover image for `manga`, inline-encoded. Default: no cover.
    async fn fetch_cover(&self, _manga: &Manga) -> anyhow::Result<Option<CoverImage>> {
        Ok(None)
    }

    /// Pulls the chapter body out of the raw payload. Default: pass-through.
    fn extract(&self, raw: Value) -> anyhow::Result<Value> {
        Ok(raw)
    }

    /// Turns the extracted body into content blocks. Default: generic conversion.
    async fn process_content(
        &self,
        extracted: Value,
        _sink: &dyn ProgressSink,
        _ctx: &ChapterContext<'_>,
    ) -> anyhow::Result<Vec<ContentBlock>> {
        Ok(blocks_from_value(extracted))
    }
}

/// Converts an arbitrary payload into blocks: serialized blocks are taken
/// as-is, strings become one text block per non-empty line, anything else is
/// kept as its JSON text.
pub fn blocks_from_value(value: Value) -> Vec<ContentBlock> {
    match value {
        Value::Null => vec![],
        Value::String(s) => s
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ContentBlock::text)
            .collect(),
        Value::Array(_) => match serde_json::from_value::<Vec<ContentBlock>>(value.clone()) {
            Ok(blocks) => blocks,
            Err(_) => vec![ContentBlock::text(value.to_string())],
        },
        other => match serde_json::from_value::<ContentBlock>(other.clone()) {
            Ok(block) => vec![block],
            Err(_) => vec![ContentBlock::text(other.to_string())],
        },
    }
}

#[derive(Debug, Clone)]
pub struct ExportedFile {
    pub filename: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedBook {
    pub manga: Manga,
    pub cover: Option<CoverImage>,
    pub chapters: Vec<ChapterResult>,
}

pub trait Exporter: Send + Sync {
    fn format(&self) -> ExportFormat;

    fn export(
        &self,
        manga: &Manga,
        chapters: &[ChapterResult],
        cover: Option<&CoverImage>,
    ) -> anyhow::Result<ExportedFile>;

    fn can_parse(&self) -> bool {
        false
    }

    fn parse(&self, _data: &[u8]) -> anyhow::Result<ParsedBook> {
        Err(EngineError::ParseUnsupported(self.format()).into())
    }
}

/// `Title.ext` with characters unsafe for file systems removed.
pub fn export_filename(title: &str, format: ExportFormat) -> String {
    let clean = sanitize_filename::sanitize(title.trim());
    let stem = if clean.is_empty() { "book".to_string() } else { clean };
    format!("{}.{}", stem, format.extension())
}

pub struct PluginRegistry {
    services: Vec<Arc<dyn ContentService>>,
    exporters: Vec<Arc<dyn Exporter>>,
}

impl PluginRegistry {
    pub fn empty() -> Self {
        Self { services: vec![], exporters: vec![] }
    }

    pub fn with_defaults(ctx: ServiceContext) -> anyhow::Result<Self> {
        let client = crate::plugins::lib_social::LibSocialClient::new(ctx)?;

        let mut reg = Self::empty();
        reg.register_service(Arc::new(crate::plugins::lib_social::RanobeLibService::new(client.clone())));
        reg.register_service(Arc::new(crate::plugins::lib_social::MangaLibService::new(client)));

        reg.register_exporter(Arc::new(crate::plugins::fb2::Fb2Exporter::new()));
        reg.register_exporter(Arc::new(crate::plugins::epub::EpubExporter::new()));
        reg.register_exporter(Arc::new(crate::plugins::pdf::PdfExporter::new()));
        Ok(reg)
    }

    pub fn register_service(&mut self, service: Arc<dyn ContentService>) {
        self.services.retain(|s| s.key() != service.key());
        self.services.push(service);
    }

    pub fn register_exporter(&mut self, exporter: Arc<dyn Exporter>) {
        self.exporters.retain(|e| e.format() != exporter.format());
        self.exporters.push(exporter);
    }

    pub fn service(&self, key: &str) -> Option<Arc<dyn ContentService>> {
        self.services
            .iter()
            .find(|s| s.key().eq_ignore_ascii_case(key.trim()))
            .cloned()
    }

    /// Service chosen by explicit key first, then by URL. The slug comes from
    /// the URL when it matched.
    pub fn resolve(&self, key: Option<&str>, url: Option<&str>) -> Option<(Arc<dyn ContentService>, Option<String>)> {
        let parsed = url.and_then(|u| Url::parse(u.trim()).ok());

        if let Some(key) = key {
            let service = self.service(key)?;
            let slug = parsed.as_ref().and_then(|u| service.slug_from_url(u));
            return Some((service, slug));
        }

        let parsed = parsed?;
        self.services
            .iter()
            .find_map(|s| s.slug_from_url(&parsed).map(|slug| (s.clone(), Some(slug))))
    }

    pub fn exporter(&self, format: ExportFormat) -> Option<Arc<dyn Exporter>> {
        self.exporters.iter().find(|e| e.format() == format).cloned()
    }

    pub fn service_keys(&self) -> Vec<&'static str> {
        self.services.iter().map(|s| s.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_from_strings_and_serialized_blocks() {
        let b = blocks_from_value(Value::String("one\n\n two \n".into()));
        assert_eq!(b, vec![ContentBlock::text("one"), ContentBlock::text("two")]);

        let v = serde_json::json!([{ "type": "text", "text": "hi" }]);
        assert_eq!(blocks_from_value(v), vec![ContentBlock::text("hi")]);

        let v = serde_json::json!({ "weird": 1 });
        assert_eq!(blocks_from_value(v), vec![ContentBlock::text("{\"weird\":1}")]);
        assert!(blocks_from_value(Value::Null).is_empty());
    }

    #[test]
    fn filename_is_sanitized() {
        assert_eq!(export_filename("A/B: C", ExportFormat::Epub), "AB C.epub");
        assert_eq!(export_filename("  ", ExportFormat::Fb2), "book.fb2");
    }

    #[test]
    fn default_registry_resolves_by_key_and_url() {
        let reg = PluginRegistry::with_defaults(ServiceContext::default()).unwrap();
        assert_eq!(reg.service_keys(), vec!["ranobelib", "mangalib"]);

        let (s, slug) = reg.resolve(None, Some("https://mangalib.me/ru/manga/123--one-piece?section=info")).unwrap();
        assert_eq!(s.key(), "mangalib");
        assert_eq!(slug.as_deref(), Some("123--one-piece"));

        let (s, slug) = reg.resolve(Some("RanobeLib"), None).unwrap();
        assert_eq!(s.key(), "ranobelib");
        assert!(slug.is_none());

        assert!(reg.resolve(Some("nope"), None).is_none());
        assert!(reg.resolve(None, Some("https://example.com/book/1")).is_none());
        assert!(reg.resolve(None, None).is_none());

        assert!(reg.exporter(ExportFormat::Pdf).is_some());
        assert!(!reg.exporter(ExportFormat::Pdf).unwrap().can_parse());
    }
}
