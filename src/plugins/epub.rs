//! EPUB exporter and parser.
//!
//! Chapters are stored one XHTML document each, in spine order, with the
//! chapter volume and number kept in `<meta>` tags for update runs.

use anyhow::Context;
use base64::Engine as _;
use bytes::Bytes;
use epub_builder::{EpubBuilder, EpubContent, EpubVersion, ReferenceType, ZipLibrary};
use regex::Regex;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::{Cursor, Read};
use std::sync::OnceLock;
use zip::ZipArchive;

use crate::core::model::{ChapterResult, ContentBlock, CoverImage, ExportFormat, ImageData, Manga};
use crate::plugins::registry::{export_filename, ExportedFile, Exporter, ParsedBook};
use crate::plugins::xml::{attr, decode_entities, escape};

const OPF_PATH: &str = "OEBPS/content.opf";

pub struct EpubExporter;

impl EpubExporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EpubExporter {
    fn default() -> Self {
        Self::new()
    }
}

fn ext_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

fn mime_for_ext(path: &str) -> &'static str {
    match path.rsplit('.').next().map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

struct Patterns {
    tag: Regex,
    full_path: Regex,
    title: Regex,
    creator: Regex,
    description: Regex,
    manifest_item: Regex,
    meta: Regex,
    itemref: Regex,
    chapter_meta: Regex,
    heading: Regex,
    body: Regex,
    content_item: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |pattern: &str| Regex::new(pattern).expect("static regex");
        Patterns {
            tag: re(r"(?s)<[^>]+>"),
            full_path: re(r#"full-path="([^"]+)""#),
            title: re(r"(?s)<dc:title[^>]*>(.*?)</dc:title>"),
            creator: re(r"(?s)<dc:creator[^>]*>(.*?)</dc:creator>"),
            description: re(r"(?s)<dc:description[^>]*>(.*?)</dc:description>"),
            manifest_item: re(r"(?s)<item\b([^>]*?)/?>"),
            meta: re(r"<meta\b([^>]*)>"),
            itemref: re(r#"<itemref\b[^>]*idref="([^"]+)""#),
            chapter_meta: re(r#"<meta\s+name="(volume|number)"\s+content="([^"]*)""#),
            heading: re(r"(?s)<h2[^>]*>(.*?)</h2>"),
            body: re(r"(?s)<body[^>]*>(.*?)</body>"),
            content_item: re(r#"(?s)<p\b[^>]*>(.*?)</p>|<img\b[^>]*?src="([^"]+)"[^>]*>"#),
        }
    })
}

fn epub_err(e: impl std::fmt::Display) -> anyhow::Error {
    anyhow::anyhow!("epub: {}", e)
}

fn chapter_xhtml(chapter: &ChapterResult, images: &mut Vec<(String, String, Vec<u8>)>) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<!DOCTYPE html>\n");
    out.push_str("<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"ru\" xml:lang=\"ru\"><head>");
    let _ = write!(out, "<title>{}</title>", escape(&chapter.title));
    let _ = write!(out, "<meta name=\"volume\" content=\"{}\"/>", escape(chapter.volume.as_deref().unwrap_or("1")));
    let _ = write!(out, "<meta name=\"number\" content=\"{}\"/>", escape(chapter.number.as_deref().unwrap_or("0")));
    out.push_str("</head><body>");
    let _ = write!(out, "<h2>{}</h2>", escape(&chapter.title));

    for block in &chapter.content {
        match block {
            ContentBlock::Text { text } => {
                for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    let _ = write!(out, "<p>{}</p>", escape(line));
                }
            }
            ContentBlock::Image { data } => {
                let Some(raw) = data
                    .base64
                    .as_deref()
                    .and_then(|b| base64::engine::general_purpose::STANDARD.decode(b).ok())
                    .filter(|raw| !raw.is_empty())
                else {
                    continue;
                };
                let mime = data.mime.clone().unwrap_or_else(|| "image/jpeg".to_string());
                let name = format!("img_{:05}.{}", images.len() + 1, ext_for_mime(&mime));
                let _ = write!(out, "<div class=\"image\"><img src=\"../images/{}\" alt=\"\"/></div>", name);
                images.push((name, mime, raw));
            }
        }
    }
    out.push_str("</body></html>\n");
    out
}

/// Joins `rel` onto the directory `base_dir`, resolving `..` segments.
fn resolve_path(base_dir: &str, rel: &str) -> String {
    let mut parts: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
    for seg in rel.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

fn dir_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(d, _)| d).unwrap_or("")
}

fn read_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> anyhow::Result<Vec<u8>> {
    let mut file = archive.by_name(name).with_context(|| format!("epub entry {}", name))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

impl Exporter for EpubExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Epub
    }

    fn export(&self, manga: &Manga, chapters: &[ChapterResult], cover: Option<&CoverImage>) -> anyhow::Result<ExportedFile> {
        let mut book = EpubBuilder::new(ZipLibrary::new().map_err(epub_err)?).map_err(epub_err)?;
        book.epub_version(EpubVersion::V30);
        book.metadata("title", manga.title.as_str()).map_err(epub_err)?;
        book.metadata("toc_name", manga.title.as_str()).map_err(epub_err)?;
        book.metadata("lang", "ru").map_err(epub_err)?;
        book.metadata("generator", "chapter-downloader").map_err(epub_err)?;
        for author in manga.authors.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
            book.metadata("author", author).map_err(epub_err)?;
        }
        if let Some(summary) = manga.summary.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            book.metadata("description", summary).map_err(epub_err)?;
        }

        if let Some(c) = cover {
            let raw = base64::engine::general_purpose::STANDARD.decode(&c.base64).context("decode cover")?;
            book.add_cover_image(format!("images/cover.{}", ext_for_mime(&c.mime)), Cursor::new(raw), c.mime.as_str())
                .map_err(epub_err)?;
        }

        let mut images: Vec<(String, String, Vec<u8>)> = vec![];
        for (i, chapter) in chapters.iter().enumerate() {
            let xhtml = chapter_xhtml(chapter, &mut images);
            let content = EpubContent::new(format!("text/chapter_{:04}.xhtml", i + 1), Cursor::new(xhtml.into_bytes()))
                .title(chapter.title.as_str())
                .reftype(ReferenceType::Text);
            book.add_content(content).map_err(epub_err)?;
        }
        for (name, mime, raw) in images {
            book.add_resource(format!("images/{}", name), Cursor::new(raw), mime.as_str()).map_err(epub_err)?;
        }

        let mut buffer = Vec::new();
        book.generate(&mut buffer).map_err(epub_err)?;
        Ok(ExportedFile { filename: export_filename(&manga.title, ExportFormat::Epub), data: Bytes::from(buffer) })
    }

    fn can_parse(&self) -> bool {
        true
    }

    fn parse(&self, data: &[u8]) -> anyhow::Result<ParsedBook> {
        let mut archive = ZipArchive::new(Cursor::new(data)).context("open epub container")?;
        let re = patterns();
        let text_of = |s: &str| decode_entities(re.tag.replace_all(s, "").trim());

        let container = String::from_utf8(read_entry(&mut archive, "META-INF/container.xml")?)?;
        let opf_path = re
            .full_path
            .captures(&container)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| OPF_PATH.to_string());
        let opf_dir = dir_of(&opf_path).to_string();
        let opf = String::from_utf8(read_entry(&mut archive, &opf_path)?)?;

        let title = re
            .title
            .captures(&opf)
            .map(|c| text_of(&c[1]))
            .unwrap_or_default();
        let authors = re
            .creator
            .captures_iter(&opf)
            .map(|c| text_of(&c[1]))
            .filter(|s| !s.is_empty())
            .collect();
        let summary = re
            .description
            .captures(&opf)
            .map(|c| text_of(&c[1]))
            .filter(|s| !s.is_empty());

        let mut items: HashMap<String, (String, String)> = HashMap::new();
        let mut cover_path = None;
        for caps in re.manifest_item.captures_iter(&opf) {
            let attrs = &caps[1];
            let Some(href) = attr(attrs, "href") else { continue };
            let path = resolve_path(&opf_dir, &href);
            let properties = attr(attrs, "properties").unwrap_or_default();
            if properties.split_whitespace().any(|p| p == "cover-image") {
                cover_path = Some(path.clone());
            }
            // the navigation document is generated, not a chapter
            if properties.split_whitespace().any(|p| p == "nav") {
                continue;
            }
            if let Some(id) = attr(attrs, "id") {
                let media = attr(attrs, "media-type").unwrap_or_default();
                items.insert(id, (path, media));
            }
        }

        let load_image = |archive: &mut ZipArchive<Cursor<&[u8]>>, path: &str| -> Option<CoverImage> {
            let raw = read_entry(archive, path).ok()?;
            Some(CoverImage {
                base64: base64::engine::general_purpose::STANDARD.encode(raw),
                mime: mime_for_ext(path).to_string(),
            })
        };

        if cover_path.is_none() {
            cover_path = re
            .meta
            .captures_iter(&opf)
                .find(|c| attr(&c[1], "name").as_deref() == Some("cover"))
                .and_then(|c| attr(&c[1], "content"))
                .and_then(|id| items.get(&id).map(|(p, _)| p.clone()));
        }
        let cover = cover_path.and_then(|p| load_image(&mut archive, &p));

        let spine: Vec<String> = re
            .itemref
            .captures_iter(&opf)
            .map(|c| c[1].to_string())
            .collect();

        let mut chapters = vec![];
        for idref in spine {
            let Some((path, media)) = items.get(&idref).cloned() else { continue };
            if !media.contains("xhtml") {
                continue;
            }
            let xhtml = String::from_utf8(read_entry(&mut archive, &path)?)?;

            let mut volume = None;
            let mut number = None;
            for m in re.chapter_meta.captures_iter(&xhtml) {
                let value = decode_entities(&m[2]);
                if &m[1] == "volume" {
                    volume = Some(value);
                } else {
                    number = Some(value);
                }
            }
            let chapter_title = re.heading.captures(&xhtml).map(|c| text_of(&c[1])).unwrap_or_default();

            let body = re.body.captures(&xhtml).map(|c| c[1].to_string()).unwrap_or_default();
            let body = re.heading.replace(&body, "");
            let chapter_dir = dir_of(&path).to_string();

            let mut content = vec![];
            for item in re.content_item.captures_iter(&body) {
                if let Some(p) = item.get(1) {
                    content.push(ContentBlock::text(text_of(p.as_str())));
                } else if let Some(src) = item.get(2) {
                    let img_path = resolve_path(&chapter_dir, &decode_entities(src.as_str()));
                    let data = match load_image(&mut archive, &img_path) {
                        Some(img) => ImageData { base64: Some(img.base64), mime: Some(img.mime), url: None },
                        None => ImageData::default(),
                    };
                    content.push(ContentBlock::Image { data });
                }
            }

            chapters.push(ChapterResult { title: chapter_title, volume, number, content });
        }

        Ok(ParsedBook { manga: Manga { title, cover: None, authors, summary }, cover, chapters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chapters::{error_block, is_empty_chapter};
    use crate::core::model::ChapterRef;

    #[test]
    fn path_resolution() {
        assert_eq!(resolve_path("OEBPS/text", "../images/a.jpg"), "OEBPS/images/a.jpg");
        assert_eq!(resolve_path("OEBPS", "text/c.xhtml"), "OEBPS/text/c.xhtml");
        assert_eq!(resolve_path("", "x.opf"), "x.opf");
    }

    #[test]
    fn export_then_parse_keeps_order_keys_and_images() {
        let manga = Manga {
            title: "Манга".into(),
            cover: None,
            authors: vec!["A".into(), "B".into()],
            summary: Some("desc & more".into()),
        };
        let chapters = vec![
            ChapterResult::from_ref(&ChapterRef::new("1", "1"), vec![ContentBlock::text("hello")]),
            ChapterResult::from_ref(&ChapterRef::new("1", "2"), vec![ContentBlock::image_base64("AAEC", "image/png")]),
            ChapterResult::from_ref(&ChapterRef::new("2", "1"), vec![error_block("x")]),
        ];
        let cover = CoverImage { base64: "/9j/AA==".into(), mime: "image/jpeg".into() };

        let exp = EpubExporter::new();
        let file = exp.export(&manga, &chapters, Some(&cover)).unwrap();
        assert_eq!(file.filename, "Манга.epub");

        let mut archive = ZipArchive::new(Cursor::new(&file.data[..])).unwrap();
        assert_eq!(read_entry(&mut archive, "mimetype").unwrap(), b"application/epub+zip");

        let parsed = exp.parse(&file.data).unwrap();
        assert_eq!(parsed.manga.title, "Манга");
        assert_eq!(parsed.manga.authors, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(parsed.manga.summary.as_deref(), Some("desc & more"));
        assert_eq!(parsed.cover, Some(cover));

        assert_eq!(parsed.chapters.len(), 3);
        assert_eq!(parsed.chapters[0].title, "Том 1 Глава 1");
        assert_eq!(parsed.chapters[0].content, vec![ContentBlock::text("hello")]);
        assert_eq!(parsed.chapters[1].content, vec![ContentBlock::image_base64("AAEC", "image/png")]);
        assert_eq!(parsed.chapters[2].volume.as_deref(), Some("2"));
        assert_eq!(parsed.chapters[2].number.as_deref(), Some("1"));
        assert!(is_empty_chapter(&parsed.chapters[2]));
    }
}
