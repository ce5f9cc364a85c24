//! FictionBook 2 exporter and parser.
//!
//! Each chapter is one `<section>` whose id carries the chapter key
//! (`v{volume}_ch{number}`) so an update run can match it back to the server
//! table of contents. Images, including the cover, are stored as `<binary>`.

use bytes::Bytes;
use regex::Regex;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::OnceLock;

use crate::core::chapters::result_key;
use crate::core::model::{ChapterResult, ContentBlock, CoverImage, ExportFormat, ImageData, Manga};
use crate::plugins::registry::{export_filename, ExportedFile, Exporter, ParsedBook};
use crate::plugins::xml::{attr, decode_entities, escape};

const COVER_ID: &str = "cover";

pub struct Fb2Exporter;

impl Fb2Exporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Fb2Exporter {
    fn default() -> Self {
        Self::new()
    }
}

struct Binary {
    id: String,
    mime: String,
    base64: String,
}

fn write_paragraphs(out: &mut String, text: &str) {
    let mut wrote = false;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let _ = write!(out, "<p>{}</p>", escape(line));
        wrote = true;
    }
    if !wrote {
        out.push_str("<empty-line/>");
    }
}

fn split_key(id: &str) -> (Option<String>, Option<String>) {
    let Some(rest) = id.strip_prefix('v') else {
        return (None, None);
    };
    match rest.split_once("_ch") {
        Some((v, n)) => (Some(v.to_string()), Some(n.to_string())),
        None => (None, None),
    }
}

struct Patterns {
    tag: Regex,
    paragraph: Regex,
    binary: Regex,
    title_info: Regex,
    book_title: Regex,
    author: Regex,
    author_part: Regex,
    annotation: Regex,
    coverpage: Regex,
    section: Regex,
    section_title: Regex,
    item: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |pattern: &str| Regex::new(pattern).expect("static regex");
        Patterns {
            tag: re(r"(?s)<[^>]+>"),
            paragraph: re(r"(?s)<p\b[^>]*>(.*?)</p>"),
            binary: re(r"(?s)<binary\b([^>]*)>(.*?)</binary>"),
            title_info: re(r"(?s)<title-info>(.*?)</title-info>"),
            book_title: re(r"(?s)<book-title>(.*?)</book-title>"),
            author: re(r"(?s)<author>(.*?)</author>"),
            author_part: re(
                r"(?s)<(nickname|first-name|middle-name|last-name)>(.*?)</(?:nickname|first-name|middle-name|last-name)>",
            ),
            annotation: re(r"(?s)<annotation>(.*?)</annotation>"),
            coverpage: re(r##"(?s)<coverpage>\s*<image\b[^>]*?href="#([^"]+)""##),
            section: re(r"(?s)<section\b([^>]*)>(.*?)</section>"),
            section_title: re(r"(?s)^\s*<title>(.*?)</title>"),
            item: re(r##"(?s)<p\b[^>]*>(.*?)</p>|<image\b[^>]*?href="#([^"]+)"[^>]*/>"##),
        }
    })
}

fn inner_text(fragment: &str) -> String {
    decode_entities(patterns().tag.replace_all(fragment, "").trim())
}

impl Exporter for Fb2Exporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Fb2
    }

    fn export(&self, manga: &Manga, chapters: &[ChapterResult], cover: Option<&CoverImage>) -> anyhow::Result<ExportedFile> {
        let mut binaries: Vec<Binary> = vec![];
        let mut out = String::new();

        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<FictionBook xmlns=\"http://www.gribuleshnik.org/fictionbook/2.0\" xmlns:l=\"http://www.w3.org/1999/xlink\">\n");
        out.push_str("<description><title-info><genre>sf</genre>");
        for author in &manga.authors {
            let _ = write!(out, "<author><nickname>{}</nickname></author>", escape(author));
        }
        let _ = write!(out, "<book-title>{}</book-title>", escape(&manga.title));
        if let Some(summary) = manga.summary.as_deref().filter(|s| !s.trim().is_empty()) {
            out.push_str("<annotation>");
            write_paragraphs(&mut out, summary);
            out.push_str("</annotation>");
        }
        if let Some(c) = cover {
            let _ = write!(out, "<coverpage><image l:href=\"#{}\"/></coverpage>", COVER_ID);
            binaries.push(Binary { id: COVER_ID.to_string(), mime: c.mime.clone(), base64: c.base64.clone() });
        }
        out.push_str("<lang>ru</lang></title-info>");
        let _ = write!(
            out,
            "<document-info><program-used>chapter-downloader {}</program-used></document-info></description>\n",
            env!("CARGO_PKG_VERSION")
        );

        let _ = write!(out, "<body><title><p>{}</p></title>\n", escape(&manga.title));
        for chapter in chapters {
            let _ = write!(out, "<section id=\"{}\"><title><p>{}</p></title>", escape(&result_key(chapter)), escape(&chapter.title));
            for block in &chapter.content {
                match block {
                    ContentBlock::Text { text } => write_paragraphs(&mut out, text),
                    ContentBlock::Image { data } => {
                        let Some(b64) = data.base64.as_deref().filter(|b| !b.is_empty()) else {
                            continue;
                        };
                        let id = format!("img{}", binaries.len() + 1);
                        let _ = write!(out, "<image l:href=\"#{}\"/>", id);
                        binaries.push(Binary {
                            id,
                            mime: data.mime.clone().unwrap_or_else(|| "image/jpeg".to_string()),
                            base64: b64.to_string(),
                        });
                    }
                }
            }
            out.push_str("</section>\n");
        }
        out.push_str("</body>\n");

        for b in &binaries {
            let _ = write!(out, "<binary id=\"{}\" content-type=\"{}\">{}</binary>\n", escape(&b.id), escape(&b.mime), b.base64);
        }
        out.push_str("</FictionBook>\n");

        Ok(ExportedFile { filename: export_filename(&manga.title, ExportFormat::Fb2), data: Bytes::from(out) })
    }

    fn can_parse(&self) -> bool {
        true
    }

    fn parse(&self, data: &[u8]) -> anyhow::Result<ParsedBook> {
        let xml = std::str::from_utf8(data)?;
        let re = patterns();

        let mut binaries: HashMap<String, CoverImage> = HashMap::new();
        for caps in re.binary.captures_iter(xml) {
            let attrs = &caps[1];
            let Some(id) = attr(attrs, "id") else { continue };
            let mime = attr(attrs, "content-type").unwrap_or_else(|| "image/jpeg".to_string());
            let base64: String = caps[2].chars().filter(|c| !c.is_whitespace()).collect();
            binaries.insert(id, CoverImage { base64, mime });
        }

        let title_info = re.title_info.captures(xml).map(|c| c[1].to_string()).unwrap_or_default();
        let title = re
            .book_title
            .captures(&title_info)
            .map(|c| inner_text(&c[1]))
            .unwrap_or_default();

        let authors = re
            .author
            .captures_iter(&title_info)
            .filter_map(|c| {
                let parts: Vec<String> = re
                    .author_part
                    .captures_iter(&c[1])
                    .map(|p| inner_text(&p[2]))
                    .filter(|s| !s.is_empty())
                    .collect();
                if parts.is_empty() { None } else { Some(parts.join(" ")) }
            })
            .collect();

        let summary = re
            .annotation
            .captures(&title_info)
            .map(|c| {
                re.paragraph
                    .captures_iter(&c[1])
                    .map(|p| inner_text(&p[1]))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|s| !s.is_empty());

        let cover = re
            .coverpage
            .captures(&title_info)
            .and_then(|c| binaries.get(&c[1]).cloned());

        let mut chapters = vec![];
        for caps in re.section.captures_iter(xml) {
            let (volume, number) = attr(&caps[1], "id").map(|id| split_key(&id)).unwrap_or((None, None));
            let mut body = &caps[2];

            let mut chapter_title = String::new();
            if let Some(t) = re.section_title.captures(body) {
                chapter_title = re
                    .paragraph
                    .captures_iter(&t[1])
                    .map(|p| inner_text(&p[1]))
                    .collect::<Vec<_>>()
                    .join(" ");
                let end = t.get(0).map(|m| m.end()).unwrap_or(0);
                body = &body[end..];
            }

            let mut content = vec![];
            for item in re.item.captures_iter(body) {
                if let Some(p) = item.get(1) {
                    content.push(ContentBlock::text(inner_text(p.as_str())));
                } else if let Some(id) = item.get(2) {
                    let data = match binaries.get(id.as_str()) {
                        Some(b) => ImageData { base64: Some(b.base64.clone()), mime: Some(b.mime.clone()), url: None },
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
