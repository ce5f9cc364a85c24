//! PDF exporter.
//!
//! Writes a plain PDF 1.4 document using the standard Helvetica fonts, so no
//! font data is embedded. Text goes through WinAnsi; Cyrillic is transliterated
//! and anything else outside the code page becomes `?`. Images are re-encoded
//! to baseline JPEG and embedded as DCT streams. PDF files are write-only.

use base64::Engine as _;
use bytes::Bytes;
use std::fmt::Write as _;

use crate::core::model::{ChapterResult, ContentBlock, CoverImage, ExportFormat, Manga};
use crate::plugins::registry::{export_filename, ExportedFile, Exporter};

const PAGE_W: f32 = 595.0;
const PAGE_H: f32 = 842.0;
const MARGIN: f32 = 50.0;
const BODY_SIZE: f32 = 11.0;
const LINE_GAP: f32 = 1.35;
const JPEG_QUALITY: u8 = 85;
/// Average Helvetica glyph width as a fraction of the font size.
const AVG_GLYPH: f32 = 0.5;

const CATALOG_ID: usize = 1;
const PAGES_ID: usize = 2;
const FONT_REGULAR_ID: usize = 3;
const FONT_BOLD_ID: usize = 4;

pub struct PdfExporter {
    jpeg_quality: u8,
}

impl PdfExporter {
    pub fn new() -> Self {
        Self { jpeg_quality: JPEG_QUALITY }
    }
}

impl Default for PdfExporter {
    fn default() -> Self {
        Self::new()
    }
}

fn translit(c: char) -> Option<&'static str> {
    let lower = c.to_lowercase().next().unwrap_or(c);
    Some(match lower {
        'а' => "a",
        'б' => "b",
        'в' => "v",
        'г' => "g",
        'д' => "d",
        'е' => "e",
        'ё' => "yo",
        'ж' => "zh",
        'з' => "z",
        'и' => "i",
        'й' => "y",
        'к' => "k",
        'л' => "l",
        'м' => "m",
        'н' => "n",
        'о' => "o",
        'п' => "p",
        'р' => "r",
        'с' => "s",
        'т' => "t",
        'у' => "u",
        'ф' => "f",
        'х' => "kh",
        'ц' => "ts",
        'ч' => "ch",
        'ш' => "sh",
        'щ' => "shch",
        'ъ' => "",
        'ы' => "y",
        'ь' => "",
        'э' => "e",
        'ю' => "yu",
        'я' => "ya",
        'і' => "i",
        'ї' => "yi",
        'є' => "ye",
        'ґ' => "g",
        _ => return None,
    })
}

/// Maps text to WinAnsi bytes.
pub(crate) fn to_win_ansi(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        if let Some(latin) = translit(c) {
            let mut chars = latin.chars();
            if let Some(first) = chars.next() {
                if c.is_uppercase() {
                    out.push(first.to_ascii_uppercase() as u8);
                } else {
                    out.push(first as u8);
                }
                out.extend(chars.map(|ch| ch as u8));
            }
            continue;
        }
        let byte = match c {
            '\t' => b' ',
            ' '..='~' => c as u8,
            '\u{a0}'..='\u{ff}' => c as u32 as u8,
            '…' => 0x85,
            '‘' => 0x91,
            '’' => 0x92,
            '“' => 0x93,
            '”' => 0x94,
            '•' => 0x95,
            '–' => 0x96,
            '—' => 0x97,
            '„' => b'"',
            '№' => {
                out.extend_from_slice(b"No.");
                continue;
            }
            c if c.is_control() => continue,
            _ => b'?',
        };
        out.push(byte);
    }
    out
}

/// PDF literal string body with delimiters escaped.
fn pdf_string(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 2);
    out.push(b'(');
    for &b in bytes {
        if matches!(b, b'(' | b')' | b'\\') {
            out.push(b'\\');
        }
        out.push(b);
    }
    out.push(b')');
    out
}

/// Greedy word wrap on encoded bytes; words longer than a line are split.
fn wrap(line: &[u8], max_chars: usize) -> Vec<Vec<u8>> {
    let max_chars = max_chars.max(1);
    let mut lines = vec![];
    let mut current: Vec<u8> = vec![];
    for word in line.split(|b| *b == b' ').filter(|w| !w.is_empty()) {
        let mut word = word;
        while word.len() > max_chars {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            lines.push(word[..max_chars].to_vec());
            word = &word[max_chars..];
        }
        if word.is_empty() {
            continue;
        }
        let needed = if current.is_empty() { word.len() } else { current.len() + 1 + word.len() };
        if needed > max_chars {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(b' ');
        }
        current.extend_from_slice(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

struct JpegImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

fn to_jpeg(raw: &[u8], quality: u8) -> anyhow::Result<JpegImage> {
    let img = image::load_from_memory(raw)?;
    let rgb = img.to_rgb8();
    let mut data = Vec::new();
    {
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut data, quality.clamp(1, 100));
        encoder.encode(&rgb, rgb.width(), rgb.height(), image::ExtendedColorType::Rgb8)?;
    }
    Ok(JpegImage { width: rgb.width(), height: rgb.height(), data })
}

#[derive(Default)]
struct Page {
    ops: Vec<u8>,
    images: Vec<usize>,
}

/// Object table plus page layout state.
struct PdfWriter {
    objects: Vec<Option<Vec<u8>>>,
    pages: Vec<Page>,
    y: f32,
}

impl PdfWriter {
    fn new() -> Self {
        // ids 1..=4 are fixed
        Self { objects: vec![None; FONT_BOLD_ID], pages: vec![], y: 0.0 }
    }

    fn add_object(&mut self, body: Vec<u8>) -> usize {
        self.objects.push(Some(body));
        self.objects.len()
    }

    fn set_object(&mut self, id: usize, body: Vec<u8>) {
        self.objects[id - 1] = Some(body);
    }

    fn new_page(&mut self) {
        self.pages.push(Page::default());
        self.y = PAGE_H - MARGIN;
    }

    fn page(&mut self) -> &mut Page {
        if self.pages.is_empty() {
            self.new_page();
        }
        let last = self.pages.len() - 1;
        &mut self.pages[last]
    }

    fn text_line(&mut self, text: &[u8], size: f32, bold: bool) {
        let leading = size * LINE_GAP;
        if self.pages.is_empty() || self.y - leading < MARGIN {
            self.new_page();
        }
        self.y -= leading;
        let y = self.y;
        let font = if bold { "F2" } else { "F1" };
        let page = self.page();
        let _ = write!(
            OpsWriter(&mut page.ops),
            "BT /{} {:.1} Tf {:.2} {:.2} Td ",
            font,
            size,
            MARGIN,
            y
        );
        page.ops.extend_from_slice(&pdf_string(text));
        page.ops.extend_from_slice(b" Tj ET\n");
    }

    fn paragraph(&mut self, text: &str, size: f32, bold: bool) {
        let max_chars = ((PAGE_W - 2.0 * MARGIN) / (size * AVG_GLYPH)) as usize;
        for raw_line in text.lines() {
            for line in wrap(&to_win_ansi(raw_line), max_chars) {
                self.text_line(&line, size, bold);
            }
        }
    }

    fn gap(&mut self, points: f32) {
        self.y -= points;
    }

    fn image(&mut self, img: JpegImage) {
        let max_w = PAGE_W - 2.0 * MARGIN;
        let max_h = PAGE_H - 2.0 * MARGIN;
        let scale = (max_w / img.width as f32).min(max_h / img.height as f32).min(1.0);
        let w = img.width as f32 * scale;
        let h = img.height as f32 * scale;

        if self.pages.is_empty() || self.y - h < MARGIN {
            self.new_page();
        }
        self.y -= h;
        let y = self.y;

        let mut head = format!(
            "<< /Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace /DeviceRGB /BitsPerComponent 8 /Filter /DCTDecode /Length {} >>\nstream\n",
            img.width,
            img.height,
            img.data.len()
        )
        .into_bytes();
        head.extend_from_slice(&img.data);
        head.extend_from_slice(b"\nendstream");
        let id = self.add_object(head);

        let page = self.page();
        page.images.push(id);
        let name = page.images.len();
        let _ = write!(OpsWriter(&mut page.ops), "q {:.2} 0 0 {:.2} {:.2} {:.2} cm /Im{} Do Q\n", w, h, MARGIN, y, name);
        self.gap(BODY_SIZE * 0.5);
    }

    fn finish(mut self, title: &str) -> Vec<u8> {
        if self.pages.is_empty() {
            self.new_page();
        }

        let mut kids = vec![];
        for page in std::mem::take(&mut self.pages) {
            let mut stream = format!("<< /Length {} >>\nstream\n", page.ops.len()).into_bytes();
            stream.extend_from_slice(&page.ops);
            stream.extend_from_slice(b"\nendstream");
            let content_id = self.add_object(stream);

            let mut xobjects = String::new();
            for (i, id) in page.images.iter().enumerate() {
                let _ = write!(xobjects, "/Im{} {} 0 R ", i + 1, id);
            }
            let page_obj = format!(
                "<< /Type /Page /Parent {} 0 R /MediaBox [0 0 {} {}] /Contents {} 0 R /Resources << /Font << /F1 {} 0 R /F2 {} 0 R >> /XObject << {}>> >> >>",
                PAGES_ID, PAGE_W, PAGE_H, content_id, FONT_REGULAR_ID, FONT_BOLD_ID, xobjects
            );
            kids.push(self.add_object(page_obj.into_bytes()));
        }

        let kids_ref = kids.iter().map(|k| format!("{} 0 R", k)).collect::<Vec<_>>().join(" ");
        self.set_object(CATALOG_ID, format!("<< /Type /Catalog /Pages {} 0 R >>", PAGES_ID).into_bytes());
        self.set_object(PAGES_ID, format!("<< /Type /Pages /Kids [{}] /Count {} >>", kids_ref, kids.len()).into_bytes());
        self.set_object(
            FONT_REGULAR_ID,
            b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>".to_vec(),
        );
        self.set_object(
            FONT_BOLD_ID,
            b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica-Bold /Encoding /WinAnsiEncoding >>".to_vec(),
        );

        let mut info = b"<< /Title ".to_vec();
        info.extend_from_slice(&pdf_string(&to_win_ansi(title)));
        info.extend_from_slice(format!(" /Producer (chapter-downloader {}) >>", env!("CARGO_PKG_VERSION")).as_bytes());
        let info_id = self.add_object(info);

        let mut out = b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n".to_vec();
        let mut offsets = Vec::with_capacity(self.objects.len());
        for (i, body) in self.objects.iter().enumerate() {
            offsets.push(out.len());
            out.extend_from_slice(format!("{} 0 obj\n", i + 1).as_bytes());
            out.extend_from_slice(body.as_deref().unwrap_or(&b"null"[..]));
            out.extend_from_slice(b"\nendobj\n");
        }

        let xref_at = out.len();
        out.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", self.objects.len() + 1).as_bytes());
        for off in offsets {
            out.extend_from_slice(format!("{:010} 00000 n \n", off).as_bytes());
        }
        out.extend_from_slice(
            format!(
                "trailer\n<< /Size {} /Root {} 0 R /Info {} 0 R >>\nstartxref\n{}\n%%EOF\n",
                self.objects.len() + 1,
                CATALOG_ID,
                info_id,
                xref_at
            )
            .as_bytes(),
        );
        out
    }
}

/// `fmt::Write` adapter over a byte buffer for content stream operators.
struct OpsWriter<'a>(&'a mut Vec<u8>);

impl std::fmt::Write for OpsWriter<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.0.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

impl Exporter for PdfExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Pdf
    }

    fn export(&self, manga: &Manga, chapters: &[ChapterResult], cover: Option<&CoverImage>) -> anyhow::Result<ExportedFile> {
        let mut pdf = PdfWriter::new();

        if let Some(c) = cover {
            let converted = base64::engine::general_purpose::STANDARD
                .decode(&c.base64)
                .map_err(anyhow::Error::from)
                .and_then(|raw| to_jpeg(&raw, self.jpeg_quality));
            match converted {
                Ok(img) => pdf.image(img),
                Err(e) => tracing::warn!("cover not embedded: {:#}", e),
            }
        }

        pdf.new_page();
        pdf.paragraph(&manga.title, 20.0, true);
        if !manga.authors.is_empty() {
            pdf.gap(BODY_SIZE);
            pdf.paragraph(&manga.authors.join(", "), 13.0, false);
        }
        if let Some(summary) = manga.summary.as_deref().filter(|s| !s.trim().is_empty()) {
            pdf.gap(BODY_SIZE);
            pdf.paragraph(summary, BODY_SIZE, false);
        }

        for chapter in chapters {
            pdf.new_page();
            pdf.paragraph(&chapter.title, 14.0, true);
            pdf.gap(BODY_SIZE * 0.5);
            for block in &chapter.content {
                match block {
                    ContentBlock::Text { text } => pdf.paragraph(text, BODY_SIZE, false),
                    ContentBlock::Image { data } => {
                        let Some(b64) = data.base64.as_deref().filter(|b| !b.is_empty()) else {
                            continue;
                        };
                        let converted = base64::engine::general_purpose::STANDARD
                            .decode(b64)
                            .map_err(anyhow::Error::from)
                            .and_then(|raw| to_jpeg(&raw, self.jpeg_quality));
                        match converted {
                            Ok(img) => pdf.image(img),
                            Err(e) => {
                                tracing::debug!(chapter = %chapter.title, "image skipped: {:#}", e);
                                pdf.paragraph("[image]", BODY_SIZE, false);
                            }
                        }
                    }
                }
            }
        }

        Ok(ExportedFile {
            filename: export_filename(&manga.title, ExportFormat::Pdf),
            data: Bytes::from(pdf.finish(&manga.title)),
        })
    }
}
