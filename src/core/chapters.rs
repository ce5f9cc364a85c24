//! Pure chapter helpers: canonical keys, the empty-chapter predicate,
//! numeric ordering and range slicing.

use crate::core::model::{ChapterRange, ChapterRef, ChapterResult, ContentBlock};
use std::cmp::Ordering;

pub const ERROR_TEXT_PREFIX: &str = "[Ошибка загрузки главы";
pub const NOT_LOADED_TEXT: &str = "[Глава не загружена]";

fn key_of(volume: Option<&str>, number: Option<&str>) -> String {
    format!("v{}_ch{}", volume.unwrap_or("1"), number.unwrap_or("0"))
}

pub fn chapter_key(chapter: &ChapterRef) -> String {
    key_of(chapter.volume.as_deref(), chapter.number.as_deref())
}

pub fn result_key(chapter: &ChapterResult) -> String {
    key_of(chapter.volume.as_deref(), chapter.number.as_deref())
}

pub fn error_block(message: &str) -> ContentBlock {
    ContentBlock::text(format!("{}: {}]", ERROR_TEXT_PREFIX, message))
}

pub fn not_loaded_block() -> ContentBlock {
    ContentBlock::text(NOT_LOADED_TEXT)
}

pub fn is_error_text(text: &str) -> bool {
    let t = text.trim();
    t.starts_with(ERROR_TEXT_PREFIX) || t == NOT_LOADED_TEXT
}

/// True when no block carries real text or an image payload. Such chapters
/// are re-fetched by the next update run.
pub fn is_empty_chapter(chapter: &ChapterResult) -> bool {
    !chapter.content.iter().any(|block| match block {
        ContentBlock::Text { text } => !text.trim().is_empty() && !is_error_text(text),
        ContentBlock::Image { data } => data.base64.as_deref().map_or(false, |b| !b.is_empty()),
    })
}

/// Leading decimal number of `s`; anything non-numeric sorts first.
pub fn numeric_sort_value(s: Option<&str>) -> f64 {
    let Some(s) = s.map(str::trim).filter(|s| !s.is_empty()) else {
        return f64::NEG_INFINITY;
    };
    if let Ok(v) = s.parse::<f64>() {
        if v.is_finite() {
            return v;
        }
    }

    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in s.char_indices() {
        let ok = c.is_ascii_digit()
            || (i == 0 && (c == '-' || c == '+'))
            || (c == '.' && !seen_dot);
        if !ok {
            break;
        }
        if c == '.' {
            seen_dot = true;
        }
        end = i + c.len_utf8();
    }
    s[..end]
        .trim_end_matches('.')
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(f64::NEG_INFINITY)
}

pub fn compare_chapters(a: &ChapterRef, b: &ChapterRef) -> Ordering {
    let va = numeric_sort_value(a.volume.as_deref());
    let vb = numeric_sort_value(b.volume.as_deref());
    va.total_cmp(&vb).then_with(|| {
        numeric_sort_value(a.number.as_deref()).total_cmp(&numeric_sort_value(b.number.as_deref()))
    })
}

/// Stable ascending sort by (volume, number).
pub fn sort_chapters(chapters: &mut [ChapterRef]) {
    chapters.sort_by(compare_chapters);
}

pub fn apply_range(chapters: Vec<ChapterRef>, range: Option<ChapterRange>) -> Vec<ChapterRef> {
    let Some(r) = range else {
        return chapters;
    };
    let from = r.from.max(1);
    let to = r.to.min(chapters.len());
    if from > to {
        return vec![];
    }
    chapters.into_iter().skip(from - 1).take(to - from + 1).collect()
}
