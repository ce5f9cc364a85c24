//! Update-mode diffing: which server chapters still need fetching, and how
//! fresh results are folded back into the full table of contents.

use anyhow::Context;
use std::collections::HashMap;
use std::path::Path;

use crate::core::chapters::{chapter_key, is_empty_chapter, not_loaded_block, result_key};
use crate::core::error::EngineError;
use crate::core::model::{ChapterRef, ChapterResult};
use crate::plugins::registry::{Exporter, ParsedBook};

/// Server chapters that are absent from `existing` or present but empty.
/// Keeps server order.
pub fn find_missing(server: &[ChapterRef], existing: &[ChapterResult]) -> Vec<ChapterRef> {
    let present: HashMap<String, &ChapterResult> = existing.iter().map(|c| (result_key(c), c)).collect();
    server
        .iter()
        .filter(|c| match present.get(&chapter_key(c)) {
            Some(found) => is_empty_chapter(found),
            None => true,
        })
        .cloned()
        .collect()
}

/// One entry per server chapter, in server order: freshly fetched wins, then
/// the existing entry, otherwise a "not loaded" placeholder.
pub fn merge(existing: &[ChapterResult], fetched: &[ChapterResult], server: &[ChapterRef]) -> Vec<ChapterResult> {
    let existing: HashMap<String, &ChapterResult> = existing.iter().map(|c| (result_key(c), c)).collect();
    let fetched: HashMap<String, &ChapterResult> = fetched.iter().map(|c| (result_key(c), c)).collect();

    server
        .iter()
        .map(|chapter| {
            let key = chapter_key(chapter);
            match fetched.get(&key).or_else(|| existing.get(&key)) {
                Some(found) => (*found).clone(),
                None => ChapterResult::from_ref(chapter, vec![not_loaded_block()]),
            }
        })
        .collect()
}

/// Reads a previously exported file back through its format's parser.
pub async fn parse_existing(exporter: &dyn Exporter, path: &Path) -> anyhow::Result<ParsedBook> {
    if !exporter.can_parse() {
        return Err(EngineError::ParseUnsupported(exporter.format()).into());
    }
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("read existing file {}", path.display()))?;
    exporter
        .parse(&data)
        .with_context(|| format!("parse existing {} file {}", exporter.format(), path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chapters::error_block;
    use crate::core::model::ContentBlock;
    use crate::plugins::fb2::Fb2Exporter;
    use crate::plugins::pdf::PdfExporter;

    fn ok(volume: &str, number: &str, text: &str) -> ChapterResult {
        ChapterResult::from_ref(&ChapterRef::new(volume, number), vec![ContentBlock::text(text)])
    }

    fn server(n: usize) -> Vec<ChapterRef> {
        (1..=n).map(|i| ChapterRef::new("1", i.to_string())).collect()
    }

    #[test]
    fn missing_includes_absent_and_broken_chapters() {
        let existing = vec![
            ok("1", "1", "one"),
            ChapterResult::from_ref(&ChapterRef::new("1", "2"), vec![error_block("timeout")]),
            ok("1", "4", "four"),
        ];
        let missing = find_missing(&server(4), &existing);
        let numbers: Vec<_> = missing.iter().map(|c| c.number.as_deref().unwrap()).collect();
        assert_eq!(numbers, vec!["2", "3"]);
    }

    #[test]
    fn merge_covers_every_server_chapter() {
        let existing = vec![ok("1", "1", "old one"), ok("1", "2", "old two")];
        let fetched = vec![ok("1", "2", "new two"), ok("1", "9", "not on server")];
        let merged = merge(&existing, &fetched, &server(3));

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].content, vec![ContentBlock::text("old one")]);
        assert_eq!(merged[1].content, vec![ContentBlock::text("new two")]);
        assert_eq!(merged[2].content, vec![not_loaded_block()]);
        assert!(is_empty_chapter(&merged[2]));
    }

    #[test]
    fn merge_then_find_missing_is_empty_when_everything_arrived() {
        let srv = server(5);
        let existing = vec![ok("1", "1", "a"), ok("1", "3", "c")];
        let missing = find_missing(&srv, &existing);
        assert_eq!(missing.len(), 3);

        let fetched: Vec<_> = missing
            .iter()
            .map(|c| ChapterResult::from_ref(c, vec![ContentBlock::text("fresh")]))
            .collect();
        let merged = merge(&existing, &fetched, &srv);
        assert!(find_missing(&srv, &merged).is_empty());
    }

    #[test]
    fn empty_server_list_merges_to_nothing() {
        assert!(merge(&[ok("1", "1", "x")], &[], &[]).is_empty());
        assert!(find_missing(&[], &[]).is_empty());
    }

    #[tokio::test]
    async fn parse_existing_reads_through_exporter() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Fb2Exporter::new();
        let file = exporter
            .export(&crate::core::model::Manga { title: "T".into(), ..Default::default() }, &[ok("1", "1", "x")], None)
            .unwrap();
        let path = dir.path().join(&file.filename);
        std::fs::write(&path, &file.data).unwrap();

        let parsed = parse_existing(&exporter, &path).await.unwrap();
        assert_eq!(parsed.manga.title, "T");
        assert_eq!(parsed.chapters.len(), 1);

        let err = parse_existing(&PdfExporter::new(), &path).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::ParseUnsupported(_))));
        assert!(parse_existing(&exporter, &dir.path().join("none.fb2")).await.is_err());
    }
}
