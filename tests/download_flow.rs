use async_trait::async_trait;
use chapter_downloader::config::EngineConfig;
use chapter_downloader::core::chapters::{is_empty_chapter, result_key};
use chapter_downloader::core::engine::Engine;
use chapter_downloader::core::events::SessionEvent;
use chapter_downloader::core::handoff::BackgroundHost;
use chapter_downloader::core::model::{
    ChapterRef, ContentBlock, DownloadOutcome, LoadedFile, Manga, SessionId, StartOptions,
};
use chapter_downloader::plugins::fb2::Fb2Exporter;
use chapter_downloader::plugins::registry::{ContentService, Exporter, PluginRegistry};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use url::Url;

/// A small in-memory novel site.
struct Library {
    count: Mutex<usize>,
    broken: Mutex<HashSet<String>>,
    fetched: Mutex<Vec<String>>,
}

impl Library {
    fn new(count: usize) -> Arc<Self> {
        Arc::new(Self { count: Mutex::new(count), broken: Mutex::new(HashSet::new()), fetched: Mutex::new(vec![]) })
    }

    fn break_chapter(&self, number: &str) {
        self.broken.lock().unwrap().insert(number.to_string());
    }

    fn fix_all(&self) {
        self.broken.lock().unwrap().clear();
    }

    fn publish(&self, count: usize) {
        *self.count.lock().unwrap() = count;
    }

    fn take_fetched(&self) -> Vec<String> {
        std::mem::take(&mut *self.fetched.lock().unwrap())
    }
}

#[async_trait]
impl ContentService for Library {
    fn key(&self) -> &'static str {
        "library"
    }

    fn slug_from_url(&self, url: &Url) -> Option<String> {
        if url.host_str() != Some("library.test") {
            return None;
        }
        url.path_segments()?.last().map(str::to_string)
    }

    async fn fetch_metadata(&self, slug: &str) -> anyhow::Result<Manga> {
        Ok(Manga { title: format!("Novel {}", slug), authors: vec!["Writer".into()], ..Default::default() })
    }

    async fn fetch_chapter_list(&self, _slug: &str) -> anyhow::Result<Vec<ChapterRef>> {
        let count = *self.count.lock().unwrap();
        Ok((1..=count).map(|i| ChapterRef::new("1", i.to_string())).collect())
    }

    async fn fetch_chapter_content(&self, _slug: &str, number: &str, _volume: &str) -> anyhow::Result<Value> {
        self.fetched.lock().unwrap().push(number.to_string());
        if self.broken.lock().unwrap().contains(number) {
            anyhow::bail!("chapter {} is unavailable", number);
        }
        Ok(Value::String(format!("Line one of {}\nLine two of {}", number, number)))
    }
}

async fn engine(library: Arc<Library>, dir: &Path, chapter_delay_ms: u64) -> Engine {
    let mut registry = PluginRegistry::empty();
    registry.register_service(library);
    registry.register_exporter(Arc::new(Fb2Exporter::new()));
    let config = EngineConfig {
        out_dir: dir.to_path_buf(),
        pause_poll_ms: 50,
        chapter_delay_ms,
        cleanup_delay_secs: 600,
    };
    Engine::new(registry, config).await.unwrap()
}

fn read_back(path: &Path) -> Vec<chapter_downloader::core::model::ChapterResult> {
    let data = std::fs::read(path).unwrap();
    Fb2Exporter::new().parse(&data).unwrap().chapters
}

#[tokio::test]
async fn failed_chapter_is_kept_and_repaired_by_update() {
    let dir = tempfile::tempdir().unwrap();
    let library = Library::new(3);
    library.break_chapter("2");
    let engine = engine(library.clone(), dir.path(), 0).await;

    let outcome = engine
        .start(StartOptions { url: Some("https://library.test/book/north".into()), ..Default::default() })
        .await
        .unwrap();
    let files = match outcome {
        DownloadOutcome::Completed { files, chapters } => {
            assert_eq!(chapters, 3);
            files
        }
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with("Novel north.fb2"));

    let first = read_back(&files[0]);
    assert_eq!(first.len(), 3);
    assert!(!is_empty_chapter(&first[0]));
    assert!(is_empty_chapter(&first[1]));
    assert!(!is_empty_chapter(&first[2]));
    assert_eq!(library.take_fetched(), vec!["1", "2", "3"]);

    library.fix_all();
    library.publish(4);
    let outcome = engine
        .start(StartOptions {
            service_key: Some("library".into()),
            slug: Some("north".into()),
            loaded_file: Some(LoadedFile { path: files[0].clone() }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed { .. }), "{:?}", outcome);
    assert_eq!(library.take_fetched(), vec!["2", "4"]);

    let updated = read_back(&files[0]);
    let keys: Vec<_> = updated.iter().map(result_key).collect();
    let expected: Vec<_> = first.iter().map(result_key).chain(["v1_ch4".to_string()]).collect();
    assert_eq!(keys, expected);
    assert!(updated.iter().all(|c| !is_empty_chapter(c)));
    assert_eq!(updated[1].content[0], ContentBlock::text("Line one of 2"));

    let outcome = engine
        .start(StartOptions {
            service_key: Some("library".into()),
            slug: Some("north".into()),
            loaded_file: Some(LoadedFile { path: files[0].clone() }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::NothingToDo);
    assert!(library.take_fetched().is_empty());
}

async fn wait_chapter(rx: &mut broadcast::Receiver<SessionEvent>, id: SessionId, done: usize) {
    loop {
        match rx.recv().await.unwrap() {
            SessionEvent::ChapterDone { session_id, index, .. } if session_id == id && index + 1 == done => return,
            _ => {}
        }
    }
}

#[tokio::test(start_paused = true)]
async fn hand_off_continues_in_background_without_refetching() {
    let dir = tempfile::tempdir().unwrap();
    let library = Library::new(5);
    let local = engine(library.clone(), dir.path(), 500).await;
    let host = BackgroundHost::spawn(engine(library.clone(), dir.path(), 500).await);

    let mut rx = local.subscribe();
    let mut host_rx = host.engine().subscribe();
    let id = local
        .spawn(StartOptions { service_key: Some("library".into()), slug: Some("south".into()), ..Default::default() })
        .await
        .unwrap();

    wait_chapter(&mut rx, id, 2).await;
    let new_id = local.hand_off(id, &host.transport()).await.unwrap();
    assert_ne!(new_id, id);

    local.wait_session(id).await;
    let source = local.session(id).await.unwrap();
    assert!(source.handed_off);
    assert!(source.saved_files.is_empty());

    let files = loop {
        match host_rx.recv().await.unwrap() {
            SessionEvent::Completed { session_id, files } if session_id == new_id => break files,
            SessionEvent::Failed { session_id, error } if session_id == new_id => panic!("{}", error),
            _ => {}
        }
    };

    let mut fetched = library.take_fetched();
    fetched.sort();
    assert_eq!(fetched, vec!["1", "2", "3", "4", "5"]);

    assert_eq!(files.len(), 1);
    let chapters = read_back(&files[0]);
    let numbers: Vec<_> = chapters.iter().map(|c| c.number.clone().unwrap_or_default()).collect();
    assert_eq!(numbers, vec!["1", "2", "3", "4", "5"]);

    host.shutdown();
}
