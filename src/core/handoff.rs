//! Moving a running session to another engine.
//!
//! The source pauses its pipeline at a chapter boundary, serializes the
//! session and sends it through a [`HandoffTransport`]. Only after the receiver
//! acknowledges is the source stopped; a failed transfer resumes it locally.
//! The receiver seeds a new session from the snapshot and continues from the
//! same cursor, so every chapter is fetched exactly once across both sides.

use async_trait::async_trait;
use std::sync::atomic::Ordering;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::controller::PipelinePhase;
use crate::core::engine::Engine;
use crate::core::error::HandoffError;
use crate::core::events::SessionEvent;
use crate::core::model::{
    ChapterRef, ChapterResult, CoverImage, DownloadSession, ExportFormat, LoadedFile, Manga, SessionId, SessionStep,
};

/// Serializable resume token for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffSnapshot {
    pub origin_id: SessionId,
    pub slug: String,
    pub service_key: String,
    pub format: ExportFormat,
    pub step: SessionStep,
    pub manga: Option<Manga>,
    pub cover: Option<CoverImage>,
    /// Results buffered for the current part, in chapter order.
    pub chapter_contents: Vec<ChapterResult>,
    pub chapters: Vec<ChapterRef>,
    pub current_chapter_index: usize,
    pub status: String,
    pub progress: i32,
    pub loaded_file: Option<LoadedFile>,
    #[serde(default)]
    pub server_chapters: Option<Vec<ChapterRef>>,
}

impl HandoffSnapshot {
    pub fn from_session(s: &DownloadSession) -> Self {
        Self {
            origin_id: s.id,
            slug: s.source_slug.clone(),
            service_key: s.service_key.clone(),
            format: s.format,
            step: s.step,
            manga: s.manga.clone(),
            cover: s.cover_data.clone(),
            chapter_contents: s.chapter_contents.clone(),
            chapters: s.chapters.clone(),
            current_chapter_index: s.current_chapter_index,
            status: s.status.clone(),
            progress: s.progress,
            loaded_file: s.loaded_file.clone(),
            server_chapters: s.server_chapters.clone(),
        }
    }

    fn validate(&self) -> Result<(), HandoffError> {
        if self.current_chapter_index > self.chapters.len() {
            return Err(HandoffError::Rejected(format!(
                "cursor {} beyond {} chapters",
                self.current_chapter_index,
                self.chapters.len()
            )));
        }
        if self.chapter_contents.len() > self.current_chapter_index {
            return Err(HandoffError::Rejected(format!(
                "{} buffered results for cursor {}",
                self.chapter_contents.len(),
                self.current_chapter_index
            )));
        }
        if self.manga.is_none() {
            return Err(HandoffError::Rejected("snapshot has no metadata".to_string()));
        }
        Ok(())
    }

    /// A fresh session (new id, fresh controller) positioned at the snapshot cursor.
    pub fn into_session(self) -> DownloadSession {
        let mut s = DownloadSession::new(self.slug, self.service_key, self.format);
        s.step = SessionStep::DownloadingChapters;
        s.status = self.status;
        s.progress = self.progress.max(0);
        s.manga = self.manga;
        s.cover_data = self.cover;
        s.chapters = self.chapters;
        s.chapter_contents = self.chapter_contents;
        s.current_chapter_index = self.current_chapter_index;
        s.loaded_file = self.loaded_file;
        s.server_chapters = self.server_chapters;
        s
    }
}

/// Carries a serialized snapshot to a receiving engine and returns the id
/// the receiver assigned.
#[async_trait]
pub trait HandoffTransport: Send + Sync {
    async fn send(&self, payload: String) -> Result<SessionId, HandoffError>;
}

impl Engine {
    /// Moves session `id` to whatever sits behind `transport`.
    pub async fn hand_off(&self, id: SessionId, transport: &dyn HandoffTransport) -> Result<SessionId, HandoffError> {
        let slot = self.slot(id).await.ok_or(HandoffError::NotFound(id))?;
        let step = slot.session.lock().await.step;
        if !matches!(step, SessionStep::DownloadingChapters | SessionStep::Exporting | SessionStep::Saving) {
            return Err(HandoffError::NotDownloading(id));
        }
        // one transfer at a time; a moved session stays claimed
        if slot.handoff_claimed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(HandoffError::NotDownloading(id));
        }

        let was_paused = slot.controller.is_paused();
        slot.controller.pause();
        if slot.controller.wait_for_boundary().await == PipelinePhase::Finished || slot.controller.is_stopped() {
            if !was_paused {
                slot.controller.resume();
            }
            slot.handoff_claimed.store(false, Ordering::Release);
            return Err(HandoffError::NotDownloading(id));
        }

        let snapshot = {
            let s = slot.session.lock().await;
            HandoffSnapshot::from_session(&s)
        };
        let cursor = snapshot.current_chapter_index;
        let sent = match serde_json::to_string(&snapshot) {
            Ok(payload) => transport.send(payload).await,
            Err(e) => Err(e.into()),
        };

        match sent {
            Ok(new_id) => {
                {
                    let mut s = slot.session.lock().await;
                    s.handed_off = true;
                    s.status = format!("Continuing in background as {}", new_id);
                }
                slot.controller.stop();
                tracing::info!(session = %id, receiver = %new_id, cursor, "handed off");
                self.emit(SessionEvent::Info {
                    scope: "handoff".to_string(),
                    message: format!("{} continues as {}", id, new_id),
                });
                Ok(new_id)
            }
            Err(e) => {
                tracing::warn!(session = %id, "hand-off failed, continuing locally: {}", e);
                slot.handoff_claimed.store(false, Ordering::Release);
                if !was_paused {
                    slot.controller.resume();
                }
                Err(e)
            }
        }
    }

    /// Registers a session seeded from `snapshot`. Call [`Engine::run`] to
    /// continue it.
    pub async fn accept_handoff(&self, snapshot: HandoffSnapshot) -> Result<SessionId, HandoffError> {
        snapshot.validate()?;
        if self.registry().service(&snapshot.service_key).is_none() {
            return Err(HandoffError::Rejected(format!("unknown service {}", snapshot.service_key)));
        }
        if self.registry().exporter(snapshot.format).is_none() {
            return Err(HandoffError::Rejected(format!("no exporter for {}", snapshot.format)));
        }

        let origin = snapshot.origin_id;
        let session = snapshot.into_session();
        let id = session.id;
        let (slug, service, cursor, total) =
            (session.source_slug.clone(), session.service_key.clone(), session.current_chapter_index, session.chapters.len());
        self.register(session).await;

        tracing::info!(session = %id, origin = %origin, cursor, total, "accepted hand-off");
        self.emit(SessionEvent::Started { session_id: id, slug, service });
        Ok(id)
    }

    /// Accepts a serialized snapshot and continues it on a new task.
    pub async fn receive_handoff(&self, payload: &str) -> Result<SessionId, HandoffError> {
        let snapshot: HandoffSnapshot = serde_json::from_str(payload)?;
        let id = self.accept_handoff(snapshot).await?;

        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run(id).await {
                tracing::warn!(session = %id, "resumed session failed: {:#}", e);
            }
        });
        Ok(id)
    }
}

struct HandoffRequest {
    payload: String,
    reply: oneshot::Sender<Result<SessionId, String>>,
}

/// A second engine running on its own task, fed by hand-off messages.
pub struct BackgroundHost {
    engine: Engine,
    tx: mpsc::Sender<HandoffRequest>,
    task: JoinHandle<()>,
}

impl BackgroundHost {
    pub fn spawn(engine: Engine) -> Self {
        let (tx, mut rx) = mpsc::channel::<HandoffRequest>(8);
        let worker = engine.clone();
        let task = tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let reply = worker.receive_handoff(&req.payload).await.map_err(|e| e.to_string());
                let _ = req.reply.send(reply);
            }
        });
        Self { engine, tx, task }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn transport(&self) -> ChannelTransport {
        ChannelTransport { tx: self.tx.clone() }
    }

    /// Stops accepting hand-offs. Sessions already running keep going.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<HandoffRequest>,
}

#[async_trait]
impl HandoffTransport for ChannelTransport {
    async fn send(&self, payload: String) -> Result<SessionId, HandoffError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HandoffRequest { payload, reply })
            .await
            .map_err(|_| HandoffError::Transfer("background host is not running".to_string()))?;
        match rx.await {
            Ok(Ok(id)) => Ok(id),
            Ok(Err(reason)) => Err(HandoffError::Rejected(reason)),
            Err(_) => Err(HandoffError::Transfer("background host dropped the request".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::chapters::{is_empty_chapter, result_key};
    use crate::core::model::{ContentBlock, StartOptions};
    use crate::core::testing::{registry, FakeService};
    use crate::plugins::fb2::Fb2Exporter;
    use crate::plugins::registry::Exporter as _;
    use std::path::Path;
    use std::sync::Arc;

    struct FailingTransport;

    #[async_trait]
    impl HandoffTransport for FailingTransport {
        async fn send(&self, _payload: String) -> Result<SessionId, HandoffError> {
            Err(HandoffError::Transfer("channel closed".into()))
        }
    }

    fn config(dir: &Path) -> EngineConfig {
        EngineConfig { out_dir: dir.to_path_buf(), pause_poll_ms: 100, chapter_delay_ms: 500, cleanup_delay_secs: 600 }
    }

    fn options() -> StartOptions {
        StartOptions { service_key: Some("fake".into()), slug: Some("h".into()), ..Default::default() }
    }

    async fn wait_chapter(rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>, id: SessionId, index: usize) {
        loop {
            match rx.recv().await.unwrap() {
                SessionEvent::ChapterDone { session_id, index: i, .. } if session_id == id && i == index => return,
                _ => continue,
            }
        }
    }

    fn sample_session() -> DownloadSession {
        let mut s = DownloadSession::new("slug".into(), "fake".into(), ExportFormat::Epub);
        s.manga = Some(Manga { title: "T".into(), ..Default::default() });
        s.chapters = FakeService::chapter_refs(3);
        s.chapter_contents = vec![ChapterResult::from_ref(&s.chapters[0], vec![ContentBlock::text("a")])];
        s.current_chapter_index = 1;
        s.step = SessionStep::DownloadingChapters;
        s.progress = 33;
        s
    }

    #[test]
    fn snapshot_survives_json_and_seeds_a_new_session() {
        let source = sample_session();
        let snap = HandoffSnapshot::from_session(&source);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"currentChapterIndex\":1"));

        let back: HandoffSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);

        let resumed = back.into_session();
        assert_ne!(resumed.id, source.id);
        assert_eq!(resumed.current_chapter_index, 1);
        assert_eq!(resumed.chapter_contents, source.chapter_contents);
        assert_eq!(resumed.step, SessionStep::DownloadingChapters);
        assert!(!resumed.handed_off);
    }

    #[test]
    fn inconsistent_snapshots_are_rejected() {
        let mut snap = HandoffSnapshot::from_session(&sample_session());
        snap.current_chapter_index = 9;
        assert!(matches!(snap.validate(), Err(HandoffError::Rejected(_))));

        let mut snap = HandoffSnapshot::from_session(&sample_session());
        snap.current_chapter_index = 0;
        assert!(matches!(snap.validate(), Err(HandoffError::Rejected(_))));
    }

    #[tokio::test]
    async fn sessions_not_downloading_cannot_move() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(registry(Arc::new(FakeService::new(1))), config(dir.path())).await.unwrap();
        let unknown = uuid::Uuid::new_v4();
        assert!(matches!(engine.hand_off(unknown, &FailingTransport).await, Err(HandoffError::NotFound(_))));

        let id = engine.create_session(options()).await.unwrap();
        assert!(matches!(engine.hand_off(id, &FailingTransport).await, Err(HandoffError::NotDownloading(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_transfer_resumes_locally() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(FakeService::new(4));
        let engine = Engine::new(registry(service.clone()), config(dir.path())).await.unwrap();
        let mut rx = engine.subscribe();

        let id = engine.spawn(options()).await.unwrap();
        wait_chapter(&mut rx, id, 0).await;

        let err = engine.hand_off(id, &FailingTransport).await.unwrap_err();
        assert!(matches!(err, HandoffError::Transfer(_)));
        assert!(!engine.session(id).await.unwrap().handed_off);

        engine.wait_session(id).await;
        let s = engine.session(id).await.unwrap();
        assert_eq!(s.step, SessionStep::Completed);
        assert_eq!(service.fetched(), vec!["1", "2", "3", "4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn background_host_finishes_with_every_chapter_once() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(FakeService::new(5));
        let front = Engine::new(registry(service.clone()), config(dir.path())).await.unwrap();
        let back = Engine::new(registry(service.clone()), config(dir.path())).await.unwrap();
        let host = BackgroundHost::spawn(back);
        let mut rx = front.subscribe();

        let id = front.spawn(options()).await.unwrap();
        wait_chapter(&mut rx, id, 1).await;

        let new_id = front.hand_off(id, &host.transport()).await.unwrap();
        assert_ne!(new_id, id);

        front.wait_session(id).await;
        let source = front.session(id).await.unwrap();
        assert_eq!(source.step, SessionStep::HandedOff);
        assert_eq!(source.current_chapter_index, 2);
        assert!(source.saved_files.is_empty());

        host.engine().wait_session(new_id).await;
        let resumed = host.engine().session(new_id).await.unwrap();
        assert_eq!(resumed.step, SessionStep::Completed);
        assert_eq!(resumed.current_chapter_index, 5);

        let data = std::fs::read(&resumed.saved_files[0]).unwrap();
        let chapters = Fb2Exporter::new().parse(&data).unwrap().chapters;
        let keys: Vec<_> = chapters.iter().map(result_key).collect();
        assert_eq!(keys, vec!["v1_ch1", "v1_ch2", "v1_ch3", "v1_ch4", "v1_ch5"]);
        assert!(chapters.iter().all(|c| !is_empty_chapter(c)));
        assert_eq!(service.fetched(), vec!["1", "2", "3", "4", "5"]);

        host.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_hand_offs_move_the_session_once() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(FakeService::new(5));
        let front = Engine::new(registry(service.clone()), config(dir.path())).await.unwrap();
        let back = Engine::new(registry(service.clone()), config(dir.path())).await.unwrap();
        let host = BackgroundHost::spawn(back);
        let mut rx = front.subscribe();

        let id = front.spawn(options()).await.unwrap();
        wait_chapter(&mut rx, id, 1).await;

        let transport = host.transport();
        let (a, b) = tokio::join!(front.hand_off(id, &transport), front.hand_off(id, &transport));
        let (moved, refused) = match (a, b) {
            (Ok(new_id), Err(e)) | (Err(e), Ok(new_id)) => (new_id, e),
            other => panic!("expected exactly one transfer, got {:?}", other),
        };
        assert!(matches!(refused, HandoffError::NotDownloading(other) if other == id));

        front.wait_session(id).await;
        assert_eq!(front.session(id).await.unwrap().step, SessionStep::HandedOff);

        host.engine().wait_session(moved).await;
        let resumed = host.engine().session(moved).await.unwrap();
        assert_eq!(resumed.step, SessionStep::Completed);
        assert_eq!(service.fetched(), vec!["1", "2", "3", "4", "5"]);

        host.shutdown();
    }

    #[tokio::test]
    async fn receiver_rejects_garbage_and_unknown_services() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(registry(Arc::new(FakeService::new(1))), config(dir.path())).await.unwrap();
        assert!(matches!(engine.receive_handoff("{not json").await, Err(HandoffError::Serialize(_))));

        let mut snap = HandoffSnapshot::from_session(&sample_session());
        snap.service_key = "other".into();
        assert!(matches!(engine.accept_handoff(snap).await, Err(HandoffError::Rejected(_))));

        let host = BackgroundHost::spawn(engine.clone());
        let transport = host.transport();
        host.shutdown();
        tokio::task::yield_now().await;
        assert!(transport.send("{}".into()).await.is_err());
        assert!(matches!(
            engine.accept_handoff(HandoffSnapshot::from_session(&sample_session())).await,
            Ok(_)
        ));
    }
}
