use crate::config::EngineConfig;
use crate::core::chapters::{apply_range, sort_chapters};
use crate::core::controller::{Controller, PipelinePhase};
use crate::core::error::EngineError;
use crate::core::events::SessionEvent;
use crate::core::handoff::HandoffSnapshot;
use crate::core::merge::{find_missing, merge, parse_existing};
use crate::core::model::*;
use crate::core::pipeline::ChapterPipeline;
use crate::core::planner::{part_at, part_title};
use crate::plugins::registry::{ContentService, ExportedFile, Exporter, PluginRegistry};
use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};

/// One registered session: its record, its controller and a completion signal.
pub struct SessionSlot {
    pub(crate) session: Mutex<DownloadSession>,
    pub(crate) controller: Controller,
    done: Notify,
    /// Claimed by the single `run` allowed per session.
    running: AtomicBool,
    /// Claimed by the hand-off in flight; stays set once the session has moved.
    pub(crate) handoff_claimed: AtomicBool,
}

impl SessionSlot {
    pub(crate) fn new(session: DownloadSession, pause_poll: Duration) -> Self {
        Self {
            session: Mutex::new(session),
            controller: Controller::new(pause_poll),
            done: Notify::new(),
            running: AtomicBool::new(false),
            handoff_claimed: AtomicBool::new(false),
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    registry: Arc<PluginRegistry>,
    config: EngineConfig,
    event_tx: broadcast::Sender<SessionEvent>,
    sessions: Arc<Mutex<HashMap<SessionId, Arc<SessionSlot>>>>,
}

fn format_from_path(path: &Path) -> Option<ExportFormat> {
    path.extension().and_then(|e| e.to_str()).and_then(ExportFormat::parse)
}

impl Engine {
    pub async fn new(registry: PluginRegistry, config: EngineConfig) -> anyhow::Result<Self> {
        let (event_tx, _) = broadcast::channel(256);

        tokio::fs::create_dir_all(&config.out_dir)
            .await
            .with_context(|| format!("create out_dir {}", config.out_dir.display()))?;

        Ok(Self {
            registry: Arc::new(registry),
            config,
            event_tx,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) async fn slot(&self, id: SessionId) -> Option<Arc<SessionSlot>> {
        self.sessions.lock().await.get(&id).cloned()
    }

    pub(crate) async fn register(&self, session: DownloadSession) -> Arc<SessionSlot> {
        let id = session.id;
        let slot = Arc::new(SessionSlot::new(session, self.config.pause_poll()));
        self.sessions.lock().await.insert(id, slot.clone());
        slot
    }

    /// Validates `options` and registers a session without touching the
    /// network. Unknown services, missing slugs and unusable formats fail here.
    pub async fn create_session(&self, options: StartOptions) -> anyhow::Result<SessionId> {
        let (service, url_slug) = self
            .registry
            .resolve(options.service_key.as_deref(), options.url.as_deref())
            .ok_or_else(|| EngineError::UnknownService { key: options.service_key.clone(), url: options.url.clone() })?;

        let slug = options
            .slug
            .clone()
            .or(url_slug)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(EngineError::MissingSlug)?;

        let format = options
            .format
            .or_else(|| options.loaded_file.as_ref().and_then(|f| format_from_path(&f.path)))
            .unwrap_or(ExportFormat::Fb2);
        let exporter = self.registry.exporter(format).ok_or(EngineError::UnsupportedFormat(format))?;
        if options.loaded_file.is_some() && !exporter.can_parse() {
            return Err(EngineError::ParseUnsupported(format).into());
        }

        let mut session = DownloadSession::new(slug.clone(), service.key().to_string(), format);
        session.range = options.range;
        session.loaded_file = options.loaded_file;
        let id = session.id;
        let update = session.is_update();
        self.register(session).await;

        tracing::info!(session = %id, service = service.key(), slug = %slug, format = %format, update, "session created");
        self.emit(SessionEvent::Started { session_id: id, slug, service: service.key().to_string() });
        Ok(id)
    }

    /// Drives a registered session to a terminal state. Fatal errors mark the
    /// session failed, notify listeners and are returned to the caller.
    pub async fn run(&self, id: SessionId) -> anyhow::Result<DownloadOutcome> {
        let slot = self.slot(id).await.ok_or(EngineError::SessionNotFound(id))?;
        let step = slot.session.lock().await.step;
        if step.is_terminal() {
            anyhow::bail!("session {} already finished ({:?})", id, step);
        }
        if slot.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(EngineError::AlreadyRunning(id).into());
        }

        let result = self.drive(&slot).await;
        slot.controller.set_phase(PipelinePhase::Finished);
        if let Err(e) = &result {
            self.fail(&slot, e).await;
        }

        slot.done.notify_waiters();
        self.schedule_cleanup(id);
        result
    }

    pub async fn start(&self, options: StartOptions) -> anyhow::Result<DownloadOutcome> {
        let id = self.create_session(options).await?;
        self.run(id).await
    }

    /// Creates the session and runs it on its own task.
    pub async fn spawn(&self, options: StartOptions) -> anyhow::Result<SessionId> {
        let id = self.create_session(options).await?;
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run(id).await {
                tracing::debug!(session = %id, "background run ended with error: {:#}", e);
            }
        });
        Ok(id)
    }

    pub async fn wait_session(&self, id: SessionId) {
        let Some(slot) = self.slot(id).await else {
            return;
        };
        loop {
            let notified = slot.done.notified();
            if slot.session.lock().await.step.is_terminal() {
                return;
            }
            notified.await;
        }
    }

    pub async fn pause(&self, id: SessionId) {
        match self.slot(id).await {
            Some(slot) => {
                slot.controller.pause();
                tracing::info!(session = %id, "paused");
            }
            None => tracing::debug!(session = %id, "pause ignored: unknown session"),
        }
    }

    pub async fn resume(&self, id: SessionId) {
        match self.slot(id).await {
            Some(slot) => {
                slot.controller.resume();
                tracing::info!(session = %id, "resumed");
            }
            None => tracing::debug!(session = %id, "resume ignored: unknown session"),
        }
    }

    pub async fn stop(&self, id: SessionId) {
        match self.slot(id).await {
            Some(slot) => {
                slot.controller.stop();
                tracing::info!(session = %id, "stop requested");
            }
            None => tracing::debug!(session = %id, "stop ignored: unknown session"),
        }
    }

    /// Everything needed to resume the session elsewhere; `None` for ids that
    /// are unknown or already cleaned up.
    pub async fn get_state(&self, id: SessionId) -> Option<HandoffSnapshot> {
        let slot = self.slot(id).await?;
        let s = slot.session.lock().await;
        Some(HandoffSnapshot::from_session(&s))
    }

    /// Copy of the live session record.
    pub async fn session(&self, id: SessionId) -> Option<DownloadSession> {
        let slot = self.slot(id).await?;
        let s = slot.session.lock().await;
        Some(s.clone())
    }

    async fn drive(&self, slot: &SessionSlot) -> anyhow::Result<DownloadOutcome> {
        let (service_key, format, step, update) = {
            let s = slot.session.lock().await;
            (s.service_key.clone(), s.format, s.step, s.is_update())
        };
        let service = self
            .registry
            .service(&service_key)
            .ok_or_else(|| EngineError::UnknownService { key: Some(service_key.clone()), url: None })?;
        let exporter = self.registry.exporter(format).ok_or(EngineError::UnsupportedFormat(format))?;

        let existing = match step {
            // seeded from a hand-off snapshot
            SessionStep::DownloadingChapters => None,
            _ if update => match self.prepare_update(slot, service.as_ref(), exporter.as_ref()).await? {
                Some(existing) => Some(existing),
                None => return Ok(self.finish_nothing_to_do(slot).await),
            },
            _ => {
                self.prepare_fresh(slot, service.as_ref()).await?;
                None
            }
        };

        self.download(slot, service.as_ref(), &exporter, existing).await
    }

    async fn set_step(&self, slot: &SessionSlot, step: SessionStep, status: &str) {
        let (id, progress) = {
            let mut s = slot.session.lock().await;
            s.step = step;
            s.status = status.to_string();
            (s.id, s.progress)
        };
        tracing::debug!(session = %id, ?step, "{}", status);
        self.emit(SessionEvent::StepChanged { session_id: id, step });
        self.emit(SessionEvent::Progress { session_id: id, status: status.to_string(), percent: progress });
    }

    async fn prepare_fresh(&self, slot: &SessionSlot, service: &dyn ContentService) -> anyhow::Result<()> {
        let (id, slug, range) = {
            let s = slot.session.lock().await;
            (s.id, s.source_slug.clone(), s.range)
        };

        self.set_step(slot, SessionStep::FetchingMetadata, "Fetching metadata").await;
        let manga = service
            .fetch_metadata(&slug)
            .await
            .with_context(|| format!("fetch metadata for {}", slug))?;

        let cover = match service.fetch_cover(&manga).await {
            Ok(cover) => cover,
            Err(e) => {
                tracing::warn!(session = %id, "cover not available: {:#}", e);
                None
            }
        };
        {
            let mut s = slot.session.lock().await;
            s.manga = Some(manga);
            s.cover_data = cover;
        }

        self.set_step(slot, SessionStep::FetchingChapterList, "Fetching chapter list").await;
        let mut chapters = service
            .fetch_chapter_list(&slug)
            .await
            .with_context(|| format!("fetch chapter list for {}", slug))?;
        sort_chapters(&mut chapters);
        let server_total = chapters.len();
        let chapters = apply_range(chapters, range);
        tracing::info!(session = %id, server_total, selected = chapters.len(), "chapter list ready");

        slot.session.lock().await.chapters = chapters;
        Ok(())
    }

    /// Diffs the loaded file against the server. Returns the parsed existing
    /// chapters, or `None` when nothing is missing.
    async fn prepare_update(
        &self,
        slot: &SessionSlot,
        service: &dyn ContentService,
        exporter: &dyn Exporter,
    ) -> anyhow::Result<Option<Vec<ChapterResult>>> {
        let (id, slug, path) = {
            let s = slot.session.lock().await;
            (s.id, s.source_slug.clone(), s.loaded_file.as_ref().map(|f| f.path.clone()))
        };
        let path = path.context("update mode without a loaded file")?;

        self.set_step(slot, SessionStep::FetchingChapterList, "Fetching chapter list").await;
        let mut server = service
            .fetch_chapter_list(&slug)
            .await
            .with_context(|| format!("fetch chapter list for {}", slug))?;
        sort_chapters(&mut server);

        self.set_step(slot, SessionStep::FetchingChapterList, "Reading existing file").await;
        let parsed = parse_existing(exporter, &path).await?;
        let manga = if parsed.manga.title.trim().is_empty() {
            service
                .fetch_metadata(&slug)
                .await
                .with_context(|| format!("fetch metadata for {}", slug))?
        } else {
            parsed.manga
        };

        let missing = find_missing(&server, &parsed.chapters);
        tracing::info!(
            session = %id,
            server = server.len(),
            existing = parsed.chapters.len(),
            missing = missing.len(),
            "update diff computed"
        );

        let nothing_to_do = missing.is_empty();
        {
            let mut s = slot.session.lock().await;
            s.manga = Some(manga);
            s.cover_data = parsed.cover;
            s.server_chapters = Some(server);
            s.chapters = missing;
        }
        Ok(if nothing_to_do { None } else { Some(parsed.chapters) })
    }

    async fn download(
        &self,
        slot: &SessionSlot,
        service: &dyn ContentService,
        exporter: &Arc<dyn Exporter>,
        existing: Option<Vec<ChapterResult>>,
    ) -> anyhow::Result<DownloadOutcome> {
        let update = slot.session.lock().await.is_update();
        self.set_step(slot, SessionStep::DownloadingChapters, "Downloading chapters").await;
        slot.controller.set_phase(PipelinePhase::Working);

        let cap = if update { None } else { service.max_chapters_per_file() };
        let pipeline = ChapterPipeline::new(service, slot, &self.event_tx, self.config.chapter_delay());
        let mut files = vec![];

        loop {
            let (batch, cursor, total, done_before, book_total) = {
                let s = slot.session.lock().await;
                let total = s.chapters.len();
                let cursor = s.current_chapter_index.min(total);
                let pos = part_at(cursor, s.chapter_contents.len(), total, cap);
                let end = pos.range.end.clamp(cursor, total);
                // update runs report progress against the whole book
                let book_total = s.server_chapters.as_ref().map_or(total, |server| server.len().max(total));
                (s.chapters[cursor..end].to_vec(), cursor, total, book_total - total, book_total)
            };
            if !batch.is_empty() {
                pipeline.run(&batch, done_before + cursor, book_total).await;
            }

            let (cursor, handed_off) = {
                let s = slot.session.lock().await;
                (s.current_chapter_index, s.handed_off)
            };
            if handed_off {
                return Ok(self.finish_handed_off(slot).await);
            }
            if slot.controller.is_stopped() || cursor >= total {
                break;
            }

            // current part is complete and more chapters follow
            files.push(self.save_part(slot, exporter, cap).await?);
            self.set_step(slot, SessionStep::DownloadingChapters, "Downloading chapters").await;
        }
        slot.controller.set_phase(PipelinePhase::Finished);

        let stopped = slot.controller.is_stopped();
        if update {
            files.push(self.save_merged(slot, exporter, existing).await?);
        } else {
            let (buffered, cursor, total) = {
                let s = slot.session.lock().await;
                (s.chapter_contents.len(), s.current_chapter_index, s.chapters.len())
            };
            let pos = part_at(cursor, buffered, total, cap);
            if buffered > 0 || (files.is_empty() && !stopped) {
                files.push(self.save_part(slot, exporter, cap).await?);
            } else if pos.count > 1 {
                tracing::debug!("no chapters left for part {}/{}", pos.index + 1, pos.count);
            }
        }

        Ok(self.finish(slot, files, stopped).await)
    }

    /// Exports the buffered chapters as the current part and clears the buffer.
    async fn save_part(&self, slot: &SessionSlot, exporter: &Arc<dyn Exporter>, cap: Option<usize>) -> anyhow::Result<PathBuf> {
        let (id, manga, cover, buffer, cursor, total) = {
            let s = slot.session.lock().await;
            (
                s.id,
                s.manga.clone().unwrap_or_default(),
                s.cover_data.clone(),
                s.chapter_contents.clone(),
                s.current_chapter_index,
                s.chapters.len(),
            )
        };
        let pos = part_at(cursor, buffer.len(), total, cap);
        let title = part_title(&manga.title, pos.index, pos.count);

        let path = self.export_and_save(slot, exporter, &manga, &title, buffer, cover).await?;
        slot.session.lock().await.chapter_contents.clear();

        if pos.count > 1 {
            tracing::info!(session = %id, part = pos.index + 1, parts = pos.count, "part saved");
            self.emit(SessionEvent::PartSaved { session_id: id, path: path.clone(), part: pos.index + 1, parts: pos.count });
        }
        Ok(path)
    }

    async fn save_merged(
        &self,
        slot: &SessionSlot,
        exporter: &Arc<dyn Exporter>,
        existing: Option<Vec<ChapterResult>>,
    ) -> anyhow::Result<PathBuf> {
        let (manga, cover, fetched, server, loaded) = {
            let s = slot.session.lock().await;
            (
                s.manga.clone().unwrap_or_default(),
                s.cover_data.clone(),
                s.chapter_contents.clone(),
                s.server_chapters.clone().unwrap_or_else(|| s.chapters.clone()),
                s.loaded_file.clone(),
            )
        };

        let existing = match (existing, loaded) {
            (Some(existing), _) => existing,
            (None, Some(file)) => parse_existing(exporter.as_ref(), &file.path).await?.chapters,
            (None, None) => vec![],
        };
        let merged = merge(&existing, &fetched, &server);
        self.export_and_save(slot, exporter, &manga, &manga.title, merged, cover).await
    }

    async fn export_and_save(
        &self,
        slot: &SessionSlot,
        exporter: &Arc<dyn Exporter>,
        manga: &Manga,
        title: &str,
        chapters: Vec<ChapterResult>,
        cover: Option<CoverImage>,
    ) -> anyhow::Result<PathBuf> {
        let status = format!("Exporting {} chapters to {}", chapters.len(), exporter.format());
        self.set_step(slot, SessionStep::Exporting, &status).await;

        let exporter = exporter.clone();
        let mut book = manga.clone();
        book.title = title.to_string();
        let file = tokio::task::spawn_blocking(move || exporter.export(&book, &chapters, cover.as_ref()))
            .await
            .context("export task")??;

        self.set_step(slot, SessionStep::Saving, &format!("Saving {}", file.filename)).await;
        let path = self.write_file(&file).await?;
        slot.session.lock().await.saved_files.push(path.clone());
        Ok(path)
    }

    async fn write_file(&self, file: &ExportedFile) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config.out_dir)
            .await
            .with_context(|| format!("create out_dir {}", self.config.out_dir.display()))?;
        let path = self.config.out_dir.join(&file.filename);
        tokio::fs::write(&path, &file.data)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        tracing::info!(path = %path.display(), bytes = file.data.len(), "file saved");
        Ok(path)
    }

    async fn finish(&self, slot: &SessionSlot, files: Vec<PathBuf>, stopped: bool) -> DownloadOutcome {
        let (id, chapters) = {
            let mut s = slot.session.lock().await;
            if stopped {
                s.step = SessionStep::Stopped;
                s.status = format!("Stopped after {} of {} chapters", s.current_chapter_index, s.chapters.len());
            } else {
                s.step = SessionStep::Completed;
                s.status = "Completed".to_string();
                s.progress = 100;
            }
            (s.id, s.current_chapter_index)
        };

        if stopped {
            tracing::info!(session = %id, chapters, "session stopped");
            self.emit(SessionEvent::Stopped { session_id: id, files: files.clone() });
            DownloadOutcome::Stopped { files, chapters }
        } else {
            tracing::info!(session = %id, chapters, files = files.len(), "session completed");
            self.emit(SessionEvent::Completed { session_id: id, files: files.clone() });
            DownloadOutcome::Completed { files, chapters }
        }
    }

    async fn finish_nothing_to_do(&self, slot: &SessionSlot) -> DownloadOutcome {
        let id = {
            let mut s = slot.session.lock().await;
            s.step = SessionStep::Completed;
            s.status = "Nothing to update".to_string();
            s.progress = 100;
            s.id
        };
        tracing::info!(session = %id, "file is already up to date");
        self.emit(SessionEvent::NothingToDo { session_id: id });
        DownloadOutcome::NothingToDo
    }

    async fn finish_handed_off(&self, slot: &SessionSlot) -> DownloadOutcome {
        let id = {
            let mut s = slot.session.lock().await;
            s.step = SessionStep::HandedOff;
            s.id
        };
        slot.controller.set_phase(PipelinePhase::Finished);
        tracing::info!(session = %id, "session continues elsewhere");
        self.emit(SessionEvent::HandedOff { session_id: id });
        DownloadOutcome::HandedOff
    }

    async fn fail(&self, slot: &SessionSlot, error: &anyhow::Error) {
        let message = format!("{:#}", error);
        let id = {
            let mut s = slot.session.lock().await;
            s.step = SessionStep::Failed;
            s.status = format!("Error: {}", message);
            s.progress = PROGRESS_FAILED;
            s.error = Some(message.clone());
            s.id
        };
        tracing::error!(session = %id, "session failed: {}", message);
        self.emit(SessionEvent::Failed { session_id: id, error: message });
    }

    fn schedule_cleanup(&self, id: SessionId) {
        let sessions = self.sessions.clone();
        let delay = self.config.cleanup_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sessions.lock().await.remove(&id).is_some() {
                tracing::debug!(session = %id, "session removed from registry");
            }
        });
    }
}
