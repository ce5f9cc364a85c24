//! Sequential chapter fetching for one session.
//!
//! Chapters are fetched one at a time in order. A failed chapter becomes an
//! error-text placeholder so its position survives into the exported book.

use std::time::Duration;
use tokio::sync::broadcast;

use crate::core::chapters::error_block;
use crate::core::engine::SessionSlot;
use crate::core::events::SessionEvent;
use crate::core::model::{ChapterRef, ChapterResult, ContentBlock, SessionId};
use crate::plugins::registry::{ChapterContext, ContentService, ProgressSink};

pub struct ChapterPipeline<'a> {
    service: &'a dyn ContentService,
    slot: &'a SessionSlot,
    events: &'a broadcast::Sender<SessionEvent>,
    chapter_delay: Duration,
}

/// Forwards service-level progress ("image 3/20") as session progress events.
struct EventSink<'a> {
    session_id: SessionId,
    prefix: String,
    percent: i32,
    events: &'a broadcast::Sender<SessionEvent>,
}

impl ProgressSink for EventSink<'_> {
    fn report(&self, message: &str) {
        let _ = self.events.send(SessionEvent::Progress {
            session_id: self.session_id,
            status: format!("{} ({})", self.prefix, message),
            percent: self.percent,
        });
    }
}

pub(crate) fn percent(done: usize, total: usize) -> i32 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as i32
}

impl<'a> ChapterPipeline<'a> {
    pub fn new(
        service: &'a dyn ContentService,
        slot: &'a SessionSlot,
        events: &'a broadcast::Sender<SessionEvent>,
        chapter_delay: Duration,
    ) -> Self {
        Self { service, slot, events, chapter_delay }
    }

    /// Fetches `chapters` in order. `start_index` and `total` only feed the
    /// progress percentage. Returns what was processed before a stop; every
    /// result is also appended to the session buffer as it completes.
    pub async fn run(&self, chapters: &[ChapterRef], start_index: usize, total: usize) -> Vec<ChapterResult> {
        let controller = &self.slot.controller;
        let (session_id, slug) = {
            let s = self.slot.session.lock().await;
            (s.id, s.source_slug.clone())
        };

        let mut out = Vec::with_capacity(chapters.len());
        for (offset, chapter) in chapters.iter().enumerate() {
            controller.wait_if_paused().await;
            if controller.is_stopped() {
                tracing::info!(session = %session_id, done = out.len(), "stop requested, leaving chapter loop");
                break;
            }

            let index = start_index + offset;
            let title = chapter.display_title();
            let sink = EventSink {
                session_id,
                prefix: format!("Chapter {}/{}: {}", index + 1, total, title),
                percent: percent(index, total),
                events: self.events,
            };
            let ctx = ChapterContext { slug: &slug, chapter, index, total };

            let (content, failed) = match self.fetch_one(&ctx, &sink).await {
                Ok(blocks) => (blocks, false),
                Err(e) => {
                    tracing::warn!(session = %session_id, chapter = %title, "chapter failed: {:#}", e);
                    (vec![error_block(&format!("{:#}", e))], true)
                }
            };
            let result = ChapterResult::from_ref(chapter, content);

            let (status, progress) = {
                let mut s = self.slot.session.lock().await;
                s.chapter_contents.push(result.clone());
                s.current_chapter_index += 1;
                s.status = format!("Downloaded {}/{}: {}", index + 1, total, title);
                s.progress = s.progress.max(percent(index + 1, total));
                (s.status.clone(), s.progress)
            };
            out.push(result);

            let _ = self.events.send(SessionEvent::ChapterDone { session_id, index, total, failed });
            let _ = self.events.send(SessionEvent::Progress { session_id, status, percent: progress });

            if offset + 1 < chapters.len() && !self.chapter_delay.is_zero() {
                tokio::time::sleep(self.chapter_delay).await;
            }
        }
        out
    }

    async fn fetch_one(&self, ctx: &ChapterContext<'_>, sink: &dyn ProgressSink) -> anyhow::Result<Vec<ContentBlock>> {
        let raw = self
            .service
            .fetch_chapter_content(ctx.slug, ctx.chapter.number_or_default(), ctx.chapter.volume_or_default())
            .await?;
        let extracted = self.service.extract(raw)?;
        self.service.process_content(extracted, sink, ctx).await
    }
}
