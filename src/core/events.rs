use crate::core::model::{SessionId, SessionStep};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started { session_id: SessionId, slug: String, service: String },
    StepChanged { session_id: SessionId, step: SessionStep },
    Progress { session_id: SessionId, status: String, percent: i32 },
    ChapterDone { session_id: SessionId, index: usize, total: usize, failed: bool },
    PartSaved { session_id: SessionId, path: PathBuf, part: usize, parts: usize },
    Completed { session_id: SessionId, files: Vec<PathBuf> },
    Stopped { session_id: SessionId, files: Vec<PathBuf> },
    NothingToDo { session_id: SessionId },
    HandedOff { session_id: SessionId },
    Failed { session_id: SessionId, error: String },
    Info { scope: String, message: String },
}

impl SessionEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::Started { session_id, .. }
            | Self::StepChanged { session_id, .. }
            | Self::Progress { session_id, .. }
            | Self::ChapterDone { session_id, .. }
            | Self::PartSaved { session_id, .. }
            | Self::Completed { session_id, .. }
            | Self::Stopped { session_id, .. }
            | Self::NothingToDo { session_id }
            | Self::HandedOff { session_id }
            | Self::Failed { session_id, .. } => Some(*session_id),
            Self::Info { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. }
                | Self::Stopped { .. }
                | Self::NothingToDo { .. }
                | Self::HandedOff { .. }
                | Self::Failed { .. }
        )
    }
}
