use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

pub type SessionId = Uuid;

/// Remote chapter identity as declared by the service's table of contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRef {
    #[serde(default)]
    pub volume: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ChapterRef {
    pub fn new(volume: impl Into<String>, number: impl Into<String>) -> Self {
        Self { volume: Some(volume.into()), number: Some(number.into()), name: None }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn volume_or_default(&self) -> &str {
        self.volume.as_deref().unwrap_or("1")
    }

    pub fn number_or_default(&self) -> &str {
        self.number.as_deref().unwrap_or("0")
    }

    /// Human readable heading, e.g. "Том 1 Глава 2 - Name".
    pub fn display_title(&self) -> String {
        let base = format!("Том {} Глава {}", self.volume_or_default(), self.number_or_default());
        match self.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => format!("{} - {}", base, name),
            None => base,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    /// Inline payload; empty or missing means the image never arrived.
    #[serde(default)]
    pub base64: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Image { data: ImageData },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image_base64(base64: impl Into<String>, mime: impl Into<String>) -> Self {
        Self::Image {
            data: ImageData { base64: Some(base64.into()), mime: Some(mime.into()), url: None },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterResult {
    pub title: String,
    pub volume: Option<String>,
    pub number: Option<String>,
    pub content: Vec<ContentBlock>,
}

impl ChapterResult {
    pub fn from_ref(chapter: &ChapterRef, content: Vec<ContentBlock>) -> Self {
        Self {
            title: chapter.display_title(),
            volume: chapter.volume.clone(),
            number: chapter.number.clone(),
            content,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manga {
    pub title: String,
    #[serde(default)]
    pub cover: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Cover image fetched once per session and embedded into every exported part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverImage {
    pub base64: String,
    pub mime: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Fb2,
    Epub,
    Pdf,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fb2" => Some(Self::Fb2),
            "epub" => Some(Self::Epub),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Fb2 => "fb2",
            Self::Epub => "epub",
            Self::Pdf => "pdf",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Coarse orchestration step. `status` text on the session is the
/// human-readable counterpart and carries no control meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStep {
    Initializing,
    FetchingMetadata,
    FetchingChapterList,
    DownloadingChapters,
    Exporting,
    Saving,
    Completed,
    Failed,
    Stopped,
    HandedOff,
}

impl SessionStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped | Self::HandedOff)
    }
}

/// 1-based inclusive slice of the sorted chapter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRange {
    pub from: usize,
    pub to: usize,
}

/// A previously exported file to bring up to date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedFile {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub service_key: Option<String>,
    pub url: Option<String>,
    pub slug: Option<String>,
    pub format: Option<ExportFormat>,
    pub range: Option<ChapterRange>,
    pub loaded_file: Option<LoadedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed { files: Vec<PathBuf>, chapters: usize },
    /// Stopped by the user; whatever was gathered has been saved.
    Stopped { files: Vec<PathBuf>, chapters: usize },
    /// Update mode found nothing missing or broken.
    NothingToDo,
    /// The session continues in another engine.
    HandedOff,
}

pub const PROGRESS_FAILED: i32 = -1;

#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub id: SessionId,
    pub source_slug: String,
    pub service_key: String,
    pub format: ExportFormat,
    pub step: SessionStep,
    pub status: String,
    pub progress: i32,
    pub manga: Option<Manga>,
    pub cover_data: Option<CoverImage>,
    pub chapters: Vec<ChapterRef>,
    pub chapter_contents: Vec<ChapterResult>,
    pub current_chapter_index: usize,
    pub loaded_file: Option<LoadedFile>,
    pub range: Option<ChapterRange>,
    /// Full server table of contents in update mode; `chapters` then holds
    /// only the missing subset.
    pub server_chapters: Option<Vec<ChapterRef>>,
    pub saved_files: Vec<PathBuf>,
    pub error: Option<String>,
    pub handed_off: bool,
}

impl DownloadSession {
    pub fn new(source_slug: String, service_key: String, format: ExportFormat) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_slug,
            service_key,
            format,
            step: SessionStep::Initializing,
            status: "Initializing".to_string(),
            progress: 0,
            manga: None,
            cover_data: None,
            chapters: vec![],
            chapter_contents: vec![],
            current_chapter_index: 0,
            loaded_file: None,
            range: None,
            server_chapters: None,
            saved_files: vec![],
            error: None,
            handed_off: false,
        }
    }

    pub fn is_update(&self) -> bool {
        self.loaded_file.is_some()
    }
}
