use std::fmt;
use std::path::PathBuf;

/// Load-time failures. `Locked` is recoverable by retrying with credentials.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("failed to parse {}: {reason}", .path.display())]
    ParseFailure { path: PathBuf, reason: String },

    #[error("{} is locked and needs a password", .0.display())]
    Locked(PathBuf),
}

impl DocumentError {
    pub fn parse(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::ParseFailure {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// A single page could not be rasterized. Never fatal.
#[derive(Debug, thiserror::Error)]
#[error("failed to render page {page}: {reason}")]
pub struct RenderError {
    pub page: usize,
    pub reason: String,
}

impl RenderError {
    pub fn new(page: usize, reason: impl fmt::Display) -> Self {
        Self {
            page,
            reason: reason.to_string(),
        }
    }
}

/// Document content that is ignored while rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnsupportedFeature {
    OptionalContent,
    EmbeddedFiles,
    Scripts,
}

impl fmt::Display for UnsupportedFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnsupportedFeature::OptionalContent => "optional content",
            UnsupportedFeature::EmbeddedFiles => "embedded files",
            UnsupportedFeature::Scripts => "JavaScript",
        };
        f.write_str(name)
    }
}
