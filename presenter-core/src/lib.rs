pub mod cache;
pub mod config;
pub mod document;
pub mod error;
pub mod render;
pub mod session;
#[cfg(test)]
mod testing;
pub mod worker;

use std::path::Path;

use once_cell::sync::Lazy;
use uuid::Uuid;

pub use cache::{CacheEntry, CacheKey, CacheView, InsertOutcome, PageCache, PageState};
pub use config::{CacheLimits, RenderHints, SessionConfig, ViewConfig};
pub use document::{
    load_document, Credentials, DocumentIndex, DocumentInfo, DocumentMetadata, LogicalSlide,
    PageMeta, PageSize, PasswordPrompt,
};
pub use error::{DocumentError, RenderError, UnsupportedFeature};
pub use render::{
    render_or_placeholder, DocumentBackend, DocumentProvider, PagePart, RenderRequest,
    RenderTarget, RenderedImage, ViewTargets,
};
pub use session::{
    Command, DisplayedPage, EventBus, PresentationSession, SessionEvent, SubscriberId,
};
pub use worker::{CacheWorker, PageSources, RenderJob, RenderedPage, SkipReason, WorkerMessage};

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0d4b6e-1c52-5d8e-9a41-8b6f2f7c9e10").expect("valid namespace UUID")
});

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&*DOCUMENT_NAMESPACE, rendered.as_bytes())
}
