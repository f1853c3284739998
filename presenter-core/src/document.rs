use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{DocumentError, UnsupportedFeature};
use crate::render::{DocumentBackend, DocumentProvider};
use crate::DocumentId;

/// Natural page size in PDF points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

impl PageSize {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMeta {
    pub size: PageSize,
    pub label: String,
    /// Minimum display time in seconds; `None` when the page declares none.
    pub duration: Option<f32>,
}

impl PageMeta {
    pub fn new(size: PageSize, label: impl Into<String>, duration: Option<f32>) -> Self {
        Self {
            size,
            label: label.into(),
            duration: duration.filter(|d| d.is_finite() && *d >= 0.0),
        }
    }

    /// Sub-second auto-advancing page inside an incremental build.
    pub fn is_flash(&self) -> bool {
        matches!(self.duration, Some(d) if d > 0.0 && d < 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub path: PathBuf,
    pub page_count: usize,
    pub metadata: DocumentMetadata,
}

/// A maximal run of consecutive pages sharing one label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogicalSlide {
    pub label: String,
    pub first_page: usize,
    pub last_page: usize,
}

/// Read-only page geometry, labels and durations of a loaded document.
///
/// Every lookup clamps its page argument into `[0, page_count)`.
#[derive(Debug, Clone)]
pub struct DocumentIndex {
    info: DocumentInfo,
    pages: Vec<PageMeta>,
    unsupported: Vec<UnsupportedFeature>,
}

impl DocumentIndex {
    pub fn new(
        mut info: DocumentInfo,
        pages: Vec<PageMeta>,
        unsupported: Vec<UnsupportedFeature>,
    ) -> Result<Self, DocumentError> {
        if pages.is_empty() {
            return Err(DocumentError::parse(&info.path, "document has no pages"));
        }
        info.page_count = pages.len();

        for feature in &unsupported {
            warn!(
                path = %info.path.display(),
                %feature,
                "document uses {feature}, which is not supported and will be ignored"
            );
        }

        Ok(Self {
            info,
            pages,
            unsupported,
        })
    }

    pub fn info(&self) -> &DocumentInfo {
        &self.info
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn unsupported_features(&self) -> &[UnsupportedFeature] {
        &self.unsupported
    }

    pub fn clamp(&self, page: isize) -> usize {
        if page < 0 {
            0
        } else {
            self.clamp_index(page as usize)
        }
    }

    pub fn clamp_index(&self, page: usize) -> usize {
        page.min(self.pages.len() - 1)
    }

    pub fn page(&self, page: usize) -> &PageMeta {
        &self.pages[self.clamp_index(page)]
    }

    pub fn page_size(&self, page: isize) -> PageSize {
        self.pages[self.clamp(page)].size
    }

    pub fn label(&self, page: usize) -> &str {
        &self.page(page).label
    }

    pub fn duration(&self, page: usize) -> Option<f32> {
        self.page(page).duration
    }

    /// First page at or after `page` whose label differs from the label of
    /// `page`; the last page when the remainder shares one label.
    pub fn next_slide_start(&self, page: usize) -> usize {
        let page = self.clamp_index(page);
        let label = &self.pages[page].label;
        self.pages[page..]
            .iter()
            .position(|meta| &meta.label != label)
            .map(|offset| page + offset)
            .unwrap_or(self.pages.len() - 1)
    }

    /// Last page of the previous logical slide, walking back over flash pages
    /// (sub-second durations) that share the label of the page before them.
    pub fn previous_slide_end(&self, page: usize) -> usize {
        let page = self.clamp_index(page);
        let label = &self.pages[page].label;
        let Some(mut end) = (0..page).rev().find(|&i| &self.pages[i].label != label) else {
            return 0;
        };

        while end > 0
            && self.pages[end].is_flash()
            && self.pages[end - 1].label == self.pages[end].label
        {
            end -= 1;
        }
        end
    }

    pub fn slides(&self) -> Vec<LogicalSlide> {
        let mut slides: Vec<LogicalSlide> = Vec::new();
        for (index, meta) in self.pages.iter().enumerate() {
            match slides.last_mut() {
                Some(slide) if slide.label == meta.label => slide.last_page = index,
                _ => slides.push(LogicalSlide {
                    label: meta.label.clone(),
                    first_page: index,
                    last_page: index,
                }),
            }
        }
        slides
    }

    /// Zero-based number of the logical slide containing `page`.
    pub fn slide_number(&self, page: usize) -> usize {
        let page = self.clamp_index(page);
        self.pages[..=page]
            .windows(2)
            .filter(|pair| pair[0].label != pair[1].label)
            .count()
    }
}

/// Owner and user passwords for a locked document.
#[derive(Clone, Default)]
pub struct Credentials {
    pub owner: String,
    pub user: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials { .. }")
    }
}

/// Asks the user for the passwords of a locked document.
pub trait PasswordPrompt {
    fn credentials(&self, path: &Path) -> anyhow::Result<Credentials>;
}

/// Opens `path`, retrying once with prompted credentials when it is locked.
#[instrument(skip(provider, path, prompt), fields(path = %path.display()))]
pub async fn load_document(
    provider: &dyn DocumentProvider,
    path: &Path,
    prompt: &dyn PasswordPrompt,
) -> Result<Arc<dyn DocumentBackend>, DocumentError> {
    match provider.open(path, None).await {
        Err(DocumentError::Locked(locked)) => {
            info!("document is locked, asking for credentials");
            let credentials = prompt.credentials(&locked).map_err(|err| {
                warn!(%err, "password prompt failed");
                DocumentError::Locked(locked.clone())
            })?;
            provider.open(path, Some(&credentials)).await
        }
        other => other,
    }
}
