use std::convert::TryFrom;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use image::{imageops, RgbaImage};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use presenter_core::{
    document_id_for_path, Credentials, DocumentBackend, DocumentError, DocumentIndex,
    DocumentInfo, DocumentMetadata, DocumentProvider, PagePart, PageMeta, PageSize, RenderError,
    RenderHints, RenderRequest, RenderedImage, UnsupportedFeature,
};
use tracing::{debug, instrument, warn};

mod structure;

pub use structure::DocumentStructure;

/// Opens PDFs through one shared pdfium binding.
pub struct PdfiumRenderFactory {
    pdfium: Arc<Pdfium>,
    hints: RenderHints,
}

impl PdfiumRenderFactory {
    pub fn new(hints: RenderHints) -> Result<Self> {
        let pdfium = match bind_pdfium_from_build_hint() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
            hints,
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumRenderFactory {
    async fn open(
        &self,
        path: &Path,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn DocumentBackend>, DocumentError> {
        let absolute = path
            .canonicalize()
            .map_err(|_| DocumentError::FileNotFound(path.to_path_buf()))?;
        let (document, password) = open_with_credentials(&self.pdfium, &absolute, credentials)?;
        let structure = DocumentStructure::scan_or_default(&absolute);
        let index = build_index(&document, &absolute, &structure)?;
        drop(document);

        Ok(Arc::new(PdfiumDocument::new(
            Arc::clone(&self.pdfium),
            absolute,
            password,
            index,
            self.hints,
        )))
    }
}

/// Passwords to try, in order: none at all without credentials, otherwise
/// the user password then the owner password.
fn password_candidates(credentials: Option<&Credentials>) -> Vec<Option<&str>> {
    let Some(credentials) = credentials else {
        return vec![None];
    };
    let candidates: Vec<Option<&str>> = [&credentials.user, &credentials.owner]
        .into_iter()
        .filter(|password| !password.is_empty())
        .map(|password| Some(password.as_str()))
        .collect();
    if candidates.is_empty() {
        vec![None]
    } else {
        candidates
    }
}

/// Returns the document together with the password that opened it.
fn open_with_credentials<'a>(
    pdfium: &'a Pdfium,
    path: &Path,
    credentials: Option<&'a Credentials>,
) -> Result<(PdfDocument<'a>, Option<String>), DocumentError> {
    for password in password_candidates(credentials) {
        match pdfium.load_pdf_from_file(path, password) {
            Ok(document) => return Ok((document, password.map(str::to_owned))),
            Err(PdfiumError::PdfiumLibraryInternalError(PdfiumInternalError::PasswordError)) => {
                continue
            }
            Err(err) => return Err(DocumentError::parse(path, err)),
        }
    }
    Err(DocumentError::Locked(path.to_path_buf()))
}

fn build_index(
    document: &PdfDocument<'_>,
    path: &Path,
    structure: &DocumentStructure,
) -> Result<DocumentIndex, DocumentError> {
    let pages: Vec<PageMeta> = document
        .pages()
        .iter()
        .enumerate()
        .map(|(index, page)| {
            let label = structure
                .label(index)
                .filter(|label| !label.is_empty())
                .map(str::to_owned)
                .unwrap_or_else(|| (index + 1).to_string());
            PageMeta::new(
                PageSize::new(page.width().value, page.height().value),
                label,
                structure.duration(index),
            )
        })
        .collect();

    let mut unsupported = structure.unsupported().to_vec();
    if !document.attachments().is_empty() && !unsupported.contains(&UnsupportedFeature::EmbeddedFiles)
    {
        unsupported.push(UnsupportedFeature::EmbeddedFiles);
    }

    let info = DocumentInfo {
        id: document_id_for_path(path),
        path: path.to_path_buf(),
        page_count: pages.len(),
        metadata: read_metadata(document),
    };
    DocumentIndex::new(info, pages, unsupported)
}

fn read_metadata(document: &PdfDocument<'_>) -> DocumentMetadata {
    let metadata = document.metadata();
    let title = metadata
        .get(PdfDocumentMetadataTagType::Title)
        .map(|t| t.value().to_owned());
    let author = metadata
        .get(PdfDocumentMetadataTagType::Author)
        .map(|t| t.value().to_owned());
    let keywords = metadata
        .get(PdfDocumentMetadataTagType::Keywords)
        .map(|t| t.value().split(',').map(|s| s.trim().to_owned()).collect())
        .unwrap_or_else(Vec::new);

    DocumentMetadata {
        title,
        author,
        keywords,
    }
}

/// A PDF opened lazily on first render and kept open afterwards. pdfium is not
/// reentrant, so every render goes through the document lock.
struct PdfiumDocument {
    document: Mutex<Option<PdfDocument<'static>>>,
    index: DocumentIndex,
    path: PathBuf,
    password: Option<String>,
    hints: RenderHints,
    pdfium: Arc<Pdfium>,
}

impl PdfiumDocument {
    fn new(
        pdfium: Arc<Pdfium>,
        path: PathBuf,
        password: Option<String>,
        index: DocumentIndex,
        hints: RenderHints,
    ) -> Self {
        Self {
            document: Mutex::new(None),
            index,
            path,
            password,
            hints,
            pdfium,
        }
    }

    fn open_document(&self) -> Result<PdfDocument<'static>> {
        let document = self
            .pdfium
            .load_pdf_from_file(&self.path, self.password.as_deref())
            .map_err(|err| anyhow!("failed to open {:?}: {err}", self.path))?;
        // SAFETY: the document borrows the bindings owned by `self.pdfium`. It is
        // stored in `self.document`, which is declared before `pdfium` and so is
        // dropped first; the bindings outlive every use of the document.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_document<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PdfDocument<'static>) -> Result<R>,
    {
        let mut guard = self.document.lock();
        let document = match guard.take() {
            Some(document) => document,
            None => self.open_document()?,
        };
        let document = guard.insert(document);
        f(document)
    }

    fn render_internal(
        &self,
        document: &PdfDocument<'_>,
        request: &RenderRequest,
    ) -> Result<RenderedImage> {
        let page_index = PdfPageIndex::try_from(request.page_index)
            .map_err(|_| anyhow!("page {} is out of supported range", request.page_index))?;
        let page = document
            .pages()
            .get(page_index)
            .map_err(|err| anyhow!("page {} unavailable: {err}", request.page_index))?;

        let page_size = self.index.page_size(request.page_index as isize);
        let (width, height) = request.target.fit(page_size, request.part);
        let full_width = (width as f32 / request.part.width_fraction()).round() as i32;

        let config = PdfRenderConfig::new()
            .set_target_width(full_width.max(1))
            .set_target_height(height as i32)
            .set_text_smoothing(self.hints.text_antialiasing)
            .set_path_smoothing(self.hints.path_antialiasing)
            .set_image_smoothing(self.hints.image_smoothing);
        let bitmap = page
            .render_with_config(&config)
            .map_err(|err| anyhow!("pdfium failed: {err}"))?;
        let image = crop_part(bitmap.as_image().to_rgba8(), request.part);

        Ok(RenderedImage {
            page_index: request.page_index,
            part: request.part,
            width: image.width(),
            height: image.height(),
            pixels: image.into_raw(),
        })
    }
}

impl DocumentBackend for PdfiumDocument {
    fn index(&self) -> &DocumentIndex {
        &self.index
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn render_page(&self, request: RenderRequest) -> Result<RenderedImage, RenderError> {
        let image = self
            .with_document(|document| self.render_internal(document, &request))
            .map_err(|err| RenderError::new(request.page_index, format!("{err:#}")))?;
        debug!(
            page = request.page_index,
            width = image.width,
            height = image.height,
            "rendered page"
        );
        Ok(image)
    }
}

/// Cuts the horizontal span of `part` out of a full-page bitmap.
fn crop_part(image: RgbaImage, part: PagePart) -> RgbaImage {
    if part == PagePart::Whole {
        return image;
    }
    let (start, end) = part.horizontal_span();
    let full = image.width() as f32;
    let x = (full * start).round() as u32;
    let width = ((full * end).round() as u32).saturating_sub(x).max(1);
    let x = x.min(image.width().saturating_sub(1));
    let width = width.min(image.width() - x);
    imageops::crop_imm(&image, x, 0, width, image.height()).to_image()
}

fn bind_pdfium_from_build_hint() -> Option<Pdfium> {
    match option_env!("PRESENTER_PDFIUM_LIBRARY_PATH") {
        Some(path) if !path.is_empty() => match Pdfium::bind_to_library(path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!(path, %err, "failed to load pdfium from build-provided path");
                None
            }
        },
        _ => None,
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let local = Pdfium::pdfium_platform_library_name_at_path("./");
    let local_err = match Pdfium::bind_to_library(&local) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => err,
    };

    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|system_err| {
            anyhow!(
                "failed to bind to a pdfium library; ensure it is installed ({}: {local_err}, system: {system_err})",
                local.display()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use image::Rgba;

    fn credentials(user: &str, owner: &str) -> Credentials {
        Credentials {
            user: user.to_string(),
            owner: owner.to_string(),
        }
    }

    #[test]
    fn password_candidates_follow_credentials() {
        assert_eq!(password_candidates(None), vec![None]);
        assert_eq!(password_candidates(Some(&credentials("", ""))), vec![None]);

        let both = credentials("reader", "author");
        assert_eq!(
            password_candidates(Some(&both)),
            vec![Some("reader"), Some("author")]
        );
        let owner_only = credentials("", "author");
        assert_eq!(password_candidates(Some(&owner_only)), vec![Some("author")]);
    }

    fn striped(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        })
    }

    #[test]
    fn whole_page_is_not_cropped() {
        let image = crop_part(striped(10, 4), PagePart::Whole);
        assert_eq!(image.dimensions(), (10, 4));
    }

    #[test]
    fn halves_keep_their_side() {
        let left = crop_part(striped(10, 4), PagePart::LeftHalf);
        assert_eq!(left.dimensions(), (5, 4));
        assert!(left.pixels().all(|p| p.0 == [0, 0, 0, 255]));

        let right = crop_part(striped(10, 4), PagePart::RightHalf);
        assert_eq!(right.dimensions(), (5, 4));
        assert!(right.pixels().all(|p| p.0 == [255, 255, 255, 255]));
    }

    #[test]
    fn odd_widths_do_not_overflow() {
        let right = crop_part(striped(7, 2), PagePart::RightHalf);
        assert!(right.width() >= 3 && right.width() <= 4);
        assert_eq!(right.height(), 2);
    }
}
