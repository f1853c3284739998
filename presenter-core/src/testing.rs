use std::collections::HashSet;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::document::{DocumentIndex, DocumentInfo, DocumentMetadata, PageMeta, PageSize};
use crate::error::RenderError;
use crate::render::{DocumentBackend, PagePart, RenderRequest, RenderTarget, RenderedImage, ViewTargets};
use crate::worker::RenderedPage;
use crate::DocumentId;

pub(crate) struct FakeBackend {
    index: DocumentIndex,
    failing: HashSet<usize>,
    renders: Mutex<Vec<RenderRequest>>,
}

impl FakeBackend {
    pub(crate) fn with_pages(count: usize) -> Self {
        let labels: Vec<String> = (1..=count).map(|n| n.to_string()).collect();
        let labels: Vec<&str> = labels.iter().map(String::as_str).collect();
        Self::with_labels(&labels)
    }

    pub(crate) fn with_labels(labels: &[&str]) -> Self {
        let pages = labels
            .iter()
            .map(|label| PageMeta::new(PageSize::new(40.0, 30.0), *label, None))
            .collect();
        let index = DocumentIndex::new(
            DocumentInfo {
                id: DocumentId::nil(),
                path: PathBuf::from("/tmp/fake.pdf"),
                page_count: 0,
                metadata: DocumentMetadata::default(),
            },
            pages,
            Vec::new(),
        )
        .expect("fake document has pages");

        Self {
            index,
            failing: HashSet::new(),
            renders: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_on(mut self, pages: &[usize]) -> Self {
        self.failing.extend(pages.iter().copied());
        self
    }

    pub(crate) fn rendered_pages(&self) -> Vec<usize> {
        self.renders.lock().iter().map(|r| r.page_index).collect()
    }

    pub(crate) fn requests(&self) -> Vec<RenderRequest> {
        self.renders.lock().clone()
    }
}

impl DocumentBackend for FakeBackend {
    fn index(&self) -> &DocumentIndex {
        &self.index
    }

    fn render_page(&self, request: RenderRequest) -> Result<RenderedImage, RenderError> {
        self.renders.lock().push(request);
        if self.failing.contains(&request.page_index) {
            return Err(RenderError::new(request.page_index, "corrupt content stream"));
        }

        let size = self.index.page_size(request.page_index as isize);
        let (width, height) = request.target.fit(size, request.part);
        Ok(RenderedImage {
            page_index: request.page_index,
            part: request.part,
            width,
            height,
            pixels: vec![request.page_index as u8; width as usize * height as usize * 4],
        })
    }
}

pub(crate) fn targets(width: u32, height: u32) -> ViewTargets {
    ViewTargets {
        slide: RenderTarget::new(width, height),
        notes: None,
        thumbnail: None,
        part: PagePart::Whole,
    }
}

/// A rendered page whose slide image is exactly `width` x `height` pixels.
pub(crate) fn rendered(page_index: usize, targets: ViewTargets) -> RenderedPage {
    RenderedPage {
        page_index,
        targets,
        slide: RenderedImage::placeholder(
            page_index,
            targets.part,
            targets.slide.width,
            targets.slide.height,
        ),
        notes: None,
        thumbnail: None,
    }
}
