use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::document::{Credentials, DocumentIndex, PageSize};
use crate::error::{DocumentError, RenderError};

/// Horizontal crop applied to every page, for PDFs that carry slide and notes
/// side by side.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum PagePart {
    #[default]
    Whole,
    LeftHalf,
    RightHalf,
}

impl PagePart {
    /// The half holding the other content of a side-by-side page.
    pub fn opposite(self) -> Self {
        match self {
            PagePart::Whole => PagePart::Whole,
            PagePart::LeftHalf => PagePart::RightHalf,
            PagePart::RightHalf => PagePart::LeftHalf,
        }
    }

    /// Horizontal span of the page covered by this part, as fractions of its width.
    pub fn horizontal_span(self) -> (f32, f32) {
        match self {
            PagePart::Whole => (0.0, 1.0),
            PagePart::LeftHalf => (0.0, 0.5),
            PagePart::RightHalf => (0.5, 1.0),
        }
    }

    pub fn width_fraction(self) -> f32 {
        let (start, end) = self.horizontal_span();
        end - start
    }
}

/// Pixel box an image has to fit into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenderTarget {
    pub width: u32,
    pub height: u32,
}

impl RenderTarget {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }

    /// Largest pixel size with the aspect ratio of `page` (cropped to `part`)
    /// that fits inside this box.
    pub fn fit(&self, page: PageSize, part: PagePart) -> (u32, u32) {
        let page_width = page.width * part.width_fraction();
        let page_height = page.height;
        if !(page_width > 0.0 && page_height > 0.0) {
            return (self.width.max(1), self.height.max(1));
        }

        let scale = (self.width as f32 / page_width).min(self.height as f32 / page_height);
        let width = (page_width * scale).round().max(1.0) as u32;
        let height = (page_height * scale).round().max(1.0) as u32;
        (width.min(self.width.max(1)), height.min(self.height.max(1)))
    }
}

/// Pixel boxes for every image a cache entry holds. Any change invalidates the
/// whole cache because each image is rendered for exactly one box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewTargets {
    pub slide: RenderTarget,
    pub notes: Option<RenderTarget>,
    pub thumbnail: Option<RenderTarget>,
    pub part: PagePart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderRequest {
    pub page_index: usize,
    pub target: RenderTarget,
    pub part: PagePart,
}

/// Owned RGBA pixels of one rendered page. Immutable once produced.
#[derive(Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub page_index: usize,
    pub part: PagePart,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RenderedImage {
    pub const BYTES_PER_PIXEL: usize = 4;

    /// Opaque white image shown in place of a page that failed to render.
    pub fn placeholder(page_index: usize, part: PagePart, width: u32, height: u32) -> Self {
        let len = width as usize * height as usize * Self::BYTES_PER_PIXEL;
        Self {
            page_index,
            part,
            width,
            height,
            pixels: vec![255; len],
        }
    }

    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * Self::BYTES_PER_PIXEL
    }
}

impl std::fmt::Debug for RenderedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderedImage")
            .field("page_index", &self.page_index)
            .field("part", &self.part)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// A loaded document that can rasterize its pages.
///
/// `render_page` must be callable from the UI thread and the cache worker at
/// the same time; implementations serialize access internally when the
/// underlying library needs it.
pub trait DocumentBackend: Send + Sync {
    fn index(&self) -> &DocumentIndex;
    fn render_page(&self, request: RenderRequest) -> Result<RenderedImage, RenderError>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(
        &self,
        path: &Path,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn DocumentBackend>, DocumentError>;
}

/// Renders a page, clamping the index into range and substituting a blank
/// placeholder when the page content is broken.
pub fn render_or_placeholder(
    backend: &dyn DocumentBackend,
    page_index: usize,
    target: RenderTarget,
    part: PagePart,
) -> RenderedImage {
    let index = backend.index();
    let page_index = index.clamp_index(page_index);
    let request = RenderRequest {
        page_index,
        target,
        part,
    };

    match backend.render_page(request) {
        Ok(image) => image,
        Err(err) => {
            warn!(
                page = page_index,
                path = %index.info().path.display(),
                %err,
                "substituting placeholder for page that failed to render"
            );
            let (width, height) = target.fit(index.page_size(page_index as isize), part);
            RenderedImage::placeholder(page_index, part, width, height)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_preserves_aspect_ratio_inside_box() {
        let target = RenderTarget::new(1920, 1080);
        let four_by_three = PageSize::new(400.0, 300.0);
        assert_eq!(target.fit(four_by_three, PagePart::Whole), (1440, 1080));

        let sixteen_by_nine = PageSize::new(1600.0, 900.0);
        assert_eq!(target.fit(sixteen_by_nine, PagePart::Whole), (1920, 1080));
    }

    #[test]
    fn fit_uses_half_width_for_split_pages() {
        let target = RenderTarget::new(1000, 1000);
        let dual = PageSize::new(800.0, 300.0);
        let (width, height) = target.fit(dual, PagePart::LeftHalf);
        assert_eq!((width, height), (1000, 750));
        assert_eq!(
            target.fit(dual, PagePart::RightHalf),
            target.fit(dual, PagePart::LeftHalf)
        );
    }

    #[test]
    fn fit_falls_back_to_box_for_degenerate_pages() {
        let target = RenderTarget::new(640, 480);
        assert_eq!(target.fit(PageSize::new(0.0, 10.0), PagePart::Whole), (640, 480));
    }

    #[test]
    fn placeholder_is_opaque_white() {
        let image = RenderedImage::placeholder(3, PagePart::Whole, 2, 3);
        assert_eq!(image.pixels.len(), image.byte_size());
        assert_eq!(image.byte_size(), 2 * 3 * RenderedImage::BYTES_PER_PIXEL);
        assert!(image.pixels.iter().all(|&b| b == 255));
    }

    #[test]
    fn opposite_part_swaps_halves() {
        assert_eq!(PagePart::LeftHalf.opposite(), PagePart::RightHalf);
        assert_eq!(PagePart::RightHalf.opposite(), PagePart::LeftHalf);
        assert_eq!(PagePart::Whole.opposite(), PagePart::Whole);
    }
}
