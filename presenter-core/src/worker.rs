//! Background worker that renders pages ahead of need, one at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use flume::{Receiver, Sender};
use tracing::{debug, warn};

use crate::cache::CacheView;
use crate::document::DocumentIndex;
use crate::render::{
    render_or_placeholder, DocumentBackend, PagePart, RenderTarget, RenderedImage, ViewTargets,
};

/// One queued render. `generation` is unique per job handed out by the
/// cache, so a late answer to an older job for the same page is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderJob {
    pub page_index: usize,
    pub targets: ViewTargets,
    pub generation: u64,
}

/// All images produced for one page, handed from the worker to the UI thread.
#[derive(Debug)]
pub struct RenderedPage {
    pub page_index: usize,
    pub targets: ViewTargets,
    pub slide: RenderedImage,
    pub notes: Option<RenderedImage>,
    pub thumbnail: Option<RenderedImage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OutsideWindow,
    AlreadyCached,
    StaleTarget,
}

#[derive(Debug)]
pub enum WorkerMessage {
    Rendered(RenderedPage),
    Skipped { job: RenderJob, reason: SkipReason },
}

#[derive(Debug)]
enum WorkerRequest {
    Render(RenderJob),
    Shutdown,
}

/// The presentation document plus the optional notes document.
pub struct PageSources {
    presentation: Arc<dyn DocumentBackend>,
    notes: Option<Arc<dyn DocumentBackend>>,
}

impl PageSources {
    pub fn new(
        presentation: Arc<dyn DocumentBackend>,
        notes: Option<Arc<dyn DocumentBackend>>,
    ) -> Self {
        Self {
            presentation,
            notes,
        }
    }

    pub fn index(&self) -> &DocumentIndex {
        self.presentation.index()
    }

    pub fn notes_index(&self) -> Option<&DocumentIndex> {
        self.notes.as_deref().map(DocumentBackend::index)
    }

    /// Renders every image a cache entry needs for `page_index`. Pages that
    /// fail to render come back as placeholders.
    pub fn render(&self, page_index: usize, targets: ViewTargets) -> RenderedPage {
        let page_index = self.index().clamp_index(page_index);
        let presentation = self.presentation.as_ref();

        let slide = render_or_placeholder(presentation, page_index, targets.slide, targets.part);
        let notes = targets
            .notes
            .and_then(|target| self.render_notes(page_index, target, targets.part));
        let thumbnail = targets
            .thumbnail
            .map(|target| render_or_placeholder(presentation, page_index, target, targets.part));

        RenderedPage {
            page_index,
            targets,
            slide,
            notes,
            thumbnail,
        }
    }

    fn render_notes(
        &self,
        page_index: usize,
        target: RenderTarget,
        part: PagePart,
    ) -> Option<RenderedImage> {
        match &self.notes {
            Some(notes) if page_index < notes.index().page_count() => Some(
                render_or_placeholder(notes.as_ref(), page_index, target, PagePart::Whole),
            ),
            Some(_) => None,
            // Side-by-side documents carry the notes in the other half.
            None if part != PagePart::Whole => Some(render_or_placeholder(
                self.presentation.as_ref(),
                page_index,
                target,
                part.opposite(),
            )),
            None => None,
        }
    }
}

/// Handle to the single background render thread.
///
/// Jobs go in through an unbounded queue; finished pages and skip notices
/// come back on [`CacheWorker::completions`] in the order they were produced.
pub struct CacheWorker {
    requests: Sender<WorkerRequest>,
    completions: Receiver<WorkerMessage>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CacheWorker {
    pub fn spawn(sources: Arc<PageSources>, view: Arc<CacheView>) -> Result<Self> {
        let (request_tx, request_rx) = flume::unbounded();
        let (completion_tx, completion_rx) = flume::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("page-cache".to_string())
            .spawn(move || run(&sources, &view, request_rx, completion_tx, &worker_stop))
            .context("failed to spawn page cache worker")?;

        Ok(Self {
            requests: request_tx,
            completions: completion_rx,
            stop,
            handle: Some(handle),
        })
    }

    /// Queues a job. Returns `false` once the worker has stopped.
    pub fn enqueue(&self, job: RenderJob) -> bool {
        self.requests.send(WorkerRequest::Render(job)).is_ok()
    }

    pub fn completions(&self) -> &Receiver<WorkerMessage> {
        &self.completions
    }

    /// Stops after the render in progress, if any, and joins the thread.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.requests.send(WorkerRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("page cache worker panicked");
            }
        }
    }
}

impl Drop for CacheWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    sources: &PageSources,
    view: &CacheView,
    requests: Receiver<WorkerRequest>,
    completions: Sender<WorkerMessage>,
    stop: &AtomicBool,
) {
    for request in requests.iter() {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let job = match request {
            WorkerRequest::Render(job) => job,
            WorkerRequest::Shutdown => break,
        };

        let message = match view.skip_reason(&job) {
            Some(reason) => {
                debug!(page = job.page_index, ?reason, "skipping queued render");
                WorkerMessage::Skipped { job, reason }
            }
            None => {
                debug!(page = job.page_index, "rendering page ahead of need");
                WorkerMessage::Rendered(sources.render(job.page_index, job.targets))
            }
        };

        if completions.send(message).is_err() {
            break;
        }
    }
    debug!("page cache worker stopped");
}
