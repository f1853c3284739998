use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use flume::Receiver;
use tracing::{debug, instrument};

use crate::cache::{InsertOutcome, PageCache};
use crate::config::SessionConfig;
use crate::document::DocumentIndex;
use crate::render::{RenderedImage, ViewTargets};
use crate::worker::{CacheWorker, PageSources, WorkerMessage};

pub type SubscriberId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PageChanged { page: usize },
    /// A background render landed in the cache. `displayed` is set when it
    /// is the page on screen, or the one previewed as next.
    PageRendered {
        page: usize,
        displayed: bool,
        slide: Arc<RenderedImage>,
        notes: Option<Arc<RenderedImage>>,
    },
    CacheInvalidated,
}

type Subscriber = Box<dyn FnMut(&SessionEvent) + Send>;

/// Fans each session event out to every registered subscriber, in
/// registration order.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<(SubscriberId, Subscriber)>,
    next_id: SubscriberId,
}

impl EventBus {
    pub fn subscribe(
        &mut self,
        subscriber: impl FnMut(&SessionEvent) + Send + 'static,
    ) -> SubscriberId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, Box::new(subscriber)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(existing, _)| *existing != id);
        self.subscribers.len() != before
    }

    pub fn publish(&mut self, event: &SessionEvent) {
        for (_, subscriber) in &mut self.subscribers {
            subscriber(event);
        }
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    NextPage { count: usize },
    PrevPage { count: usize },
    GotoPage { page: isize },
    FirstPage,
    LastPage,
    NextSlide,
    PreviousSlideEnd,
    /// Drops every cached image and shows the current page again.
    Refresh,
    Resize { targets: ViewTargets },
}

/// What the presenter screen needs for the current page.
#[derive(Debug, Clone)]
pub struct DisplayedPage {
    pub page_index: usize,
    pub label: String,
    pub slide: Arc<RenderedImage>,
    pub notes: Option<Arc<RenderedImage>>,
    /// Preview of the following page, once it has been rendered.
    pub next: Option<Arc<RenderedImage>>,
}

pub struct PresentationSession {
    config: SessionConfig,
    sources: Arc<PageSources>,
    cache: PageCache,
    worker: CacheWorker,
    current_page: Option<usize>,
    events: EventBus,
}

impl PresentationSession {
    pub fn new(config: SessionConfig, sources: PageSources) -> Result<Self> {
        let sources = Arc::new(sources);
        let cache = PageCache::new(
            config.cache,
            config.view_targets(),
            sources.index().page_count(),
        );
        let worker = CacheWorker::spawn(Arc::clone(&sources), cache.view())?;
        Ok(Self {
            config,
            sources,
            cache,
            worker,
            current_page: None,
            events: EventBus::default(),
        })
    }

    pub fn index(&self) -> &DocumentIndex {
        self.sources.index()
    }

    pub fn notes_index(&self) -> Option<&DocumentIndex> {
        self.sources.notes_index()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn current_page(&self) -> Option<usize> {
        self.current_page
    }

    /// Raw worker output, for callers that want to block on it themselves.
    pub fn completions(&self) -> &Receiver<WorkerMessage> {
        self.worker.completions()
    }

    pub fn subscribe(
        &mut self,
        subscriber: impl FnMut(&SessionEvent) + Send + 'static,
    ) -> SubscriberId {
        self.events.subscribe(subscriber)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Shows `page` (clamped), queueing its neighbours for the worker. A cache
    /// miss on the page itself is rendered here, on the calling thread.
    #[instrument(skip(self))]
    pub fn show_page(&mut self, page: isize) -> DisplayedPage {
        let page = self.index().clamp(page);
        self.current_page = Some(page);
        self.cache.set_active(page);

        let jobs = self.cache.request_range(page, self.config.prefetch_radius);
        for job in jobs.iter().filter(|job| job.page_index != page) {
            if !self.worker.enqueue(*job) {
                debug!(page = job.page_index, "worker stopped, dropping prefetch");
                self.cache.release_pending(job);
            }
        }

        if !self.cache.contains(page) {
            debug!(page, "cache miss, rendering synchronously");
            let rendered = self.sources.render(page, self.cache.targets());
            self.cache.insert(rendered);
        }

        self.events.publish(&SessionEvent::PageChanged { page });
        self.displayed_page(page)
    }

    pub fn displayed(&self) -> Option<DisplayedPage> {
        let page = self.current_page?;
        self.cache.contains(page).then(|| self.displayed_page(page))
    }

    /// Applies every finished worker message without blocking.
    pub fn poll_completions(&mut self) -> Vec<SessionEvent> {
        let messages: Vec<WorkerMessage> = self.worker.completions().try_iter().collect();
        self.apply_messages(messages)
    }

    /// Waits up to `timeout` for the first worker message, then applies it and
    /// everything else already queued.
    pub fn wait_for_completions(&mut self, timeout: Duration) -> Vec<SessionEvent> {
        let Ok(first) = self.worker.completions().recv_timeout(timeout) else {
            return Vec::new();
        };
        let mut messages = vec![first];
        messages.extend(self.worker.completions().try_iter());
        self.apply_messages(messages)
    }

    pub fn apply(&mut self, command: Command) -> DisplayedPage {
        let current = self.current_page.unwrap_or(0);
        let step = |count: usize| isize::try_from(count).unwrap_or(isize::MAX);
        let target = match command {
            Command::NextPage { count } => (current as isize).saturating_add(step(count)),
            Command::PrevPage { count } => (current as isize).saturating_sub(step(count)),
            Command::GotoPage { page } => page,
            Command::FirstPage => 0,
            Command::LastPage => self.index().page_count() as isize - 1,
            Command::NextSlide => self.index().next_slide_start(current) as isize,
            Command::PreviousSlideEnd => self.index().previous_slide_end(current) as isize,
            Command::Refresh => {
                self.invalidate();
                current as isize
            }
            Command::Resize { targets } => {
                self.resize(targets);
                current as isize
            }
        };
        self.show_page(target)
    }

    /// Switches to new view sizes; a real change empties the cache.
    pub fn resize(&mut self, targets: ViewTargets) {
        if self.cache.set_targets(targets) {
            self.config.views.slide = targets.slide;
            self.config.views.notes = targets.notes;
            self.config.views.thumbnail = targets.thumbnail;
            self.config.page_part = targets.part;
            self.events.publish(&SessionEvent::CacheInvalidated);
        }
    }

    pub fn invalidate(&mut self) {
        self.cache.invalidate(None);
        self.events.publish(&SessionEvent::CacheInvalidated);
    }

    fn apply_messages(&mut self, messages: Vec<WorkerMessage>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for message in messages {
            match message {
                WorkerMessage::Rendered(rendered) => {
                    let page = rendered.page_index;
                    if self.cache.insert(rendered) == InsertOutcome::Stale {
                        continue;
                    }
                    // Evicted straight away when it fell outside the budget.
                    let Some(entry) = self.cache.entry(page) else {
                        continue;
                    };
                    let displayed = self
                        .current_page
                        .is_some_and(|current| page == current || page == current + 1);
                    events.push(SessionEvent::PageRendered {
                        page,
                        displayed,
                        slide: Arc::clone(&entry.slide),
                        notes: entry.notes.clone(),
                    });
                }
                WorkerMessage::Skipped { job, reason } => {
                    debug!(page = job.page_index, ?reason, "worker skipped render");
                    self.cache.release_pending(&job);
                }
            }
        }
        for event in &events {
            self.events.publish(event);
        }
        events
    }

    fn displayed_page(&self, page: usize) -> DisplayedPage {
        let slide = match self.cache.entry(page) {
            Some(entry) => Arc::clone(&entry.slide),
            None => Arc::new(self.sources.render(page, self.cache.targets()).slide),
        };
        let notes = self
            .cache
            .entry(page)
            .and_then(|entry| entry.notes.clone());
        let next = (page + 1 < self.index().page_count())
            .then(|| self.cache.entry(page + 1))
            .flatten()
            .map(|entry| entry.thumbnail.clone().unwrap_or_else(|| Arc::clone(&entry.slide)));

        DisplayedPage {
            page_index: page,
            label: self.index().label(page).to_string(),
            slide,
            notes,
            next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::time::Instant;

    use parking_lot::Mutex;

    use crate::config::CacheLimits;
    use crate::document::{load_document, Credentials, PasswordPrompt};
    use crate::error::DocumentError;
    use crate::render::{DocumentBackend, DocumentProvider, PagePart, RenderTarget};
    use crate::testing::FakeBackend;

    fn small_config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.views.slide = RenderTarget::new(8, 6);
        config.views.notes = None;
        config.prefetch_radius = 2;
        config
    }

    fn session_with(backend: Arc<FakeBackend>, config: SessionConfig) -> PresentationSession {
        PresentationSession::new(config, PageSources::new(backend, None)).unwrap()
    }

    fn drain_until(session: &mut PresentationSession, done: impl Fn(&PageCache) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(session.cache()) {
            assert!(Instant::now() < deadline, "worker did not finish in time");
            session.wait_for_completions(Duration::from_millis(50));
        }
    }

    #[test]
    fn show_page_clamps_and_renders_current_page() {
        let backend = Arc::new(FakeBackend::with_pages(6));
        let mut session = session_with(backend, small_config());

        let shown = session.show_page(-3);
        assert_eq!(shown.page_index, 0);
        assert_eq!(shown.label, "1");

        let shown = session.show_page(40);
        assert_eq!(shown.page_index, 5);
        assert_eq!(shown.slide.page_index, 5);
        assert!(shown.next.is_none());
        assert!(session.cache().contains(5));
    }

    #[test]
    fn cache_miss_is_rendered_before_returning() {
        let backend = Arc::new(FakeBackend::with_pages(20));
        let mut session = session_with(Arc::clone(&backend), small_config());

        let shown = session.show_page(7);
        assert_eq!(shown.slide.page_index, 7);
        assert_eq!((shown.slide.width, shown.slide.height), (8, 6));
        assert!(shown.slide.pixels.iter().all(|&b| b == 7));
        assert!(backend.rendered_pages().contains(&7));
        assert_eq!(session.displayed().map(|d| d.page_index), Some(7));
    }

    #[test]
    fn worker_fills_neighbouring_pages() {
        let backend = Arc::new(FakeBackend::with_pages(20));
        let mut session = session_with(backend, small_config());

        session.show_page(10);
        drain_until(&mut session, |cache| (8..=12).all(|p| cache.contains(p)));

        assert_eq!(session.cache().cached_range(), Some(8..=12));
        let next = session.displayed().and_then(|d| d.next).unwrap();
        assert_eq!(next.page_index, 11);
    }

    #[test]
    fn entry_budget_keeps_closest_pages() {
        let backend = Arc::new(FakeBackend::with_pages(30));
        let mut config = small_config();
        config.cache = CacheLimits {
            max_entries: 3,
            ..CacheLimits::default()
        };
        config.prefetch_radius = 5;
        let mut session = session_with(backend, config);

        session.show_page(10);
        drain_until(&mut session, |cache| {
            cache.len() == 3 && cache.contains(11) && cache.contains(9)
        });

        assert_eq!(session.cache().cached_pages(), vec![9, 10, 11]);
    }

    #[test]
    fn every_subscriber_sees_events() {
        let backend = Arc::new(FakeBackend::with_pages(4));
        let mut session = session_with(backend, small_config());

        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&first);
        session.subscribe(move |event| sink.lock().push(event.clone()));
        let sink = Arc::clone(&second);
        let id = session.subscribe(move |event| sink.lock().push(event.clone()));

        session.show_page(1);
        assert!(session.unsubscribe(id));
        session.show_page(2);

        assert_eq!(
            first
                .lock()
                .iter()
                .filter(|e| matches!(e, SessionEvent::PageChanged { .. }))
                .count(),
            2
        );
        assert_eq!(
            second.lock().as_slice(),
            &[SessionEvent::PageChanged { page: 1 }]
        );
    }

    #[test]
    fn resize_invalidates_cached_pages() {
        let backend = Arc::new(FakeBackend::with_pages(10));
        let mut session = session_with(backend, small_config());
        session.show_page(4);
        drain_until(&mut session, |cache| cache.contains(5));

        let mut targets = session.cache().targets();
        targets.slide = RenderTarget::new(16, 12);
        let shown = session.apply(Command::Resize { targets });

        assert_eq!((shown.slide.width, shown.slide.height), (16, 12));
        let stale = session
            .cache()
            .entry(5)
            .is_some_and(|entry| entry.targets() != targets);
        assert!(!stale);
        assert_eq!(session.config().views.slide, RenderTarget::new(16, 12));
    }

    #[test]
    fn refresh_drops_cache_and_redraws() {
        let backend = Arc::new(FakeBackend::with_pages(10));
        let mut session = session_with(Arc::clone(&backend), small_config());
        session.show_page(3);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        session.subscribe(move |event| sink.lock().push(event.clone()));
        let shown = session.apply(Command::Refresh);

        assert_eq!(shown.page_index, 3);
        assert_eq!(
            events.lock()[..2],
            [
                SessionEvent::CacheInvalidated,
                SessionEvent::PageChanged { page: 3 }
            ]
        );
    }

    #[test]
    fn navigation_commands_follow_labels() {
        let backend = Arc::new(FakeBackend::with_labels(&["A", "A", "B", "B", "B", "C"]));
        let mut session = session_with(backend, small_config());
        session.show_page(0);

        assert_eq!(session.apply(Command::NextSlide).page_index, 2);
        assert_eq!(session.apply(Command::NextSlide).page_index, 5);
        assert_eq!(session.apply(Command::PreviousSlideEnd).page_index, 4);
        assert_eq!(session.apply(Command::PreviousSlideEnd).page_index, 1);
        assert_eq!(session.apply(Command::NextPage { count: 3 }).page_index, 4);
        assert_eq!(session.apply(Command::PrevPage { count: 9 }).page_index, 0);
        assert_eq!(session.apply(Command::LastPage).page_index, 5);
        assert_eq!(session.apply(Command::FirstPage).page_index, 0);
        assert_eq!(session.apply(Command::GotoPage { page: 99 }).page_index, 5);
    }

    struct FakeProvider {
        pages: usize,
    }

    #[async_trait::async_trait]
    impl DocumentProvider for FakeProvider {
        async fn open(
            &self,
            _path: &Path,
            _credentials: Option<&Credentials>,
        ) -> Result<Arc<dyn DocumentBackend>, DocumentError> {
            Ok(Arc::new(FakeBackend::with_pages(self.pages)))
        }
    }

    struct NoPrompt;

    impl PasswordPrompt for NoPrompt {
        fn credentials(&self, _path: &Path) -> anyhow::Result<Credentials> {
            anyhow::bail!("no password expected")
        }
    }

    #[tokio::test]
    async fn session_runs_on_loaded_documents_with_notes() {
        let slides_path = Path::new("/tmp/talk.pdf");
        let notes_path = Path::new("/tmp/notes.pdf");
        let slides = load_document(&FakeProvider { pages: 8 }, slides_path, &NoPrompt)
            .await
            .unwrap();
        let notes = load_document(&FakeProvider { pages: 3 }, notes_path, &NoPrompt)
            .await
            .unwrap();

        let mut config = small_config();
        config.views.notes = Some(RenderTarget::new(4, 3));
        let mut session =
            PresentationSession::new(config, PageSources::new(slides, Some(notes))).unwrap();

        assert_eq!(session.notes_index().map(DocumentIndex::page_count), Some(3));
        assert!(session.show_page(2).notes.is_some());
        assert!(session.show_page(6).notes.is_none());
    }

    #[test]
    fn rendered_events_carry_image_handles() {
        let backend = Arc::new(FakeBackend::with_pages(10));
        let mut session = session_with(backend, small_config());

        let rendered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&rendered);
        session.subscribe(move |event| {
            if let SessionEvent::PageRendered {
                page,
                displayed,
                slide,
                ..
            } = event
            {
                sink.lock().push((*page, *displayed, Arc::clone(slide)));
            }
        });

        session.show_page(4);
        drain_until(&mut session, |cache| (2..=6).all(|p| cache.contains(p)));

        let rendered = rendered.lock();
        assert_eq!(rendered.len(), 4);
        for (page, displayed, slide) in rendered.iter() {
            assert_eq!(slide.page_index, *page);
            assert_eq!(*displayed, *page == 5);
            let cached = session.cache().get(*page, PagePart::Whole).unwrap();
            assert!(Arc::ptr_eq(slide, &cached));
        }
    }

    #[test]
    fn stepping_back_reuses_cached_neighbour() {
        let backend = Arc::new(FakeBackend::with_pages(30));
        let mut session = session_with(Arc::clone(&backend), small_config());

        session.show_page(10);
        drain_until(&mut session, |cache| (8..=12).all(|p| cache.contains(p)));
        session.apply(Command::NextPage { count: 1 });
        drain_until(&mut session, |cache| cache.contains(13));

        let before = backend.rendered_pages().len();
        let shown = session.apply(Command::PrevPage { count: 1 });

        assert_eq!(shown.page_index, 10);
        assert!(session.cache().contains(8));
        assert_eq!(backend.rendered_pages().len(), before);
    }
}
