//! Rendered-page store bounded by an entry count and a byte budget.
//!
//! The cache is owned by the UI thread. The background worker only sees a
//! published [`CacheView`] which it consults before starting a render.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::CacheLimits;
use crate::render::{PagePart, RenderedImage, ViewTargets};
use crate::worker::{RenderJob, RenderedPage, SkipReason};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheKey {
    pub page_index: usize,
    pub part: PagePart,
}

/// Images for one page. Buffers are shared, never copied, once cached.
#[derive(Debug)]
pub struct CacheEntry {
    pub slide: Arc<RenderedImage>,
    pub notes: Option<Arc<RenderedImage>>,
    pub thumbnail: Option<Arc<RenderedImage>>,
    targets: ViewTargets,
    bytes: usize,
}

impl CacheEntry {
    fn from_rendered(page: RenderedPage) -> Self {
        let bytes = page.slide.byte_size()
            + page.notes.as_ref().map_or(0, RenderedImage::byte_size)
            + page.thumbnail.as_ref().map_or(0, RenderedImage::byte_size);
        Self {
            slide: Arc::new(page.slide),
            notes: page.notes.map(Arc::new),
            thumbnail: page.thumbnail.map(Arc::new),
            targets: page.targets,
            bytes,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    pub fn targets(&self) -> ViewTargets {
        self.targets
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Uncached,
    Pending,
    Cached,
    Evicted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An older image of the same page was replaced.
    Replaced,
    /// Rendered for view targets that are no longer current; dropped.
    Stale,
}

#[derive(Debug, Default)]
struct ViewState {
    window: Option<RangeInclusive<usize>>,
    targets: Option<ViewTargets>,
    cached: HashSet<usize>,
}

/// Read-only snapshot of the cache shared with the worker thread.
#[derive(Debug, Default)]
pub struct CacheView {
    state: RwLock<ViewState>,
}

impl CacheView {
    /// Why `job` should not be rendered any more, if it should not.
    pub fn skip_reason(&self, job: &RenderJob) -> Option<SkipReason> {
        let state = self.state.read();
        if state.targets != Some(job.targets) {
            return Some(SkipReason::StaleTarget);
        }
        if let Some(window) = &state.window {
            if !window.contains(&job.page_index) {
                return Some(SkipReason::OutsideWindow);
            }
        }
        if state.cached.contains(&job.page_index) {
            return Some(SkipReason::AlreadyCached);
        }
        None
    }

    pub fn window(&self) -> Option<RangeInclusive<usize>> {
        self.state.read().window.clone()
    }
}

/// Pages in the order they should be rendered: `center`, then alternating
/// outward (`center + 1`, `center - 1`, `center + 2`, ...), within `[0, page_count)`.
pub fn priority_order(center: usize, radius: usize, page_count: usize) -> Vec<usize> {
    if page_count == 0 {
        return Vec::new();
    }
    let center = center.min(page_count - 1);
    let mut order = vec![center];
    for offset in 1..=radius {
        let after = center.checked_add(offset).filter(|&p| p < page_count);
        let before = center.checked_sub(offset);
        if after.is_none() && before.is_none() {
            break;
        }
        order.extend(after);
        order.extend(before);
    }
    order
}

pub struct PageCache {
    entries: BTreeMap<CacheKey, CacheEntry>,
    /// The job currently responsible for each page that is not cached yet.
    pending: HashMap<usize, RenderJob>,
    evicted: HashSet<usize>,
    /// Recency stamp of the last time each page was declared needed; higher
    /// means more recently, and the center of a request gets the highest.
    declared: HashMap<usize, u64>,
    next_stamp: u64,
    next_generation: u64,
    limits: CacheLimits,
    targets: ViewTargets,
    page_count: usize,
    bytes_used: usize,
    center: usize,
    active: Option<usize>,
    window: Option<RangeInclusive<usize>>,
    view: Arc<CacheView>,
}

impl PageCache {
    pub fn new(limits: CacheLimits, targets: ViewTargets, page_count: usize) -> Self {
        let cache = Self {
            entries: BTreeMap::new(),
            pending: HashMap::new(),
            evicted: HashSet::new(),
            declared: HashMap::new(),
            next_stamp: 1,
            next_generation: 1,
            limits,
            targets,
            page_count: page_count.max(1),
            bytes_used: 0,
            center: 0,
            active: None,
            window: None,
            view: Arc::new(CacheView::default()),
        };
        cache.publish();
        cache
    }

    pub fn view(&self) -> Arc<CacheView> {
        Arc::clone(&self.view)
    }

    pub fn limits(&self) -> CacheLimits {
        self.limits
    }

    pub fn targets(&self) -> ViewTargets {
        self.targets
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn center(&self) -> usize {
        self.center
    }

    pub fn window(&self) -> Option<RangeInclusive<usize>> {
        self.window.clone()
    }

    fn clamp(&self, page: usize) -> usize {
        page.min(self.page_count - 1)
    }

    fn key(&self, page: usize) -> CacheKey {
        CacheKey {
            page_index: self.clamp(page),
            part: self.targets.part,
        }
    }

    /// Slide image of `page`, if cached. Never blocks.
    pub fn get(&self, page: usize, part: PagePart) -> Option<Arc<RenderedImage>> {
        let key = CacheKey {
            page_index: self.clamp(page),
            part,
        };
        self.entries.get(&key).map(|entry| Arc::clone(&entry.slide))
    }

    pub fn entry(&self, page: usize) -> Option<&CacheEntry> {
        self.entries.get(&self.key(page))
    }

    pub fn contains(&self, page: usize) -> bool {
        self.entries.contains_key(&self.key(page))
    }

    pub fn cached_pages(&self) -> Vec<usize> {
        self.entries.keys().map(|key| key.page_index).collect()
    }

    pub fn state(&self, page: usize) -> PageState {
        let page = self.clamp(page);
        if self.contains(page) {
            PageState::Cached
        } else if self.is_pending(page) {
            PageState::Pending
        } else if self.evicted.contains(&page) {
            PageState::Evicted
        } else {
            PageState::Uncached
        }
    }

    /// Contiguous run of cached pages around the displayed page (or the last
    /// requested center when nothing is displayed).
    pub fn cached_range(&self) -> Option<RangeInclusive<usize>> {
        let anchor = self.active.unwrap_or(self.center);
        if !self.contains(anchor) {
            return None;
        }
        let mut first = anchor;
        while first > 0 && self.contains(first - 1) {
            first -= 1;
        }
        let mut last = anchor;
        while last + 1 < self.page_count && self.contains(last + 1) {
            last += 1;
        }
        Some(first..=last)
    }

    fn is_pending(&self, page: usize) -> bool {
        self.pending
            .get(&page)
            .is_some_and(|job| job.targets == self.targets)
    }

    /// Marks the page currently on screen; it is never evicted while active.
    pub fn set_active(&mut self, page: usize) {
        self.active = Some(self.clamp(page));
    }

    pub fn active(&self) -> Option<usize> {
        self.active
    }

    /// Declares that pages within `radius` of `center` should be cached and
    /// returns render jobs for the ones that are neither cached nor pending,
    /// nearest first. The window never holds more pages than the entry budget.
    pub fn request_range(&mut self, center: usize, radius: usize) -> Vec<RenderJob> {
        let center = self.clamp(center);
        let mut order = priority_order(center, radius, self.page_count);
        order.truncate(self.limits.max_entries.max(1));

        let first = order.iter().copied().min().unwrap_or(center);
        let last = order.iter().copied().max().unwrap_or(center);
        self.center = center;
        self.window = Some(first..=last);
        // The worker skips jobs outside the window, so they no longer count.
        self.pending.retain(|page, _| (first..=last).contains(page));

        self.declared.clear();
        let base = self.next_stamp;
        self.next_stamp += order.len() as u64 + 1;

        let mut jobs = Vec::new();
        for (rank, &page) in order.iter().enumerate() {
            self.declared.insert(page, base + (order.len() - rank) as u64);
            if self.contains(page) || self.is_pending(page) {
                continue;
            }
            let job = RenderJob {
                page_index: page,
                targets: self.targets,
                generation: self.next_generation,
            };
            self.next_generation += 1;
            self.pending.insert(page, job);
            self.evicted.remove(&page);
            jobs.push(job);
        }

        self.evict();
        self.publish();
        debug!(
            center,
            first,
            last,
            queued = jobs.len(),
            cached = self.entries.len(),
            "declared cache window"
        );
        jobs
    }

    /// Stores a finished render and enforces the budget.
    pub fn insert(&mut self, rendered: RenderedPage) -> InsertOutcome {
        let page = self.clamp(rendered.page_index);
        if rendered.targets != self.targets {
            if self
                .pending
                .get(&page)
                .is_some_and(|job| job.targets == rendered.targets)
            {
                self.pending.remove(&page);
            }
            debug!(page, "dropping render made for outdated view size");
            return InsertOutcome::Stale;
        }

        self.pending.remove(&page);
        self.evicted.remove(&page);

        let key = self.key(page);
        let entry = CacheEntry::from_rendered(rendered);
        self.bytes_used += entry.bytes;
        let outcome = match self.entries.insert(key, entry) {
            Some(previous) => {
                self.bytes_used -= previous.bytes;
                InsertOutcome::Replaced
            }
            None => InsertOutcome::Inserted,
        };

        self.evict();
        self.publish();
        outcome
    }

    /// Forgets a pending render that the worker decided not to perform.
    /// Ignored when the page has since been handed to a newer job.
    pub fn release_pending(&mut self, job: &RenderJob) {
        if self.pending.get(&job.page_index) == Some(job) {
            self.pending.remove(&job.page_index);
        }
    }

    /// Drops one page, or every page when `page` is `None`.
    pub fn invalidate(&mut self, page: Option<usize>) {
        match page {
            Some(page) => {
                let key = self.key(page);
                if let Some(entry) = self.entries.remove(&key) {
                    self.bytes_used -= entry.bytes;
                }
            }
            None => {
                self.entries.clear();
                self.evicted.clear();
                self.bytes_used = 0;
            }
        }
        self.publish();
    }

    /// Switches to new view sizes. Every cached image is tied to one size, so
    /// any change empties the cache and forgets pending renders.
    pub fn set_targets(&mut self, targets: ViewTargets) -> bool {
        if targets == self.targets {
            return false;
        }
        self.targets = targets;
        self.pending.clear();
        self.invalidate(None);
        debug!(?targets, "view targets changed, cache invalidated");
        true
    }

    fn over_budget(&self) -> bool {
        self.entries.len() > self.limits.max_entries || self.bytes_used > self.limits.max_bytes
    }

    /// While over budget, drops the page farthest from the center, the least
    /// recently needed one first on ties. Pages outside the window rank behind
    /// every window page at the same distance. The displayed page is never
    /// dropped, and a lone entry larger than the byte budget is kept.
    pub fn evict(&mut self) -> Vec<usize> {
        let mut removed = Vec::new();

        while self.entries.len() > 1 && self.over_budget() {
            let center = self.center;
            let victim = self
                .entries
                .keys()
                .filter(|key| Some(key.page_index) != self.active)
                .max_by_key(|key| {
                    let stamp = self.declared.get(&key.page_index).copied().unwrap_or(0);
                    (key.page_index.abs_diff(center), Reverse(stamp))
                })
                .copied();
            let Some(key) = victim else {
                break;
            };
            self.remove(&key);
            removed.push(key.page_index);
        }

        if !removed.is_empty() {
            debug!(?removed, bytes = self.bytes_used, "evicted cached pages");
        }
        removed
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.bytes_used -= entry.bytes;
            self.evicted.insert(key.page_index);
        }
    }

    fn publish(&self) {
        let mut state = self.view.state.write();
        state.window = self.window.clone();
        state.targets = Some(self.targets);
        state.cached = self.entries.keys().map(|key| key.page_index).collect();
    }
}
