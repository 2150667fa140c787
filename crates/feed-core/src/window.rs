use crate::cursor::PageRequest;
use crate::{FeedItem, Page};
use std::collections::VecDeque;

/// Insert `item` at the head of a newest-first list bounded by `capacity`,
/// dropping the oldest element when the list is full. Returns what fell off.
pub fn merge<T>(list: &mut Vec<T>, item: T, capacity: usize) -> Option<T> {
    if capacity == 0 {
        return Some(item);
    }
    let evicted = if list.len() >= capacity {
        list.truncate(capacity);
        list.pop()
    } else {
        None
    };
    list.insert(0, item);
    evicted
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome<T> {
    Merged { evicted: Option<T> },
    Duplicate,
    NotFirstPage,
    Held,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied { replayed: usize },
    Stale,
}

/// A list screen's visible window: the last REST page plus every live item
/// merged on top of it.
///
/// Live items are merged only while the head of the feed is displayed. A
/// fetch started with [`FeedWindow::begin_fetch`] holds live items until its
/// page lands, then replays them; responses from superseded fetches are
/// discarded.
#[derive(Debug, Clone)]
pub struct FeedWindow<T> {
    capacity: usize,
    items: Vec<T>,
    has_before: bool,
    has_after: bool,
    generation: Generation,
    latest: Generation,
    in_flight: bool,
    held: VecDeque<T>,
}

impl<T: FeedItem> FeedWindow<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Vec::new(),
            has_before: false,
            has_after: false,
            generation: Generation::default(),
            latest: Generation::default(),
            in_flight: false,
            held: VecDeque::new(),
        }
    }

    /// An empty window positioned where `request` points, before its page
    /// has arrived. Anything but the first page ignores live items.
    pub fn for_request(request: &PageRequest, capacity: usize) -> Self {
        let mut window = Self::new(capacity);
        window.has_before = !request.is_first();
        window
    }

    pub fn from_page(page: Page<T>, capacity: usize) -> Self {
        let mut window = Self::new(capacity);
        window.install(page);
        window
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn has_before(&self) -> bool {
        self.has_before
    }

    pub fn has_after(&self) -> bool {
        self.has_after
    }

    pub fn is_first_page(&self) -> bool {
        !self.has_before
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn fetch_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|item| item.id() == id)
    }

    pub fn begin_fetch(&mut self) -> Generation {
        self.latest = Generation(self.latest.0 + 1);
        self.in_flight = true;
        self.latest
    }

    pub fn complete_fetch(&mut self, generation: Generation, page: Page<T>) -> FetchOutcome {
        if generation != self.latest {
            return FetchOutcome::Stale;
        }
        self.install(page);
        self.generation = generation;
        self.in_flight = false;
        FetchOutcome::Applied {
            replayed: self.replay_held(),
        }
    }

    pub fn fail_fetch(&mut self, generation: Generation) -> FetchOutcome {
        if generation != self.latest {
            return FetchOutcome::Stale;
        }
        self.in_flight = false;
        FetchOutcome::Applied {
            replayed: self.replay_held(),
        }
    }

    pub fn apply_live(&mut self, item: T) -> MergeOutcome<T> {
        if self.in_flight {
            self.held.push_back(item);
            // Only the newest `capacity` items could ever become visible.
            while self.held.len() > self.capacity {
                self.held.pop_front();
            }
            return MergeOutcome::Held;
        }
        self.merge_live(item)
    }

    fn merge_live(&mut self, item: T) -> MergeOutcome<T> {
        if self.has_before {
            return MergeOutcome::NotFirstPage;
        }
        if self.contains(item.id()) {
            return MergeOutcome::Duplicate;
        }
        let was_full = self.items.len() == self.capacity;
        let evicted = merge(&mut self.items, item, self.capacity);
        self.has_after = self.has_after || was_full;
        MergeOutcome::Merged { evicted }
    }

    fn install(&mut self, page: Page<T>) {
        let mut items = page.items;
        items.truncate(self.capacity);
        self.items = items;
        self.has_before = page.has_before;
        self.has_after = page.has_after;
    }

    fn replay_held(&mut self) -> usize {
        let mut replayed = 0;
        while let Some(item) = self.held.pop_front() {
            if matches!(self.merge_live(item), MergeOutcome::Merged { .. }) {
                replayed += 1;
            }
        }
        replayed
    }
}
