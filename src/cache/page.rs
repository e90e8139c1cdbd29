//! A single size-bounded window of items anchored after a predecessor cursor.
//!
//! A page owns its live subscription. Snapshots from the subscription are
//! forwarded to the registered change handler as [`PageEvent`]s tagged with
//! the page's current generation; the owner applies them with
//! [`Page::apply_delivery`], so deliveries from a torn-down subscription can
//! be recognised and dropped. Generations come from a [`Generations`] counter
//! shared by every page of a chain, so a page rebuilt at the same index never
//! reuses a tag that is still in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::error::CacheError;
use crate::query::CanonicalQuery;
use crate::store::{
    Cursor, Item, RangeQuery, RemoteCollection, StoreError, Subscription, SubscriptionGuard,
};

/// Lifecycle of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    NotLoaded,
    Loading,
    /// Loaded and consistent with its predecessor.
    Stable,
    /// Loaded, but an upstream boundary moved since.
    Stale,
    Reloading,
}

/// Items plus the boundary cursor they imply. Always replaced as a unit.
#[derive(Debug, Clone)]
pub struct PageContent {
    items: Arc<[Item]>,
    boundary: Option<Cursor>,
}

impl PageContent {
    fn new(items: Vec<Item>, query: &CanonicalQuery) -> Self {
        let boundary = items.last().map(|item| query.cursor_of(item));
        Self {
            items: items.into(),
            boundary,
        }
    }

    fn empty() -> Self {
        Self {
            items: Arc::from(Vec::new()),
            boundary: None,
        }
    }

    pub fn items(&self) -> &Arc<[Item]> {
        &self.items
    }

    /// Cursor of the last item, `None` if the page is empty.
    pub fn boundary(&self) -> Option<&Cursor> {
        self.boundary.as_ref()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Event forwarded from a page's live subscription.
#[derive(Debug)]
pub enum PageEvent {
    Delivered {
        index: usize,
        generation: u64,
        items: Vec<Item>,
    },
    Failed {
        index: usize,
        generation: u64,
        error: StoreError,
    },
}

/// Receiver side of a page's live deliveries.
pub type ChangeHandler = mpsc::Sender<PageEvent>;

/// Result of applying a delivery or reloading a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageChange {
    pub boundary_changed: bool,
}

/// Source of subscription generations for one chain. Values never repeat.
#[derive(Debug, Clone, Default)]
pub struct Generations(Arc<AtomicU64>);

impl Generations {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

struct LiveFeed {
    forwarder: Option<JoinHandle<()>>,
    _guard: SubscriptionGuard,
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        // Stop forwarding before the guard unsubscribes.
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

pub struct Page {
    index: usize,
    query: Arc<CanonicalQuery>,
    page_size: usize,
    predecessor: Option<Cursor>,
    content: PageContent,
    state: PageState,
    generation: u64,
    generations: Generations,
    handler: Option<ChangeHandler>,
    live: Option<LiveFeed>,
}

impl Page {
    /// A not-yet-loaded page. `predecessor` must be `None` only for page 1.
    pub fn new(
        index: usize,
        query: Arc<CanonicalQuery>,
        page_size: usize,
        predecessor: Option<Cursor>,
        generations: Generations,
    ) -> Self {
        Self {
            index,
            query,
            page_size,
            predecessor,
            content: PageContent::empty(),
            state: PageState::NotLoaded,
            generation: generations.next(),
            generations,
            handler: None,
            live: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn predecessor(&self) -> Option<&Cursor> {
        self.predecessor.as_ref()
    }

    pub fn content(&self) -> &PageContent {
        &self.content
    }

    /// Loaded and consistent with the chain; safe to serve.
    pub fn is_fresh(&self) -> bool {
        self.state == PageState::Stable
    }

    /// Fewer items than the page size: nothing follows this page.
    pub fn is_short(&self) -> bool {
        self.content.len() < self.page_size
    }

    pub fn is_subscribed(&self) -> bool {
        self.live.is_some()
    }

    /// Register where live deliveries go. Takes effect from the next load.
    pub fn on_change(&mut self, handler: ChangeHandler) {
        self.handler = Some(handler);
    }

    fn range(&self) -> RangeQuery {
        RangeQuery::page(Arc::clone(&self.query), self.predecessor.clone(), self.page_size)
    }

    /// Subscribe to the page's range, then fetch it.
    ///
    /// On failure the page is left `NotLoaded` with no subscription; its
    /// previous content is kept only so a later reload can tell whether the
    /// boundary moved.
    pub async fn load(&mut self, store: &dyn RemoteCollection) -> Result<&PageContent, CacheError> {
        if self.live.is_some() {
            self.teardown();
        }
        if self.state != PageState::Reloading {
            self.state = PageState::Loading;
        }
        let range = self.range();

        let subscription = match store.subscribe(&range).await {
            Ok(subscription) => subscription,
            Err(error) => {
                self.state = PageState::NotLoaded;
                return Err(CacheError::Subscription(error));
            }
        };
        let items = match store.range_query(&range).await {
            Ok(items) => items,
            Err(error) => {
                // Dropping the subscription unsubscribes it.
                self.state = PageState::NotLoaded;
                return Err(CacheError::Fetch(error));
            }
        };

        self.content = PageContent::new(items, &self.query);
        self.install(subscription);
        self.state = PageState::Stable;

        debug!(
            page = self.index,
            items = self.content.len(),
            generation = self.generation,
            "Page loaded"
        );
        Ok(&self.content)
    }

    /// Tear down the subscription and reload anchored at `predecessor`.
    pub async fn reset_cursor(
        &mut self,
        predecessor: Option<Cursor>,
        store: &dyn RemoteCollection,
    ) -> Result<PageChange, CacheError> {
        self.teardown();
        self.predecessor = predecessor;
        self.state = PageState::Reloading;

        let previous = self.content.boundary.clone();
        let content = self.load(store).await?;
        Ok(PageChange {
            boundary_changed: content.boundary.as_ref() != previous.as_ref(),
        })
    }

    /// Apply a live snapshot.
    ///
    /// Returns `None` when the delivery is ignored: it belongs to an older
    /// subscription, the page is not stable, or nothing changed.
    pub fn apply_delivery(&mut self, generation: u64, items: Vec<Item>) -> Option<PageChange> {
        if generation != self.generation || self.state != PageState::Stable {
            return None;
        }
        if *self.content.items == items[..] {
            return None;
        }

        let previous = self.content.boundary.take();
        self.content = PageContent::new(items, &self.query);
        Some(PageChange {
            boundary_changed: self.content.boundary != previous,
        })
    }

    /// The live subscription for `generation` broke. Returns whether it was current.
    pub fn fail(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.teardown();
        self.state = PageState::NotLoaded;
        true
    }

    pub fn mark_stale(&mut self) {
        if self.state == PageState::Stable {
            self.state = PageState::Stale;
        }
    }

    fn teardown(&mut self) {
        self.live = None;
        self.generation = self.generations.next();
    }

    fn install(&mut self, subscription: Subscription) {
        let Subscription { mut updates, guard } = subscription;
        let forwarder = self.handler.clone().map(|handler| {
            let (index, generation) = (self.index, self.generation);
            tokio::spawn(async move {
                // The first snapshot replays the range as of subscribe time,
                // which may predate the fetch that just replaced the content.
                let mut replayed = false;
                while let Some(delivery) = updates.recv().await {
                    let (event, closing) = match delivery {
                        Ok(_) if !replayed => {
                            replayed = true;
                            continue;
                        }
                        Ok(items) => (
                            PageEvent::Delivered {
                                index,
                                generation,
                                items,
                            },
                            false,
                        ),
                        Err(error) => (
                            PageEvent::Failed {
                                index,
                                generation,
                                error,
                            },
                            true,
                        ),
                    };
                    if handler.send(event).await.is_err() || closing {
                        return;
                    }
                }
                let _ = handler
                    .send(PageEvent::Failed {
                        index,
                        generation,
                        error: StoreError::SubscriptionClosed,
                    })
                    .await;
            })
        });

        self.live = Some(LiveFeed {
            forwarder,
            _guard: guard,
        });
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("items", &self.content.len())
            .field("generation", &self.generation)
            .finish()
    }
}
