//! Page manager: the ordered cursor chain of pages for one query.
//!
//! The manager is the central coordinator for a fingerprint. It:
//! - Backfills pages 1..N so that page N can be anchored after page N-1
//! - Applies live deliveries and cascades boundary changes downstream
//! - Discovers the total page count lazily with single-item probes
//!
//! Every operation on one chain runs inside a single task ([`PageManager::spawn`])
//! that drains a command queue and the pages' delivery queue one message at a
//! time, so a caller-triggered load and a subscription-triggered cascade can
//! never interleave. Different managers run independently.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cache::error::CacheError;
use crate::cache::page::{Generations, Page, PageEvent};
use crate::cache::update::{Notifier, PageUpdate};
use crate::metrics::CacheMetrics;
use crate::query::{CanonicalQuery, Fingerprint, QueryDescriptor};
use crate::store::{Cursor, Item, RemoteCollection};

/// An immutable view of one cached page handed back to callers.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub page: usize,
    pub items: Arc<[Item]>,
    /// Known total page count, `None` while unknown.
    pub length: Option<usize>,
}

/// Outcome of [`PageManager::load`].
#[derive(Debug, Clone)]
pub enum Loaded {
    Page(PageSnapshot),
    /// The page lies beyond the proven end of the result set.
    PastEnd { length: usize },
}

impl Loaded {
    pub fn into_page(self) -> Option<PageSnapshot> {
        match self {
            Loaded::Page(snapshot) => Some(snapshot),
            Loaded::PastEnd { .. } => None,
        }
    }
}

/// Work item for a manager task.
#[derive(Debug)]
pub enum Command {
    Load {
        page: usize,
        reply: oneshot::Sender<Result<Loaded, CacheError>>,
    },
    Get {
        page: usize,
        reply: oneshot::Sender<Option<PageSnapshot>>,
    },
    AllItems {
        reply: oneshot::Sender<Result<Option<Vec<Item>>, CacheError>>,
    },
}

pub struct PageManager {
    fingerprint: Fingerprint,
    descriptor: Arc<QueryDescriptor>,
    query: Arc<CanonicalQuery>,
    page_size: usize,
    store: Arc<dyn RemoteCollection>,

    /// `pages[i]` is page `i + 1`; always a contiguous prefix of the chain.
    pages: Vec<Page>,

    /// Total number of pages with items, once proven by a probe.
    known_length: Option<usize>,

    /// Shared by every page ever built for this chain.
    generations: Generations,

    events_tx: mpsc::Sender<PageEvent>,
    /// Taken by the run loop.
    events_rx: Option<mpsc::Receiver<PageEvent>>,
    notifier: Notifier,
    metrics: Arc<CacheMetrics>,
}

impl PageManager {
    pub fn new(
        descriptor: Arc<QueryDescriptor>,
        query: Arc<CanonicalQuery>,
        page_size: usize,
        store: Arc<dyn RemoteCollection>,
        notifier: Notifier,
        metrics: Arc<CacheMetrics>,
        queue_capacity: usize,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            fingerprint: query.fingerprint().clone(),
            descriptor,
            query,
            page_size,
            store,
            pages: Vec::new(),
            known_length: None,
            generations: Generations::new(),
            events_tx,
            events_rx: Some(events_rx),
            notifier,
            metrics,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn known_length(&self) -> Option<usize> {
        self.known_length
    }

    /// Number of pages currently in the chain, fresh or not.
    pub fn cached_pages(&self) -> usize {
        self.pages.len()
    }

    /// The cached page if present and fresh. No I/O.
    pub fn get(&self, page: usize) -> Option<PageSnapshot> {
        let cached = self.pages.get(page.checked_sub(1)?)?;
        cached.is_fresh().then(|| self.snapshot(page))
    }

    /// Ensure pages 1..=page are loaded and fresh, then return page `page`.
    ///
    /// A page beyond the proven end of the result set comes back as
    /// [`Loaded::PastEnd`] with the length proven by this same call.
    pub async fn load(&mut self, page: usize) -> Result<Loaded, CacheError> {
        if page == 0 {
            return Err(CacheError::InvalidPage);
        }

        if let Some(length) = self.known_length {
            if page > length {
                // Re-check the tail: items may have appeared since the length was proven.
                self.refresh_through(length).await?;
                if self.known_length == Some(length) {
                    self.probe_length().await?;
                }
                if let Some(past_end) = self.past_end(page) {
                    return Ok(past_end);
                }
            }
        }

        let was_fresh = self.pages.get(page - 1).is_some_and(Page::is_fresh);
        self.refresh_through(page).await?;
        if let Some(past_end) = self.past_end(page) {
            return Ok(past_end);
        }

        if self.pages.len() == page {
            self.probe_length().await?;
        } else if was_fresh {
            self.metrics.cache_hits.inc();
        }

        debug!(
            fingerprint = %self.fingerprint,
            page,
            known_length = ?self.known_length,
            "Page served"
        );
        Ok(Loaded::Page(self.snapshot(page)))
    }

    fn past_end(&self, page: usize) -> Option<Loaded> {
        match self.known_length {
            Some(length) if page > length => Some(Loaded::PastEnd { length }),
            _ => None,
        }
    }

    /// Concatenation of pages 1..=length once the length is known.
    ///
    /// Returns `None` while the length is unknown: a partial chain cannot be
    /// trusted to be complete.
    pub async fn all_items(&mut self) -> Result<Option<Vec<Item>>, CacheError> {
        let Some(length) = self.known_length else {
            return Ok(None);
        };

        if self.pages.iter().any(|page| !page.is_fresh()) {
            self.refresh_through(length).await?;
            if self.known_length == Some(length) {
                self.probe_length().await?;
            }
        }

        let Some(length) = self.known_length else {
            return Ok(None);
        };
        let items = self
            .pages
            .iter()
            .take(length)
            .flat_map(|page| page.content().items().iter().cloned())
            .collect();
        Ok(Some(items))
    }

    /// Run the manager on its own task and return the handle to its queue.
    pub fn spawn(self, queue_capacity: usize) -> ManagerHandle {
        let (commands_tx, commands_rx) = mpsc::channel(queue_capacity.max(1));
        let handle = ManagerHandle {
            fingerprint: self.fingerprint.clone(),
            commands: commands_tx,
        };
        tokio::spawn(self.run(commands_rx));
        handle
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let Some(mut events) = self.events_rx.take() else {
            return;
        };
        self.metrics.managers.inc();
        debug!(fingerprint = %self.fingerprint, page_size = self.page_size, "Page manager started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        self.metrics.managers.dec();
        debug!(fingerprint = %self.fingerprint, "Page manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Load { page, reply } => {
                let result = self.load(page).await;
                let _ = reply.send(result);
            }
            Command::Get { page, reply } => {
                let _ = reply.send(self.get(page));
            }
            Command::AllItems { reply } => {
                let result = self.all_items().await;
                let _ = reply.send(result);
            }
        }
    }

    /// Apply a live delivery and cascade if the page boundary moved.
    pub async fn handle_event(&mut self, event: PageEvent) {
        match event {
            PageEvent::Delivered {
                index,
                generation,
                items,
            } => {
                let Some(page) = index.checked_sub(1).and_then(|i| self.pages.get_mut(i)) else {
                    return;
                };
                let Some(change) = page.apply_delivery(generation, items) else {
                    return;
                };
                self.metrics.live_deliveries.inc();

                if self.pages[index - 1].content().is_empty() {
                    self.cap_at(index - 1);
                    self.emit_empty(index).await;
                    return;
                }
                if !change.boundary_changed {
                    self.emit(index).await;
                    return;
                }

                self.known_length = None;
                self.emit(index).await;
                if let Err(error) = self.cascade(index).await {
                    warn!(
                        fingerprint = %self.fingerprint,
                        page = index,
                        "Cascade aborted: {error}"
                    );
                }
            }
            PageEvent::Failed {
                index,
                generation,
                error,
            } => {
                let Some(page) = index.checked_sub(1).and_then(|i| self.pages.get_mut(i)) else {
                    return;
                };
                if page.fail(generation) {
                    self.metrics.subscription_failures.inc();
                    warn!(
                        fingerprint = %self.fingerprint,
                        page = index,
                        "Live subscription lost, page will reload on next access: {error}"
                    );
                }
            }
        }
    }

    /// Reload every cached page after `from`, in ascending order, then re-probe.
    ///
    /// Once the probe proves the length, the last page is announced again
    /// carrying it.
    async fn cascade(&mut self, from: usize) -> Result<(), CacheError> {
        let last = self.pages.len();
        if from < last {
            self.metrics.cascades.inc();
            info!(
                fingerprint = %self.fingerprint,
                from,
                pages = last - from,
                "Cascading boundary change"
            );

            for page in &mut self.pages[from..] {
                page.mark_stale();
            }

            let store = Arc::clone(&self.store);
            for index in from + 1..=last {
                let predecessor = self.boundary_of(index - 1);
                self.metrics.range_fetches.inc();
                self.pages[index - 1]
                    .reset_cursor(predecessor, store.as_ref())
                    .await?;
                self.metrics.page_reloads.inc();

                if self.pages[index - 1].content().is_empty() {
                    self.cap_at(index - 1);
                    self.emit_empty(index).await;
                    return Ok(());
                }
                self.emit(index).await;
            }
        }

        self.probe_length().await?;
        if self.known_length.is_some() {
            self.emit(self.pages.len()).await;
        }
        Ok(())
    }

    /// Load or re-freshen pages 1..=target in ascending order.
    ///
    /// Stops early, capping the length, at the first page that comes back empty.
    async fn refresh_through(&mut self, target: usize) -> Result<(), CacheError> {
        let store = Arc::clone(&self.store);

        for index in 1..=target {
            let predecessor = self.boundary_of(index - 1);
            if let Some(page) = self.pages.get_mut(index - 1) {
                if page.is_fresh() {
                    continue;
                }
                self.metrics.range_fetches.inc();
                let change = page.reset_cursor(predecessor, store.as_ref()).await?;
                if change.boundary_changed && index < self.pages.len() {
                    self.known_length = None;
                    for later in &mut self.pages[index..] {
                        later.mark_stale();
                    }
                }
            } else {
                let mut page = Page::new(
                    index,
                    Arc::clone(&self.query),
                    self.page_size,
                    predecessor,
                    self.generations.clone(),
                );
                page.on_change(self.events_tx.clone());
                self.metrics.range_fetches.inc();
                page.load(store.as_ref()).await?;
                self.pages.push(page);
            }

            if self.pages[index - 1].content().is_empty() {
                self.cap_at(index - 1);
                return Ok(());
            }
        }
        Ok(())
    }

    /// Probe one item past the last cached page to settle the length.
    async fn probe_length(&mut self) -> Result<(), CacheError> {
        let last = self.pages.len();
        let after = self.boundary_of(last);
        self.metrics.probes.inc();

        let next = self
            .store
            .probe_one(&self.query, after.as_ref())
            .await
            .map_err(CacheError::Fetch)?;

        let previous = self.known_length;
        self.known_length = match next {
            None => Some(last),
            Some(_) => None,
        };
        if previous != self.known_length {
            debug!(
                fingerprint = %self.fingerprint,
                known_length = ?self.known_length,
                "Length probe settled"
            );
        }
        Ok(())
    }

    /// Proven end of data at `length`: drop every page above it.
    fn cap_at(&mut self, length: usize) {
        self.known_length = Some(length);
        if self.pages.len() > length {
            debug!(
                fingerprint = %self.fingerprint,
                length,
                dropped = self.pages.len() - length,
                "Empty page caps the chain"
            );
            self.pages.truncate(length);
        }
    }

    fn boundary_of(&self, page: usize) -> Option<Cursor> {
        let index = page.checked_sub(1)?;
        self.pages.get(index)?.content().boundary().cloned()
    }

    fn snapshot(&self, page: usize) -> PageSnapshot {
        PageSnapshot {
            page,
            items: Arc::clone(self.pages[page - 1].content().items()),
            length: self.known_length,
        }
    }

    async fn emit(&self, page: usize) {
        let items = self.pages[page - 1].content().items().to_vec();
        self.notify(page, items).await;
    }

    async fn emit_empty(&self, page: usize) {
        self.notify(page, Vec::new()).await;
    }

    async fn notify(&self, page: usize, items: Vec<Item>) {
        self.notifier
            .emit(PageUpdate {
                query: (*self.descriptor).clone(),
                fingerprint: self.fingerprint.clone(),
                page_size: self.page_size,
                page,
                items,
                length: self.known_length,
            })
            .await;
    }
}

/// Cheap, cloneable front of a running [`PageManager`].
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    fingerprint: Fingerprint,
    commands: mpsc::Sender<Command>,
}

impl ManagerHandle {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CacheError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CacheError::ManagerClosed(self.fingerprint.clone()))?;
        response
            .await
            .map_err(|_| CacheError::ManagerClosed(self.fingerprint.clone()))
    }

    pub async fn load(&self, page: usize) -> Result<Loaded, CacheError> {
        self.request(|reply| Command::Load { page, reply }).await?
    }

    pub async fn get(&self, page: usize) -> Result<Option<PageSnapshot>, CacheError> {
        self.request(|reply| Command::Get { page, reply }).await
    }

    pub async fn all_items(&self) -> Result<Option<Vec<Item>>, CacheError> {
        self.request(|reply| Command::AllItems { reply }).await?
    }
}
