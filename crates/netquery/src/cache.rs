//! The keyed store behind all queries.
//!
//! A [`QueryCache`] holds one slot per [`QueryKey`]. Each slot carries the [`CacheEntry`] that
//! consumers observe, the marker of a fetch that is currently in flight for that key, and a
//! [`watch`] channel through which every change of the entry is pushed to its
//! [`Subscription`]s.
//!
//! Slots are evicted once they have been without subscribers for their grace period
//! ([`Timing::gc_time`]). Eviction happens through a timer task when a tokio runtime is
//! available, and lazily on the next access of the key otherwise.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::Shared;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::QueryConfig;
use crate::error::QueryResponse;
use crate::key::QueryKey;
use crate::utils::futures::CallOnDrop;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Nothing has been fetched yet.
    Idle,
    /// A fetch is in flight.
    Loading,
    /// The last fetch succeeded.
    Success,
    /// The last fetch failed.
    Error,
}

/// The cached state of a single query.
///
/// `data` always holds the last successfully fetched payload, also while a refetch is loading
/// or after a refetch failed.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub data: Option<T>,
    pub status: QueryStatus,
    pub success: bool,
    pub error_code: Option<i64>,
    pub error_msg: Option<String>,
    /// When the last successful fetch settled.
    pub last_updated: Option<Instant>,
    /// Set by [`QueryCache::invalidate`], cleared by the next successful fetch.
    pub invalidated: bool,
    subscribers: usize,
    gc_at: Option<Instant>,
}

impl<T> CacheEntry<T> {
    fn new() -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            success: false,
            error_code: None,
            error_msg: None,
            last_updated: None,
            invalidated: false,
            subscribers: 0,
            gc_at: None,
        }
    }

    /// The number of live [`Subscription`]s of this entry.
    pub fn subscribers(&self) -> usize {
        self.subscribers
    }

    /// When this entry will be evicted, if it is currently unobserved.
    pub fn gc_at(&self) -> Option<Instant> {
        self.gc_at
    }

    /// Whether this entry can be served without fetching, for a caller that considers data
    /// stale after `stale_time`.
    ///
    /// Only successful entries are ever fresh. Failed entries are retried on the next access,
    /// and invalidated ones until a fetch succeeded again. Staleness is decided by each caller,
    /// so a caller with a shorter stale time never makes the entry stale for others.
    pub fn is_fresh(&self, now: Instant, stale_time: Option<Duration>) -> bool {
        if self.status != QueryStatus::Success || self.invalidated {
            return false;
        }
        match (stale_time, self.last_updated) {
            (None, _) => true,
            (Some(stale_time), Some(last_updated)) => last_updated
                .checked_add(stale_time)
                .is_none_or(|stale_at| now < stale_at),
            (Some(_), None) => false,
        }
    }

    pub(crate) fn to_response(&self) -> QueryResponse<T>
    where
        T: Clone,
    {
        QueryResponse {
            data: self.data.clone(),
            success: self.success,
            error_code: self.error_code,
            error_msg: self.error_msg.clone(),
        }
    }

    fn is_collectable(&self, now: Instant) -> bool {
        self.subscribers == 0 && self.gc_at.is_some_and(|gc_at| now >= gc_at)
    }
}

/// How long results of a query stay fresh, and how long they are retained without subscribers.
///
/// `None` means "forever" for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub stale_time: Option<Duration>,
    pub gc_time: Option<Duration>,
}

impl From<QueryConfig> for Timing {
    fn from(config: QueryConfig) -> Self {
        Self {
            stale_time: config.stale_time,
            gc_time: config.gc_time,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        QueryConfig::default().into()
    }
}

/// The longer of two grace periods, where `None` (never) is the longest.
fn longest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    }
}

/// The shared outcome of an in-flight fetch.
pub(crate) type FetchChannel<T> = Shared<oneshot::Receiver<QueryResponse<T>>>;

struct InFlight<T> {
    id: u64,
    channel: FetchChannel<T>,
}

struct Slot<T> {
    entry: CacheEntry<T>,
    in_flight: Option<InFlight<T>>,
    gc_time: Option<Duration>,
    sender: watch::Sender<CacheEntry<T>>,
}

impl<T: Clone> Slot<T> {
    fn new(gc_time: Option<Duration>) -> Self {
        let entry = CacheEntry::new();
        let (sender, _) = watch::channel(entry.clone());
        Self {
            entry,
            in_flight: None,
            gc_time,
            sender,
        }
    }

    /// Pushes the current entry to all subscribers.
    fn publish(&self) {
        self.sender.send_replace(self.entry.clone());
    }

    /// Arms eviction of this slot if nothing observes or fetches it anymore.
    ///
    /// A grace period reaching past the end of time never arms.
    fn arm_gc(&mut self, now: Instant) -> Gc {
        if self.entry.subscribers > 0 || self.in_flight.is_some() {
            return Gc::Keep;
        }
        let Some(gc_time) = self.gc_time else {
            return Gc::Keep;
        };
        if gc_time.is_zero() {
            return Gc::EvictNow;
        }
        match now.checked_add(gc_time) {
            Some(gc_at) => {
                self.entry.gc_at = Some(gc_at);
                self.publish();
                Gc::After(gc_time)
            }
            None => Gc::Keep,
        }
    }
}

enum Gc {
    Keep,
    EvictNow,
    After(Duration),
}

/// What [`QueryCache::begin_fetch`] decided.
pub(crate) enum Begin<T> {
    /// A fetch is already in flight, wait for it.
    Join(FetchChannel<T>),
    /// The entry is fresh.
    Cached(QueryResponse<T>),
    /// A new fetch was registered, the caller has to run it and settle it with `id`.
    Start {
        id: u64,
        sender: oneshot::Sender<QueryResponse<T>>,
        channel: FetchChannel<T>,
    },
}

struct Inner<T> {
    slots: Mutex<HashMap<QueryKey, Slot<T>>>,
    next_fetch_id: AtomicU64,
}

/// A keyed store of query results.
///
/// This is cheap to clone, clones share the same store.
pub struct QueryCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for QueryCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for QueryCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.inner.slots.lock().len())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for QueryCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> QueryCache<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                next_fetch_id: AtomicU64::new(0),
            }),
        }
    }

    /// Evicts the slot for `key` if its grace period elapsed. Returns whether it was evicted.
    fn evict_collectable(
        slots: &mut HashMap<QueryKey, Slot<T>>,
        key: &QueryKey,
        now: Instant,
    ) -> bool {
        let collectable = slots
            .get(key)
            .is_some_and(|slot| slot.in_flight.is_none() && slot.entry.is_collectable(now));
        if collectable {
            slots.remove(key);
            metric!(counter("query.evicted") += 1);
            tracing::trace!(%key, "evicted unobserved query");
        }
        collectable
    }

    /// Returns the slot for `key`, creating it if absent.
    ///
    /// A slot whose grace period already elapsed is replaced by a new one.
    fn slot_mut<'a>(
        slots: &'a mut HashMap<QueryKey, Slot<T>>,
        key: &QueryKey,
        now: Instant,
        gc_time: Option<Duration>,
    ) -> &'a mut Slot<T> {
        Self::evict_collectable(slots, key, now);

        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(gc_time));
        slot.gc_time = longest(slot.gc_time, gc_time);
        slot
    }

    /// Applies a [`Gc`] decision for `key`, returning the delay of a timer to spawn.
    fn apply_gc(
        slots: &mut HashMap<QueryKey, Slot<T>>,
        key: &QueryKey,
        gc: Gc,
    ) -> Option<Duration> {
        match gc {
            Gc::Keep => None,
            Gc::EvictNow => {
                slots.remove(key);
                metric!(counter("query.evicted") += 1);
                tracing::trace!(%key, "evicted unobserved query");
                None
            }
            Gc::After(delay) => Some(delay),
        }
    }

    fn spawn_gc_timer(&self, key: QueryKey, delay: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // Collected lazily on the next access instead.
            return;
        };
        let inner: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                QueryCache { inner }.collect(&key);
            }
        });
    }

    /// Evicts `key` if its grace period elapsed.
    fn collect(&self, key: &QueryKey) {
        let mut slots = self.inner.slots.lock();
        Self::evict_collectable(&mut slots, key, Instant::now());
    }

    /// Evicts all entries whose grace period elapsed.
    fn sweep(slots: &mut HashMap<QueryKey, Slot<T>>, now: Instant) {
        slots.retain(|_, slot| slot.in_flight.is_some() || !slot.entry.is_collectable(now));
    }

    /// Returns a snapshot of the entry for `key`.
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
        let mut slots = self.inner.slots.lock();
        if Self::evict_collectable(&mut slots, key, Instant::now()) {
            return None;
        }
        Some(slots.get(key)?.entry.clone())
    }

    /// Atomically reads and modifies the entry for `key`, creating it if absent.
    ///
    /// Subscribers are notified of the change. An entry created here is retained for the default
    /// grace period, existing entries keep theirs.
    pub fn upsert<R>(&self, key: &QueryKey, mutator: impl FnOnce(&mut CacheEntry<T>) -> R) -> R {
        let (result, timer) = {
            let mut slots = self.inner.slots.lock();
            let now = Instant::now();
            Self::evict_collectable(&mut slots, key, now);
            let gc_time = slots
                .get(key)
                .map_or(Timing::default().gc_time, |slot| slot.gc_time);
            let slot = Self::slot_mut(&mut slots, key, now, gc_time);
            let result = mutator(&mut slot.entry);
            slot.publish();
            let gc = match slot.entry.gc_at {
                Some(_) => Gc::Keep,
                None => slot.arm_gc(now),
            };
            (result, Self::apply_gc(&mut slots, key, gc))
        };
        if let Some(delay) = timer {
            self.spawn_gc_timer(key.clone(), delay);
        }
        result
    }

    /// Subscribes to `key` with the default timing.
    pub fn subscribe(&self, key: &QueryKey) -> Subscription<T> {
        self.subscribe_with(key, Timing::default())
    }

    /// Subscribes to `key`, keeping its entry alive at least for `timing.gc_time` after the last
    /// subscriber left.
    ///
    /// Subscribing to the idle key yields a subscription that never changes.
    pub fn subscribe_with(&self, key: &QueryKey, timing: Timing) -> Subscription<T> {
        if key.is_idle() {
            return Subscription::detached(key.clone(), CacheEntry::new());
        }

        let mut slots = self.inner.slots.lock();
        let slot = Self::slot_mut(&mut slots, key, Instant::now(), timing.gc_time);
        slot.entry.subscribers += 1;
        slot.entry.gc_at = None;
        slot.publish();
        let receiver = slot.sender.subscribe();

        let release = {
            let cache = self.clone();
            let key = key.clone();
            CallOnDrop::new(move || cache.release(&key))
        };

        Subscription {
            key: key.clone(),
            receiver,
            _guard: Guard::Release(release),
        }
    }

    /// Ends a subscription, same as dropping it.
    pub fn unsubscribe(&self, subscription: Subscription<T>) {
        drop(subscription);
    }

    fn release(&self, key: &QueryKey) {
        let timer = {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.get_mut(key) else {
                return;
            };
            slot.entry.subscribers = slot.entry.subscribers.saturating_sub(1);
            slot.publish();
            let gc = slot.arm_gc(Instant::now());
            Self::apply_gc(&mut slots, key, gc)
        };
        if let Some(delay) = timer {
            self.spawn_gc_timer(key.clone(), delay);
        }
    }

    /// Marks the entry for `key` as stale for every caller, keeping its data.
    ///
    /// The next access refetches. Returns whether the key was present.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        let mut slots = self.inner.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };
        slot.entry.invalidated = true;
        slot.publish();
        true
    }

    /// Marks all entries of requests to `url` as stale. Returns the number of entries.
    pub fn invalidate_url(&self, url: &str) -> usize {
        let mut slots = self.inner.slots.lock();
        let mut invalidated = 0;
        for (key, slot) in slots.iter_mut() {
            if key.url() == Some(url) {
                slot.entry.invalidated = true;
                slot.publish();
                invalidated += 1;
            }
        }
        tracing::debug!(url, invalidated, "invalidated queries");
        invalidated
    }

    /// Removes the entry for `key`. Returns whether the key was present.
    ///
    /// An entry that still has subscribers is reset to an empty, idle entry instead. A fetch in
    /// flight for a removed entry still completes for its callers, but is not written back.
    pub fn remove(&self, key: &QueryKey) -> bool {
        let mut slots = self.inner.slots.lock();
        Self::remove_locked(&mut slots, key)
    }

    fn remove_locked(slots: &mut HashMap<QueryKey, Slot<T>>, key: &QueryKey) -> bool {
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };
        if slot.entry.subscribers == 0 {
            slots.remove(key);
            return true;
        }

        let subscribers = slot.entry.subscribers;
        slot.entry = CacheEntry::new();
        slot.entry.subscribers = subscribers;
        slot.in_flight = None;
        slot.publish();
        true
    }

    /// Removes all entries, see [`remove`](Self::remove).
    pub fn clear(&self) {
        let mut slots = self.inner.slots.lock();
        let keys: Vec<_> = slots.keys().cloned().collect();
        for key in &keys {
            Self::remove_locked(&mut slots, key);
        }
    }

    /// The number of entries currently in the store.
    pub fn len(&self) -> usize {
        let mut slots = self.inner.slots.lock();
        Self::sweep(&mut slots, Instant::now());
        slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The keys of all entries currently in the store.
    pub fn keys(&self) -> Vec<QueryKey> {
        let mut slots = self.inner.slots.lock();
        Self::sweep(&mut slots, Instant::now());
        slots.keys().cloned().collect()
    }

    /// The fetch currently in flight for `key`.
    pub(crate) fn in_flight(&self, key: &QueryKey) -> Option<FetchChannel<T>> {
        let slots = self.inner.slots.lock();
        let in_flight = slots.get(key)?.in_flight.as_ref()?;
        Some(in_flight.channel.clone())
    }

    /// Decides whether to join an in-flight fetch, serve the cached entry or start a new fetch.
    ///
    /// With `force`, the cached entry is never served.
    pub(crate) fn begin_fetch(&self, key: &QueryKey, timing: Timing, force: bool) -> Begin<T> {
        metric!(counter("query.access") += 1);

        let mut slots = self.inner.slots.lock();
        let now = Instant::now();
        let slot = Self::slot_mut(&mut slots, key, now, timing.gc_time);

        if let Some(in_flight) = &slot.in_flight {
            metric!(counter("query.fetch.dedup") += 1);
            tracing::trace!(%key, "joining in-flight fetch");
            return Begin::Join(in_flight.channel.clone());
        }

        if !force && slot.entry.is_fresh(now, timing.stale_time) {
            metric!(counter("query.memory.hit") += 1);
            return Begin::Cached(slot.entry.to_response());
        }

        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();

        slot.in_flight = Some(InFlight {
            id,
            channel: channel.clone(),
        });
        slot.entry.status = QueryStatus::Loading;
        slot.entry.gc_at = None;
        slot.publish();

        metric!(counter("query.fetch") += 1);
        Begin::Start {
            id,
            sender,
            channel,
        }
    }

    /// Writes the outcome of fetch `id` back into the entry for `key`.
    ///
    /// Outcomes of fetches that are no longer the current one for `key` are discarded.
    pub(crate) fn settle_fetch(&self, key: &QueryKey, id: u64, response: &QueryResponse<T>) {
        let timer = {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.get_mut(key) else {
                return;
            };
            if slot.in_flight.as_ref().is_none_or(|f| f.id != id) {
                return;
            }
            slot.in_flight = None;

            let now = Instant::now();
            let entry = &mut slot.entry;
            if response.success {
                entry.data = response.data.clone();
                entry.status = QueryStatus::Success;
                entry.success = true;
                entry.error_code = None;
                entry.error_msg = None;
                entry.last_updated = Some(now);
                entry.invalidated = false;
            } else {
                metric!(counter("query.fetch.failed") += 1);
                entry.status = QueryStatus::Error;
                entry.success = false;
                entry.error_code = response.error_code;
                entry.error_msg = response.error_msg.clone();
            }
            slot.publish();

            let gc = slot.arm_gc(now);
            let timer = Self::apply_gc(&mut slots, key, gc);
            metric!(gauge("query.entries") = slots.len() as u64);
            timer
        };
        if let Some(delay) = timer {
            self.spawn_gc_timer(key.clone(), delay);
        }
    }

    /// Clears fetch `id` of `key` after it was torn down without settling.
    pub(crate) fn abandon_fetch(&self, key: &QueryKey, id: u64, error_msg: String) {
        let timer = {
            let mut slots = self.inner.slots.lock();
            let Some(slot) = slots.get_mut(key) else {
                return;
            };
            if slot.in_flight.as_ref().is_none_or(|f| f.id != id) {
                return;
            }
            slot.in_flight = None;
            slot.entry.status = QueryStatus::Error;
            slot.entry.success = false;
            slot.entry.error_code = None;
            slot.entry.error_msg = Some(error_msg);
            slot.publish();

            let gc = slot.arm_gc(Instant::now());
            Self::apply_gc(&mut slots, key, gc)
        };
        if let Some(delay) = timer {
            self.spawn_gc_timer(key.clone(), delay);
        }
    }
}

enum Guard {
    /// Releases the subscription from its store.
    Release(CallOnDrop),
    /// Keeps the channel of a subscription that is not backed by a store open.
    Detached(Box<dyn std::any::Any + Send + Sync>),
}

/// A live subscription to a key of a [`QueryCache`].
///
/// The entry is retained as long as the subscription lives. Dropping it releases the entry,
/// which is evicted once its grace period elapsed without a new subscriber.
pub struct Subscription<T> {
    key: QueryKey,
    receiver: watch::Receiver<CacheEntry<T>>,
    _guard: Guard,
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Subscription<T> {
    fn detached(key: QueryKey, entry: CacheEntry<T>) -> Self {
        let (sender, receiver) = watch::channel(entry);
        Self {
            key,
            receiver,
            _guard: Guard::Detached(Box::new(sender)),
        }
    }
}

impl<T: Clone> Subscription<T> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The latest entry.
    pub fn current(&self) -> CacheEntry<T> {
        self.receiver.borrow().clone()
    }

    /// Waits for the next change of the entry and returns it.
    ///
    /// Subscriptions to the idle key never change.
    pub async fn changed(&mut self) -> CacheEntry<T> {
        // The sender lives as long as any subscription of its slot.
        let _ = self.receiver.changed().await;
        self.receiver.borrow_and_update().clone()
    }
}
