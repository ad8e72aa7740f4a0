//! Stale-while-revalidate cache middleware.
//!
//! Slots created with the same key on one [`Runtime`](crate::Runtime) share a
//! cache entry. Concurrent executions coalesce into a single fetch, fresh data
//! is served without fetching, and new data reaches every subscribed slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sluice_core::{Data, Params, Result, StatePatch, lock};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{Middleware, Next};
use crate::context::{BasicContext, Context, WeakBasicContext};
use crate::runtime::Runtime;
use crate::storage::{MemoryStorage, Storage};

/// Default prefix of persisted cache keys.
pub const DEFAULT_STORAGE_KEY_PREFIX: &str = "__REQUEST_SWR__";

/// Options of the [`Swr`] middleware.
///
/// Caching is enabled only when `stale_time` is non-zero.
///
/// # Example
///
/// ```ignore
/// use sluice::middleware::SwrOptions;
///
/// let options = RequestOptions::builder()
///     .key("user")
///     .with(SwrOptions::new().stale_time(Duration::from_secs(60)).persistent(true));
/// ```
#[derive(Clone, Default)]
pub struct SwrOptions {
    stale_time: Option<Duration>,
    execute_in_stale_time: Option<bool>,
    persistent: Option<bool>,
    storage: Option<Arc<dyn Storage>>,
    storage_key_prefix: Option<String>,
}

impl std::fmt::Debug for SwrOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwrOptions")
            .field("stale_time", &self.stale_time)
            .field("execute_in_stale_time", &self.execute_in_stale_time)
            .field("persistent", &self.persistent)
            .field("storage", &self.storage.is_some())
            .field("storage_key_prefix", &self.storage_key_prefix)
            .finish()
    }
}

impl SwrOptions {
    /// Options with every field unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How long cached data stays fresh.
    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Fetch even while the cached data is fresh.
    #[must_use]
    pub fn execute_in_stale_time(mut self, execute: bool) -> Self {
        self.execute_in_stale_time = Some(execute);
        self
    }

    /// Write the cache through to `storage`.
    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    /// Where persisted entries live. Defaults to an in-memory storage shared
    /// by the runtime.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Prefix of persisted keys.
    #[must_use]
    pub fn storage_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage_key_prefix = Some(prefix.into());
        self
    }

    /// Overlay `other` on `self`; fields set in `other` win.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            stale_time: other.stale_time.or(self.stale_time),
            execute_in_stale_time: other.execute_in_stale_time.or(self.execute_in_stale_time),
            persistent: other.persistent.or(self.persistent),
            storage: other.storage.or(self.storage),
            storage_key_prefix: other.storage_key_prefix.or(self.storage_key_prefix),
        }
    }

    fn resolve(self, runtime: &Runtime) -> Settings {
        Settings {
            stale_time: self.stale_time.unwrap_or_default(),
            execute_in_stale_time: self.execute_in_stale_time.unwrap_or(false),
            persistent: self.persistent.unwrap_or(false),
            storage: self
                .storage
                .unwrap_or_else(|| runtime.shared::<DefaultStorage>().0),
            storage_key_prefix: self
                .storage_key_prefix
                .unwrap_or_else(|| DEFAULT_STORAGE_KEY_PREFIX.to_string()),
        }
    }
}

#[derive(Clone)]
struct DefaultStorage(Arc<dyn Storage>);

impl Default for DefaultStorage {
    fn default() -> Self {
        Self(Arc::new(MemoryStorage::new()))
    }
}

#[derive(Clone)]
struct Settings {
    stale_time: Duration,
    execute_in_stale_time: bool,
    persistent: bool,
    storage: Arc<dyn Storage>,
    storage_key_prefix: String,
}

impl Settings {
    fn storage_key(&self, key: &str) -> String {
        format!("{}{key}", self.storage_key_prefix)
    }
}

type InFlight = Shared<BoxFuture<'static, ()>>;

struct CacheEntry<T, P> {
    data: Option<T>,
    updated_at: Option<Instant>,
    in_flight: Option<InFlight>,
    subscribers: Vec<(u64, WeakBasicContext<T, P>)>,
}

impl<T, P> Default for CacheEntry<T, P> {
    fn default() -> Self {
        Self {
            data: None,
            updated_at: None,
            in_flight: None,
            subscribers: Vec::new(),
        }
    }
}

impl<T, P> CacheEntry<T, P> {
    fn is_fresh(&self, stale_time: Duration) -> bool {
        self.updated_at
            .is_some_and(|updated_at| updated_at.elapsed() < stale_time)
    }
}

type SharedEntry<T, P> = Arc<Mutex<CacheEntry<T, P>>>;

/// Cache entries of one data type, keyed by request key.
struct SwrCache<T, P> {
    entries: Arc<Mutex<HashMap<String, SharedEntry<T, P>>>>,
}

impl<T, P> Clone for SwrCache<T, P> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T, P> Default for SwrCache<T, P> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T, P> SwrCache<T, P> {
    fn entry(&self, key: &str) -> SharedEntry<T, P> {
        Arc::clone(lock(&self.entries).entry(key.to_string()).or_default())
    }

    /// Drop `entry` if it is still the one cached under `key` and nobody
    /// subscribes to it any more. Returns `true` if it was dropped.
    fn release(&self, key: &str, entry: &SharedEntry<T, P>) -> bool {
        let mut entries = lock(&self.entries);
        let unused = entries
            .get(key)
            .is_some_and(|cached| Arc::ptr_eq(cached, entry) && lock(cached).subscribers.is_empty());
        if unused {
            entries.remove(key);
        }
        unused
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRef<'a, T> {
    last_update_time: u64,
    data: Option<&'a T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Persisted<T> {
    last_update_time: u64,
    data: Option<T>,
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// Per-slot SWR state, kept in the slot store.
struct SwrSlot<T, P> {
    settings: Settings,
    entry: SharedEntry<T, P>,
}

impl<T, P> Clone for SwrSlot<T, P> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<T, P> SwrSlot<T, P>
where
    T: Data + Serialize + DeserializeOwned,
    P: Params,
{
    fn load(&self, key: &str) {
        let storage_key = self.settings.storage_key(key);
        let Some(raw) = self.settings.storage.get_item(&storage_key) else {
            return;
        };
        let persisted = match serde_json::from_str::<Persisted<T>>(&raw) {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(key, error = %err, "dropping unreadable persisted cache entry");
                self.settings.storage.remove_item(&storage_key);
                return;
            }
        };

        let age = Duration::from_millis(epoch_ms().saturating_sub(persisted.last_update_time));
        if age >= self.settings.stale_time {
            trace!(key, "persisted cache entry is stale");
            self.settings.storage.remove_item(&storage_key);
            return;
        }

        let now = Instant::now();
        let mut entry = lock(&self.entry);
        entry.data = persisted.data;
        entry.updated_at = Some(now.checked_sub(age).unwrap_or(now));
    }

    fn persist(&self, key: &str, last_update_time: u64, data: Option<&T>) {
        let persisted = PersistedRef { last_update_time, data };
        let stored = serde_json::to_string(&persisted)
            .map_err(Into::into)
            .and_then(|json| self.settings.storage.set_item(&self.settings.storage_key(key), json));
        if let Err(err) = stored {
            warn!(key, error = %err, "failed to persist cache entry");
        }
    }

    /// Record the data of a successful execution.
    async fn complete(&self, ctx: &Context<T, P>) -> Result<()> {
        let data = ctx.state().data;
        let options = ctx.options();
        let changed = {
            let mut entry = lock(&self.entry);
            entry.updated_at = Some(Instant::now());
            let changed = !options.same_data(data.as_ref(), entry.data.as_ref());
            if changed {
                entry.data.clone_from(&data);
            }
            changed
        };

        if self.settings.persistent {
            self.persist(ctx.key(), epoch_ms(), data.as_ref());
        }
        if changed {
            trace!(key = %ctx.key(), "syncing cache entry");
            ctx.hooks()
                .sync_data
                .call_parallel((data, ctx.basic().clone()))
                .await?;
        }
        Ok(())
    }
}

/// Clears the in-flight marker when the leading execution ends, however it
/// ends. Dropping the sender wakes every waiter.
struct Lead<T, P> {
    entry: SharedEntry<T, P>,
    _done: oneshot::Sender<()>,
}

impl<T, P> Drop for Lead<T, P> {
    fn drop(&mut self) {
        lock(&self.entry).in_flight = None;
    }
}

enum Decision<T, P> {
    Wait(InFlight),
    Serve(Option<T>),
    Lead(Lead<T, P>),
}

/// Stale-while-revalidate middleware.
#[derive(Debug, Clone, Default)]
pub struct Swr {
    defaults: SwrOptions,
}

impl Swr {
    /// Create the middleware with default options.
    #[must_use]
    pub fn new(defaults: SwrOptions) -> Self {
        Self { defaults }
    }
}

impl<T, P> Middleware<T, P> for Swr
where
    T: Data + Serialize + DeserializeOwned,
    P: Params,
{
    fn name(&self) -> Option<&str> {
        Some("basic:swr")
    }

    fn priority(&self) -> i32 {
        1000
    }

    fn setup(&self, ctx: &BasicContext<T, P>) {
        let bag = ctx.options().get::<SwrOptions>().cloned().unwrap_or_default();
        let settings = self.defaults.clone().merge(bag).resolve(ctx.runtime());
        if settings.stale_time.is_zero() {
            return;
        }

        let key = ctx.key().to_string();
        let cache = ctx.runtime().shared::<SwrCache<T, P>>();
        let slot = SwrSlot {
            settings,
            entry: cache.entry(&key),
        };
        lock(&slot.entry).subscribers.push((ctx.id(), ctx.downgrade()));
        if slot.settings.persistent {
            slot.load(&key);
        }

        let seed = {
            let entry = lock(&slot.entry);
            entry.updated_at.is_some().then(|| entry.data.clone())
        };
        if let Some(data) = seed {
            debug!(%key, "seeding state from cache");
            ctx.mutate_state(StatePatch::new().data(data));
        }
        ctx.store().set(slot.clone());

        let entry = Arc::clone(&slot.entry);
        let _ = ctx.hooks().sync_data.on_sync(move |(data, origin)| {
            let others: Vec<BasicContext<T, P>> = lock(&entry)
                .subscribers
                .iter()
                .filter(|(id, _)| *id != origin.id())
                .filter_map(|(_, weak)| weak.upgrade())
                .collect();
            for other in others {
                other.mutate_state(StatePatch::new().data(data.clone()));
            }
        });

        let entry = Arc::clone(&slot.entry);
        let stale_time = slot.settings.stale_time;
        let _ = ctx.hooks().before.on_sync(move |(_, ctx)| {
            let cached = {
                let entry = lock(&entry);
                entry.is_fresh(stale_time).then(|| entry.data.clone())
            };
            if let Some(cached) = cached
                && !ctx.options().same_data(cached.as_ref(), ctx.state().data.as_ref())
            {
                ctx.mutate_state(StatePatch::new().data(cached));
            }
        });

        let _ = ctx.hooks().dispose.once_sync(move |ctx| {
            let empty = {
                let mut entry = lock(&slot.entry);
                entry.subscribers.retain(|(id, _)| *id != ctx.id());
                entry.subscribers.is_empty()
            };
            if empty && cache.release(&key, &slot.entry) {
                debug!(%key, "cache entry released");
                if slot.settings.persistent {
                    slot.settings.storage.remove_item(&slot.settings.storage_key(&key));
                }
            }
        });
    }

    fn handle(&self, ctx: Context<T, P>, next: Next<T, P>) -> BoxFuture<'static, Result<()>> {
        let Some(slot) = ctx.store().try_get::<SwrSlot<T, P>>() else {
            return next.run();
        };

        async move {
            let decision = {
                let mut entry = lock(&slot.entry);
                if let Some(in_flight) = &entry.in_flight {
                    Decision::Wait(in_flight.clone())
                } else if !slot.settings.execute_in_stale_time && entry.is_fresh(slot.settings.stale_time) {
                    Decision::Serve(entry.data.clone())
                } else {
                    let (done, waiter) = oneshot::channel::<()>();
                    entry.in_flight = Some(waiter.map(|_| ()).boxed().shared());
                    Decision::Lead(Lead {
                        entry: Arc::clone(&slot.entry),
                        _done: done,
                    })
                }
            };

            match decision {
                Decision::Wait(in_flight) => {
                    trace!(key = %ctx.key(), "joining in-flight execution");
                    tokio::select! {
                        biased;
                        () = ctx.cancelled() => {}
                        () = in_flight => {}
                    }
                    Ok(())
                }
                Decision::Serve(data) => {
                    trace!(key = %ctx.key(), "serving fresh cache entry");
                    ctx.mutate_data(data);
                    Ok(())
                }
                Decision::Lead(lead) => {
                    let result = next.run().await;
                    let completed = if result.is_ok() && !ctx.is_failed() && !ctx.is_cancelled() {
                        slot.complete(&ctx).await
                    } else {
                        Ok(())
                    };
                    drop(lead);
                    result.and(completed)
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use sluice_core::Fetcher;

    use super::*;
    use crate::engine::Engine;
    use crate::options::RequestOptions;

    fn counting(calls: &Arc<AtomicU32>) -> Fetcher<u32, u32> {
        let calls = Arc::clone(calls);
        Fetcher::new(move |n: u32| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(n * 100 + call)
            }
        })
    }

    fn swr_options(stale_time: Duration) -> crate::options::RequestOptionsBuilder<u32, u32> {
        RequestOptions::builder()
            .key("numbers")
            .middleware(Swr::default())
            .with(SwrOptions::new().stale_time(stale_time))
    }

    #[tokio::test]
    async fn disabled_without_stale_time() {
        let engine: Engine<u32, u32> = Engine::default();
        let calls = Arc::new(AtomicU32::new(0));
        let request = engine.request(
            counting(&calls),
            RequestOptions::builder().middleware(Swr::default()),
        );

        request.run(1).await.expect("run");
        request.run(1).await.expect("run");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(request.context().store().try_get::<SwrSlot<u32, u32>>().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_data_is_served_without_fetching() {
        let engine: Engine<u32, u32> = Engine::default();
        let calls = Arc::new(AtomicU32::new(0));
        let request = engine.request(counting(&calls), swr_options(Duration::from_secs(5)));

        assert_eq!(request.run(1).await.expect("run"), Some(100));
        assert_eq!(request.run(2).await.expect("run"), Some(100));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(request.run(2).await.expect("run"), Some(201));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_in_stale_time_always_fetches() {
        let engine: Engine<u32, u32> = Engine::default();
        let calls = Arc::new(AtomicU32::new(0));
        let request = engine.request(
            counting(&calls),
            swr_options(Duration::from_secs(5)).with(
                SwrOptions::new()
                    .stale_time(Duration::from_secs(5))
                    .execute_in_stale_time(true),
            ),
        );

        request.run(1).await.expect("run");
        request.run(1).await.expect("run");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_update_the_cache() {
        let engine: Engine<u32, u32> = Engine::default();
        let request = engine.request(
            Fetcher::new(|_: u32| async { Err::<u32, _>(sluice_core::Error::fetch("offline")) }),
            swr_options(Duration::from_secs(5)),
        );

        assert!(request.run(1).await.is_err());
        let slot = request
            .context()
            .store()
            .try_get::<SwrSlot<u32, u32>>()
            .expect("swr slot");
        let entry = lock(&slot.entry);
        assert!(entry.updated_at.is_none());
        assert!(entry.in_flight.is_none());
    }

    #[tokio::test]
    async fn persisted_entries_are_written_and_reloaded() {
        let storage = Arc::new(MemoryStorage::new());
        let options = |storage: &Arc<MemoryStorage>| {
            RequestOptions::builder().key("persisted").middleware(Swr::default()).with(
                SwrOptions::new()
                    .stale_time(Duration::from_secs(60))
                    .persistent(true)
                    .storage(Arc::clone(storage) as Arc<dyn Storage>),
            )
        };

        let calls = Arc::new(AtomicU32::new(0));
        let first: Engine<u32, u32> = Engine::default();
        let writer = first.request(counting(&calls), options(&storage));
        writer.run(3).await.expect("run");

        let raw = storage
            .get_item("__REQUEST_SWR__persisted")
            .expect("persisted entry");
        let json: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(json["data"], 300);
        assert!(json["lastUpdateTime"].is_u64());

        let second: Engine<u32, u32> = Engine::default();
        let reader = second.request(counting(&calls), options(&storage));
        assert_eq!(reader.state().data, Some(300));
        assert_eq!(reader.run(3).await.expect("run"), Some(300));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_persisted_entries_are_removed() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set_item(
                "__REQUEST_SWR__old",
                r#"{"lastUpdateTime":0,"data":42}"#.to_string(),
            )
            .expect("set");

        let engine: Engine<u32, u32> = Engine::default();
        let request = engine.request(
            Fetcher::new(|n: u32| async move { Ok(n) }),
            RequestOptions::builder().key("old").middleware(Swr::default()).with(
                SwrOptions::new()
                    .stale_time(Duration::from_secs(60))
                    .persistent(true)
                    .storage(Arc::clone(&storage) as Arc<dyn Storage>),
            ),
        );

        assert_eq!(request.state().data, None);
        assert!(storage.is_empty());
    }
}
