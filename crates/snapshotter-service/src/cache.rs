//! The request dedup cache.
//!
//! Requests carrying the same identity token within the configured age window
//! share one render: the first arrival admits the token and performs the work,
//! everyone else joins the in-flight (or already settled) entry and observes the
//! identical outcome. A background sweeper evicts entries past their age window.
//!
//! Rejections are special-cased: a failed render is removed from the cache before
//! the failure is published, so the very next request for that token starts a
//! fresh render instead of replaying the error for the rest of the window.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::deferred::{Deferred, DeferredHandle};

struct CacheEntry<T, E> {
    handle: DeferredHandle<T, E>,
    admitted_at: Instant,
}

type EntryMap<T, E> = Arc<Mutex<BTreeMap<String, CacheEntry<T, E>>>>;

/// The outcome of [`RequestCache::admit`].
pub enum Admission<T, E> {
    /// The token was admitted. The caller owns the render and must settle the
    /// guard with its outcome.
    Admitted(AdmissionGuard<T, E>),
    /// A live entry for the token already exists; await its settlement instead
    /// of doing the work again.
    Joined(DeferredHandle<T, E>),
}

/// A time-windowed cache keyed by caller-supplied identity tokens.
pub struct RequestCache<T, E> {
    entries: EntryMap<T, E>,
    max_age: Duration,
}

impl<T, E> Clone for RequestCache<T, E> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        RequestCache {
            entries: Arc::clone(&self.entries),
            max_age: self.max_age,
        }
    }
}

impl<T, E> RequestCache<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates a cache whose entries live for `max_age` past their admission.
    pub fn new(max_age: Duration) -> Self {
        RequestCache {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            max_age,
        }
    }

    /// Looks up the live entry for `token`.
    ///
    /// Entries past their age window are treated as absent even before the
    /// sweeper catches them.
    pub fn lookup(&self, token: &str) -> Option<DeferredHandle<T, E>> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(token)
            .filter(|entry| entry.admitted_at.elapsed() <= self.max_age)
            .map(|entry| entry.handle.clone())
    }

    /// Admits `token`, or joins the live entry registered by an earlier arrival.
    ///
    /// The check and the registration happen under one lock: when concurrent
    /// identical requests race past a miss, exactly one of them is admitted and
    /// all others join the winner's entry.
    pub fn admit(&self, token: &str) -> Admission<T, E> {
        let mut entries = self.entries.lock().unwrap();

        if let Some(entry) = entries.get(token) {
            if entry.admitted_at.elapsed() <= self.max_age {
                metric!(counter("dedup.joined") += 1);
                return Admission::Joined(entry.handle.clone());
            }
        }

        let (deferred, handle) = Deferred::new();
        let admitted_at = Instant::now();
        entries.insert(
            token.to_owned(),
            CacheEntry {
                handle,
                admitted_at,
            },
        );
        metric!(counter("dedup.admitted") += 1);

        Admission::Admitted(AdmissionGuard {
            token: token.to_owned(),
            admitted_at,
            deferred: Some(deferred),
            entries: Arc::clone(&self.entries),
        })
    }

    /// Removes every entry whose age exceeds the window and returns the count.
    ///
    /// Running the sweep twice in a row with no new entries in between is
    /// idempotent; the second pass removes nothing.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.admitted_at) <= self.max_age);
        let removed = before - entries.len();
        metric!(gauge("dedup.entries") = entries.len() as u64);
        drop(entries);

        if removed > 0 {
            tracing::debug!(removed, "swept expired render results");
        }
        metric!(counter("dedup.swept") += removed as i64);
        removed
    }

    /// The number of entries currently registered, live or not.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Spawns the supervised background task sweeping this cache on a fixed
    /// interval, independent of request traffic, until `shutdown` is triggered.
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("render cache sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.sweep(Instant::now());
                    }
                }
            }
        })
    }
}

/// Proof of a won admission, holding the producer half of the shared entry.
///
/// The owner must settle it via [`fulfil`](Self::fulfil) or
/// [`reject`](Self::reject). If the guard is dropped unsettled (the producing
/// task died), the entry is removed so the token is not poisoned for the rest of
/// the age window.
pub struct AdmissionGuard<T, E> {
    token: String,
    admitted_at: Instant,
    deferred: Option<Deferred<T, E>>,
    entries: EntryMap<T, E>,
}

impl<T, E> AdmissionGuard<T, E> {
    /// The admitted identity token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Settles the shared entry with the successful payload.
    ///
    /// The entry stays in the cache until it ages out, serving the identical
    /// payload to every request joining within the window.
    pub fn fulfil(mut self, value: T) -> Arc<T> {
        match self.deferred.take() {
            Some(deferred) => deferred.fulfil(value),
            // `deferred` is only taken here and in `reject`, both consume the guard
            None => unreachable!("admission settled twice"),
        }
    }

    /// Settles the shared entry with a failure.
    ///
    /// The entry is removed *before* the rejection is published: once any waiter
    /// observes the failure, a retry for the token is already a cache miss.
    pub fn reject(mut self, error: E) -> Arc<E> {
        self.remove_entry();
        match self.deferred.take() {
            Some(deferred) => deferred.reject(error),
            None => unreachable!("admission settled twice"),
        }
    }

    /// Removes the entry this guard admitted, unless the token was re-admitted
    /// in the meantime (the sweeper may have evicted us mid-render).
    fn remove_entry(&self) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(&self.token) {
            if entry.admitted_at == self.admitted_at {
                entries.remove(&self.token);
            }
        }
    }
}

impl<T, E> Drop for AdmissionGuard<T, E> {
    fn drop(&mut self) {
        if self.deferred.is_some() {
            self.remove_entry();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::deferred::Abandoned;

    type TestCache = RequestCache<String, String>;

    const MAX_AGE: Duration = Duration::from_secs(1200);

    #[tokio::test]
    async fn test_concurrent_admissions_have_a_single_winner() {
        let cache = TestCache::new(MAX_AGE);
        let admissions = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let cache = cache.clone();
                let admissions = Arc::clone(&admissions);
                tokio::spawn(async move {
                    match cache.admit("token") {
                        Admission::Admitted(guard) => {
                            admissions.fetch_add(1, Ordering::SeqCst);
                            // hold the admission long enough for everyone to join
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            let value = guard.fulfil("rendered".to_owned());
                            Ok(value)
                        }
                        Admission::Joined(handle) => handle.wait().await.unwrap(),
                    }
                })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap().unwrap());
        }

        assert_eq!(admissions.load(Ordering::SeqCst), 1);
        for window in results.windows(2) {
            assert!(Arc::ptr_eq(&window[0], &window[1]));
        }
    }

    #[tokio::test]
    async fn test_rejected_entry_is_absent_immediately() {
        let cache = TestCache::new(MAX_AGE);

        let Admission::Admitted(guard) = cache.admit("token") else {
            panic!("expected an admission");
        };
        let handle = cache.lookup("token").unwrap();

        guard.reject("engine crashed".to_owned());

        let error = handle.wait().await.unwrap().unwrap_err();
        assert_eq!(error.as_str(), "engine crashed");

        // the next arrival misses and starts over
        assert!(cache.lookup("token").is_none());
        assert!(matches!(cache.admit("token"), Admission::Admitted(_)));
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_entries() {
        let cache = TestCache::new(MAX_AGE);

        let Admission::Admitted(guard) = cache.admit("token") else {
            panic!("expected an admission");
        };
        guard.fulfil("rendered".to_owned());

        // just inside the window: nothing to remove, the entry is served
        assert_eq!(cache.sweep(Instant::now() + Duration::from_secs(1199)), 0);
        assert!(cache.lookup("token").is_some());

        // just past the window: removed, and a second pass is idempotent
        assert_eq!(cache.sweep(Instant::now() + Duration::from_secs(1201)), 1);
        assert!(cache.lookup("token").is_none());
        assert_eq!(cache.sweep(Instant::now() + Duration::from_secs(1201)), 0);
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_entry_is_replaced_on_admission() {
        let cache = TestCache::new(Duration::ZERO);

        let Admission::Admitted(guard) = cache.admit("token") else {
            panic!("expected an admission");
        };
        guard.fulfil("first".to_owned());

        // with a zero age window the settled entry is immediately stale
        assert!(cache.lookup("token").is_none());
        assert!(matches!(cache.admit("token"), Admission::Admitted(_)));
    }

    #[tokio::test]
    async fn test_dropped_admission_does_not_poison_the_token() {
        let cache = TestCache::new(MAX_AGE);

        let Admission::Admitted(guard) = cache.admit("token") else {
            panic!("expected an admission");
        };
        let handle = cache.lookup("token").unwrap();

        drop(guard);

        assert_eq!(handle.wait().await, Err(Abandoned));
        assert!(cache.lookup("token").is_none());
        assert!(matches!(cache.admit("token"), Admission::Admitted(_)));
    }

    #[tokio::test]
    async fn test_sweeper_task_evicts_and_shuts_down() {
        let cache = TestCache::new(Duration::ZERO);

        let Admission::Admitted(guard) = cache.admit("token") else {
            panic!("expected an admission");
        };
        guard.fulfil("rendered".to_owned());
        assert_eq!(cache.entry_count(), 1);

        let shutdown = CancellationToken::new();
        let sweeper = cache.spawn_sweeper(Duration::from_millis(10), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.entry_count(), 0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .unwrap()
            .unwrap();
    }
}
