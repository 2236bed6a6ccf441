//! Request coalescing.
//!
//! Concurrent callers asking for the same key share one load. The load runs
//! on its own task, so a caller that stops waiting does not cancel it for the
//! others. [`SingleflightGroup::forget`] detaches a running load from its key
//! and marks it stale, so later callers start afresh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::time::error::Elapsed;
use warden_core::{StorageError, WardenResult};

type SharedLoad<V> = Shared<BoxFuture<'static, WardenResult<V>>>;

/// Set when the key a load serves was invalidated while it ran.
#[derive(Debug, Clone, Default)]
pub struct StaleMark(Arc<AtomicBool>);

impl StaleMark {
    pub fn is_stale(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct InFlight<V: Clone> {
    seq: u64,
    load: SharedLoad<V>,
    stale: StaleMark,
}

/// A handle on one in-flight load.
pub struct Flight<V: Clone> {
    load: SharedLoad<V>,
    leader: bool,
}

impl<V> Flight<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// True for the caller that started the load.
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Wait for the shared result, bounded by `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<WardenResult<V>, Elapsed> {
        tokio::time::timeout(timeout, self.load).await
    }
}

/// Keyed group of in-flight loads.
pub struct SingleflightGroup<V: Clone> {
    flights: Arc<Mutex<HashMap<String, InFlight<V>>>>,
    next_seq: AtomicU64,
}

impl<V: Clone> Default for SingleflightGroup<V> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
        }
    }
}

impl<V> SingleflightGroup<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, starting it with `load` if none is running.
    ///
    /// `load` receives the flight's [`StaleMark`]; a load that fills a cache
    /// must check it before and after writing.
    pub fn join<F>(&self, key: &str, load: F) -> WardenResult<Flight<V>>
    where
        F: FnOnce(StaleMark) -> BoxFuture<'static, WardenResult<V>>,
    {
        let mut flights = self.flights.lock().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(existing) = flights.get(key) {
            return Ok(Flight {
                load: existing.load.clone(),
                leader: false,
            });
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let stale = StaleMark::default();
        let registry = Arc::clone(&self.flights);
        let owned_key = key.to_string();
        let work = load(stale.clone());
        let task = tokio::spawn(async move {
            let result = work.await;
            if let Ok(mut flights) = registry.lock() {
                // A forgotten flight may have been replaced by a newer one.
                if flights.get(&owned_key).is_some_and(|f| f.seq == seq) {
                    flights.remove(&owned_key);
                }
            }
            result
        });

        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(StorageError::Backend {
                    reason: format!("load task failed: {e}"),
                }
                .into()),
            }
        }
        .boxed()
        .shared();

        flights.insert(
            key.to_string(),
            InFlight {
                seq,
                load: shared.clone(),
                stale,
            },
        );
        Ok(Flight {
            load: shared,
            leader: true,
        })
    }

    /// Detach the running load for `key`, if any, and mark it stale. Callers
    /// already waiting keep their result; the next `join` starts a new load.
    pub fn forget(&self, key: &str) -> WardenResult<bool> {
        let mut flights = self.flights.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(match flights.remove(key) {
            Some(flight) => {
                flight.stale.mark();
                true
            }
            None => false,
        })
    }

    /// Number of loads currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().map(|f| f.len()).unwrap_or(0)
    }
}
