use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::error::{Result, SchemaTreeError};

type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

/// At most one running computation per key
///
/// The first caller for a key spawns the work on the runtime; later callers
/// await the same shared result. The work is owned by the spawned task, so a
/// caller that stops waiting does not cancel it for the others. The entry is
/// removed when the work finishes, success or failure, so the next caller
/// after a failure starts over.
pub struct SingleFlight<T> {
    inflight: Arc<Mutex<HashMap<String, (u64, SharedResult<T>)>>>,
    next_id: AtomicU64,
    leaders: AtomicU64,
    joins: AtomicU64,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            leaders: AtomicU64::new(0),
            joins: AtomicU64::new(0),
        }
    }

    pub async fn run<F>(&self, key: &str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some((_, shared)) => {
                    self.joins.fetch_add(1, Ordering::Relaxed);
                    shared.clone()
                }
                None => {
                    self.leaders.fetch_add(1, Ordering::Relaxed);
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let shared = self.spawn(key.to_string(), id, work);
                    // Inserted under the same lock the task takes to remove it
                    inflight.insert(key.to_string(), (id, shared.clone()));
                    shared
                }
            }
        };

        shared.await
    }

    fn spawn<F>(&self, key: String, id: u64, work: F) -> SharedResult<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let inflight = self.inflight.clone();
        let handle = tokio::spawn(async move {
            let result = work.await;
            let mut inflight = inflight.lock();
            if inflight.get(&key).is_some_and(|(entry, _)| *entry == id) {
                inflight.remove(&key);
            }
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(SchemaTreeError::BuildFailed {
                    details: e.to_string(),
                }),
            }
        }
        .boxed()
        .shared()
    }

    /// Keys with a computation currently running
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Calls that started a computation
    pub fn leader_count(&self) -> u64 {
        self.leaders.load(Ordering::Relaxed)
    }

    /// Calls that joined a running computation
    pub fn join_count(&self) -> u64 {
        self.joins.load(Ordering::Relaxed)
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
