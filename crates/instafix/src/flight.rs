//! Request coalescing: at most one in-flight call per key.
//!
//! The first caller for a key becomes the leader and its work runs on a
//! spawned task. Later callers for the same key clone the shared handle and
//! wait for the same outcome. Dropping any caller, the leader included, does
//! not cancel the work; the entry is removed when the task finishes.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinError;

type Call<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;
type Calls<K, T, E> = Arc<Mutex<HashMap<K, Call<T, E>>>>;

pub struct SingleFlight<K, T, E> {
    calls: Calls<K, T, E>,
}

impl<K, T, E> Clone for SingleFlight<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<K, T, E> Default for SingleFlight<K, T, E> {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T, E> SingleFlight<K, T, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<JoinError> + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, or join the call already running for it.
    ///
    /// `work` is only invoked when this caller becomes the leader.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let call = {
            let mut calls = lock(&self.calls);
            match calls.get(&key) {
                Some(call) => call.clone(),
                None => {
                    let call = self.spawn(key.clone(), work());
                    calls.insert(key, call.clone());
                    call
                }
            }
        };
        call.await
    }

    fn spawn<Fut>(&self, key: K, fut: Fut) -> Call<T, E>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let release = Release {
            calls: Arc::clone(&self.calls),
            key,
        };
        let handle = tokio::spawn(async move {
            let _release = release;
            fut.await
        });
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(E::from(e)),
            }
        }
        .boxed()
        .shared()
    }

    /// Whether a call for `key` is currently running.
    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.calls).contains_key(key)
    }

    /// Number of keys with a running call.
    pub fn in_flight(&self) -> usize {
        lock(&self.calls).len()
    }
}

/// Removes the key when the leader task ends, including by panic.
struct Release<K: Eq + Hash, T, E> {
    calls: Calls<K, T, E>,
    key: K,
}

impl<K: Eq + Hash, T, E> Drop for Release<K, T, E> {
    fn drop(&mut self) {
        lock(&self.calls).remove(&self.key);
    }
}

fn lock<K, T, E>(calls: &Calls<K, T, E>) -> MutexGuard<'_, HashMap<K, Call<T, E>>> {
    calls.lock().unwrap_or_else(PoisonError::into_inner)
}
