//! Coalescing of concurrent identical operations.
//!
//! [`SingleFlight::run`] executes an operation at most once per key while it is
//! in flight; every caller that arrives in the meantime awaits the same outcome.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Flight<T> = Shared<BoxFuture<'static, T>>;

/// Keyed de-duplication of in-flight async operations
pub struct SingleFlight<K, T: Clone> {
  flights: Arc<Mutex<HashMap<K, Flight<T>>>>,
}

impl<K, T: Clone> Default for SingleFlight<K, T> {
  fn default() -> Self {
    Self {
      flights: Arc::new(Mutex::new(HashMap::new())),
    }
  }
}

impl<K, T> SingleFlight<K, T>
where
  K: Eq + Hash + Clone + Send + 'static,
  T: Clone + Send + Sync + 'static,
{
  /// Create an empty coordinator
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `operation` under `key`, or join the run already in flight.
  ///
  /// `operation` is only invoked by the caller that registers the flight.
  /// The key is cleared as soon as the flight resolves, so a later call
  /// starts a fresh run. Fallible operations should use `T = Result<V, Arc<E>>`
  /// so the single error can be handed to every waiter.
  pub async fn run<F, Fut>(&self, key: K, operation: F) -> T
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T> + Send + 'static,
  {
    let flight = {
      let mut flights = lock(&self.flights);
      match flights.get(&key) {
        Some(flight) => flight.clone(),
        None => {
          let registry = Arc::clone(&self.flights);
          let cleanup_key = key.clone();
          let work = operation();
          let flight = async move {
            let outcome = work.await;
            lock(&registry).remove(&cleanup_key);
            outcome
          }
          .boxed()
          .shared();
          flights.insert(key, flight.clone());
          flight
        }
      }
    };
    flight.await
  }

  /// Number of keys with an operation currently in flight
  pub fn in_flight(&self) -> usize {
    lock(&self.flights).len()
  }
}

fn lock<K, T: Clone>(flights: &Mutex<HashMap<K, Flight<T>>>) -> MutexGuard<'_, HashMap<K, Flight<T>>> {
  flights.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn concurrent_callers_share_one_execution() {
    let flights: SingleFlight<String, usize> = SingleFlight::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let run = |calls: Arc<AtomicUsize>| {
      flights.run("example.com".to_string(), move || async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        calls.fetch_add(1, Ordering::SeqCst) + 41
      })
    };
    let (a, b, c) = tokio::join!(run(calls.clone()), run(calls.clone()), run(calls.clone()));

    assert_eq!(calls.load(Ordering::SeqCst), 1, "operation must run once");
    assert_eq!((a, b, c), (41, 41, 41));
    assert_eq!(flights.in_flight(), 0, "key is cleared after completion");
  }

  #[tokio::test]
  async fn errors_are_broadcast_to_every_waiter() {
    let flights: SingleFlight<&'static str, std::result::Result<u8, Arc<String>>> =
      SingleFlight::new();
    let slow_failure = || async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      Err(Arc::new("disk full".to_string()))
    };
    let (a, b) = tokio::join!(
      flights.run("host", slow_failure),
      flights.run("host", || async { Ok(7) })
    );
    let a = a.expect_err("first caller sees the failure");
    let b = b.expect_err("second caller joins the failing flight");
    assert!(Arc::ptr_eq(&a, &b), "waiters receive the very same error");
  }

  #[tokio::test]
  async fn distinct_keys_do_not_coalesce() {
    let flights: SingleFlight<u32, u32> = SingleFlight::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let op = |k: u32, calls: Arc<AtomicUsize>| {
      flights.run(k, move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        k * 2
      })
    };
    let (a, b) = tokio::join!(op(1, calls.clone()), op(2, calls.clone()));
    assert_eq!((a, b), (2, 4));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn a_finished_key_runs_again() {
    let flights: SingleFlight<&'static str, usize> = SingleFlight::new();
    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
      let calls = calls.clone();
      flights
        .run("k", move || async move { calls.fetch_add(1, Ordering::SeqCst) })
        .await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
