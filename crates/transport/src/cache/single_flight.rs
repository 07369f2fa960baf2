//! Collapse concurrent fetches of the same key into one

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use devgate_common::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::hash::Hash;

type Flight<V> = Shared<BoxFuture<'static, Result<V>>>;

pub struct SingleFlight<K, V> {
    flights: DashMap<K, Flight<V>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            flights: DashMap::new(),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight fetch for `key`, or start one with `fetch`
    ///
    /// Every joined caller observes the same result, errors included.
    pub async fn run<F, Fut>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        self.run_and_publish(key, fetch, |_| {}).await
    }

    /// Like `run`, but hands a successful value to `publish` before the
    /// flight is detached, so a miss that no longer finds the flight finds
    /// the published value instead
    pub async fn run_and_publish<F, Fut, P>(&self, key: K, fetch: F, publish: P) -> Result<V>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V>> + Send + 'static,
        P: FnOnce(&V) + Send,
    {
        let flight = match self.flights.entry(key.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let flight = fetch().boxed().shared();
                slot.insert(flight.clone());
                flight
            }
        };

        let result = flight.clone().await;
        if let Ok(value) = &result {
            publish(value);
        }
        self.flights.remove_if(&key, |_, current| current.ptr_eq(&flight));
        result
    }

    /// Detach the in-flight fetch; later callers start a new one
    pub fn forget(&self, key: &K) {
        self.flights.remove(key);
    }

    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devgate_common::TransportError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let flights: Arc<SingleFlight<u32, String>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let flights = flights.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run(1, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("profile".to_string())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "profile");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_error_is_shared_and_not_cached() {
        let flights: SingleFlight<u32, u32> = SingleFlight::new();
        let err = flights
            .run(1, || async { Err(TransportError::queue("backend down")) })
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::queue("backend down"));

        let ok = flights.run(1, || async { Ok(7) }).await.unwrap();
        assert_eq!(ok, 7);
    }

    #[tokio::test]
    async fn test_value_published_before_flight_detached() {
        let flights: Arc<SingleFlight<u32, u32>> = Arc::new(SingleFlight::new());
        let store: Arc<DashMap<u32, u32>> = Arc::new(DashMap::new());

        let value = {
            let store = store.clone();
            let flights_seen = flights.clone();
            flights
                .run_and_publish(
                    1,
                    || async { Ok(5) },
                    move |value| {
                        // the flight is still joinable while the value is stored
                        assert_eq!(flights_seen.in_flight(), 1);
                        store.insert(1, *value);
                    },
                )
                .await
                .unwrap()
        };
        assert_eq!(value, 5);
        assert_eq!(store.get(&1).map(|v| *v), Some(5));
        assert_eq!(flights.in_flight(), 0);

        // errors are not published
        let err = flights
            .run_and_publish(2, || async { Err(TransportError::queue("down")) }, |_| {
                panic!("published an error")
            })
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_forget_starts_new_flight() {
        let flights: Arc<SingleFlight<u32, u32>> = Arc::new(SingleFlight::new());
        let slow = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run(1, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        flights.forget(&1);

        let fresh = flights.run(1, || async { Ok(2) }).await.unwrap();
        assert_eq!(fresh, 2);
        assert_eq!(slow.await.unwrap().unwrap(), 1);
    }
}
