//! Backend pool: least-loaded endpoint selection with per-endpoint caps.
//!
//! Selection picks the endpoint with the fewest in-flight jobs, breaking ties
//! by declaration order, so with equal load it degenerates to round-robin.
//! A lease is returned from [`BackendPool::acquire`] and gives the slot back
//! when dropped, which keeps the counters right even if a worker task is
//! cancelled mid-call.
//!
//! Endpoints are never taken out of rotation. A server that keeps failing
//! keeps receiving its share of jobs and the retry loop absorbs the failures.

use reqwest::Url;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::trace;

/// One conversion server and its live load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: Url,
    pub in_flight_count: usize,
}

/// Shared set of endpoints.
#[derive(Debug)]
pub struct BackendPool {
    endpoints: Mutex<Vec<Endpoint>>,
    per_endpoint_limit: usize,
    released: Notify,
}

impl BackendPool {
    /// Create a pool over `addresses` (non-empty, validated by the config builder).
    pub fn new(addresses: Vec<Url>, per_endpoint_limit: usize) -> Self {
        let endpoints = addresses
            .into_iter()
            .map(|address| Endpoint {
                address,
                in_flight_count: 0,
            })
            .collect();
        Self {
            endpoints: Mutex::new(endpoints),
            per_endpoint_limit: per_endpoint_limit.max(1),
            released: Notify::new(),
        }
    }

    /// Snapshot of every endpoint and its current load, in declaration order.
    pub fn snapshot(&self) -> Vec<Endpoint> {
        self.lock().clone()
    }

    /// Reserve the least-loaded endpoint, waiting if every endpoint is at its cap.
    pub async fn acquire(self: &Arc<Self>) -> EndpointLease {
        loop {
            // Register interest before checking so a release between the
            // check and the await cannot be missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire() {
                return lease;
            }
            notified.await;
        }
    }

    /// Reserve the least-loaded endpoint if any is below its cap.
    pub fn try_acquire(self: &Arc<Self>) -> Option<EndpointLease> {
        let mut endpoints = self.lock();
        let (index, endpoint) = endpoints
            .iter_mut()
            .enumerate()
            .filter(|(_, e)| e.in_flight_count < self.per_endpoint_limit)
            // min_by_key keeps the first minimum: declaration order breaks ties
            .min_by_key(|(_, e)| e.in_flight_count)?;
        endpoint.in_flight_count += 1;
        trace!(endpoint = %endpoint.address, in_flight = endpoint.in_flight_count, "acquired");
        Some(EndpointLease {
            pool: Arc::clone(self),
            index,
            address: endpoint.address.clone(),
        })
    }

    /// Give back one slot on the endpoint at `index`.
    fn release(&self, index: usize) {
        {
            let mut endpoints = self.lock();
            if let Some(endpoint) = endpoints.get_mut(index) {
                endpoint.in_flight_count = endpoint.in_flight_count.saturating_sub(1);
                trace!(endpoint = %endpoint.address, in_flight = endpoint.in_flight_count, "released");
            }
        }
        self.released.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Endpoint>> {
        // Counters stay meaningful even if a holder panicked mid-update.
        self.endpoints.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// A reserved slot on one endpoint; released on drop.
#[derive(Debug)]
pub struct EndpointLease {
    pool: Arc<BackendPool>,
    index: usize,
    address: Url,
}

impl EndpointLease {
    pub fn address(&self) -> &Url {
        &self.address
    }

    /// Release explicitly (equivalent to dropping).
    pub fn release(self) {}
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(n: usize, limit: usize) -> Arc<BackendPool> {
        let urls = (0..n)
            .map(|i| Url::parse(&format!("http://127.0.0.1:{}/predict/", 8002 + i)).unwrap())
            .collect();
        Arc::new(BackendPool::new(urls, limit))
    }

    fn port(lease: &EndpointLease) -> u16 {
        lease.address().port().unwrap()
    }

    #[tokio::test]
    async fn equal_load_round_robins_in_declaration_order() {
        let p = pool(3, 4);
        let a = p.acquire().await;
        let b = p.acquire().await;
        let c = p.acquire().await;
        let d = p.acquire().await;
        assert_eq!(
            [port(&a), port(&b), port(&c), port(&d)],
            [8002, 8003, 8004, 8002]
        );
    }

    #[tokio::test]
    async fn picks_least_loaded_after_release() {
        let p = pool(2, 4);
        let a = p.acquire().await; // 8002
        let _b = p.acquire().await; // 8003
        let _c = p.acquire().await; // 8002
        drop(a);
        // 8002 has 1, 8003 has 1 → tie → 8002
        let d = p.acquire().await;
        assert_eq!(port(&d), 8002);
        let loads: Vec<usize> = p.snapshot().iter().map(|e| e.in_flight_count).collect();
        assert_eq!(loads, vec![2, 1]);
    }

    #[tokio::test]
    async fn lease_drop_restores_counters() {
        let p = pool(2, 2);
        {
            let _a = p.acquire().await;
            let b = p.acquire().await;
            b.release();
        }
        assert!(p.snapshot().iter().all(|e| e.in_flight_count == 0));
    }

    #[tokio::test]
    async fn acquire_waits_when_every_endpoint_is_full() {
        let p = pool(1, 1);
        let held = p.acquire().await;
        assert!(p.try_acquire().is_none());

        let waiter = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { port(&p.acquire().await) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let got = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake after release")
            .unwrap();
        assert_eq!(got, 8002);
    }

    #[tokio::test]
    async fn concurrent_acquire_release_never_exceeds_cap() {
        let p = pool(2, 2);
        let mut handles = Vec::new();
        for _ in 0..32 {
            let p = Arc::clone(&p);
            handles.push(tokio::spawn(async move {
                let lease = p.acquire().await;
                let over = p.snapshot().iter().any(|e| e.in_flight_count > 2);
                tokio::task::yield_now().await;
                drop(lease);
                over
            }));
        }
        for h in handles {
            assert!(!h.await.unwrap());
        }
        assert!(p.snapshot().iter().all(|e| e.in_flight_count == 0));
    }
}
