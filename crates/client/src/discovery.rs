//! Coordinator endpoint selection.
//!
//! The discovery mechanism itself is an external collaborator; the client
//! only needs `pick() -> Option<Endpoint>`. Two strategies compose:
//! [`RandomEndpointStrategy`] reservoir-samples one endpoint uniformly
//! from whatever the supplier currently returns, and
//! [`TimeLimitEndpointStrategy`] keeps asking for a bounded time when the
//! list is momentarily empty (e.g. right after the coordinator restarts).

use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A coordinator address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Live view of the discovered endpoints. Implementations re-resolve on
/// every call so the strategy always samples the current membership.
pub trait EndpointSupplier: Send + Sync {
    fn endpoints(&self) -> Vec<Endpoint>;
}

/// A supplier backed by a shared, externally refreshed list.
#[derive(Default)]
pub struct RefreshableEndpoints {
    endpoints: parking_lot::RwLock<Vec<Endpoint>>,
}

impl RefreshableEndpoints {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the full endpoint list (called by the discovery watcher).
    pub fn replace(&self, endpoints: Vec<Endpoint>) {
        *self.endpoints.write() = endpoints;
    }
}

impl EndpointSupplier for RefreshableEndpoints {
    fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().clone()
    }
}

impl EndpointSupplier for Arc<RefreshableEndpoints> {
    fn endpoints(&self) -> Vec<Endpoint> {
        self.as_ref().endpoints()
    }
}

/// Picks one coordinator endpoint.
pub trait EndpointStrategy: Send + Sync {
    /// An endpoint, or `None` when none can be found.
    fn pick(&self) -> Option<Endpoint>;
}

/// Uniformly samples one endpoint via reservoir sampling, traversing the
/// supplier's current view on every call.
pub struct RandomEndpointStrategy<S: EndpointSupplier> {
    supplier: S,
}

impl<S: EndpointSupplier> RandomEndpointStrategy<S> {
    pub fn new(supplier: S) -> Self {
        RandomEndpointStrategy { supplier }
    }
}

impl<S: EndpointSupplier> EndpointStrategy for RandomEndpointStrategy<S> {
    fn pick(&self) -> Option<Endpoint> {
        let mut rng = rand::thread_rng();
        let mut result = None;
        for (count, endpoint) in self.supplier.endpoints().into_iter().enumerate() {
            if rng.gen_range(0..=count) == 0 {
                result = Some(endpoint);
            }
        }
        result
    }
}

/// Bounds the wait for an endpoint: polls the delegate until one appears
/// or the timeout elapses.
pub struct TimeLimitEndpointStrategy<D: EndpointStrategy> {
    delegate: D,
    timeout: Duration,
}

impl<D: EndpointStrategy> TimeLimitEndpointStrategy<D> {
    pub fn new(delegate: D, timeout: Duration) -> Self {
        TimeLimitEndpointStrategy { delegate, timeout }
    }
}

impl<D: EndpointStrategy> EndpointStrategy for TimeLimitEndpointStrategy<D> {
    fn pick(&self) -> Option<Endpoint> {
        let deadline = Instant::now() + self.timeout;
        let mut pick = self.delegate.pick();
        while pick.is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
            pick = self.delegate.pick();
        }
        if pick.is_none() {
            debug!(timeout_ms = self.timeout.as_millis() as u64, "no endpoint discovered in time");
        }
        pick
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_supplier_picks_nothing() {
        let supplier = RefreshableEndpoints::new();
        let strategy = RandomEndpointStrategy::new(supplier);
        assert_eq!(strategy.pick(), None);
    }

    #[test]
    fn single_endpoint_always_picked() {
        let supplier = RefreshableEndpoints::new();
        supplier.replace(vec![Endpoint::new("tx1", 15165)]);
        let strategy = RandomEndpointStrategy::new(supplier);
        for _ in 0..10 {
            assert_eq!(strategy.pick(), Some(Endpoint::new("tx1", 15165)));
        }
    }

    #[test]
    fn sampling_reaches_every_endpoint() {
        let supplier = RefreshableEndpoints::new();
        supplier.replace(vec![
            Endpoint::new("a", 1),
            Endpoint::new("b", 2),
            Endpoint::new("c", 3),
        ]);
        let strategy = RandomEndpointStrategy::new(supplier);

        let mut seen: HashMap<Endpoint, usize> = HashMap::new();
        for _ in 0..300 {
            *seen.entry(strategy.pick().unwrap()).or_default() += 1;
        }
        // All three must show up; with 300 uniform draws a miss is
        // essentially impossible.
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn time_limit_waits_for_late_endpoints() {
        let supplier = RefreshableEndpoints::new();
        let strategy = TimeLimitEndpointStrategy::new(
            RandomEndpointStrategy::new(supplier.clone()),
            Duration::from_secs(2),
        );

        let writer = supplier.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            writer.replace(vec![Endpoint::new("late", 9)]);
        });

        assert_eq!(strategy.pick(), Some(Endpoint::new("late", 9)));
        handle.join().unwrap();
    }

    #[test]
    fn time_limit_gives_up_eventually() {
        let supplier = RefreshableEndpoints::new();
        let strategy = TimeLimitEndpointStrategy::new(
            RandomEndpointStrategy::new(supplier),
            Duration::from_millis(30),
        );
        assert_eq!(strategy.pick(), None);
    }
}
