//! Concurrent endpoint probing: pick the fastest or rank them all.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{LatencyProbe, ProbeFailure, ProbeOutcome};
use crate::api::Endpoint;

/// Default number of endpoints probed at the same time.
pub const DEFAULT_MAX_PARALLEL: usize = 16;

/// Sort key for failed probes; places them after every measured latency.
const FAILURE_SENTINEL: Duration = Duration::MAX;

/// Errors returned by the selector.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    /// The endpoint list was empty
    #[error("location list is empty")]
    NoEndpoints,
}

/// One row of a ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedEndpoint {
    /// 1-based position in the input list
    pub position: usize,
    pub endpoint: Endpoint,
    pub outcome: ProbeOutcome,
}

/// Fans a [`LatencyProbe`] out over an endpoint list.
///
/// Every endpoint gets its own task, but at most `max_parallel` of them exist
/// at a time: a new one is spawned each time one finishes. Results are
/// collected once all tasks have finished. Tasks are never cancelled, so a
/// slow endpoint only delays the round, it never drops out.
#[derive(Clone)]
pub struct Selector {
    probe: Arc<dyn LatencyProbe>,
    max_parallel: usize,
}

impl Selector {
    pub fn new(probe: Arc<dyn LatencyProbe>) -> Self {
        Selector {
            probe,
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    /// Cap concurrent probes (at least one).
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Probe every endpoint; the result is index-aligned with `endpoints`.
    pub async fn probe_all(&self, endpoints: &[Endpoint]) -> Vec<ProbeOutcome> {
        let mut pending = endpoints.iter().enumerate();
        let mut tasks = JoinSet::new();
        let mut outcomes = vec![ProbeOutcome::Unreachable(ProbeFailure::Aborted); endpoints.len()];

        for (index, endpoint) in pending.by_ref().take(self.max_parallel) {
            self.spawn_probe(&mut tasks, index, endpoint);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = outcome,
                Err(err) => warn!("probe task failed: {err}"),
            }
            if let Some((index, endpoint)) = pending.next() {
                self.spawn_probe(&mut tasks, index, endpoint);
            }
        }
        outcomes
    }

    fn spawn_probe(
        &self,
        tasks: &mut JoinSet<(usize, ProbeOutcome)>,
        index: usize,
        endpoint: &Endpoint,
    ) {
        let probe = Arc::clone(&self.probe);
        let address = endpoint.ip_address.clone();
        tasks.spawn(async move { (index, probe.probe(&address).await) });
    }

    /// Pick the endpoint with the lowest average latency.
    ///
    /// Ties go to the earlier endpoint. When nothing answered, the first
    /// endpoint is returned rather than an error.
    pub async fn select_fastest<'a>(
        &self,
        endpoints: &'a [Endpoint],
    ) -> Result<&'a Endpoint, SelectError> {
        let first = endpoints.first().ok_or(SelectError::NoEndpoints)?;
        let outcomes = self.probe_all(endpoints).await;

        let mut best: Option<(usize, Duration)> = None;
        for (index, outcome) in outcomes.iter().enumerate() {
            if let Some(rtt) = outcome.latency() {
                if best.map_or(true, |(_, best_rtt)| rtt < best_rtt) {
                    best = Some((index, rtt));
                }
            }
        }

        match best {
            Some((index, rtt)) => {
                let endpoint = &endpoints[index];
                info!(domain = %endpoint.domain, rtt_ms = rtt.as_millis() as u64, "fastest location selected");
                Ok(endpoint)
            }
            None => {
                warn!(domain = %first.domain, "no location answered probes, falling back to the first");
                Ok(first)
            }
        }
    }

    /// Probe every endpoint and order them by latency, then input position.
    pub async fn rank_all(&self, endpoints: &[Endpoint]) -> Result<Vec<RankedEndpoint>, SelectError> {
        if endpoints.is_empty() {
            return Err(SelectError::NoEndpoints);
        }
        let outcomes = self.probe_all(endpoints).await;

        let mut ranked: Vec<RankedEndpoint> = endpoints
            .iter()
            .cloned()
            .zip(outcomes)
            .enumerate()
            .map(|(index, (endpoint, outcome))| RankedEndpoint {
                position: index + 1,
                endpoint,
                outcome,
            })
            .collect();

        ranked.sort_by_key(|row| {
            (
                row.outcome.latency().unwrap_or(FAILURE_SENTINEL),
                row.position,
            )
        });
        debug!(count = ranked.len(), "ranked locations");
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Answers from a fixed table; unknown addresses time out.
    struct TableProbe(HashMap<String, ProbeOutcome>);

    #[async_trait]
    impl LatencyProbe for TableProbe {
        async fn probe(&self, address: &str) -> ProbeOutcome {
            self.0
                .get(address)
                .cloned()
                .unwrap_or(ProbeOutcome::Unreachable(ProbeFailure::Timeout))
        }
    }

    fn endpoint(n: u8) -> Endpoint {
        Endpoint {
            name: format!("loc-{n}"),
            domain: format!("loc{n}.example.net"),
            ip_address: format!("198.51.100.{n}"),
            vless_port: 443,
            vmess_port: 8443,
            trojan_port: 2083,
        }
    }

    fn selector(table: &[(u8, u64)]) -> Selector {
        let map = table
            .iter()
            .map(|(n, ms)| {
                (
                    format!("198.51.100.{n}"),
                    ProbeOutcome::Reachable(Duration::from_millis(*ms)),
                )
            })
            .collect();
        Selector::new(Arc::new(TableProbe(map)))
    }

    #[tokio::test]
    async fn fastest_wins() {
        let endpoints = vec![endpoint(1), endpoint(2), endpoint(3)];
        let sel = selector(&[(1, 80), (2, 15), (3, 40)]);
        let best = sel.select_fastest(&endpoints).await.unwrap();
        assert_eq!(best.name, "loc-2");
    }

    #[tokio::test]
    async fn ties_go_to_earliest() {
        let endpoints = vec![endpoint(1), endpoint(2), endpoint(3)];
        let sel = selector(&[(1, 30), (2, 10), (3, 10)]);
        let best = sel.select_fastest(&endpoints).await.unwrap();
        assert_eq!(best.name, "loc-2");
    }

    #[tokio::test]
    async fn empty_list_is_an_error() {
        let sel = selector(&[]);
        assert_eq!(sel.select_fastest(&[]).await, Err(SelectError::NoEndpoints));
        assert_eq!(sel.rank_all(&[]).await, Err(SelectError::NoEndpoints));
    }

    /// Records which addresses are in flight at once.
    #[derive(Default)]
    struct TrackingProbe {
        in_flight: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
        started: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LatencyProbe for TrackingProbe {
        async fn probe(&self, address: &str) -> ProbeOutcome {
            use std::sync::atomic::Ordering;

            self.started.lock().unwrap().push(address.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            ProbeOutcome::Reachable(Duration::from_millis(1))
        }
    }

    #[tokio::test]
    async fn spawning_is_bounded_and_in_order() {
        let endpoints: Vec<Endpoint> = (1..=10).map(endpoint).collect();
        let probe = Arc::new(TrackingProbe::default());
        let sel = Selector::new(probe.clone()).with_max_parallel(3);

        let outcomes = sel.probe_all(&endpoints).await;

        assert_eq!(outcomes.len(), 10);
        assert!(outcomes.iter().all(ProbeOutcome::is_reachable));
        assert!(probe.peak.load(std::sync::atomic::Ordering::SeqCst) <= 3);
        let started = probe.started.lock().unwrap().clone();
        let expected: Vec<String> = endpoints.iter().map(|e| e.ip_address.clone()).collect();
        // Later endpoints only start once an earlier one has finished
        let mut first_wave = started[..3].to_vec();
        first_wave.sort();
        let mut head = expected[..3].to_vec();
        head.sort();
        assert_eq!(first_wave, head);
        let mut sorted = started.clone();
        sorted.sort();
        let mut all = expected.clone();
        all.sort();
        assert_eq!(sorted, all);
    }

    #[tokio::test]
    async fn single_permit_still_probes_everything() {
        let endpoints = vec![endpoint(1), endpoint(2), endpoint(3), endpoint(4)];
        let sel = selector(&[(1, 5), (2, 6), (3, 7), (4, 8)]).with_max_parallel(0);
        let outcomes = sel.probe_all(&endpoints).await;
        assert!(outcomes.iter().all(ProbeOutcome::is_reachable));
    }
}
