use crate::dispatch::{Endpoint, Node};
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Latency {
    Value(Duration),
    Unreachable,
}

impl Display for Latency {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Latency::Value(rtt) => write!(f, "{} ms", rtt.as_millis()),
            Latency::Unreachable => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthSample {
    pub node: String,
    pub url: String,
    pub latency: Latency,
    pub at: Instant,
}

/// Measures the round trip through an endpoint to `url`.
///
/// Implementations should give up at `deadline`; the tracker enforces it
/// again and counts an overrun as [`Latency::Unreachable`].
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint, url: &str, deadline: Duration) -> Latency;
}

/// Latest sample per (node, probe url). Readers never block writers.
pub struct HealthTracker {
    samples: DashMap<(String, String), HealthSample>,
    probe_timeout: Duration,
    stale_after: Duration,
}

impl HealthTracker {
    pub fn new(probe_timeout: Duration, stale_after: Duration) -> Self {
        Self {
            samples: DashMap::new(),
            probe_timeout,
            stale_after,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Supersede whatever was stored for the same key.
    pub fn record(&self, sample: HealthSample) {
        self.samples
            .insert((sample.node.clone(), sample.url.clone()), sample);
    }

    pub fn sample(&self, node: &str, url: &str) -> Option<HealthSample> {
        self.samples
            .get(&(node.to_string(), url.to_string()))
            .map(|s| s.value().clone())
    }

    /// RTT of a sample that is neither stale nor unreachable.
    pub fn fresh_latency(&self, node: &str, url: &str) -> Option<Duration> {
        let sample = self.samples.get(&(node.to_string(), url.to_string()))?;
        match sample.latency {
            Latency::Value(rtt) if sample.at.elapsed() <= self.stale_after => Some(rtt),
            _ => None,
        }
    }

    /// Most recent sample of a node across all probe urls.
    pub fn latest_for_node(&self, node: &str) -> Option<HealthSample> {
        self.samples
            .iter()
            .filter(|e| e.key().0 == node)
            .max_by_key(|e| e.value().at)
            .map(|e| e.value().clone())
    }

    /// Drop samples of nodes no longer in the pool.
    pub fn retain_nodes<F: Fn(&str) -> bool>(&self, keep: F) {
        self.samples.retain(|(node, _), _| keep(node));
    }

    /// Probe one node and store the result.
    pub async fn probe(
        &self,
        transport: &dyn ProbeTransport,
        node: &Node,
        url: &str,
    ) -> Latency {
        let latency = match tokio::time::timeout(
            self.probe_timeout,
            transport.probe(node.endpoint(), url, self.probe_timeout),
        )
        .await
        {
            Ok(l) => l,
            Err(_) => Latency::Unreachable,
        };
        if latency == Latency::Unreachable {
            tracing::debug!("Probe {} via {} failed", url, node.name());
        } else {
            tracing::trace!("Probe {} via {}: {}", url, node.name(), latency);
        }
        self.record(HealthSample {
            node: node.name().to_string(),
            url: url.to_string(),
            latency,
            at: Instant::now(),
        });
        latency
    }

    /// Lowest fresh RTT among `nodes`, keeping `current` unless something
    /// beats it by more than `tolerance`. Ties go to the earlier node.
    pub fn best(
        &self,
        url: &str,
        nodes: &[Arc<Node>],
        tolerance: Duration,
        current: Option<&str>,
    ) -> Option<Arc<Node>> {
        let mut best: Option<(&Arc<Node>, Duration)> = None;
        let mut active: Option<(&Arc<Node>, Duration)> = None;
        for node in nodes {
            let Some(rtt) = self.fresh_latency(node.name(), url) else {
                continue;
            };
            if best.map_or(true, |(_, b)| rtt < b) {
                best = Some((node, rtt));
            }
            if current == Some(node.name()) {
                active = Some((node, rtt));
            }
        }
        let (best_node, best_rtt) = best?;
        match active {
            Some((node, rtt)) if rtt.saturating_sub(best_rtt) <= tolerance => Some(node.clone()),
            _ => Some(best_node.clone()),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(900))
    }
}

pub fn pretty_latency(latency: Option<Latency>) -> Option<String> {
    latency.map(|l| match l {
        Latency::Value(rtt) if rtt.as_millis() >= 1000 => {
            format!("{:.2}s", rtt.as_millis() as f64 / 1000.0)
        }
        l => l.to_string(),
    })
}
