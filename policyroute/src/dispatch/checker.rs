use crate::dispatch::group::Strategy;
use crate::dispatch::{Engine, ProbeTransport, Registry};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Periodic probing of LatencyAuto groups, one task per group.
///
/// Tasks only hold a weak reference to the engine and stop once it is gone
/// or their group disappears from the live registry.
pub(crate) struct HealthChecker {
    engine: Weak<Engine>,
    transport: Arc<dyn ProbeTransport>,
    runtime: Handle,
    tasks: Vec<JoinHandle<()>>,
}

impl HealthChecker {
    pub fn new(engine: Weak<Engine>, transport: Arc<dyn ProbeTransport>) -> Self {
        Self {
            engine,
            transport,
            runtime: Handle::current(),
            tasks: vec![],
        }
    }

    /// Replace the running tasks with ones matching `registry`.
    pub fn respawn(&mut self, registry: &Registry) {
        self.abort_all();
        for group in registry.iter() {
            let Strategy::LatencyAuto(auto) = group.strategy() else {
                continue;
            };
            if auto.interval.is_zero() {
                continue;
            }
            self.tasks.push(self.runtime.spawn(run_group(
                self.engine.clone(),
                self.transport.clone(),
                group.name().to_string(),
                auto.interval,
            )));
        }
        tracing::debug!("Health checks running for {} groups", self.tasks.len());
    }

    fn abort_all(&mut self) {
        for t in self.tasks.drain(..) {
            t.abort();
        }
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.abort_all();
    }
}

async fn run_group(
    engine: Weak<Engine>,
    transport: Arc<dyn ProbeTransport>,
    group: String,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let Some(engine) = engine.upgrade() else {
            return;
        };
        if let Err(e) = engine.probe_group(transport.as_ref(), &group).await {
            tracing::debug!("Stop health check: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::dispatch::group::{AutoSettings, GroupSpec, MemberRef, Strategy};
    use crate::dispatch::health::tests::ScriptedProbe;
    use crate::dispatch::health::Latency;
    use crate::dispatch::proxy::test_node;
    use crate::dispatch::{ConnTarget, Engine, HealthTracker, NodeFilter, NodePool, Profile};
    use crate::dispatch::Action;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_periodic_probe() {
        let profile = Profile {
            groups: vec![GroupSpec {
                name: "Auto".to_string(),
                strategy: Strategy::LatencyAuto(AutoSettings {
                    url: "http://cp.cloudflare.com".to_string(),
                    interval: Duration::from_millis(20),
                    tolerance: Duration::from_millis(50),
                }),
                members: vec![MemberRef::Nodes(NodeFilter::All)],
            }],
            rules: vec!["MATCH,Auto".to_string()],
            nodes: NodePool::new(vec![test_node("SG 01"), test_node("SG 02")]).unwrap(),
            ..Default::default()
        };
        let engine = Arc::new(Engine::new(profile, Arc::new(HealthTracker::default())).unwrap());
        let probe = Arc::new(ScriptedProbe {
            replies: HashMap::from([
                ("sg-01.example.net".to_string(), Latency::Value(Duration::from_millis(90))),
                ("sg-02.example.net".to_string(), Latency::Value(Duration::from_millis(10))),
            ]),
            delay: Duration::ZERO,
        });
        // no probe has run yet
        assert_eq!(engine.classify(&ConnTarget::domain("a.com", 80)), Action::Direct);
        engine.start_health_checks(probe);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let action = engine.classify(&ConnTarget::domain("a.com", 80));
        assert!(matches!(action, Action::Dial(ref n) if n.name() == "SG 02"));
    }
}
