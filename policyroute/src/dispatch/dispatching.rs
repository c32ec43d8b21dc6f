use crate::config::{BuildError, LinkedState, LoadError, SelectError};
use crate::dispatch::checker::HealthChecker;
use crate::dispatch::group::{GroupSpec, Member, Strategy};
use crate::dispatch::health::pretty_latency;
use crate::dispatch::rule::{CountryLookup, RuleBuilder, RuleMatch, RuleTable};
use crate::dispatch::ruleset::{RuleSetSource, RuleSetStore};
use crate::dispatch::{Action, ConnTarget, HealthTracker, NodePool, ProbeTransport, Registry};
use arc_swap::ArcSwap;
use futures::future::join_all;
use policyapi::{DecisionSchema, GroupSchema, MemberSchema, RuleSetSchema};
use std::sync::{Arc, Mutex};

/// Everything a reload supplies.
#[derive(Clone, Default)]
pub struct Profile {
    pub rule_sets: Vec<RuleSetSource>,
    pub groups: Vec<GroupSpec>,
    pub rules: Vec<String>,
    pub nodes: NodePool,
    pub geoip: Option<Arc<dyn CountryLookup>>,
}

/// One consistent version of rule sets, groups and rules.
pub struct Dispatching {
    store: RuleSetStore,
    registry: Registry,
    table: RuleTable,
    warnings: Vec<String>,
}

impl Dispatching {
    /// A malformed rule set only degrades to an empty one; anything else
    /// rejects the whole build.
    pub fn build(profile: &Profile, nodes: &NodePool) -> Result<Self, BuildError> {
        let mut warnings = vec![];
        let mut store = RuleSetStore::new();
        for source in &profile.rule_sets {
            if store.get(&source.name).is_some() {
                return Err(BuildError::DuplicateName(source.name.clone()));
            }
            if let (_, Some(e)) = store.load_or_empty(source) {
                warnings.push(format!("{}; treated as empty", e));
            }
        }
        let registry = Registry::build(profile.groups.clone(), nodes)?;
        let mut builder = RuleBuilder::new(&store, &registry, profile.geoip.clone());
        for r in &profile.rules {
            builder.append_literal(r)?;
        }
        let (table, rule_warnings) = builder.build()?;
        for w in &rule_warnings {
            tracing::warn!("{}", w);
        }
        warnings.extend(rule_warnings);
        Ok(Self {
            store,
            registry,
            table,
            warnings,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn rule_sets(&self) -> &RuleSetStore {
        &self.store
    }

    pub fn table(&self) -> &RuleTable {
        &self.table
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// Full outcome of classifying one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub rule: String,
    pub rule_match: RuleMatch,
    pub group: String,
    pub chain: Vec<String>,
    /// Resolution found nothing usable and Direct was substituted.
    pub fallback: bool,
}

impl Decision {
    pub fn to_schema(&self, target: &ConnTarget) -> DecisionSchema {
        let (action, endpoint) = match &self.action {
            Action::Direct => ("DIRECT".to_string(), None),
            Action::Reject => ("REJECT".to_string(), None),
            Action::Dial(node) => (node.name().to_string(), Some(node.endpoint().to_string())),
        };
        DecisionSchema {
            target: target.to_string(),
            rule: self.rule.clone(),
            rule_index: match self.rule_match {
                RuleMatch::Index(i) => Some(i),
                RuleMatch::MatchAll => None,
            },
            group: self.group.clone(),
            chain: self.chain.clone(),
            action,
            endpoint,
            fallback: self.fallback,
        }
    }
}

/// Classification entry point shared by every connection.
///
/// Readers load the live [`Dispatching`] once per call; reloads build a new
/// one aside and swap it in only when it is complete.
pub struct Engine {
    live: ArcSwap<Dispatching>,
    nodes: ArcSwap<NodePool>,
    health: Arc<HealthTracker>,
    state: Option<Mutex<LinkedState>>,
    verbose: bool,
    // serializes writers; classification never takes it
    update_lock: Mutex<()>,
    checker: Mutex<Option<HealthChecker>>,
}

impl Engine {
    pub fn new(profile: Profile, health: Arc<HealthTracker>) -> Result<Self, BuildError> {
        let dispatching = Dispatching::build(&profile, &profile.nodes)?;
        Ok(Self {
            live: ArcSwap::from_pointee(dispatching),
            nodes: ArcSwap::from_pointee(profile.nodes),
            health,
            state: None,
            verbose: false,
            update_lock: Mutex::new(()),
            checker: Mutex::new(None),
        })
    }

    /// Restore persisted selections before the first classification and
    /// write back every later one.
    pub fn with_state(self, state: LinkedState) -> Self {
        self.live
            .load()
            .registry
            .restore_selections(&state.state.group_selection);
        Self {
            state: Some(Mutex::new(state)),
            ..self
        }
    }

    pub fn with_verbose(self, verbose: bool) -> Self {
        Self { verbose, ..self }
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn dispatching(&self) -> Arc<Dispatching> {
        self.live.load_full()
    }

    pub fn classify(&self, target: &ConnTarget) -> Action {
        self.decide(target).action
    }

    /// Never fails: a group that resolves to nothing yields Direct.
    pub fn decide(&self, target: &ConnTarget) -> Decision {
        let dispatching = self.live.load();
        let (rule_match, rule) = dispatching.table.classify(target);
        let (action, chain, fallback) =
            match dispatching.registry.resolve(rule.target(), &self.health) {
                Some(res) => (res.action, res.chain, false),
                None => {
                    tracing::warn!(
                        "[{}] {} => {} has no usable member, falling back to DIRECT",
                        rule,
                        target,
                        rule.target()
                    );
                    (Action::Direct, vec![rule.target().to_string()], true)
                }
            };
        if self.verbose {
            tracing::info!("[{}] {} => {}", rule, target, action.simple_description());
        } else {
            tracing::debug!("[{}] {} => {}", rule, target, action.simple_description());
        }
        Decision {
            action,
            rule: rule.literal().to_string(),
            rule_match,
            group: rule.target().to_string(),
            chain,
            fallback,
        }
    }

    /// Build `profile` aside and promote it. On error the running version
    /// stays untouched.
    pub fn reload(&self, profile: Profile) -> Result<(), BuildError> {
        let _guard = self.update_lock.lock().unwrap_or_else(|e| e.into_inner());
        let staged = match Dispatching::build(&profile, &profile.nodes) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!("Reloading rules failed: {}", e);
                return Err(e);
            }
        };
        let old = self.live.load();
        staged
            .registry
            .restore_selections(&old.registry.manual_selections());
        self.health.retain_nodes(|n| profile.nodes.contains(n));
        self.nodes.store(Arc::new(profile.nodes));
        self.live.store(Arc::new(staged));
        self.respawn_checks();
        tracing::info!(
            "Reloaded {} rules, {} groups",
            self.live.load().table.len(),
            self.live.load().registry.len()
        );
        Ok(())
    }

    /// Replace the node pool and re-expand every group against it. A pool
    /// whose names clash with a group is rejected and the current one stays.
    pub fn update_nodes(&self, pool: NodePool) -> Result<(), BuildError> {
        let _guard = self.update_lock.lock().unwrap_or_else(|e| e.into_inner());
        let dispatching = self.live.load();
        if let Err(e) = dispatching.registry.check_node_names(&pool) {
            tracing::error!("Updating nodes failed: {}", e);
            return Err(e);
        }
        dispatching.registry.apply_node_pool(&pool);
        self.health.retain_nodes(|n| pool.contains(n));
        tracing::info!("Node pool updated: {} nodes", pool.len());
        self.nodes.store(Arc::new(pool));
        Ok(())
    }

    pub fn nodes(&self) -> Arc<NodePool> {
        self.nodes.load_full()
    }

    pub fn select_member(&self, group: &str, member: &str) -> Result<(), SelectError> {
        // a concurrent reload must not copy selections between these two steps
        let _guard = self.update_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.live.load().registry.select_member(group, member)?;
        if let Some(state) = &self.state {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            state.set_selection(group, member);
            if let Err(e) = state.flush() {
                tracing::error!("Write state failed: {}", e);
            }
        }
        Ok(())
    }

    /// Swap a new version of a registered rule set into the live store.
    pub fn refresh_rule_set(&self, source: &RuleSetSource) -> Result<u64, LoadError> {
        self.live.load().store.refresh(source)
    }

    pub fn groups(&self) -> Vec<GroupSchema> {
        let dispatching = self.live.load();
        dispatching
            .registry
            .iter()
            .map(|g| {
                let url = match g.strategy() {
                    Strategy::LatencyAuto(auto) => Some(auto.url.as_str()),
                    Strategy::Manual => None,
                };
                GroupSchema {
                    name: g.name().to_string(),
                    strategy: g.strategy().simple_description().to_string(),
                    selected: g.selection(),
                    members: g
                        .members()
                        .iter()
                        .map(|m| MemberSchema {
                            name: m.name().to_string(),
                            kind: m.kind().to_string(),
                            latency: match m {
                                Member::Node(n) => pretty_latency(
                                    url.and_then(|u| self.health.sample(n.name(), u))
                                        .or_else(|| self.health.latest_for_node(n.name()))
                                        .map(|s| s.latency),
                                ),
                                _ => None,
                            },
                        })
                        .collect(),
                }
            })
            .collect()
    }

    pub fn rule_sets(&self) -> Vec<RuleSetSchema> {
        self.live
            .load()
            .store
            .handles()
            .into_iter()
            .map(|h| {
                let rs = h.current();
                RuleSetSchema {
                    name: rs.name().to_string(),
                    version: rs.version(),
                    patterns: rs.pattern_count(),
                    loaded_at: rs.loaded_at().format("%Y-%m-%d %H:%M:%S").to_string(),
                }
            })
            .collect()
    }

    /// Probe every node member of `group` once, concurrently. Returns the
    /// number of nodes probed.
    pub async fn probe_group(
        &self,
        transport: &dyn ProbeTransport,
        group: &str,
    ) -> Result<usize, SelectError> {
        tracing::trace!("Start speedtest for group {}", group);
        let dispatching = self.live.load_full();
        let g = dispatching
            .registry
            .get(group)
            .ok_or_else(|| SelectError::UnknownGroup(group.to_string()))?;
        let url = match g.strategy() {
            Strategy::LatencyAuto(auto) => auto.url.clone(),
            Strategy::Manual => crate::config::DEFAULT_PROBE_URL.to_string(),
        };
        let members = g.members();
        let probes = members.iter().filter_map(|m| match m {
            Member::Node(n) => Some(self.health.probe(transport, n, &url)),
            _ => None,
        });
        let count = join_all(probes).await.len();
        if let Strategy::LatencyAuto(_) = g.strategy() {
            // re-evaluate now so the active node follows the new samples
            let _ = dispatching.registry.resolve(group, &self.health);
        }
        Ok(count)
    }

    /// Probe every LatencyAuto group on its own interval until the engine
    /// is dropped. Must be called within a tokio runtime.
    pub fn start_health_checks(self: &Arc<Self>, transport: Arc<dyn ProbeTransport>) {
        let mut checker = HealthChecker::new(Arc::downgrade(self), transport);
        checker.respawn(&self.live.load().registry);
        *self.checker.lock().unwrap_or_else(|e| e.into_inner()) = Some(checker);
    }

    fn respawn_checks(&self) {
        if let Some(checker) = self
            .checker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            checker.respawn(&self.live.load().registry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::group::{AutoSettings, MemberRef};
    use crate::dispatch::health::tests::ScriptedProbe;
    use crate::dispatch::health::{HealthSample, Latency};
    use crate::dispatch::proxy::test_node;
    use crate::dispatch::ruleset::Behavior;
    use crate::dispatch::NodeFilter;
    use std::collections::HashMap;
    use std::time::{Duration, Instant};
    use tracing_test::traced_test;

    const URL: &str = "http://www.gstatic.com/generate_204";

    fn profile() -> Profile {
        Profile {
            rule_sets: vec![RuleSetSource::inline(
                "BanAD",
                Behavior::Domain,
                &["ads.example.com"],
            )],
            groups: vec![
                GroupSpec {
                    name: "Reject".to_string(),
                    strategy: Strategy::Manual,
                    members: vec![
                        MemberRef::Named("REJECT".to_string()),
                        MemberRef::Named("DIRECT".to_string()),
                    ],
                },
                GroupSpec {
                    name: "AutoSelect".to_string(),
                    strategy: Strategy::LatencyAuto(AutoSettings {
                        url: URL.to_string(),
                        interval: Duration::from_secs(300),
                        tolerance: Duration::from_millis(50),
                    }),
                    members: vec![MemberRef::Nodes(NodeFilter::All)],
                },
            ],
            rules: vec![
                "RULE-SET,BanAD,Reject".to_string(),
                "MATCH,AutoSelect".to_string(),
            ],
            nodes: NodePool::new(vec![test_node("HK 01"), test_node("JP 01")]).unwrap(),
            geoip: None,
        }
    }

    fn rtt(health: &HealthTracker, node: &str, ms: u64) {
        health.record(HealthSample {
            node: node.to_string(),
            url: URL.to_string(),
            latency: Latency::Value(Duration::from_millis(ms)),
            at: Instant::now(),
        });
    }

    #[test]
    fn test_end_to_end() {
        let health = Arc::new(HealthTracker::default());
        let engine = Engine::new(profile(), health.clone()).unwrap();
        rtt(&health, "HK 01", 180);
        rtt(&health, "JP 01", 60);
        assert_eq!(
            engine.classify(&ConnTarget::domain("ads.example.com", 443)),
            Action::Reject
        );
        let d = engine.decide(&ConnTarget::domain("foo.com", 443));
        assert!(matches!(d.action, Action::Dial(ref n) if n.name() == "JP 01"));
        assert_eq!(d.rule_match, RuleMatch::MatchAll);
        assert!(!d.fallback);
        let schema = d.to_schema(&ConnTarget::domain("foo.com", 443));
        assert_eq!(schema.action, "JP 01");
        assert_eq!(schema.endpoint.as_deref(), Some("trojan://jp-01.example.net:443"));
    }

    #[traced_test]
    #[test]
    fn test_falls_back_to_direct() {
        let engine = Engine::new(profile(), Arc::new(HealthTracker::default())).unwrap();
        let d = engine.decide(&ConnTarget::domain("foo.com", 443));
        assert_eq!(d.action, Action::Direct);
        assert!(d.fallback);
        assert!(logs_contain("falling back to DIRECT"));
    }

    #[test]
    fn test_rejected_reload_keeps_old_version() {
        let health = Arc::new(HealthTracker::default());
        let engine = Engine::new(profile(), health).unwrap();
        engine.select_member("Reject", "DIRECT").unwrap();

        let mut missing_match = profile();
        missing_match.rules.pop();
        assert_eq!(engine.reload(missing_match), Err(BuildError::MissingMatchAll));

        let mut cyclic = profile();
        cyclic.groups.push(GroupSpec {
            name: "Loop".to_string(),
            strategy: Strategy::Manual,
            members: vec![MemberRef::Named("Loop".to_string())],
        });
        assert!(matches!(engine.reload(cyclic), Err(BuildError::Cycle { .. })));

        // prior table and registry still answer
        assert_eq!(
            engine.classify(&ConnTarget::domain("ads.example.com", 443)),
            Action::Direct
        );
        assert_eq!(engine.dispatching().table().len(), 2);
        assert!(engine.dispatching().registry().get("Loop").is_none());
    }

    #[test]
    fn test_reload_carries_selection() {
        let engine = Engine::new(profile(), Arc::new(HealthTracker::default())).unwrap();
        engine.select_member("Reject", "DIRECT").unwrap();
        let mut next = profile();
        next.rules.insert(0, "DOMAIN-SUFFIX,example.org,Reject".to_string());
        engine.reload(next).unwrap();
        assert_eq!(engine.dispatching().table().len(), 3);
        assert_eq!(
            engine.classify(&ConnTarget::domain("www.example.org", 443)),
            Action::Direct
        );
        assert_eq!(
            engine.select_member("Reject", "Nope"),
            Err(SelectError::UnknownMember {
                group: "Reject".to_string(),
                member: "Nope".to_string()
            })
        );
    }

    #[test]
    fn test_update_nodes() {
        let health = Arc::new(HealthTracker::default());
        let engine = Engine::new(profile(), health.clone()).unwrap();
        rtt(&health, "HK 01", 100);
        rtt(&health, "US 01", 20);
        engine
            .update_nodes(NodePool::new(vec![test_node("HK 01"), test_node("US 01")]).unwrap())
            .unwrap();
        let action = engine.classify(&ConnTarget::domain("foo.com", 443));
        assert!(matches!(action, Action::Dial(ref n) if n.name() == "US 01"));
        let groups = engine.groups();
        let auto = groups.iter().find(|g| g.name == "AutoSelect").unwrap();
        assert_eq!(auto.members.len(), 2);
        assert_eq!(auto.selected.as_deref(), Some("US 01"));
        assert_eq!(auto.members[1].latency.as_deref(), Some("20 ms"));

        // a node named like a group is refused, same as on reload
        let clash = NodePool::new(vec![test_node("HK 01"), test_node("Reject")]).unwrap();
        assert_eq!(
            engine.update_nodes(clash.clone()),
            Err(BuildError::DuplicateName("Reject".to_string()))
        );
        assert_eq!(engine.nodes().len(), 2);
        assert!(engine.nodes().contains("US 01"));
        let mut next = profile();
        next.nodes = clash;
        assert_eq!(
            engine.reload(next),
            Err(BuildError::DuplicateName("Reject".to_string()))
        );
    }

    #[test]
    fn test_reload_drops_automatic_selection() {
        let health = Arc::new(HealthTracker::default());
        let engine = Engine::new(profile(), health.clone()).unwrap();
        engine.select_member("Reject", "DIRECT").unwrap();
        rtt(&health, "JP 01", 60);
        let _ = engine.classify(&ConnTarget::domain("foo.com", 443));
        let before = engine.dispatching();
        assert_eq!(
            before.registry().get("AutoSelect").unwrap().selection().as_deref(),
            Some("JP 01")
        );

        engine.reload(profile()).unwrap();
        let after = engine.dispatching();
        let registry = after.registry();
        assert_eq!(registry.get("Reject").unwrap().selection().as_deref(), Some("DIRECT"));
        assert_eq!(registry.get("AutoSelect").unwrap().selection(), None);
    }

    #[test]
    fn test_refresh_rule_set_is_live() {
        let engine = Engine::new(profile(), Arc::new(HealthTracker::default())).unwrap();
        let v = engine
            .refresh_rule_set(&RuleSetSource::inline(
                "BanAD",
                Behavior::Domain,
                &["+.tracker.example.net"],
            ))
            .unwrap();
        assert_eq!(v, 2);
        assert_eq!(
            engine.classify(&ConnTarget::domain("a.tracker.example.net", 443)),
            Action::Reject
        );
        assert_eq!(engine.rule_sets()[0].version, 2);
    }

    #[tokio::test]
    async fn test_probe_group() {
        let health = Arc::new(HealthTracker::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
        ));
        let engine = Engine::new(profile(), health).unwrap();
        let probe = ScriptedProbe {
            replies: HashMap::from([
                ("hk-01.example.net".to_string(), Latency::Value(Duration::from_millis(30))),
                ("jp-01.example.net".to_string(), Latency::Unreachable),
            ]),
            delay: Duration::ZERO,
        };
        assert_eq!(engine.probe_group(&probe, "AutoSelect").await, Ok(2));
        let auto = engine
            .groups()
            .into_iter()
            .find(|g| g.name == "AutoSelect")
            .unwrap();
        assert_eq!(auto.selected.as_deref(), Some("HK 01"));
        assert_eq!(auto.members[1].latency.as_deref(), Some("Failed"));
        assert!(engine.probe_group(&probe, "Nope").await.is_err());
    }
}
