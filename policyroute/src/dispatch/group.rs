use crate::config::{BuildError, SelectError};
use crate::dispatch::proxy::RESERVED_NAMES;
use crate::dispatch::{Action, HealthTracker, Node, NodeFilter, NodePool};
use arc_swap::{ArcSwap, ArcSwapOption};
use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Literal {
    Direct,
    Reject,
}

impl Literal {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "DIRECT" => Some(Literal::Direct),
            "REJECT" => Some(Literal::Reject),
            _ => None,
        }
    }

    pub fn action(self) -> Action {
        match self {
            Literal::Direct => Action::Direct,
            Literal::Reject => Action::Reject,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Literal::Direct => RESERVED_NAMES[0],
            Literal::Reject => RESERVED_NAMES[1],
        }
    }
}

/// A member as written in a group declaration.
#[derive(Debug, Clone)]
pub enum MemberRef {
    /// A group, a literal action, or a node, resolved by name at build time
    Named(String),
    /// Every pooled node accepted by the filter
    Nodes(NodeFilter),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoSettings {
    pub url: String,
    pub interval: Duration,
    pub tolerance: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Manual,
    LatencyAuto(AutoSettings),
}

impl Strategy {
    pub fn simple_description(&self) -> &'static str {
        match self {
            Strategy::Manual => "select",
            Strategy::LatencyAuto(_) => "url-test",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub name: String,
    pub strategy: Strategy,
    pub members: Vec<MemberRef>,
}

/// A member after expansion against the node pool.
#[derive(Debug, Clone)]
pub enum Member {
    Group(String),
    Literal(Literal),
    Node(Arc<Node>),
}

impl Member {
    pub fn name(&self) -> &str {
        match self {
            Member::Group(g) => g.as_str(),
            Member::Literal(l) => l.name(),
            Member::Node(n) => n.name(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Member::Group(_) => "group",
            Member::Literal(Literal::Direct) => "direct",
            Member::Literal(Literal::Reject) => "reject",
            Member::Node(n) => n.endpoint().protocol.as_str(),
        }
    }
}

impl Display for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A named group. Members are replaced when the node pool changes, the
/// selection when a user (Manual) or the health tracker (LatencyAuto) picks.
#[derive(Debug)]
pub struct PolicyGroup {
    spec: GroupSpec,
    members: ArcSwap<Vec<Member>>,
    selection: ArcSwapOption<String>,
}

impl PolicyGroup {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn strategy(&self) -> &Strategy {
        &self.spec.strategy
    }

    pub fn members(&self) -> Arc<Vec<Member>> {
        self.members.load_full()
    }

    pub fn selection(&self) -> Option<String> {
        self.selection.load_full().map(|s| s.as_ref().clone())
    }

    fn find_member(&self, name: &str) -> Option<Member> {
        self.members.load().iter().find(|m| m.name() == name).cloned()
    }

    /// The member this group currently routes to.
    fn pick(&self, health: &HealthTracker) -> Option<Member> {
        let members = self.members.load();
        match &self.spec.strategy {
            Strategy::Manual => {
                if let Some(sel) = self.selection.load().as_ref() {
                    if let Some(m) = members.iter().find(|m| m.name() == sel.as_str()) {
                        return Some(m.clone());
                    }
                }
                members.first().cloned()
            }
            Strategy::LatencyAuto(auto) => {
                let candidates: Vec<Arc<Node>> = members
                    .iter()
                    .filter_map(|m| match m {
                        Member::Node(n) => Some(n.clone()),
                        _ => None,
                    })
                    .collect();
                let current = self.selection.load_full();
                match health.best(
                    &auto.url,
                    &candidates,
                    auto.tolerance,
                    current.as_deref().map(String::as_str),
                ) {
                    Some(node) => {
                        if current.as_deref().map(String::as_str) != Some(node.name()) {
                            tracing::info!("Group {} switched to {}", self.name(), node.name());
                            self.selection.store(Some(Arc::new(node.name().to_string())));
                        }
                        Some(Member::Node(node))
                    }
                    None => members
                        .iter()
                        .find(|m| !matches!(m, Member::Node(_)))
                        .cloned(),
                }
            }
        }
    }
}

/// Outcome of resolving a group: the action and the groups walked through.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub action: Action,
    pub chain: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    OnStack,
    Done,
}

/// Validated set of policy groups. The group graph is acyclic.
#[derive(Debug, Default)]
pub struct Registry {
    groups: HashMap<String, Arc<PolicyGroup>>,
    order: Vec<String>,
}

impl Registry {
    /// Declare every group first, then validate references and the group graph.
    pub fn build(specs: Vec<GroupSpec>, pool: &NodePool) -> Result<Registry, BuildError> {
        let mut declared: HashMap<String, usize> = HashMap::new();
        for (idx, spec) in specs.iter().enumerate() {
            if RESERVED_NAMES.contains(&spec.name.as_str()) {
                return Err(BuildError::ReservedName(spec.name.clone()));
            }
            if declared.insert(spec.name.clone(), idx).is_some() || pool.contains(&spec.name) {
                return Err(BuildError::DuplicateName(spec.name.clone()));
            }
        }

        let mut edges: Vec<Vec<usize>> = vec![vec![]; specs.len()];
        for (idx, spec) in specs.iter().enumerate() {
            for m in &spec.members {
                let MemberRef::Named(name) = m else {
                    continue;
                };
                if let Some(target) = declared.get(name.as_str()) {
                    edges[idx].push(*target);
                } else if Literal::from_name(name).is_none() && !pool.contains(name) {
                    return Err(BuildError::UnknownMember {
                        group: spec.name.clone(),
                        member: name.clone(),
                    });
                }
            }
        }

        let mut marks = vec![Mark::New; specs.len()];
        let mut stack = vec![];
        for idx in 0..specs.len() {
            if marks[idx] == Mark::New {
                if let Some(cycle) = find_cycle(idx, &edges, &mut marks, &mut stack) {
                    return Err(BuildError::Cycle {
                        path: cycle.into_iter().map(|i| specs[i].name.clone()).collect(),
                    });
                }
            }
        }

        let mut registry = Registry::default();
        for spec in specs {
            let members = expand_members(&spec, pool, &declared);
            if members.is_empty() {
                tracing::warn!("Group {} has no members", spec.name);
            }
            registry.order.push(spec.name.clone());
            registry.groups.insert(
                spec.name.clone(),
                Arc::new(PolicyGroup {
                    members: ArcSwap::from_pointee(members),
                    selection: ArcSwapOption::empty(),
                    spec,
                }),
            );
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<PolicyGroup>> {
        self.groups.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Groups in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PolicyGroup>> {
        self.order.iter().filter_map(|n| self.groups.get(n))
    }

    /// Follow selections from `name` down to an action. `None` when no
    /// member is usable.
    pub fn resolve(&self, name: &str, health: &HealthTracker) -> Option<Resolution> {
        let mut chain = vec![];
        let mut current = name.to_string();
        loop {
            if let Some(lit) = Literal::from_name(&current) {
                return Some(Resolution {
                    action: lit.action(),
                    chain,
                });
            }
            let group = self.groups.get(&current)?;
            chain.push(current);
            if chain.len() > self.groups.len() {
                tracing::error!("Group resolution loops: {}", chain.join(" -> "));
                return None;
            }
            match group.pick(health)? {
                Member::Group(next) => current = next,
                Member::Literal(lit) => {
                    return Some(Resolution {
                        action: lit.action(),
                        chain,
                    })
                }
                Member::Node(node) => {
                    return Some(Resolution {
                        action: Action::Dial(node),
                        chain,
                    })
                }
            }
        }
    }

    /// Takes effect for every following resolution.
    pub fn select_member(&self, group: &str, member: &str) -> Result<(), SelectError> {
        let g = self
            .groups
            .get(group)
            .ok_or_else(|| SelectError::UnknownGroup(group.to_string()))?;
        if let Strategy::LatencyAuto(_) = g.spec.strategy {
            return Err(SelectError::NotSelectable(group.to_string()));
        }
        let m = g
            .find_member(member)
            .ok_or_else(|| SelectError::UnknownMember {
                group: group.to_string(),
                member: member.to_string(),
            })?;
        g.selection.store(Some(Arc::new(m.name().to_string())));
        Ok(())
    }

    /// Selections worth persisting: user choices on Manual groups.
    pub fn manual_selections(&self) -> HashMap<String, String> {
        self.iter()
            .filter(|g| g.spec.strategy == Strategy::Manual)
            .filter_map(|g| g.selection().map(|s| (g.name().to_string(), s)))
            .collect()
    }

    /// Reapply selections to Manual groups; entries naming missing groups or
    /// members, or automatic groups, are dropped.
    pub fn restore_selections(&self, selections: &HashMap<String, String>) {
        for (group, member) in selections {
            let found = self
                .groups
                .get(group)
                .filter(|g| g.spec.strategy == Strategy::Manual)
                .and_then(|g| Some((g, g.find_member(member)?)));
            match found {
                Some((g, m)) => g.selection.store(Some(Arc::new(m.name().to_string()))),
                None => tracing::debug!("Dropped stale selection {} -> {}", group, member),
            }
        }
    }

    /// A node may not share its name with a group.
    pub fn check_node_names(&self, pool: &NodePool) -> Result<(), BuildError> {
        match pool.iter().find(|n| self.groups.contains_key(n.name())) {
            Some(n) => Err(BuildError::DuplicateName(n.name().to_string())),
            None => Ok(()),
        }
    }

    /// Re-expand every group against a new node pool.
    pub fn apply_node_pool(&self, pool: &NodePool) {
        let declared: HashMap<String, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        for g in self.iter() {
            let members = expand_members(&g.spec, pool, &declared);
            if members.is_empty() {
                tracing::warn!("Group {} has no members after node update", g.name());
            }
            g.members.store(Arc::new(members));
        }
    }
}

// DFS from `idx`; on hitting a node already on the stack, returns the path
// from that node to itself.
fn find_cycle(
    idx: usize,
    edges: &[Vec<usize>],
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    marks[idx] = Mark::OnStack;
    stack.push(idx);
    for &next in &edges[idx] {
        match marks[next] {
            Mark::OnStack => {
                let start = stack.iter().position(|i| *i == next).unwrap_or(0);
                let mut path = stack[start..].to_vec();
                path.push(next);
                return Some(path);
            }
            Mark::New => {
                if let Some(path) = find_cycle(next, edges, marks, stack) {
                    return Some(path);
                }
            }
            Mark::Done => {}
        }
    }
    stack.pop();
    marks[idx] = Mark::Done;
    None
}

fn expand_members(
    spec: &GroupSpec,
    pool: &NodePool,
    groups: &HashMap<String, usize>,
) -> Vec<Member> {
    let mut expanded = vec![];
    for m in &spec.members {
        match m {
            MemberRef::Named(name) => {
                if groups.contains_key(name.as_str()) {
                    expanded.push(Member::Group(name.clone()));
                } else if let Some(lit) = Literal::from_name(name) {
                    expanded.push(Member::Literal(lit));
                } else if let Some(node) = pool.get(name) {
                    expanded.push(Member::Node(node.clone()));
                } else {
                    tracing::warn!("Node {} of group {} is gone", name, spec.name);
                }
            }
            MemberRef::Nodes(filter) => {
                expanded.extend(pool.filter(filter).into_iter().map(Member::Node))
            }
        }
    }
    // the same member listed twice keeps its last position
    let mut last = HashMap::new();
    for (idx, m) in expanded.iter().enumerate() {
        last.insert(m.name().to_string(), idx);
    }
    let mut seen = HashSet::new();
    expanded
        .into_iter()
        .enumerate()
        .filter(|(idx, m)| last.get(m.name()) == Some(idx) && seen.insert(m.name().to_string()))
        .map(|(_, m)| m)
        .collect()
}
