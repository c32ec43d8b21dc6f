use crate::config::BuildError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Names that always mean a literal action and can't be used by nodes or groups.
pub const RESERVED_NAMES: [&str; 2] = ["DIRECT", "REJECT"];

/// How to reach an upstream node. Protocol parameters are kept as-is and
/// never interpreted by the engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub server: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub protocol: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_yaml::Value>,
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.server.contains(':') {
            write!(f, "{}://[{}]:{}", self.protocol, self.server, self.port)
        } else {
            write!(f, "{}://{}:{}", self.protocol, self.server, self.port)
        }
    }
}

/// Single upstream node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    name: String,
    endpoint: Endpoint,
    tags: BTreeSet<String>,
}

impl Node {
    pub fn new<S: Into<String>>(name: S, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            endpoint,
            tags: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Derives node tags (usually regions) from node names.
#[derive(Debug, Clone, Default)]
pub struct NodeTagger {
    rules: Vec<(String, Regex)>,
}

impl NodeTagger {
    pub fn new(patterns: &BTreeMap<String, String>) -> Result<Self, regex::Error> {
        let mut rules = Vec::with_capacity(patterns.len());
        for (tag, pat) in patterns {
            rules.push((tag.clone(), Regex::new(pat)?));
        }
        Ok(Self { rules })
    }

    pub fn tag(&self, mut node: Node) -> Node {
        node.tags = self
            .rules
            .iter()
            .filter(|(_, re)| re.is_match(&node.name))
            .map(|(tag, _)| tag.clone())
            .collect();
        node
    }
}

/// Owns every known node. Groups hold `Arc`s into the pool.
#[derive(Debug, Clone, Default)]
pub struct NodePool {
    nodes: Vec<Arc<Node>>,
    index: HashMap<String, usize>,
}

impl NodePool {
    pub fn new(nodes: Vec<Node>) -> Result<Self, BuildError> {
        let mut pool = Self::default();
        for node in nodes {
            if RESERVED_NAMES.contains(&node.name()) {
                return Err(BuildError::ReservedName(node.name));
            }
            if pool.index.contains_key(node.name()) {
                return Err(BuildError::DuplicateName(node.name));
            }
            pool.index.insert(node.name.clone(), pool.nodes.len());
            pool.nodes.push(Arc::new(node));
        }
        Ok(pool)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Node>> {
        self.index.get(name).map(|idx| &self.nodes[*idx])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Insert or replace by name; a replaced node keeps its position.
    pub fn upsert(&mut self, node: Node) -> Result<(), BuildError> {
        if RESERVED_NAMES.contains(&node.name()) {
            return Err(BuildError::ReservedName(node.name));
        }
        match self.index.get(node.name()) {
            Some(idx) => self.nodes[*idx] = Arc::new(node),
            None => {
                self.index.insert(node.name.clone(), self.nodes.len());
                self.nodes.push(Arc::new(node));
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<Node>> {
        let idx = self.index.remove(name)?;
        let node = self.nodes.remove(idx);
        for (i, n) in self.nodes.iter().enumerate().skip(idx) {
            self.index.insert(n.name.clone(), i);
        }
        Some(node)
    }

    /// Nodes accepted by `filter`, in pool order.
    pub fn filter(&self, filter: &NodeFilter) -> Vec<Arc<Node>> {
        self.nodes
            .iter()
            .filter(|n| filter.accepts(n))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Predicate selecting nodes from the pool.
#[derive(Debug, Clone)]
pub enum NodeFilter {
    All,
    Regex(Regex),
    Keyword(String),
    Suffix(String),
    Tag(String),
    Not(Box<NodeFilter>),
    And(Vec<NodeFilter>),
}

impl NodeFilter {
    pub fn accepts(&self, node: &Node) -> bool {
        match self {
            NodeFilter::All => true,
            NodeFilter::Regex(re) => re.is_match(node.name()),
            NodeFilter::Keyword(kw) => node.name().contains(kw.as_str()),
            NodeFilter::Suffix(sfx) => node.name().ends_with(sfx.as_str()),
            NodeFilter::Tag(tag) => node.has_tag(tag),
            NodeFilter::Not(inner) => !inner.accepts(node),
            NodeFilter::And(list) => list.iter().all(|f| f.accepts(node)),
        }
    }
}

/// Concrete outcome for a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Direct,
    Reject,
    Dial(Arc<Node>),
}

impl Action {
    pub fn simple_description(&self) -> String {
        match self {
            Action::Direct => "direct".to_string(),
            Action::Reject => "reject".to_string(),
            Action::Dial(node) => format!("dial {}", node.name()),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_node(name: &str) -> Node {
    Node::new(
        name,
        Endpoint {
            server: format!("{}.example.net", name.to_lowercase().replace(' ', "-")),
            port: 443,
            protocol: "trojan".to_string(),
            params: BTreeMap::new(),
        },
    )
}
