use crate::common::host_matcher::{HostMatcher, HostMatcherBuilder};
use crate::config::LoadError;
use crate::dispatch::ConnTarget;
use aho_corasick::AhoCorasick;
use arc_swap::ArcSwap;
use chrono::{DateTime, Local};
use ipnet::IpNet;
use radix_trie::{Trie, TrieCommon};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatcherKind {
    DomainSuffix,
    DomainKeyword,
    ExactDomain,
    IpCidr,
    ProcessName,
}

/// How the entries of a provider are interpreted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Behavior {
    /// `+.x`, `*.x` and `.x` are suffixes, bare entries are exact
    Domain,
    DomainSuffix,
    DomainKeyword,
    #[serde(alias = "ip-cidr")]
    Ipcidr,
    ProcessName,
    /// `KIND,value[,no-resolve]` per entry
    Classical,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Text,
    #[default]
    Yaml,
}

/// Raw content of a named rule set together with how to read it.
#[derive(Debug, Clone)]
pub struct RuleSetSource {
    pub name: String,
    pub behavior: Behavior,
    pub format: PayloadFormat,
    pub content: String,
    pub refresh_interval: Option<Duration>,
}

impl RuleSetSource {
    pub fn inline<S: Into<String>>(name: S, behavior: Behavior, entries: &[&str]) -> Self {
        Self {
            name: name.into(),
            behavior,
            format: PayloadFormat::Text,
            content: entries.join("\n"),
            refresh_interval: None,
        }
    }
}

#[derive(Deserialize)]
struct RawRuleSchema {
    #[serde(default)]
    payload: Vec<serde_yaml::Value>,
}

fn ip_to_bits(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => octets_to_bits(&v4.octets(), 32),
        IpAddr::V6(v6) => octets_to_bits(&v6.octets(), 128),
    }
}

fn octets_to_bits(octets: &[u8], prefix_len: u8) -> Vec<u8> {
    let mut ret = Vec::with_capacity(prefix_len as usize);
    for oct in octets {
        for i in (0..8).rev() {
            if ret.len() == prefix_len as usize {
                return ret;
            }
            ret.push(u8::from(oct & (1 << i) != 0));
        }
    }
    ret
}

/// CIDR blocks of one address family, keyed by their prefix bits.
struct CidrTable {
    trie: Trie<Vec<u8>, ()>,
    // a /0 entry has an empty key
    covers_all: bool,
    count: usize,
}

impl CidrTable {
    fn new(nets: Vec<Vec<u8>>) -> Self {
        let count = nets.len();
        let covers_all = nets.iter().any(|n| n.is_empty());
        Self {
            trie: Trie::from_iter(nets.into_iter().filter(|n| !n.is_empty()).map(|n| (n, ()))),
            covers_all,
            count,
        }
    }

    fn contains(&self, bits: &[u8]) -> bool {
        if self.covers_all {
            return true;
        }
        if self.count == 0 {
            return false;
        }
        self.trie
            .get_ancestor(bits)
            .is_some_and(|sub| sub.value().is_some())
    }
}

/// One immutable version of a named rule set.
pub struct RuleSet {
    name: String,
    version: u64,
    loaded_at: DateTime<Local>,
    refresh_interval: Option<Duration>,
    domain: HostMatcher,
    domain_keyword: Option<AhoCorasick>,
    keyword_count: usize,
    ip_v4: CidrTable,
    ip_v6: CidrTable,
    process_name: HashSet<String>,
    skipped: usize,
}

impl Debug for RuleSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RULE-SET({}@v{})", self.name, self.version)
    }
}

impl RuleSet {
    /// Domain kinds only look at the domain, CIDR only at the address; a
    /// kind/target mismatch is a plain non-match.
    pub fn matches(&self, target: &ConnTarget) -> bool {
        if let Some(domain) = target.domain.as_deref() {
            if self.domain.matches(domain)
                || self
                    .domain_keyword
                    .as_ref()
                    .is_some_and(|ac| ac.is_match(domain))
            {
                return true;
            }
        }
        if let Some(ip) = target.ip {
            let bits = ip_to_bits(ip);
            let hit = match ip {
                IpAddr::V4(_) => self.ip_v4.contains(&bits),
                IpAddr::V6(_) => self.ip_v6.contains(&bits),
            };
            if hit {
                return true;
            }
        }
        if let Some(proc) = target.process_name.as_ref() {
            if self.process_name.contains(proc) {
                return true;
            }
        }
        false
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> DateTime<Local> {
        self.loaded_at
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval
    }

    pub fn pattern_count(&self) -> usize {
        self.domain.len()
            + self.keyword_count
            + self.ip_v4.count
            + self.ip_v6.count
            + self.process_name.len()
    }

    /// Well-formed entries of kinds the engine does not index.
    pub fn skipped_count(&self) -> usize {
        self.skipped
    }

    fn empty(name: &str, version: u64, refresh_interval: Option<Duration>) -> Self {
        RuleSet {
            name: name.to_string(),
            version,
            loaded_at: Local::now(),
            refresh_interval,
            domain: HostMatcherBuilder::new().build(),
            domain_keyword: None,
            keyword_count: 0,
            ip_v4: CidrTable::new(vec![]),
            ip_v6: CidrTable::new(vec![]),
            process_name: HashSet::new(),
            skipped: 0,
        }
    }
}

pub struct RuleSetBuilder {
    name: String,
    domain: HostMatcherBuilder,
    domain_keyword: Vec<String>,
    ip_v4: Vec<Vec<u8>>,
    ip_v6: Vec<Vec<u8>>,
    process_name: HashSet<String>,
    skipped: usize,
}

impl RuleSetBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            domain: HostMatcherBuilder::new(),
            domain_keyword: vec![],
            ip_v4: vec![],
            ip_v6: vec![],
            process_name: HashSet::new(),
            skipped: 0,
        }
    }

    /// Parse every entry of `source`; the first malformed entry fails the whole set.
    pub fn from_source(source: &RuleSetSource) -> Result<Self, LoadError> {
        let mut builder = Self::new(source.name.as_str());
        for (idx, entry) in read_entries(source)?.iter().enumerate() {
            builder
                .add_entry(source.behavior, entry)
                .map_err(|_| LoadError::Malformed {
                    name: source.name.clone(),
                    line: idx + 1,
                    entry: entry.clone(),
                })?;
        }
        Ok(builder)
    }

    pub fn add(&mut self, kind: MatcherKind, value: &str) -> Result<(), ()> {
        let value = value.trim();
        if value.is_empty() {
            return Err(());
        }
        match kind {
            MatcherKind::ExactDomain => {
                check_domain(value)?;
                self.domain.add_exact(value)
            }
            MatcherKind::DomainSuffix => {
                let value = strip_wildcard(value).unwrap_or(value);
                check_domain(value)?;
                self.domain.add_suffix(value)
            }
            MatcherKind::DomainKeyword => self.domain_keyword.push(value.to_lowercase()),
            MatcherKind::IpCidr => {
                let net = parse_cidr(value).ok_or(())?;
                match net {
                    IpNet::V4(v4) => self
                        .ip_v4
                        .push(octets_to_bits(&v4.network().octets(), v4.prefix_len())),
                    IpNet::V6(v6) => self
                        .ip_v6
                        .push(octets_to_bits(&v6.network().octets(), v6.prefix_len())),
                }
            }
            MatcherKind::ProcessName => {
                self.process_name.insert(value.to_string());
            }
        }
        Ok(())
    }

    fn add_entry(&mut self, behavior: Behavior, entry: &str) -> Result<(), ()> {
        match behavior {
            Behavior::Domain => {
                if let Some(sfx) = strip_wildcard(entry) {
                    self.add(MatcherKind::DomainSuffix, sfx)
                } else {
                    self.add(MatcherKind::ExactDomain, entry)
                }
            }
            Behavior::DomainSuffix => self.add(MatcherKind::DomainSuffix, entry),
            Behavior::DomainKeyword => self.add(MatcherKind::DomainKeyword, entry),
            Behavior::Ipcidr => self.add(MatcherKind::IpCidr, entry),
            Behavior::ProcessName => self.add(MatcherKind::ProcessName, entry),
            Behavior::Classical => {
                let list: Vec<&str> = entry.split(',').map(str::trim).collect();
                if list.len() < 2 {
                    return Err(());
                }
                let kind = match list[0].to_ascii_uppercase().as_str() {
                    "DOMAIN" => MatcherKind::ExactDomain,
                    "DOMAIN-SUFFIX" => MatcherKind::DomainSuffix,
                    "DOMAIN-KEYWORD" => MatcherKind::DomainKeyword,
                    "IP-CIDR" | "IP-CIDR6" => MatcherKind::IpCidr,
                    "PROCESS-NAME" => MatcherKind::ProcessName,
                    _ => {
                        self.skipped += 1;
                        return Ok(());
                    }
                };
                self.add(kind, list[1])
            }
        }
    }

    pub fn build(
        self,
        version: u64,
        refresh_interval: Option<Duration>,
    ) -> Result<RuleSet, LoadError> {
        let domain_keyword = if self.domain_keyword.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .ascii_case_insensitive(true)
                    .build(self.domain_keyword.as_slice())
                    .map_err(|e| LoadError::Keyword {
                        name: self.name.clone(),
                        reason: e.to_string(),
                    })?,
            )
        };
        Ok(RuleSet {
            version,
            loaded_at: Local::now(),
            refresh_interval,
            domain: self.domain.build(),
            keyword_count: self.domain_keyword.len(),
            domain_keyword,
            ip_v4: CidrTable::new(self.ip_v4),
            ip_v6: CidrTable::new(self.ip_v6),
            process_name: self.process_name,
            skipped: self.skipped,
            name: self.name,
        })
    }
}

fn read_entries(source: &RuleSetSource) -> Result<Vec<String>, LoadError> {
    match source.format {
        PayloadFormat::Text => Ok(source
            .content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with("//"))
            .map(String::from)
            .collect()),
        PayloadFormat::Yaml => {
            if source.content.trim().is_empty() {
                return Ok(vec![]);
            }
            let raw: RawRuleSchema =
                serde_yaml::from_str(&source.content).map_err(|e| LoadError::Payload {
                    name: source.name.clone(),
                    reason: e.to_string(),
                })?;
            raw.payload
                .iter()
                .enumerate()
                .map(|(idx, val)| match val {
                    serde_yaml::Value::String(s) => Ok(s.trim().to_string()),
                    serde_yaml::Value::Number(n) => Ok(n.to_string()),
                    _ => Err(LoadError::Malformed {
                        name: source.name.clone(),
                        line: idx + 1,
                        entry: format!("{:?}", val),
                    }),
                })
                .collect()
        }
    }
}

fn strip_wildcard(entry: &str) -> Option<&str> {
    entry
        .strip_prefix("+.")
        .or_else(|| entry.strip_prefix("*."))
        .or_else(|| entry.strip_prefix('.'))
}

fn check_domain(value: &str) -> Result<(), ()> {
    if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == ',' || c == '/') {
        Err(())
    } else {
        Ok(())
    }
}

fn parse_cidr(value: &str) -> Option<IpNet> {
    IpNet::from_str(value)
        .ok()
        .or_else(|| IpAddr::from_str(value).ok().map(IpNet::from))
}

/// Shared slot holding the active version of one rule set.
///
/// Matching loads the current version once, so a concurrent refresh is never
/// observed half way.
#[derive(Clone)]
pub struct RuleSetHandle {
    name: Arc<str>,
    slot: Arc<ArcSwap<RuleSet>>,
}

impl RuleSetHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current(&self) -> Arc<RuleSet> {
        self.slot.load_full()
    }

    pub fn matches(&self, target: &ConnTarget) -> bool {
        self.slot.load().matches(target)
    }
}

impl Debug for RuleSetHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RULE-SET({})", self.name)
    }
}

#[derive(Default, Clone)]
pub struct RuleSetStore {
    sets: HashMap<String, RuleSetHandle>,
}

impl RuleSetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `source` and register it. On error nothing is registered.
    pub fn load(&mut self, source: &RuleSetSource) -> Result<RuleSetHandle, LoadError> {
        let ruleset =
            RuleSetBuilder::from_source(source)?.build(1, source.refresh_interval)?;
        if ruleset.skipped_count() > 0 {
            tracing::debug!(
                "Rule set {} skipped {} unsupported entries",
                source.name,
                ruleset.skipped_count()
            );
        }
        Ok(self.register(ruleset))
    }

    /// Like [`load`](Self::load), but a malformed source is registered as an
    /// empty set so rules referencing it stay valid.
    pub fn load_or_empty(&mut self, source: &RuleSetSource) -> (RuleSetHandle, Option<LoadError>) {
        match self.load(source) {
            Ok(handle) => (handle, None),
            Err(e) => {
                tracing::warn!("{}; treated as empty", e);
                let empty = RuleSet::empty(&source.name, 1, source.refresh_interval);
                (self.register(empty), Some(e))
            }
        }
    }

    fn register(&mut self, ruleset: RuleSet) -> RuleSetHandle {
        let handle = RuleSetHandle {
            name: Arc::from(ruleset.name()),
            slot: Arc::new(ArcSwap::from_pointee(ruleset)),
        };
        self.sets.insert(handle.name().to_string(), handle.clone());
        handle
    }

    pub fn get(&self, name: &str) -> Option<&RuleSetHandle> {
        self.sets.get(name)
    }

    pub fn matches(&self, handle: &RuleSetHandle, target: &ConnTarget) -> bool {
        handle.matches(target)
    }

    /// Build a new version of an existing set and swap it in. The previous
    /// version stays active when the new content is malformed.
    pub fn refresh(&self, source: &RuleSetSource) -> Result<u64, LoadError> {
        let Some(handle) = self.sets.get(&source.name) else {
            return Err(LoadError::Payload {
                name: source.name.clone(),
                reason: "not registered".to_string(),
            });
        };
        let version = handle.slot.load().version() + 1;
        let ruleset =
            RuleSetBuilder::from_source(source)?.build(version, source.refresh_interval)?;
        handle.slot.store(Arc::new(ruleset));
        tracing::debug!("Rule set {} refreshed to v{}", source.name, version);
        Ok(version)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Handles sorted by name.
    pub fn handles(&self) -> Vec<RuleSetHandle> {
        let mut list: Vec<RuleSetHandle> = self.sets.values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(d: &str) -> ConnTarget {
        ConnTarget::domain(d, 443)
    }

    fn ip(s: &str) -> ConnTarget {
        ConnTarget::ip(s.parse().unwrap(), 443)
    }

    #[test]
    fn test_suffix_rule_set() {
        let mut store = RuleSetStore::new();
        let h = store
            .load(&RuleSetSource::inline(
                "Suffix",
                Behavior::DomainSuffix,
                &["example.com", "+.google.com"],
            ))
            .unwrap();
        assert!(store.matches(&h, &domain("a.b.example.com")));
        assert!(store.matches(&h, &domain("example.com")));
        assert!(!store.matches(&h, &domain("notexample.com")));
        assert!(store.matches(&h, &domain("mail.google.com")));
        // domain kinds never match address targets
        assert!(!store.matches(&h, &ip("93.184.216.34")));
    }

    #[test]
    fn test_cidr_rule_set() {
        let mut store = RuleSetStore::new();
        let h = store
            .load(&RuleSetSource::inline(
                "Lan",
                Behavior::Ipcidr,
                &["10.0.0.0/8", "192.168.1.1", "fc00::/7"],
            ))
            .unwrap();
        assert!(h.matches(&ip("10.1.2.3")));
        assert!(!h.matches(&ip("11.0.0.1")));
        assert!(h.matches(&ip("192.168.1.1")));
        assert!(!h.matches(&ip("192.168.1.2")));
        assert!(h.matches(&ip("fd12::1")));
        // v4 target never hits a v6 block and vice versa
        assert!(!h.matches(&ip("::ffff:10.1.2.3")));
        assert!(!h.matches(&domain("10.1.2.3.example.com")));
        assert_eq!(h.current().pattern_count(), 3);
    }

    #[test]
    fn test_keyword_and_exact() {
        let mut store = RuleSetStore::new();
        let h = store
            .load(&RuleSetSource::inline(
                "Mixed",
                Behavior::Classical,
                &[
                    "DOMAIN,exact.example.org",
                    "DOMAIN-KEYWORD,AdService",
                    "PROCESS-NAME,Telegram",
                    "USER-AGENT,Spotify*",
                    "IP-CIDR6,2001:db8::/32,no-resolve",
                ],
            ))
            .unwrap();
        assert!(h.matches(&domain("exact.example.org")));
        assert!(!h.matches(&domain("sub.exact.example.org")));
        assert!(h.matches(&domain("pagead.adservice.google.com")));
        assert!(h.matches(&ip("2001:db8::5")));
        assert!(h.matches(&ip("1.1.1.1").with_process("Telegram")));
        assert_eq!(h.current().skipped_count(), 1);
    }

    #[test]
    fn test_classical_suffix_list() {
        let mut store = RuleSetStore::new();
        let h = store
            .load(&RuleSetSource::inline(
                "ACL",
                Behavior::Classical,
                &[
                    "DOMAIN-SUFFIX,google.com",
                    "DOMAIN-SUFFIX,.youtube.com",
                    "DOMAIN-SUFFIX,+.gstatic.com",
                ],
            ))
            .unwrap();
        assert!(h.matches(&domain("www.google.com")));
        assert!(h.matches(&domain("google.com")));
        assert!(!h.matches(&domain("notgoogle.com")));
        assert!(h.matches(&domain("m.youtube.com")));
        assert!(h.matches(&domain("fonts.gstatic.com")));
        assert_eq!(h.current().pattern_count(), 3);
    }

    #[test]
    fn test_clash_domain_behavior_yaml() {
        let mut store = RuleSetStore::new();
        let source = RuleSetSource {
            name: "openai".to_string(),
            behavior: Behavior::Domain,
            format: PayloadFormat::Yaml,
            content: "payload:\n  - '+.openai.com'\n  - chatgpt.com\n".to_string(),
            refresh_interval: None,
        };
        let h = store.load(&source).unwrap();
        assert!(h.matches(&domain("api.openai.com")));
        assert!(h.matches(&domain("chatgpt.com")));
        assert!(!h.matches(&domain("cdn.chatgpt.com")));
    }

    #[test]
    fn test_malformed_is_not_registered() {
        let mut store = RuleSetStore::new();
        let err = store
            .load(&RuleSetSource::inline(
                "Bad",
                Behavior::Ipcidr,
                &["10.0.0.0/8", "300.0.0.0/8"],
            ))
            .unwrap_err();
        assert!(matches!(err, LoadError::Malformed { line: 2, .. }));
        assert!(store.get("Bad").is_none());

        let (h, err) = store.load_or_empty(&RuleSetSource::inline(
            "Bad",
            Behavior::Classical,
            &["DOMAIN-SUFFIX"],
        ));
        assert!(err.is_some());
        assert_eq!(h.current().pattern_count(), 0);
        assert!(!h.matches(&domain("example.com")));
    }

    #[test]
    fn test_refresh_swaps_version() {
        let mut store = RuleSetStore::new();
        let h = store
            .load(&RuleSetSource::inline("R", Behavior::DomainSuffix, &["a.com"]))
            .unwrap();
        let old = h.current();
        let v = store
            .refresh(&RuleSetSource::inline("R", Behavior::DomainSuffix, &["b.com"]))
            .unwrap();
        assert_eq!(v, 2);
        assert!(h.matches(&domain("x.b.com")));
        assert!(!h.matches(&domain("x.a.com")));
        // readers holding the old version keep a consistent view
        assert!(old.matches(&domain("x.a.com")));
        assert!(store
            .refresh(&RuleSetSource::inline("R", Behavior::Ipcidr, &["bogus"]))
            .is_err());
        assert_eq!(h.current().version(), 2);
    }
}
