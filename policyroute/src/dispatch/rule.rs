use crate::common::host_matcher::normalize_host;
use crate::config::BuildError;
use crate::dispatch::group::Literal;
use crate::dispatch::ruleset::{RuleSetHandle, RuleSetStore};
use crate::dispatch::{ConnTarget, Registry};
use ipnet::IpNet;
use std::fmt::{Debug, Display, Formatter};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

/// Country code lookup for GEOIP rules.
pub trait CountryLookup: Send + Sync {
    /// ISO 3166 alpha-2 code, `None` if unknown.
    fn lookup_country(&self, ip: IpAddr) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRule {
    Single(u16),
    Range(u16, u16),
}

impl FromStr for PortRule {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((lo, hi)) => {
                let lo = lo.trim().parse::<u16>().map_err(|_| ())?;
                let hi = hi.trim().parse::<u16>().map_err(|_| ())?;
                if lo > hi {
                    return Err(());
                }
                Ok(Self::Range(lo, hi))
            }
            None => s.trim().parse::<u16>().map(Self::Single).map_err(|_| ()),
        }
    }
}

impl PortRule {
    fn contains(&self, port: u16) -> bool {
        match self {
            PortRule::Single(p) => *p == port,
            PortRule::Range(lo, hi) => (*lo..=*hi).contains(&port),
        }
    }
}

#[derive(Clone)]
pub enum RuleImpl {
    RuleSet(RuleSetHandle),
    GeoIp(Option<Arc<dyn CountryLookup>>, String),
    Domain(String),
    DomainSuffix(String),
    DomainKeyword(String),
    IpCidr(IpNet),
    ProcessName(String),
    DstPort(PortRule),
    MatchAll,
}

impl Debug for RuleImpl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleImpl::RuleSet(h) => write!(f, "RULE-SET,{}", h.name()),
            RuleImpl::GeoIp(_, code) => write!(f, "GEOIP,{}", code),
            RuleImpl::Domain(d) => write!(f, "DOMAIN,{}", d),
            RuleImpl::DomainSuffix(d) => write!(f, "DOMAIN-SUFFIX,{}", d),
            RuleImpl::DomainKeyword(d) => write!(f, "DOMAIN-KEYWORD,{}", d),
            RuleImpl::IpCidr(net) => write!(f, "IP-CIDR,{}", net),
            RuleImpl::ProcessName(p) => write!(f, "PROCESS-NAME,{}", p),
            RuleImpl::DstPort(p) => write!(f, "DST-PORT,{:?}", p),
            RuleImpl::MatchAll => write!(f, "MATCH"),
        }
    }
}

impl RuleImpl {
    pub fn matches(&self, target: &ConnTarget) -> bool {
        match self {
            RuleImpl::RuleSet(handle) => handle.matches(target),
            RuleImpl::GeoIp(lookup, code) => match (lookup, target.ip) {
                (Some(lookup), Some(ip)) => lookup
                    .lookup_country(ip)
                    .is_some_and(|c| c.eq_ignore_ascii_case(code)),
                _ => false,
            },
            RuleImpl::Domain(d) => target
                .domain
                .as_deref()
                .is_some_and(|dn| normalize_host(dn) == d.as_str()),
            RuleImpl::DomainSuffix(d) => target.domain.as_deref().is_some_and(|dn| {
                let dn = normalize_host(dn);
                if dn.len() == d.len() {
                    dn == d.as_str()
                } else {
                    dn.len() > d.len()
                        && dn.ends_with(d.as_str())
                        && dn.as_bytes()[dn.len() - d.len() - 1] == b'.'
                }
            }),
            RuleImpl::DomainKeyword(kw) => target
                .domain
                .as_deref()
                .is_some_and(|dn| normalize_host(dn).contains(kw.as_str())),
            RuleImpl::IpCidr(net) => target.ip.is_some_and(|ip| net.contains(&ip)),
            RuleImpl::ProcessName(p) => target.process_name.as_deref() == Some(p.as_str()),
            RuleImpl::DstPort(p) => p.contains(target.port),
            RuleImpl::MatchAll => true,
        }
    }
}

pub struct Rule {
    literal: String,
    rule: RuleImpl,
    target: String,
}

impl Rule {
    pub fn literal(&self) -> &str {
        &self.literal
    }

    /// Group name or literal action this rule routes to.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn matches(&self, target: &ConnTarget) -> bool {
        self.rule.matches(target)
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self.rule, RuleImpl::MatchAll)
    }
}

impl Debug for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?},{}", self.rule, self.target)
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.literal)
    }
}

pub(crate) struct RuleBuilder<'a> {
    rulesets: &'a RuleSetStore,
    registry: &'a Registry,
    geoip: Option<Arc<dyn CountryLookup>>,
    buffer: Vec<Rule>,
    warnings: Vec<String>,
}

impl<'a> RuleBuilder<'a> {
    pub fn new(
        rulesets: &'a RuleSetStore,
        registry: &'a Registry,
        geoip: Option<Arc<dyn CountryLookup>>,
    ) -> Self {
        Self {
            rulesets,
            registry,
            geoip,
            buffer: vec![],
            warnings: vec![],
        }
    }

    pub fn append_literal(&mut self, s: &str) -> Result<(), BuildError> {
        let r = self.parse_literal(s)?;
        self.buffer.push(r);
        Ok(())
    }

    pub fn parse_literal(&mut self, s: &str) -> Result<Rule, BuildError> {
        let invalid = |reason: &str| BuildError::InvalidRule {
            rule: s.to_string(),
            reason: reason.to_string(),
        };
        let mut list: Vec<&str> = s.split(',').map(str::trim).collect();
        // e.g. IP-CIDR,#ip#,#group#,no-resolve
        if list.len() > 2 && list.last() == Some(&"no-resolve") {
            list.pop();
        }
        let prefix = list[0].to_ascii_uppercase();
        let (rule, target) = match (prefix.as_str(), list.as_slice()) {
            ("MATCH" | "FINAL", [_, target]) => (RuleImpl::MatchAll, *target),
            ("MATCH" | "FINAL", _) => return Err(invalid("expected MATCH,<group>")),
            (_, [_, content, target]) => (self.parse(&prefix, content, s)?, *target),
            _ => return Err(invalid("expected <TYPE>,<value>,<group>")),
        };
        if target.is_empty() {
            return Err(invalid("empty target"));
        }
        if Literal::from_name(target).is_none() && !self.registry.contains(target) {
            return Err(BuildError::UnknownTarget {
                rule: s.to_string(),
                target: target.to_string(),
            });
        }
        Ok(Rule {
            literal: s.trim().to_string(),
            rule,
            target: target.to_string(),
        })
    }

    fn parse(&mut self, prefix: &str, content: &str, literal: &str) -> Result<RuleImpl, BuildError> {
        let invalid = |reason: &str| BuildError::InvalidRule {
            rule: literal.to_string(),
            reason: reason.to_string(),
        };
        if content.is_empty() {
            return Err(invalid("empty value"));
        }
        match prefix {
            "RULE-SET" => self
                .rulesets
                .get(content)
                .map(|h| RuleImpl::RuleSet(h.clone()))
                .ok_or_else(|| BuildError::UnknownRuleSet {
                    rule: literal.to_string(),
                    name: content.to_string(),
                }),
            "GEOIP" => {
                if self.geoip.is_none() {
                    self.warnings
                        .push(format!("{}: no GeoIP database, never matches", literal));
                }
                Ok(RuleImpl::GeoIp(self.geoip.clone(), content.to_ascii_uppercase()))
            }
            "DOMAIN" => Ok(RuleImpl::Domain(normalize_host(content).into_owned())),
            "DOMAIN-SUFFIX" => Ok(RuleImpl::DomainSuffix(
                normalize_host(content.trim_start_matches("+.").trim_start_matches('.'))
                    .into_owned(),
            )),
            "DOMAIN-KEYWORD" => Ok(RuleImpl::DomainKeyword(content.to_lowercase())),
            "IP-CIDR" | "IP-CIDR6" => IpNet::from_str(content)
                .map(RuleImpl::IpCidr)
                .map_err(|_| invalid("bad CIDR")),
            "PROCESS-NAME" => Ok(RuleImpl::ProcessName(content.to_string())),
            "DST-PORT" => content
                .parse::<PortRule>()
                .map(RuleImpl::DstPort)
                .map_err(|_| invalid("bad port")),
            _ => Err(invalid("unsupported rule type")),
        }
    }

    /// The last rule must be, and only the last rule may be, a MATCH.
    pub fn build(mut self) -> Result<(RuleTable, Vec<String>), BuildError> {
        if let Some(idx) = self.buffer.iter().position(Rule::is_match_all) {
            if idx != self.buffer.len() - 1 {
                return Err(BuildError::MatchAllNotLast(idx));
            }
        }
        match self.buffer.pop() {
            Some(fallback) if fallback.is_match_all() => Ok((
                RuleTable {
                    rules: self.buffer,
                    fallback,
                },
                self.warnings,
            )),
            _ => Err(BuildError::MissingMatchAll),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMatch {
    Index(usize),
    MatchAll,
}

/// Ordered rules ending in exactly one MATCH.
#[derive(Debug)]
pub struct RuleTable {
    rules: Vec<Rule>,
    fallback: Rule,
}

impl RuleTable {
    /// First matching rule wins; later rules are not evaluated.
    pub fn classify(&self, target: &ConnTarget) -> (RuleMatch, &Rule) {
        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.matches(target) {
                return (RuleMatch::Index(idx), rule);
            }
        }
        (RuleMatch::MatchAll, &self.fallback)
    }

    /// Number of rules including the trailing MATCH.
    pub fn len(&self) -> usize {
        self.rules.len() + 1
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().chain(std::iter::once(&self.fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::group::{GroupSpec, MemberRef, Strategy};
    use crate::dispatch::ruleset::{Behavior, RuleSetSource};
    use crate::dispatch::NodePool;
    use std::collections::HashMap;

    struct FixedGeo(HashMap<IpAddr, String>);

    impl CountryLookup for FixedGeo {
        fn lookup_country(&self, ip: IpAddr) -> Option<String> {
            self.0.get(&ip).cloned()
        }
    }

    fn setup() -> (RuleSetStore, Registry) {
        let mut store = RuleSetStore::new();
        store
            .load(&RuleSetSource::inline(
                "BanAD",
                Behavior::DomainSuffix,
                &["ads.example.com"],
            ))
            .unwrap();
        store
            .load(&RuleSetSource::inline("Lan", Behavior::Ipcidr, &["10.0.0.0/8"]))
            .unwrap();
        let registry = Registry::build(
            vec![GroupSpec {
                name: "Proxy".to_string(),
                strategy: Strategy::Manual,
                members: vec![MemberRef::Named("DIRECT".to_string())],
            }],
            &NodePool::default(),
        )
        .unwrap();
        (store, registry)
    }

    fn table(rules: &[&str], geo: Option<Arc<dyn CountryLookup>>) -> Result<RuleTable, BuildError> {
        let (store, registry) = setup();
        let mut builder = RuleBuilder::new(&store, &registry, geo);
        for r in rules {
            builder.append_literal(r)?;
        }
        builder.build().map(|(t, _)| t)
    }

    #[test]
    fn test_first_match_wins() {
        let t = table(
            &[
                "RULE-SET,BanAD,REJECT",
                "DOMAIN-SUFFIX,example.com,Proxy",
                "RULE-SET,Lan,DIRECT,no-resolve",
                "DST-PORT,6881-6889,DIRECT",
                "MATCH,Proxy",
            ],
            None,
        )
        .unwrap();
        let (m, r) = t.classify(&ConnTarget::domain("ads.example.com", 443));
        assert_eq!(m, RuleMatch::Index(0));
        assert_eq!(r.target(), "REJECT");
        let (m, r) = t.classify(&ConnTarget::domain("WWW.Example.com.", 443));
        assert_eq!(m, RuleMatch::Index(1));
        assert_eq!(r.target(), "Proxy");
        let (m, _) = t.classify(&ConnTarget::ip("10.1.2.3".parse().unwrap(), 80));
        assert_eq!(m, RuleMatch::Index(2));
        let (m, _) = t.classify(&ConnTarget::ip("11.0.0.1".parse().unwrap(), 6885));
        assert_eq!(m, RuleMatch::Index(3));
        let (m, r) = t.classify(&ConnTarget::domain("notexample.com", 443));
        assert_eq!(m, RuleMatch::MatchAll);
        assert_eq!(r.target(), "Proxy");
    }

    #[test]
    fn test_geoip() {
        let geo = FixedGeo(HashMap::from([(
            "114.114.114.114".parse().unwrap(),
            "CN".to_string(),
        )]));
        let t = table(&["GEOIP,cn,DIRECT", "MATCH,Proxy"], Some(Arc::new(geo))).unwrap();
        let (m, _) = t.classify(&ConnTarget::ip("114.114.114.114".parse().unwrap(), 53));
        assert_eq!(m, RuleMatch::Index(0));
        let (m, _) = t.classify(&ConnTarget::ip("8.8.8.8".parse().unwrap(), 53));
        assert_eq!(m, RuleMatch::MatchAll);

        let (store, registry) = setup();
        let mut builder = RuleBuilder::new(&store, &registry, None);
        builder.append_literal("GEOIP,CN,DIRECT").unwrap();
        builder.append_literal("MATCH,Proxy").unwrap();
        let (t, warnings) = builder.build().unwrap();
        assert_eq!(warnings.len(), 1);
        let (m, _) = t.classify(&ConnTarget::ip("114.114.114.114".parse().unwrap(), 53));
        assert_eq!(m, RuleMatch::MatchAll);
    }

    #[test]
    fn test_sniffed_domain_with_address() {
        let geo = FixedGeo(HashMap::from([(
            "114.114.114.114".parse().unwrap(),
            "CN".to_string(),
        )]));
        let t = table(
            &[
                "RULE-SET,BanAD,REJECT",
                "DOMAIN-SUFFIX,example.com,Proxy",
                "IP-CIDR,10.0.0.0/8,DIRECT,no-resolve",
                "GEOIP,CN,DIRECT",
                "MATCH,Proxy",
            ],
            Some(Arc::new(geo)),
        )
        .unwrap();
        let sniffed = |ip: &str, domain: &str| {
            ConnTarget::ip(ip.parse().unwrap(), 443).with_sniffed_domain(domain)
        };
        let target = sniffed("10.1.2.3", "WWW.Example.com");
        assert_eq!(target.domain.as_deref(), Some("www.example.com"));
        assert_eq!(t.classify(&target).0, RuleMatch::Index(1));
        assert_eq!(t.classify(&sniffed("10.1.2.3", "ads.example.com")).0, RuleMatch::Index(0));
        // domain rules miss, the address still matches
        assert_eq!(t.classify(&sniffed("10.1.2.3", "example.org")).0, RuleMatch::Index(2));
        assert_eq!(
            t.classify(&sniffed("114.114.114.114", "baidu.com")).0,
            RuleMatch::Index(3)
        );
        assert_eq!(t.classify(&sniffed("8.8.8.8", "dns.google")).0, RuleMatch::MatchAll);
    }

    #[test]
    fn test_match_all_position() {
        assert_eq!(
            table(&["RULE-SET,BanAD,REJECT"], None).unwrap_err(),
            BuildError::MissingMatchAll
        );
        assert_eq!(
            table(&["MATCH,Proxy", "RULE-SET,BanAD,REJECT"], None).unwrap_err(),
            BuildError::MatchAllNotLast(0)
        );
        assert_eq!(table(&[], None).unwrap_err(), BuildError::MissingMatchAll);
    }

    #[test]
    fn test_bad_literals() {
        assert!(matches!(
            table(&["RULE-SET,Missing,REJECT", "MATCH,Proxy"], None),
            Err(BuildError::UnknownRuleSet { .. })
        ));
        assert!(matches!(
            table(&["RULE-SET,BanAD,Nope", "MATCH,Proxy"], None),
            Err(BuildError::UnknownTarget { .. })
        ));
        assert!(matches!(
            table(&["IP-CIDR,10.0.0.0/33,DIRECT", "MATCH,Proxy"], None),
            Err(BuildError::InvalidRule { .. })
        ));
        assert!(matches!(
            table(&["URL-REGEX,^http,DIRECT", "MATCH,Proxy"], None),
            Err(BuildError::InvalidRule { .. })
        ));
        assert!(matches!(
            table(&["MATCH"], None),
            Err(BuildError::InvalidRule { .. })
        ));
    }
}
