use crate::config::{BuildError, DEFAULT_PROBE_URL};
use crate::dispatch::{AutoSettings, GroupSpec, MemberRef, NodeFilter, Strategy};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GroupType {
    Select,
    UrlTest,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
// not deny_unknown_fields: Clash keys such as icon or hidden are ignored
pub struct RawProxyGroupCfg {
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: GroupType,
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(default)]
    pub include_all: bool,
    pub filter: Option<String>,
    pub exclude_filter: Option<String>,
    #[serde(default = "default_probe_url")]
    pub url: String,
    /// seconds
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// milliseconds
    #[serde(default = "default_tolerance")]
    pub tolerance: u64,
}

fn default_probe_url() -> String {
    DEFAULT_PROBE_URL.to_string()
}

fn default_interval() -> u64 {
    300
}

fn default_tolerance() -> u64 {
    50
}

impl RawProxyGroupCfg {
    pub fn roughly_validate(&self) -> bool {
        !(self.proxies.is_empty() && !self.expands_nodes())
    }

    fn expands_nodes(&self) -> bool {
        self.include_all
    }

    /// The node predicate for `include-all`, narrowed by `filter` and
    /// `exclude-filter`. Without `include-all` both filters are ignored.
    pub fn node_filter(&self) -> Result<Option<NodeFilter>, BuildError> {
        if !self.expands_nodes() {
            if self.filter.is_some() || self.exclude_filter.is_some() {
                tracing::warn!("Group {}: filter without include-all is ignored", self.name);
            }
            return Ok(None);
        }
        let compile = |pat: &str| {
            Regex::new(pat).map_err(|e| BuildError::InvalidFilter {
                group: self.name.clone(),
                reason: e.to_string(),
            })
        };
        let mut list = vec![];
        if let Some(f) = &self.filter {
            list.push(NodeFilter::Regex(compile(f)?));
        }
        if let Some(f) = &self.exclude_filter {
            list.push(NodeFilter::Not(Box::new(NodeFilter::Regex(compile(f)?))));
        }
        Ok(Some(match list.len() {
            0 => NodeFilter::All,
            1 => list.remove(0),
            _ => NodeFilter::And(list),
        }))
    }

    pub fn to_spec(&self) -> Result<GroupSpec, BuildError> {
        if !self.roughly_validate() {
            return Err(BuildError::InvalidGroup {
                group: self.name.clone(),
                reason: "no proxies and no node filter".to_string(),
            });
        }
        let mut members: Vec<MemberRef> = self
            .proxies
            .iter()
            .map(|p| MemberRef::Named(p.clone()))
            .collect();
        if let Some(filter) = self.node_filter()? {
            members.push(MemberRef::Nodes(filter));
        }
        let strategy = match self.group_type {
            GroupType::Select => Strategy::Manual,
            GroupType::UrlTest => {
                match url::Url::parse(&self.url) {
                    Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
                    _ => {
                        return Err(BuildError::InvalidGroup {
                            group: self.name.clone(),
                            reason: format!("bad probe url {}", self.url),
                        })
                    }
                }
                Strategy::LatencyAuto(AutoSettings {
                    url: self.url.clone(),
                    interval: Duration::from_secs(self.interval),
                    tolerance: Duration::from_millis(self.tolerance),
                })
            }
        };
        Ok(GroupSpec {
            name: self.name.clone(),
            strategy,
            members,
        })
    }
}
