use crate::config::{
    read_rule_sources, safe_join_path, ConfigError, FileError, LinkedState, RawProxyGroupCfg,
    RuleProvider,
};
use crate::dispatch::{Endpoint, HealthTracker, Node, NodePool, NodeTagger, Profile, RuleSetSource};
use crate::external::MmdbReader;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
// Clash configs carry many keys this engine has no use for
pub struct RawRootCfg {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub verbose: bool,
    pub geoip_db: Option<String>,
    #[serde(default)]
    pub health: RawHealthCfg,
    #[serde(default)]
    pub node_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub proxies: Vec<RawNodeCfg>,
    #[serde(default)]
    pub rule_providers: BTreeMap<String, RuleProvider>,
    #[serde(default)]
    pub proxy_groups: Vec<RawProxyGroupCfg>,
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawHealthCfg {
    /// milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
    /// seconds
    #[serde(default = "default_stale_after")]
    pub stale_after: u64,
}

impl Default for RawHealthCfg {
    fn default() -> Self {
        Self {
            probe_timeout: default_probe_timeout(),
            stale_after: default_stale_after(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RawNodeCfg {
    pub name: String,
    #[serde(flatten)]
    pub endpoint: Endpoint,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_probe_timeout() -> u64 {
    5000
}

fn default_stale_after() -> u64 {
    900
}

pub struct LoadedConfig {
    pub config_dir: PathBuf,
    pub config: RawRootCfg,
    pub state: LinkedState,
    pub rule_sources: Vec<RuleSetSource>,
}

impl LoadedConfig {
    /// `state.yml` beside the config file.
    pub fn state_path(config_file: &Path) -> PathBuf {
        config_dir_of(config_file).join("state.yml")
    }

    /// Parse the config and the persisted state. Rule providers are not
    /// fetched yet, see [`LoadedConfig::fetch_rule_sources`].
    pub fn read(config_file: &Path, state_file: Option<&Path>) -> Result<Self, ConfigError> {
        let config_dir = config_dir_of(config_file);
        let config_text = std::fs::read_to_string(config_file)
            .map_err(|e| FileError::Io(config_file.to_string_lossy().to_string(), e))?;
        let config: RawRootCfg = serde_yaml::from_str(&config_text)
            .map_err(|e| FileError::Serde(config_file.to_string_lossy().to_string(), e))?;
        let state_path = match state_file {
            Some(p) => p.to_path_buf(),
            None => Self::state_path(config_file),
        };
        let state = LinkedState::load(&state_path)?;
        Ok(Self {
            config_dir,
            config,
            state,
            rule_sources: vec![],
        })
    }

    pub async fn fetch_rule_sources(&mut self, force_update: bool) -> Result<(), ConfigError> {
        self.rule_sources =
            read_rule_sources(&self.config_dir, &self.config.rule_providers, force_update).await?;
        Ok(())
    }

    pub async fn load(config_file: &Path, state_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut loaded = Self::read(config_file, state_file)?;
        loaded.fetch_rule_sources(false).await?;
        Ok(loaded)
    }

    pub fn node_pool(&self) -> Result<NodePool, ConfigError> {
        let tagger = NodeTagger::new(&self.config.node_tags)
            .map_err(|e| ConfigError::Invalid(format!("node-tags: {}", e)))?;
        let nodes = self
            .config
            .proxies
            .iter()
            .map(|p| tagger.tag(Node::new(p.name.clone(), p.endpoint.clone())))
            .collect();
        Ok(NodePool::new(nodes)?)
    }

    /// Everything the engine needs for a build, with the GeoIP database opened.
    pub fn profile(&self) -> Result<Profile, ConfigError> {
        let geoip = match self.config.geoip_db.as_ref() {
            None => None,
            Some(p) => {
                let path = safe_join_path(&self.config_dir, p)
                    .map_err(|e| FileError::Io(p.clone(), e))?;
                Some(Arc::new(MmdbReader::read_from_file(path)?) as _)
            }
        };
        let groups = self
            .config
            .proxy_groups
            .iter()
            .map(RawProxyGroupCfg::to_spec)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Profile {
            rule_sets: self.rule_sources.clone(),
            groups,
            rules: self.config.rules.clone(),
            nodes: self.node_pool()?,
            geoip,
        })
    }

    pub fn health_tracker(&self) -> HealthTracker {
        HealthTracker::new(
            Duration::from_millis(self.config.health.probe_timeout),
            Duration::from_secs(self.config.health.stale_after),
        )
    }
}

fn config_dir_of(config_file: &Path) -> PathBuf {
    match config_file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildError;
    use crate::dispatch::{Action, ConnTarget, Engine};

    const CONFIG: &str = r#"
log-level: debug
mixed-port: 7890
health:
  probe-timeout: 2000
node-tags:
  HK: "(?i)香港|HK"
proxies:
  - name: HK 01
    type: trojan
    server: hk1.example.net
    port: 443
    password: secret
    sni: hk1.example.net
  - name: US 01
    type: ss
    server: 2001:db8::1
    port: 8388
    cipher: aes-128-gcm
rule-providers:
  BanAD:
    type: inline
    behavior: domain
    payload:
      - +.doubleclick.net
proxy-groups:
  - name: 节点选择
    type: select
    proxies: [香港节点, DIRECT]
    include-all: true
  - name: 香港节点
    type: url-test
    filter: "(?i)香港|HK"
    include-all: true
rules:
  - RULE-SET,BanAD,REJECT
  - DOMAIN-SUFFIX,cn,DIRECT
  - MATCH,节点选择
"#;

    fn write_config(name: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("policyroute-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_load_config() {
        let path = write_config("load", CONFIG);
        let loaded = LoadedConfig::load(&path, None).await.unwrap();
        assert_eq!(loaded.config.log_level, "debug");
        assert_eq!(loaded.config.health.probe_timeout, 2000);
        assert_eq!(loaded.config.health.stale_after, 900);
        assert_eq!(loaded.state.state_path, path.parent().unwrap().join("state.yml"));

        let pool = loaded.node_pool().unwrap();
        let hk = pool.get("HK 01").unwrap();
        assert!(hk.has_tag("HK"));
        assert_eq!(
            hk.endpoint().params.get("sni"),
            Some(&serde_yaml::Value::String("hk1.example.net".to_string()))
        );
        assert_eq!(pool.get("US 01").unwrap().endpoint().port, 8388);

        let engine = Engine::new(loaded.profile().unwrap(), Arc::new(loaded.health_tracker()))
            .unwrap()
            .with_state(loaded.state);
        assert_eq!(
            engine.classify(&ConnTarget::domain("stats.g.doubleclick.net", 443)),
            Action::Reject
        );
        assert_eq!(engine.classify(&ConnTarget::domain("baidu.cn", 443)), Action::Direct);
        // 节点选择 -> 香港节点 (no samples) -> no fallback member -> Direct
        let d = engine.decide(&ConnTarget::domain("example.com", 443));
        assert!(d.fallback);
        assert_eq!(d.group, "节点选择");
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_reject_cycle() {
        let path = write_config(
            "cycle",
            r#"
proxy-groups:
  - name: 节点选择
    type: select
    proxies: [自动选择]
  - name: 自动选择
    type: url-test
    proxies: [节点选择]
rules:
  - MATCH,节点选择
"#,
        );
        let loaded = LoadedConfig::load(&path, None).await.unwrap();
        let profile = loaded.profile().unwrap();
        assert!(matches!(
            Engine::new(profile, Arc::new(loaded.health_tracker())),
            Err(BuildError::Cycle { .. })
        ));
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
