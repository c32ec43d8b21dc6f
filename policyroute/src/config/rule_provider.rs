use crate::config::{safe_join_path, ConfigError, FileError};
use crate::dispatch::{Behavior, Engine, PayloadFormat, RuleSetSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
// not deny_unknown_fields, in order to achieve compatibility
pub enum RuleLocation {
    File {
        path: String,
    },
    Http {
        url: String,
        /// cache file, relative to the config directory
        path: Option<String>,
    },
    Inline {
        payload: Vec<String>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RuleProvider {
    #[serde(default = "default_classical")]
    pub behavior: Behavior,
    #[serde(default)]
    pub format: PayloadFormat,
    /// refresh period in seconds
    pub interval: Option<u64>,
    #[serde(flatten)]
    pub location: RuleLocation,
}

fn default_classical() -> Behavior {
    Behavior::Classical
}

impl RuleProvider {
    pub fn refresh_interval(&self) -> Option<Duration> {
        match (&self.location, self.interval) {
            (RuleLocation::Inline { .. }, _) | (_, None) | (_, Some(0)) => None,
            (_, Some(secs)) => Some(Duration::from_secs(secs)),
        }
    }

    pub fn to_source(&self, name: &str, content: String) -> RuleSetSource {
        RuleSetSource {
            name: name.to_string(),
            behavior: self.behavior,
            format: match self.location {
                RuleLocation::Inline { .. } => PayloadFormat::Text,
                _ => self.format,
            },
            content,
            refresh_interval: self.refresh_interval(),
        }
    }
}

/// Read the raw content of one provider. Remote providers use their cache
/// unless `force_update`, and fall back to it when the fetch fails.
pub async fn fetch_provider(
    config_dir: &Path,
    provider: &RuleProvider,
    force_update: bool,
) -> Result<String, ConfigError> {
    match &provider.location {
        RuleLocation::Inline { payload } => Ok(payload.join("\n")),
        RuleLocation::File { path } => {
            let io_error = |e| FileError::Io(path.clone(), e);
            let full_path = safe_join_path(config_dir, path).map_err(io_error)?;
            Ok(fs::read_to_string(full_path).map_err(io_error)?)
        }
        RuleLocation::Http { url, path } => {
            let http_error = |e| FileError::Http(url.clone(), e);
            let cache = match path {
                Some(p) => Some(
                    safe_join_path(config_dir, p).map_err(|e| FileError::Io(p.clone(), e))?,
                ),
                None => None,
            };
            if let Some(cache) = cache.as_ref().filter(|c| !force_update && c.exists()) {
                return Ok(fs::read_to_string(cache)
                    .map_err(|e| FileError::Io(cache.to_string_lossy().to_string(), e))?);
            }
            match (get_text(url).await, cache) {
                (Ok(text), Some(cache)) => {
                    if let Some(parent) = cache.parent() {
                        let _ = fs::create_dir_all(parent);
                    }
                    if let Err(e) = fs::write(&cache, text.as_bytes()) {
                        tracing::warn!("Cache {} failed: {}", cache.to_string_lossy(), e);
                    }
                    Ok(text)
                }
                (Ok(text), None) => Ok(text),
                (Err(e), Some(cache)) if cache.exists() => {
                    tracing::warn!("Fetch {} failed, using cache: {}", url, e);
                    Ok(fs::read_to_string(&cache)
                        .map_err(|e| FileError::Io(cache.to_string_lossy().to_string(), e))?)
                }
                (Err(e), _) => Err(http_error(e).into()),
            }
        }
    }
}

async fn get_text(url: &str) -> reqwest::Result<String> {
    let resp = reqwest::get(url).await?.error_for_status()?;
    resp.text().await
}

/// Read every provider concurrently. A provider that can't be read becomes
/// an empty rule set, so rules naming it stay valid.
pub async fn read_rule_sources(
    config_dir: &Path,
    providers: &BTreeMap<String, RuleProvider>,
    force_update: bool,
) -> Result<Vec<RuleSetSource>, ConfigError> {
    // concurrently download rules
    let tasks: Vec<(String, RuleProvider, JoinHandle<Result<String, ConfigError>>)> = providers
        .iter()
        .map(|(name, item)| {
            let root_path = config_dir.to_path_buf();
            let provider = item.clone();
            (
                name.clone(),
                item.clone(),
                tokio::spawn(async move {
                    fetch_provider(&root_path, &provider, force_update).await
                }),
            )
        })
        .collect();
    let mut list = Vec::with_capacity(tasks.len());
    for (name, provider, task) in tasks {
        let content = match task.await? {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Rule provider {} unavailable, treated as empty: {}", name, e);
                String::new()
            }
        };
        list.push(provider.to_source(&name, content));
    }
    Ok(list)
}

/// Re-fetch providers with an interval and swap the new versions into the
/// engine. A failed refresh keeps the current version.
pub fn spawn_refresh(
    engine: &Arc<Engine>,
    config_dir: PathBuf,
    providers: &BTreeMap<String, RuleProvider>,
) -> Vec<JoinHandle<()>> {
    providers
        .iter()
        .filter_map(|(name, provider)| {
            let period = provider.refresh_interval()?;
            Some(tokio::spawn(refresh_loop(
                Arc::downgrade(engine),
                config_dir.clone(),
                name.clone(),
                provider.clone(),
                period,
            )))
        })
        .collect()
}

async fn refresh_loop(
    engine: Weak<Engine>,
    config_dir: PathBuf,
    name: String,
    provider: RuleProvider,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    // the first tick completes immediately and the set was just loaded
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let content = match fetch_provider(&config_dir, &provider, true).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Refresh rule provider {} failed: {}", name, e);
                continue;
            }
        };
        let Some(engine) = engine.upgrade() else {
            return;
        };
        let source = provider.to_source(&name, content);
        // indexing large sets is CPU bound
        let result = tokio::task::spawn_blocking(move || engine.refresh_rule_set(&source)).await;
        match result {
            Ok(Ok(version)) => tracing::info!("Rule provider {} refreshed to v{}", name, version),
            Ok(Err(e)) => tracing::warn!("Refresh rule provider {} failed: {}", name, e),
            Err(e) => tracing::error!("Refresh task for {} failed: {}", name, e),
        }
    }
}
