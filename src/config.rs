use std::str::FromStr;
use std::{env, fs, path::PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chat_update::LogLevel;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::pipeline::GateOrdering;

#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from a `.env` file that `set`/`del` keep in sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(err) => warn!("could not parse {}: {}", env_file.display(), err),
            }
        } else {
            info!("no .env at {}, using the process environment", env_file.display());
        }

        Box::new(Self { env_file })
    }

    /// Rewrite the `.env` file, replacing (or with `None`, removing) `key`.
    fn rewrite_file(&self, key: &str, value: Option<&str>) -> Result<()> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut lines: Vec<String> = Vec::new();
        let mut found = false;

        for line in content.lines() {
            match line.split_once('=') {
                Some((k, _)) if k.trim() == key => {
                    found = true;
                    if let Some(value) = value {
                        lines.push(format!("{key}={value}"));
                    }
                }
                _ => lines.push(line.to_string()),
            }
        }
        if let (false, Some(value)) = (found, value) {
            lines.push(format!("{key}={value}"));
        }

        fs::write(&self.env_file, lines.join("\n"))
            .with_context(|| format!("writing {}", self.env_file.display()))
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        unsafe {
            env::set_var(key, value);
        };
        self.rewrite_file(key, Some(value))
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            if let Err(err) = self.rewrite_file(key, None) {
                warn!("could not remove {} from .env: {:#}", key, err);
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Box<Self> {
        let map = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Box::new(Self { map })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Runtime settings of the handling core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowConfig {
    /// How many times one update may be handled again after a `Repeat`.
    pub max_repeats: usize,
    /// Idle time after which a conversation's step store is dropped.
    pub step_ttl_secs: u64,
    pub gate_order: GateOrdering,
    pub log_level: LogLevel,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_repeats: 4,
            step_ttl_secs: 1800,
            gate_order: GateOrdering::Registration,
            log_level: LogLevel::Info,
        }
    }
}

impl FlowConfig {
    pub const MAX_REPEATS: &'static str = "WAYSTATION_MAX_REPEATS";
    pub const STEP_TTL_SECS: &'static str = "WAYSTATION_STEP_TTL_SECS";
    pub const GATE_ORDER: &'static str = "WAYSTATION_GATE_ORDER";
    pub const LOG_LEVEL: &'static str = "WAYSTATION_LOG_LEVEL";
    pub const KEYS: [&'static str; 4] = [Self::MAX_REPEATS, Self::STEP_TTL_SECS, Self::GATE_ORDER, Self::LOG_LEVEL];

    /// Read every setting from `config`, falling back to defaults for missing keys.
    pub async fn load(config: &ConfigManager) -> Result<Self> {
        let defaults = Self::default();
        let source = &config.0;

        let max_repeats = parse_or(source.get(Self::MAX_REPEATS).await, Self::MAX_REPEATS, defaults.max_repeats)?;
        let step_ttl_secs = parse_or(source.get(Self::STEP_TTL_SECS).await, Self::STEP_TTL_SECS, defaults.step_ttl_secs)?;
        let gate_order = source
            .get(Self::GATE_ORDER)
            .await
            .map(|list| GateOrdering::from_list(&list))
            .unwrap_or(defaults.gate_order);
        let log_level = parse_or(source.get(Self::LOG_LEVEL).await, Self::LOG_LEVEL, defaults.log_level)?;

        Ok(Self {
            max_repeats,
            step_ttl_secs,
            gate_order,
            log_level,
        })
    }

    /// Write one setting through `config`. Unknown keys and values `load` would reject are refused.
    pub async fn store(config: &ConfigManager, key: &str, value: &str) -> Result<()> {
        if !Self::KEYS.contains(&key) {
            bail!("unknown setting `{}` (known: {})", key, Self::KEYS.join(", "));
        }
        Self::load(&ConfigManager(MapConfigManager::from_pairs(&[(key, value)]))).await?;
        config.0.set(key, value).await
    }

    pub async fn forget(config: &ConfigManager, key: &str) -> Result<()> {
        if !Self::KEYS.contains(&key) {
            bail!("unknown setting `{}` (known: {})", key, Self::KEYS.join(", "));
        }
        config.0.del(key).await;
        Ok(())
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value `{}` for {}", raw, key)),
        _ => Ok(default),
    }
}
