use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// env_logger filter level: error, warn, info, debug or trace
    pub log_level: String,
    /// Maximum transactions per block, coinbase included
    pub block_size: usize,
    /// Longest unknown branch a node will fetch from a peer for one notification
    pub max_branch_len: usize,
    /// Resolution restarts allowed when the local tip moves during a fetch
    pub max_resolve_attempts: usize,
    pub fetch_timeout_ms: u64,
    /// Number of nodes in the in-process demo network
    pub peers: usize,
    pub genesis_address: String,
    pub genesis_amount: u64,
}

impl Config {
    fn expand_path(path: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path);
        PathBuf::from(expanded.into_owned())
    }

    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot find home directory"))?;
        Ok(home.join(".meridian").join("config.json"))
    }

    /// Load from `path` (tilde expanded), writing defaults first if the file is missing.
    pub fn load_from(path: &str) -> Result<Self> {
        Self::load_path(&Self::expand_path(path))
    }

    pub fn load() -> Result<Self> {
        Self::load_path(&Self::default_path()?)
    }

    fn load_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!(
                "Configuration file not found. Creating default configuration: {:?}",
                path
            );
            let cfg = Self::default();
            cfg.save_to(path)?;
            return Ok(cfg);
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {:?}", path))?;
        let cfg: Self = serde_json::from_str(&data)
            .with_context(|| format!("Configuration file format error in {:?}", path))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(anyhow!("block_size must be at least 1 (room for the coinbase)"));
        }
        if self.max_resolve_attempts == 0 {
            return Err(anyhow!("max_resolve_attempts must be at least 1"));
        }
        if self.max_branch_len == 0 {
            return Err(anyhow!("max_branch_len must be at least 1"));
        }
        Ok(())
    }

    /// Update one key in memory; call [`Config::save`] to persist.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        fn num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse()
                .map_err(|_| anyhow!("{} expects a number, got {:?}", key, value))
        }

        let mut next = self.clone();
        match key {
            "log_level" => next.log_level = value.to_string(),
            "block_size" => next.block_size = num(key, value)?,
            "max_branch_len" => next.max_branch_len = num(key, value)?,
            "max_resolve_attempts" => next.max_resolve_attempts = num(key, value)?,
            "fetch_timeout_ms" => next.fetch_timeout_ms = num(key, value)?,
            "peers" => next.peers = num(key, value)?,
            "genesis_address" => next.genesis_address = value.to_string(),
            "genesis_amount" => next.genesis_amount = num(key, value)?,
            _ => return Err(anyhow!("Unknown configuration key: {}", key)),
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn view(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn init_default() -> Result<PathBuf> {
        let path = Self::default_path()?;
        Self::default().save_to(&path)?;
        Ok(path)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            block_size: 10,
            max_branch_len: 10_000,
            max_resolve_attempts: 3,
            fetch_timeout_ms: 5_000,
            peers: 4,
            genesis_address: "genesis".to_string(),
            genesis_amount: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("meridian-config-{}-{}", name, std::process::id()))
            .join("config.json")
    }

    #[test]
    fn missing_file_writes_defaults() {
        let path = temp_path("missing");
        let _ = fs::remove_file(&path);
        let cfg = Config::load_path(&path).unwrap();
        assert_eq!(cfg, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let path = temp_path("partial");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{ "block_size": 4, "peers": 7 }"#).unwrap();
        let cfg = Config::load_path(&path).unwrap();
        assert_eq!(cfg.block_size, 4);
        assert_eq!(cfg.peers, 7);
        assert_eq!(cfg.max_resolve_attempts, 3);
    }

    #[test]
    fn set_value_parses_and_validates() {
        let mut cfg = Config::default();
        cfg.set_value("fetch_timeout_ms", "250").unwrap();
        assert_eq!(cfg.fetch_timeout_ms, 250);
        assert!(cfg.set_value("block_size", "zero").is_err());
        assert!(cfg.set_value("block_size", "0").is_err());
        assert_eq!(cfg.block_size, 10);
        assert!(cfg.set_value("max_branch_len", "0").is_err());
        assert_eq!(cfg, Config { fetch_timeout_ms: 250, ..Config::default() });
        assert!(cfg.set_value("colour", "blue").is_err());
    }
}
