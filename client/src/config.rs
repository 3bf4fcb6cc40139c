use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persisted client configuration. Everything here is non-secret; the
/// shared symmetric key lives in the keystore, wrapped under the master
/// password (§6.3), never in this file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub server_url: Option<String>,
    pub machine_name: Option<String>,
    pub bearer_token: Option<String>,
    pub sync_root: Option<String>,
}

impl Config {
    fn project_dirs() -> anyhow::Result<ProjectDirs> {
        ProjectDirs::from("com", "syncagent", "tangle")
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))
    }

    pub fn config_path() -> anyhow::Result<PathBuf> {
        let dirs = Self::project_dirs()?;
        let config_dir = dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;
        Ok(config_dir.join("config.toml"))
    }

    pub fn keystore_path() -> anyhow::Result<PathBuf> {
        let dirs = Self::project_dirs()?;
        let config_dir = dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;
        Ok(config_dir.join("keystore.json"))
    }

    pub fn state_db_path() -> anyhow::Result<PathBuf> {
        let dirs = Self::project_dirs()?;
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;
        Ok(data_dir.join("state.sqlite3"))
    }

    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn require_registered(&self) -> anyhow::Result<()> {
        if self.bearer_token.is_none() || self.server_url.is_none() {
            anyhow::bail!("not registered with a server. Run: tangle register --server <url> --token <invitation> --name <name>");
        }
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.server_url.is_some() && self.bearer_token.is_some() && self.sync_root.is_some()
    }

    pub fn sync_root_path(&self) -> anyhow::Result<PathBuf> {
        self.sync_root
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("no sync folder configured. Run: tangle init <path>"))
    }
}
