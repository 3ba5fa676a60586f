use anyhow::{bail, Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Path of the catalog database JSON file.
    pub database_path: PathBuf,
    /// Path of the games configuration JSON file.
    pub games_config_path: PathBuf,
    /// Where games and workshop items are installed.
    pub games_dir: PathBuf,
    /// Username for steamcmd logins, empty for anonymous.
    #[serde(default)]
    pub login_username: String,
    pub steamcmd_path: PathBuf,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            bail!("database_path is not set");
        }
        if self.games_config_path.as_os_str().is_empty() {
            bail!("games_config_path is not set");
        }
        if self.games_dir.as_os_str().is_empty() {
            bail!("games_dir is not set");
        }
        Ok(())
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.config_dir().join("stoker").join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_populates_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "database_path": "/srv/stoker/db.json",
                "games_config_path": "/srv/stoker/games.json",
                "games_dir": "/srv/games",
                "steamcmd_path": "/usr/bin/steamcmd"
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/srv/stoker/db.json"));
        assert_eq!(config.login_username, "");
    }

    #[test]
    fn missing_required_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "database_path": "",
                "games_config_path": "/srv/stoker/games.json",
                "games_dir": "/srv/games",
                "steamcmd_path": "/usr/bin/steamcmd"
            }"#,
        )
        .unwrap();

        assert!(Config::load(&path).is_err());
    }
}
