use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::import::{DEFAULT_BATCH_SIZE, ImportSettings};
use crate::mail::normalize::DEFAULT_BODY_CHAR_LIMIT;

const APP_DIR: &str = "sent_mail_import";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub work_address: String,
    pub sent_dir: String,
    pub db_path: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_body_char_limit")]
    pub body_char_limit: usize,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,
    #[serde(default)]
    pub desktop_notifications: bool,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_body_char_limit() -> usize {
    DEFAULT_BODY_CHAR_LIMIT
}

fn default_lock_timeout_ms() -> u64 {
    1000
}

fn default_lock_stale_secs() -> u64 {
    30 * 60
}

fn config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or_else(|| anyhow!("no config dir available"))?
        .join(APP_DIR))
}

pub fn config_path() -> Result<PathBuf> {
    let mut p = config_dir()?;
    fs::create_dir_all(&p)?;
    p.push("config.toml");
    Ok(p)
}

pub fn default_db_path() -> Result<PathBuf> {
    let mut p = config_dir()?;
    fs::create_dir_all(&p)?;
    p.push("import.db");
    Ok(p)
}

/// The run-lock lives in the per-user config dir, so it serializes every
/// import of this user.
pub fn lock_path() -> Result<PathBuf> {
    let mut p = config_dir()?;
    fs::create_dir_all(&p)?;
    p.push("import.lock");
    Ok(p)
}

pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        // create a template config for users to edit
        let sample = Config {
            work_address: "you@example.com".to_string(),
            sent_dir: "/path/to/Maildir/.Sent".to_string(),
            db_path: None,
            batch_size: default_batch_size(),
            body_char_limit: default_body_char_limit(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_stale_secs: default_lock_stale_secs(),
            desktop_notifications: false,
        };
        let tom = toml::to_string_pretty(&sample)?;
        fs::write(path, tom)?;
        bail!(
            "Created template config at {} - edit it and run again",
            path.display()
        );
    }
    let s = fs::read_to_string(path)?;
    let cfg: Config = toml::from_str(&s)?;
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.work_address.trim().is_empty() {
            bail!("work_address must be set");
        }
        if self.sent_dir.trim().is_empty() {
            bail!("sent_dir must be set");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.body_char_limit == 0 {
            bail!("body_char_limit must be at least 1");
        }
        Ok(())
    }

    pub fn import_settings(&self, lock_path: PathBuf) -> ImportSettings {
        ImportSettings {
            batch_size: self.batch_size,
            body_char_limit: self.body_char_limit,
            lock_path,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            lock_stale_after: Duration::from_secs(self.lock_stale_secs),
        }
    }
}

pub fn resolve_db_path(cfg: &Config) -> Result<PathBuf> {
    if let Some(p) = &cfg.db_path {
        Ok(PathBuf::from(p))
    } else {
        default_db_path()
    }
}
