use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::fetch::UnsafeEntryPolicy;

/// Host configuration, read from `config/modhost.toml` when present and then
/// overridden by environment variables.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    pub reject_unsafe_archives: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("./data"),
            reject_unsafe_archives: false,
        }
    }
}

impl AppConfig {
    /// Load the optional config file, then apply `MODHOST_ADDR`,
    /// `MODHOST_DATA_DIR` and `MODHOST_REJECT_UNSAFE_ARCHIVES`.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg: Self = match std::fs::read_to_string("config/modhost.toml") {
            Ok(s) => toml::from_str(&s)?,
            Err(_) => Self::default(),
        };
        if let Ok(addr) = std::env::var("MODHOST_ADDR") {
            cfg.listen_addr = addr;
        }
        if let Ok(dir) = std::env::var("MODHOST_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Ok(v) = std::env::var("MODHOST_REJECT_UNSAFE_ARCHIVES") {
            cfg.reject_unsafe_archives = matches!(v.as_str(), "1" | "true" | "yes");
        }
        Ok(cfg)
    }

    pub fn unsafe_entry_policy(&self) -> UnsafeEntryPolicy {
        if self.reject_unsafe_archives {
            UnsafeEntryPolicy::Reject
        } else {
            UnsafeEntryPolicy::Skip
        }
    }

    /// Create the data directory tree the host expects at startup.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for sub in ["modules", "logs", "module_data"] {
            std::fs::create_dir_all(self.data_dir.join(sub))?;
        }
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
