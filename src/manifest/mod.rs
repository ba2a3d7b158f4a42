//! Module manifest loading and validation.
//!
//! Every installable package ships a `manifest.json` at the root of its
//! source tree (or in exactly one immediate subdirectory, which happens with
//! archives that wrap everything in a top-level folder). The manifest is
//! parsed once per install and never mutated afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ModuleError;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Identifier grammar for module names: lowercase alphanumeric start,
/// `a-z0-9_-` continuation, 2..=64 chars total.
const NAME_PATTERN: &str = "^[a-z0-9][a-z0-9_-]{1,63}$";

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(NAME_PATTERN).expect("name pattern is valid"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub repository: String,
    /// Relative path of the executable to supervise; empty means the module
    /// has no process of its own.
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the supervised process. May shadow the
    /// variables the supervisor injects.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// TCP port the module listens on; 0 means no network service.
    #[serde(default)]
    pub port: u16,
    /// External executables that must be resolvable on PATH before install.
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub menu: MenuEntry,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MenuEntry {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub hidden: bool,
}

impl Manifest {
    /// Validate the mandatory fields. Returns the offending field on error.
    pub fn validate(&self) -> Result<(), ModuleError> {
        if !name_regex().is_match(&self.name) {
            return Err(ModuleError::Validation {
                field: "name",
                reason: format!("must match {}, got {:?}", NAME_PATTERN, self.name),
            });
        }
        if self.version.is_empty() {
            return Err(ModuleError::Validation {
                field: "version",
                reason: "version is required".into(),
            });
        }
        Ok(())
    }
}

/// Parse and validate `manifest.json` found directly in `dir`.
pub fn load(dir: &Path) -> Result<Manifest, ModuleError> {
    let data =
        std::fs::read_to_string(dir.join(MANIFEST_FILE)).map_err(|_| ModuleError::ManifestNotFound)?;
    let manifest: Manifest =
        serde_json::from_str(&data).map_err(|e| ModuleError::ManifestFormat(e.to_string()))?;
    manifest.validate()?;
    Ok(manifest)
}

/// Find the directory holding `manifest.json`: `root` itself, or the first
/// immediate subdirectory (in name order) that contains one.
pub fn locate(root: &Path) -> Result<PathBuf, ModuleError> {
    if root.join(MANIFEST_FILE).is_file() {
        return Ok(root.to_path_buf());
    }
    let mut subdirs: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    subdirs.sort();
    for sub in subdirs {
        if sub.join(MANIFEST_FILE).is_file() {
            return Ok(sub);
        }
    }
    Err(ModuleError::ManifestNotFound)
}

/// Locate, parse and validate in one step. Returns the manifest together
/// with the resolved source directory so callers operate on the right tree.
pub fn resolve(root: &Path) -> Result<(Manifest, PathBuf), ModuleError> {
    let dir = locate(root)?;
    let manifest = load(&dir)?;
    Ok((manifest, dir))
}
