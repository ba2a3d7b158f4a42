//! The authoritative catalogue of installed modules.
//!
//! A single `Registry` instance is created at startup and passed to every
//! component that needs it. The in-memory map is the source of truth for
//! module state; status transitions are persisted through [`ModuleStore`]
//! before (or right alongside) becoming visible to readers. Process start
//! and stop happen outside the map lock; a transient `starting` flag set
//! under the lock prevents two activations from racing past each other.

pub mod process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use crate::error::ModuleError;
use crate::manifest::Manifest;
use crate::store::{ModuleRecord, ModuleStore};
use process::{ExitEvent, ModuleProcess, Supervisor};

const UNEXPECTED_EXIT: &str = "process exited unexpectedly";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    Inactive,
    Active,
    Error,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "error" => Self::Error,
            _ => Self::Inactive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    GitHub,
    Zip,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::Zip => "zip",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "github" => Self::GitHub,
            _ => Self::Zip,
        }
    }
}

/// One installed module. The process handle and the starting guard exist
/// only on the in-memory runtime copy and are never serialized.
#[derive(Debug, Clone, Serialize)]
pub struct Module {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub status: ModuleStatus,
    pub source_type: SourceType,
    pub source_url: String,
    pub manifest: Option<Manifest>,
    pub error_log: String,
    pub installed_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) process: Option<ModuleProcess>,
    #[serde(skip)]
    starting: bool,
}

impl Module {
    /// Freshly installed module, always inactive.
    pub fn new_installed(manifest: Manifest, source_type: SourceType, source_url: &str) -> Self {
        Self {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            author: manifest.author.clone(),
            status: ModuleStatus::Inactive,
            source_type,
            source_url: source_url.to_string(),
            manifest: Some(manifest),
            error_log: String::new(),
            installed_at: Utc::now(),
            process: None,
            starting: false,
        }
    }

    fn from_record(rec: ModuleRecord) -> Self {
        // A manifest that fails to parse stays absent; the module can still
        // be listed and deleted.
        let manifest = serde_json::from_str::<Manifest>(&rec.manifest_json).ok();
        Self {
            name: rec.name,
            version: rec.version,
            description: rec.description,
            author: rec.author,
            status: ModuleStatus::parse(&rec.status),
            source_type: SourceType::parse(&rec.source_type),
            source_url: rec.source_url,
            manifest,
            error_log: rec.error_log,
            installed_at: rec.installed_at,
            process: None,
            starting: false,
        }
    }

    fn to_record(&self) -> ModuleRecord {
        ModuleRecord {
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            author: self.author.clone(),
            status: self.status.as_str().to_string(),
            source_type: self.source_type.as_str().to_string(),
            source_url: self.source_url.clone(),
            manifest_json: serde_json::to_string(&self.manifest)
                .unwrap_or_else(|_| "null".to_string()),
            error_log: self.error_log.clone(),
            installed_at: self.installed_at,
        }
    }

    /// PID of the supervised process, if one is running.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid())
    }
}

/// Navigation entry derived from an active module's menu metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavItem {
    pub name: String,
    pub label: String,
    pub icon: String,
    pub href: String,
    pub position: i32,
}

pub struct Registry {
    modules: RwLock<HashMap<String, Module>>,
    store: ModuleStore,
    supervisor: Supervisor,
    data_dir: PathBuf,
}

impl Registry {
    /// Create a registry rooted at `data_dir` and spawn its exit-event
    /// loop. Watchers post [`ExitEvent`]s here instead of mutating module
    /// state themselves.
    pub fn new(data_dir: PathBuf, store: ModuleStore) -> Arc<Self> {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<ExitEvent>();
        let supervisor = Supervisor::new(data_dir.clone(), exit_tx);
        let registry = Arc::new(Self {
            modules: RwLock::new(HashMap::new()),
            store,
            supervisor,
            data_dir,
        });
        if let Err(e) = std::fs::create_dir_all(registry.modules_dir()) {
            tracing::warn!("failed to create modules directory: {}", e);
        }

        let weak = Arc::downgrade(&registry);
        tokio::spawn(async move {
            while let Some(event) = exit_rx.recv().await {
                let Some(registry) = weak.upgrade() else { break };
                registry.mark_unexpected_exit(event).await;
            }
        });
        registry
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.data_dir.join("modules")
    }

    pub fn module_dir(&self, name: &str) -> PathBuf {
        self.modules_dir().join(name)
    }

    /// Register a freshly installed module: persist it (forced inactive by
    /// the upsert) and replace any in-memory entry of the same name.
    pub async fn register(&self, module: Module) -> Result<(), ModuleError> {
        self.store.upsert(&module.to_record())?;
        self.modules
            .write()
            .await
            .insert(module.name.clone(), module);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Module> {
        self.modules.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Module> {
        let map = self.modules.read().await;
        let mut out: Vec<Module> = map.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Activate a module. Launches the supervised process when the manifest
    /// declares an entrypoint; a start failure is persisted as status=error
    /// and returned. Activating an already running module is a no-op.
    pub async fn activate(&self, name: &str) -> Result<(), ModuleError> {
        // Reserve the module under the write lock so concurrent activations
        // cannot both pass the not-running check.
        let manifest = {
            let mut map = self.modules.write().await;
            let module = map
                .get_mut(name)
                .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;
            if module.process.is_some() || module.starting {
                return Ok(());
            }
            match &module.manifest {
                Some(m) if !m.entrypoint.is_empty() => {
                    module.starting = true;
                    Some(m.clone())
                }
                _ => None,
            }
        };

        let Some(manifest) = manifest else {
            // No process to run: the status flip is the whole activation.
            self.store.set_status(name, "active", "")?;
            if let Some(module) = self.modules.write().await.get_mut(name) {
                module.status = ModuleStatus::Active;
                module.error_log.clear();
            }
            return Ok(());
        };

        let started = self.supervisor.start(name, &manifest).await;
        let (status, error_log) = match &started {
            Ok(_) => ("active", String::new()),
            Err(e) => ("error", e.to_string()),
        };
        if let Err(e) = self.store.set_status(name, status, &error_log) {
            tracing::warn!("failed to persist status for '{}': {}", name, e);
        }

        let mut map = self.modules.write().await;
        let Some(module) = map.get_mut(name) else {
            // Deleted while starting: don't leave an orphan process behind.
            drop(map);
            if let Ok(process) = started {
                self.supervisor.stop(process).await;
            }
            return Err(ModuleError::NotFound(name.to_string()));
        };
        module.starting = false;
        match started {
            Ok(process) => {
                module.process = Some(process);
                module.status = ModuleStatus::Active;
                module.error_log.clear();
                Ok(())
            }
            Err(e) => {
                module.status = ModuleStatus::Error;
                module.error_log = e.to_string();
                Err(e)
            }
        }
    }

    /// Stop the module's process (if any) and mark it inactive. Unknown
    /// names and already-inactive modules are errorless no-ops; the latter
    /// performs no persistence write at all.
    pub async fn deactivate(&self, name: &str) -> Result<(), ModuleError> {
        let (process, error_log) = {
            let mut map = self.modules.write().await;
            let Some(module) = map.get_mut(name) else {
                return Ok(());
            };
            let process = module.process.take();
            if process.is_none() && module.status == ModuleStatus::Inactive {
                return Ok(());
            }
            module.status = ModuleStatus::Inactive;
            (process, module.error_log.clone())
        };
        if let Some(process) = process {
            self.supervisor.stop(process).await;
        }
        self.store.set_status(name, "inactive", &error_log)?;
        Ok(())
    }

    /// Deactivate, drop the record, and remove the on-disk directory. The
    /// directory removal is best-effort: a failure is logged but the record
    /// stays gone.
    pub async fn delete(&self, name: &str) -> Result<(), ModuleError> {
        self.deactivate(name).await?;
        self.modules.write().await.remove(name);
        self.store.delete(name)?;
        let dir = self.module_dir(name);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove module directory {}: {}", dir.display(), e);
            }
        }
        Ok(())
    }

    /// Stop a running process without touching persisted status. Used by
    /// the installer's replace path before the old directory is removed.
    pub async fn stop_if_running(&self, name: &str) {
        let process = self
            .modules
            .write()
            .await
            .get_mut(name)
            .and_then(|m| m.process.take());
        if let Some(process) = process {
            self.supervisor.stop(process).await;
        }
    }

    /// Navigation entries for every active module whose menu is not hidden,
    /// sorted by declared position then name.
    pub async fn nav_items(&self) -> Vec<NavItem> {
        let map = self.modules.read().await;
        let mut items: Vec<NavItem> = map
            .values()
            .filter_map(|m| {
                let manifest = m.manifest.as_ref()?;
                if m.status != ModuleStatus::Active || manifest.menu.hidden {
                    return None;
                }
                let label = if !manifest.menu.label.is_empty() {
                    manifest.menu.label.clone()
                } else if !m.description.is_empty() {
                    m.description.clone()
                } else {
                    m.name.clone()
                };
                let icon = if manifest.menu.icon.is_empty() {
                    "package".to_string()
                } else {
                    manifest.menu.icon.clone()
                };
                Some(NavItem {
                    name: m.name.clone(),
                    label,
                    icon,
                    href: format!("/modules/{}", m.name),
                    position: manifest.menu.position,
                })
            })
            .collect();
        items.sort_by(|a, b| a.position.cmp(&b.position).then(a.name.cmp(&b.name)));
        items
    }

    /// Cold start: load every persisted module and re-activate the ones
    /// that were active, in name order. One module's failure to restart
    /// never blocks the others.
    pub async fn autostart(&self) -> Result<(), ModuleError> {
        let records = self.store.load_all()?;
        let mut to_start = Vec::new();
        {
            let mut map = self.modules.write().await;
            for rec in records {
                let module = Module::from_record(rec);
                if module.status == ModuleStatus::Active {
                    to_start.push(module.name.clone());
                }
                map.insert(module.name.clone(), module);
            }
        }
        for name in to_start {
            if let Err(e) = self.activate(&name).await {
                tracing::warn!("autostart of '{}' failed: {}", name, e);
            }
        }
        Ok(())
    }

    /// Resolve the reverse-proxy target for an active module with a
    /// declared port.
    pub async fn proxy_target(
        &self,
        name: &str,
        sub_path: &str,
        query: Option<&str>,
    ) -> Result<String, ModuleError> {
        let map = self.modules.read().await;
        let module = map
            .get(name)
            .ok_or_else(|| ModuleError::Unavailable(name.to_string()))?;
        if module.status != ModuleStatus::Active {
            return Err(ModuleError::Unavailable(name.to_string()));
        }
        let port = module.manifest.as_ref().map(|m| m.port).unwrap_or(0);
        if port == 0 {
            return Err(ModuleError::NoPort(name.to_string()));
        }
        let path = if sub_path.is_empty() { "/" } else { sub_path };
        Ok(match query {
            Some(q) if !q.is_empty() => format!("http://127.0.0.1:{}{}?{}", port, path, q),
            _ => format!("http://127.0.0.1:{}{}", port, path),
        })
    }

    /// Applied from the exit-event loop when a supervised process exits on
    /// its own. Ignored unless the module is still active and the handle
    /// belongs to the exited pid, so explicit stops and replaced processes
    /// never trigger a spurious error state.
    async fn mark_unexpected_exit(&self, event: ExitEvent) {
        {
            let mut map = self.modules.write().await;
            let Some(module) = map.get_mut(&event.name) else {
                return;
            };
            let pid_matches = module.process.as_ref().map(|p| p.pid()) == Some(event.pid);
            if !pid_matches || module.status != ModuleStatus::Active {
                return;
            }
            module.process = None;
            module.status = ModuleStatus::Error;
            module.error_log = UNEXPECTED_EXIT.to_string();
        }
        if let Err(e) = self.store.set_status(&event.name, "error", UNEXPECTED_EXIT) {
            tracing::warn!("failed to persist unexpected exit for '{}': {}", event.name, e);
        }
        tracing::warn!("module '{}' exited unexpectedly", event.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MenuEntry;

    fn test_registry() -> (Arc<Registry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ModuleStore::open_in_memory().unwrap();
        let registry = Registry::new(dir.path().to_path_buf(), store);
        (registry, dir)
    }

    fn manifest(name: &str) -> Manifest {
        serde_json::from_str(&format!(
            r#"{{"name":"{}","version":"1.0.0"}}"#,
            name
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_get_and_list_sorted() {
        let (registry, _dir) = test_registry();
        registry
            .register(Module::new_installed(manifest("zeta"), SourceType::Zip, ""))
            .await
            .unwrap();
        registry
            .register(Module::new_installed(
                manifest("alpha"),
                SourceType::GitHub,
                "https://example.com/alpha.git",
            ))
            .await
            .unwrap();

        assert!(registry.get("zeta").await.is_some());
        assert!(registry.get("missing").await.is_none());
        let list = registry.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "alpha");
        assert_eq!(list[0].status, ModuleStatus::Inactive);
    }

    #[tokio::test]
    async fn test_activate_without_entrypoint_flips_status() {
        let (registry, _dir) = test_registry();
        registry
            .register(Module::new_installed(manifest("demo"), SourceType::Zip, ""))
            .await
            .unwrap();

        registry.activate("demo").await.unwrap();
        assert_eq!(
            registry.get("demo").await.unwrap().status,
            ModuleStatus::Active
        );
    }

    #[tokio::test]
    async fn test_activate_unknown_module_fails() {
        let (registry, _dir) = test_registry();
        assert!(matches!(
            registry.activate("ghost").await,
            Err(ModuleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_activate_with_missing_entrypoint_sets_error() {
        let (registry, _dir) = test_registry();
        let mut m = manifest("demo");
        m.entrypoint = "run.sh".into();
        registry
            .register(Module::new_installed(m, SourceType::Zip, ""))
            .await
            .unwrap();

        let err = registry.activate("demo").await.unwrap_err();
        assert!(matches!(err, ModuleError::EntrypointMissing(_)));
        let module = registry.get("demo").await.unwrap();
        assert_eq!(module.status, ModuleStatus::Error);
        assert!(!module.error_log.is_empty());
    }

    #[tokio::test]
    async fn test_deactivate_inactive_is_errorless_noop() {
        let (registry, _dir) = test_registry();
        registry
            .register(Module::new_installed(manifest("demo"), SourceType::Zip, ""))
            .await
            .unwrap();

        registry.deactivate("demo").await.unwrap();
        registry.deactivate("unknown").await.unwrap();
        assert_eq!(
            registry.get("demo").await.unwrap().status,
            ModuleStatus::Inactive
        );
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_directory() {
        let (registry, dir) = test_registry();
        registry
            .register(Module::new_installed(manifest("demo"), SourceType::Zip, ""))
            .await
            .unwrap();
        let module_dir = registry.module_dir("demo");
        std::fs::create_dir_all(&module_dir).unwrap();
        std::fs::write(module_dir.join("file.txt"), "x").unwrap();

        registry.delete("demo").await.unwrap();
        assert!(registry.get("demo").await.is_none());
        assert!(!module_dir.exists());
        assert!(registry.list().await.is_empty());
        drop(dir);
    }

    #[tokio::test]
    async fn test_nav_items_defaults_and_ordering() {
        let (registry, _dir) = test_registry();

        let mut first = manifest("bravo");
        first.description = "Bravo module".into();
        first.menu = MenuEntry {
            label: String::new(),
            icon: String::new(),
            position: 2,
            hidden: false,
        };
        let mut second = manifest("alpha");
        second.menu = MenuEntry {
            label: "Alpha!".into(),
            icon: "star".into(),
            position: 2,
            hidden: false,
        };
        let mut hidden = manifest("hidden");
        hidden.menu.hidden = true;

        for m in [first, second, hidden] {
            registry
                .register(Module::new_installed(m, SourceType::Zip, ""))
                .await
                .unwrap();
        }
        for name in ["bravo", "alpha", "hidden"] {
            registry.activate(name).await.unwrap();
        }
        // Inactive modules never appear.
        registry
            .register(Module::new_installed(manifest("inactive"), SourceType::Zip, ""))
            .await
            .unwrap();

        let items = registry.nav_items().await;
        assert_eq!(items.len(), 2);
        // Same position: name breaks the tie.
        assert_eq!(items[0].name, "alpha");
        assert_eq!(items[0].label, "Alpha!");
        assert_eq!(items[0].icon, "star");
        assert_eq!(items[1].name, "bravo");
        assert_eq!(items[1].label, "Bravo module");
        assert_eq!(items[1].icon, "package");
    }

    #[tokio::test]
    async fn test_proxy_target_resolution() {
        let (registry, _dir) = test_registry();
        let mut m = manifest("api");
        m.port = 4321;
        registry
            .register(Module::new_installed(m, SourceType::Zip, ""))
            .await
            .unwrap();

        // Inactive module is unavailable.
        assert!(matches!(
            registry.proxy_target("api", "/ping", None).await,
            Err(ModuleError::Unavailable(_))
        ));
        registry.activate("api").await.unwrap();

        assert_eq!(
            registry.proxy_target("api", "/ping", None).await.unwrap(),
            "http://127.0.0.1:4321/ping"
        );
        assert_eq!(
            registry
                .proxy_target("api", "", Some("q=1"))
                .await
                .unwrap(),
            "http://127.0.0.1:4321/?q=1"
        );

        registry
            .register(Module::new_installed(manifest("noport"), SourceType::Zip, ""))
            .await
            .unwrap();
        registry.activate("noport").await.unwrap();
        assert!(matches!(
            registry.proxy_target("noport", "/", None).await,
            Err(ModuleError::NoPort(_))
        ));
        assert!(matches!(
            registry.proxy_target("missing", "/", None).await,
            Err(ModuleError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_autostart_restores_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModuleStore::open_in_memory().unwrap();

        // Seed the store directly: one active (no entrypoint), one inactive.
        {
            let seeding = Registry::new(dir.path().to_path_buf(), store.clone());
            seeding
                .register(Module::new_installed(manifest("web"), SourceType::Zip, ""))
                .await
                .unwrap();
            seeding
                .register(Module::new_installed(manifest("idle"), SourceType::Zip, ""))
                .await
                .unwrap();
            seeding.activate("web").await.unwrap();
        }

        let registry = Registry::new(dir.path().to_path_buf(), store);
        registry.autostart().await.unwrap();
        assert_eq!(
            registry.get("web").await.unwrap().status,
            ModuleStatus::Active
        );
        assert_eq!(
            registry.get("idle").await.unwrap().status,
            ModuleStatus::Inactive
        );
    }
}
