//! End-to-end install workflows.
//!
//! Both entry points return a live [`Task`] immediately and run the rest of
//! the workflow on a spawned worker: fetch, manifest validation, dependency
//! check, copy into place, optional install hook, registration. Every step
//! logs a progress line; any failure finishes the task with the error and
//! leaves no module registered beyond the cleanup already performed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::ModuleError;
use crate::fetch::{self, UnsafeEntryPolicy};
use crate::manifest::{self, Manifest};
use crate::registry::{Module, Registry, SourceType};
use crate::task::{Task, TaskStore};

/// Optional hook executed from the module directory after copy-into-place.
const INSTALL_HOOK: &str = "install.sh";

pub struct Installer {
    registry: Arc<Registry>,
    tasks: Arc<TaskStore>,
    policy: UnsafeEntryPolicy,
}

impl Installer {
    pub fn new(
        registry: Arc<Registry>,
        tasks: Arc<TaskStore>,
        policy: UnsafeEntryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            tasks,
            policy,
        })
    }

    /// Install from a git repository URL. Returns the task handle at once;
    /// the clone and the rest of the workflow run in the background.
    pub async fn install_from_github(
        self: &Arc<Self>,
        repo_url: String,
        cancel: CancellationToken,
    ) -> Arc<Task> {
        let task = self.tasks.create().await;
        let installer = self.clone();
        let worker_task = task.clone();
        tokio::spawn(async move {
            let result = installer
                .run_github(&repo_url, &worker_task, &cancel)
                .await;
            worker_task.finish(result.as_ref().err()).await;
        });
        task
    }

    /// Install from an uploaded zip archive. The archive file is removed
    /// once the workflow completes, win or lose.
    pub async fn install_from_archive(
        self: &Arc<Self>,
        archive: PathBuf,
        cancel: CancellationToken,
    ) -> Arc<Task> {
        let task = self.tasks.create().await;
        let installer = self.clone();
        let worker_task = task.clone();
        tokio::spawn(async move {
            let result = installer.run_archive(&archive, &worker_task, &cancel).await;
            let _ = tokio::fs::remove_file(&archive).await;
            worker_task.finish(result.as_ref().err()).await;
        });
        task
    }

    async fn run_github(
        &self,
        repo_url: &str,
        task: &Arc<Task>,
        cancel: &CancellationToken,
    ) -> Result<(), ModuleError> {
        task.info(format!("Cloning {}", repo_url)).await;
        let scratch = tempfile::tempdir()?;
        let checkout = scratch.path().join("checkout");
        fetch::git_clone(repo_url, &checkout, task, cancel).await?;
        task.ok("Clone complete").await;

        let (manifest, src) = manifest::resolve(&checkout)?;
        self.finalize(&manifest, &src, SourceType::GitHub, repo_url, task, cancel)
            .await
        // scratch dropped here: the checkout is removed on success and failure.
    }

    async fn run_archive(
        &self,
        archive: &Path,
        task: &Arc<Task>,
        cancel: &CancellationToken,
    ) -> Result<(), ModuleError> {
        task.info("Extracting archive...").await;
        let scratch = tempfile::tempdir()?;
        fetch::extract_archive(archive, scratch.path(), self.policy)?;
        task.ok("Archive extracted").await;

        let (manifest, src) = manifest::resolve(scratch.path())?;
        self.finalize(&manifest, &src, SourceType::Zip, "", task, cancel)
            .await
    }

    async fn finalize(
        &self,
        manifest: &Manifest,
        src: &Path,
        source_type: SourceType,
        source_url: &str,
        task: &Arc<Task>,
        cancel: &CancellationToken,
    ) -> Result<(), ModuleError> {
        task.info(format!(
            "Module: {} v{} ({})",
            manifest.name, manifest.version, manifest.description
        ))
        .await;

        // Presence check only; no version resolution.
        for dep in &manifest.requires {
            which::which(dep).map_err(|_| ModuleError::DependencyMissing(dep.clone()))?;
            task.ok(format!("Found required tool: {}", dep)).await;
        }

        let dst = self.registry.module_dir(&manifest.name);
        if self.registry.get(&manifest.name).await.is_some() {
            task.warn("Replacing existing module").await;
            self.registry.stop_if_running(&manifest.name).await;
            if dst.exists() {
                std::fs::remove_dir_all(&dst)?;
            }
        }

        task.info("Copying files...").await;
        fetch::copy_dir(src, &dst)?;

        let hook = dst.join(INSTALL_HOOK);
        if hook.is_file() {
            task.info(format!("Running {}...", INSTALL_HOOK)).await;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755))?;
            }
            fetch::run_streamed(
                task.clone(),
                "bash",
                vec![hook.to_string_lossy().into_owned()],
                Some(&dst),
                cancel,
            )
            .await
            .map_err(|e| ModuleError::Hook(e.to_string()))?;
            task.ok(format!("{} finished", INSTALL_HOOK)).await;
        }

        let module = Module::new_installed(manifest.clone(), source_type, source_url);
        self.registry.register(module).await?;
        task.ok(format!(
            "Module '{}' installed. Activate it to start using it.",
            manifest.name
        ))
        .await;
        Ok(())
    }
}
