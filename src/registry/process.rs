//! Process supervision for activated modules.
//!
//! Each supervised module gets one watcher task that owns the child process.
//! Natural exits are reported back to the registry through a single exit
//! channel; explicit stops go through the watcher's stop channel so the
//! registry never mutates module state from an arbitrary task context.

use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::error::ModuleError;
use crate::manifest::Manifest;

/// Grace period after launch; a process that dies inside this window is
/// reported synchronously as a start failure instead of a later unexpected
/// exit. Not a readiness guarantee.
pub(crate) const LAUNCH_GRACE: Duration = Duration::from_millis(300);

/// Posted by a watcher when its process exits on its own.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub name: String,
    pub pid: u32,
}

/// Handle to a supervised process. Cloneable so module snapshots stay cheap;
/// the watcher task owns the actual child.
#[derive(Debug, Clone)]
pub struct ModuleProcess {
    pid: u32,
    stop_tx: mpsc::Sender<()>,
    exited_rx: watch::Receiver<bool>,
}

impl ModuleProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&self) -> bool {
        *self.exited_rx.borrow()
    }
}

pub(crate) struct Supervisor {
    data_dir: PathBuf,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
}

impl Supervisor {
    pub fn new(data_dir: PathBuf, exit_tx: mpsc::UnboundedSender<ExitEvent>) -> Self {
        Self { data_dir, exit_tx }
    }

    fn module_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join("modules").join(name)
    }

    /// Launch the module's entrypoint. The caller is responsible for only
    /// invoking this when the manifest declares one.
    pub async fn start(&self, name: &str, manifest: &Manifest) -> Result<ModuleProcess, ModuleError> {
        let dir = self.module_dir(name);
        let entry = dir.join(&manifest.entrypoint);
        if !entry.is_file() {
            return Err(ModuleError::EntrypointMissing(manifest.entrypoint.clone()));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&entry, fs::Permissions::from_mode(0o755))?;
        }

        let module_data = self.data_dir.join("module_data").join(name);
        fs::create_dir_all(&module_data)?;
        let log_dir = self.data_dir.join("logs");
        fs::create_dir_all(&log_dir)?;
        let log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(format!("module-{}.log", name)))?;
        let log_file_err = log_file.try_clone()?;

        let mut cmd = Command::new(&entry);
        cmd.args(&manifest.args)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            .env("MODULE_NAME", name)
            .env("MODULE_DIR", &dir)
            .env("DATA_DIR", &module_data)
            .kill_on_drop(false);
        if manifest.port != 0 {
            cmd.env("PORT", manifest.port.to_string());
        }
        // Manifest env is applied last and may shadow the fixed variables.
        for (key, value) in &manifest.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ModuleError::Start(format!("failed to launch '{}': {}", manifest.entrypoint, e)))?;
        let pid = child.id().unwrap_or(0);
        tracing::info!("module '{}' started (pid {})", name, pid);

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let (exited_tx, exited_rx) = watch::channel(false);
        let exit_tx = self.exit_tx.clone();
        let watch_name = name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(st) => tracing::info!("module '{}' exited with {}", watch_name, st),
                        Err(e) => tracing::warn!("module '{}' wait failed: {}", watch_name, e),
                    }
                    let _ = exit_tx.send(ExitEvent { name: watch_name, pid });
                }
                _ = stop_rx.recv() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    tracing::info!("module '{}' stopped", watch_name);
                }
            }
            let _ = exited_tx.send(true);
        });

        let process = ModuleProcess {
            pid,
            stop_tx,
            exited_rx,
        };

        // Fail-fast window: turn an immediate crash into a start error.
        tokio::time::sleep(LAUNCH_GRACE).await;
        if process.has_exited() {
            return Err(ModuleError::Start(format!(
                "process exited immediately after launch; see logs/module-{}.log",
                name
            )));
        }
        Ok(process)
    }

    /// Terminate a supervised process and wait for it to go away. Safe to
    /// call on a process that already exited.
    pub async fn stop(&self, process: ModuleProcess) {
        let _ = process.stop_tx.send(()).await;
        let mut exited = process.exited_rx;
        while !*exited.borrow() {
            if exited.changed().await.is_err() {
                break;
            }
        }
    }
}
