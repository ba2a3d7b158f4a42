//! Source acquisition: repository clone and archive extraction, plus the
//! shared helpers both install paths use (streamed subprocess runner and
//! recursive tree copy).

use std::fs;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ModuleError;
use crate::task::Task;

/// What to do with an archive entry whose resolved path would escape the
/// extraction directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsafeEntryPolicy {
    /// Skip the entry and keep extracting (logged as a warning).
    Skip,
    /// Fail the whole extraction.
    Reject,
}

/// Run a subprocess, streaming its combined stdout/stderr into `task` as
/// info lines. Returns an error carrying the exit diagnostics on nonzero
/// exit. Cancelling `cancel` kills the child.
pub async fn run_streamed(
    task: Arc<Task>,
    program: &str,
    args: Vec<String>,
    dir: Option<&Path>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut cmd = Command::new(program);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn '{}'", program))?;

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let task = task.clone();
        readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    task.info(format!("  {}", trimmed)).await;
                }
            }
        }));
    }
    if let Some(stderr) = child.stderr.take() {
        let task = task.clone();
        readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    task.info(format!("  {}", trimmed)).await;
                }
            }
        }));
    }

    let status = tokio::select! {
        status = child.wait() => status.with_context(|| format!("failed to wait for '{}'", program))?,
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            anyhow::bail!("cancelled");
        }
    };

    // Drain remaining output so the task log is complete before we return.
    for reader in readers {
        let _ = reader.await;
    }

    if !status.success() {
        anyhow::bail!("'{}' exited with {}", program, status);
    }
    Ok(())
}

/// Shallow, single-branch clone of `url` into `dest`, streaming the clone
/// output into the task.
pub async fn git_clone(
    url: &str,
    dest: &Path,
    task: &Arc<Task>,
    cancel: &CancellationToken,
) -> Result<(), ModuleError> {
    let args = vec![
        "clone".to_string(),
        "--depth".to_string(),
        "1".to_string(),
        "--single-branch".to_string(),
        url.to_string(),
        dest.to_string_lossy().into_owned(),
    ];
    run_streamed(task.clone(), "git", args, None, cancel)
        .await
        .map_err(|e| ModuleError::Fetch(format!("git clone: {}", e)))
}

/// Extract a zip archive into `dest`. Entries whose resolved path would
/// escape `dest` are handled according to `policy`.
pub fn extract_archive(
    archive: &Path,
    dest: &Path,
    policy: UnsafeEntryPolicy,
) -> Result<(), ModuleError> {
    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| ModuleError::Archive(format!("not a valid zip archive: {}", e)))?;
    fs::create_dir_all(dest)?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| ModuleError::Archive(format!("corrupt archive entry: {}", e)))?;

        // enclosed_name() rejects absolute paths and `..` components.
        let relative = match entry.enclosed_name() {
            Some(p) => p.to_owned(),
            None => match policy {
                UnsafeEntryPolicy::Skip => {
                    tracing::warn!("skipping unsafe archive entry {:?}", entry.name());
                    continue;
                }
                UnsafeEntryPolicy::Reject => {
                    return Err(ModuleError::Archive(format!(
                        "entry {:?} escapes the extraction directory",
                        entry.name()
                    )));
                }
            },
        };

        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

/// Recursively copy a directory tree. `fs::copy` preserves file modes.
pub fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options: zip::write::FileOptions = Default::default();
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_extract_archive_basic_tree() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.zip");
        write_zip(
            &archive,
            &[
                ("manifest.json", "{}"),
                ("sub/data.txt", "hello"),
            ],
        );

        let dest = dir.path().join("out");
        extract_archive(&archive, &dest, UnsafeEntryPolicy::Skip).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("manifest.json")).unwrap(),
            "{}"
        );
        assert_eq!(fs::read_to_string(dest.join("sub/data.txt")).unwrap(), "hello");
    }

    #[test]
    fn test_extract_rejects_non_zip_input() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("not.zip");
        fs::write(&bogus, "plain text").unwrap();
        let err = extract_archive(&bogus, &dir.path().join("out"), UnsafeEntryPolicy::Skip)
            .unwrap_err();
        assert!(matches!(err, ModuleError::Archive(_)));
    }

    #[test]
    fn test_traversal_entry_skipped_under_skip_policy() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(
            &archive,
            &[("../escape.txt", "nope"), ("safe.txt", "yes")],
        );

        let dest = dir.path().join("out");
        extract_archive(&archive, &dest, UnsafeEntryPolicy::Skip).unwrap();
        assert!(dest.join("safe.txt").is_file());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_traversal_entry_fails_under_reject_policy() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../escape.txt", "nope")]);

        let err = extract_archive(&archive, &dir.path().join("out"), UnsafeEntryPolicy::Reject)
            .unwrap_err();
        assert!(matches!(err, ModuleError::Archive(_)));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_copy_dir_recurses_and_preserves_modes() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join("nested")).unwrap();
        fs::write(src.path().join("a.txt"), "a").unwrap();
        fs::write(src.path().join("nested/b.sh"), "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(
                src.path().join("nested/b.sh"),
                fs::Permissions::from_mode(0o755),
            )
            .unwrap();
        }

        let dst = tempfile::tempdir().unwrap();
        let target = dst.path().join("copy");
        copy_dir(src.path(), &target).unwrap();
        assert_eq!(fs::read_to_string(target.join("a.txt")).unwrap(), "a");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(target.join("nested/b.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[tokio::test]
    async fn test_run_streamed_captures_output_and_exit_status() {
        let store = crate::task::TaskStore::new();
        let task = store.create().await;
        let cancel = CancellationToken::new();

        run_streamed(
            task.clone(),
            "sh",
            vec!["-c".into(), "echo first; echo second 1>&2".into()],
            None,
            &cancel,
        )
        .await
        .unwrap();

        let (buf, _) = task.snapshot().await;
        let texts: Vec<_> = buf.iter().map(|e| e.line.text.trim().to_string()).collect();
        assert!(texts.contains(&"first".to_string()));
        assert!(texts.contains(&"second".to_string()));

        let err = run_streamed(
            task.clone(),
            "sh",
            vec!["-c".into(), "exit 3".into()],
            None,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[tokio::test]
    async fn test_run_streamed_cancellation_kills_child() {
        let store = crate::task::TaskStore::new();
        let task = store.create().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_streamed(
            task,
            "sh",
            vec!["-c".into(), "sleep 30".into()],
            None,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
