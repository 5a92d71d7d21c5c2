use crate::error::{AssetError, Result};
use crate::models::auth::CredentialStore;
use crate::models::download::{fetch_to_path, unzip_into, ProgressObserver, Transport};
use crate::models::manifest::{DownloadStep, FileSpec, PostProcess, StepAction};
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use subprocess::Exec;

/// Scratch directory under the base dir used while unpacking archives.
/// Shared by every entry, so acquisitions must not overlap.
pub const SCRATCH_DIR: &str = "temp";

/// Blocks until an operator confirms a manual step
pub trait Acknowledge {
    fn acknowledge(&self, prompt: &str) -> Result<()>;
}

/// Waits for ENTER on stdin
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinAcknowledger;

impl Acknowledge for StdinAcknowledger {
    fn acknowledge(&self, prompt: &str) -> Result<()> {
        tracing::warn!("{prompt}");

        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            return Err(AssetError::Other(
                "stdin closed before the manual download was confirmed".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which catalog a recipe belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// A tainted model re-fetches files that are already present
    Model { tainted: bool },
    Dependency,
}

impl Scope {
    const fn forces_refetch(self) -> bool {
        matches!(self, Self::Model { tainted: true })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeOutcome {
    Completed,
    /// Stopped early on a step this scope cannot run
    Aborted,
}

/// Executes download recipes against the base directory
pub struct RecipeRunner<'a> {
    pub base_dir: &'a Path,
    pub transport: &'a dyn Transport,
    pub progress: &'a dyn ProgressObserver,
    pub acknowledger: &'a dyn Acknowledge,
    pub credentials: &'a CredentialStore,
    pub headroom_bytes: u64,
}

impl RecipeRunner<'_> {
    /// Run every step in order. Step `i` targets its `file_path/file_name`, or
    /// required file `i` when the step names no path.
    pub fn run(
        &self,
        name: &str,
        files: &[FileSpec],
        steps: &[DownloadStep],
        scope: Scope,
    ) -> Result<RecipeOutcome> {
        for (index, step) in steps.iter().enumerate() {
            if scope == Scope::Dependency && matches!(step.action, StepAction::GitClone { .. }) {
                let err = AssetError::Unsupported(format!("git download of dependency '{name}'"));
                tracing::warn!("{err}; skipping the rest of its recipe");
                return Ok(RecipeOutcome::Aborted);
            }

            self.run_step(name, index, step, files, scope)?;
        }

        Ok(RecipeOutcome::Completed)
    }

    fn run_step(
        &self,
        name: &str,
        index: usize,
        step: &DownloadStep,
        files: &[FileSpec],
        scope: Scope,
    ) -> Result<()> {
        match &step.action {
            StepAction::Manual { url } => {
                let target = self.base_dir.join(target_for(name, index, step, files)?);
                let source = url.as_deref().unwrap_or("its publisher");
                let prompt = format!(
                    "{name} requires manual download from {source}. \
                     Please place it in {} then press ENTER to continue...",
                    target.display()
                );
                self.acknowledger.acknowledge(&prompt)
            }
            StepAction::WriteContent { content } => {
                let target = self.base_dir.join(target_for(name, index, step, files)?);
                tracing::info!("Writing {} bytes to {}", content.len(), target.display());
                create_parent(&target)?;
                fs::write(&target, content)?;
                Ok(())
            }
            StepAction::Symlink { target: original } => {
                let link = self.base_dir.join(target_for(name, index, step, files)?);
                let original = self.base_dir.join(original);
                if fs::symlink_metadata(&link).is_ok() {
                    tracing::debug!("{} already exists", link.display());
                    return Ok(());
                }
                tracing::info!("symlink {} to {}", link.display(), original.display());
                create_parent(&link)?;
                make_symlink(&original, &link)?;
                Ok(())
            }
            StepAction::GitClone { url, post_process } => {
                let dir = self.base_dir.join(target_for(name, index, step, files)?);
                if fs::symlink_metadata(&dir).is_ok() {
                    if !scope.forces_refetch() {
                        tracing::debug!("{} already cloned", dir.display());
                        return apply_post_process(self.base_dir, post_process);
                    }
                    tracing::info!("Removing stale clone {}", dir.display());
                    remove_path(&dir)?;
                }
                tracing::info!("git clone {url} to {}", dir.display());
                create_parent(&dir)?;
                git_clone(url, &dir)?;
                apply_post_process(self.base_dir, post_process)
            }
            StepAction::Unzip { url } => self.unzip(name, index, url, step, files),
            StepAction::AuthFetch { url_template } => {
                let target = target_for(name, index, step, files)?;
                let url = self.credentials.expand(url_template)?;
                self.fetch(url_template, &url, &target, scope)
            }
            StepAction::Fetch { url } => {
                let target = target_for(name, index, step, files)?;
                self.fetch(url, url, &target, scope)
            }
        }
    }

    /// `shown_url` is what gets logged; it never carries credentials
    fn fetch(&self, shown_url: &str, url: &str, target: &Path, scope: Scope) -> Result<()> {
        let dest = self.base_dir.join(target);
        if dest.exists() && !scope.forces_refetch() {
            tracing::debug!("{} already present, skipping download", dest.display());
            return Ok(());
        }

        tracing::info!("Downloading {shown_url} to {}", dest.display());
        fetch_to_path(self.transport, url, &dest, self.progress, self.headroom_bytes)?;
        Ok(())
    }

    /// Fetch `temp/<name>.zip`, extract it into `temp/`, move
    /// `temp/<name>-main/<name>` to the destination and clean up.
    fn unzip(
        &self,
        entry: &str,
        index: usize,
        url: &str,
        step: &DownloadStep,
        files: &[FileSpec],
    ) -> Result<()> {
        let dest_rel = match (&step.file_path, files.get(index)) {
            (Some(dir), _) => PathBuf::from(dir),
            (None, Some(file)) => PathBuf::from(&file.path),
            (None, None) => return Err(no_target(entry, index)),
        };
        let archive_name = step
            .file_name
            .clone()
            .or_else(|| {
                dest_rel
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .ok_or_else(|| no_target(entry, index))?;

        let scratch = self.base_dir.join(SCRATCH_DIR);
        fs::create_dir_all(&scratch)?;
        let zip_path = scratch.join(format!("{archive_name}.zip"));
        tracing::info!("Downloading {url} to {}", zip_path.display());
        fetch_to_path(self.transport, url, &zip_path, self.progress, self.headroom_bytes)?;

        tracing::info!("unzip {}", zip_path.display());
        unzip_into(&zip_path, &scratch)?;

        let extracted = scratch.join(format!("{archive_name}-main"));
        let source = extracted.join(&archive_name);
        let dest = self.base_dir.join(&dest_rel);
        if fs::symlink_metadata(&dest).is_ok() {
            tracing::info!("Replacing existing {}", dest.display());
            remove_path(&dest)?;
        }
        create_parent(&dest)?;
        tracing::info!("move {} to {}", source.display(), dest.display());
        fs::rename(&source, &dest)?;

        tracing::info!("delete {}", zip_path.display());
        fs::remove_file(&zip_path)?;
        tracing::info!("delete {}", extracted.display());
        fs::remove_dir_all(&extracted)?;

        Ok(())
    }
}

fn target_for(entry: &str, index: usize, step: &DownloadStep, files: &[FileSpec]) -> Result<PathBuf> {
    step.explicit_target()
        .or_else(|| files.get(index).map(|file| PathBuf::from(&file.path)))
        .ok_or_else(|| no_target(entry, index))
}

fn no_target(entry: &str, index: usize) -> AssetError {
    AssetError::Other(format!(
        "download step {index} of '{entry}' names no file and has no matching required file"
    ))
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Delete post-clone leftovers. Permission failures need an operator and are
/// only reported; paths that are already gone are fine.
pub fn apply_post_process(base_dir: &Path, steps: &[PostProcess]) -> Result<()> {
    for path in steps.iter().filter_map(|p| p.delete.as_deref()) {
        let path = base_dir.join(path);
        tracing::info!("delete {}", path.display());

        match remove_path(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                tracing::error!(
                    "Something went wrong while deleting {}. Please delete it manually: {e}",
                    path.display()
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("{} already removed", path.display());
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Clone `url` into `dir`, which must not exist yet
fn git_clone(url: &str, dir: &Path) -> Result<()> {
    if which::which("git").is_err() {
        return Err(AssetError::Git("git binary not found in PATH".to_string()));
    }

    let status = Exec::cmd("git")
        .arg("clone")
        .arg(url)
        .arg(dir)
        .join()
        .map_err(|e| AssetError::Git(format!("Failed to spawn git: {e}")))?;

    if !status.success() {
        return Err(AssetError::Git(format!("git clone {url} failed: {status:?}")));
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(original: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn make_symlink(original: &Path, link: &Path) -> io::Result<()> {
    if original.is_dir() {
        std::os::windows::fs::symlink_dir(original, link)
    } else {
        std::os::windows::fs::symlink_file(original, link)
    }
}
