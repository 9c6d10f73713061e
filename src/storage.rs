// src/storage.rs

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};

use crate::config::{CameraDescriptor, UploadTarget};
use crate::recorder::CompletedFile;

/// Routes completed segments to the upload targets of their camera.
pub struct StorageDispatcher {
    targets: HashMap<String, Vec<UploadTarget>>,
}

impl StorageDispatcher {
    pub fn new(cameras: &[CameraDescriptor]) -> Self {
        let targets = cameras
            .iter()
            .map(|c| (c.name.clone(), c.upload_targets.clone()))
            .collect();
        Self { targets }
    }

    /// Consumes events until every sender is dropped.
    pub fn spawn(self, events: Receiver<CompletedFile>) -> Result<JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name("storage".into())
            .spawn(move || {
                for file in events.iter() {
                    self.dispatch(&file);
                }
                debug!("[storage] event channel closed");
            })
            .context("spawning storage thread")?;
        Ok(handle)
    }

    /// Failures are logged per target and never propagate.
    pub fn dispatch(&self, file: &CompletedFile) {
        let Some(targets) = self.targets.get(&file.camera) else {
            warn!("[storage] no camera '{}' for {}", file.camera, file.path.display());
            return;
        };

        for target in targets {
            match target {
                UploadTarget::Local { path } => match copy_local(&file.path, path) {
                    Ok(dest) => info!("[storage] copied {} -> {}", file.path.display(), dest.display()),
                    Err(e) => error!("[storage] local copy of {} failed: {:#}", file.path.display(), e),
                },
                UploadTarget::Aws { bucket, prefix, .. } => {
                    warn!(
                        "[storage] remote upload not available in this build, {} stays local (bucket {}, prefix '{}')",
                        file.path.display(),
                        bucket,
                        prefix
                    );
                }
            }
        }
    }
}

/// Copies `src` into directory `dir`, keeping its file name.
pub fn copy_local(src: &Path, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let name = src
        .file_name()
        .with_context(|| format!("{} has no file name", src.display()))?;
    let dest = dir.join(name);
    fs::copy(src, &dest)
        .with_context(|| format!("copying {} to {}", src.display(), dest.display()))?;
    Ok(dest)
}
