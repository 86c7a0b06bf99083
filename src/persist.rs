//! Crash-safe snapshot persistence.
//!
//! A background loop wakes on a configurable interval and, when the dirty
//! flag is set, snapshots each persisted aggregate independently: rotate
//! the previous primary file to `.bak`, write a fresh gzip-compressed
//! JSON snapshot, and fall back to the backup if anything goes wrong.
//! Corrupt files are renamed aside for manual recovery, never deleted.
//!
//! Setting the interval to zero (or below) stops the loop after one final
//! synchronous save; that is how shutdown forces the last write out.

use anyhow::{Context, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

use crate::imagestore::ImageStore;
use crate::registry::MapRegistry;

pub const MAPS_AGGREGATE: &str = "maps";
pub const IMAGES_AGGREGATE: &str = "images";

// ---------------------------------------------------------------------------
// Dirty flag
// ---------------------------------------------------------------------------

/// Set by every successful mutation, consumed by the save loop.
#[derive(Debug, Default)]
pub struct DirtyFlag(AtomicBool);

impl DirtyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Read-and-clear.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Persister
// ---------------------------------------------------------------------------

pub struct Persister {
    dir: PathBuf,
    registry: Arc<MapRegistry>,
    images: Arc<ImageStore>,
    dirty: Arc<DirtyFlag>,
}

impl Persister {
    pub fn new(
        dir: impl Into<PathBuf>,
        registry: Arc<MapRegistry>,
        images: Arc<ImageStore>,
        dirty: Arc<DirtyFlag>,
    ) -> Self {
        Self {
            dir: dir.into(),
            registry,
            images,
            dirty,
        }
    }

    /// Save loop. `interval` carries the sleep length in seconds; send a
    /// value ≤ 0 to trigger the final save and terminate.
    pub async fn run(self, mut interval: watch::Receiver<i64>) {
        loop {
            let secs = *interval.borrow();
            if secs <= 0 {
                info!("persistence loop stopping – final save");
                self.save_all();
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs as u64)) => {
                    if self.dirty.take() {
                        self.save_all();
                    }
                }
                changed = interval.changed() => {
                    if changed.is_err() {
                        // Controller dropped; behave like a shutdown.
                        self.save_all();
                        return;
                    }
                }
            }
        }
    }

    /// Snapshot every aggregate. Each saves independently; one failure
    /// is logged and never blocks the other.
    pub fn save_all(&self) {
        if let Err(e) = save_aggregate(&self.dir, MAPS_AGGREGATE, &self.registry.snapshot()) {
            error!("failed to save map registry: {:#}", e);
        }
        if let Err(e) = save_aggregate(&self.dir, IMAGES_AGGREGATE, &self.images.snapshot()) {
            error!("failed to save image store: {:#}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// Per-aggregate save / load
// ---------------------------------------------------------------------------

fn primary_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json.gz"))
}

fn backup_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json.gz.bak"))
}

/// Rotate-then-write. The previous primary becomes the backup before the
/// new snapshot is written, so a crash mid-write always leaves one good
/// file; a failed write restores the primary from that backup.
pub fn save_aggregate<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;
    let primary = primary_path(dir, name);
    let backup = backup_path(dir, name);

    if primary.exists() {
        fs::rename(&primary, &backup)
            .with_context(|| format!("failed to rotate {} to backup", primary.display()))?;
    }

    let written = (|| -> Result<()> {
        let file = fs::File::create(&primary)?;
        let mut enc = GzEncoder::new(file, Compression::default());
        serde_json::to_writer(&mut enc, value)?;
        enc.finish()?;
        Ok(())
    })();

    if let Err(e) = written {
        if backup.exists() {
            if let Err(re) = fs::copy(&backup, &primary) {
                warn!(
                    "could not restore {} from backup: {}",
                    primary.display(),
                    re
                );
            }
        }
        return Err(e).with_context(|| format!("failed to write snapshot '{name}'"));
    }
    Ok(())
}

/// Load the newest readable snapshot, or None for a fresh start.
///
/// A primary that exists but does not parse is renamed aside with a
/// timestamp suffix and the backup is tried next; if that is corrupt too
/// the aggregate starts empty and the condition is logged prominently.
pub fn load_aggregate<T: DeserializeOwned>(dir: &Path, name: &str) -> Option<T> {
    let primary = primary_path(dir, name);
    let backup = backup_path(dir, name);

    match read_snapshot(&primary) {
        Ok(Some(value)) => return Some(value),
        Ok(None) => {}
        Err(e) => {
            warn!("snapshot {} unreadable: {:#}", primary.display(), e);
            rename_aside(&primary);
        }
    }

    match read_snapshot(&backup) {
        Ok(Some(value)) => {
            info!("recovered aggregate '{}' from backup", name);
            Some(value)
        }
        Ok(None) => None,
        Err(e) => {
            error!(
                "both snapshots for '{}' are unreadable ({:#}); starting empty",
                name, e
            );
            rename_aside(&backup);
            None
        }
    }
}

fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = fs::File::open(path)?;
    let value = serde_json::from_reader(GzDecoder::new(file))?;
    Ok(Some(value))
}

fn rename_aside(path: &Path) {
    if !path.exists() {
        return;
    }
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let aside = PathBuf::from(format!("{}.corrupt-{}", path.display(), ts));
    match fs::rename(path, &aside) {
        Ok(()) => warn!("renamed corrupt snapshot to {}", aside.display()),
        Err(e) => warn!("could not rename {} aside: {}", path.display(), e),
    }
}
