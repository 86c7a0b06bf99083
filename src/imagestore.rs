//! Content-addressed image store.
//!
//! Identical payloads are deduplicated to a single entry located by an
//! md5 content digest; entries are reference-counted by the sprite
//! bindings that point at them and deleted deterministically when the
//! last binding goes away, with no separate garbage-collection sweep.

use log::{info, warn};
use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;
use thiserror::Error;

use crate::map::Map;

/// Uploads past this size are rejected at the boundary, before any shared
/// state is touched.
pub const MAX_UPLOAD_BYTES: usize = 1 << 20;

const TOKEN_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("image not found")]
    NotFound,
    #[error("image of {0} bytes exceeds the {MAX_UPLOAD_BYTES} byte limit")]
    TooLarge(usize),
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// An uploaded payload or a link to an external image.
///
/// Equality is structural: same MIME type and identical bytes, or the
/// same redirect URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Image {
    Inline { mime: String, bytes: Vec<u8> },
    Redirect { url: String },
}

impl Image {
    /// Content digest used by the reverse index. Digest collisions are
    /// resolved by structural comparison, never trusted blindly.
    pub fn digest(&self) -> String {
        match self {
            Image::Inline { bytes, .. } => format!("{:x}", md5::compute(bytes)),
            Image::Redirect { url } => format!("{:x}", md5::compute(url.as_bytes())),
        }
    }

    pub fn byte_len(&self) -> usize {
        match self {
            Image::Inline { bytes, .. } => bytes.len(),
            Image::Redirect { url } => url.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageEntry {
    image: Image,
    refs: i64,
}

/// Persisted form of the store: the entries alone. The reverse index and
/// the modified timestamps are rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageStoreSnapshot {
    entries: BTreeMap<String, ImageEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageStoreStats {
    pub entries: usize,
    pub inline_bytes: usize,
}

#[derive(Default)]
struct StoreInner {
    entries: BTreeMap<String, ImageEntry>,
    /// digest → tokens carrying that digest (usually one).
    by_digest: HashMap<String, Vec<String>>,
    modified: HashMap<String, SystemTime>,
}

/// Shared across all maps; guarded by its own lock because bind/unbind
/// from different maps race on the same entry's refcount.
pub struct ImageStore {
    inner: Mutex<StoreInner>,
    started: SystemTime,
}

impl ImageStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            started: SystemTime::now(),
        }
    }

    pub fn restore(snapshot: ImageStoreSnapshot) -> Self {
        let mut inner = StoreInner {
            entries: snapshot.entries,
            by_digest: HashMap::new(),
            modified: HashMap::new(),
        };
        for (token, entry) in &inner.entries {
            inner
                .by_digest
                .entry(entry.image.digest())
                .or_default()
                .push(token.clone());
        }
        Self {
            inner: Mutex::new(inner),
            started: SystemTime::now(),
        }
    }

    pub fn snapshot(&self) -> ImageStoreSnapshot {
        ImageStoreSnapshot {
            entries: self.inner.lock().entries.clone(),
        }
    }

    /// Reject oversized uploads before they reach [`ImageStore::insert`].
    pub fn check_upload(len: usize) -> Result<(), StoreError> {
        if len > MAX_UPLOAD_BYTES {
            return Err(StoreError::TooLarge(len));
        }
        Ok(())
    }

    /// Store `image`, or return the token of the structurally equal entry
    /// that already exists. Never touches refcounts; those belong to
    /// bindings.
    pub fn insert(&self, image: Image) -> String {
        self.inner.lock().insert_entry(image)
    }

    pub fn get(&self, token: &str) -> Result<Image, StoreError> {
        self.inner
            .lock()
            .entries
            .get(token)
            .map(|e| e.image.clone())
            .ok_or(StoreError::NotFound)
    }

    /// Last-modified instant for conditional requests; process start when
    /// the token was never touched this run.
    pub fn modified(&self, token: &str) -> SystemTime {
        self.inner
            .lock()
            .modified
            .get(token)
            .copied()
            .unwrap_or(self.started)
    }

    /// Bind `name` on `map` to `image`, replacing any previous binding.
    ///
    /// Rebinding the structurally identical image is a no-op returning the
    /// existing token. Otherwise the old image loses one reference (and is
    /// deleted at zero) before the new binding takes one.
    pub fn bind(&self, map: &mut Map, name: &str, image: Image) -> String {
        let mut inner = self.inner.lock();
        if let Some(old) = map.sprites().get(name).cloned() {
            if inner.entries.get(&old).is_some_and(|e| e.image == image) {
                return old;
            }
            let token = inner.insert_entry(image);
            inner.decref(&old);
            inner.incref(&token);
            map.set_sprite_binding(name, &token);
            token
        } else {
            let token = inner.insert_entry(image);
            inner.incref(&token);
            map.set_sprite_binding(name, &token);
            token
        }
    }

    /// Drop the binding for `name`, releasing its reference.
    pub fn unbind(&self, map: &mut Map, name: &str) -> Result<(), StoreError> {
        let token = map.remove_sprite_binding(name).ok_or(StoreError::NotFound)?;
        self.inner.lock().decref(&token);
        Ok(())
    }

    /// Startup consistency repair.
    ///
    /// Crash timing can leave the store and the bindings referencing it
    /// out of step. This pass merges structurally equal entries (rewriting
    /// bindings to the survivor), drops bindings whose token no longer
    /// resolves, recomputes every refcount from the maps, and deletes
    /// entries nothing references.
    pub fn repair(&self, maps: &mut [&mut Map]) {
        let mut inner = self.inner.lock();

        // Merge duplicates digest-group by digest-group.
        let digests: Vec<String> = inner.by_digest.keys().cloned().collect();
        for digest in digests {
            let tokens = inner.by_digest.get(&digest).cloned().unwrap_or_default();
            let mut survivors: Vec<String> = Vec::new();
            for token in tokens {
                let image = match inner.entries.get(&token) {
                    Some(e) => e.image.clone(),
                    None => continue,
                };
                let twin = survivors
                    .iter()
                    .find(|s| inner.entries[*s].image == image)
                    .cloned();
                match twin {
                    None => survivors.push(token),
                    Some(survivor) => {
                        info!("merging duplicate image {} into {}", token, survivor);
                        for map in maps.iter_mut() {
                            let renames: Vec<String> = map
                                .sprites()
                                .iter()
                                .filter(|(_, t)| **t == token)
                                .map(|(n, _)| n.clone())
                                .collect();
                            for name in renames {
                                map.set_sprite_binding(&name, &survivor);
                            }
                        }
                        inner.remove_entry(&token);
                    }
                }
            }
        }

        // Drop bindings that no longer resolve.
        for map in maps.iter_mut() {
            let dangling: Vec<String> = map
                .sprites()
                .iter()
                .filter(|(_, t)| !inner.entries.contains_key(*t))
                .map(|(n, _)| n.clone())
                .collect();
            for name in dangling {
                warn!("dropping sprite binding '{}' with no stored image", name);
                map.remove_sprite_binding(&name);
            }
        }

        // Recompute refcounts from what the maps actually reference.
        let mut counts: HashMap<String, i64> = HashMap::new();
        for map in maps.iter() {
            for token in map.sprites().values() {
                *counts.entry(token.clone()).or_default() += 1;
            }
        }
        let tokens: Vec<String> = inner.entries.keys().cloned().collect();
        for token in tokens {
            let refs = counts.get(&token).copied().unwrap_or(0);
            if refs <= 0 {
                info!("deleting unreferenced image {}", token);
                inner.remove_entry(&token);
            } else if let Some(entry) = inner.entries.get_mut(&token) {
                entry.refs = refs;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Reference count of one entry, mainly for tests and stats.
    pub fn refs(&self, token: &str) -> Option<i64> {
        self.inner.lock().entries.get(token).map(|e| e.refs)
    }

    pub fn stats(&self) -> ImageStoreStats {
        let inner = self.inner.lock();
        ImageStoreStats {
            entries: inner.entries.len(),
            inline_bytes: inner
                .entries
                .values()
                .map(|e| match &e.image {
                    Image::Inline { bytes, .. } => bytes.len(),
                    Image::Redirect { .. } => 0,
                })
                .sum(),
        }
    }
}

impl Default for ImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreInner {
    /// Dedup-or-store; returns the entry's token either way.
    fn insert_entry(&mut self, image: Image) -> String {
        let digest = image.digest();
        if let Some(tokens) = self.by_digest.get(&digest) {
            for token in tokens {
                if self.entries.get(token).is_some_and(|e| e.image == image) {
                    return token.clone();
                }
            }
        }
        let token = loop {
            let candidate = mint_token();
            if !self.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        self.entries
            .insert(token.clone(), ImageEntry { image, refs: 0 });
        self.by_digest.entry(digest).or_default().push(token.clone());
        self.modified.insert(token.clone(), SystemTime::now());
        token
    }

    fn incref(&mut self, token: &str) {
        if let Some(entry) = self.entries.get_mut(token) {
            entry.refs += 1;
        }
    }

    fn decref(&mut self, token: &str) {
        let gone = match self.entries.get_mut(token) {
            Some(entry) => {
                entry.refs -= 1;
                entry.refs <= 0
            }
            None => false,
        };
        if gone {
            self.remove_entry(token);
        }
    }

    fn remove_entry(&mut self, token: &str) {
        if let Some(entry) = self.entries.remove(token) {
            let digest = entry.image.digest();
            if let Some(tokens) = self.by_digest.get_mut(&digest) {
                tokens.retain(|t| t != token);
                if tokens.is_empty() {
                    self.by_digest.remove(&digest);
                }
            }
        }
        self.modified.remove(token);
    }
}

/// Opaque random token, alphanumeric.
fn mint_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}
