//! Map registry: opaque join-tokens → live maps.
//!
//! The registry is the root of addressability. Each map sits behind its
//! own mutex so command validation and mutation serialize per map while
//! different maps proceed in parallel; the registry table itself only
//! needs a read/write lock for lookup and creation.

use log::info;
use parking_lot::{Mutex, RwLock};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::map::Map;

const TOKEN_LEN: usize = 16;

pub type SharedMap = Arc<Mutex<Map>>;

/// Persisted form: every map keyed by its join-token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    maps: BTreeMap<String, Map>,
}

pub struct MapRegistry {
    maps: RwLock<HashMap<String, SharedMap>>,
    default_size: (i32, i32),
}

impl MapRegistry {
    pub fn new(default_size: (i32, i32)) -> Self {
        Self {
            maps: RwLock::new(HashMap::new()),
            default_size,
        }
    }

    pub fn restore(snapshot: RegistrySnapshot, default_size: (i32, i32)) -> Self {
        let maps = snapshot
            .maps
            .into_iter()
            .map(|(token, map)| (token, Arc::new(Mutex::new(map))))
            .collect();
        Self {
            maps: RwLock::new(maps),
            default_size,
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let maps = self.maps.read();
        RegistrySnapshot {
            maps: maps
                .iter()
                .map(|(token, map)| (token.clone(), map.lock().clone()))
                .collect(),
        }
    }

    /// Resolve an existing join-token.
    pub fn get(&self, token: &str) -> Option<SharedMap> {
        self.maps.read().get(token).cloned()
    }

    /// Resolve, creating a default-sized map on first visit.
    pub fn get_or_create(&self, token: &str) -> SharedMap {
        if let Some(map) = self.get(token) {
            return map;
        }
        let mut maps = self.maps.write();
        maps.entry(token.to_string())
            .or_insert_with(|| {
                info!("creating map '{}'", token);
                Arc::new(Mutex::new(Map::new(self.default_size.0, self.default_size.1)))
            })
            .clone()
    }

    /// Mint a fresh join-token for a new default-sized map.
    pub fn create(&self) -> (String, SharedMap) {
        let map = Arc::new(Mutex::new(Map::new(self.default_size.0, self.default_size.1)));
        let token = self.register(map.clone());
        (token, map)
    }

    /// Deep-copy an existing map under a fresh join-token.
    pub fn clone_map(&self, source: &str) -> Option<(String, SharedMap)> {
        let copied = self.get(source)?.lock().clone();
        let map = Arc::new(Mutex::new(copied));
        let token = self.register(map.clone());
        info!("cloned map '{}' as '{}'", source, token);
        Some((token, map))
    }

    fn register(&self, map: SharedMap) -> String {
        let mut maps = self.maps.write();
        let token = loop {
            let candidate = mint_token();
            if !maps.contains_key(&candidate) {
                break candidate;
            }
        };
        maps.insert(token.clone(), map);
        token
    }

    pub fn tokens(&self) -> Vec<String> {
        self.maps.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.maps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.read().is_empty()
    }

    /// Run `f` over every map with its lock held, one at a time.
    ///
    /// Used by the startup repair pass; never call while holding another
    /// map's lock.
    pub fn with_all_maps<R>(&self, f: impl FnOnce(&mut [&mut Map]) -> R) -> R {
        let arcs: Vec<SharedMap> = self.maps.read().values().cloned().collect();
        let mut guards: Vec<_> = arcs.iter().map(|m| m.lock()).collect();
        let mut refs: Vec<&mut Map> = guards.iter_mut().map(|g| &mut **g).collect();
        f(&mut refs)
    }
}

fn mint_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}
