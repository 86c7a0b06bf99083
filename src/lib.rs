//! Battlemat Engine
//!
//! A shared, authoritative grid-state engine for real-time multi-player
//! map sessions: one map (tile colors, tokens, effects, a spawn region)
//! is mutated by commands from every connected participant and kept
//! consistent by a validate-then-broadcast protocol.
//!
//! ## Architecture
//!
//! ```text
//! ServerHub  (hub.rs)                ← sessions, dispatch, broadcast
//!   ├── MapRegistry  (registry.rs)   ← join-token → Map
//!   │     └── Map  (map.rs)          ← grid, tokens, effects, validators
//!   │           └── Shape  (geom.rs) ← containment / bounds / points
//!   ├── ImageStore  (imagestore.rs)  ← content-addressed sprite images
//!   └── Persister  (persist.rs)      ← snapshot loop, backup rotation
//! ClientMirror  (mirror.rs)          ← predictive replica per participant
//! ```
//!
//! Every command follows one path: decode → validate against the map →
//! mutate → broadcast to the whole group (sender included), or reject
//! privately with a reason. The mirror re-runs the same validators on
//! every broadcast and requests a targeted resync when they disagree.

// Protocol, geometry, and the map aggregate are always available (no
// server feature needed) so clients can embed the mirror.
pub mod geom;
pub mod map;
pub mod mirror;
pub mod protocol;
pub mod types;

// Server-side modules require the `server` feature.
#[cfg(feature = "server")]
pub mod hub;
#[cfg(feature = "server")]
pub mod imagestore;
#[cfg(feature = "server")]
pub mod persist;
#[cfg(feature = "server")]
pub mod registry;

// Convenience re-exports (server only)
#[cfg(feature = "server")]
pub use hub::{HubStats, ServerHub};
#[cfg(feature = "server")]
pub use imagestore::{Image, ImageStore, MAX_UPLOAD_BYTES};
#[cfg(feature = "server")]
pub use persist::{DirtyFlag, Persister};
#[cfg(feature = "server")]
pub use registry::MapRegistry;

pub use geom::{Rect, Shape, ShapeKind, Vec2};
pub use map::{Map, MapError, MapFields};
pub use mirror::ClientMirror;
pub use types::{Effect, FieldMask, MapSettings, Token, TokenDelta};
