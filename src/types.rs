//! Core map records shared across all modules: tokens, deltas, effects,
//! settings, and the resync field mask.

use serde::{Deserialize, Serialize};

use crate::geom::{Rect, Shape, Vec2};

/// Default tile color for freshly created (and newly grown) grid cells.
pub const TILE_WHITE: &str = "#ffffff";

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// A named playing piece occupying a rectangle of whole cells.
///
/// Invariants (enforced by the map aggregate, never locally): the hitbox is
/// fully inside the owning map and never overlaps another token's hitbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub name: String,
    pub pos: Vec2,
    pub size: Vec2,
    #[serde(default)]
    pub hidden: bool,
    /// Condition bitmask; bit meanings are client-defined.
    #[serde(default)]
    pub conditions: u32,
}

impl Token {
    /// A visible 1×1 token.
    pub fn new(name: impl Into<String>, pos: Vec2) -> Self {
        Self {
            name: name.into(),
            pos,
            size: Vec2::new(1, 1),
            hidden: false,
            conditions: 0,
        }
    }

    pub fn hitbox(&self) -> Rect {
        Rect::new(self.pos.x, self.pos.y, self.size.x, self.size.y)
    }

    /// Unconditional mutation; validity is the caller's contract.
    pub fn apply(&mut self, delta: &TokenDelta) {
        if let Some(d) = delta.shift {
            self.pos = self.pos.shifted(d);
        }
        if delta.turn {
            std::mem::swap(&mut self.size.x, &mut self.size.y);
        }
        self.conditions = (self.conditions | delta.cond_add) & !delta.cond_sub;
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' at {}", self.name, self.hitbox())
    }
}

// ---------------------------------------------------------------------------
// Token delta
// ---------------------------------------------------------------------------

/// A bulk transform applied to every token selected by a shape: an optional
/// translation, an optional 90° size swap, and condition add/sub masks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenDelta {
    #[serde(default)]
    pub shift: Option<Vec2>,
    #[serde(default)]
    pub turn: bool,
    #[serde(default)]
    pub cond_add: u32,
    #[serde(default)]
    pub cond_sub: u32,
}

impl TokenDelta {
    pub fn shifted(d: Vec2) -> Self {
        Self {
            shift: Some(d),
            ..Self::default()
        }
    }

    pub fn turned() -> Self {
        Self {
            turn: true,
            ..Self::default()
        }
    }

    /// True iff applying the delta would change nothing.
    pub fn is_empty(&self) -> bool {
        self.shift.map_or(true, |d| d == Vec2::zero())
            && !self.turn
            && self.cond_add == 0
            && self.cond_sub == 0
    }

    /// The hitbox a token would occupy after this delta.
    pub fn applied_to(&self, hitbox: Rect) -> Rect {
        let mut r = hitbox;
        if let Some(d) = self.shift {
            r = r.translated(d);
        }
        if self.turn {
            r = r.turned();
        }
        r
    }
}

// ---------------------------------------------------------------------------
// Effect
// ---------------------------------------------------------------------------

/// A persisted highlight shape. Equality is the shape identity (kind,
/// start, end) only; recoloring an effect replaces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Effect {
    pub shape: Shape,
    pub color: String,
}

impl Effect {
    pub fn new(shape: Shape, color: impl Into<String>) -> Self {
        Self {
            shape,
            color: color.into(),
        }
    }
}

impl PartialEq for Effect {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Per-map measurement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSettings {
    /// Multiplier applied when approximating diagonal distances.
    pub distance_ratio: f32,
    /// Unit label shown next to measured distances.
    pub unit: String,
}

impl Default for MapSettings {
    fn default() -> Self {
        Self {
            distance_ratio: 1.0,
            unit: "ft".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Field mask
// ---------------------------------------------------------------------------

/// One bit per logical map subset, used by targeted resync.
///
/// SIZE and TOKENS are independent bits: requesting one never implies the
/// other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMask(pub u8);

impl FieldMask {
    pub const NONE: FieldMask = FieldMask(0);
    pub const SIZE: FieldMask = FieldMask(1 << 0);
    pub const TOKENS: FieldMask = FieldMask(1 << 1);
    pub const SETTINGS: FieldMask = FieldMask(1 << 2);
    pub const COLORS: FieldMask = FieldMask(1 << 3);
    pub const EFFECTS: FieldMask = FieldMask(1 << 4);
    pub const SPAWN: FieldMask = FieldMask(1 << 5);
    pub const SPRITES: FieldMask = FieldMask(1 << 6);
    pub const ALL: FieldMask = FieldMask(0x7f);

    pub fn contains(self, other: FieldMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: FieldMask) -> FieldMask {
        FieldMask(self.0 | other.0)
    }

    pub fn intersect(self, other: FieldMask) -> FieldMask {
        FieldMask(self.0 & other.0)
    }

    pub fn remove(self, other: FieldMask) -> FieldMask {
        FieldMask(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 & Self::ALL.0 == 0
    }
}

impl std::ops::BitOr for FieldMask {
    type Output = FieldMask;

    fn bitor(self, rhs: FieldMask) -> FieldMask {
        self.union(rhs)
    }
}

impl std::fmt::Display for FieldMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(FieldMask, &str); 7] = [
            (FieldMask::SIZE, "size"),
            (FieldMask::TOKENS, "tokens"),
            (FieldMask::SETTINGS, "settings"),
            (FieldMask::COLORS, "colors"),
            (FieldMask::EFFECTS, "effects"),
            (FieldMask::SPAWN, "spawn"),
            (FieldMask::SPRITES, "sprites"),
        ];
        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}
