//! The map aggregate: tile grid, tokens, effects, settings, spawn region,
//! and sprite bindings, with every command validator the protocol relies on.
//!
//! This module is pure data plus pure checks: no locks, no I/O. The hub
//! wraps a `Map` in a per-map mutex; the client mirror embeds one directly,
//! so the authoritative and the predictive validation are the same code.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::geom::{Rect, Shape, Vec2};
use crate::types::{Effect, FieldMask, MapSettings, Token, TokenDelta, TILE_WHITE};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Validation rejections. Rendered verbatim as the reason text of a Fail
/// notification, so the messages stay human-readable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("out of bounds")]
    OutOfBounds,
    #[error("colliding with another token")]
    Collision,
    #[error("no token selected")]
    NoSelection,
    #[error("token name is empty")]
    EmptyName,
    #[error("shape is empty")]
    EmptyShape,
    #[error("nothing to change")]
    NoOpDelta,
    #[error("cell already has that color")]
    RedundantColor,
    #[error("no such effect")]
    UnknownEffect,
    #[error("no token there")]
    NoSuchToken,
    #[error("no sprite bound to that name")]
    UnknownSprite,
    #[error("resulting grid would be empty")]
    InvalidSize,
    #[error("field mask selects nothing")]
    EmptyFieldMask,
}

// ---------------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------------

/// One shared battle map. Grid dimensions are fixed at construction;
/// [`Map::resize`] replaces the grid wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Map {
    width: i32,
    height: i32,
    /// Row-major tile colors, `width * height` entries.
    tiles: Vec<String>,
    tokens: Vec<Token>,
    effects: Vec<Effect>,
    settings: MapSettings,
    spawn: Option<Shape>,
    /// Token name → image-store token.
    sprites: BTreeMap<String, String>,
}

impl Map {
    /// An all-white map with default settings and no spawn region.
    pub fn new(width: i32, height: i32) -> Self {
        let (width, height) = (width.max(1), height.max(1));
        Self {
            width,
            height,
            tiles: vec![TILE_WHITE.to_string(); (width * height) as usize],
            tokens: Vec::new(),
            effects: Vec::new(),
            settings: MapSettings::default(),
            spawn: None,
            sprites: BTreeMap::new(),
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn settings(&self) -> &MapSettings {
        &self.settings
    }

    pub fn spawn_zone(&self) -> Option<&Shape> {
        self.spawn.as_ref()
    }

    pub fn sprites(&self) -> &BTreeMap<String, String> {
        &self.sprites
    }

    pub fn tile(&self, at: Vec2) -> Option<&str> {
        self.index(at).map(|i| self.tiles[i].as_str())
    }

    fn index(&self, at: Vec2) -> Option<usize> {
        if at.x < 0 || at.y < 0 || at.x >= self.width || at.y >= self.height {
            None
        } else {
            Some((at.y * self.width + at.x) as usize)
        }
    }

    /// True iff any part of `rect` lies outside the grid.
    pub fn outside(&self, rect: &Rect) -> bool {
        rect.x < 0
            || rect.y < 0
            || rect.x + rect.w > self.width
            || rect.y + rect.h > self.height
    }

    // -----------------------------------------------------------------------
    // Spatial queries
    // -----------------------------------------------------------------------

    /// All tokens whose hitbox overlaps `rect`. Linear scan; a table map
    /// holds tens of tokens, not millions.
    pub fn tokens_at(&self, rect: &Rect) -> Vec<&Token> {
        self.tokens
            .iter()
            .filter(|t| t.hitbox().intersects(rect))
            .collect()
    }

    /// First token whose hitbox covers `at`.
    pub fn token_at(&self, at: Vec2) -> Option<&Token> {
        self.tokens.iter().find(|t| t.hitbox().contains_cell(at))
    }

    /// Token anchored exactly at `at`.
    pub fn token_at_exact(&self, at: Vec2) -> Option<&Token> {
        self.tokens.iter().find(|t| t.pos == at)
    }

    /// `name` if free, otherwise the first free `name 2`, `name 3`, …
    pub fn unique_name(&self, base: &str) -> String {
        let taken = |n: &str| self.tokens.iter().any(|t| t.name == n);
        if !taken(base) {
            return base.to_string();
        }
        let mut i = 2u32;
        loop {
            let candidate = format!("{base} {i}");
            if !taken(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Token mutation
    // -----------------------------------------------------------------------

    /// Add one token: name must be non-blank, hitbox in bounds and free.
    pub fn add_token(&mut self, token: Token) -> Result<(), MapError> {
        if token.name.trim().is_empty() {
            return Err(MapError::EmptyName);
        }
        let hitbox = token.hitbox();
        if self.outside(&hitbox) {
            return Err(MapError::OutOfBounds);
        }
        if self.tokens.iter().any(|t| t.hitbox().intersects(&hitbox)) {
            return Err(MapError::Collision);
        }
        self.tokens.push(token);
        Ok(())
    }

    /// Delete every token selected by `shape`; reports how many went.
    pub fn remove_tokens(&mut self, shape: &Shape) -> Result<usize, MapError> {
        if shape.is_empty() {
            return Err(MapError::EmptyShape);
        }
        let before = self.tokens.len();
        self.tokens.retain(|t| !shape.contains_rect(&t.hitbox()));
        let removed = before - self.tokens.len();
        if removed == 0 {
            return Err(MapError::NoSelection);
        }
        Ok(removed)
    }

    /// Validate a bulk move/transform without mutating anything.
    ///
    /// Builds a coverage bitset over the grid; each token claims the cells
    /// of its *resulting* hitbox: post-delta when the shape selects it,
    /// its current one otherwise. The first out-of-grid cell or doubly
    /// claimed cell rejects the whole delta; zero selected tokens rejects
    /// it as well. Must never be skipped before [`Map::apply`].
    pub fn can_apply(&self, shape: &Shape, delta: &TokenDelta) -> Result<(), MapError> {
        let mut covered = vec![false; (self.width * self.height) as usize];
        let mut any_selected = false;

        for token in &self.tokens {
            let selected = shape.contains_rect(&token.hitbox());
            let hitbox = if selected {
                any_selected = true;
                delta.applied_to(token.hitbox())
            } else {
                token.hitbox()
            };
            for cell in hitbox.cells() {
                let Some(i) = self.index(cell) else {
                    return Err(MapError::OutOfBounds);
                };
                if covered[i] {
                    return Err(MapError::Collision);
                }
                covered[i] = true;
            }
        }

        if !any_selected {
            return Err(MapError::NoSelection);
        }
        Ok(())
    }

    /// Unconditionally mutate every selected token. Only valid directly
    /// after [`Map::can_apply`] returned Ok (validate, then commit).
    pub fn apply(&mut self, shape: &Shape, delta: &TokenDelta) {
        for token in &mut self.tokens {
            if shape.contains_rect(&token.hitbox()) {
                token.apply(delta);
            }
        }
    }

    /// The validate-then-commit pair behind the modify-tokens command.
    pub fn modify_tokens(&mut self, shape: &Shape, delta: &TokenDelta) -> Result<(), MapError> {
        if delta.is_empty() {
            return Err(MapError::NoOpDelta);
        }
        if shape.is_empty() {
            return Err(MapError::EmptyShape);
        }
        self.can_apply(shape, delta)?;
        self.apply(shape, delta);
        Ok(())
    }

    /// Place a fresh 1×1 token at the first free cell of the spawn region.
    ///
    /// Scans the region's bounding rectangle x-outer/y-inner, skipping
    /// cells outside the grid or covered by any existing token. Returns
    /// the placed token, or None when the region is undefined or full.
    pub fn spawn(&mut self, name: &str) -> Option<Token> {
        let zone = self.spawn.clone()?;
        let b = zone.bounds();
        for x in b.min().x..=b.max().x {
            for y in b.min().y..=b.max().y {
                let cell = Vec2::new(x, y);
                if self.outside(&Rect::cell(cell)) {
                    continue;
                }
                if self.tokens.iter().any(|t| t.hitbox().contains_cell(cell)) {
                    continue;
                }
                let token = Token::new(name, cell);
                self.tokens.push(token.clone());
                debug!("spawned '{}' at {}", name, cell);
                return Some(token);
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Grid mutation
    // -----------------------------------------------------------------------

    /// Recolor one tile. Rejects out-of-grid cells and repaints with the
    /// current color, so redundant broadcasts never happen.
    pub fn set_color(&mut self, at: Vec2, color: &str) -> Result<(), MapError> {
        let i = self.index(at).ok_or(MapError::OutOfBounds)?;
        if self.tiles[i] == color {
            return Err(MapError::RedundantColor);
        }
        self.tiles[i] = color.to_string();
        Ok(())
    }

    /// Grow or shrink the grid by the four edge deltas (negatives shrink).
    ///
    /// Tile colors move with their cells; cells falling outside the new
    /// grid are dropped and new cells start white. Tokens shift by
    /// (left, up); any token whose shifted hitbox no longer fits is
    /// evicted and returned. The spawn region shifts the same way and is
    /// dropped once it lies entirely outside the new grid.
    pub fn resize(
        &mut self,
        left: i32,
        right: i32,
        up: i32,
        down: i32,
    ) -> Result<Vec<Token>, MapError> {
        let new_w = self.width + left + right;
        let new_h = self.height + up + down;
        if new_w < 1 || new_h < 1 {
            return Err(MapError::InvalidSize);
        }

        let mut tiles = vec![TILE_WHITE.to_string(); (new_w * new_h) as usize];
        for y in 0..self.height {
            for x in 0..self.width {
                let (nx, ny) = (x + left, y + up);
                if nx >= 0 && nx < new_w && ny >= 0 && ny < new_h {
                    tiles[(ny * new_w + nx) as usize] =
                        std::mem::take(&mut self.tiles[(y * self.width + x) as usize]);
                }
            }
        }

        let offset = Vec2::new(left, up);
        let fits = |hitbox: &Rect| {
            hitbox.x >= 0
                && hitbox.y >= 0
                && hitbox.x + hitbox.w <= new_w
                && hitbox.y + hitbox.h <= new_h
        };
        let mut evicted = Vec::new();
        let mut kept = Vec::new();
        for mut token in self.tokens.drain(..) {
            token.pos = token.pos.shifted(offset);
            if fits(&token.hitbox()) {
                kept.push(token);
            } else {
                evicted.push(token);
            }
        }

        self.spawn = self.spawn.take().and_then(|zone| {
            let moved = zone.translated(offset);
            let grid = Rect::new(0, 0, new_w, new_h);
            moved.bounds().intersects(&grid).then_some(moved)
        });

        self.width = new_w;
        self.height = new_h;
        self.tiles = tiles;
        self.tokens = kept;
        if !evicted.is_empty() {
            debug!("resize evicted {} token(s)", evicted.len());
        }
        Ok(evicted)
    }

    /// Replace (or clear) the spawn region. A region must at least touch
    /// the grid.
    pub fn set_spawn(&mut self, zone: Option<Shape>) -> Result<(), MapError> {
        if let Some(ref z) = zone {
            let grid = Rect::new(0, 0, self.width, self.height);
            if !z.bounds().intersects(&grid) {
                return Err(MapError::OutOfBounds);
            }
        }
        self.spawn = zone;
        Ok(())
    }

    pub fn set_settings(&mut self, settings: MapSettings) {
        self.settings = settings;
    }

    // -----------------------------------------------------------------------
    // Effects
    // -----------------------------------------------------------------------

    /// Add a highlight effect; an effect with the same shape identity is
    /// replaced (recolor).
    pub fn add_effect(&mut self, shape: Shape, color: &str) -> Result<(), MapError> {
        if shape.is_empty() {
            return Err(MapError::EmptyShape);
        }
        let effect = Effect::new(shape, color);
        if let Some(existing) = self.effects.iter_mut().find(|e| **e == effect) {
            *existing = effect;
        } else {
            self.effects.push(effect);
        }
        Ok(())
    }

    /// Remove the effect matching `shape` by structural equality.
    pub fn remove_effect(&mut self, shape: &Shape) -> Result<(), MapError> {
        let before = self.effects.len();
        self.effects.retain(|e| e.shape != *shape);
        if self.effects.len() == before {
            return Err(MapError::UnknownEffect);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ephemeral highlight validators
    // -----------------------------------------------------------------------

    pub fn check_blink(&self, at: Vec2) -> Result<(), MapError> {
        if self.index(at).is_none() {
            return Err(MapError::OutOfBounds);
        }
        Ok(())
    }

    pub fn check_blink_token(&self, at: Vec2) -> Result<(), MapError> {
        self.token_at(at).map(|_| ()).ok_or(MapError::NoSuchToken)
    }

    // -----------------------------------------------------------------------
    // Sprite bindings
    // -----------------------------------------------------------------------

    /// Raw binding table mutation; refcounting lives in the image store.
    pub fn set_sprite_binding(&mut self, name: &str, image: &str) -> Option<String> {
        self.sprites.insert(name.to_string(), image.to_string())
    }

    pub fn remove_sprite_binding(&mut self, name: &str) -> Option<String> {
        self.sprites.remove(name)
    }

    // -----------------------------------------------------------------------
    // Partial serialization (resync)
    // -----------------------------------------------------------------------

    /// Serialize just the requested subsets. Returns the resolved mask
    /// (unknown bits stripped) alongside the data.
    pub fn field_data(&self, mask: FieldMask) -> (FieldMask, MapFields) {
        let resolved = mask.intersect(FieldMask::ALL);
        let mut fields = MapFields::default();
        if resolved.contains(FieldMask::SIZE) {
            fields.size = Some((self.width, self.height));
        }
        if resolved.contains(FieldMask::TOKENS) {
            fields.tokens = Some(self.tokens.clone());
        }
        if resolved.contains(FieldMask::SETTINGS) {
            fields.settings = Some(self.settings.clone());
        }
        if resolved.contains(FieldMask::COLORS) {
            fields.colors = Some(self.tiles.clone());
        }
        if resolved.contains(FieldMask::EFFECTS) {
            fields.effects = Some(self.effects.clone());
        }
        if resolved.contains(FieldMask::SPAWN) {
            fields.spawn = Some(self.spawn.clone());
        }
        if resolved.contains(FieldMask::SPRITES) {
            fields.sprites = Some(self.sprites.clone());
        }
        (resolved, fields)
    }

    /// Overwrite exactly the subsets present in `fields` (resync apply).
    pub fn apply_fields(&mut self, fields: &MapFields) {
        if let Some((w, h)) = fields.size {
            if (w, h) != (self.width, self.height) {
                let old_w = self.width;
                let mut tiles = vec![TILE_WHITE.to_string(); (w.max(1) * h.max(1)) as usize];
                for y in 0..self.height.min(h) {
                    for x in 0..old_w.min(w) {
                        tiles[(y * w + x) as usize] =
                            std::mem::take(&mut self.tiles[(y * old_w + x) as usize]);
                    }
                }
                self.width = w.max(1);
                self.height = h.max(1);
                self.tiles = tiles;
                let grid = Rect::new(0, 0, self.width, self.height);
                self.tokens.retain(|t| {
                    let hb = t.hitbox();
                    !(hb.x < 0 || hb.y < 0 || hb.x + hb.w > grid.w || hb.y + hb.h > grid.h)
                });
            }
        }
        if let Some(ref tokens) = fields.tokens {
            self.tokens = tokens.clone();
        }
        if let Some(ref settings) = fields.settings {
            self.settings = settings.clone();
        }
        if let Some(ref colors) = fields.colors {
            if colors.len() == (self.width * self.height) as usize {
                self.tiles = colors.clone();
            } else {
                log::warn!(
                    "ignoring color payload of {} cells for a {}x{} grid",
                    colors.len(),
                    self.width,
                    self.height
                );
            }
        }
        if let Some(ref effects) = fields.effects {
            self.effects = effects.clone();
        }
        if let Some(ref spawn) = fields.spawn {
            self.spawn = spawn.clone();
        }
        if let Some(ref sprites) = fields.sprites {
            self.sprites = sprites.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Partial state payload
// ---------------------------------------------------------------------------

/// Subset-of-map payload carried by resync replies. Absent subsets are
/// omitted from the wire entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<(i32, i32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Vec<Token>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<MapSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effects: Option<Vec<Effect>>,
    /// `Some(None)` clears the spawn region; absent leaves it untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn: Option<Option<Shape>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sprites: Option<BTreeMap<String, String>>,
}
