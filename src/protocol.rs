//! Client/server wire protocol.
//!
//! This module owns **every message that crosses the socket boundary**
//! between the hub and any participant (browser client, bot, another
//! server…).
//!
//! ## Message flow
//!
//! | Direction       | Carrier                         | Type             |
//! |-----------------|---------------------------------|------------------|
//! | client → server | websocket text frame            | [`ClientCommand`]|
//! | server → group  | broadcast to every member       | [`ServerEvent`]  |
//! | server → caller | private frame (fail / resync)   | [`ServerEvent`]  |
//!
//! ## Design rules
//!
//! 1. Every struct must be `Serialize + Deserialize` with snake_case JSON.
//! 2. No aggregate internals leak out: only the records in `types`/`geom`
//!    and the [`MapFields`] subset payload cross the wire.
//! 3. A successful command is acknowledged solely by its own broadcast:
//!    every group member, the sender included, applies the same event.
//! 4. Failures are private: `fail` carries (command name, reason) and goes
//!    to the issuing connection only.
//! 5. Resync replies are private and never broadcast.

use serde::{Deserialize, Serialize};

use crate::geom::{Shape, Vec2};
use crate::map::MapFields;
use crate::types::{FieldMask, MapSettings, Token, TokenDelta};

// ---------------------------------------------------------------------------
// Client commands
// ---------------------------------------------------------------------------

/// Everything a participant may ask the hub to do.
///
/// `join` must be the first frame on a fresh connection; every other
/// command is rejected until the session is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Bind this connection to a map. `dm` marks the authority session.
    Join {
        map: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        dm: bool,
    },
    AddToken {
        token: Token,
    },
    RemoveTokens {
        shape: Shape,
    },
    ModifyTokens {
        shape: Shape,
        delta: TokenDelta,
    },
    AddEffect {
        shape: Shape,
        color: String,
    },
    RemoveEffect {
        shape: Shape,
    },
    Color {
        at: Vec2,
        color: String,
    },
    SetSize {
        left: i32,
        right: i32,
        up: i32,
        down: i32,
    },
    /// All four coordinates −1 removes the zone instead of setting it.
    SetSpawnZone {
        shape: Shape,
    },
    SetSettings {
        settings: MapSettings,
    },
    /// Private request: reply with the selected subsets, no broadcast.
    Resync {
        fields: FieldMask,
    },
    Blink {
        at: Vec2,
    },
    BlinkToken {
        at: Vec2,
    },
    BlinkShape {
        shape: Shape,
    },
}

impl ClientCommand {
    /// Wire name, echoed back in `fail` notifications.
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Join { .. } => names::JOIN,
            ClientCommand::AddToken { .. } => names::ADD_TOKEN,
            ClientCommand::RemoveTokens { .. } => names::REMOVE_TOKENS,
            ClientCommand::ModifyTokens { .. } => names::MODIFY_TOKENS,
            ClientCommand::AddEffect { .. } => names::ADD_EFFECT,
            ClientCommand::RemoveEffect { .. } => names::REMOVE_EFFECT,
            ClientCommand::Color { .. } => names::COLOR,
            ClientCommand::SetSize { .. } => names::SET_SIZE,
            ClientCommand::SetSpawnZone { .. } => names::SET_SPAWN_ZONE,
            ClientCommand::SetSettings { .. } => names::SET_SETTINGS,
            ClientCommand::Resync { .. } => names::RESYNC,
            ClientCommand::Blink { .. } => names::BLINK,
            ClientCommand::BlinkToken { .. } => names::BLINK_TOKEN,
            ClientCommand::BlinkShape { .. } => names::BLINK_SHAPE,
        }
    }
}

/// All command names, as constants.
pub mod names {
    pub const JOIN: &str = "join";
    pub const ADD_TOKEN: &str = "add_token";
    pub const REMOVE_TOKENS: &str = "remove_tokens";
    pub const MODIFY_TOKENS: &str = "modify_tokens";
    pub const ADD_EFFECT: &str = "add_effect";
    pub const REMOVE_EFFECT: &str = "remove_effect";
    pub const COLOR: &str = "color";
    pub const SET_SIZE: &str = "set_size";
    pub const SET_SPAWN_ZONE: &str = "set_spawn_zone";
    pub const SET_SETTINGS: &str = "set_settings";
    pub const RESYNC: &str = "resync";
    pub const BLINK: &str = "blink";
    pub const BLINK_TOKEN: &str = "blink_token";
    pub const BLINK_SHAPE: &str = "blink_shape";

    /// Pseudo-command reported when a frame cannot be decoded at all.
    pub const DECODE: &str = "decode";
}

// ---------------------------------------------------------------------------
// Server events
// ---------------------------------------------------------------------------

/// Everything the hub sends. Mutation events are broadcast to the whole
/// group (sender included); `joined`, `fail`, and `resync_data` go to one
/// connection only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Private acknowledgement of a successful join.
    Joined {
        map: String,
        name: String,
        dm: bool,
    },
    TokenAdded {
        token: Token,
    },
    TokensRemoved {
        shape: Shape,
    },
    TokensModified {
        shape: Shape,
        delta: TokenDelta,
    },
    EffectAdded {
        shape: Shape,
        color: String,
    },
    EffectRemoved {
        shape: Shape,
    },
    ColorSet {
        at: Vec2,
        color: String,
    },
    Resized {
        left: i32,
        right: i32,
        up: i32,
        down: i32,
    },
    SpawnZoneSet {
        shape: Option<Shape>,
    },
    SettingsSet {
        settings: MapSettings,
    },
    SpriteBound {
        name: String,
        image: String,
    },
    SpriteRemoved {
        name: String,
    },
    /// Ephemeral highlights; mirrors apply no state change for these.
    Blink {
        at: Vec2,
    },
    BlinkToken {
        at: Vec2,
    },
    BlinkShape {
        shape: Shape,
    },
    /// Private rejection: the echoed command name plus a readable reason.
    Fail {
        command: String,
        reason: String,
    },
    /// Private resync reply carrying exactly the requested subsets.
    ResyncData {
        fields: FieldMask,
        data: MapFields,
    },
}

/// Sentinel: a spawn-zone shape with all four coordinates −1 means
/// "remove the zone".
pub fn is_spawn_clear_sentinel(shape: &Shape) -> bool {
    let (s, e) = (shape.start(), shape.end());
    s == Vec2::new(-1, -1) && e == Vec2::new(-1, -1)
}
