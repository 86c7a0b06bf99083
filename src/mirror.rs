//! `ClientMirror`: local best-effort replica of one map.
//!
//! The mirror embeds a real [`Map`] and re-runs the authoritative
//! validators on every inbound broadcast, so prediction and server-side
//! validation can never drift apart. An event the local state rejects is
//! *not* applied; instead its field subset is flagged desynced and the
//! next [`ClientMirror::resync_request`] asks the hub for exactly those
//! subsets.

use log::debug;

use crate::map::{Map, MapError, MapFields};
use crate::protocol::{ClientCommand, ServerEvent};
use crate::types::FieldMask;

#[derive(Debug, Clone)]
pub struct ClientMirror {
    map: Map,
    desynced: FieldMask,
    /// Events applied since construction (observability only).
    applied: u64,
}

impl ClientMirror {
    pub fn new(width: i32, height: i32) -> Self {
        Self::from_map(Map::new(width, height))
    }

    /// Wrap state obtained from a full resync.
    pub fn from_map(map: Map) -> Self {
        Self {
            map,
            desynced: FieldMask::NONE,
            applied: 0,
        }
    }

    pub fn map(&self) -> &Map {
        &self.map
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn desynced(&self) -> FieldMask {
        self.desynced
    }

    pub fn is_desynced(&self) -> bool {
        !self.desynced.is_empty()
    }

    /// Apply one inbound event, or flag the divergence it revealed.
    pub fn handle(&mut self, event: &ServerEvent) {
        let result: Result<(), (FieldMask, MapError)> = match event {
            ServerEvent::TokenAdded { token } => self
                .map
                .add_token(token.clone())
                .map_err(|e| (FieldMask::TOKENS, e)),
            ServerEvent::TokensRemoved { shape } => self
                .map
                .remove_tokens(shape)
                .map(|_| ())
                .map_err(|e| (FieldMask::TOKENS, e)),
            ServerEvent::TokensModified { shape, delta } => self
                .map
                .modify_tokens(shape, delta)
                .map_err(|e| (FieldMask::TOKENS, e)),
            ServerEvent::EffectAdded { shape, color } => self
                .map
                .add_effect(shape.clone(), color)
                .map_err(|e| (FieldMask::EFFECTS, e)),
            ServerEvent::EffectRemoved { shape } => self
                .map
                .remove_effect(shape)
                .map_err(|e| (FieldMask::EFFECTS, e)),
            ServerEvent::ColorSet { at, color } => self
                .map
                .set_color(*at, color)
                .map_err(|e| (FieldMask::COLORS, e)),
            ServerEvent::Resized {
                left,
                right,
                up,
                down,
            } => self
                .map
                .resize(*left, *right, *up, *down)
                .map(|_| ())
                .map_err(|e| {
                    (
                        FieldMask::SIZE | FieldMask::TOKENS | FieldMask::COLORS | FieldMask::SPAWN,
                        e,
                    )
                }),
            ServerEvent::SpawnZoneSet { shape } => self
                .map
                .set_spawn(shape.clone())
                .map_err(|e| (FieldMask::SPAWN, e)),
            ServerEvent::SettingsSet { settings } => {
                self.map.set_settings(settings.clone());
                Ok(())
            }
            ServerEvent::SpriteBound { name, image } => {
                self.map.set_sprite_binding(name, image);
                Ok(())
            }
            ServerEvent::SpriteRemoved { name } => match self.map.remove_sprite_binding(name) {
                Some(_) => Ok(()),
                None => Err((FieldMask::SPRITES, MapError::UnknownSprite)),
            },
            ServerEvent::ResyncData { fields, data } => {
                self.apply_resync(*fields, data);
                Ok(())
            }
            // Ephemeral / informational: nothing to mirror.
            ServerEvent::Joined { .. }
            | ServerEvent::Blink { .. }
            | ServerEvent::BlinkToken { .. }
            | ServerEvent::BlinkShape { .. }
            | ServerEvent::Fail { .. } => Ok(()),
        };

        match result {
            Ok(()) => self.applied += 1,
            Err((fields, e)) => {
                debug!("mirror desync on [{}]: {}", fields, e);
                self.desynced = self.desynced.union(fields);
            }
        }
    }

    /// The targeted repair request, covering exactly the flagged subsets.
    pub fn resync_request(&self) -> Option<ClientCommand> {
        if self.desynced.is_empty() {
            return None;
        }
        Some(ClientCommand::Resync {
            fields: self.desynced,
        })
    }

    /// Overwrite the delivered subsets and clear their desync bits.
    pub fn apply_resync(&mut self, fields: FieldMask, data: &MapFields) {
        self.map.apply_fields(data);
        self.desynced = self.desynced.remove(fields);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Vec2;
    use crate::types::{Token, TokenDelta};

    fn token(name: &str, x: i32, y: i32) -> Token {
        Token::new(name, Vec2::new(x, y))
    }

    // ---------------------------------------------------------------
    // Normal application
    // ---------------------------------------------------------------

    #[test]
    fn applies_token_broadcasts() {
        let mut m = ClientMirror::new(5, 5);
        m.handle(&ServerEvent::TokenAdded {
            token: token("orc", 2, 2),
        });
        assert_eq!(m.map().tokens().len(), 1);
        assert_eq!(m.applied(), 1);
        assert!(!m.is_desynced());
    }

    #[test]
    fn ephemeral_events_change_nothing() {
        let mut m = ClientMirror::new(5, 5);
        m.handle(&ServerEvent::Blink {
            at: Vec2::new(1, 1),
        });
        m.handle(&ServerEvent::Fail {
            command: "color".into(),
            reason: "out of bounds".into(),
        });
        assert_eq!(m.map().tokens().len(), 0);
        assert!(!m.is_desynced());
    }

    // ---------------------------------------------------------------
    // Desync detection
    // ---------------------------------------------------------------

    #[test]
    fn rejected_event_flags_field_subset() {
        let mut m = ClientMirror::new(5, 5);
        m.handle(&ServerEvent::TokenAdded {
            token: token("a", 2, 2),
        });
        // A colliding add means our state diverged from the authority.
        m.handle(&ServerEvent::TokenAdded {
            token: token("b", 2, 2),
        });
        assert!(m.is_desynced());
        assert!(m.desynced().contains(FieldMask::TOKENS));
        assert!(!m.desynced().contains(FieldMask::COLORS));
        // The bad event must not have been applied.
        assert_eq!(m.map().tokens().len(), 1);
    }

    #[test]
    fn resync_request_covers_flagged_bits() {
        let mut m = ClientMirror::new(5, 5);
        assert!(m.resync_request().is_none());

        m.handle(&ServerEvent::TokensModified {
            shape: crate::geom::Shape::new(
                crate::geom::ShapeKind::Mask,
                Vec2::new(0, 0),
                Vec2::new(4, 4),
            ),
            delta: TokenDelta::shifted(Vec2::new(1, 0)),
        });
        // Nothing selected locally → tokens are out of step.
        let req = m.resync_request().expect("desync should request repair");
        match req {
            ClientCommand::Resync { fields } => assert!(fields.contains(FieldMask::TOKENS)),
            other => panic!("unexpected request {:?}", other),
        }
    }

    // ---------------------------------------------------------------
    // Repair
    // ---------------------------------------------------------------

    #[test]
    fn resync_data_clears_desync() {
        let mut m = ClientMirror::new(5, 5);
        m.handle(&ServerEvent::TokenAdded {
            token: token("a", 2, 2),
        });
        m.handle(&ServerEvent::TokenAdded {
            token: token("b", 2, 2),
        });
        assert!(m.is_desynced());

        let data = MapFields {
            tokens: Some(vec![token("a", 2, 2), token("b", 3, 2)]),
            ..MapFields::default()
        };
        m.handle(&ServerEvent::ResyncData {
            fields: FieldMask::TOKENS,
            data,
        });
        assert!(!m.is_desynced());
        assert_eq!(m.map().tokens().len(), 2);
    }
}
