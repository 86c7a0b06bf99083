//! Websocket hub – per-connection sessions, command dispatch, and group
//! broadcast.
//!
//! ## Dispatch contract (uniform across all commands)
//!
//! | Step      | On failure                         | On success              |
//! |-----------|------------------------------------|-------------------------|
//! | decode    | `fail(decode, reason)` to caller   | —                       |
//! | validate  | `fail(command, reason)` to caller  | —                       |
//! | mutate    | —                                  | map marked dirty        |
//! | broadcast | —                                  | every member, sender too|
//!
//! There is no separate acknowledgement path: the sender learns of success
//! only by receiving its own broadcast, so every participant applies the
//! same event in the same order. The one exception is `resync`, which replies
//! privately and never broadcasts.
//!
//! ## Locking
//!
//! Each map's mutex is held only for validate+mutate and released before
//! the broadcast fan-out. Broadcast sends are unbounded-channel pushes; a
//! slow or dead recipient never blocks anyone else.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, Rng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::imagestore::{Image, ImageStore, ImageStoreStats, StoreError};
use crate::map::MapError;
use crate::persist::DirtyFlag;
use crate::protocol::{is_spawn_clear_sentinel, names, ClientCommand, ServerEvent};
use crate::registry::{MapRegistry, SharedMap};

const CONN_ID_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Active,
    Closed,
}

struct Session {
    state: SessionState,
    /// Join-token of the bound map, once active.
    map: Option<String>,
    name: String,
    dm: bool,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HubStats {
    pub sessions: usize,
    pub maps: usize,
    pub images: ImageStoreStats,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub struct ServerHub {
    registry: Arc<MapRegistry>,
    images: Arc<ImageStore>,
    dirty: Arc<DirtyFlag>,
    sessions: Mutex<HashMap<String, Session>>,
    /// Broadcast groups, keyed by join-token.
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl ServerHub {
    pub fn new(registry: Arc<MapRegistry>, images: Arc<ImageStore>, dirty: Arc<DirtyFlag>) -> Self {
        Self {
            registry,
            images,
            dirty,
            sessions: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(self: Arc<Self>, bind: &str) -> Result<()> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed to bind {bind}"))?;
        info!("hub listening on {}", bind);
        loop {
            let (stream, addr) = listener.accept().await.context("accept failed")?;
            let hub = self.clone();
            tokio::spawn(async move {
                if let Err(e) = hub.handle_connection(stream).await {
                    debug!("connection from {} ended: {}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let ws = accept_async(stream)
            .await
            .context("websocket handshake failed")?;
        let (mut ws_write, mut ws_read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let conn = self.register_session(tx);
        debug!("session {} connected", conn);

        while let Some(frame) = ws_read.next().await {
            let msg = match frame {
                Ok(m) => m,
                Err(_) => break,
            };
            match msg {
                Message::Text(text) => {
                    if !self.handle_frame(&conn, &text) {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.disconnect(&conn);
        writer.abort();
        Ok(())
    }

    fn register_session(&self, tx: mpsc::UnboundedSender<Message>) -> String {
        let mut sessions = self.sessions.lock();
        let conn = loop {
            let candidate: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(CONN_ID_LEN)
                .map(char::from)
                .collect();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(
            conn.clone(),
            Session {
                state: SessionState::Connecting,
                map: None,
                name: String::new(),
                dm: false,
                tx,
            },
        );
        conn
    }

    /// Deregister; safe to call twice.
    fn disconnect(&self, conn: &str) {
        let removed = {
            let mut sessions = self.sessions.lock();
            if let Some(s) = sessions.get_mut(conn) {
                s.state = SessionState::Closed;
            }
            sessions.remove(conn)
        };
        if let Some(session) = removed {
            if let Some(map) = session.map {
                if let Some(group) = self.groups.lock().get_mut(&map) {
                    group.remove(conn);
                }
            }
            info!(
                "session {} ('{}', dm={}) disconnected",
                conn, session.name, session.dm
            );
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Returns false when the connection must be aborted (unresolvable
    /// map at join time, the only condition that ever drops a socket).
    fn handle_frame(&self, conn: &str, text: &str) -> bool {
        match serde_json::from_str::<ClientCommand>(text) {
            Ok(cmd) => self.dispatch(conn, cmd),
            Err(e) => {
                self.send_fail(conn, names::DECODE, e);
                true
            }
        }
    }

    fn dispatch(&self, conn: &str, cmd: ClientCommand) -> bool {
        let cmd_name = cmd.name();

        let cmd = match cmd {
            ClientCommand::Join { map, name, dm } => {
                return self.handle_join(conn, &map, name, dm)
            }
            other => other,
        };

        let Some(map_token) = self.active_map(conn) else {
            self.send_fail(conn, cmd_name, "join a map first");
            return true;
        };
        let Some(shared) = self.registry.get(&map_token) else {
            self.send_fail(conn, cmd_name, "map is gone");
            return true;
        };

        // Private request/reply path; everything else broadcasts.
        let cmd = match cmd {
            ClientCommand::Resync { fields } => {
                if fields.is_empty() {
                    self.send_fail(conn, cmd_name, MapError::EmptyFieldMask);
                } else {
                    let (resolved, data) = shared.lock().field_data(fields);
                    debug!("resync [{}] for session {}", resolved, conn);
                    self.send_event(
                        conn,
                        &ServerEvent::ResyncData {
                            fields: resolved,
                            data,
                        },
                    );
                }
                return true;
            }
            other => other,
        };

        // Hold the map lock only for validate+mutate, then release before
        // fanning out.
        let result: Result<(ServerEvent, bool), MapError> = {
            let mut map = shared.lock();
            match cmd {
                ClientCommand::AddToken { token } => map
                    .add_token(token.clone())
                    .map(|()| (ServerEvent::TokenAdded { token }, true)),
                ClientCommand::RemoveTokens { shape } => map.remove_tokens(&shape).map(|n| {
                    debug!("removed {} token(s) on '{}'", n, map_token);
                    (ServerEvent::TokensRemoved { shape }, true)
                }),
                ClientCommand::ModifyTokens { shape, delta } => map
                    .modify_tokens(&shape, &delta)
                    .map(|()| (ServerEvent::TokensModified { shape, delta }, true)),
                ClientCommand::AddEffect { shape, color } => map
                    .add_effect(shape.clone(), &color)
                    .map(|()| (ServerEvent::EffectAdded { shape, color }, true)),
                ClientCommand::RemoveEffect { shape } => map
                    .remove_effect(&shape)
                    .map(|()| (ServerEvent::EffectRemoved { shape }, true)),
                ClientCommand::Color { at, color } => map
                    .set_color(at, &color)
                    .map(|()| (ServerEvent::ColorSet { at, color }, true)),
                ClientCommand::SetSize {
                    left,
                    right,
                    up,
                    down,
                } => map.resize(left, right, up, down).map(|evicted| {
                    if !evicted.is_empty() {
                        debug!("resize of '{}' evicted {} token(s)", map_token, evicted.len());
                    }
                    (
                        ServerEvent::Resized {
                            left,
                            right,
                            up,
                            down,
                        },
                        true,
                    )
                }),
                ClientCommand::SetSpawnZone { shape } => {
                    if is_spawn_clear_sentinel(&shape) {
                        map.set_spawn(None)
                            .map(|()| (ServerEvent::SpawnZoneSet { shape: None }, true))
                    } else {
                        map.set_spawn(Some(shape.clone())).map(|()| {
                            (ServerEvent::SpawnZoneSet { shape: Some(shape) }, true)
                        })
                    }
                }
                ClientCommand::SetSettings { settings } => {
                    map.set_settings(settings.clone());
                    Ok((ServerEvent::SettingsSet { settings }, true))
                }
                // Ephemeral highlights: validated, never persisted.
                ClientCommand::Blink { at } => map
                    .check_blink(at)
                    .map(|()| (ServerEvent::Blink { at }, false)),
                ClientCommand::BlinkToken { at } => map
                    .check_blink_token(at)
                    .map(|()| (ServerEvent::BlinkToken { at }, false)),
                ClientCommand::BlinkShape { shape } => {
                    if shape.is_empty() {
                        Err(MapError::EmptyShape)
                    } else {
                        Ok((ServerEvent::BlinkShape { shape }, false))
                    }
                }
                ClientCommand::Join { .. } | ClientCommand::Resync { .. } => return true,
            }
        };

        match result {
            Ok((event, mutated)) => {
                if mutated {
                    self.dirty.mark();
                }
                self.broadcast(&map_token, &event);
            }
            Err(e) => self.send_fail(conn, cmd_name, e),
        }
        true
    }

    fn handle_join(&self, conn: &str, map_token: &str, name: Option<String>, dm: bool) -> bool {
        if self.active_map(conn).is_some() {
            self.send_fail(conn, names::JOIN, "already joined");
            return true;
        }
        let Some(shared) = self.registry.get(map_token) else {
            self.send_fail(conn, names::JOIN, "no such map");
            info!("session {} aborted: unknown map '{}'", conn, map_token);
            return false;
        };

        let display = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "Player".to_string());

        {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(conn) else {
                return false;
            };
            session.state = SessionState::Active;
            session.map = Some(map_token.to_string());
            session.name = display.clone();
            session.dm = dm;
        }
        self.groups
            .lock()
            .entry(map_token.to_string())
            .or_default()
            .insert(conn.to_string());

        self.send_event(
            conn,
            &ServerEvent::Joined {
                map: map_token.to_string(),
                name: display.clone(),
                dm,
            },
        );
        info!("'{}' joined map '{}' (dm={})", display, map_token, dm);

        // Auto-place players in the spawn zone; the DM places itself.
        if !dm {
            let spawned = {
                let mut map = shared.lock();
                let token_name = map.unique_name(&display);
                map.spawn(&token_name)
            };
            if let Some(token) = spawned {
                self.dirty.mark();
                self.broadcast(map_token, &ServerEvent::TokenAdded { token });
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    fn active_map(&self, conn: &str) -> Option<String> {
        let sessions = self.sessions.lock();
        let session = sessions.get(conn)?;
        match session.state {
            SessionState::Active => session.map.clone(),
            SessionState::Connecting | SessionState::Closed => None,
        }
    }

    fn send_event(&self, conn: &str, event: &ServerEvent) {
        let text = match serde_json::to_string(event) {
            Ok(t) => t,
            Err(e) => {
                warn!("failed to serialise event: {}", e);
                return;
            }
        };
        if let Some(session) = self.sessions.lock().get(conn) {
            let _ = session.tx.send(Message::Text(text));
        }
    }

    fn send_fail(&self, conn: &str, command: &str, reason: impl std::fmt::Display) {
        let reason = reason.to_string();
        debug!("rejecting {} for session {}: {}", command, conn, reason);
        self.send_event(
            conn,
            &ServerEvent::Fail {
                command: command.to_string(),
                reason,
            },
        );
    }

    /// Serialise once, then push to every group member. Sends are
    /// fire-and-forget; a closed channel just means that member is on the
    /// way out.
    fn broadcast(&self, map_token: &str, event: &ServerEvent) {
        let text = match serde_json::to_string(event) {
            Ok(t) => t,
            Err(e) => {
                warn!("failed to serialise broadcast: {}", e);
                return;
            }
        };
        let members: Vec<String> = self
            .groups
            .lock()
            .get(map_token)
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default();
        let sessions = self.sessions.lock();
        for id in members {
            if let Some(session) = sessions.get(&id) {
                let _ = session.tx.send(Message::Text(text.clone()));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Collaborator API (the out-of-process HTTP layer calls these)
    // -----------------------------------------------------------------------

    /// Page-visit semantics: resolve the join-token, creating the map on
    /// first visit.
    pub fn visit(&self, token: &str) -> SharedMap {
        self.registry.get_or_create(token)
    }

    /// Deep-copy an existing map under a fresh join-token.
    pub fn clone_map(&self, source: &str) -> Option<String> {
        let token = self.registry.clone_map(source).map(|(t, _)| t)?;
        self.dirty.mark();
        Some(token)
    }

    /// Bind a sprite image to a token name and tell the whole group.
    pub fn bind_sprite(&self, map_token: &str, name: &str, image: Image) -> Result<String> {
        if let Image::Inline { ref bytes, .. } = image {
            ImageStore::check_upload(bytes.len())?;
        }
        let shared = self
            .registry
            .get(map_token)
            .with_context(|| format!("no such map '{map_token}'"))?;
        let image_token = {
            let mut map = shared.lock();
            self.images.bind(&mut map, name, image)
        };
        self.dirty.mark();
        self.broadcast(
            map_token,
            &ServerEvent::SpriteBound {
                name: name.to_string(),
                image: image_token.clone(),
            },
        );
        Ok(image_token)
    }

    pub fn unbind_sprite(&self, map_token: &str, name: &str) -> Result<()> {
        let shared = self
            .registry
            .get(map_token)
            .with_context(|| format!("no such map '{map_token}'"))?;
        {
            let mut map = shared.lock();
            self.images.unbind(&mut map, name)?;
        }
        self.dirty.mark();
        self.broadcast(
            map_token,
            &ServerEvent::SpriteRemoved {
                name: name.to_string(),
            },
        );
        Ok(())
    }

    /// Raw image lookup for the image-serving collaborator.
    pub fn image(&self, token: &str) -> Result<Image, StoreError> {
        self.images.get(token)
    }

    /// Last-modified instant for conditional requests.
    pub fn image_modified(&self, token: &str) -> std::time::SystemTime {
        self.images.modified(token)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            sessions: self.sessions.lock().len(),
            maps: self.registry.len(),
            images: self.images.stats(),
        }
    }
}
