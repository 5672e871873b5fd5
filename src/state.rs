//! Server state management.
//!
//! Tracks live sessions and call rooms. All maps are concurrent (DashMap) for
//! lock-free access; durable records live in the [`Store`]. Every mutation is
//! a single synchronous map operation, so handlers never hold registry locks
//! across an await point.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{
    CallSummary, ServerMessage, DUPLICATE_SESSION_CLOSE_CODE, DUPLICATE_SESSION_CLOSE_REASON,
};
use crate::store::Store;

/// Default number of messages in the connect-time history replay.
const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Default staleness threshold for open session rows (1 hour).
const DEFAULT_SESSION_STALE_SECS: i64 = 3600;

/// Default call room TTL in seconds (4 hours).
const DEFAULT_ROOM_TTL_SECS: i64 = 4 * 3600;

/// Default interval between maintenance sweeps (10 minutes).
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 600;

/// Current time as epoch milliseconds, the protocol's timestamp unit.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// SQLite database path.
    pub db_path: String,
    /// How many messages the connect-time history replay returns.
    pub history_limit: usize,
    /// Open session rows older than this with no live connection are swept.
    pub session_stale_secs: i64,
    /// Call rooms older than this are force-ended by the sweep.
    pub room_ttl_secs: i64,
    pub cleanup_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: "confab.db".to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            session_stale_secs: DEFAULT_SESSION_STALE_SECS,
            room_ttl_secs: DEFAULT_ROOM_TTL_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
        }
    }
}

/// Frames queued to one connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A protocol frame, serialized to a text message.
    Frame(ServerMessage),
    /// Close the socket with a code and reason, then stop writing.
    Close { code: u16, reason: &'static str },
}

/// A connected session's sender channel.
pub type ClientSender = mpsc::UnboundedSender<Outbound>;

/// One live connection: the owning user's identity plus its sender channel.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub user_id: i64,
    pub username: String,
    pub sender: ClientSender,
}

/// One member of a live call room.
#[derive(Debug, Clone)]
pub struct RoomMember {
    pub session_id: String,
    pub user_id: i64,
    pub username: String,
}

/// A live call room.
#[derive(Debug, Clone)]
pub struct CallRoom {
    pub room_id: String,
    /// Session that created the room.
    pub caller_session_id: String,
    pub caller_user_id: i64,
    /// Creator's name at creation time, kept for summaries after they leave.
    pub caller_username: String,
    pub is_group: bool,
    pub members: Vec<RoomMember>,
    pub created_at: DateTime<Utc>,
}

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    /// Session id → live connection handle.
    /// Inserted once a connection resolves its identity, removed on close.
    pub sessions: Arc<DashMap<String, SessionHandle>>,

    /// Room id → call room.
    /// Tracks live call rooms and their members.
    pub call_rooms: Arc<DashMap<String, CallRoom>>,

    /// Server configuration.
    pub config: ServerConfig,

    /// Durable user/message/session records.
    pub store: Store,
}

impl AppState {
    /// Create a new server state with the given configuration and store.
    pub fn new(config: ServerConfig, store: Store) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            call_rooms: Arc::new(DashMap::new()),
            config,
            store,
        }
    }

    // ── Session Management ────────────────────────────────────────────────

    /// Register a session once its identity is resolved.
    pub fn register_session(
        &self,
        session_id: &str,
        user_id: i64,
        username: &str,
        sender: ClientSender,
    ) {
        tracing::info!(
            session_id = session_id,
            user_id = user_id,
            username = username,
            "Session registered"
        );
        self.sessions.insert(
            session_id.to_string(),
            SessionHandle {
                user_id,
                username: username.to_string(),
                sender,
            },
        );
    }

    /// Claim a session slot on disconnect. Returns the handle exactly once,
    /// so duplicate close events from the transport run cleanup a single time.
    pub fn unregister_session(&self, session_id: &str) -> Option<SessionHandle> {
        let removed = self.sessions.remove(session_id).map(|(_, handle)| handle);
        if removed.is_some() {
            tracing::info!(session_id = session_id, "Session unregistered");
        }
        removed
    }

    /// Current identity behind a session, if it is registered.
    pub fn session_identity(&self, session_id: &str) -> Option<(i64, String)> {
        self.sessions
            .get(session_id)
            .map(|h| (h.user_id, h.username.clone()))
    }

    /// Check whether a user has at least one live session.
    pub fn is_user_online(&self, user_id: i64) -> bool {
        self.sessions.iter().any(|e| e.user_id == user_id)
    }

    /// Send a frame to one session. Returns true if it was queued.
    pub fn send_to_session(&self, session_id: &str, message: ServerMessage) -> bool {
        if let Some(handle) = self.sessions.get(session_id) {
            handle.sender.send(Outbound::Frame(message)).is_ok()
        } else {
            false
        }
    }

    /// Send a frame to every session of one user. Returns true if at least
    /// one delivery was queued.
    pub fn send_to_user(&self, user_id: i64, message: ServerMessage) -> bool {
        let mut delivered = false;
        for entry in self.sessions.iter() {
            if entry.user_id == user_id
                && entry.sender.send(Outbound::Frame(message.clone())).is_ok()
            {
                delivered = true;
            }
        }
        delivered
    }

    /// Send a frame to every live session. A dead receiver is a silent miss;
    /// its connection task is already on its way out.
    pub fn broadcast(&self, message: ServerMessage) {
        for entry in self.sessions.iter() {
            let _ = entry.sender.send(Outbound::Frame(message.clone()));
        }
    }

    /// Send a frame to every live session except one.
    pub fn broadcast_except(&self, except_session_id: &str, message: ServerMessage) {
        for entry in self.sessions.iter() {
            if entry.key() != except_session_id {
                let _ = entry.sender.send(Outbound::Frame(message.clone()));
            }
        }
    }

    /// Update the cached display name on every live handle of a user.
    pub fn rename_user(&self, user_id: i64, new_name: &str) {
        let keys: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some(mut handle) = self.sessions.get_mut(&key) {
                handle.username = new_name.to_string();
            }
        }
    }

    /// Queue a duplicate-session close on every other session of a user.
    /// The closed connections run their own disconnect cleanup. Returns the
    /// number of sessions told to close.
    pub fn close_other_sessions(&self, user_id: i64, keep_session_id: &str) -> usize {
        let victims: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.user_id == user_id && e.key() != keep_session_id)
            .map(|e| e.key().clone())
            .collect();
        for session_id in &victims {
            if let Some(handle) = self.sessions.get(session_id) {
                let _ = handle.sender.send(Outbound::Close {
                    code: DUPLICATE_SESSION_CLOSE_CODE,
                    reason: DUPLICATE_SESSION_CLOSE_REASON,
                });
            }
        }
        if !victims.is_empty() {
            tracing::info!(
                user_id = user_id,
                count = victims.len(),
                "Closed duplicate sessions after rename"
            );
        }
        victims.len()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of distinct users with at least one live session.
    pub fn online_user_count(&self) -> usize {
        let mut ids: Vec<i64> = self.sessions.iter().map(|e| e.user_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    // ── Call Room Management ──────────────────────────────────────────────

    /// Create a new call room with the creator as sole member.
    /// Returns the room ID.
    pub fn create_call_room(
        &self,
        session_id: &str,
        user_id: i64,
        username: &str,
        is_group: bool,
    ) -> String {
        let room_id = Uuid::new_v4().to_string();

        let room = CallRoom {
            room_id: room_id.clone(),
            caller_session_id: session_id.to_string(),
            caller_user_id: user_id,
            caller_username: username.to_string(),
            is_group,
            members: vec![RoomMember {
                session_id: session_id.to_string(),
                user_id,
                username: username.to_string(),
            }],
            created_at: Utc::now(),
        };

        tracing::info!(
            room_id = room_id.as_str(),
            session_id = session_id,
            is_group = is_group,
            "Created call room"
        );
        self.call_rooms.insert(room_id.clone(), room);
        room_id
    }

    /// Join an existing room. Returns the members present before the join so
    /// the caller can notify them; None if the room doesn't exist. Joining
    /// twice is a no-op that still returns the other members.
    pub fn join_call_room(
        &self,
        room_id: &str,
        session_id: &str,
        user_id: i64,
        username: &str,
    ) -> Option<Vec<RoomMember>> {
        let mut room = self.call_rooms.get_mut(room_id)?;

        let existing: Vec<RoomMember> = room
            .members
            .iter()
            .filter(|m| m.session_id != session_id)
            .cloned()
            .collect();

        if room.members.iter().any(|m| m.session_id == session_id) {
            return Some(existing);
        }

        room.members.push(RoomMember {
            session_id: session_id.to_string(),
            user_id,
            username: username.to_string(),
        });

        tracing::info!(
            room_id = room_id,
            session_id = session_id,
            member_count = room.members.len(),
            "Member joined call room"
        );

        Some(existing)
    }

    /// Remove a session from a room. Returns the remaining members if the
    /// session actually was one; a room with zero members is discarded.
    pub fn leave_call_room(&self, room_id: &str, session_id: &str) -> Option<Vec<RoomMember>> {
        let remaining = {
            let mut room = self.call_rooms.get_mut(room_id)?;
            if !room.members.iter().any(|m| m.session_id == session_id) {
                return None;
            }
            room.members.retain(|m| m.session_id != session_id);
            room.members.clone()
        };

        tracing::info!(
            room_id = room_id,
            session_id = session_id,
            remaining = remaining.len(),
            "Member left call room"
        );

        if remaining.is_empty() {
            self.call_rooms.remove(room_id);
            tracing::debug!(room_id = room_id, "Removed empty call room");
        }

        Some(remaining)
    }

    /// Remove a room outright. Returns it so callers can notify the members.
    pub fn end_call_room(&self, room_id: &str) -> Option<CallRoom> {
        let (_, room) = self.call_rooms.remove(room_id)?;
        tracing::info!(
            room_id = room_id,
            member_count = room.members.len(),
            "Call room ended"
        );
        Some(room)
    }

    /// Snapshot one room.
    pub fn get_room(&self, room_id: &str) -> Option<CallRoom> {
        self.call_rooms.get(room_id).map(|r| r.clone())
    }

    /// Current members of a room.
    pub fn room_members(&self, room_id: &str) -> Option<Vec<RoomMember>> {
        self.call_rooms.get(room_id).map(|r| r.members.clone())
    }

    /// Check if a session is a member of a room.
    pub fn is_room_member(&self, room_id: &str, session_id: &str) -> bool {
        self.call_rooms
            .get(room_id)
            .map(|r| r.members.iter().any(|m| m.session_id == session_id))
            .unwrap_or(false)
    }

    /// Remove a disconnected session from every room it belongs to.
    /// Returns room id → remaining members for each affected room.
    pub fn remove_from_all_rooms(&self, session_id: &str) -> Vec<(String, Vec<RoomMember>)> {
        let room_ids: Vec<String> = self
            .call_rooms
            .iter()
            .filter(|r| r.members.iter().any(|m| m.session_id == session_id))
            .map(|r| r.room_id.clone())
            .collect();

        let mut affected = Vec::new();
        for room_id in room_ids {
            if let Some(remaining) = self.leave_call_room(&room_id, session_id) {
                affected.push((room_id, remaining));
            }
        }
        affected
    }

    /// Snapshot of all live rooms for the `active_calls` response.
    pub fn active_calls(&self) -> Vec<CallSummary> {
        self.call_rooms
            .iter()
            .map(|entry| CallSummary {
                room_id: entry.room_id.clone(),
                creator_name: entry.caller_username.clone(),
                participants_count: entry.members.len(),
                created_at: entry.created_at.timestamp_millis(),
            })
            .collect()
    }

    /// Number of live call rooms.
    pub fn room_count(&self) -> usize {
        self.call_rooms.len()
    }

    // ── Periodic Maintenance ──────────────────────────────────────────────

    /// Sweep stale state. Called periodically by the cleanup task.
    ///
    /// Ends store rows for sessions that died without a clean disconnect and
    /// force-ends call rooms past their TTL, notifying any members.
    pub fn cleanup_expired(&self) {
        let now = now_ms();

        match self.store.open_sessions() {
            Ok(rows) => {
                let mut ended = 0usize;
                for row in rows {
                    let stale = now - row.connected_at > self.config.session_stale_secs * 1000;
                    if stale && !self.sessions.contains_key(&row.session_id) {
                        match self.store.end_session(&row.session_id, now) {
                            Ok(()) => ended += 1,
                            Err(e) => tracing::warn!(
                                error = %e,
                                session_id = row.session_id.as_str(),
                                "Failed to end stale session row"
                            ),
                        }
                    }
                }
                if ended > 0 {
                    tracing::debug!(count = ended, "Ended stale session rows");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to list open sessions"),
        }

        let expired_rooms: Vec<String> = self
            .call_rooms
            .iter()
            .filter(|entry| {
                now - entry.created_at.timestamp_millis() > self.config.room_ttl_secs * 1000
            })
            .map(|entry| entry.room_id.clone())
            .collect();

        for room_id in &expired_rooms {
            if let Some((_, room)) = self.call_rooms.remove(room_id) {
                for member in &room.members {
                    self.send_to_session(
                        &member.session_id,
                        ServerMessage::CallEnded {
                            room_id: room.room_id.clone(),
                            ended_by: "server".to_string(),
                        },
                    );
                }
            }
        }

        if !expired_rooms.is_empty() {
            tracing::debug!(count = expired_rooms.len(), "Cleaned up expired call rooms");
        }
    }
}
