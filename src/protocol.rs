//! Wire protocol message definitions.
//!
//! The server speaks a JSON-over-WebSocket protocol: every frame is a single
//! object with a required `type` tag. Tags are snake_case, field names are
//! camelCase (what the browser client expects), and timestamps are epoch
//! milliseconds. Signaling payloads (offers/answers/candidates) are opaque
//! JSON values relayed verbatim — the server never inspects SDP or ICE.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Policy Constants ──────────────────────────────────────────────────────────

/// Maximum file payload size, measured on the decoded bytes (10 MiB).
pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;

/// Maximum chat/action/private text length in characters.
pub const MAX_TEXT_CHARS: usize = 4096;

/// Maximum reaction length in characters.
pub const MAX_REACTION_CHARS: usize = 64;

/// Maximum display name length in characters.
pub const MAX_NAME_CHARS: usize = 50;

/// MIME prefix groups accepted for file posts.
pub const ALLOWED_FILE_TYPE_PREFIXES: &[&str] = &["image/", "video/", "audio/"];

/// Exact MIME types accepted for file posts beyond the prefix groups.
pub const ALLOWED_FILE_TYPES: &[&str] = &["application/pdf", "text/plain"];

/// Close code sent when a session is terminated because the same user opened
/// a newer connection (rename reconciliation). Clients must not reconnect.
pub const DUPLICATE_SESSION_CLOSE_CODE: u16 = 4000;

/// Close reason paired with [`DUPLICATE_SESSION_CLOSE_CODE`].
pub const DUPLICATE_SESSION_CLOSE_REASON: &str = "Duplicate session closed by new connection";

/// Check a file's declared MIME type against the allow-list.
pub fn is_allowed_file_type(filetype: &str) -> bool {
    ALLOWED_FILE_TYPE_PREFIXES
        .iter()
        .any(|p| filetype.starts_with(p))
        || ALLOWED_FILE_TYPES.contains(&filetype)
}

// ── Signaling Contract ────────────────────────────────────────────────────────

/// Decide which of two sessions initiates the WebRTC offer.
///
/// When two sessions newly see each other in a room, both ends compute this
/// from identical inputs (the joiner's `room_users` list, the incumbents'
/// `user_joined` notice): the lexicographically smaller session id creates
/// the offer, the other waits for it. Both sides reach the same answer, so
/// simultaneous-offer glare cannot happen. The server only relays signaling
/// frames; this helper publishes the rule clients must follow.
#[allow(dead_code)]
pub fn offer_initiator<'a>(a: &'a str, b: &'a str) -> &'a str {
    if a <= b {
        a
    } else {
        b
    }
}

// ── Client → Server ───────────────────────────────────────────────────────────

/// Messages sent from a browser client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Post a chat message to everyone (the sender sees its own echo).
    Message { text: String },

    /// Change the sender's display name. The camelCase tag is the one
    /// exception to the snake_case convention, kept for client compatibility.
    #[serde(rename = "setName")]
    SetName { name: String },

    /// Emote-style message ("X does something").
    Action { text: String },

    /// Broadcast an emoji reaction.
    Reaction { emoji: String },

    /// Send a private message to one user (by user id).
    Private { to: i64, text: String },

    /// Post a file. `data` is the base64-encoded payload; `size` is the
    /// client's claim of the decoded length (the server re-checks).
    File {
        filename: String,
        filetype: String,
        size: u64,
        data: String,
    },

    /// Start a call. Without a target this opens a group call and invites
    /// every other session; with `target_user_id` it rings exactly that user.
    #[serde(alias = "start_individual_call")]
    CreateRoom { target_user_id: Option<i64> },

    /// Join an existing call room.
    #[serde(alias = "join_group_call")]
    JoinRoom { room_id: String },

    /// Leave a call room.
    LeaveRoom { room_id: String },

    /// End the call for every member of the room.
    EndCall { room_id: String },

    /// Decline an incoming call invitation.
    CallRejected { room_id: String },

    /// Ask for the current member list of a room.
    GetRoomUsers { room_id: String },

    /// Ask for a snapshot of all live call rooms.
    GetActiveCalls,

    /// Relay an SDP offer to one session in the room.
    WebrtcOffer {
        room_id: String,
        target_session_id: String,
        offer: Value,
    },

    /// Relay an SDP answer to one session in the room.
    WebrtcAnswer {
        room_id: String,
        target_session_id: String,
        answer: Value,
    },

    /// Relay an ICE candidate to one session in the room.
    WebrtcIceCandidate {
        room_id: String,
        target_session_id: String,
        candidate: Value,
    },
}

// ── Server → Client ───────────────────────────────────────────────────────────

/// Messages sent from the server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First frame after the history replay: the client's assigned identity.
    /// The session id must accompany every room-scoped frame afterwards.
    Init {
        id: i64,
        name: String,
        session_id: String,
    },

    /// Recent message window, oldest first.
    History { history: Vec<HistoryEntry> },

    /// A chat message. `id` is the author's user id.
    Message {
        id: i64,
        name: String,
        text: String,
        ts: i64,
    },

    /// Server-generated notice (joins, leaves, policy refusals).
    System { text: String },

    /// Emote-style message.
    Action { name: String, text: String },

    /// Emoji reaction.
    Reaction { name: String, emoji: String },

    /// A file post with inline base64 payload.
    File {
        id: i64,
        name: String,
        filename: String,
        filetype: String,
        size: u64,
        data: String,
        ts: i64,
    },

    /// Full online-roster snapshot.
    Users { users: Vec<RosterUser> },

    /// A user's display name changed.
    NameUpdated { user_id: i64, new_name: String },

    /// A private message, delivered to the target's sessions only.
    Private { name: String, text: String },

    /// Delivery confirmation for a private message.
    PrivateSent,

    /// An incoming call invitation.
    CallInvite {
        room_id: String,
        from_user_name: String,
        is_group_call: bool,
    },

    /// Confirmation to an individual-call initiator that the target is ringing.
    CallStarted {
        room_id: String,
        target_user_name: String,
    },

    /// Confirmation to a group-call creator.
    RoomCreated { room_id: String, message: String },

    /// Current member list of a room, sent to the joiner and on request.
    RoomUsers {
        room_id: String,
        users: Vec<RoomMemberInfo>,
    },

    /// A member joined the room.
    UserJoined {
        room_id: String,
        session_id: String,
        user_id: i64,
        user_name: String,
    },

    /// A member left the room.
    UserLeft {
        room_id: String,
        session_id: String,
        user_name: String,
    },

    /// SDP offer relayed from another session in the room.
    WebrtcOffer {
        room_id: String,
        from_session_id: String,
        offer: Value,
    },

    /// SDP answer relayed from another session in the room.
    WebrtcAnswer {
        room_id: String,
        from_session_id: String,
        answer: Value,
    },

    /// ICE candidate relayed from another session in the room.
    WebrtcIceCandidate {
        room_id: String,
        from_session_id: String,
        candidate: Value,
    },

    /// The invitee declined the call.
    CallRejected { room_id: String, user_name: String },

    /// The call was ended for everyone in the room.
    CallEnded { room_id: String, ended_by: String },

    /// Snapshot of all live call rooms.
    ActiveCalls { calls: Vec<CallSummary> },

    /// Error response, sent to the offending sender only.
    Error { message: String },
}

// ── Supporting Wire Types ─────────────────────────────────────────────────────

/// One row of the recent-history window.
///
/// File rows carry their metadata JSON in `content`; binary payloads are not
/// replayed in history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub user_id: i64,
    pub name: String,
    pub content: String,
    pub ts: i64,
}

/// One entry of the online-user roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterUser {
    pub id: i64,
    pub name: String,
    pub is_online: bool,
}

/// A room member as seen on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMemberInfo {
    pub session_id: String,
    pub user_id: i64,
    pub user_name: String,
}

/// Summary of one live call room for `active_calls`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSummary {
    pub room_id: String,
    pub creator_name: String,
    pub participants_count: usize,
    pub created_at: i64,
}
