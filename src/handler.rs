//! WebSocket connection handler.
//!
//! Runs one task per connection: provisions an identity, replays history,
//! routes inbound frames through the shared state, and tears the session
//! down exactly once when the transport closes.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use base64::Engine;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{
    is_allowed_file_type, ClientMessage, RoomMemberInfo, RosterUser, ServerMessage,
    MAX_FILE_BYTES, MAX_NAME_CHARS, MAX_REACTION_CHARS, MAX_TEXT_CHARS,
};
use crate::state::{now_ms, AppState, Outbound, RoomMember, SessionHandle};
use crate::store::UserRow;

/// Handle a single WebSocket connection.
///
/// This function runs for the lifetime of the connection:
/// 1. Provisions an identity (placeholder user + session row)
/// 2. Spawns a sender task to forward outbound frames
/// 3. Replays history, announces the arrival, then processes inbound frames
/// 4. Runs disconnect cleanup exactly once when the connection ends
pub async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create the outbound channel for this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // ── Step 1: Resolve Identity ──────────────────────────────────────────

    let session_id = Uuid::new_v4().to_string();
    let placeholder = format!("User-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let now = now_ms();

    let user = match state.store.upsert_user_by_name(&placeholder, now) {
        Ok(user) => user,
        Err(e) => {
            tracing::error!(error = %e, "Failed to provision user for new connection");
            send_fatal(&mut ws_sender, "Could not establish identity").await;
            return;
        }
    };
    if let Err(e) = state.store.create_session(user.id, &session_id, now) {
        tracing::error!(error = %e, "Failed to record session for new connection");
        send_fatal(&mut ws_sender, "Could not establish identity").await;
        return;
    }

    // ── Step 2: Register Session and Spawn Sender Task ────────────────────

    state.register_session(&session_id, user.id, &user.username, tx);

    let sender_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json)).await.is_err() {
                            break; // Connection closed
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to serialize server message: {}", e);
                    }
                },
                Outbound::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // ── Step 3: Welcome Sequence ──────────────────────────────────────────

    send_welcome(&state, &session_id, &user);

    // ── Step 4: Process Messages ──────────────────────────────────────────

    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    handle_client_message(&state, &session_id, client_msg).await;
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = session_id.as_str(),
                        error = %e,
                        "Failed to parse client message"
                    );
                    state.send_to_session(
                        &session_id,
                        ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        },
                    );
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!(session_id = session_id.as_str(), "Client sent close frame");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    session_id = session_id.as_str(),
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
            _ => {} // Binary, Ping, Pong — axum answers pings at the protocol level
        }
    }

    // ── Step 5: Cleanup ───────────────────────────────────────────────────

    // The registry entry is the claim: whoever removes it runs cleanup, so
    // duplicate close events from the transport cannot run it twice.
    if let Some(handle) = state.unregister_session(&session_id) {
        cleanup_session(&state, &session_id, &handle);
    }
    sender_task.abort();
    tracing::info!(session_id = session_id.as_str(), "WebSocket disconnected");
}

/// Best-effort error frame on a socket that never finished setup.
async fn send_fatal(ws_sender: &mut SplitSink<WebSocket, Message>, message: &str) {
    let err = ServerMessage::Error {
        message: message.to_string(),
    };
    if let Ok(json) = serde_json::to_string(&err) {
        let _ = ws_sender.send(Message::Text(json)).await;
    }
}

/// Welcome a freshly registered session: replay recent history, hand the
/// client its identity, then announce the arrival to everyone else.
fn send_welcome(state: &AppState, session_id: &str, user: &UserRow) {
    match state.store.recent_history(state.config.history_limit) {
        Ok(history) => {
            state.send_to_session(session_id, ServerMessage::History { history });
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load message history");
            state.send_to_session(
                session_id,
                ServerMessage::System {
                    text: "Message history is unavailable".to_string(),
                },
            );
        }
    }
    state.send_to_session(
        session_id,
        ServerMessage::Init {
            id: user.id,
            name: user.username.clone(),
            session_id: session_id.to_string(),
        },
    );

    let joined = format!("{} joined the chat", user.username);
    if let Err(e) = state
        .store
        .insert_message(user.id, "system", &joined, None, None, now_ms())
    {
        tracing::warn!(error = %e, "Failed to persist join notice");
    }
    state.broadcast_except(session_id, ServerMessage::System { text: joined });
    broadcast_roster(state);
}

/// Disconnect cleanup, in order: room departures, the session row, then chat
/// notices to everyone still connected.
fn cleanup_session(state: &AppState, session_id: &str, handle: &SessionHandle) {
    let affected = state.remove_from_all_rooms(session_id);
    for (room_id, remaining) in &affected {
        for member in remaining {
            state.send_to_session(
                &member.session_id,
                ServerMessage::UserLeft {
                    room_id: room_id.clone(),
                    session_id: session_id.to_string(),
                    user_name: handle.username.clone(),
                },
            );
        }
        // A call that just lost its second-to-last member is over; drop the
        // room so active-call listings never show a one-member leftover.
        if remaining.len() == 1 {
            state.end_call_room(room_id);
        }
    }

    let now = now_ms();
    if let Err(e) = state.store.end_session(session_id, now) {
        tracing::warn!(error = %e, session_id = session_id, "Failed to end session row");
    }

    let text = format!("{} left the chat", handle.username);
    if let Err(e) = state
        .store
        .insert_message(handle.user_id, "system", &text, None, None, now)
    {
        tracing::warn!(error = %e, "Failed to persist leave notice");
    }
    state.broadcast(ServerMessage::System { text });
    broadcast_roster(state);
}

/// Push a fresh roster snapshot to every live session.
fn broadcast_roster(state: &AppState) {
    match state.store.online_users() {
        Ok(users) => {
            let users = users
                .into_iter()
                .map(|u| RosterUser {
                    id: u.id,
                    name: u.username,
                    is_online: true,
                })
                .collect();
            state.broadcast(ServerMessage::Users { users });
        }
        Err(e) => tracing::warn!(error = %e, "Failed to load online users"),
    }
}

/// Handle a parsed client message.
async fn handle_client_message(state: &AppState, session_id: &str, msg: ClientMessage) {
    // Identity comes from the registry on every frame: a rename issued from
    // another session of the same user must be visible here immediately.
    let (user_id, username) = match state.session_identity(session_id) {
        Some(identity) => identity,
        None => return, // session already tearing down
    };

    match msg {
        ClientMessage::Message { text } => {
            handle_chat_message(state, session_id, user_id, &username, &text);
        }

        ClientMessage::SetName { name } => {
            handle_set_name(state, session_id, user_id, &username, name);
        }

        ClientMessage::Action { text } => {
            handle_action(state, session_id, user_id, &username, &text);
        }

        ClientMessage::Reaction { emoji } => {
            handle_reaction(state, session_id, user_id, &username, &emoji);
        }

        ClientMessage::Private { to, text } => {
            handle_private(state, session_id, user_id, &username, to, &text);
        }

        ClientMessage::File {
            filename,
            filetype,
            size,
            data,
        } => {
            handle_file(
                state, session_id, user_id, &username, filename, filetype, size, data,
            );
        }

        ClientMessage::CreateRoom { target_user_id } => {
            handle_create_room(state, session_id, user_id, &username, target_user_id);
        }

        ClientMessage::JoinRoom { room_id } => {
            handle_join_room(state, session_id, user_id, &username, &room_id);
        }

        ClientMessage::LeaveRoom { room_id } => {
            handle_leave_room(state, session_id, &username, &room_id);
        }

        ClientMessage::EndCall { room_id } => {
            handle_end_call(state, session_id, &username, &room_id);
        }

        ClientMessage::CallRejected { room_id } => {
            handle_call_rejected(state, session_id, &username, &room_id);
        }

        ClientMessage::GetRoomUsers { room_id } => {
            handle_get_room_users(state, session_id, &room_id);
        }

        ClientMessage::GetActiveCalls => {
            state.send_to_session(
                session_id,
                ServerMessage::ActiveCalls {
                    calls: state.active_calls(),
                },
            );
        }

        ClientMessage::WebrtcOffer {
            room_id,
            target_session_id,
            offer,
        } => {
            let forward = ServerMessage::WebrtcOffer {
                room_id: room_id.clone(),
                from_session_id: session_id.to_string(),
                offer,
            };
            relay_signaling(state, session_id, &room_id, &target_session_id, forward);
        }

        ClientMessage::WebrtcAnswer {
            room_id,
            target_session_id,
            answer,
        } => {
            let forward = ServerMessage::WebrtcAnswer {
                room_id: room_id.clone(),
                from_session_id: session_id.to_string(),
                answer,
            };
            relay_signaling(state, session_id, &room_id, &target_session_id, forward);
        }

        ClientMessage::WebrtcIceCandidate {
            room_id,
            target_session_id,
            candidate,
        } => {
            let forward = ServerMessage::WebrtcIceCandidate {
                room_id: room_id.clone(),
                from_session_id: session_id.to_string(),
                candidate,
            };
            relay_signaling(state, session_id, &room_id, &target_session_id, forward);
        }
    }
}

// ── Chat Handlers ─────────────────────────────────────────────────────────────

/// Validate a candidate display name. Returns the trimmed name, or a
/// user-facing reason for refusal.
fn validate_name(raw: &str) -> Result<String, &'static str> {
    let name = raw.trim();
    if name.is_empty() {
        return Err("Name cannot be empty");
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err("Name is too long");
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
    {
        return Err("Name contains unsupported characters");
    }
    Ok(name.to_string())
}

/// Broadcast a chat message to everyone, including the sender's own echo.
fn handle_chat_message(
    state: &AppState,
    session_id: &str,
    user_id: i64,
    username: &str,
    text: &str,
) {
    let text = text.trim();
    if text.is_empty() {
        state.send_to_session(
            session_id,
            ServerMessage::Error {
                message: "Message text cannot be empty".to_string(),
            },
        );
        return;
    }
    if text.chars().count() > MAX_TEXT_CHARS {
        state.send_to_session(
            session_id,
            ServerMessage::Error {
                message: "Message is too long".to_string(),
            },
        );
        return;
    }

    let now = now_ms();
    if let Err(e) = state
        .store
        .insert_message(user_id, "message", text, None, None, now)
    {
        tracing::warn!(error = %e, "Failed to persist message");
        state.send_to_session(
            session_id,
            ServerMessage::System {
                text: "Message could not be saved".to_string(),
            },
        );
        return;
    }

    state.broadcast(ServerMessage::Message {
        id: user_id,
        name: username.to_string(),
        text: text.to_string(),
        ts: now,
    });
}

/// Rename protocol: validate, persist, reconcile the user's other sessions,
/// then announce.
fn handle_set_name(state: &AppState, session_id: &str, user_id: i64, old_name: &str, raw: String) {
    let new_name = match validate_name(&raw) {
        Ok(name) => name,
        Err(reason) => {
            state.send_to_session(
                session_id,
                ServerMessage::System {
                    text: reason.to_string(),
                },
            );
            return;
        }
    };
    if new_name == old_name {
        state.send_to_session(session_id, ServerMessage::NameUpdated { user_id, new_name });
        return;
    }

    let now = now_ms();
    match state.store.is_name_available(&new_name, user_id) {
        Ok(true) => {}
        Ok(false) => {
            state.send_to_session(
                session_id,
                ServerMessage::System {
                    text: format!("Name \"{}\" is already taken", new_name),
                },
            );
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to check name availability");
            state.send_to_session(
                session_id,
                ServerMessage::System {
                    text: "Name could not be changed".to_string(),
                },
            );
            return;
        }
    }
    if let Err(e) = state.store.update_username(user_id, &new_name, now) {
        // The UNIQUE constraint backstops two renames racing past the check
        tracing::warn!(error = %e, "Failed to update username");
        state.send_to_session(
            session_id,
            ServerMessage::System {
                text: format!("Name \"{}\" is already taken", new_name),
            },
        );
        return;
    }

    state.rename_user(user_id, &new_name);
    state.close_other_sessions(user_id, session_id);

    let action = format!("renamed to {}", new_name);
    if let Err(e) = state
        .store
        .insert_message(user_id, "action", &action, None, None, now)
    {
        tracing::warn!(error = %e, "Failed to persist rename action");
    }
    state.broadcast(ServerMessage::Action {
        name: old_name.to_string(),
        text: action,
    });
    state.broadcast(ServerMessage::NameUpdated { user_id, new_name });
    broadcast_roster(state);
}

fn handle_action(state: &AppState, session_id: &str, user_id: i64, username: &str, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        state.send_to_session(
            session_id,
            ServerMessage::Error {
                message: "Action text cannot be empty".to_string(),
            },
        );
        return;
    }
    if text.chars().count() > MAX_TEXT_CHARS {
        state.send_to_session(
            session_id,
            ServerMessage::Error {
                message: "Action text is too long".to_string(),
            },
        );
        return;
    }

    let now = now_ms();
    if let Err(e) = state
        .store
        .insert_message(user_id, "action", text, None, None, now)
    {
        tracing::warn!(error = %e, "Failed to persist action");
        state.send_to_session(
            session_id,
            ServerMessage::System {
                text: "Message could not be saved".to_string(),
            },
        );
        return;
    }

    state.broadcast(ServerMessage::Action {
        name: username.to_string(),
        text: text.to_string(),
    });
}

fn handle_reaction(state: &AppState, session_id: &str, user_id: i64, username: &str, emoji: &str) {
    let emoji = emoji.trim();
    if emoji.is_empty() || emoji.chars().count() > MAX_REACTION_CHARS {
        state.send_to_session(
            session_id,
            ServerMessage::Error {
                message: "Invalid reaction".to_string(),
            },
        );
        return;
    }

    let now = now_ms();
    if let Err(e) = state
        .store
        .insert_message(user_id, "reaction", emoji, None, None, now)
    {
        tracing::warn!(error = %e, "Failed to persist reaction");
        state.send_to_session(
            session_id,
            ServerMessage::System {
                text: "Message could not be saved".to_string(),
            },
        );
        return;
    }

    state.broadcast(ServerMessage::Reaction {
        name: username.to_string(),
        emoji: emoji.to_string(),
    });
}

/// Deliver a private message to every live session of the target user.
fn handle_private(
    state: &AppState,
    session_id: &str,
    user_id: i64,
    username: &str,
    to: i64,
    text: &str,
) {
    let text = text.trim();
    if text.is_empty() {
        state.send_to_session(
            session_id,
            ServerMessage::Error {
                message: "Message text cannot be empty".to_string(),
            },
        );
        return;
    }
    if text.chars().count() > MAX_TEXT_CHARS {
        state.send_to_session(
            session_id,
            ServerMessage::Error {
                message: "Message is too long".to_string(),
            },
        );
        return;
    }

    let target = match state.store.get_user(to) {
        Ok(Some(user)) => user,
        Ok(None) => {
            state.send_to_session(
                session_id,
                ServerMessage::System {
                    text: "User not found".to_string(),
                },
            );
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to look up private message target");
            state.send_to_session(
                session_id,
                ServerMessage::System {
                    text: "Message could not be delivered".to_string(),
                },
            );
            return;
        }
    };
    if !state.is_user_online(target.id) {
        state.send_to_session(
            session_id,
            ServerMessage::System {
                text: format!("{} is offline", target.username),
            },
        );
        return;
    }

    let now = now_ms();
    if let Err(e) = state
        .store
        .insert_message(user_id, "private", text, Some(target.id), None, now)
    {
        tracing::warn!(error = %e, "Failed to persist private message");
        state.send_to_session(
            session_id,
            ServerMessage::System {
                text: "Message could not be saved".to_string(),
            },
        );
        return;
    }

    state.send_to_user(
        target.id,
        ServerMessage::Private {
            name: username.to_string(),
            text: text.to_string(),
        },
    );
    state.send_to_session(session_id, ServerMessage::PrivateSent);
}

/// Accept a file post: re-check the size cap on the decoded bytes, enforce
/// the MIME allow-list, persist, then fan out.
#[allow(clippy::too_many_arguments)]
fn handle_file(
    state: &AppState,
    session_id: &str,
    user_id: i64,
    username: &str,
    filename: String,
    filetype: String,
    size: u64,
    data: String,
) {
    if filename.trim().is_empty() {
        state.send_to_session(
            session_id,
            ServerMessage::Error {
                message: "File name is required".to_string(),
            },
        );
        return;
    }
    if size > MAX_FILE_BYTES as u64 {
        state.send_to_session(
            session_id,
            ServerMessage::System {
                text: "File is too large (max 10 MB)".to_string(),
            },
        );
        return;
    }
    if !is_allowed_file_type(&filetype) {
        state.send_to_session(
            session_id,
            ServerMessage::System {
                text: format!("File type \"{}\" is not allowed", filetype),
            },
        );
        return;
    }
    let bytes = match base64::engine::general_purpose::STANDARD.decode(data.as_bytes()) {
        Ok(bytes) => bytes,
        Err(_) => {
            state.send_to_session(
                session_id,
                ServerMessage::Error {
                    message: "File data is not valid base64".to_string(),
                },
            );
            return;
        }
    };
    if bytes.len() > MAX_FILE_BYTES {
        state.send_to_session(
            session_id,
            ServerMessage::System {
                text: "File is too large (max 10 MB)".to_string(),
            },
        );
        return;
    }

    let now = now_ms();
    let metadata = serde_json::json!({
        "filename": filename,
        "filetype": filetype,
        "size": bytes.len(),
    })
    .to_string();
    if let Err(e) =
        state
            .store
            .insert_message(user_id, "file", &metadata, None, Some(&bytes), now)
    {
        tracing::warn!(error = %e, "Failed to persist file post");
        state.send_to_session(
            session_id,
            ServerMessage::System {
                text: "File could not be saved".to_string(),
            },
        );
        return;
    }

    state.broadcast(ServerMessage::File {
        id: user_id,
        name: username.to_string(),
        filename,
        filetype,
        size: bytes.len() as u64,
        data,
        ts: now,
    });
}

// ── Call Room Handlers ────────────────────────────────────────────────────────

fn member_info(member: &RoomMember) -> RoomMemberInfo {
    RoomMemberInfo {
        session_id: member.session_id.clone(),
        user_id: member.user_id,
        user_name: member.username.clone(),
    }
}

/// Open a call room. Without a target every other session is invited to a
/// group call; with one, exactly that user's sessions ring.
fn handle_create_room(
    state: &AppState,
    session_id: &str,
    user_id: i64,
    username: &str,
    target_user_id: Option<i64>,
) {
    match target_user_id {
        None => {
            let room_id = state.create_call_room(session_id, user_id, username, true);
            state.send_to_session(
                session_id,
                ServerMessage::RoomCreated {
                    room_id: room_id.clone(),
                    message: "Call room created".to_string(),
                },
            );
            state.broadcast_except(
                session_id,
                ServerMessage::CallInvite {
                    room_id,
                    from_user_name: username.to_string(),
                    is_group_call: true,
                },
            );
        }
        Some(target_user_id) => {
            let target = match state.store.get_user(target_user_id) {
                Ok(Some(user)) => user,
                Ok(None) => {
                    state.send_to_session(
                        session_id,
                        ServerMessage::System {
                            text: "User not found".to_string(),
                        },
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to look up call target");
                    state.send_to_session(
                        session_id,
                        ServerMessage::System {
                            text: "Call could not be started".to_string(),
                        },
                    );
                    return;
                }
            };
            if !state.is_user_online(target.id) {
                state.send_to_session(
                    session_id,
                    ServerMessage::System {
                        text: format!("{} is offline", target.username),
                    },
                );
                return;
            }

            let room_id = state.create_call_room(session_id, user_id, username, false);
            state.send_to_session(
                session_id,
                ServerMessage::CallStarted {
                    room_id: room_id.clone(),
                    target_user_name: target.username.clone(),
                },
            );
            state.send_to_user(
                target.id,
                ServerMessage::CallInvite {
                    room_id,
                    from_user_name: username.to_string(),
                    is_group_call: false,
                },
            );
        }
    }
}

/// Join a room: incumbents hear `user_joined`, the joiner gets the full
/// member list and initiates offers per the tie-break rule.
fn handle_join_room(
    state: &AppState,
    session_id: &str,
    user_id: i64,
    username: &str,
    room_id: &str,
) {
    match state.join_call_room(room_id, session_id, user_id, username) {
        Some(existing) => {
            for member in &existing {
                state.send_to_session(
                    &member.session_id,
                    ServerMessage::UserJoined {
                        room_id: room_id.to_string(),
                        session_id: session_id.to_string(),
                        user_id,
                        user_name: username.to_string(),
                    },
                );
            }

            let users = state
                .room_members(room_id)
                .unwrap_or_default()
                .iter()
                .map(member_info)
                .collect();
            state.send_to_session(
                session_id,
                ServerMessage::RoomUsers {
                    room_id: room_id.to_string(),
                    users,
                },
            );
        }
        None => {
            state.send_to_session(
                session_id,
                ServerMessage::Error {
                    message: format!("Call room '{}' not found", room_id),
                },
            );
        }
    }
}

/// Leave a room and notify the remaining members. Leaving a room you are not
/// in (or that is already gone) is a no-op.
fn handle_leave_room(state: &AppState, session_id: &str, username: &str, room_id: &str) {
    if let Some(remaining) = state.leave_call_room(room_id, session_id) {
        for member in &remaining {
            state.send_to_session(
                &member.session_id,
                ServerMessage::UserLeft {
                    room_id: room_id.to_string(),
                    session_id: session_id.to_string(),
                    user_name: username.to_string(),
                },
            );
        }
    }
}

/// End the call for every member and purge the room.
fn handle_end_call(state: &AppState, session_id: &str, username: &str, room_id: &str) {
    if !state.is_room_member(room_id, session_id) {
        state.send_to_session(
            session_id,
            ServerMessage::Error {
                message: "You are not in this call room".to_string(),
            },
        );
        return;
    }

    if let Some(room) = state.end_call_room(room_id) {
        for member in &room.members {
            state.send_to_session(
                &member.session_id,
                ServerMessage::CallEnded {
                    room_id: room_id.to_string(),
                    ended_by: username.to_string(),
                },
            );
        }
    }
}

/// An invitee declined: tell the caller, and purge the room if nobody else
/// ever joined it. Only a session outside the room can reject; members exit
/// through `leave_room`/`end_call`.
fn handle_call_rejected(state: &AppState, session_id: &str, username: &str, room_id: &str) {
    let room = match state.get_room(room_id) {
        Some(room) => room,
        None => return, // already ended, nothing to report
    };
    if room.members.iter().any(|m| m.session_id == session_id) {
        state.send_to_session(
            session_id,
            ServerMessage::Error {
                message: "You are already in this call room".to_string(),
            },
        );
        return;
    }

    state.send_to_user(
        room.caller_user_id,
        ServerMessage::CallRejected {
            room_id: room_id.to_string(),
            user_name: username.to_string(),
        },
    );

    if room.members.len() <= 1 {
        state.end_call_room(room_id);
    }
}

fn handle_get_room_users(state: &AppState, session_id: &str, room_id: &str) {
    match state.room_members(room_id) {
        Some(members) => {
            let users = members.iter().map(member_info).collect();
            state.send_to_session(
                session_id,
                ServerMessage::RoomUsers {
                    room_id: room_id.to_string(),
                    users,
                },
            );
        }
        None => {
            state.send_to_session(
                session_id,
                ServerMessage::Error {
                    message: format!("Call room '{}' not found", room_id),
                },
            );
        }
    }
}

/// Forward an offer/answer/candidate payload verbatim to one session in the
/// room. A frame whose sender or target is not a member is dropped silently:
/// membership races with teardown, and stale frames are expected there.
fn relay_signaling(
    state: &AppState,
    session_id: &str,
    room_id: &str,
    target_session_id: &str,
    forward: ServerMessage,
) {
    if !state.is_room_member(room_id, session_id)
        || !state.is_room_member(room_id, target_session_id)
    {
        tracing::debug!(
            room_id = room_id,
            from = session_id,
            to = target_session_id,
            "Dropped signaling frame outside room membership"
        );
        return;
    }
    state.send_to_session(target_session_id, forward);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DUPLICATE_SESSION_CLOSE_CODE, DUPLICATE_SESSION_CLOSE_REASON};
    use crate::state::ServerConfig;
    use crate::store::Store;
    use serde_json::json;

    fn test_state() -> AppState {
        AppState::new(
            ServerConfig {
                db_path: ":memory:".to_string(),
                ..ServerConfig::default()
            },
            Store::open_memory().unwrap(),
        )
    }

    /// Provision a user and a registered session the way a live connection
    /// does, minus the socket.
    fn connect(state: &AppState, name: &str) -> (String, i64, mpsc::UnboundedReceiver<Outbound>) {
        let session_id = Uuid::new_v4().to_string();
        let now = now_ms();
        let user = state.store.upsert_user_by_name(name, now).unwrap();
        state.store.create_session(user.id, &session_id, now).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        state.register_session(&session_id, user.id, name, tx);
        (session_id, user.id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            if let Outbound::Frame(msg) = outbound {
                frames.push(msg);
            }
        }
        frames
    }

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("Alice").unwrap(), "Alice");
        assert_eq!(validate_name("  Alice  ").unwrap(), "Alice");
        assert_eq!(validate_name("Ann-Marie_2.0").unwrap(), "Ann-Marie_2.0");
        assert_eq!(validate_name("Алиса").unwrap(), "Алиса");

        assert!(validate_name("").is_err());
        assert!(validate_name("   ").is_err());
        assert!(validate_name("bad!name").is_err());
        assert!(validate_name("no@here").is_err());
        assert!(validate_name(&"a".repeat(51)).is_err());
    }

    #[tokio::test]
    async fn test_welcome_replays_history_then_init() {
        let state = test_state();
        let (sess_b, _user_b, mut rx_b) = connect(&state, "Bob");
        for text in ["first", "second"] {
            handle_client_message(
                &state,
                &sess_b,
                ClientMessage::Message {
                    text: text.to_string(),
                },
            )
            .await;
        }
        drain(&mut rx_b);

        // Provision a fresh connection the way handle_websocket does
        let session_id = Uuid::new_v4().to_string();
        let placeholder = format!("User-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let user = state
            .store
            .upsert_user_by_name(&placeholder, now_ms())
            .unwrap();
        state
            .store
            .create_session(user.id, &session_id, now_ms())
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.register_session(&session_id, user.id, &user.username, tx);
        send_welcome(&state, &session_id, &user);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        match &frames[0] {
            ServerMessage::History { history } => {
                let texts: Vec<&str> = history.iter().map(|h| h.content.as_str()).collect();
                // Oldest first
                assert_eq!(texts, ["first", "second"]);
            }
            other => panic!("Expected History, got {:?}", other),
        }
        match &frames[1] {
            ServerMessage::Init {
                id,
                name,
                session_id: sid,
            } => {
                assert_eq!(*id, user.id);
                assert!(name.starts_with("User-"));
                assert_eq!(sid, &session_id);
            }
            other => panic!("Expected Init, got {:?}", other),
        }
        assert!(matches!(frames[2], ServerMessage::Users { .. }));

        // The bystander hears the arrival and the refreshed roster, no init
        let frames_b = drain(&mut rx_b);
        assert_eq!(frames_b.len(), 2);
        assert!(matches!(
            &frames_b[0],
            ServerMessage::System { text } if text.contains("joined the chat")
        ));
        assert!(matches!(&frames_b[1], ServerMessage::Users { .. }));
    }

    #[tokio::test]
    async fn test_chat_message_broadcasts_and_persists() {
        let state = test_state();
        let (sess_a, user_a, mut rx_a) = connect(&state, "Alice");
        let (_sess_b, _user_b, mut rx_b) = connect(&state, "Bob");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::Message {
                text: "hi".to_string(),
            },
        )
        .await;

        // Sender sees its own echo
        for frames in [drain(&mut rx_a), drain(&mut rx_b)] {
            assert_eq!(frames.len(), 1);
            match &frames[0] {
                ServerMessage::Message { id, name, text, ts } => {
                    assert_eq!(*id, user_a);
                    assert_eq!(name, "Alice");
                    assert_eq!(text, "hi");
                    assert!(*ts > 0);
                }
                other => panic!("Expected Message, got {:?}", other),
            }
        }

        let history = state.store.recent_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let state = test_state();
        let (sess_a, _user_a, mut rx_a) = connect(&state, "Alice");
        let (_sess_b, _user_b, mut rx_b) = connect(&state, "Bob");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::Message {
                text: "   ".to_string(),
            },
        )
        .await;

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ServerMessage::Error { .. }));
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(state.store.message_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let state = test_state();
        let (sess_a, _user_a, mut rx_a) = connect(&state, "Alice");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::Message {
                text: "a".repeat(MAX_TEXT_CHARS + 1),
            },
        )
        .await;

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ServerMessage::Error { .. }));
        assert_eq!(state.store.message_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_action_and_reaction_broadcast() {
        let state = test_state();
        let (sess_a, _user_a, _rx_a) = connect(&state, "Alice");
        let (_sess_b, _user_b, mut rx_b) = connect(&state, "Bob");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::Action {
                text: "waves".to_string(),
            },
        )
        .await;
        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::Reaction {
                emoji: "👍".to_string(),
            },
        )
        .await;

        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            ServerMessage::Action { name, text } => {
                assert_eq!(name, "Alice");
                assert_eq!(text, "waves");
            }
            other => panic!("Expected Action, got {:?}", other),
        }
        match &frames[1] {
            ServerMessage::Reaction { name, emoji } => {
                assert_eq!(name, "Alice");
                assert_eq!(emoji, "👍");
            }
            other => panic!("Expected Reaction, got {:?}", other),
        }
        assert_eq!(state.store.message_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_oversized_reaction_rejected() {
        let state = test_state();
        let (sess_a, _user_a, mut rx_a) = connect(&state, "Alice");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::Reaction {
                emoji: "x".repeat(MAX_REACTION_CHARS + 1),
            },
        )
        .await;

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ServerMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_rename_updates_everything() {
        let state = test_state();
        let (sess_a, user_a, mut rx_a) = connect(&state, "User-1a2b3c4d");
        let (_sess_b, _user_b, mut rx_b) = connect(&state, "Bob");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::SetName {
                name: "Alice".to_string(),
            },
        )
        .await;

        assert_eq!(
            state.store.get_user(user_a).unwrap().unwrap().username,
            "Alice"
        );
        assert_eq!(
            state.session_identity(&sess_a),
            Some((user_a, "Alice".to_string()))
        );

        // Everyone (sender included) sees the action, the rename, and a roster
        for frames in [drain(&mut rx_a), drain(&mut rx_b)] {
            assert!(frames.iter().any(|f| matches!(
                f,
                ServerMessage::Action { name, text }
                    if name == "User-1a2b3c4d" && text == "renamed to Alice"
            )));
            assert!(frames.iter().any(|f| matches!(
                f,
                ServerMessage::NameUpdated { user_id, new_name }
                    if *user_id == user_a && new_name == "Alice"
            )));
            assert!(frames.iter().any(|f| matches!(
                f,
                ServerMessage::Users { users }
                    if users.iter().any(|u| u.name == "Alice")
            )));
        }
    }

    #[tokio::test]
    async fn test_rename_to_taken_name_refused_without_mutation() {
        let state = test_state();
        let (_sess_a, _user_a, mut rx_a) = connect(&state, "Alice");
        let (sess_b, user_b, mut rx_b) = connect(&state, "Bob");

        handle_client_message(
            &state,
            &sess_b,
            ClientMessage::SetName {
                name: "Alice".to_string(),
            },
        )
        .await;

        // Refusal goes to the sender only, with zero state mutation
        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ServerMessage::System { text } if text.contains("already taken")
        ));
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(
            state.store.get_user(user_b).unwrap().unwrap().username,
            "Bob"
        );
        assert_eq!(
            state.session_identity(&sess_b),
            Some((user_b, "Bob".to_string()))
        );
    }

    #[tokio::test]
    async fn test_invalid_name_refused() {
        let state = test_state();
        let (sess_a, user_a, mut rx_a) = connect(&state, "Alice");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::SetName {
                name: "no!good".to_string(),
            },
        )
        .await;

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ServerMessage::System { .. }));
        assert_eq!(
            state.store.get_user(user_a).unwrap().unwrap().username,
            "Alice"
        );
    }

    #[tokio::test]
    async fn test_rename_closes_duplicate_sessions() {
        let state = test_state();
        // Same user in two tabs
        let (sess_1, user_id, mut rx_1) = connect(&state, "User-aa11bb22");
        let (sess_2, user_2, mut rx_2) = connect(&state, "User-aa11bb22");
        assert_eq!(user_id, user_2);

        handle_client_message(
            &state,
            &sess_1,
            ClientMessage::SetName {
                name: "Dana".to_string(),
            },
        )
        .await;

        // The other tab is told to close with the duplicate-session code
        let mut saw_close = false;
        while let Ok(outbound) = rx_2.try_recv() {
            if let Outbound::Close { code, reason } = outbound {
                assert_eq!(code, DUPLICATE_SESSION_CLOSE_CODE);
                assert_eq!(reason, DUPLICATE_SESSION_CLOSE_REASON);
                saw_close = true;
            }
        }
        assert!(saw_close);

        // The renaming tab stays open and sees the announcement
        let frames = drain(&mut rx_1);
        assert!(frames
            .iter()
            .all(|f| !matches!(f, ServerMessage::Error { .. })));
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::NameUpdated { new_name, .. } if new_name == "Dana"
        )));
        assert_eq!(
            state.session_identity(&sess_1),
            Some((user_id, "Dana".to_string()))
        );
        assert_eq!(state.session_identity(&sess_2).map(|(id, _)| id), Some(user_id));
    }

    #[tokio::test]
    async fn test_private_message_flow() {
        let state = test_state();
        let (sess_a, _user_a, mut rx_a) = connect(&state, "Alice");
        let (_sess_b, user_b, mut rx_b) = connect(&state, "Bob");
        let (_sess_c, _user_c, mut rx_c) = connect(&state, "Carol");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::Private {
                to: user_b,
                text: "psst".to_string(),
            },
        )
        .await;

        // Target gets the message
        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ServerMessage::Private { name, text } => {
                assert_eq!(name, "Alice");
                assert_eq!(text, "psst");
            }
            other => panic!("Expected Private, got {:?}", other),
        }

        // Sender gets exactly one confirmation
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ServerMessage::PrivateSent));

        // Bystanders see nothing, and history stays clean
        assert!(drain(&mut rx_c).is_empty());
        assert!(state.store.recent_history(10).unwrap().is_empty());
        assert_eq!(state.store.message_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_private_to_offline_target_refused() {
        let state = test_state();
        let (sess_a, _user_a, mut rx_a) = connect(&state, "Alice");
        // Bob exists in the store but holds no live session
        let bob = state.store.upsert_user_by_name("Bob", now_ms()).unwrap();

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::Private {
                to: bob.id,
                text: "anyone there?".to_string(),
            },
        )
        .await;

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ServerMessage::System { text } if text.contains("offline")
        ));
        assert_eq!(state.store.message_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_broadcasts_to_everyone() {
        let state = test_state();
        let (sess_a, user_a, mut rx_a) = connect(&state, "Alice");
        let (_sess_b, _user_b, mut rx_b) = connect(&state, "Bob");

        let payload = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3, 4]);
        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::File {
                filename: "cat.png".to_string(),
                filetype: "image/png".to_string(),
                size: 4,
                data: payload.clone(),
            },
        )
        .await;

        for frames in [drain(&mut rx_a), drain(&mut rx_b)] {
            assert_eq!(frames.len(), 1);
            match &frames[0] {
                ServerMessage::File {
                    id,
                    name,
                    filename,
                    filetype,
                    size,
                    data,
                    ..
                } => {
                    assert_eq!(*id, user_a);
                    assert_eq!(name, "Alice");
                    assert_eq!(filename, "cat.png");
                    assert_eq!(filetype, "image/png");
                    assert_eq!(*size, 4);
                    assert_eq!(data, &payload);
                }
                other => panic!("Expected File, got {:?}", other),
            }
        }

        let history = state.store.recent_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, "file");
        // metadata only, never the payload
        assert!(!history[0].content.contains(&payload));
    }

    #[tokio::test]
    async fn test_file_policy_violations() {
        let state = test_state();
        let (sess_a, _user_a, mut rx_a) = connect(&state, "Alice");
        let (_sess_b, _user_b, mut rx_b) = connect(&state, "Bob");

        // Declared size over the cap: refused before any decoding
        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::File {
                filename: "huge.bin".to_string(),
                filetype: "application/pdf".to_string(),
                size: 15 * 1024 * 1024,
                data: "AAAA".to_string(),
            },
        )
        .await;
        // Declared size wider than 32 bits must not wrap past the cap check
        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::File {
                filename: "huger.bin".to_string(),
                filetype: "application/pdf".to_string(),
                size: (1u64 << 32) + 1024,
                data: "AAAA".to_string(),
            },
        )
        .await;
        // Disallowed MIME type
        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::File {
                filename: "run.exe".to_string(),
                filetype: "application/x-msdownload".to_string(),
                size: 4,
                data: "AAAA".to_string(),
            },
        )
        .await;
        // Garbage base64
        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::File {
                filename: "note.txt".to_string(),
                filetype: "text/plain".to_string(),
                size: 4,
                data: "!!!not-base64!!!".to_string(),
            },
        )
        .await;

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 4);
        assert!(matches!(
            &frames[0],
            ServerMessage::System { text } if text.contains("too large")
        ));
        assert!(matches!(
            &frames[1],
            ServerMessage::System { text } if text.contains("too large")
        ));
        assert!(matches!(
            &frames[2],
            ServerMessage::System { text } if text.contains("not allowed")
        ));
        assert!(matches!(frames[3], ServerMessage::Error { .. }));

        // No bystander broadcast, no persistence
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(state.store.message_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_individual_call_flow() {
        let state = test_state();
        let (sess_a, _user_a, mut rx_a) = connect(&state, "Alice");
        let (sess_b, user_b, mut rx_b) = connect(&state, "Bob");
        let (_sess_c, _user_c, mut rx_c) = connect(&state, "Carol");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::CreateRoom {
                target_user_id: Some(user_b),
            },
        )
        .await;

        let frames = drain(&mut rx_a);
        let room_id = match &frames[0] {
            ServerMessage::CallStarted {
                room_id,
                target_user_name,
            } => {
                assert_eq!(target_user_name, "Bob");
                room_id.clone()
            }
            other => panic!("Expected CallStarted, got {:?}", other),
        };

        // Only the target rings
        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ServerMessage::CallInvite { room_id: r, from_user_name, is_group_call }
                if r == &room_id && from_user_name == "Alice" && !*is_group_call
        ));
        assert!(drain(&mut rx_c).is_empty());

        // Bob joins: Alice hears user_joined, Bob receives the member list
        handle_client_message(
            &state,
            &sess_b,
            ClientMessage::JoinRoom {
                room_id: room_id.clone(),
            },
        )
        .await;

        let frames = drain(&mut rx_a);
        assert!(matches!(
            &frames[0],
            ServerMessage::UserJoined { session_id, user_name, .. }
                if session_id == &sess_b && user_name == "Bob"
        ));
        let frames = drain(&mut rx_b);
        match &frames[0] {
            ServerMessage::RoomUsers { users, .. } => {
                assert_eq!(users.len(), 2);
                assert!(users.iter().any(|u| u.session_id == sess_a));
                assert!(users.iter().any(|u| u.session_id == sess_b));
            }
            other => panic!("Expected RoomUsers, got {:?}", other),
        }

        // Signaling relays verbatim with the sender's session attached
        let offer = json!({"type": "offer", "sdp": "v=0"});
        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::WebrtcOffer {
                room_id: room_id.clone(),
                target_session_id: sess_b.clone(),
                offer: offer.clone(),
            },
        )
        .await;
        let frames = drain(&mut rx_b);
        assert!(matches!(
            &frames[0],
            ServerMessage::WebrtcOffer { from_session_id, offer: relayed, .. }
                if from_session_id == &sess_a && relayed == &offer
        ));

        handle_client_message(
            &state,
            &sess_b,
            ClientMessage::WebrtcAnswer {
                room_id: room_id.clone(),
                target_session_id: sess_a.clone(),
                answer: json!({"type": "answer"}),
            },
        )
        .await;
        let frames = drain(&mut rx_a);
        assert!(matches!(
            &frames[0],
            ServerMessage::WebrtcAnswer { from_session_id, .. } if from_session_id == &sess_b
        ));

        // Hanging up ends it for both and purges the room
        handle_client_message(
            &state,
            &sess_b,
            ClientMessage::EndCall {
                room_id: room_id.clone(),
            },
        )
        .await;
        for rx in [&mut rx_a, &mut rx_b] {
            let frames = drain(rx);
            assert!(matches!(
                &frames[0],
                ServerMessage::CallEnded { ended_by, .. } if ended_by == "Bob"
            ));
        }
        assert!(state.get_room(&room_id).is_none());
    }

    #[tokio::test]
    async fn test_group_call_flow() {
        let state = test_state();
        let (sess_a, _user_a, mut rx_a) = connect(&state, "Alice");
        let (sess_b, _user_b, mut rx_b) = connect(&state, "Bob");
        let (sess_c, _user_c, mut rx_c) = connect(&state, "Carol");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::CreateRoom {
                target_user_id: None,
            },
        )
        .await;

        let frames = drain(&mut rx_a);
        let room_id = match &frames[0] {
            ServerMessage::RoomCreated { room_id, .. } => room_id.clone(),
            other => panic!("Expected RoomCreated, got {:?}", other),
        };

        // Every other session is invited
        for rx in [&mut rx_b, &mut rx_c] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert!(matches!(
                &frames[0],
                ServerMessage::CallInvite { room_id: r, is_group_call, .. }
                    if r == &room_id && *is_group_call
            ));
        }

        handle_client_message(
            &state,
            &sess_b,
            ClientMessage::JoinRoom {
                room_id: room_id.clone(),
            },
        )
        .await;
        handle_client_message(
            &state,
            &sess_c,
            ClientMessage::JoinRoom {
                room_id: room_id.clone(),
            },
        )
        .await;

        // Carol joined last and got a three-member list
        let frames = drain(&mut rx_c);
        match frames
            .iter()
            .find(|f| matches!(f, ServerMessage::RoomUsers { .. }))
            .unwrap()
        {
            ServerMessage::RoomUsers { users, .. } => assert_eq!(users.len(), 3),
            _ => unreachable!(),
        }
        // Bob heard about Carol
        let frames = drain(&mut rx_b);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::UserJoined { session_id, .. } if session_id == &sess_c
        )));

        // Carol leaves; the others are told
        handle_client_message(
            &state,
            &sess_c,
            ClientMessage::LeaveRoom {
                room_id: room_id.clone(),
            },
        )
        .await;
        for rx in [&mut rx_a, &mut rx_b] {
            let frames = drain(rx);
            assert!(frames.iter().any(|f| matches!(
                f,
                ServerMessage::UserLeft { session_id, .. } if session_id == &sess_c
            )));
        }

        assert_eq!(state.room_members(&room_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_call_rejected_notifies_caller_and_purges() {
        let state = test_state();
        let (sess_a, _user_a, mut rx_a) = connect(&state, "Alice");
        let (sess_b, user_b, mut rx_b) = connect(&state, "Bob");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::CreateRoom {
                target_user_id: Some(user_b),
            },
        )
        .await;
        let room_id = match &drain(&mut rx_a)[0] {
            ServerMessage::CallStarted { room_id, .. } => room_id.clone(),
            other => panic!("Expected CallStarted, got {:?}", other),
        };
        drain(&mut rx_b);

        handle_client_message(
            &state,
            &sess_b,
            ClientMessage::CallRejected {
                room_id: room_id.clone(),
            },
        )
        .await;

        let frames = drain(&mut rx_a);
        assert!(matches!(
            &frames[0],
            ServerMessage::CallRejected { user_name, .. } if user_name == "Bob"
        ));
        // Nobody else had joined, so the room is gone
        assert!(state.get_room(&room_id).is_none());
    }

    #[tokio::test]
    async fn test_call_rejected_by_member_refused() {
        let state = test_state();
        let (sess_a, _user_a, mut rx_a) = connect(&state, "Alice");
        let (sess_b, user_b, mut rx_b) = connect(&state, "Bob");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::CreateRoom {
                target_user_id: Some(user_b),
            },
        )
        .await;
        let room_id = match &drain(&mut rx_a)[0] {
            ServerMessage::CallStarted { room_id, .. } => room_id.clone(),
            other => panic!("Expected CallStarted, got {:?}", other),
        };
        drain(&mut rx_b);

        handle_client_message(
            &state,
            &sess_b,
            ClientMessage::JoinRoom {
                room_id: room_id.clone(),
            },
        )
        .await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        // A member's reject frame is refused and the call survives
        handle_client_message(
            &state,
            &sess_b,
            ClientMessage::CallRejected {
                room_id: room_id.clone(),
            },
        )
        .await;

        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ServerMessage::Error { .. }));
        assert!(drain(&mut rx_a).is_empty());
        assert!(state.get_room(&room_id).is_some());
    }

    #[tokio::test]
    async fn test_webrtc_relay_respects_membership() {
        let state = test_state();
        let (sess_a, _user_a, mut rx_a) = connect(&state, "Alice");
        let (sess_b, user_b, mut rx_b) = connect(&state, "Bob");
        let (sess_c, _user_c, mut rx_c) = connect(&state, "Carol");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::CreateRoom {
                target_user_id: Some(user_b),
            },
        )
        .await;
        let room_id = match &drain(&mut rx_a)[0] {
            ServerMessage::CallStarted { room_id, .. } => room_id.clone(),
            other => panic!("Expected CallStarted, got {:?}", other),
        };
        handle_client_message(
            &state,
            &sess_b,
            ClientMessage::JoinRoom {
                room_id: room_id.clone(),
            },
        )
        .await;
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        // Non-member sender: dropped without any response
        handle_client_message(
            &state,
            &sess_c,
            ClientMessage::WebrtcOffer {
                room_id: room_id.clone(),
                target_session_id: sess_a.clone(),
                offer: json!({"type": "offer"}),
            },
        )
        .await;
        // Non-member target: dropped without any response
        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::WebrtcIceCandidate {
                room_id: room_id.clone(),
                target_session_id: sess_c.clone(),
                candidate: json!({"candidate": "candidate:1"}),
            },
        )
        .await;

        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_ice_relay_is_harmless() {
        let state = test_state();
        let (sess_a, _user_a, mut rx_a) = connect(&state, "Alice");
        let (sess_b, user_b, mut rx_b) = connect(&state, "Bob");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::CreateRoom {
                target_user_id: Some(user_b),
            },
        )
        .await;
        let room_id = match &drain(&mut rx_a)[0] {
            ServerMessage::CallStarted { room_id, .. } => room_id.clone(),
            other => panic!("Expected CallStarted, got {:?}", other),
        };
        handle_client_message(
            &state,
            &sess_b,
            ClientMessage::JoinRoom {
                room_id: room_id.clone(),
            },
        )
        .await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        // A retransmitted candidate relays twice; the room is untouched
        let candidate = ClientMessage::WebrtcIceCandidate {
            room_id: room_id.clone(),
            target_session_id: sess_b.clone(),
            candidate: json!({"candidate": "candidate:1 1 UDP 2122260223"}),
        };
        handle_client_message(&state, &sess_a, candidate.clone()).await;
        handle_client_message(&state, &sess_a, candidate).await;

        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 2);
        assert_eq!(state.room_members(&room_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_room_requests() {
        let state = test_state();
        let (sess_a, _user_a, mut rx_a) = connect(&state, "Alice");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::JoinRoom {
                room_id: "nonexistent".to_string(),
            },
        )
        .await;
        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::GetRoomUsers {
                room_id: "nonexistent".to_string(),
            },
        )
        .await;
        // Leaving an unknown room is a silent no-op
        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::LeaveRoom {
                room_id: "nonexistent".to_string(),
            },
        )
        .await;

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 2);
        assert!(frames
            .iter()
            .all(|f| matches!(f, ServerMessage::Error { .. })));
    }

    #[tokio::test]
    async fn test_get_active_calls_snapshot() {
        let state = test_state();
        let (sess_a, _user_a, mut rx_a) = connect(&state, "Alice");
        let (sess_b, _user_b, mut rx_b) = connect(&state, "Bob");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::CreateRoom {
                target_user_id: None,
            },
        )
        .await;
        let room_id = match &drain(&mut rx_a)[0] {
            ServerMessage::RoomCreated { room_id, .. } => room_id.clone(),
            other => panic!("Expected RoomCreated, got {:?}", other),
        };
        drain(&mut rx_b);

        handle_client_message(&state, &sess_b, ClientMessage::GetActiveCalls).await;
        let frames = drain(&mut rx_b);
        match &frames[0] {
            ServerMessage::ActiveCalls { calls } => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].room_id, room_id);
                assert_eq!(calls[0].creator_name, "Alice");
                assert_eq!(calls[0].participants_count, 1);
            }
            other => panic!("Expected ActiveCalls, got {:?}", other),
        }

        // Ended rooms never show up again
        handle_client_message(&state, &sess_a, ClientMessage::EndCall { room_id }).await;
        handle_client_message(&state, &sess_b, ClientMessage::GetActiveCalls).await;
        let frames = drain(&mut rx_b);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::ActiveCalls { calls } if calls.is_empty()
        )));
    }

    #[tokio::test]
    async fn test_disconnect_cleanup_leaves_rooms() {
        let state = test_state();
        let (sess_a, _user_a, _rx_a) = connect(&state, "Alice");
        let (sess_b, _user_b, mut rx_b) = connect(&state, "Bob");

        handle_client_message(
            &state,
            &sess_a,
            ClientMessage::CreateRoom {
                target_user_id: None,
            },
        )
        .await;
        let room_id = match state.active_calls().first() {
            Some(call) => call.room_id.clone(),
            None => panic!("Expected a live room"),
        };
        handle_client_message(
            &state,
            &sess_b,
            ClientMessage::JoinRoom {
                room_id: room_id.clone(),
            },
        )
        .await;
        drain(&mut rx_b);

        // Alice's transport dies: claim the slot and run cleanup
        let handle = state.unregister_session(&sess_a).unwrap();
        cleanup_session(&state, &sess_a, &handle);

        let frames = drain(&mut rx_b);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::UserLeft { session_id, .. } if session_id == &sess_a
        )));
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::System { text } if text.contains("left the chat")
        )));
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::Users { users } if !users.iter().any(|u| u.name == "Alice")
        )));

        // Bob was the only member left, so the room is purged
        assert!(state.get_room(&room_id).is_none());
        assert!(state.active_calls().is_empty());

        // The session row is closed; a second claim never happens
        let open: Vec<String> = state
            .store
            .open_sessions()
            .unwrap()
            .into_iter()
            .map(|r| r.session_id)
            .collect();
        assert!(!open.contains(&sess_a));
        assert!(state.unregister_session(&sess_a).is_none());
    }
}
