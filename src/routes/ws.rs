use crate::calls::CallCoordinator;
use crate::config::Config;
use crate::crypto;
use crate::db::Db;
use crate::events::{EventBus, PushEvent};
use crate::hub::{Hub, SessionHandle};
use crate::models::VoiceState;
use crate::permissions::{self, Permissions};
use crate::routes::{self, ApiError};
use crate::voice::VoiceRegistry;
use futures::{SinkExt, StreamExt};
use rocket::{get, State};
use rocket_ws as ws;
use rusqlite::params;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Reader deadline; three missed 30-second heartbeats.
const READ_DEADLINE_SECS: u64 = 90;

struct WsContext {
    db: Db,
    hub: Arc<Hub>,
    voice: Arc<VoiceRegistry>,
    calls: Arc<CallCoordinator>,
    sender: broadcast::Sender<PushEvent>,
}

impl WsContext {
    fn publish(&self, event: PushEvent) {
        let _ = self.sender.send(event);
    }
}

struct ConnectedUser {
    id: String,
    username: String,
    display_name: String,
    avatar_url: Option<String>,
    status: String,
}

/// The long-lived push channel. The token rides the query string since
/// browsers cannot set headers on a socket upgrade.
#[get("/ws?<token>")]
pub fn ws_connect(
    socket: ws::WebSocket,
    token: &str,
    db: &State<Db>,
    config: &State<Config>,
    events: &State<EventBus>,
    hub: &State<Arc<Hub>>,
    voice: &State<Arc<VoiceRegistry>>,
    calls: &State<Arc<CallCoordinator>>,
) -> Result<ws::Channel<'static>, ApiError> {
    let Some(claims) = crypto::verify_jwt(token, &config.token_secret) else {
        return Err(routes::unauthenticated());
    };
    let Some(user_id) = claims.get("sub").and_then(|v| v.as_str()).map(String::from) else {
        return Err(routes::unauthenticated());
    };

    let (user, server_ids, ready_servers) = {
        let conn = db.conn();
        let user = conn
            .query_row(
                "SELECT id, username, display_name, avatar_url, status FROM users WHERE id = ?1",
                params![&user_id],
                |row| {
                    Ok(ConnectedUser {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        display_name: row.get(2)?,
                        avatar_url: row.get(3)?,
                        status: row.get(4)?,
                    })
                },
            )
            .map_err(|_| routes::unauthenticated())?;
        let server_ids: HashSet<String> =
            routes::member_server_ids(&conn, &user.id).into_iter().collect();
        let ready_servers: Vec<crate::models::Server> = server_ids
            .iter()
            .filter_map(|sid| crate::routes::servers::load_server(&conn, sid).ok())
            .collect();
        (user, server_ids, ready_servers)
    };

    let ctx = WsContext {
        db: db.inner().clone(),
        hub: hub.inner().clone(),
        voice: voice.inner().clone(),
        calls: calls.inner().clone(),
        sender: events.sender.clone(),
    };

    Ok(socket.channel(move |stream| {
        Box::pin(async move {
            let session_id = crypto::generate_id();
            let invisible = user.status == "offline";
            let (handle, mut outbound, first_session) =
                ctx.hub
                    .register(&session_id, &user.id, invisible, server_ids);

            // Presence transition happens on the first session only.
            if first_session && !invisible {
                ctx.publish(PushEvent::PresenceUpdate {
                    user_id: user.id.clone(),
                    status: user.status.clone(),
                });
            }

            handle.send(
                "ready",
                &json!({
                    "user_id": user.id,
                    "servers": ready_servers,
                    "online_user_ids": ctx.hub.online_visible_users(),
                }),
            );
            handle.send("voice_states_sync", &json!(ctx.voice.snapshot()));

            let (mut sink, mut source) = stream.split();

            // Writer task: sole owner of the socket's write half. Session
            // order is the queue order.
            let writer_handle = {
                let handle = handle.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            frame = outbound.recv() => match frame {
                                Some(text) => {
                                    if sink.send(ws::Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            },
                            _ = handle.closed() => break,
                        }
                    }
                    let _ = sink.close().await;
                })
            };

            // Reader loop: frames in, deadline enforced per read.
            loop {
                let next = tokio::time::timeout(Duration::from_secs(READ_DEADLINE_SECS), source.next());
                tokio::select! {
                    _ = handle.closed() => break,
                    read = next => match read {
                        Err(_elapsed) => break,
                        Ok(None) => break,
                        Ok(Some(Err(_))) => break,
                        Ok(Some(Ok(ws::Message::Close(_)))) => break,
                        Ok(Some(Ok(ws::Message::Text(text)))) => {
                            handle_client_frame(&ctx, &handle, &user, &text);
                        }
                        Ok(Some(Ok(_))) => {}
                    },
                }
            }

            // Disconnect cleanup, every step idempotent: registry, voice,
            // calls, presence — in that order.
            let was_last = ctx.hub.unregister(&session_id);
            if let Some(state) = ctx.voice.leave(&user.id) {
                ctx.publish(PushEvent::VoiceStateUpdate {
                    action: "leave".to_string(),
                    state,
                });
            }
            ctx.calls.end_for_user(&user.id);
            if was_last && !invisible {
                ctx.publish(PushEvent::PresenceUpdate {
                    user_id: user.id.clone(),
                    status: "offline".to_string(),
                });
            }

            handle.close();
            let _ = writer_handle.await;
            Ok(())
        })
    }))
}

fn handle_client_frame(ctx: &WsContext, handle: &Arc<SessionHandle>, user: &ConnectedUser, text: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        eprintln!("⚠️ Discarding malformed push frame from {}", user.username);
        return;
    };
    let op = frame.get("op").and_then(|v| v.as_str()).unwrap_or("");
    let d = frame.get("d").cloned().unwrap_or(Value::Null);

    match op {
        "heartbeat" => {
            handle.send("heartbeat_ack", &json!({}));
        }
        "typing" => handle_typing(ctx, user, &d),
        "presence_update" => handle_presence(ctx, user, &d),
        "voice_join" => handle_voice_join(ctx, user, &d),
        "voice_leave" => {
            if let Some(state) = ctx.voice.leave(&user.id) {
                ctx.publish(PushEvent::VoiceStateUpdate {
                    action: "leave".to_string(),
                    state,
                });
            }
        }
        "voice_state_update_request" => {
            let mute = d.get("mute").and_then(|v| v.as_bool());
            let deafen = d.get("deafen").and_then(|v| v.as_bool());
            let streaming = d.get("streaming").and_then(|v| v.as_bool());
            if let Some(state) = ctx.voice.mutate(&user.id, mute, deafen, streaming) {
                ctx.publish(PushEvent::VoiceStateUpdate {
                    action: "update".to_string(),
                    state,
                });
            }
        }
        "p2p_call_initiate" => handle_call_initiate(ctx, user, &d),
        "p2p_call_accept" => {
            if let Some(call_id) = d.get("call_id").and_then(|v| v.as_str())
                && let Err(e) = ctx.calls.accept(call_id, &user.id)
            {
                eprintln!("⚠️ p2p_call_accept from {} rejected: {e:?}", user.username);
            }
        }
        "p2p_call_decline" => {
            if let Some(call_id) = d.get("call_id").and_then(|v| v.as_str())
                && let Err(e) = ctx.calls.decline(call_id, &user.id)
            {
                eprintln!("⚠️ p2p_call_decline from {} rejected: {e:?}", user.username);
            }
        }
        "p2p_call_end" => {
            if let Some(call_id) = d.get("call_id").and_then(|v| v.as_str())
                && let Err(e) = ctx.calls.end(call_id, &user.id)
            {
                eprintln!("⚠️ p2p_call_end from {} rejected: {e:?}", user.username);
            }
        }
        "p2p_signal" => handle_signal(ctx, user, &d),
        other => {
            eprintln!("⚠️ Unknown push op '{other}' from {}", user.username);
        }
    }
}

fn handle_typing(ctx: &WsContext, user: &ConnectedUser, d: &Value) {
    let Some(channel_id) = d.get("channel_id").and_then(|v| v.as_str()) else {
        return;
    };
    let server_id: Option<String> = {
        let conn = ctx.db.conn();
        conn.query_row(
            "SELECT server_id FROM channels WHERE id = ?1",
            params![channel_id],
            |r| r.get(0),
        )
        .ok()
    };
    let Some(server_id) = server_id else { return };
    let is_member = {
        let conn = ctx.db.conn();
        routes::require_member(&conn, &server_id, &user.id).is_ok()
    };
    if !is_member {
        return;
    }
    if ctx.hub.typing_should_emit(channel_id, &user.id) {
        ctx.publish(PushEvent::TypingStart {
            server_id,
            channel_id: channel_id.to_string(),
            user_id: user.id.clone(),
            username: user.username.clone(),
        });
    }
}

fn handle_presence(ctx: &WsContext, user: &ConnectedUser, d: &Value) {
    let Some(status) = d.get("status").and_then(|v| v.as_str()) else {
        return;
    };
    if !crate::routes::users::PRESENCE_STATUSES.contains(&status) {
        eprintln!("⚠️ Unknown presence status '{status}' from {}", user.username);
        return;
    }
    {
        let conn = ctx.db.conn();
        conn.execute(
            "UPDATE users SET status = ?1 WHERE id = ?2",
            params![status, &user.id],
        )
        .ok();
    }
    ctx.publish(PushEvent::PresenceUpdate {
        user_id: user.id.clone(),
        status: status.to_string(),
    });
}

fn handle_voice_join(ctx: &WsContext, user: &ConnectedUser, d: &Value) {
    let Some(channel_id) = d.get("channel_id").and_then(|v| v.as_str()) else {
        return;
    };

    let admitted: Option<VoiceState> = {
        let conn = ctx.db.conn();
        let channel: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT server_id, channel_type, user_limit FROM channels WHERE id = ?1",
                params![channel_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .ok();
        match channel {
            Some((server_id, channel_type, user_limit)) if channel_type == "voice" => {
                let member_ok = routes::require_member(&conn, &server_id, &user.id).is_ok();
                let perms = permissions::effective(&conn, &server_id, &user.id, Some(channel_id));
                let already_there = ctx
                    .voice
                    .get(&user.id)
                    .map(|s| s.channel_id == channel_id)
                    .unwrap_or(false);
                let full = user_limit > 0
                    && !already_there
                    && ctx.voice.channel_occupancy(channel_id) as i64 >= user_limit;
                if member_ok && perms.contains(Permissions::CONNECT_VOICE) && !full {
                    Some(VoiceState {
                        user_id: user.id.clone(),
                        channel_id: channel_id.to_string(),
                        server_id,
                        mute: d.get("mute").and_then(|v| v.as_bool()).unwrap_or(false),
                        deafen: d.get("deafen").and_then(|v| v.as_bool()).unwrap_or(false),
                        streaming: false,
                        server_mute: false,
                        server_deafen: false,
                        username: user.username.clone(),
                        display_name: user.display_name.clone(),
                        avatar_url: user.avatar_url.clone(),
                    })
                } else {
                    None
                }
            }
            _ => None,
        }
    };

    let Some(state) = admitted else {
        eprintln!("⚠️ voice_join rejected for {}", user.username);
        return;
    };

    if let Some(prior) = ctx.voice.join(state.clone()) {
        ctx.publish(PushEvent::VoiceStateUpdate {
            action: "leave".to_string(),
            state: prior,
        });
    }
    ctx.publish(PushEvent::VoiceStateUpdate {
        action: "join".to_string(),
        state,
    });
}

fn handle_call_initiate(ctx: &WsContext, user: &ConnectedUser, d: &Value) {
    let Some(receiver_id) = d.get("user_id").and_then(|v| v.as_str()) else {
        return;
    };
    let call_type = d.get("call_type").and_then(|v| v.as_str()).unwrap_or("voice");
    if !matches!(call_type, "voice" | "video") || receiver_id == user.id {
        return;
    }
    {
        let conn = ctx.db.conn();
        let target_exists = routes::load_profile(&conn, receiver_id).is_ok();
        if !target_exists || routes::is_blocked(&conn, &user.id, receiver_id) {
            eprintln!("⚠️ p2p_call_initiate rejected for {}", user.username);
            return;
        }
    }
    if let Err(e) = ctx.calls.initiate(&user.id, receiver_id, call_type) {
        eprintln!("⚠️ p2p_call_initiate from {} rejected: {e:?}", user.username);
    }
}

fn handle_signal(ctx: &WsContext, user: &ConnectedUser, d: &Value) {
    let (Some(call_id), Some(data)) = (d.get("call_id").and_then(|v| v.as_str()), d.get("data"))
    else {
        return;
    };
    // Relayed to the counterpart only; the payload is opaque SDP/ICE.
    let Some(other) = ctx.calls.counterpart(call_id, &user.id) else {
        return;
    };
    ctx.publish(PushEvent::P2pSignal {
        to_user: other,
        from_user: user.id.clone(),
        call_id: call_id.to_string(),
        data: data.clone(),
    });
}
