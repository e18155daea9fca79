use crate::config::Config;
use crate::crypto;
use crate::db::{self, now_ts, Db};
use crate::events::{order_pair, EventBus, PushEvent};
use crate::models::*;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::routes::{self, ApiError, AuthUser};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rocket::serde::json::Json;
use rocket::{delete, get, patch, post, State};
use rusqlite::{params, Connection};

struct DmChannelRow {
    id: String,
    user_low: String,
    user_high: String,
}

fn load_dm_channel(conn: &Connection, channel_id: &str) -> Result<DmChannelRow, ApiError> {
    conn.query_row(
        "SELECT id, user_low, user_high FROM dm_channels WHERE id = ?1",
        params![channel_id],
        |row| {
            Ok(DmChannelRow {
                id: row.get(0)?,
                user_low: row.get(1)?,
                user_high: row.get(2)?,
            })
        },
    )
    .map_err(|_| routes::not_found_err("DM channel not found"))
}

fn require_participant(channel: &DmChannelRow, user_id: &str) -> Result<(), ApiError> {
    if channel.user_low == user_id || channel.user_high == user_id {
        Ok(())
    } else {
        Err(routes::not_found_err("DM channel not found"))
    }
}

fn other_of(channel: &DmChannelRow, user_id: &str) -> String {
    if channel.user_low == user_id {
        channel.user_high.clone()
    } else {
        channel.user_low.clone()
    }
}

fn dm_attachments(conn: &Connection, message_id: &str) -> Vec<Attachment> {
    conn.prepare(
        "SELECT id, filename, url, size, mime FROM dm_attachments WHERE message_id = ?1",
    )
    .and_then(|mut stmt| {
        let rows = stmt
            .query_map(params![message_id], |row| {
                Ok(Attachment {
                    id: row.get(0)?,
                    filename: row.get(1)?,
                    url: row.get(2)?,
                    size: row.get(3)?,
                    mime: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    })
    .unwrap_or_default()
}

pub(crate) fn assemble_dm_message(
    conn: &Connection,
    message_id: &str,
) -> Result<DmMessage, ApiError> {
    let (mut message, reply_to_id) = conn
        .query_row(
            "SELECT m.id, m.channel_id, m.content, m.created_at, m.edited_at,
                    m.reply_to_id, m.is_pinned, m.seq,
                    u.id, u.username, u.display_name, u.avatar_url, u.status, u.custom_status
             FROM dm_messages m JOIN users u ON u.id = m.author_id
             WHERE m.id = ?1",
            params![message_id],
            |row| {
                let reply_to_id: Option<String> = row.get(5)?;
                Ok((
                    DmMessage {
                        id: row.get(0)?,
                        channel_id: row.get(1)?,
                        content: row.get(2)?,
                        created_at: row.get(3)?,
                        edited_at: row.get(4)?,
                        reply_to: None,
                        is_pinned: row.get::<_, i64>(6)? != 0,
                        seq: row.get(7)?,
                        author: UserProfile {
                            id: row.get(8)?,
                            username: row.get(9)?,
                            display_name: row.get(10)?,
                            avatar_url: row.get(11)?,
                            status: row.get(12)?,
                            custom_status: row.get(13)?,
                        },
                        attachments: Vec::new(),
                        reactions: Vec::new(),
                    },
                    reply_to_id,
                ))
            },
        )
        .map_err(|_| routes::not_found_err("Message not found"))?;

    if let Some(ref reply_id) = reply_to_id {
        message.reply_to = conn
            .query_row(
                "SELECT id, author_id, content FROM dm_messages WHERE id = ?1",
                params![reply_id],
                |row| {
                    Ok(ReplyPreview {
                        id: row.get(0)?,
                        author_id: row.get(1)?,
                        content: row.get(2)?,
                    })
                },
            )
            .ok();
    }
    message.attachments = dm_attachments(conn, &message.id);
    message.reactions =
        crate::routes::messages::reaction_summaries(conn, "dm_reactions", &message.id);
    Ok(message)
}

fn dm_event_pair(channel: &DmChannelRow) -> (String, String) {
    (channel.user_low.clone(), channel.user_high.clone())
}

// --- Channel open & listing ---

#[post("/api/v1/dms", format = "json", data = "<body>")]
pub fn open_dm(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    body: Json<OpenDmRequest>,
) -> Result<Json<ApiOk<DmChannel>>, ApiError> {
    let target_id = body.user_id.trim().to_string();
    if target_id == user.id {
        return Err(routes::validation("Cannot open a DM with yourself"));
    }

    let (view, created, low_profile, high_profile, channel_id) = {
        let conn = db.conn();
        routes::load_profile(&conn, &target_id)?;
        if routes::is_blocked(&conn, &user.id, &target_id) {
            return Err(routes::forbidden());
        }

        let (low, high) = order_pair(&user.id, &target_id);
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM dm_channels WHERE user_low = ?1 AND user_high = ?2",
                params![low, high],
                |r| r.get(0),
            )
            .ok();
        let (channel_id, created) = match existing {
            Some(id) => (id, false),
            None => {
                let id = crypto::generate_id();
                conn.execute(
                    "INSERT INTO dm_channels (id, user_low, user_high, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![&id, low, high, now_ts()],
                )
                .map_err(routes::internal)?;
                (id, true)
            }
        };

        let view = dm_channel_view(&conn, &channel_id, &user.id)?;
        let low_profile = routes::load_profile(&conn, low)?;
        let high_profile = routes::load_profile(&conn, high)?;
        (view, created, low_profile, high_profile, channel_id)
    };

    if created {
        events.publish(PushEvent::DmChannelCreate {
            user_low: low_profile.id.clone(),
            user_high: high_profile.id.clone(),
            payload: serde_json::json!({
                "id": channel_id,
                "users": [low_profile, high_profile],
            }),
        });
    }
    Ok(ok(view))
}

fn dm_channel_view(
    conn: &Connection,
    channel_id: &str,
    viewer: &str,
) -> Result<DmChannel, ApiError> {
    let channel = load_dm_channel(conn, channel_id)?;
    let other = other_of(&channel, viewer);
    let (created_at, last_message_at): (String, Option<String>) = conn
        .query_row(
            "SELECT created_at, last_message_at FROM dm_channels WHERE id = ?1",
            params![channel_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(routes::internal)?;
    let unread: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM dm_messages msg
             WHERE msg.channel_id = ?1 AND msg.author_id != ?2
               AND msg.created_at > COALESCE(
                   (SELECT rs.last_read_at FROM dm_read_states rs
                    WHERE rs.user_id = ?2 AND rs.channel_id = ?1), '')",
            params![channel_id, viewer],
            |r| r.get(0),
        )
        .unwrap_or(0);
    Ok(DmChannel {
        id: channel.id,
        other_user: routes::load_profile(conn, &other)?,
        last_message_at,
        unread_count: unread,
        created_at,
    })
}

#[get("/api/v1/dms")]
pub fn list_dms(db: &State<Db>, user: AuthUser) -> Result<Json<ApiOk<Vec<DmChannel>>>, ApiError> {
    let conn = db.conn();
    let ids: Vec<String> = conn
        .prepare(
            "SELECT id FROM dm_channels WHERE user_low = ?1 OR user_high = ?1
             ORDER BY COALESCE(last_message_at, created_at) DESC",
        )
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map(params![&user.id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .unwrap_or_default();
    let channels: Vec<DmChannel> = ids
        .iter()
        .filter_map(|id| dm_channel_view(&conn, id, &user.id).ok())
        .collect();
    Ok(ok(channels))
}

// --- Messages ---

#[post("/api/v1/dms/<channel_id>/messages", format = "json", data = "<body>")]
pub fn send_dm_message(
    db: &State<Db>,
    config: &State<Config>,
    events: &State<EventBus>,
    rate_limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    user: AuthUser,
    channel_id: &str,
    body: Json<SendMessageRequest>,
) -> Result<Json<ApiOk<DmMessage>>, ApiError> {
    let rl = rate_limiter.check(
        &format!("send_dm:{}", user.id),
        rate_config.dms_max,
        rate_config.dms_window_secs,
    );
    if !rl.allowed {
        return Err(routes::rate_limited(&rl, "Too many direct messages"));
    }

    let content = body
        .content
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);
    match content {
        Some(ref c) if c.chars().count() > crate::routes::messages::MAX_CONTENT_CHARS => {
            return Err(routes::validation("Content must be 1-2000 characters"));
        }
        None if body.attachments.is_empty() => {
            return Err(routes::validation(
                "Content is required when no attachments are present",
            ));
        }
        _ => {}
    }

    let mut decoded: Vec<(String, String, Vec<u8>)> = Vec::new();
    for upload in &body.attachments {
        let bytes = BASE64
            .decode(upload.data.as_bytes())
            .map_err(|_| routes::validation("Attachment data must be valid base64"))?;
        if bytes.is_empty() || bytes.len() > config.upload_max_bytes {
            return Err(routes::validation("Attachment exceeds the upload size limit"));
        }
        decoded.push((upload.filename.clone(), upload.mime.clone(), bytes));
    }

    let (message, pair) = {
        let mut conn = db.conn();
        let channel = load_dm_channel(&conn, channel_id)?;
        require_participant(&channel, &user.id)?;
        let other = other_of(&channel, &user.id);
        if routes::is_blocked(&conn, &user.id, &other) {
            return Err(routes::forbidden());
        }

        let reply_to = body
            .reply_to_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);
        if let Some(ref reply_id) = reply_to {
            let in_channel: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM dm_messages WHERE id = ?1 AND channel_id = ?2",
                    params![reply_id, channel_id],
                    |r| r.get(0),
                )
                .unwrap_or(0);
            if in_channel == 0 {
                return Err(routes::validation(
                    "Replied-to message is not in this channel",
                ));
            }
        }

        let stored: Vec<(String, String, String, i64)> = decoded
            .iter()
            .map(|(filename, mime, bytes)| {
                crate::routes::messages::store_upload(config, filename, bytes)
                    .map(|url| (filename.clone(), mime.clone(), url, bytes.len() as i64))
            })
            .collect::<Result<_, _>>()?;

        let id = crypto::generate_id();
        let now = now_ts();
        let tx = conn.transaction().map_err(routes::internal)?;
        let seq = db::next_seq(&tx);
        tx.execute(
            "INSERT INTO dm_messages (id, channel_id, author_id, content, created_at,
                                      reply_to_id, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![&id, channel_id, &user.id, &content, &now, &reply_to, seq],
        )
        .map_err(routes::internal)?;
        for (filename, mime, url, size) in &stored {
            tx.execute(
                "INSERT INTO dm_attachments (id, message_id, filename, url, size, mime)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![crypto::generate_id(), &id, filename, url, size, mime],
            )
            .map_err(routes::internal)?;
        }
        tx.execute(
            "UPDATE dm_channels SET last_message_at = ?1 WHERE id = ?2",
            params![&now, channel_id],
        )
        .map_err(routes::internal)?;
        db::upsert_dm_fts(&tx, &id);
        tx.commit().map_err(routes::internal)?;

        (assemble_dm_message(&conn, &id)?, dm_event_pair(&channel))
    };

    events.publish(PushEvent::DmMessageCreate {
        user_low: pair.0,
        user_high: pair.1,
        message: message.clone(),
    });
    Ok(ok(message))
}

#[get("/api/v1/dms/<channel_id>/messages?<before>&<limit>")]
pub fn get_dm_messages(
    db: &State<Db>,
    user: AuthUser,
    channel_id: &str,
    before: Option<&str>,
    limit: Option<i64>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let conn = db.conn();
    let channel = load_dm_channel(&conn, channel_id)?;
    require_participant(&channel, &user.id)?;

    let limit = limit
        .unwrap_or(50)
        .clamp(1, crate::routes::messages::PAGE_LIMIT_MAX);
    let anchor_seq: Option<i64> = match before {
        Some(anchor_id) => match conn
            .query_row(
                "SELECT seq FROM dm_messages WHERE id = ?1 AND channel_id = ?2",
                params![anchor_id, channel_id],
                |r| r.get(0),
            )
            .ok()
        {
            Some(s) => Some(s),
            None => return Err(routes::not_found_err("Anchor message not found")),
        },
        None => None,
    };

    let ids: Vec<String> = match anchor_seq {
        Some(anchor) => conn
            .prepare(
                "SELECT id FROM dm_messages WHERE channel_id = ?1 AND seq < ?2
                 ORDER BY seq DESC LIMIT ?3",
            )
            .and_then(|mut stmt| {
                let rows = stmt
                    .query_map(params![channel_id, anchor, limit + 1], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .unwrap_or_default(),
        None => conn
            .prepare(
                "SELECT id FROM dm_messages WHERE channel_id = ?1 ORDER BY seq DESC LIMIT ?2",
            )
            .and_then(|mut stmt| {
                let rows = stmt
                    .query_map(params![channel_id, limit + 1], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .unwrap_or_default(),
    };

    let has_more = ids.len() as i64 > limit;
    let messages: Vec<DmMessage> = ids
        .iter()
        .take(limit as usize)
        .filter_map(|id| assemble_dm_message(&conn, id).ok())
        .collect();
    Ok(ok(serde_json::json!({"messages": messages, "has_more": has_more})))
}

#[patch("/api/v1/dms/messages/<message_id>", format = "json", data = "<body>")]
pub fn edit_dm_message(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    message_id: &str,
    body: Json<EditMessageRequest>,
) -> Result<Json<ApiOk<DmMessage>>, ApiError> {
    let content = body.content.trim().to_string();
    if content.is_empty() || content.chars().count() > crate::routes::messages::MAX_CONTENT_CHARS {
        return Err(routes::validation("Content must be 1-2000 characters"));
    }

    let (message, pair) = {
        let conn = db.conn();
        let (author_id, channel_id): (String, String) = conn
            .query_row(
                "SELECT author_id, channel_id FROM dm_messages WHERE id = ?1",
                params![message_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(|_| routes::not_found_err("Message not found"))?;
        if author_id != user.id {
            return Err(routes::forbidden());
        }
        let channel = load_dm_channel(&conn, &channel_id)?;

        conn.execute(
            "UPDATE dm_messages SET content = ?1, edited_at = ?2 WHERE id = ?3",
            params![&content, now_ts(), message_id],
        )
        .map_err(routes::internal)?;
        db::upsert_dm_fts(&conn, message_id);
        (assemble_dm_message(&conn, message_id)?, dm_event_pair(&channel))
    };

    events.publish(PushEvent::DmMessageUpdate {
        user_low: pair.0,
        user_high: pair.1,
        message: message.clone(),
    });
    Ok(ok(message))
}

#[delete("/api/v1/dms/messages/<message_id>")]
pub fn delete_dm_message(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    message_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let (channel_id, pair) = {
        let conn = db.conn();
        let (author_id, channel_id): (String, String) = conn
            .query_row(
                "SELECT author_id, channel_id FROM dm_messages WHERE id = ?1",
                params![message_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(|_| routes::not_found_err("Message not found"))?;
        if author_id != user.id {
            return Err(routes::forbidden());
        }
        let channel = load_dm_channel(&conn, &channel_id)?;

        db::delete_dm_fts(&conn, message_id);
        conn.execute("DELETE FROM dm_messages WHERE id = ?1", params![message_id])
            .map_err(routes::internal)?;
        (channel_id, dm_event_pair(&channel))
    };

    events.publish(PushEvent::DmMessageDelete {
        user_low: pair.0,
        user_high: pair.1,
        channel_id,
        message_id: message_id.to_string(),
    });
    Ok(ok(serde_json::json!({"deleted": true})))
}

// --- Reactions & pins (both participants hold pin rights) ---

#[post("/api/v1/dms/messages/<message_id>/reactions", format = "json", data = "<body>")]
pub fn toggle_dm_reaction(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    message_id: &str,
    body: Json<ToggleReactionRequest>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let emoji = body.emoji.trim().to_string();
    if emoji.is_empty() || emoji.chars().count() > 32 {
        return Err(routes::validation("Emoji must be 1-32 characters"));
    }

    let (channel_id, pair, reactions, added) = {
        let mut conn = db.conn();
        let channel_id: String = conn
            .query_row(
                "SELECT channel_id FROM dm_messages WHERE id = ?1",
                params![message_id],
                |r| r.get(0),
            )
            .map_err(|_| routes::not_found_err("Message not found"))?;
        let channel = load_dm_channel(&conn, &channel_id)?;
        require_participant(&channel, &user.id)?;

        let tx = conn.transaction().map_err(routes::internal)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO dm_reactions (message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![message_id, &user.id, &emoji, now_ts()],
            )
            .map_err(routes::internal)?;
        let added = inserted > 0;
        if !added {
            tx.execute(
                "DELETE FROM dm_reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                params![message_id, &user.id, &emoji],
            )
            .map_err(routes::internal)?;
        }
        tx.commit().map_err(routes::internal)?;

        let reactions =
            crate::routes::messages::reaction_summaries(&conn, "dm_reactions", message_id);
        (channel_id, dm_event_pair(&channel), reactions, added)
    };

    events.publish(PushEvent::DmReactionUpdate {
        user_low: pair.0,
        user_high: pair.1,
        channel_id,
        message_id: message_id.to_string(),
        reactions: reactions.clone(),
    });
    Ok(ok(serde_json::json!({"added": added, "reactions": reactions})))
}

#[post("/api/v1/dms/messages/<message_id>/pin")]
pub fn pin_dm_message(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    message_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let (channel_id, pair) = {
        let mut conn = db.conn();
        let channel_id: String = conn
            .query_row(
                "SELECT channel_id FROM dm_messages WHERE id = ?1",
                params![message_id],
                |r| r.get(0),
            )
            .map_err(|_| routes::not_found_err("Message not found"))?;
        let channel = load_dm_channel(&conn, &channel_id)?;
        require_participant(&channel, &user.id)?;

        let tx = conn.transaction().map_err(routes::internal)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO dm_pins (message_id, channel_id, pinned_by, pinned_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![message_id, &channel_id, &user.id, now_ts()],
            )
            .map_err(routes::internal)?;
        if inserted == 0 {
            return Err(routes::conflict("Message is already pinned"));
        }
        tx.execute(
            "UPDATE dm_messages SET is_pinned = 1 WHERE id = ?1",
            params![message_id],
        )
        .map_err(routes::internal)?;
        tx.commit().map_err(routes::internal)?;
        (channel_id, dm_event_pair(&channel))
    };

    events.publish(PushEvent::DmMessagePin {
        user_low: pair.0,
        user_high: pair.1,
        channel_id,
        message_id: message_id.to_string(),
        pinned: true,
    });
    Ok(ok(serde_json::json!({"pinned": true})))
}

#[delete("/api/v1/dms/messages/<message_id>/pin")]
pub fn unpin_dm_message(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    message_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let (channel_id, pair) = {
        let mut conn = db.conn();
        let channel_id: String = conn
            .query_row(
                "SELECT channel_id FROM dm_messages WHERE id = ?1",
                params![message_id],
                |r| r.get(0),
            )
            .map_err(|_| routes::not_found_err("Message not found"))?;
        let channel = load_dm_channel(&conn, &channel_id)?;
        require_participant(&channel, &user.id)?;

        let tx = conn.transaction().map_err(routes::internal)?;
        let removed = tx
            .execute("DELETE FROM dm_pins WHERE message_id = ?1", params![message_id])
            .map_err(routes::internal)?;
        if removed == 0 {
            return Err(routes::not_found_err("Message is not pinned"));
        }
        tx.execute(
            "UPDATE dm_messages SET is_pinned = 0 WHERE id = ?1",
            params![message_id],
        )
        .map_err(routes::internal)?;
        tx.commit().map_err(routes::internal)?;
        (channel_id, dm_event_pair(&channel))
    };

    events.publish(PushEvent::DmMessagePin {
        user_low: pair.0,
        user_high: pair.1,
        channel_id,
        message_id: message_id.to_string(),
        pinned: false,
    });
    Ok(ok(serde_json::json!({"pinned": false})))
}

#[get("/api/v1/dms/<channel_id>/pinned")]
pub fn get_dm_pins(
    db: &State<Db>,
    user: AuthUser,
    channel_id: &str,
) -> Result<Json<ApiOk<Vec<DmMessage>>>, ApiError> {
    let conn = db.conn();
    let channel = load_dm_channel(&conn, channel_id)?;
    require_participant(&channel, &user.id)?;

    let ids: Vec<String> = conn
        .prepare("SELECT message_id FROM dm_pins WHERE channel_id = ?1 ORDER BY pinned_at DESC")
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map(params![channel_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .unwrap_or_default();
    let pinned: Vec<DmMessage> = ids
        .iter()
        .filter_map(|id| assemble_dm_message(&conn, id).ok())
        .collect();
    Ok(ok(pinned))
}

// --- Read state & search ---

#[post("/api/v1/dms/<channel_id>/read", format = "json", data = "<body>")]
pub fn mark_dm_read(
    db: &State<Db>,
    user: AuthUser,
    channel_id: &str,
    body: Json<MarkReadRequest>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let conn = db.conn();
    let channel = load_dm_channel(&conn, channel_id)?;
    require_participant(&channel, &user.id)?;

    let message_ts: String = conn
        .query_row(
            "SELECT created_at FROM dm_messages WHERE id = ?1 AND channel_id = ?2",
            params![&body.message_id, channel_id],
            |r| r.get(0),
        )
        .map_err(|_| routes::not_found_err("Message not found in this channel"))?;

    conn.execute(
        "INSERT INTO dm_read_states (user_id, channel_id, last_read_message_id, last_read_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (user_id, channel_id) DO UPDATE
         SET last_read_message_id = excluded.last_read_message_id,
             last_read_at = excluded.last_read_at
         WHERE excluded.last_read_at >= dm_read_states.last_read_at",
        params![&user.id, channel_id, &body.message_id, &message_ts],
    )
    .map_err(routes::internal)?;
    Ok(ok(serde_json::json!({"marked": true})))
}

#[get("/api/v1/dms/<channel_id>/search?<q>&<limit>&<offset>")]
pub fn dm_search(
    db: &State<Db>,
    user: AuthUser,
    channel_id: &str,
    q: &str,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Json<ApiOk<SearchResponse<DmMessage>>>, ApiError> {
    let query = q.trim();
    if query.is_empty() || query.chars().count() > 100 {
        return Err(routes::validation("Query must be 1-100 characters"));
    }

    let conn = db.conn();
    let channel = load_dm_channel(&conn, channel_id)?;
    require_participant(&channel, &user.id)?;

    let limit = limit.unwrap_or(25).clamp(1, 100);
    let offset = offset.unwrap_or(0).max(0);
    let fts_query = db::fts_escape(query);
    if fts_query.is_empty() {
        return Ok(ok(SearchResponse {
            results: Vec::new(),
            total_count: 0,
            query: query.to_string(),
        }));
    }

    let total_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM dm_messages_fts f
             JOIN dm_messages m ON m.id = f.message_id
             WHERE dm_messages_fts MATCH ?1 AND m.channel_id = ?2",
            params![&fts_query, channel_id],
            |r| r.get(0),
        )
        .unwrap_or(0);

    let ids: Vec<String> = conn
        .prepare(
            "SELECT m.id FROM dm_messages_fts f
             JOIN dm_messages m ON m.id = f.message_id
             WHERE dm_messages_fts MATCH ?1 AND m.channel_id = ?2
             ORDER BY m.seq DESC LIMIT ?3 OFFSET ?4",
        )
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map(params![&fts_query, channel_id, limit, offset], |row| {
                    row.get(0)
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .unwrap_or_default();

    let results: Vec<DmMessage> = ids
        .iter()
        .filter_map(|id| assemble_dm_message(&conn, id).ok())
        .collect();
    Ok(ok(SearchResponse {
        results,
        total_count,
        query: query.to_string(),
    }))
}
