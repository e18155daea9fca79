use crate::config::Config;
use crate::crypto;
use crate::db::{self, now_ts, Db};
use crate::events::{EventBus, PushEvent};
use crate::models::*;
use crate::permissions::{self, Permissions};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::routes::{self, ApiError, AuthUser};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rocket::serde::json::Json;
use rocket::{delete, get, patch, post, State};
use rusqlite::{params, Connection};

pub const MAX_CONTENT_CHARS: usize = 2000;
pub const PAGE_LIMIT_MAX: i64 = 100;

/// Decode and persist one upload into the upload directory; returns the
/// public `/uploads/...` URL. Filenames are flattened to a safe charset.
pub(crate) fn store_upload(
    config: &Config,
    filename: &str,
    bytes: &[u8],
) -> Result<String, ApiError> {
    let safe: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(120)
        .collect();
    let stored = format!("{}_{}", crypto::generate_id(), safe);
    std::fs::create_dir_all(&config.upload_dir).map_err(routes::internal)?;
    std::fs::write(config.upload_dir.join(&stored), bytes).map_err(routes::internal)?;
    Ok(format!("/uploads/{stored}"))
}

pub(crate) fn message_attachments(conn: &Connection, message_id: &str) -> Vec<Attachment> {
    conn.prepare(
        "SELECT id, filename, url, size, mime FROM attachments WHERE message_id = ?1",
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

/// Aggregate a message's reactions as (emoji → count, users).
pub(crate) fn reaction_summaries(
    conn: &Connection,
    table: &str,
    message_id: &str,
) -> Vec<ReactionSummary> {
    let sql = format!(
        "SELECT emoji, user_id FROM {table} WHERE message_id = ?1 ORDER BY created_at ASC"
    );
    let pairs: Vec<(String, String)> = conn
        .prepare(&sql)
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map(params![message_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .unwrap_or_default();

    let mut order: Vec<String> = Vec::new();
    let mut grouped: std::collections::HashMap<String, Vec<String>> =
        std::collections::HashMap::new();
    for (emoji, user_id) in pairs {
        if !grouped.contains_key(&emoji) {
            order.push(emoji.clone());
        }
        grouped.entry(emoji).or_default().push(user_id);
    }
    order
        .into_iter()
        .map(|emoji| {
            let user_ids = grouped.remove(&emoji).unwrap_or_default();
            ReactionSummary {
                emoji,
                count: user_ids.len() as i64,
                user_ids,
            }
        })
        .collect()
}

/// Resolve `@handle` tokens against the server's members; unknown handles
/// are ignored.
pub(crate) fn parse_mentions(conn: &Connection, server_id: &str, content: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = content;
    while let Some(at) = rest.find('@') {
        rest = &rest[at + 1..];
        let handle: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if handle.len() < 3 {
            continue;
        }
        let found: Option<String> = conn
            .query_row(
                "SELECT u.id FROM users u
                 JOIN server_members m ON m.user_id = u.id
                 WHERE m.server_id = ?1 AND u.username = ?2 COLLATE NOCASE",
                params![server_id, &handle],
                |r| r.get(0),
            )
            .ok();
        if let Some(id) = found
            && !ids.contains(&id)
        {
            ids.push(id);
        }
    }
    ids
}

fn reply_preview(conn: &Connection, reply_to_id: &Option<String>) -> Option<ReplyPreview> {
    let id = reply_to_id.as_deref()?;
    conn.query_row(
        "SELECT id, author_id, content FROM messages WHERE id = ?1",
        params![id],
        |row| {
            Ok(ReplyPreview {
                id: row.get(0)?,
                author_id: row.get(1)?,
                content: row.get(2)?,
            })
        },
    )
    .ok()
}

/// Load one message with author, attachments, reactions and reply preview
/// joined — the shape every read and every push payload uses.
pub(crate) fn assemble_message(conn: &Connection, message_id: &str) -> Result<Message, ApiError> {
    let (mut message, reply_to_id) = conn
        .query_row(
            "SELECT m.id, m.server_id, m.channel_id, m.content, m.created_at, m.edited_at,
                    m.reply_to_id, m.is_pinned, m.seq,
                    u.id, u.username, u.display_name, u.avatar_url, u.status, u.custom_status
             FROM messages m JOIN users u ON u.id = m.author_id
             WHERE m.id = ?1",
            params![message_id],
            |row| {
                let reply_to_id: Option<String> = row.get(6)?;
                Ok((
                    Message {
                        id: row.get(0)?,
                        server_id: row.get(1)?,
                        channel_id: row.get(2)?,
                        content: row.get(3)?,
                        created_at: row.get(4)?,
                        edited_at: row.get(5)?,
                        reply_to: None,
                        is_pinned: row.get::<_, i64>(7)? != 0,
                        seq: row.get(8)?,
                        author: UserProfile {
                            id: row.get(9)?,
                            username: row.get(10)?,
                            display_name: row.get(11)?,
                            avatar_url: row.get(12)?,
                            status: row.get(13)?,
                            custom_status: row.get(14)?,
                        },
                        attachments: Vec::new(),
                        reactions: Vec::new(),
                        mentions: Vec::new(),
                    },
                    reply_to_id,
                ))
            },
        )
        .map_err(|_| routes::not_found_err("Message not found"))?;

    message.reply_to = reply_preview(conn, &reply_to_id);
    message.attachments = message_attachments(conn, &message.id);
    message.reactions = reaction_summaries(conn, "reactions", &message.id);
    if let Some(ref content) = message.content {
        message.mentions = parse_mentions(conn, &message.server_id, content);
    }
    Ok(message)
}

fn validate_content(content: &Option<String>, has_attachments: bool) -> Result<(), ApiError> {
    match content.as_deref().map(str::trim) {
        Some(c) if !c.is_empty() => {
            if c.chars().count() > MAX_CONTENT_CHARS {
                Err(routes::validation("Content must be 1-2000 characters"))
            } else {
                Ok(())
            }
        }
        _ if has_attachments => Ok(()),
        _ => Err(routes::validation(
            "Content is required when no attachments are present",
        )),
    }
}

#[post(
    "/api/v1/servers/<server_id>/channels/<channel_id>/messages",
    format = "json",
    data = "<body>"
)]
pub fn send_message(
    db: &State<Db>,
    config: &State<Config>,
    events: &State<EventBus>,
    rate_limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    user: AuthUser,
    server_id: &str,
    channel_id: &str,
    body: Json<SendMessageRequest>,
) -> Result<Json<ApiOk<Message>>, ApiError> {
    let rl = rate_limiter.check(
        &format!("send_msg:{}", user.id),
        rate_config.messages_max,
        rate_config.messages_window_secs,
    );
    if !rl.allowed {
        return Err(routes::rate_limited(&rl, "Too many messages"));
    }

    validate_content(&body.content, !body.attachments.is_empty())?;

    // Decode uploads before touching the store.
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

    let message = {
        let mut conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
        let channel = routes::load_channel(&conn, server_id, channel_id)?;
        if channel.channel_type != "text" {
            return Err(routes::validation("Messages can only be sent to text channels"));
        }
        let perms = permissions::effective(&conn, server_id, &user.id, Some(channel_id));
        if !perms.contains(Permissions::SEND_MESSAGES) {
            return Err(routes::forbidden());
        }

        let content = body
            .content
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);

        let reply_to = body
            .reply_to_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);
        if let Some(ref reply_id) = reply_to {
            let in_channel: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM messages WHERE id = ?1 AND channel_id = ?2",
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
                store_upload(config, filename, bytes)
                    .map(|url| (filename.clone(), mime.clone(), url, bytes.len() as i64))
            })
            .collect::<Result<_, _>>()?;

        let id = crypto::generate_id();
        let tx = conn.transaction().map_err(routes::internal)?;
        let seq = db::next_seq(&tx);
        tx.execute(
            "INSERT INTO messages (id, server_id, channel_id, author_id, content,
                                   created_at, reply_to_id, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![&id, server_id, channel_id, &user.id, &content, now_ts(), &reply_to, seq],
        )
        .map_err(routes::internal)?;
        for (filename, mime, url, size) in &stored {
            tx.execute(
                "INSERT INTO attachments (id, message_id, filename, url, size, mime)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![crypto::generate_id(), &id, filename, url, size, mime],
            )
            .map_err(routes::internal)?;
        }
        db::upsert_fts(&tx, &id);
        tx.commit().map_err(routes::internal)?;

        assemble_message(&conn, &id)?
    };

    events.publish(PushEvent::MessageCreate(message.clone()));
    Ok(ok(message))
}

#[get("/api/v1/servers/<server_id>/channels/<channel_id>/messages?<before>&<limit>")]
pub fn get_messages(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
    channel_id: &str,
    before: Option<&str>,
    limit: Option<i64>,
) -> Result<Json<ApiOk<MessagePage>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    routes::load_channel(&conn, server_id, channel_id)?;
    let perms = permissions::effective(&conn, server_id, &user.id, Some(channel_id));
    if !perms.contains(Permissions::READ_MESSAGES) {
        return Err(routes::forbidden());
    }

    let limit = limit.unwrap_or(50).clamp(1, PAGE_LIMIT_MAX);

    // Cursor is an anchor message id resolved to its seq; stable under
    // concurrent inserts.
    let anchor_seq: Option<i64> = match before {
        Some(anchor_id) => {
            let seq = conn
                .query_row(
                    "SELECT seq FROM messages WHERE id = ?1 AND channel_id = ?2",
                    params![anchor_id, channel_id],
                    |r| r.get(0),
                )
                .ok();
            match seq {
                Some(s) => Some(s),
                None => return Err(routes::not_found_err("Anchor message not found")),
            }
        }
        None => None,
    };

    let ids: Vec<String> = match anchor_seq {
        Some(anchor) => conn
            .prepare(
                "SELECT id FROM messages WHERE channel_id = ?1 AND seq < ?2
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
                "SELECT id FROM messages WHERE channel_id = ?1 ORDER BY seq DESC LIMIT ?2",
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
    let messages: Vec<Message> = ids
        .iter()
        .take(limit as usize)
        .filter_map(|id| assemble_message(&conn, id).ok())
        .collect();

    Ok(ok(MessagePage { messages, has_more }))
}

#[patch("/api/v1/servers/<server_id>/messages/<message_id>", format = "json", data = "<body>")]
pub fn edit_message(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    message_id: &str,
    body: Json<EditMessageRequest>,
) -> Result<Json<ApiOk<Message>>, ApiError> {
    let content = body.content.trim().to_string();
    if content.is_empty() || content.chars().count() > MAX_CONTENT_CHARS {
        return Err(routes::validation("Content must be 1-2000 characters"));
    }

    let message = {
        let conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
        let author_id: String = conn
            .query_row(
                "SELECT author_id FROM messages WHERE id = ?1 AND server_id = ?2",
                params![message_id, server_id],
                |r| r.get(0),
            )
            .map_err(|_| routes::not_found_err("Message not found"))?;
        if author_id != user.id {
            return Err(routes::forbidden());
        }

        conn.execute(
            "UPDATE messages SET content = ?1, edited_at = ?2 WHERE id = ?3",
            params![&content, now_ts(), message_id],
        )
        .map_err(routes::internal)?;
        db::upsert_fts(&conn, message_id);
        assemble_message(&conn, message_id)?
    };

    events.publish(PushEvent::MessageUpdate(message.clone()));
    Ok(ok(message))
}

#[delete("/api/v1/servers/<server_id>/messages/<message_id>")]
pub fn delete_message(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    message_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let channel_id = {
        let conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
        let (author_id, channel_id): (String, String) = conn
            .query_row(
                "SELECT author_id, channel_id FROM messages WHERE id = ?1 AND server_id = ?2",
                params![message_id, server_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(|_| routes::not_found_err("Message not found"))?;

        if author_id != user.id {
            let perms = permissions::effective(&conn, server_id, &user.id, Some(&channel_id));
            if !perms.contains(Permissions::MANAGE_MESSAGES) {
                return Err(routes::forbidden());
            }
        }

        db::delete_fts(&conn, message_id);
        conn.execute("DELETE FROM messages WHERE id = ?1", params![message_id])
            .map_err(routes::internal)?;
        channel_id
    };

    events.publish(PushEvent::MessageDelete {
        server_id: server_id.to_string(),
        channel_id,
        message_id: message_id.to_string(),
    });
    Ok(ok(serde_json::json!({"deleted": true})))
}
