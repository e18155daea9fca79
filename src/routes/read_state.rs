use crate::db::Db;
use crate::models::*;
use crate::routes::{self, ApiError, AuthUser};
use rocket::serde::json::Json;
use rocket::{get, post, State};
use rusqlite::params;

/// Upsert the read watermark for a channel. The referenced message must
/// belong to the channel, and the watermark never moves backwards.
#[post(
    "/api/v1/servers/<server_id>/channels/<channel_id>/read",
    format = "json",
    data = "<body>"
)]
pub fn mark_read(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
    channel_id: &str,
    body: Json<MarkReadRequest>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    routes::load_channel(&conn, server_id, channel_id)?;

    let message_ts: String = conn
        .query_row(
            "SELECT created_at FROM messages WHERE id = ?1 AND channel_id = ?2",
            params![&body.message_id, channel_id],
            |r| r.get(0),
        )
        .map_err(|_| routes::not_found_err("Message not found in this channel"))?;

    conn.execute(
        "INSERT INTO read_states (user_id, channel_id, last_read_message_id, last_read_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (user_id, channel_id) DO UPDATE
         SET last_read_message_id = excluded.last_read_message_id,
             last_read_at = excluded.last_read_at
         WHERE excluded.last_read_at >= read_states.last_read_at",
        params![&user.id, channel_id, &body.message_id, &message_ts],
    )
    .map_err(routes::internal)?;

    Ok(ok(serde_json::json!({"marked": true})))
}

/// Channels with unread activity: messages strictly newer than the caller's
/// watermark, authored by someone else. Channels without a watermark count
/// everything by others. Only non-zero channels are returned.
#[get("/api/v1/unread")]
pub fn get_unread(
    db: &State<Db>,
    user: AuthUser,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let conn = db.conn();

    let channels: Vec<UnreadChannel> = conn
        .prepare(
            "SELECT c.id,
                    (SELECT COUNT(*) FROM messages msg
                     WHERE msg.channel_id = c.id
                       AND msg.author_id != ?1
                       AND msg.created_at > COALESCE(
                           (SELECT rs.last_read_at FROM read_states rs
                            WHERE rs.user_id = ?1 AND rs.channel_id = c.id), ''))
             FROM channels c
             JOIN server_members m ON m.server_id = c.server_id
             WHERE m.user_id = ?1 AND c.channel_type = 'text'",
        )
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map(params![&user.id], |row| {
                    Ok(UnreadChannel {
                        channel_id: row.get(0)?,
                        unread_count: row.get(1)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .filter(|c: &UnreadChannel| c.unread_count > 0)
                .collect();
            Ok(rows)
        })
        .unwrap_or_default();

    let dm_channels: Vec<UnreadChannel> = conn
        .prepare(
            "SELECT d.id,
                    (SELECT COUNT(*) FROM dm_messages msg
                     WHERE msg.channel_id = d.id
                       AND msg.author_id != ?1
                       AND msg.created_at > COALESCE(
                           (SELECT rs.last_read_at FROM dm_read_states rs
                            WHERE rs.user_id = ?1 AND rs.channel_id = d.id), ''))
             FROM dm_channels d
             WHERE d.user_low = ?1 OR d.user_high = ?1",
        )
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map(params![&user.id], |row| {
                    Ok(UnreadChannel {
                        channel_id: row.get(0)?,
                        unread_count: row.get(1)?,
                    })
                })?
                .filter_map(|r| r.ok())
                .filter(|c: &UnreadChannel| c.unread_count > 0)
                .collect();
            Ok(rows)
        })
        .unwrap_or_default();

    Ok(ok(serde_json::json!({
        "channels": channels,
        "dm_channels": dm_channels,
    })))
}
