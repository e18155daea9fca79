use crate::db::{now_ts, Db};
use crate::events::{EventBus, PushEvent};
use crate::models::*;
use crate::permissions::{self, Permissions};
use crate::routes::{self, ApiError, AuthUser};
use rocket::serde::json::Json;
use rocket::{delete, get, post, State};
use rusqlite::{params, Connection};

fn require_manage_messages(
    conn: &Connection,
    server_id: &str,
    user_id: &str,
    channel_id: &str,
) -> Result<(), ApiError> {
    let perms = permissions::effective(conn, server_id, user_id, Some(channel_id));
    if perms.contains(Permissions::MANAGE_MESSAGES) {
        Ok(())
    } else {
        Err(routes::forbidden())
    }
}

#[post("/api/v1/servers/<server_id>/channels/<channel_id>/messages/<message_id>/pin")]
pub fn pin_message(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    channel_id: &str,
    message_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    {
        let mut conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
        routes::load_channel(&conn, server_id, channel_id)?;
        require_manage_messages(&conn, server_id, &user.id, channel_id)?;

        let exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE id = ?1 AND channel_id = ?2",
                params![message_id, channel_id],
                |r| r.get(0),
            )
            .unwrap_or(0);
        if exists == 0 {
            return Err(routes::not_found_err("Message not found"));
        }

        let tx = conn.transaction().map_err(routes::internal)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO pins (message_id, channel_id, pinned_by, pinned_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![message_id, channel_id, &user.id, now_ts()],
            )
            .map_err(routes::internal)?;
        if inserted == 0 {
            return Err(routes::conflict("Message is already pinned"));
        }
        tx.execute(
            "UPDATE messages SET is_pinned = 1 WHERE id = ?1",
            params![message_id],
        )
        .map_err(routes::internal)?;
        tx.commit().map_err(routes::internal)?;
    }

    events.publish(PushEvent::MessagePin {
        server_id: server_id.to_string(),
        channel_id: channel_id.to_string(),
        message_id: message_id.to_string(),
        pinned_by: user.id.clone(),
    });
    Ok(ok(serde_json::json!({"pinned": true})))
}

#[delete("/api/v1/servers/<server_id>/channels/<channel_id>/messages/<message_id>/pin")]
pub fn unpin_message(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    channel_id: &str,
    message_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    {
        let mut conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
        routes::load_channel(&conn, server_id, channel_id)?;
        require_manage_messages(&conn, server_id, &user.id, channel_id)?;

        let tx = conn.transaction().map_err(routes::internal)?;
        let removed = tx
            .execute(
                "DELETE FROM pins WHERE message_id = ?1 AND channel_id = ?2",
                params![message_id, channel_id],
            )
            .map_err(routes::internal)?;
        if removed == 0 {
            return Err(routes::not_found_err("Message is not pinned"));
        }
        tx.execute(
            "UPDATE messages SET is_pinned = 0 WHERE id = ?1",
            params![message_id],
        )
        .map_err(routes::internal)?;
        tx.commit().map_err(routes::internal)?;
    }

    events.publish(PushEvent::MessageUnpin {
        server_id: server_id.to_string(),
        channel_id: channel_id.to_string(),
        message_id: message_id.to_string(),
    });
    Ok(ok(serde_json::json!({"pinned": false})))
}

#[get("/api/v1/servers/<server_id>/channels/<channel_id>/pins")]
pub fn list_pins(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
    channel_id: &str,
) -> Result<Json<ApiOk<Vec<Message>>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    routes::load_channel(&conn, server_id, channel_id)?;
    let perms = permissions::effective(&conn, server_id, &user.id, Some(channel_id));
    if !perms.contains(Permissions::READ_MESSAGES) {
        return Err(routes::forbidden());
    }

    let ids: Vec<String> = conn
        .prepare(
            "SELECT message_id FROM pins WHERE channel_id = ?1 ORDER BY pinned_at DESC",
        )
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map(params![channel_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .unwrap_or_default();

    let pinned: Vec<Message> = ids
        .iter()
        .filter_map(|id| crate::routes::messages::assemble_message(&conn, id).ok())
        .collect();
    Ok(ok(pinned))
}
