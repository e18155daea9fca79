use crate::db::{now_ts, Db};
use crate::events::{EventBus, PushEvent};
use crate::models::*;
use crate::permissions::{self, Permissions};
use crate::routes::{self, ApiError, AuthUser};
use rocket::serde::json::Json;
use rocket::{post, State};
use rusqlite::params;

/// Toggle semantics on the UNIQUE (message, user, emoji) row: the insert
/// either lands or collides, and a collision deletes instead. Exactly one
/// row moves per call under any interleaving.
#[post(
    "/api/v1/servers/<server_id>/messages/<message_id>/reactions",
    format = "json",
    data = "<body>"
)]
pub fn toggle_reaction(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    message_id: &str,
    body: Json<ToggleReactionRequest>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let emoji = body.emoji.trim().to_string();
    if emoji.is_empty() || emoji.chars().count() > 32 {
        return Err(routes::validation("Emoji must be 1-32 characters"));
    }

    let (channel_id, reactions, added) = {
        let mut conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
        let channel_id: String = conn
            .query_row(
                "SELECT channel_id FROM messages WHERE id = ?1 AND server_id = ?2",
                params![message_id, server_id],
                |r| r.get(0),
            )
            .map_err(|_| routes::not_found_err("Message not found"))?;
        let perms = permissions::effective(&conn, server_id, &user.id, Some(&channel_id));
        if !perms.contains(Permissions::READ_MESSAGES) {
            return Err(routes::forbidden());
        }

        let tx = conn.transaction().map_err(routes::internal)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![message_id, &user.id, &emoji, now_ts()],
            )
            .map_err(routes::internal)?;
        let added = inserted > 0;
        if !added {
            tx.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                params![message_id, &user.id, &emoji],
            )
            .map_err(routes::internal)?;
        }
        tx.commit().map_err(routes::internal)?;

        let reactions =
            crate::routes::messages::reaction_summaries(&conn, "reactions", message_id);
        (channel_id, reactions, added)
    };

    events.publish(PushEvent::ReactionUpdate {
        server_id: server_id.to_string(),
        channel_id,
        message_id: message_id.to_string(),
        reactions: reactions.clone(),
    });
    Ok(ok(serde_json::json!({"added": added, "reactions": reactions})))
}
