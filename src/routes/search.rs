use crate::db::{self, Db};
use crate::models::*;
use crate::permissions::{self, Permissions};
use crate::routes::{self, ApiError, AuthUser};
use rocket::serde::json::Json;
use rocket::{get, State};
use rusqlite::params;

/// Full-text search across a server, optionally narrowed to one channel.
/// Results join author and attachments; total_count reflects the whole
/// match set, not the page.
#[get("/api/v1/servers/<server_id>/search?<q>&<channel_id>&<limit>&<offset>")]
pub fn search_messages(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
    q: &str,
    channel_id: Option<&str>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> Result<Json<ApiOk<SearchResponse<Message>>>, ApiError> {
    let query = q.trim();
    if query.is_empty() || query.chars().count() > 100 {
        return Err(routes::validation("Query must be 1-100 characters"));
    }

    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    if let Some(cid) = channel_id {
        routes::load_channel(&conn, server_id, cid)?;
        let perms = permissions::effective(&conn, server_id, &user.id, Some(cid));
        if !perms.contains(Permissions::READ_MESSAGES) {
            return Err(routes::forbidden());
        }
    }

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

    let (total_count, ids): (i64, Vec<String>) = match channel_id {
        Some(cid) => {
            let total: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM messages_fts f
                     JOIN messages m ON m.id = f.message_id
                     WHERE messages_fts MATCH ?1 AND m.server_id = ?2 AND m.channel_id = ?3",
                    params![&fts_query, server_id, cid],
                    |r| r.get(0),
                )
                .unwrap_or(0);
            let ids = conn
                .prepare(
                    "SELECT m.id FROM messages_fts f
                     JOIN messages m ON m.id = f.message_id
                     WHERE messages_fts MATCH ?1 AND m.server_id = ?2 AND m.channel_id = ?3
                     ORDER BY m.seq DESC LIMIT ?4 OFFSET ?5",
                )
                .and_then(|mut stmt| {
                    let rows = stmt
                        .query_map(params![&fts_query, server_id, cid, limit, offset], |row| {
                            row.get(0)
                        })?
                        .filter_map(|r| r.ok())
                        .collect();
                    Ok(rows)
                })
                .unwrap_or_default();
            (total, ids)
        }
        None => {
            let total: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM messages_fts f
                     JOIN messages m ON m.id = f.message_id
                     WHERE messages_fts MATCH ?1 AND m.server_id = ?2",
                    params![&fts_query, server_id],
                    |r| r.get(0),
                )
                .unwrap_or(0);
            let ids = conn
                .prepare(
                    "SELECT m.id FROM messages_fts f
                     JOIN messages m ON m.id = f.message_id
                     WHERE messages_fts MATCH ?1 AND m.server_id = ?2
                     ORDER BY m.seq DESC LIMIT ?3 OFFSET ?4",
                )
                .and_then(|mut stmt| {
                    let rows = stmt
                        .query_map(params![&fts_query, server_id, limit, offset], |row| {
                            row.get(0)
                        })?
                        .filter_map(|r| r.ok())
                        .collect();
                    Ok(rows)
                })
                .unwrap_or_default();
            (total, ids)
        }
    };

    let results: Vec<Message> = ids
        .iter()
        .filter_map(|id| crate::routes::messages::assemble_message(&conn, id).ok())
        .collect();
    Ok(ok(SearchResponse {
        results,
        total_count,
        query: query.to_string(),
    }))
}
