use crate::crypto;
use crate::db::{now_ts, Db};
use crate::events::{EventBus, PushEvent};
use crate::models::*;
use crate::permissions::{self, Permissions};
use crate::routes::{self, ApiError, AuthUser};
use crate::voice::VoiceRegistry;
use rocket::serde::json::Json;
use rocket::{delete, get, patch, post, put, State};
use rusqlite::{params, Connection};
use std::sync::Arc;

fn require_manage_channels(
    conn: &Connection,
    server_id: &str,
    user_id: &str,
) -> Result<(), ApiError> {
    routes::require_member(conn, server_id, user_id)?;
    let perms = permissions::effective(conn, server_id, user_id, None);
    if perms.contains(Permissions::MANAGE_CHANNELS) {
        Ok(())
    } else {
        Err(routes::forbidden())
    }
}

pub(crate) fn server_categories(conn: &Connection, server_id: &str) -> Vec<Category> {
    conn.prepare(
        "SELECT id, server_id, name, position FROM categories
         WHERE server_id = ?1 ORDER BY position ASC",
    )
    .and_then(|mut stmt| {
        let rows = stmt
            .query_map(params![server_id], Category::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    })
    .unwrap_or_default()
}

pub(crate) fn server_channels(conn: &Connection, server_id: &str) -> Vec<Channel> {
    conn.prepare(&format!(
        "SELECT {CHANNEL_COLUMNS} FROM channels
         WHERE server_id = ?1 ORDER BY position ASC"
    ))
    .and_then(|mut stmt| {
        let rows = stmt
            .query_map(params![server_id], Channel::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    })
    .unwrap_or_default()
}

// --- Channels ---

#[get("/api/v1/servers/<server_id>/channels")]
pub fn list_channels(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    Ok(ok(serde_json::json!({
        "categories": server_categories(&conn, server_id),
        "channels": server_channels(&conn, server_id),
    })))
}

#[post("/api/v1/servers/<server_id>/channels", format = "json", data = "<body>")]
pub fn create_channel(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    body: Json<CreateChannelRequest>,
) -> Result<Json<ApiOk<Channel>>, ApiError> {
    let name = body.name.trim().to_string();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(routes::validation("Channel name must be 1-100 characters"));
    }
    if !matches!(body.channel_type.as_str(), "text" | "voice") {
        return Err(routes::validation("Channel type must be text or voice"));
    }

    let channel = {
        let conn = db.conn();
        require_manage_channels(&conn, server_id, &user.id)?;

        if let Some(ref category_id) = body.category_id {
            let in_server: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM categories WHERE id = ?1 AND server_id = ?2",
                    params![category_id, server_id],
                    |r| r.get(0),
                )
                .unwrap_or(0);
            if in_server == 0 {
                return Err(routes::not_found_err("Category not found"));
            }
        }

        // Dense position at the end of the category bucket.
        let position: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM channels
                 WHERE server_id = ?1 AND category_id IS ?2",
                params![server_id, &body.category_id],
                |r| r.get(0),
            )
            .unwrap_or(0);

        let id = crypto::generate_id();
        conn.execute(
            "INSERT INTO channels (id, server_id, category_id, name, channel_type, topic,
                                   position, user_limit, bitrate, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &id,
                server_id,
                &body.category_id,
                &name,
                &body.channel_type,
                body.topic.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                position,
                body.user_limit.unwrap_or(0),
                body.bitrate.unwrap_or(64000),
                now_ts()
            ],
        )
        .map_err(routes::internal)?;
        routes::load_channel(&conn, server_id, &id)?
    };

    events.publish(PushEvent::ChannelCreate(channel.clone()));
    Ok(ok(channel))
}

#[patch(
    "/api/v1/servers/<server_id>/channels/<channel_id>",
    format = "json",
    data = "<body>",
    rank = 2
)]
pub fn update_channel(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    channel_id: &str,
    body: Json<UpdateChannelRequest>,
) -> Result<Json<ApiOk<Channel>>, ApiError> {
    let channel = {
        let conn = db.conn();
        require_manage_channels(&conn, server_id, &user.id)?;
        routes::load_channel(&conn, server_id, channel_id)?;

        if let Some(ref name) = body.name {
            let name = name.trim();
            if name.is_empty() || name.chars().count() > 100 {
                return Err(routes::validation("Channel name must be 1-100 characters"));
            }
            conn.execute(
                "UPDATE channels SET name = ?1 WHERE id = ?2",
                params![name, channel_id],
            )
            .map_err(routes::internal)?;
        }
        if let Some(ref topic) = body.topic {
            let trimmed = topic.trim();
            conn.execute(
                "UPDATE channels SET topic = ?1 WHERE id = ?2",
                params![
                    if trimmed.is_empty() { None } else { Some(trimmed) },
                    channel_id
                ],
            )
            .map_err(routes::internal)?;
        }
        if let Some(ref category) = body.category_id {
            if let Some(category_id) = category {
                let in_server: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM categories WHERE id = ?1 AND server_id = ?2",
                        params![category_id, server_id],
                        |r| r.get(0),
                    )
                    .unwrap_or(0);
                if in_server == 0 {
                    return Err(routes::not_found_err("Category not found"));
                }
            }
            conn.execute(
                "UPDATE channels SET category_id = ?1 WHERE id = ?2",
                params![category, channel_id],
            )
            .map_err(routes::internal)?;
        }
        if let Some(user_limit) = body.user_limit {
            conn.execute(
                "UPDATE channels SET user_limit = ?1 WHERE id = ?2",
                params![user_limit.max(0), channel_id],
            )
            .map_err(routes::internal)?;
        }
        if let Some(bitrate) = body.bitrate {
            conn.execute(
                "UPDATE channels SET bitrate = ?1 WHERE id = ?2",
                params![bitrate.max(8000), channel_id],
            )
            .map_err(routes::internal)?;
        }
        routes::load_channel(&conn, server_id, channel_id)?
    };

    events.publish(PushEvent::ChannelUpdate(channel.clone()));
    Ok(ok(channel))
}

#[delete("/api/v1/servers/<server_id>/channels/<channel_id>")]
pub fn delete_channel(
    db: &State<Db>,
    events: &State<EventBus>,
    voice: &State<Arc<VoiceRegistry>>,
    user: AuthUser,
    server_id: &str,
    channel_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    {
        let mut conn = db.conn();
        require_manage_channels(&conn, server_id, &user.id)?;
        routes::load_channel(&conn, server_id, channel_id)?;

        let tx = conn.transaction().map_err(routes::internal)?;
        tx.execute(
            "DELETE FROM messages_fts WHERE message_id IN
             (SELECT id FROM messages WHERE channel_id = ?1)",
            params![channel_id],
        )
        .map_err(routes::internal)?;
        tx.execute("DELETE FROM channels WHERE id = ?1", params![channel_id])
            .map_err(routes::internal)?;
        tx.commit().map_err(routes::internal)?;
    }

    for state in voice.clear_channel(channel_id) {
        events.publish(PushEvent::VoiceStateUpdate {
            action: "leave".to_string(),
            state,
        });
    }
    events.publish(PushEvent::ChannelDelete {
        server_id: server_id.to_string(),
        channel_id: channel_id.to_string(),
    });
    Ok(ok(serde_json::json!({"deleted": true})))
}

#[patch("/api/v1/servers/<server_id>/channels/reorder", format = "json", data = "<body>")]
pub fn reorder_channels(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    body: Json<ReorderRequest>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let (categories, channels) = {
        let mut conn = db.conn();
        require_manage_channels(&conn, server_id, &user.id)?;

        let tx = conn.transaction().map_err(routes::internal)?;
        for item in &body.items {
            tx.execute(
                "UPDATE channels SET position = ?1 WHERE id = ?2 AND server_id = ?3",
                params![item.position, &item.id, server_id],
            )
            .map_err(routes::internal)?;
        }
        tx.commit().map_err(routes::internal)?;

        (
            server_categories(&conn, server_id),
            server_channels(&conn, server_id),
        )
    };

    // One idempotent snapshot of the whole tree.
    events.publish(PushEvent::ChannelReorder {
        server_id: server_id.to_string(),
        categories,
        channels,
    });
    Ok(ok(serde_json::json!({"reordered": true})))
}

// --- Categories ---

#[get("/api/v1/servers/<server_id>/categories")]
pub fn list_categories(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
) -> Result<Json<ApiOk<Vec<Category>>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    Ok(ok(server_categories(&conn, server_id)))
}

#[post("/api/v1/servers/<server_id>/categories", format = "json", data = "<body>")]
pub fn create_category(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    body: Json<CreateCategoryRequest>,
) -> Result<Json<ApiOk<Category>>, ApiError> {
    let name = body.name.trim().to_string();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(routes::validation("Category name must be 1-100 characters"));
    }

    let category = {
        let conn = db.conn();
        require_manage_channels(&conn, server_id, &user.id)?;
        let position: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM categories WHERE server_id = ?1",
                params![server_id],
                |r| r.get(0),
            )
            .unwrap_or(0);
        let id = crypto::generate_id();
        conn.execute(
            "INSERT INTO categories (id, server_id, name, position) VALUES (?1, ?2, ?3, ?4)",
            params![&id, server_id, &name, position],
        )
        .map_err(routes::internal)?;
        Category {
            id,
            server_id: server_id.to_string(),
            name,
            position,
        }
    };

    events.publish(PushEvent::CategoryCreate(category.clone()));
    Ok(ok(category))
}

#[patch(
    "/api/v1/servers/<server_id>/categories/<category_id>",
    format = "json",
    data = "<body>"
)]
pub fn update_category(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    category_id: &str,
    body: Json<UpdateCategoryRequest>,
) -> Result<Json<ApiOk<Category>>, ApiError> {
    let category = {
        let conn = db.conn();
        require_manage_channels(&conn, server_id, &user.id)?;

        if let Some(ref name) = body.name {
            let name = name.trim();
            if name.is_empty() || name.chars().count() > 100 {
                return Err(routes::validation("Category name must be 1-100 characters"));
            }
            let updated = conn
                .execute(
                    "UPDATE categories SET name = ?1 WHERE id = ?2 AND server_id = ?3",
                    params![name, category_id, server_id],
                )
                .map_err(routes::internal)?;
            if updated == 0 {
                return Err(routes::not_found_err("Category not found"));
            }
        }
        conn.query_row(
            "SELECT id, server_id, name, position FROM categories
             WHERE id = ?1 AND server_id = ?2",
            params![category_id, server_id],
            Category::from_row,
        )
        .map_err(|_| routes::not_found_err("Category not found"))?
    };

    events.publish(PushEvent::CategoryUpdate(category.clone()));
    Ok(ok(category))
}

#[delete("/api/v1/servers/<server_id>/categories/<category_id>")]
pub fn delete_category(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    category_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    {
        let conn = db.conn();
        require_manage_channels(&conn, server_id, &user.id)?;
        // Channels survive; they fall out of the category.
        let deleted = conn
            .execute(
                "DELETE FROM categories WHERE id = ?1 AND server_id = ?2",
                params![category_id, server_id],
            )
            .map_err(routes::internal)?;
        if deleted == 0 {
            return Err(routes::not_found_err("Category not found"));
        }
    }

    events.publish(PushEvent::CategoryDelete {
        server_id: server_id.to_string(),
        category_id: category_id.to_string(),
    });
    Ok(ok(serde_json::json!({"deleted": true})))
}

// --- Channel permission overrides ---

#[get("/api/v1/servers/<server_id>/channels/<channel_id>/permissions")]
pub fn get_overrides(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
    channel_id: &str,
) -> Result<Json<ApiOk<Vec<ChannelOverride>>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    routes::load_channel(&conn, server_id, channel_id)?;
    let mut stmt = conn
        .prepare("SELECT channel_id, role_id, allow, deny FROM channel_overrides WHERE channel_id = ?1")
        .map_err(routes::internal)?;
    let overrides: Vec<ChannelOverride> = stmt
        .query_map(params![channel_id], |row| {
            Ok(ChannelOverride {
                channel_id: row.get(0)?,
                role_id: row.get(1)?,
                allow: row.get(2)?,
                deny: row.get(3)?,
            })
        })
        .map_err(routes::internal)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(ok(overrides))
}

#[put(
    "/api/v1/servers/<server_id>/channels/<channel_id>/permissions/<role_id>",
    format = "json",
    data = "<body>"
)]
pub fn put_override(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    channel_id: &str,
    role_id: &str,
    body: Json<OverrideRequest>,
) -> Result<Json<ApiOk<ChannelOverride>>, ApiError> {
    let allow = Permissions::from_bits_truncate(body.allow);
    let deny = Permissions::from_bits_truncate(body.deny);
    if !(allow & deny).is_empty() {
        return Err(routes::validation("Allow and deny masks must be disjoint"));
    }
    let scoped = Permissions::channel_scoped();
    if !scoped.contains(allow) || !scoped.contains(deny) {
        return Err(routes::validation(
            "Only channel-scoped permission bits may be overridden",
        ));
    }

    let row = {
        let conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
        let perms = permissions::effective(&conn, server_id, &user.id, None);
        if !perms.contains(Permissions::MANAGE_ROLES) {
            return Err(routes::forbidden());
        }
        routes::load_channel(&conn, server_id, channel_id)?;
        let role_exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM roles WHERE server_id = ?1 AND id = ?2",
                params![server_id, role_id],
                |r| r.get(0),
            )
            .unwrap_or(0);
        if role_exists == 0 {
            return Err(routes::not_found_err("Role not found"));
        }

        conn.execute(
            "INSERT INTO channel_overrides (channel_id, role_id, allow, deny)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (channel_id, role_id)
             DO UPDATE SET allow = excluded.allow, deny = excluded.deny",
            params![channel_id, role_id, allow.bits(), deny.bits()],
        )
        .map_err(routes::internal)?;
        ChannelOverride {
            channel_id: channel_id.to_string(),
            role_id: role_id.to_string(),
            allow: allow.bits(),
            deny: deny.bits(),
        }
    };

    events.publish(PushEvent::ChannelPermissionUpdate {
        server_id: server_id.to_string(),
        override_row: row.clone(),
    });
    Ok(ok(row))
}

#[delete("/api/v1/servers/<server_id>/channels/<channel_id>/permissions/<role_id>")]
pub fn delete_override(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    channel_id: &str,
    role_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    {
        let conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
        let perms = permissions::effective(&conn, server_id, &user.id, None);
        if !perms.contains(Permissions::MANAGE_ROLES) {
            return Err(routes::forbidden());
        }
        routes::load_channel(&conn, server_id, channel_id)?;
        let deleted = conn
            .execute(
                "DELETE FROM channel_overrides WHERE channel_id = ?1 AND role_id = ?2",
                params![channel_id, role_id],
            )
            .map_err(routes::internal)?;
        if deleted == 0 {
            return Err(routes::not_found_err("Override not found"));
        }
    }

    events.publish(PushEvent::ChannelPermissionDelete {
        server_id: server_id.to_string(),
        channel_id: channel_id.to_string(),
        role_id: role_id.to_string(),
    });
    Ok(ok(serde_json::json!({"deleted": true})))
}
