use crate::db::Db;
use crate::events::{EventBus, PushEvent};
use crate::hub::Hub;
use crate::models::*;
use crate::routes::{self, ApiError, AuthUser};
use rocket::serde::json::Json;
use rocket::{get, patch, State};
use rusqlite::params;
use std::sync::Arc;

pub const PRESENCE_STATUSES: [&str; 4] = ["online", "idle", "dnd", "offline"];

fn load_me(conn: &rusqlite::Connection, user_id: &str) -> Result<PrivateUser, ApiError> {
    conn.query_row(
        "SELECT id, username, display_name, avatar_url, email, preferred_language,
                status, custom_status, is_platform_admin, created_at
         FROM users WHERE id = ?1",
        params![user_id],
        PrivateUser::from_row,
    )
    .map_err(|_| routes::not_found_err("User not found"))
}

#[get("/api/v1/users/me")]
pub fn get_me(db: &State<Db>, user: AuthUser) -> Result<Json<ApiOk<PrivateUser>>, ApiError> {
    let conn = db.conn();
    Ok(ok(load_me(&conn, &user.id)?))
}

#[patch("/api/v1/users/me", format = "json", data = "<body>")]
pub fn update_me(
    db: &State<Db>,
    events: &State<EventBus>,
    hub: &State<Arc<Hub>>,
    user: AuthUser,
    body: Json<UpdateMeRequest>,
) -> Result<Json<ApiOk<PrivateUser>>, ApiError> {
    if let Some(ref name) = body.display_name {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > 32 {
            return Err(routes::validation("Display name must be 1-32 characters"));
        }
    }
    if let Some(ref status) = body.status
        && !PRESENCE_STATUSES.contains(&status.as_str())
    {
        return Err(routes::validation("Unknown presence status"));
    }
    if let Some(ref custom) = body.custom_status
        && custom.chars().count() > 128
    {
        return Err(routes::validation("Custom status must be at most 128 characters"));
    }
    if let Some(ref lang) = body.preferred_language
        && !matches!(lang.as_str(), "en" | "tr")
    {
        return Err(routes::validation("Unsupported language"));
    }

    let me = {
        let conn = db.conn();
        if let Some(ref name) = body.display_name {
            conn.execute(
                "UPDATE users SET display_name = ?1 WHERE id = ?2",
                params![name.trim(), &user.id],
            )
            .map_err(routes::internal)?;
        }
        if let Some(ref avatar) = body.avatar_url {
            conn.execute(
                "UPDATE users SET avatar_url = ?1 WHERE id = ?2",
                params![avatar, &user.id],
            )
            .map_err(routes::internal)?;
        }
        if let Some(ref custom) = body.custom_status {
            let trimmed = custom.trim();
            conn.execute(
                "UPDATE users SET custom_status = ?1 WHERE id = ?2",
                params![
                    if trimmed.is_empty() { None } else { Some(trimmed) },
                    &user.id
                ],
            )
            .map_err(routes::internal)?;
        }
        if let Some(ref lang) = body.preferred_language {
            conn.execute(
                "UPDATE users SET preferred_language = ?1 WHERE id = ?2",
                params![lang, &user.id],
            )
            .map_err(routes::internal)?;
        }
        if let Some(ref status) = body.status {
            conn.execute(
                "UPDATE users SET status = ?1 WHERE id = ?2",
                params![status, &user.id],
            )
            .map_err(routes::internal)?;
        }
        load_me(&conn, &user.id)?
    };

    // Explicit presence intent fans out while the user is connected.
    if let Some(ref status) = body.status
        && hub.user_is_connected(&user.id)
    {
        events.publish(PushEvent::PresenceUpdate {
            user_id: user.id.clone(),
            status: status.clone(),
        });
    }

    Ok(ok(me))
}
