// Route module decomposition — each domain area in its own file.
// Shared types (request guards, error helpers) live here; route functions in
// submodules.

mod admin;
mod auth;
mod channels;
mod dms;
mod friends;
mod invites;
mod members;
mod messages;
mod pins;
mod reactions;
mod read_state;
mod roles;
mod search;
mod servers;
mod system;
mod users;
mod voice;
mod ws;

// --- Re-exports (all route functions used by lib.rs mount) ---

pub use admin::{
    admin_assign_instance, admin_create_instance, admin_delete_instance, admin_instance_metrics,
    admin_instance_metrics_history, admin_list_instances, admin_list_servers, admin_list_users,
    admin_update_instance,
};
pub use auth::{apply_reset, change_password, login, logout, refresh, register, request_reset};
pub use channels::{
    create_category, create_channel, delete_category, delete_channel, delete_override,
    get_overrides, list_categories, list_channels, put_override, reorder_channels,
    update_category, update_channel,
};
pub use dms::{
    delete_dm_message, dm_search, edit_dm_message, get_dm_messages, get_dm_pins, list_dms,
    mark_dm_read, open_dm, pin_dm_message, send_dm_message, toggle_dm_reaction, unpin_dm_message,
};
pub use friends::{
    accept_friend_request, block_user, decline_friend_request, list_friends, remove_friend,
    send_friend_request, unblock_user,
};
pub use invites::{accept_invite, create_invite, delete_invite, list_invites, preview_invite};
pub use members::{ban_member, delete_ban, get_member, kick_member, list_bans, list_members, update_member_roles};
pub use messages::{delete_message, edit_message, get_messages, send_message};
pub use pins::{list_pins, pin_message, unpin_message};
pub use reactions::toggle_reaction;
pub use read_state::{get_unread, mark_read};
pub use roles::{create_role, delete_role, list_roles, reorder_roles, update_role};
pub use search::search_messages;
pub use servers::{
    create_server, delete_server, get_server, leave_server, list_servers, reorder_servers,
    update_server, upload_icon,
};
pub use system::{
    forbidden_catcher, health, internal_error, not_found, too_many_requests, unauthorized,
};
pub use users::{get_me, update_me};
pub use voice::{voice_states, voice_token};
pub use ws::ws_connect;

use crate::config::Config;
use crate::crypto;
use crate::db::Db;
use crate::models::UserProfile;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rusqlite::{params, Connection};

// --- Error envelope ---

pub type ApiError = (Status, Json<serde_json::Value>);

/// `{"success": false, "error": {"code": ..., "message": ...}}` with the
/// mapped HTTP status. Codes are the stable tags of the error taxonomy.
pub fn fail(status: Status, code: &str, message: &str) -> ApiError {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": {"code": code, "message": message}
        })),
    )
}

pub fn validation(message: &str) -> ApiError {
    fail(Status::BadRequest, "validation", message)
}

pub fn unauthenticated() -> ApiError {
    fail(Status::Unauthorized, "unauthenticated", "Invalid or expired token")
}

pub fn forbidden() -> ApiError {
    fail(Status::Forbidden, "forbidden", "Insufficient permissions")
}

pub fn not_found_err(what: &str) -> ApiError {
    fail(Status::NotFound, "not_found", what)
}

pub fn conflict(message: &str) -> ApiError {
    fail(Status::Conflict, "conflict", message)
}

pub fn banned() -> ApiError {
    fail(Status::Forbidden, "banned", "Banned from this server")
}

pub fn resource_exhausted(message: &str) -> ApiError {
    fail(Status::ServiceUnavailable, "resource_exhausted", message)
}

pub fn rate_limited(info: &crate::rate_limit::RateLimitInfo, message: &str) -> ApiError {
    (
        Status::TooManyRequests,
        Json(serde_json::json!({
            "success": false,
            "error": {
                "code": "rate_limited",
                "message": message,
                "retry_after_secs": info.retry_after_secs,
                "limit": info.limit
            }
        })),
    )
}

pub fn internal<E: std::fmt::Display>(e: E) -> ApiError {
    fail(Status::InternalServerError, "internal", &e.to_string())
}

// --- Request guards ---

pub struct ClientIp(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = req
            .headers()
            .get_one("X-Forwarded-For")
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .or_else(|| req.remote().map(|r| r.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        Outcome::Success(ClientIp(ip))
    }
}

/// Bearer-token guard: verifies the HS256 access token and loads the caller.
pub struct AuthUser {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub is_platform_admin: bool,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthUser {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(token) = req
            .headers()
            .get_one("Authorization")
            .and_then(|auth| auth.strip_prefix("Bearer "))
        else {
            return Outcome::Error((Status::Unauthorized, ()));
        };
        let (Some(config), Some(db)) = (
            req.rocket().state::<Config>(),
            req.rocket().state::<Db>(),
        ) else {
            return Outcome::Error((Status::InternalServerError, ()));
        };
        let Some(claims) = crypto::verify_jwt(token, &config.token_secret) else {
            return Outcome::Error((Status::Unauthorized, ()));
        };
        let Some(user_id) = claims.get("sub").and_then(|v| v.as_str()) else {
            return Outcome::Error((Status::Unauthorized, ()));
        };

        let conn = db.conn();
        let user = conn.query_row(
            "SELECT id, username, display_name, avatar_url, is_platform_admin
             FROM users WHERE id = ?1",
            params![user_id],
            |row| {
                Ok(AuthUser {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    display_name: row.get(2)?,
                    avatar_url: row.get(3)?,
                    is_platform_admin: row.get::<_, i64>(4)? != 0,
                })
            },
        );
        match user {
            Ok(user) => Outcome::Success(user),
            Err(_) => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}

/// Guard for the platform-admin surface.
pub struct AdminUser(pub AuthUser);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminUser {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match AuthUser::from_request(req).await {
            Outcome::Success(user) if user.is_platform_admin => Outcome::Success(AdminUser(user)),
            Outcome::Success(_) => Outcome::Error((Status::Forbidden, ())),
            Outcome::Error(e) => Outcome::Error(e),
            Outcome::Forward(f) => Outcome::Forward(f),
        }
    }
}

// --- Shared store lookups ---

/// Membership gate: servers a user is not in are invisible to them.
pub fn require_member(conn: &Connection, server_id: &str, user_id: &str) -> Result<(), ApiError> {
    let is_member: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM server_members WHERE server_id = ?1 AND user_id = ?2",
            params![server_id, user_id],
            |r| r.get::<_, i64>(0),
        )
        .map(|c| c > 0)
        .unwrap_or(false);
    if is_member {
        Ok(())
    } else {
        Err(not_found_err("Server not found"))
    }
}

pub fn load_channel(
    conn: &Connection,
    server_id: &str,
    channel_id: &str,
) -> Result<crate::models::Channel, ApiError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM channels WHERE id = ?1 AND server_id = ?2",
            crate::models::CHANNEL_COLUMNS
        ),
        params![channel_id, server_id],
        crate::models::Channel::from_row,
    )
    .map_err(|_| not_found_err("Channel not found"))
}

pub fn load_profile(conn: &Connection, user_id: &str) -> Result<UserProfile, ApiError> {
    conn.query_row(
        "SELECT id, username, display_name, avatar_url, status, custom_status
         FROM users WHERE id = ?1",
        params![user_id],
        UserProfile::from_row,
    )
    .map_err(|_| not_found_err("User not found"))
}

/// Server ids a user belongs to (ready frame, session scopes).
pub fn member_server_ids(conn: &Connection, user_id: &str) -> Vec<String> {
    conn.prepare("SELECT server_id FROM server_members WHERE user_id = ?1")
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map(params![user_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .unwrap_or_default()
}

/// True when a `blocked` friendship edge exists between the two users.
pub fn is_blocked(conn: &Connection, a: &str, b: &str) -> bool {
    let (low, high) = crate::events::order_pair(a, b);
    conn.query_row(
        "SELECT COUNT(*) FROM friendships
         WHERE user_low = ?1 AND user_high = ?2 AND status = 'blocked'",
        params![low, high],
        |r| r.get::<_, i64>(0),
    )
    .map(|c| c > 0)
    .unwrap_or(false)
}
