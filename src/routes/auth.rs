use crate::config::Config;
use crate::crypto;
use crate::db::{now_ts, Db};
use crate::events::{EventBus, PushEvent};
use crate::hub::Hub;
use crate::mailer;
use crate::models::*;
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::routes::{self, ApiError, AuthUser, ClientIp};
use chrono::{Duration, Utc};
use rocket::serde::json::Json;
use rocket::{post, State};
use rusqlite::params;
use std::sync::Arc;

/// Access-token lifetime.
const ACCESS_TTL_SECS: i64 = 15 * 60;
/// Refresh-token lifetime.
const REFRESH_TTL_DAYS: i64 = 7;
/// Reset-token lifetime.
const RESET_TTL_MINS: i64 = 30;

fn sign_access_token(config: &Config, user_id: &str, username: &str) -> String {
    let claims = serde_json::json!({
        "sub": user_id,
        "username": username,
        "exp": Utc::now().timestamp() + ACCESS_TTL_SECS,
    });
    crypto::sign_jwt(&claims, &config.token_secret)
}

/// Mint a refresh token and persist its hash. Caller must hold the lock or
/// run inside a transaction when rotation atomicity matters.
fn insert_session(conn: &rusqlite::Connection, user_id: &str) -> rusqlite::Result<String> {
    let token = crypto::generate_token();
    let expires = (Utc::now() + Duration::days(REFRESH_TTL_DAYS))
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    conn.execute(
        "INSERT INTO sessions (token_hash, user_id, expires_at, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![crypto::token_hash(&token), user_id, expires, now_ts()],
    )?;
    Ok(token)
}

fn load_private_user(conn: &rusqlite::Connection, user_id: &str) -> Result<PrivateUser, ApiError> {
    conn.query_row(
        "SELECT id, username, display_name, avatar_url, email, preferred_language,
                status, custom_status, is_platform_admin, created_at
         FROM users WHERE id = ?1",
        params![user_id],
        PrivateUser::from_row,
    )
    .map_err(routes::internal)
}

fn valid_username(name: &str) -> bool {
    (3..=32).contains(&name.chars().count())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[post("/api/v1/auth/register", format = "json", data = "<body>")]
pub async fn register(
    db: &State<Db>,
    config: &State<Config>,
    events: &State<EventBus>,
    hub: &State<Arc<Hub>>,
    rate_limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    ip: ClientIp,
    body: Json<RegisterRequest>,
) -> Result<Json<ApiOk<AuthTokens>>, ApiError> {
    let rl = rate_limiter.check(
        &format!("auth:{}", ip.0),
        rate_config.auth_max,
        rate_config.auth_window_secs,
    );
    if !rl.allowed {
        return Err(routes::rate_limited(&rl, "Too many authentication attempts"));
    }

    let username = body.username.trim().to_string();
    let password = body.password.clone();
    if !valid_username(&username) {
        return Err(routes::validation(
            "Username must be 3-32 letters, digits or underscores",
        ));
    }
    if password.len() < 8 || password.len() > 128 {
        return Err(routes::validation("Password must be 8-128 characters"));
    }
    let display_name = body
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&username)
        .to_string();
    if display_name.chars().count() > 32 {
        return Err(routes::validation("Display name must be at most 32 characters"));
    }
    let language = match body.preferred_language.as_deref() {
        None => "en".to_string(),
        Some(l @ ("en" | "tr")) => l.to_string(),
        Some(_) => return Err(routes::validation("Unsupported language")),
    };

    {
        let conn = db.conn();
        let taken: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE username = ?1 COLLATE NOCASE",
                params![&username],
                |r| r.get(0),
            )
            .unwrap_or(0);
        if taken > 0 {
            return Err(routes::conflict("Username already taken"));
        }
    }

    let password_hash = tokio::task::spawn_blocking(move || crypto::hash_password(&password))
        .await
        .map_err(routes::internal)?
        .map_err(routes::internal)?;

    let user_id = crypto::generate_id();
    let (tokens, joined) = {
        let mut conn = db.conn();
        let tx = conn.transaction().map_err(routes::internal)?;

        // First account on the platform becomes its admin.
        let user_count: i64 = tx
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap_or(0);
        tx.execute(
            "INSERT INTO users (id, username, display_name, password_hash, email,
                                preferred_language, is_platform_admin, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &user_id,
                &username,
                &display_name,
                &password_hash,
                body.email.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                &language,
                (user_count == 0) as i64,
                now_ts()
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                routes::conflict("Username already taken")
            } else {
                routes::internal(e)
            }
        })?;

        // Registration bound to an invite joins that server atomically.
        let joined = match body.invite_code.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(code) => Some(crate::routes::invites::redeem_invite(&tx, code, &user_id)?),
            None => None,
        };

        let refresh = insert_session(&tx, &user_id).map_err(routes::internal)?;
        tx.commit().map_err(routes::internal)?;

        let user = load_private_user(&conn, &user_id)?;
        let access = sign_access_token(config, &user_id, &username);
        (
            AuthTokens {
                access_token: access,
                refresh_token: refresh,
                user,
            },
            joined,
        )
    };

    if let Some(server_id) = joined {
        let member = {
            let conn = db.conn();
            crate::routes::members::load_member(&conn, &server_id, &user_id)?
        };
        hub.add_server(&user_id, &server_id);
        events.publish(PushEvent::MemberJoin { server_id, member });
    }

    Ok(ok(tokens))
}

#[post("/api/v1/auth/login", format = "json", data = "<body>")]
pub async fn login(
    db: &State<Db>,
    config: &State<Config>,
    rate_limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    ip: ClientIp,
    body: Json<LoginRequest>,
) -> Result<Json<ApiOk<AuthTokens>>, ApiError> {
    let rl = rate_limiter.check(
        &format!("auth:{}", ip.0),
        rate_config.auth_max,
        rate_config.auth_window_secs,
    );
    if !rl.allowed {
        return Err(routes::rate_limited(&rl, "Too many authentication attempts"));
    }

    let username = body.username.trim().to_string();
    let row: Option<(String, String)> = {
        let conn = db.conn();
        conn.query_row(
            "SELECT id, password_hash FROM users WHERE username = ?1 COLLATE NOCASE",
            params![&username],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .ok()
    };
    let Some((user_id, password_hash)) = row else {
        return Err(routes::fail(
            rocket::http::Status::Unauthorized,
            "unauthenticated",
            "Invalid credentials",
        ));
    };

    let password = body.password.clone();
    let matches =
        tokio::task::spawn_blocking(move || crypto::verify_password(&password, &password_hash))
            .await
            .map_err(routes::internal)?;
    if !matches {
        return Err(routes::fail(
            rocket::http::Status::Unauthorized,
            "unauthenticated",
            "Invalid credentials",
        ));
    }

    let conn = db.conn();
    let refresh = insert_session(&conn, &user_id).map_err(routes::internal)?;
    let user = load_private_user(&conn, &user_id)?;
    let access = sign_access_token(config, &user_id, &user.username);
    Ok(ok(AuthTokens {
        access_token: access,
        refresh_token: refresh,
        user,
    }))
}

#[post("/api/v1/auth/refresh", format = "json", data = "<body>")]
pub fn refresh(
    db: &State<Db>,
    config: &State<Config>,
    body: Json<RefreshRequest>,
) -> Result<Json<ApiOk<AuthTokens>>, ApiError> {
    let hash = crypto::token_hash(body.refresh_token.trim());
    let mut conn = db.conn();
    let tx = conn.transaction().map_err(routes::internal)?;

    let row: Option<(String, String)> = tx
        .query_row(
            "SELECT user_id, expires_at FROM sessions WHERE token_hash = ?1",
            params![&hash],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .ok();
    let Some((user_id, expires_at)) = row else {
        return Err(routes::unauthenticated());
    };
    if expires_at <= now_ts() {
        tx.execute("DELETE FROM sessions WHERE token_hash = ?1", params![&hash])
            .ok();
        tx.commit().ok();
        return Err(routes::fail(
            rocket::http::Status::Unauthorized,
            "unauthenticated",
            "Refresh token expired",
        ));
    }

    // Rotation: the old hash leaves and the new one lands in one
    // transaction, so a concurrent refresh with the prior token can never
    // also succeed.
    let removed = tx
        .execute("DELETE FROM sessions WHERE token_hash = ?1", params![&hash])
        .map_err(routes::internal)?;
    if removed == 0 {
        return Err(routes::unauthenticated());
    }
    let new_refresh = insert_session(&tx, &user_id).map_err(routes::internal)?;
    tx.commit().map_err(routes::internal)?;

    let user = load_private_user(&conn, &user_id)?;
    let access = sign_access_token(config, &user_id, &user.username);
    Ok(ok(AuthTokens {
        access_token: access,
        refresh_token: new_refresh,
        user,
    }))
}

#[post("/api/v1/auth/logout", format = "json", data = "<body>")]
pub fn logout(
    db: &State<Db>,
    body: Json<RefreshRequest>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let conn = db.conn();
    conn.execute(
        "DELETE FROM sessions WHERE token_hash = ?1",
        params![crypto::token_hash(body.refresh_token.trim())],
    )
    .map_err(routes::internal)?;
    Ok(ok(serde_json::json!({"logged_out": true})))
}

#[post("/api/v1/auth/password", format = "json", data = "<body>")]
pub async fn change_password(
    db: &State<Db>,
    user: AuthUser,
    body: Json<ChangePasswordRequest>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    if body.new_password.len() < 8 || body.new_password.len() > 128 {
        return Err(routes::validation("Password must be 8-128 characters"));
    }

    let stored: String = {
        let conn = db.conn();
        conn.query_row(
            "SELECT password_hash FROM users WHERE id = ?1",
            params![&user.id],
            |r| r.get(0),
        )
        .map_err(routes::internal)?
    };

    let current = body.current_password.clone();
    let stored_for_check = stored.clone();
    let matches =
        tokio::task::spawn_blocking(move || crypto::verify_password(&current, &stored_for_check))
            .await
            .map_err(routes::internal)?;
    if !matches {
        return Err(routes::fail(
            rocket::http::Status::Unauthorized,
            "unauthenticated",
            "Current password is incorrect",
        ));
    }

    let new_password = body.new_password.clone();
    let new_hash = tokio::task::spawn_blocking(move || crypto::hash_password(&new_password))
        .await
        .map_err(routes::internal)?
        .map_err(routes::internal)?;

    let mut conn = db.conn();
    let tx = conn.transaction().map_err(routes::internal)?;
    tx.execute(
        "UPDATE users SET password_hash = ?1 WHERE id = ?2",
        params![&new_hash, &user.id],
    )
    .map_err(routes::internal)?;
    // A password change invalidates every live refresh session.
    tx.execute("DELETE FROM sessions WHERE user_id = ?1", params![&user.id])
        .map_err(routes::internal)?;
    tx.commit().map_err(routes::internal)?;

    Ok(ok(serde_json::json!({"changed": true})))
}

#[post("/api/v1/auth/forgot", format = "json", data = "<body>")]
pub fn request_reset(
    db: &State<Db>,
    config: &State<Config>,
    rate_limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    ip: ClientIp,
    body: Json<ForgotRequest>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let rl = rate_limiter.check(
        &format!("auth:{}", ip.0),
        rate_config.auth_max,
        rate_config.auth_window_secs,
    );
    if !rl.allowed {
        return Err(routes::rate_limited(&rl, "Too many authentication attempts"));
    }

    let email = body.email.trim().to_string();
    let found: Option<(String, String)> = {
        let conn = db.conn();
        conn.query_row(
            "SELECT id, username FROM users WHERE email = ?1",
            params![&email],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .ok()
    };

    // The response never reveals whether the address exists.
    if let Some((user_id, username)) = found {
        let token = crypto::generate_token();
        let expires = (Utc::now() + Duration::minutes(RESET_TTL_MINS))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let conn = db.conn();
        conn.execute(
            "INSERT INTO password_resets (token_hash, user_id, expires_at) VALUES (?1, ?2, ?3)",
            params![crypto::token_hash(&token), &user_id, &expires],
        )
        .map_err(routes::internal)?;
        mailer::dispatch_reset(config.reset_webhook_url.clone(), email, username, token);
    }

    Ok(ok(serde_json::json!({"sent": true})))
}

#[post("/api/v1/auth/reset", format = "json", data = "<body>")]
pub async fn apply_reset(
    db: &State<Db>,
    body: Json<ResetRequest>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    if body.new_password.len() < 8 || body.new_password.len() > 128 {
        return Err(routes::validation("Password must be 8-128 characters"));
    }
    let hash = crypto::token_hash(body.token.trim());

    let user_id: String = {
        let conn = db.conn();
        let row: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT user_id, expires_at, used FROM password_resets WHERE token_hash = ?1",
                params![&hash],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .ok();
        match row {
            Some((user_id, expires_at, 0)) if expires_at > now_ts() => user_id,
            _ => return Err(routes::unauthenticated()),
        }
    };

    let new_password = body.new_password.clone();
    let new_hash = tokio::task::spawn_blocking(move || crypto::hash_password(&new_password))
        .await
        .map_err(routes::internal)?
        .map_err(routes::internal)?;

    let mut conn = db.conn();
    let tx = conn.transaction().map_err(routes::internal)?;
    // Single use: losing the race to another apply means failing here.
    let claimed = tx
        .execute(
            "UPDATE password_resets SET used = 1 WHERE token_hash = ?1 AND used = 0",
            params![&hash],
        )
        .map_err(routes::internal)?;
    if claimed == 0 {
        return Err(routes::unauthenticated());
    }
    tx.execute(
        "UPDATE users SET password_hash = ?1 WHERE id = ?2",
        params![&new_hash, &user_id],
    )
    .map_err(routes::internal)?;
    tx.execute("DELETE FROM sessions WHERE user_id = ?1", params![&user_id])
        .map_err(routes::internal)?;
    tx.commit().map_err(routes::internal)?;

    Ok(ok(serde_json::json!({"reset": true})))
}
