use crate::crypto;
use crate::db::{now_ts, Db};
use crate::events::{EventBus, PushEvent};
use crate::hub::Hub;
use crate::models::*;
use crate::permissions::{self, Permissions};
use crate::routes::{self, ApiError, AuthUser};
use chrono::{Duration, Utc};
use rocket::serde::json::Json;
use rocket::{delete, get, post, State};
use rusqlite::{params, Connection};
use std::sync::Arc;

fn invite_is_live(max_uses: i64, uses: i64, expires_at: &Option<String>) -> bool {
    let uses_ok = max_uses == 0 || uses < max_uses;
    let expiry_ok = match expires_at {
        Some(ts) => ts.as_str() > now_ts().as_str(),
        None => true,
    };
    uses_ok && expiry_ok
}

/// Atomic accept: validity check, ban gate, membership insert, use count —
/// one transaction. Returns the joined server id. Shared by the join route
/// and invite-bound registration.
pub(crate) fn redeem_invite(
    conn: &Connection,
    code: &str,
    user_id: &str,
) -> Result<String, ApiError> {
    let invite = conn
        .query_row(
            "SELECT code, server_id, created_by, max_uses, uses, expires_at, created_at
             FROM invites WHERE code = ?1",
            params![code],
            Invite::from_row,
        )
        .map_err(|_| routes::not_found_err("Invite not found"))?;
    if !invite_is_live(invite.max_uses, invite.uses, &invite.expires_at) {
        return Err(routes::not_found_err("Invite not found"));
    }

    let is_banned: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM bans WHERE server_id = ?1 AND user_id = ?2",
            params![&invite.server_id, user_id],
            |r| r.get(0),
        )
        .unwrap_or(0);
    if is_banned > 0 {
        return Err(routes::banned());
    }

    let already: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM server_members WHERE server_id = ?1 AND user_id = ?2",
            params![&invite.server_id, user_id],
            |r| r.get(0),
        )
        .unwrap_or(0);
    if already > 0 {
        return Err(routes::conflict("Already a member of this server"));
    }

    conn.execute(
        "INSERT INTO server_members (server_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
        params![&invite.server_id, user_id, now_ts()],
    )
    .map_err(routes::internal)?;
    conn.execute(
        "INSERT INTO user_server_order (user_id, server_id, position)
         SELECT ?1, ?2, COALESCE(MAX(position) + 1, 0) FROM user_server_order WHERE user_id = ?1",
        params![user_id, &invite.server_id],
    )
    .map_err(routes::internal)?;
    conn.execute(
        "UPDATE invites SET uses = uses + 1 WHERE code = ?1",
        params![code],
    )
    .map_err(routes::internal)?;

    Ok(invite.server_id)
}

#[get("/api/v1/servers/<server_id>/invites")]
pub fn list_invites(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
) -> Result<Json<ApiOk<Vec<Invite>>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    let perms = permissions::effective(&conn, server_id, &user.id, None);
    if !perms.contains(Permissions::MANAGE_INVITES) {
        return Err(routes::forbidden());
    }

    let mut stmt = conn
        .prepare(
            "SELECT code, server_id, created_by, max_uses, uses, expires_at, created_at
             FROM invites WHERE server_id = ?1 ORDER BY created_at DESC",
        )
        .map_err(routes::internal)?;
    let invites: Vec<Invite> = stmt
        .query_map(params![server_id], Invite::from_row)
        .map_err(routes::internal)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(ok(invites))
}

#[post("/api/v1/servers/<server_id>/invites", format = "json", data = "<body>")]
pub fn create_invite(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
    body: Json<CreateInviteRequest>,
) -> Result<Json<ApiOk<Invite>>, ApiError> {
    if body.max_uses < 0 {
        return Err(routes::validation("max_uses must be non-negative"));
    }

    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    let perms = permissions::effective(&conn, server_id, &user.id, None);
    if !perms.contains(Permissions::MANAGE_INVITES) {
        return Err(routes::forbidden());
    }

    let code = crypto::generate_invite_code();
    let expires_at = body
        .expires_in_secs
        .filter(|s| *s > 0)
        .map(|s| {
            (Utc::now() + Duration::seconds(s)).to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        });
    conn.execute(
        "INSERT INTO invites (code, server_id, created_by, max_uses, uses, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
        params![&code, server_id, &user.id, body.max_uses, &expires_at, now_ts()],
    )
    .map_err(routes::internal)?;

    let invite = conn
        .query_row(
            "SELECT code, server_id, created_by, max_uses, uses, expires_at, created_at
             FROM invites WHERE code = ?1",
            params![&code],
            Invite::from_row,
        )
        .map_err(routes::internal)?;
    Ok(ok(invite))
}

#[delete("/api/v1/servers/<server_id>/invites/<code>")]
pub fn delete_invite(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
    code: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    let perms = permissions::effective(&conn, server_id, &user.id, None);
    if !perms.contains(Permissions::MANAGE_INVITES) {
        return Err(routes::forbidden());
    }
    let removed = conn
        .execute(
            "DELETE FROM invites WHERE code = ?1 AND server_id = ?2",
            params![code, server_id],
        )
        .map_err(routes::internal)?;
    if removed == 0 {
        return Err(routes::not_found_err("Invite not found"));
    }
    Ok(ok(serde_json::json!({"deleted": true})))
}

/// Unauthenticated preview for the join screen.
#[get("/api/v1/invites/<code>")]
pub fn preview_invite(db: &State<Db>, code: &str) -> Result<Json<ApiOk<InvitePreview>>, ApiError> {
    let conn = db.conn();
    let invite = conn
        .query_row(
            "SELECT code, server_id, created_by, max_uses, uses, expires_at, created_at
             FROM invites WHERE code = ?1",
            params![code],
            Invite::from_row,
        )
        .map_err(|_| routes::not_found_err("Invite not found"))?;
    if !invite_is_live(invite.max_uses, invite.uses, &invite.expires_at) {
        return Err(routes::not_found_err("Invite not found"));
    }

    let preview = conn
        .query_row(
            "SELECT s.name, s.icon_url,
                    (SELECT COUNT(*) FROM server_members m WHERE m.server_id = s.id)
             FROM servers s WHERE s.id = ?1",
            params![&invite.server_id],
            |row| {
                Ok(InvitePreview {
                    server_name: row.get(0)?,
                    icon_url: row.get(1)?,
                    member_count: row.get(2)?,
                })
            },
        )
        .map_err(|_| routes::not_found_err("Invite not found"))?;
    Ok(ok(preview))
}

#[post("/api/v1/servers/join", format = "json", data = "<body>")]
pub fn accept_invite(
    db: &State<Db>,
    events: &State<EventBus>,
    hub: &State<Arc<Hub>>,
    user: AuthUser,
    body: Json<JoinServerRequest>,
) -> Result<Json<ApiOk<Server>>, ApiError> {
    let code = body.invite_code.trim();
    if code.is_empty() {
        return Err(routes::validation("invite_code is required"));
    }

    let (server, member) = {
        let mut conn = db.conn();
        let tx = conn.transaction().map_err(routes::internal)?;
        let server_id = redeem_invite(&tx, code, &user.id)?;
        tx.commit().map_err(routes::internal)?;
        (
            crate::routes::servers::load_server(&conn, &server_id)?,
            crate::routes::members::load_member(&conn, &server_id, &user.id)?,
        )
    };

    hub.add_server(&user.id, &server.id);
    events.publish(PushEvent::MemberJoin {
        server_id: server.id.clone(),
        member,
    });
    Ok(ok(server))
}
