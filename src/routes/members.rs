use crate::db::{now_ts, Db};
use crate::events::{EventBus, PushEvent};
use crate::hub::Hub;
use crate::models::*;
use crate::permissions::{self, Permissions, Rank, ROLE_EVERYONE, ROLE_OWNER};
use crate::routes::{self, ApiError, AuthUser};
use crate::voice::VoiceRegistry;
use rocket::serde::json::Json;
use rocket::{delete, get, patch, post, State};
use rusqlite::{params, Connection};
use std::sync::Arc;

pub(crate) fn load_member(
    conn: &Connection,
    server_id: &str,
    user_id: &str,
) -> Result<Member, ApiError> {
    let (user, joined_at) = conn
        .query_row(
            "SELECT u.id, u.username, u.display_name, u.avatar_url, u.status, u.custom_status,
                    m.joined_at
             FROM server_members m JOIN users u ON u.id = m.user_id
             WHERE m.server_id = ?1 AND m.user_id = ?2",
            params![server_id, user_id],
            |row| {
                Ok((
                    UserProfile {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        display_name: row.get(2)?,
                        avatar_url: row.get(3)?,
                        status: row.get(4)?,
                        custom_status: row.get(5)?,
                    },
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .map_err(|_| routes::not_found_err("Member not found"))?;
    Ok(Member {
        user,
        joined_at,
        role_ids: permissions::member_role_ids(conn, server_id, user_id),
    })
}

#[get("/api/v1/servers/<server_id>/members")]
pub fn list_members(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
) -> Result<Json<ApiOk<Vec<Member>>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    let user_ids: Vec<String> = conn
        .prepare(
            "SELECT m.user_id FROM server_members m
             JOIN users u ON u.id = m.user_id
             WHERE m.server_id = ?1 ORDER BY u.username COLLATE NOCASE ASC",
        )
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map(params![server_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .unwrap_or_default();
    let members: Vec<Member> = user_ids
        .iter()
        .filter_map(|id| load_member(&conn, server_id, id).ok())
        .collect();
    Ok(ok(members))
}

#[get("/api/v1/servers/<server_id>/members/<user_id>")]
pub fn get_member(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
    user_id: &str,
) -> Result<Json<ApiOk<Member>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    Ok(ok(load_member(&conn, server_id, user_id)?))
}

/// Full-replace role assignment; the diff is computed here. The reserved
/// roles never move through this path: `everyone` is implicit and `owner`
/// is unreachable.
#[patch("/api/v1/servers/<server_id>/members/<user_id>", format = "json", data = "<body>")]
pub fn update_member_roles(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    user_id: &str,
    body: Json<UpdateMemberRequest>,
) -> Result<Json<ApiOk<Member>>, ApiError> {
    let member = {
        let mut conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
        routes::require_member(&conn, server_id, user_id)?;
        let perms = permissions::effective(&conn, server_id, &user.id, None);
        if !perms.contains(Permissions::MANAGE_ROLES) {
            return Err(routes::forbidden());
        }
        if user.id != user_id && !permissions::outranks(&conn, server_id, &user.id, user_id) {
            return Err(routes::forbidden());
        }

        let desired: Vec<String> = body
            .role_ids
            .iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty() && r != ROLE_EVERYONE)
            .collect();
        if desired.iter().any(|r| r == ROLE_OWNER) {
            return Err(routes::forbidden());
        }

        let current: Vec<String> = conn
            .prepare(
                "SELECT role_id FROM user_roles
                 WHERE server_id = ?1 AND user_id = ?2 AND role_id != ?3",
            )
            .and_then(|mut stmt| {
                let rows = stmt
                    .query_map(params![server_id, user_id, ROLE_OWNER], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .unwrap_or_default();

        let added: Vec<&String> = desired.iter().filter(|r| !current.contains(r)).collect();
        let removed: Vec<&String> = current.iter().filter(|r| !desired.contains(r)).collect();

        // Every role that moves must sit strictly below the actor.
        let actor_rank = permissions::highest_rank(&conn, server_id, &user.id);
        for role_id in added.iter().chain(removed.iter()) {
            let role = crate::routes::roles::load_role(&conn, server_id, role_id)?;
            match actor_rank {
                Rank::Owner => {}
                Rank::Position(p) if p > role.position => {}
                _ => return Err(routes::forbidden()),
            }
        }

        let tx = conn.transaction().map_err(routes::internal)?;
        for role_id in &removed {
            tx.execute(
                "DELETE FROM user_roles WHERE server_id = ?1 AND user_id = ?2 AND role_id = ?3",
                params![server_id, user_id, role_id],
            )
            .map_err(routes::internal)?;
        }
        for role_id in &added {
            tx.execute(
                "INSERT INTO user_roles (server_id, user_id, role_id) VALUES (?1, ?2, ?3)",
                params![server_id, user_id, role_id],
            )
            .map_err(routes::internal)?;
        }
        tx.commit().map_err(routes::internal)?;
        load_member(&conn, server_id, user_id)?
    };

    events.publish(PushEvent::MemberUpdate {
        server_id: server_id.to_string(),
        user_id: user_id.to_string(),
        role_ids: member.role_ids.clone(),
    });
    Ok(ok(member))
}

fn remove_membership(conn: &mut rusqlite::Connection, server_id: &str, user_id: &str) -> Result<(), ApiError> {
    let tx = conn.transaction().map_err(routes::internal)?;
    tx.execute(
        "DELETE FROM user_roles WHERE server_id = ?1 AND user_id = ?2",
        params![server_id, user_id],
    )
    .map_err(routes::internal)?;
    tx.execute(
        "DELETE FROM server_members WHERE server_id = ?1 AND user_id = ?2",
        params![server_id, user_id],
    )
    .map_err(routes::internal)?;
    tx.execute(
        "DELETE FROM user_server_order WHERE server_id = ?1 AND user_id = ?2",
        params![server_id, user_id],
    )
    .map_err(routes::internal)?;
    tx.commit().map_err(routes::internal)
}

#[delete("/api/v1/servers/<server_id>/members/<user_id>")]
pub fn kick_member(
    db: &State<Db>,
    events: &State<EventBus>,
    hub: &State<Arc<Hub>>,
    voice: &State<Arc<VoiceRegistry>>,
    user: AuthUser,
    server_id: &str,
    user_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    {
        let mut conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
        routes::require_member(&conn, server_id, user_id)?;
        let perms = permissions::effective(&conn, server_id, &user.id, None);
        if !perms.contains(Permissions::KICK_MEMBERS) {
            return Err(routes::forbidden());
        }
        if !permissions::outranks(&conn, server_id, &user.id, user_id) {
            return Err(routes::forbidden());
        }
        remove_membership(&mut conn, server_id, user_id)?;
    }

    if let Some(state) = voice.clear_user_in_server(user_id, server_id) {
        events.publish(PushEvent::VoiceStateUpdate {
            action: "leave".to_string(),
            state,
        });
    }
    // The target's sessions lose the server scope before the fan-out, so the
    // remaining members see the leave and the target gets a direct notice.
    hub.remove_server(user_id, server_id);
    events.publish(PushEvent::MemberLeave {
        server_id: server_id.to_string(),
        user_id: user_id.to_string(),
    });
    events.publish(PushEvent::ServerRemoved {
        user_id: user_id.to_string(),
        server_id: server_id.to_string(),
    });
    Ok(ok(serde_json::json!({"kicked": true})))
}

#[post("/api/v1/servers/<server_id>/members/<user_id>/ban", format = "json", data = "<body>")]
pub fn ban_member(
    db: &State<Db>,
    events: &State<EventBus>,
    hub: &State<Arc<Hub>>,
    voice: &State<Arc<VoiceRegistry>>,
    user: AuthUser,
    server_id: &str,
    user_id: &str,
    body: Json<BanRequest>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let was_member = {
        let mut conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
        let perms = permissions::effective(&conn, server_id, &user.id, None);
        if !perms.contains(Permissions::BAN_MEMBERS) {
            return Err(routes::forbidden());
        }
        routes::load_profile(&conn, user_id)?;
        let was_member = routes::require_member(&conn, server_id, user_id).is_ok();
        if was_member && !permissions::outranks(&conn, server_id, &user.id, user_id) {
            return Err(routes::forbidden());
        }

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO bans (server_id, user_id, reason, banned_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    server_id,
                    user_id,
                    body.reason.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                    &user.id,
                    now_ts()
                ],
            )
            .map_err(routes::internal)?;
        if inserted == 0 {
            return Err(routes::conflict("User is already banned"));
        }
        if was_member {
            remove_membership(&mut conn, server_id, user_id)?;
        }
        was_member
    };

    // Any issued SFU token dies with the registry entry.
    if let Some(state) = voice.clear_user_in_server(user_id, server_id) {
        events.publish(PushEvent::VoiceStateUpdate {
            action: "leave".to_string(),
            state,
        });
    }
    hub.remove_server(user_id, server_id);
    if was_member {
        events.publish(PushEvent::MemberLeave {
            server_id: server_id.to_string(),
            user_id: user_id.to_string(),
        });
        events.publish(PushEvent::ServerRemoved {
            user_id: user_id.to_string(),
            server_id: server_id.to_string(),
        });
    }
    Ok(ok(serde_json::json!({"banned": true})))
}

#[get("/api/v1/servers/<server_id>/bans")]
pub fn list_bans(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
) -> Result<Json<ApiOk<Vec<Ban>>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    let perms = permissions::effective(&conn, server_id, &user.id, None);
    if !perms.contains(Permissions::BAN_MEMBERS) {
        return Err(routes::forbidden());
    }

    let mut stmt = conn
        .prepare(
            "SELECT b.server_id, b.reason, b.banned_by, b.created_at,
                    u.id, u.username, u.display_name, u.avatar_url, u.status, u.custom_status
             FROM bans b JOIN users u ON u.id = b.user_id
             WHERE b.server_id = ?1 ORDER BY b.created_at DESC",
        )
        .map_err(routes::internal)?;
    let bans: Vec<Ban> = stmt
        .query_map(params![server_id], |row| {
            Ok(Ban {
                server_id: row.get(0)?,
                reason: row.get(1)?,
                banned_by: row.get(2)?,
                created_at: row.get(3)?,
                user: UserProfile {
                    id: row.get(4)?,
                    username: row.get(5)?,
                    display_name: row.get(6)?,
                    avatar_url: row.get(7)?,
                    status: row.get(8)?,
                    custom_status: row.get(9)?,
                },
            })
        })
        .map_err(routes::internal)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(ok(bans))
}

#[delete("/api/v1/servers/<server_id>/bans/<user_id>")]
pub fn delete_ban(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
    user_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    let perms = permissions::effective(&conn, server_id, &user.id, None);
    if !perms.contains(Permissions::BAN_MEMBERS) {
        return Err(routes::forbidden());
    }
    let removed = conn
        .execute(
            "DELETE FROM bans WHERE server_id = ?1 AND user_id = ?2",
            params![server_id, user_id],
        )
        .map_err(routes::internal)?;
    if removed == 0 {
        return Err(routes::not_found_err("Ban not found"));
    }
    Ok(ok(serde_json::json!({"unbanned": true})))
}
