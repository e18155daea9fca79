use crate::crypto;
use crate::db::Db;
use crate::events::{EventBus, PushEvent};
use crate::models::*;
use crate::permissions::{self, Permissions, Rank, ROLE_EVERYONE, ROLE_OWNER};
use crate::routes::{self, ApiError, AuthUser};
use rocket::serde::json::Json;
use rocket::{delete, get, patch, post, State};
use rusqlite::{params, Connection};

fn require_manage_roles(conn: &Connection, server_id: &str, user_id: &str) -> Result<(), ApiError> {
    routes::require_member(conn, server_id, user_id)?;
    let perms = permissions::effective(conn, server_id, user_id, None);
    if perms.contains(Permissions::MANAGE_ROLES) {
        Ok(())
    } else {
        Err(routes::forbidden())
    }
}

pub(crate) fn load_role(
    conn: &Connection,
    server_id: &str,
    role_id: &str,
) -> Result<Role, ApiError> {
    conn.query_row(
        "SELECT id, server_id, name, color, position, permissions, is_default
         FROM roles WHERE server_id = ?1 AND id = ?2",
        params![server_id, role_id],
        Role::from_row,
    )
    .map_err(|_| routes::not_found_err("Role not found"))
}

pub(crate) fn server_roles(conn: &Connection, server_id: &str) -> Vec<Role> {
    conn.prepare(
        "SELECT id, server_id, name, color, position, permissions, is_default
         FROM roles WHERE server_id = ?1 ORDER BY position DESC",
    )
    .and_then(|mut stmt| {
        let rows = stmt
            .query_map(params![server_id], Role::from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    })
    .unwrap_or_default()
}

/// Actor must strictly outrank the position being touched; the owner role
/// outranks everything.
fn require_rank_above(
    conn: &Connection,
    server_id: &str,
    user_id: &str,
    position: i64,
) -> Result<(), ApiError> {
    match permissions::highest_rank(conn, server_id, user_id) {
        Rank::Owner => Ok(()),
        Rank::Position(p) if p > position => Ok(()),
        _ => Err(routes::forbidden()),
    }
}

#[get("/api/v1/servers/<server_id>/roles")]
pub fn list_roles(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
) -> Result<Json<ApiOk<Vec<Role>>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    Ok(ok(server_roles(&conn, server_id)))
}

#[post("/api/v1/servers/<server_id>/roles", format = "json", data = "<body>")]
pub fn create_role(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    body: Json<CreateRoleRequest>,
) -> Result<Json<ApiOk<Role>>, ApiError> {
    let name = body.name.trim().to_string();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(routes::validation("Role name must be 1-100 characters"));
    }
    let mask = Permissions::from_bits_truncate(body.permissions);
    // Granting bits the actor lacks would be privilege escalation.
    let role = {
        let mut conn = db.conn();
        require_manage_roles(&conn, server_id, &user.id)?;
        let actor_perms = permissions::effective(&conn, server_id, &user.id, None);
        if !actor_perms.contains(mask) {
            return Err(routes::forbidden());
        }

        let id = crypto::generate_id();
        let tx = conn.transaction().map_err(routes::internal)?;
        // New roles enter at the bottom of the positional ladder, above the
        // default role only. Existing roles shift up to stay dense.
        tx.execute(
            "UPDATE roles SET position = position + 1
             WHERE server_id = ?1 AND id != ?2 AND position >= 1",
            params![server_id, ROLE_EVERYONE],
        )
        .map_err(routes::internal)?;
        tx.execute(
            "INSERT INTO roles (server_id, id, name, color, position, permissions, is_default)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, 0)",
            params![server_id, &id, &name, &body.color, mask.bits()],
        )
        .map_err(routes::internal)?;
        tx.commit().map_err(routes::internal)?;
        load_role(&conn, server_id, &id)?
    };

    events.publish(PushEvent::RoleCreate(role.clone()));
    Ok(ok(role))
}

#[patch("/api/v1/servers/<server_id>/roles/<role_id>", format = "json", data = "<body>", rank = 2)]
pub fn update_role(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    role_id: &str,
    body: Json<UpdateRoleRequest>,
) -> Result<Json<ApiOk<Role>>, ApiError> {
    if role_id == ROLE_OWNER {
        return Err(routes::forbidden());
    }

    let role = {
        let conn = db.conn();
        require_manage_roles(&conn, server_id, &user.id)?;
        let role = load_role(&conn, server_id, role_id)?;
        require_rank_above(&conn, server_id, &user.id, role.position)?;

        if let Some(ref name) = body.name {
            let name = name.trim();
            if name.is_empty() || name.chars().count() > 100 {
                return Err(routes::validation("Role name must be 1-100 characters"));
            }
            if role.is_default {
                return Err(routes::validation("The default role cannot be renamed"));
            }
            conn.execute(
                "UPDATE roles SET name = ?1 WHERE server_id = ?2 AND id = ?3",
                params![name, server_id, role_id],
            )
            .map_err(routes::internal)?;
        }
        if let Some(ref color) = body.color {
            conn.execute(
                "UPDATE roles SET color = ?1 WHERE server_id = ?2 AND id = ?3",
                params![color, server_id, role_id],
            )
            .map_err(routes::internal)?;
        }
        if let Some(bits) = body.permissions {
            let mask = Permissions::from_bits_truncate(bits);
            let actor_perms = permissions::effective(&conn, server_id, &user.id, None);
            if !actor_perms.contains(mask) {
                return Err(routes::forbidden());
            }
            conn.execute(
                "UPDATE roles SET permissions = ?1 WHERE server_id = ?2 AND id = ?3",
                params![mask.bits(), server_id, role_id],
            )
            .map_err(routes::internal)?;
        }
        load_role(&conn, server_id, role_id)?
    };

    events.publish(PushEvent::RoleUpdate(role.clone()));
    Ok(ok(role))
}

#[delete("/api/v1/servers/<server_id>/roles/<role_id>")]
pub fn delete_role(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    role_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    if role_id == ROLE_OWNER || role_id == ROLE_EVERYONE {
        return Err(routes::forbidden());
    }

    {
        let mut conn = db.conn();
        require_manage_roles(&conn, server_id, &user.id)?;
        let role = load_role(&conn, server_id, role_id)?;
        require_rank_above(&conn, server_id, &user.id, role.position)?;

        let tx = conn.transaction().map_err(routes::internal)?;
        // Overrides key on the role id without a foreign key; sweep them.
        tx.execute(
            "DELETE FROM channel_overrides WHERE role_id = ?1 AND channel_id IN
             (SELECT id FROM channels WHERE server_id = ?2)",
            params![role_id, server_id],
        )
        .map_err(routes::internal)?;
        tx.execute(
            "DELETE FROM roles WHERE server_id = ?1 AND id = ?2",
            params![server_id, role_id],
        )
        .map_err(routes::internal)?;
        // Close the positional gap.
        tx.execute(
            "UPDATE roles SET position = position - 1
             WHERE server_id = ?1 AND position > ?2",
            params![server_id, role.position],
        )
        .map_err(routes::internal)?;
        tx.commit().map_err(routes::internal)?;
    }

    events.publish(PushEvent::RoleDelete {
        server_id: server_id.to_string(),
        role_id: role_id.to_string(),
    });
    Ok(ok(serde_json::json!({"deleted": true})))
}

#[patch("/api/v1/servers/<server_id>/roles/reorder", format = "json", data = "<body>")]
pub fn reorder_roles(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    body: Json<ReorderRequest>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let roles = {
        let mut conn = db.conn();
        require_manage_roles(&conn, server_id, &user.id)?;

        for item in &body.items {
            if item.id == ROLE_OWNER || item.id == ROLE_EVERYONE {
                return Err(routes::forbidden());
            }
            if item.position < 1 {
                return Err(routes::validation("Position 0 is reserved for the default role"));
            }
            let current = load_role(&conn, server_id, &item.id)?;
            require_rank_above(&conn, server_id, &user.id, current.position.max(item.position))?;
        }

        let tx = conn.transaction().map_err(routes::internal)?;
        for item in &body.items {
            tx.execute(
                "UPDATE roles SET position = ?1 WHERE server_id = ?2 AND id = ?3",
                params![item.position, server_id, &item.id],
            )
            .map_err(routes::internal)?;
        }
        tx.commit().map_err(routes::internal)?;
        server_roles(&conn, server_id)
    };

    events.publish(PushEvent::RoleReorder {
        server_id: server_id.to_string(),
        roles,
    });
    Ok(ok(serde_json::json!({"reordered": true})))
}
