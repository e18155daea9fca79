use crate::config::Config;
use crate::crypto;
use crate::db::{now_ts, Db};
use crate::metrics;
use crate::models::*;
use crate::routes::{self, AdminUser, ApiError};
use rocket::serde::json::Json;
use rocket::{delete, get, patch, post, State};
use rusqlite::{params, Connection};

fn instance_view(conn: &Connection, instance_id: &str) -> Result<LiveKitInstanceView, ApiError> {
    conn.query_row(
        "SELECT i.id, i.url, i.is_platform_managed, i.max_servers, i.created_at,
                (SELECT COUNT(*) FROM servers s WHERE s.instance_id = i.id)
         FROM livekit_instances i WHERE i.id = ?1",
        params![instance_id],
        |row| {
            Ok(LiveKitInstanceView {
                id: row.get(0)?,
                url: row.get(1)?,
                is_platform_managed: row.get::<_, i64>(2)? != 0,
                max_servers: row.get(3)?,
                created_at: row.get(4)?,
                server_count: row.get(5)?,
            })
        },
    )
    .map_err(|_| routes::not_found_err("Instance not found"))
}

#[get("/api/v1/admin/livekit-instances")]
pub fn admin_list_instances(
    db: &State<Db>,
    _admin: AdminUser,
) -> Result<Json<ApiOk<Vec<LiveKitInstanceView>>>, ApiError> {
    let conn = db.conn();
    let ids: Vec<String> = conn
        .prepare("SELECT id FROM livekit_instances ORDER BY created_at ASC")
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .unwrap_or_default();
    let views: Vec<LiveKitInstanceView> = ids
        .iter()
        .filter_map(|id| instance_view(&conn, id).ok())
        .collect();
    Ok(ok(views))
}

#[post("/api/v1/admin/livekit-instances", format = "json", data = "<body>")]
pub fn admin_create_instance(
    db: &State<Db>,
    config: &State<Config>,
    _admin: AdminUser,
    body: Json<CreateInstanceRequest>,
) -> Result<Json<ApiOk<LiveKitInstanceView>>, ApiError> {
    let url = body.url.trim();
    if url.is_empty() {
        return Err(routes::validation("Instance URL is required"));
    }
    if body.max_servers < 1 {
        return Err(routes::validation("max_servers must be at least 1"));
    }

    let conn = db.conn();
    let id = crypto::generate_id();
    conn.execute(
        "INSERT INTO livekit_instances
         (id, url, api_key_enc, api_secret_enc, is_platform_managed, max_servers, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            &id,
            url,
            crypto::seal(body.api_key.trim(), &config.encryption_key),
            crypto::seal(body.api_secret.trim(), &config.encryption_key),
            body.is_platform_managed as i64,
            body.max_servers,
            now_ts()
        ],
    )
    .map_err(routes::internal)?;
    Ok(ok(instance_view(&conn, &id)?))
}

#[patch("/api/v1/admin/livekit-instances/<instance_id>", format = "json", data = "<body>")]
pub fn admin_update_instance(
    db: &State<Db>,
    config: &State<Config>,
    _admin: AdminUser,
    instance_id: &str,
    body: Json<UpdateInstanceRequest>,
) -> Result<Json<ApiOk<LiveKitInstanceView>>, ApiError> {
    let conn = db.conn();
    instance_view(&conn, instance_id)?;

    if let Some(ref url) = body.url {
        let url = url.trim();
        if url.is_empty() {
            return Err(routes::validation("Instance URL cannot be empty"));
        }
        conn.execute(
            "UPDATE livekit_instances SET url = ?1 WHERE id = ?2",
            params![url, instance_id],
        )
        .map_err(routes::internal)?;
    }
    if let Some(ref api_key) = body.api_key {
        conn.execute(
            "UPDATE livekit_instances SET api_key_enc = ?1 WHERE id = ?2",
            params![crypto::seal(api_key.trim(), &config.encryption_key), instance_id],
        )
        .map_err(routes::internal)?;
    }
    if let Some(ref api_secret) = body.api_secret {
        conn.execute(
            "UPDATE livekit_instances SET api_secret_enc = ?1 WHERE id = ?2",
            params![crypto::seal(api_secret.trim(), &config.encryption_key), instance_id],
        )
        .map_err(routes::internal)?;
    }
    if let Some(max_servers) = body.max_servers {
        let current = instance_view(&conn, instance_id)?;
        if max_servers < current.server_count {
            return Err(routes::validation(
                "max_servers cannot drop below the current server count",
            ));
        }
        conn.execute(
            "UPDATE livekit_instances SET max_servers = ?1 WHERE id = ?2",
            params![max_servers, instance_id],
        )
        .map_err(routes::internal)?;
    }

    Ok(ok(instance_view(&conn, instance_id)?))
}

/// Instance removal honors assignment load: a loaded instance only goes
/// away when a migration target can absorb its servers within max_servers.
#[delete("/api/v1/admin/livekit-instances/<instance_id>?<migrate_to>")]
pub fn admin_delete_instance(
    db: &State<Db>,
    _admin: AdminUser,
    instance_id: &str,
    migrate_to: Option<&str>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let mut conn = db.conn();
    let doomed = instance_view(&conn, instance_id)?;

    if doomed.server_count > 0 {
        let Some(target_id) = migrate_to else {
            return Err(routes::conflict(
                "Instance still serves servers; provide a migration target",
            ));
        };
        if target_id == instance_id {
            return Err(routes::validation("Cannot migrate an instance onto itself"));
        }
        let target = instance_view(&conn, target_id)?;
        if target.server_count + doomed.server_count > target.max_servers {
            return Err(routes::resource_exhausted(
                "Migration target cannot absorb the assigned servers",
            ));
        }

        let tx = conn.transaction().map_err(routes::internal)?;
        tx.execute(
            "UPDATE servers SET instance_id = ?1 WHERE instance_id = ?2",
            params![target_id, instance_id],
        )
        .map_err(routes::internal)?;
        tx.execute(
            "DELETE FROM livekit_instances WHERE id = ?1",
            params![instance_id],
        )
        .map_err(routes::internal)?;
        tx.commit().map_err(routes::internal)?;
    } else {
        conn.execute(
            "DELETE FROM livekit_instances WHERE id = ?1",
            params![instance_id],
        )
        .map_err(routes::internal)?;
    }

    Ok(ok(serde_json::json!({"deleted": true})))
}

#[get("/api/v1/admin/livekit-instances/<instance_id>/metrics")]
pub fn admin_instance_metrics(
    db: &State<Db>,
    _admin: AdminUser,
    instance_id: &str,
) -> Result<Json<ApiOk<Option<MetricsSnapshot>>>, ApiError> {
    let conn = db.conn();
    instance_view(&conn, instance_id)?;
    let latest: Option<MetricsSnapshot> = conn
        .query_row(
            "SELECT instance_id, created_at, available, participants, rooms,
                    memory_bytes, cpu_load, bytes_in_rate, bytes_out_rate
             FROM metrics_snapshots WHERE instance_id = ?1
             ORDER BY id DESC LIMIT 1",
            params![instance_id],
            |row| {
                Ok(MetricsSnapshot {
                    instance_id: row.get(0)?,
                    created_at: row.get(1)?,
                    available: row.get::<_, i64>(2)? != 0,
                    participants: row.get(3)?,
                    rooms: row.get(4)?,
                    memory_bytes: row.get(5)?,
                    cpu_load: row.get(6)?,
                    bytes_in_rate: row.get(7)?,
                    bytes_out_rate: row.get(8)?,
                })
            },
        )
        .ok();
    Ok(ok(latest))
}

#[get("/api/v1/admin/livekit-instances/<instance_id>/metrics/history")]
pub fn admin_instance_metrics_history(
    db: &State<Db>,
    _admin: AdminUser,
    instance_id: &str,
) -> Result<Json<ApiOk<Vec<MetricsSummary>>>, ApiError> {
    let conn = db.conn();
    instance_view(&conn, instance_id)?;
    let summaries = vec![
        metrics::summarize(&conn, instance_id, "24h", "-24 hours"),
        metrics::summarize(&conn, instance_id, "7d", "-7 days"),
        metrics::summarize(&conn, instance_id, "30d", "-30 days"),
    ];
    Ok(ok(summaries))
}

#[get("/api/v1/admin/servers")]
pub fn admin_list_servers(
    db: &State<Db>,
    _admin: AdminUser,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let conn = db.conn();
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.owner_id, s.instance_id, s.created_at,
                    (SELECT COUNT(*) FROM server_members m WHERE m.server_id = s.id)
             FROM servers s ORDER BY s.created_at ASC",
        )
        .map_err(routes::internal)?;
    let servers: Vec<serde_json::Value> = stmt
        .query_map([], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "owner_id": row.get::<_, String>(2)?,
                "instance_id": row.get::<_, Option<String>>(3)?,
                "created_at": row.get::<_, String>(4)?,
                "member_count": row.get::<_, i64>(5)?,
            }))
        })
        .map_err(routes::internal)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(ok(serde_json::json!({"servers": servers})))
}

#[get("/api/v1/admin/users")]
pub fn admin_list_users(
    db: &State<Db>,
    _admin: AdminUser,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let conn = db.conn();
    let mut stmt = conn
        .prepare(
            "SELECT id, username, display_name, email, status, is_platform_admin, created_at
             FROM users ORDER BY created_at ASC",
        )
        .map_err(routes::internal)?;
    let users: Vec<serde_json::Value> = stmt
        .query_map([], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "username": row.get::<_, String>(1)?,
                "display_name": row.get::<_, String>(2)?,
                "email": row.get::<_, Option<String>>(3)?,
                "status": row.get::<_, String>(4)?,
                "is_platform_admin": row.get::<_, i64>(5)? != 0,
                "created_at": row.get::<_, String>(6)?,
            }))
        })
        .map_err(routes::internal)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(ok(serde_json::json!({"users": users})))
}

#[patch("/api/v1/admin/servers/<server_id>/instance", format = "json", data = "<body>")]
pub fn admin_assign_instance(
    db: &State<Db>,
    _admin: AdminUser,
    server_id: &str,
    body: Json<AssignInstanceRequest>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let conn = db.conn();
    let exists: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM servers WHERE id = ?1",
            params![server_id],
            |r| r.get(0),
        )
        .unwrap_or(0);
    if exists == 0 {
        return Err(routes::not_found_err("Server not found"));
    }
    let target = instance_view(&conn, &body.instance_id)?;
    if target.server_count >= target.max_servers {
        return Err(routes::resource_exhausted("Instance is at max_servers"));
    }

    conn.execute(
        "UPDATE servers SET instance_id = ?1 WHERE id = ?2",
        params![&body.instance_id, server_id],
    )
    .map_err(routes::internal)?;
    Ok(ok(serde_json::json!({"assigned": true})))
}
