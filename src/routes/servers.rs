use crate::config::Config;
use crate::crypto;
use crate::db::{now_ts, Db};
use crate::events::{EventBus, PushEvent};
use crate::hub::Hub;
use crate::models::*;
use crate::permissions::{self, Permissions, ROLE_EVERYONE, ROLE_OWNER};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::routes::{self, ApiError, AuthUser};
use crate::voice::VoiceRegistry;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rocket::serde::json::Json;
use rocket::{delete, get, patch, post, State};
use rusqlite::{params, Connection};
use std::sync::Arc;

pub(crate) fn load_server(conn: &Connection, server_id: &str) -> Result<Server, ApiError> {
    conn.query_row(
        "SELECT id, name, icon_url, owner_id, invite_required, instance_id, created_at
         FROM servers WHERE id = ?1",
        params![server_id],
        Server::from_row,
    )
    .map_err(|_| routes::not_found_err("Server not found"))
}

/// Pick the platform-managed instance with the most headroom, if any has
/// capacity left.
fn assign_platform_instance(conn: &Connection) -> Option<String> {
    conn.query_row(
        "SELECT i.id FROM livekit_instances i
         LEFT JOIN servers s ON s.instance_id = i.id
         WHERE i.is_platform_managed = 1
         GROUP BY i.id
         HAVING COUNT(s.id) < i.max_servers
         ORDER BY COUNT(s.id) ASC
         LIMIT 1",
        [],
        |r| r.get(0),
    )
    .ok()
}

/// Insert a self-hosted instance row with credentials sealed under the
/// process key.
pub(crate) fn insert_self_hosted_instance(
    conn: &Connection,
    config: &Config,
    url: &str,
    api_key: &str,
    api_secret: &str,
) -> Result<String, ApiError> {
    let id = crypto::generate_id();
    conn.execute(
        "INSERT INTO livekit_instances
         (id, url, api_key_enc, api_secret_enc, is_platform_managed, max_servers, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, 1, ?5)",
        params![
            &id,
            url.trim(),
            crypto::seal(api_key.trim(), &config.encryption_key),
            crypto::seal(api_secret.trim(), &config.encryption_key),
            now_ts()
        ],
    )
    .map_err(routes::internal)?;
    Ok(id)
}

#[get("/api/v1/servers")]
pub fn list_servers(db: &State<Db>, user: AuthUser) -> Result<Json<ApiOk<Vec<Server>>>, ApiError> {
    let conn = db.conn();
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.icon_url, s.owner_id, s.invite_required, s.instance_id, s.created_at
             FROM servers s
             JOIN server_members m ON m.server_id = s.id
             LEFT JOIN user_server_order o ON o.server_id = s.id AND o.user_id = m.user_id
             WHERE m.user_id = ?1
             ORDER BY COALESCE(o.position, 999999), m.joined_at ASC",
        )
        .map_err(routes::internal)?;
    let servers: Vec<Server> = stmt
        .query_map(params![&user.id], Server::from_row)
        .map_err(routes::internal)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(ok(servers))
}

#[post("/api/v1/servers", format = "json", data = "<body>")]
pub fn create_server(
    db: &State<Db>,
    config: &State<Config>,
    hub: &State<Arc<Hub>>,
    rate_limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    user: AuthUser,
    body: Json<CreateServerRequest>,
) -> Result<Json<ApiOk<Server>>, ApiError> {
    let rl = rate_limiter.check(
        &format!("create_server:{}", user.id),
        rate_config.servers_max,
        rate_config.servers_window_secs,
    );
    if !rl.allowed {
        return Err(routes::rate_limited(&rl, "Too many servers created"));
    }

    let name = body.name.trim().to_string();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(routes::validation("Server name must be 1-100 characters"));
    }

    let server_id = crypto::generate_id();
    let server = {
        let mut conn = db.conn();
        let tx = conn.transaction().map_err(routes::internal)?;

        let instance_id = match (&body.livekit_url, &body.livekit_api_key, &body.livekit_api_secret)
        {
            (Some(url), Some(key), Some(secret)) => {
                Some(insert_self_hosted_instance(&tx, config, url, key, secret)?)
            }
            _ => assign_platform_instance(&tx),
        };

        let now = now_ts();
        tx.execute(
            "INSERT INTO servers (id, name, owner_id, invite_required, instance_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &server_id,
                &name,
                &user.id,
                body.invite_required as i64,
                &instance_id,
                &now
            ],
        )
        .map_err(routes::internal)?;

        // Reserved roles: positional default at 0, owner above every position.
        tx.execute(
            "INSERT INTO roles (server_id, id, name, position, permissions, is_default)
             VALUES (?1, ?2, 'everyone', 0, ?3, 1)",
            params![&server_id, ROLE_EVERYONE, Permissions::everyone_default().bits()],
        )
        .map_err(routes::internal)?;
        tx.execute(
            "INSERT INTO roles (server_id, id, name, position, permissions, is_default)
             VALUES (?1, ?2, 'owner', 0, ?3, 0)",
            params![&server_id, ROLE_OWNER, Permissions::all().bits()],
        )
        .map_err(routes::internal)?;

        tx.execute(
            "INSERT INTO server_members (server_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
            params![&server_id, &user.id, &now],
        )
        .map_err(routes::internal)?;
        tx.execute(
            "INSERT INTO user_roles (server_id, user_id, role_id) VALUES (?1, ?2, ?3)",
            params![&server_id, &user.id, ROLE_OWNER],
        )
        .map_err(routes::internal)?;
        tx.execute(
            "INSERT INTO user_server_order (user_id, server_id, position)
             SELECT ?1, ?2, COALESCE(MAX(position) + 1, 0) FROM user_server_order WHERE user_id = ?1",
            params![&user.id, &server_id],
        )
        .map_err(routes::internal)?;

        // Every new server starts with a general text channel.
        tx.execute(
            "INSERT INTO channels (id, server_id, name, channel_type, position, created_at)
             VALUES (?1, ?2, 'general', 'text', 0, ?3)",
            params![crypto::generate_id(), &server_id, &now],
        )
        .map_err(routes::internal)?;

        tx.commit().map_err(routes::internal)?;
        load_server(&conn, &server_id)?
    };

    hub.add_server(&user.id, &server_id);
    Ok(ok(server))
}

#[get("/api/v1/servers/<server_id>")]
pub fn get_server(
    db: &State<Db>,
    user: AuthUser,
    server_id: &str,
) -> Result<Json<ApiOk<Server>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    Ok(ok(load_server(&conn, server_id)?))
}

#[patch("/api/v1/servers/reorder", format = "json", data = "<body>")]
pub fn reorder_servers(
    db: &State<Db>,
    user: AuthUser,
    body: Json<ReorderServersRequest>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let mut conn = db.conn();
    let tx = conn.transaction().map_err(routes::internal)?;
    for (position, server_id) in body.server_ids.iter().enumerate() {
        tx.execute(
            "INSERT INTO user_server_order (user_id, server_id, position) VALUES (?1, ?2, ?3)
             ON CONFLICT (user_id, server_id) DO UPDATE SET position = excluded.position",
            params![&user.id, server_id, position as i64],
        )
        .map_err(routes::internal)?;
    }
    tx.commit().map_err(routes::internal)?;
    Ok(ok(serde_json::json!({"reordered": true})))
}

#[patch("/api/v1/servers/<server_id>", format = "json", data = "<body>", rank = 2)]
pub fn update_server(
    db: &State<Db>,
    config: &State<Config>,
    events: &State<EventBus>,
    user: AuthUser,
    server_id: &str,
    body: Json<UpdateServerRequest>,
) -> Result<Json<ApiOk<Server>>, ApiError> {
    if let Some(ref name) = body.name {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > 100 {
            return Err(routes::validation("Server name must be 1-100 characters"));
        }
    }

    let server = {
        let mut conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
        let perms = permissions::effective(&conn, server_id, &user.id, None);
        if !perms.intersects(Permissions::ADMIN | Permissions::MANAGE_SERVER) {
            return Err(routes::forbidden());
        }
        let server = load_server(&conn, server_id)?;

        let wants_sfu_update = body.livekit_url.is_some()
            || body.livekit_api_key.is_some()
            || body.livekit_api_secret.is_some();
        if wants_sfu_update {
            // Credential rotation is a self-hosted concern; hosted servers
            // never see platform credentials.
            let platform_managed: bool = match server.instance_id {
                Some(ref iid) => instance_is_platform(&conn, iid),
                None => false,
            };
            if platform_managed {
                return Err(routes::forbidden());
            }
            let (Some(url), Some(key), Some(secret)) = (
                body.livekit_url.as_deref(),
                body.livekit_api_key.as_deref(),
                body.livekit_api_secret.as_deref(),
            ) else {
                return Err(routes::validation(
                    "SFU update requires url, api_key and api_secret together",
                ));
            };

            let tx = conn.transaction().map_err(routes::internal)?;
            match server.instance_id {
                Some(ref iid) => {
                    tx.execute(
                        "UPDATE livekit_instances SET url = ?1, api_key_enc = ?2, api_secret_enc = ?3
                         WHERE id = ?4",
                        params![
                            url.trim(),
                            crypto::seal(key.trim(), &config.encryption_key),
                            crypto::seal(secret.trim(), &config.encryption_key),
                            iid
                        ],
                    )
                    .map_err(routes::internal)?;
                }
                None => {
                    let iid = insert_self_hosted_instance(&tx, config, url, key, secret)?;
                    tx.execute(
                        "UPDATE servers SET instance_id = ?1 WHERE id = ?2",
                        params![&iid, server_id],
                    )
                    .map_err(routes::internal)?;
                }
            }
            tx.commit().map_err(routes::internal)?;
        }

        if let Some(ref name) = body.name {
            conn.execute(
                "UPDATE servers SET name = ?1 WHERE id = ?2",
                params![name.trim(), server_id],
            )
            .map_err(routes::internal)?;
        }
        if let Some(invite_required) = body.invite_required {
            conn.execute(
                "UPDATE servers SET invite_required = ?1 WHERE id = ?2",
                params![invite_required as i64, server_id],
            )
            .map_err(routes::internal)?;
        }
        load_server(&conn, server_id)?
    };

    events.publish(PushEvent::ServerUpdate(server.clone()));
    Ok(ok(server))
}

fn instance_is_platform(conn: &Connection, instance_id: &str) -> bool {
    conn.query_row(
        "SELECT is_platform_managed FROM livekit_instances WHERE id = ?1",
        params![instance_id],
        |r| r.get::<_, i64>(0),
    )
    .map(|v| v != 0)
    .unwrap_or(false)
}

#[delete("/api/v1/servers/<server_id>")]
pub fn delete_server(
    db: &State<Db>,
    events: &State<EventBus>,
    hub: &State<Arc<Hub>>,
    voice: &State<Arc<VoiceRegistry>>,
    user: AuthUser,
    server_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let member_ids = {
        let mut conn = db.conn();
        let server = load_server(&conn, server_id)?;
        if server.owner_id != user.id {
            return Err(routes::forbidden());
        }
        let member_ids: Vec<String> = conn
            .prepare("SELECT user_id FROM server_members WHERE server_id = ?1")
            .and_then(|mut stmt| {
                let rows = stmt
                    .query_map(params![server_id], |row| row.get(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .unwrap_or_default();

        let tx = conn.transaction().map_err(routes::internal)?;
        // Message FTS rows are not under FK cascade.
        tx.execute(
            "DELETE FROM messages_fts WHERE message_id IN
             (SELECT id FROM messages WHERE server_id = ?1)",
            params![server_id],
        )
        .map_err(routes::internal)?;
        // A self-hosted instance serves exactly this server; drop it along.
        tx.execute(
            "DELETE FROM livekit_instances WHERE is_platform_managed = 0 AND id IN
             (SELECT instance_id FROM servers WHERE id = ?1)",
            params![server_id],
        )
        .map_err(routes::internal)?;
        tx.execute("DELETE FROM servers WHERE id = ?1", params![server_id])
            .map_err(routes::internal)?;
        tx.commit().map_err(routes::internal)?;
        member_ids
    };

    // Live voice sessions in the server's channels end with it.
    voice.clear_server(server_id);
    events.publish(PushEvent::ServerDelete {
        server_id: server_id.to_string(),
        member_ids,
    });
    hub.remove_server_everywhere(server_id);

    Ok(ok(serde_json::json!({"deleted": true})))
}

#[post("/api/v1/servers/<server_id>/leave")]
pub fn leave_server(
    db: &State<Db>,
    events: &State<EventBus>,
    hub: &State<Arc<Hub>>,
    voice: &State<Arc<VoiceRegistry>>,
    user: AuthUser,
    server_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    {
        let mut conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
        let server = load_server(&conn, server_id)?;
        if server.owner_id == user.id {
            return Err(routes::validation("The owner cannot leave their server"));
        }
        let tx = conn.transaction().map_err(routes::internal)?;
        tx.execute(
            "DELETE FROM user_roles WHERE server_id = ?1 AND user_id = ?2",
            params![server_id, &user.id],
        )
        .map_err(routes::internal)?;
        tx.execute(
            "DELETE FROM server_members WHERE server_id = ?1 AND user_id = ?2",
            params![server_id, &user.id],
        )
        .map_err(routes::internal)?;
        tx.execute(
            "DELETE FROM user_server_order WHERE server_id = ?1 AND user_id = ?2",
            params![server_id, &user.id],
        )
        .map_err(routes::internal)?;
        tx.commit().map_err(routes::internal)?;
    }

    if let Some(state) = voice.clear_user_in_server(&user.id, server_id) {
        events.publish(PushEvent::VoiceStateUpdate {
            action: "leave".to_string(),
            state,
        });
    }
    hub.remove_server(&user.id, server_id);
    events.publish(PushEvent::MemberLeave {
        server_id: server_id.to_string(),
        user_id: user.id.clone(),
    });
    events.publish(PushEvent::ServerRemoved {
        user_id: user.id.clone(),
        server_id: server_id.to_string(),
    });

    Ok(ok(serde_json::json!({"left": true})))
}

#[post("/api/v1/servers/<server_id>/icon", format = "json", data = "<body>")]
pub fn upload_icon(
    db: &State<Db>,
    config: &State<Config>,
    events: &State<EventBus>,
    rate_limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    user: AuthUser,
    server_id: &str,
    body: Json<IconUpload>,
) -> Result<Json<ApiOk<Server>>, ApiError> {
    let rl = rate_limiter.check(
        &format!("upload:{}", user.id),
        rate_config.uploads_max,
        rate_config.uploads_window_secs,
    );
    if !rl.allowed {
        return Err(routes::rate_limited(&rl, "Too many uploads"));
    }

    let server = {
        let conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
        let perms = permissions::effective(&conn, server_id, &user.id, None);
        if !perms.intersects(Permissions::ADMIN | Permissions::MANAGE_SERVER) {
            return Err(routes::forbidden());
        }

        let bytes = BASE64
            .decode(body.data.as_bytes())
            .map_err(|_| routes::validation("Icon data must be valid base64"))?;
        if bytes.is_empty() || bytes.len() > config.upload_max_bytes {
            return Err(routes::validation("Icon exceeds the upload size limit"));
        }

        let url = crate::routes::messages::store_upload(
            config,
            &body.filename,
            &bytes,
        )?;
        conn.execute(
            "UPDATE servers SET icon_url = ?1 WHERE id = ?2",
            params![&url, server_id],
        )
        .map_err(routes::internal)?;
        load_server(&conn, server_id)?
    };

    events.publish(PushEvent::ServerUpdate(server.clone()));
    Ok(ok(server))
}
