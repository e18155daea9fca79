use crate::db::{now_ts, Db};
use crate::events::{order_pair, EventBus, PushEvent};
use crate::models::*;
use crate::routes::{self, ApiError, AuthUser};
use rocket::serde::json::Json;
use rocket::{delete, get, post, State};
use rusqlite::{params, Connection};

struct FriendRow {
    user_low: String,
    user_high: String,
    initiator: String,
    status: String,
}

fn load_edge(conn: &Connection, a: &str, b: &str) -> Option<FriendRow> {
    let (low, high) = order_pair(a, b);
    conn.query_row(
        "SELECT user_low, user_high, initiator, status FROM friendships
         WHERE user_low = ?1 AND user_high = ?2",
        params![low, high],
        |row| {
            Ok(FriendRow {
                user_low: row.get(0)?,
                user_high: row.get(1)?,
                initiator: row.get(2)?,
                status: row.get(3)?,
            })
        },
    )
    .ok()
}

fn upsert_edge(
    conn: &Connection,
    a: &str,
    b: &str,
    initiator: &str,
    status: &str,
) -> Result<(), ApiError> {
    let (low, high) = order_pair(a, b);
    conn.execute(
        "INSERT INTO friendships (user_low, user_high, initiator, status, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (user_low, user_high) DO UPDATE
         SET initiator = excluded.initiator, status = excluded.status,
             updated_at = excluded.updated_at",
        params![low, high, initiator, status, now_ts()],
    )
    .map_err(routes::internal)?;
    Ok(())
}

fn delete_edge(conn: &Connection, a: &str, b: &str) -> Result<usize, ApiError> {
    let (low, high) = order_pair(a, b);
    conn.execute(
        "DELETE FROM friendships WHERE user_low = ?1 AND user_high = ?2",
        params![low, high],
    )
    .map_err(routes::internal)
}

fn pair_event(a: &str, b: &str, status: &str, by: &str) -> PushEvent {
    let (low, high) = order_pair(a, b);
    PushEvent::FriendUpdate {
        user_low: low.to_string(),
        user_high: high.to_string(),
        payload: serde_json::json!({
            "user_ids": [low, high],
            "status": status,
            "by": by,
        }),
    }
}

#[get("/api/v1/friends")]
pub fn list_friends(
    db: &State<Db>,
    user: AuthUser,
) -> Result<Json<ApiOk<Vec<FriendEntry>>>, ApiError> {
    let conn = db.conn();
    let mut stmt = conn
        .prepare(
            "SELECT f.status, f.initiator, f.updated_at,
                    u.id, u.username, u.display_name, u.avatar_url, u.status, u.custom_status
             FROM friendships f
             JOIN users u ON u.id = CASE WHEN f.user_low = ?1 THEN f.user_high ELSE f.user_low END
             WHERE f.user_low = ?1 OR f.user_high = ?1
             ORDER BY f.updated_at DESC",
        )
        .map_err(routes::internal)?;
    let entries: Vec<FriendEntry> = stmt
        .query_map(params![&user.id], |row| {
            let status: String = row.get(0)?;
            let initiator: String = row.get(1)?;
            Ok(FriendEntry {
                status,
                outgoing: initiator == user.id,
                updated_at: row.get(2)?,
                user: UserProfile {
                    id: row.get(3)?,
                    username: row.get(4)?,
                    display_name: row.get(5)?,
                    avatar_url: row.get(6)?,
                    status: row.get(7)?,
                    custom_status: row.get(8)?,
                },
            })
        })
        .map_err(routes::internal)?
        .filter_map(|r| r.ok())
        // A block is only visible to the blocker.
        .filter(|e: &FriendEntry| e.status != "blocked" || e.outgoing)
        .collect();
    Ok(ok(entries))
}

#[post("/api/v1/friends/requests", format = "json", data = "<body>")]
pub fn send_friend_request(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    body: Json<FriendRequestBody>,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    let username = body.username.trim();
    let (target_id, event) = {
        let conn = db.conn();
        let target_id: String = conn
            .query_row(
                "SELECT id FROM users WHERE username = ?1 COLLATE NOCASE",
                params![username],
                |r| r.get(0),
            )
            .map_err(|_| routes::not_found_err("User not found"))?;
        if target_id == user.id {
            return Err(routes::validation("Cannot send a friend request to yourself"));
        }

        let event = match load_edge(&conn, &user.id, &target_id) {
            Some(edge) if edge.status == "blocked" => return Err(routes::forbidden()),
            Some(edge) if edge.status == "accepted" => {
                return Err(routes::conflict("Already friends"));
            }
            Some(edge) if edge.status == "pending" && edge.initiator == user.id => {
                return Err(routes::conflict("Request already sent"));
            }
            Some(_reverse_pending) => {
                // The counterpart already asked; this is an accept.
                upsert_edge(&conn, &user.id, &target_id, &user.id, "accepted")?;
                pair_event(&user.id, &target_id, "accepted", &user.id)
            }
            None => {
                upsert_edge(&conn, &user.id, &target_id, &user.id, "pending")?;
                let (low, high) = order_pair(&user.id, &target_id);
                PushEvent::FriendRequest {
                    user_low: low.to_string(),
                    user_high: high.to_string(),
                    payload: serde_json::json!({
                        "from": routes::load_profile(&conn, &user.id)?,
                        "to_user_id": target_id,
                    }),
                }
            }
        };
        (target_id, event)
    };

    events.publish(event);
    Ok(ok(serde_json::json!({"user_id": target_id})))
}

#[post("/api/v1/friends/requests/<user_id>/accept")]
pub fn accept_friend_request(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    user_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    {
        let conn = db.conn();
        let edge = load_edge(&conn, &user.id, user_id)
            .ok_or_else(|| routes::not_found_err("Friend request not found"))?;
        if edge.status != "pending" {
            return Err(routes::not_found_err("Friend request not found"));
        }
        // Only the side that did not initiate may accept.
        if edge.initiator == user.id {
            return Err(routes::forbidden());
        }
        upsert_edge(&conn, &edge.user_low, &edge.user_high, &edge.initiator, "accepted")?;
    }

    events.publish(pair_event(&user.id, user_id, "accepted", &user.id));
    Ok(ok(serde_json::json!({"accepted": true})))
}

#[post("/api/v1/friends/requests/<user_id>/decline")]
pub fn decline_friend_request(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    user_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    {
        let conn = db.conn();
        let edge = load_edge(&conn, &user.id, user_id)
            .ok_or_else(|| routes::not_found_err("Friend request not found"))?;
        if edge.status != "pending" {
            return Err(routes::not_found_err("Friend request not found"));
        }
        // Initiator cancel and receiver decline both land here.
        delete_edge(&conn, &user.id, user_id)?;
    }

    events.publish(pair_event(&user.id, user_id, "none", &user.id));
    Ok(ok(serde_json::json!({"declined": true})))
}

#[delete("/api/v1/friends/<user_id>")]
pub fn remove_friend(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    user_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    {
        let conn = db.conn();
        let edge = load_edge(&conn, &user.id, user_id)
            .ok_or_else(|| routes::not_found_err("Friend not found"))?;
        if edge.status != "accepted" {
            return Err(routes::not_found_err("Friend not found"));
        }
        delete_edge(&conn, &user.id, user_id)?;
    }

    events.publish(pair_event(&user.id, user_id, "none", &user.id));
    Ok(ok(serde_json::json!({"removed": true})))
}

/// `any → blocked`. The blocker is remembered; only they can undo it.
#[post("/api/v1/friends/<user_id>/block")]
pub fn block_user(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    user_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    {
        let conn = db.conn();
        routes::load_profile(&conn, user_id)?;
        if user_id == user.id {
            return Err(routes::validation("Cannot block yourself"));
        }
        if let Some(edge) = load_edge(&conn, &user.id, user_id)
            && edge.status == "blocked"
            && edge.initiator != user.id
        {
            // Both directions blocked collapses onto the first blocker.
            return Err(routes::forbidden());
        }
        upsert_edge(&conn, &user.id, user_id, &user.id, "blocked")?;
    }

    events.publish(pair_event(&user.id, user_id, "blocked", &user.id));
    Ok(ok(serde_json::json!({"blocked": true})))
}

#[delete("/api/v1/friends/<user_id>/block")]
pub fn unblock_user(
    db: &State<Db>,
    events: &State<EventBus>,
    user: AuthUser,
    user_id: &str,
) -> Result<Json<ApiOk<serde_json::Value>>, ApiError> {
    {
        let conn = db.conn();
        let edge = load_edge(&conn, &user.id, user_id)
            .ok_or_else(|| routes::not_found_err("Block not found"))?;
        if edge.status != "blocked" || edge.initiator != user.id {
            return Err(routes::forbidden());
        }
        delete_edge(&conn, &user.id, user_id)?;
    }

    events.publish(pair_event(&user.id, user_id, "none", &user.id));
    Ok(ok(serde_json::json!({"unblocked": true})))
}
