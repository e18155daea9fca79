use crate::config::Config;
use crate::crypto;
use crate::db::Db;
use crate::models::*;
use crate::permissions::{self, Permissions};
use crate::routes::{self, ApiError, AuthUser};
use crate::voice::{self as registry, VoiceRegistry};
use rocket::serde::json::Json;
use rocket::{get, post, State};
use rusqlite::params;
use std::sync::Arc;

/// Admission gate for the SFU: membership, CONNECT_VOICE on the channel,
/// user-limit headroom. The instance secret is decrypted only for the
/// duration of the signing call.
#[post("/api/v1/servers/<server_id>/voice/token", format = "json", data = "<body>")]
pub fn voice_token(
    db: &State<Db>,
    config: &State<Config>,
    voice: &State<Arc<VoiceRegistry>>,
    user: AuthUser,
    server_id: &str,
    body: Json<VoiceTokenRequest>,
) -> Result<Json<ApiOk<VoiceTokenResponse>>, ApiError> {
    let conn = db.conn();
    routes::require_member(&conn, server_id, &user.id)?;
    let channel = routes::load_channel(&conn, server_id, &body.channel_id)?;
    if channel.channel_type != "voice" {
        return Err(routes::validation("Voice tokens are only issued for voice channels"));
    }

    let perms = permissions::effective(&conn, server_id, &user.id, Some(&channel.id));
    if !perms.contains(Permissions::CONNECT_VOICE) {
        return Err(routes::forbidden());
    }

    if channel.user_limit > 0 {
        let occupied = voice.channel_occupancy(&channel.id) as i64;
        let already_there = voice
            .get(&user.id)
            .map(|s| s.channel_id == channel.id)
            .unwrap_or(false);
        if !already_there && occupied >= channel.user_limit {
            return Err(routes::resource_exhausted("Voice channel is full"));
        }
    }

    let instance_id: Option<String> = conn
        .query_row(
            "SELECT instance_id FROM servers WHERE id = ?1",
            params![server_id],
            |r| r.get(0),
        )
        .map_err(routes::internal)?;
    let Some(instance_id) = instance_id else {
        return Err(routes::resource_exhausted("No SFU instance assigned to this server"));
    };
    let (url, key_enc, secret_enc): (String, String, String) = conn
        .query_row(
            "SELECT url, api_key_enc, api_secret_enc FROM livekit_instances WHERE id = ?1",
            params![&instance_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .map_err(|_| routes::resource_exhausted("SFU instance unavailable"))?;

    let (Some(api_key), Some(api_secret)) = (
        crypto::open(&key_enc, &config.encryption_key),
        crypto::open(&secret_enc, &config.encryption_key),
    ) else {
        return Err(routes::internal("SFU credentials cannot be decrypted"));
    };

    let token = registry::issue_room_token(
        &api_key,
        &api_secret,
        &user.id,
        &user.username,
        &user.display_name,
        &channel.id,
        perms,
    );
    Ok(ok(VoiceTokenResponse {
        token,
        url,
        channel_id: channel.id,
    }))
}

#[get("/api/v1/servers/<server_id>/voice/states")]
pub fn voice_states(
    db: &State<Db>,
    voice: &State<Arc<VoiceRegistry>>,
    user: AuthUser,
    server_id: &str,
) -> Result<Json<ApiOk<Vec<VoiceState>>>, ApiError> {
    {
        let conn = db.conn();
        routes::require_member(&conn, server_id, &user.id)?;
    }
    Ok(ok(voice.server_states(server_id)))
}
