use crate::common::{bearer, create_server, error_code, invite_and_join, register, test_client};
use rocket::http::{ContentType, Status};

const CONNECT_VOICE: u32 = 1 << 10;
const TEST_SFU_SECRET: &str = "devsecret-devsecret-devsecret-00";

fn voice_channel(client: &rocket::local::blocking::Client, token: &str, server_id: &str) -> String {
    let res = client
        .post(format!("/api/v1/servers/{server_id}/channels"))
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(r#"{"name": "lounge", "channel_type": "voice"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    body["data"]["id"].as_str().unwrap().to_string()
}

fn request_token<'c>(
    client: &'c rocket::local::blocking::Client,
    token: &str,
    server_id: &str,
    channel_id: &str,
) -> rocket::local::blocking::LocalResponse<'c> {
    client
        .post(format!("/api/v1/servers/{server_id}/voice/token"))
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(format!(r#"{{"channel_id": "{channel_id}"}}"#))
        .dispatch()
}

/// Admission order: denied without CONNECT_VOICE and no state is created;
/// granted afterwards with the publish rights in the signed grant.
#[test]
fn voice_admission_follows_channel_permissions() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let (member, _, _) = register(&client, "member");
    let server_id = create_server(&client, &owner, "Alpha");
    invite_and_join(&client, &owner, &member, &server_id);
    let channel_id = voice_channel(&client, &owner, &server_id);

    let res = client
        .put(format!(
            "/api/v1/servers/{server_id}/channels/{channel_id}/permissions/everyone"
        ))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(format!(r#"{{"allow": 0, "deny": {CONNECT_VOICE}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = request_token(&client, &member, &server_id, &channel_id);
    assert_eq!(res.status(), Status::Forbidden);

    // No state appeared from the failed admission.
    let res = client
        .get(format!("/api/v1/servers/{server_id}/voice/states"))
        .header(bearer(&owner))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body["data"].as_array().unwrap().is_empty());

    let res = client
        .delete(format!(
            "/api/v1/servers/{server_id}/channels/{channel_id}/permissions/everyone"
        ))
        .header(bearer(&owner))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = request_token(&client, &member, &server_id, &channel_id);
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let jwt = body["data"]["token"].as_str().unwrap();

    let claims = concord::crypto::verify_jwt(jwt, TEST_SFU_SECRET).expect("grant verifies");
    assert_eq!(claims["video"]["room"], channel_id.as_str());
    assert_eq!(claims["video"]["roomJoin"], true);
    assert_eq!(claims["video"]["canPublish"], true, "default role carries SPEAK");
    let sources = claims["video"]["canPublishSources"].as_array().unwrap();
    assert!(
        !sources.iter().any(|s| s == "screen_share"),
        "STREAM is not in the default grant"
    );
}

#[test]
fn voice_tokens_are_for_voice_channels_only() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let server_id = create_server(&client, &owner, "Alpha");
    let text_channel = crate::common::general_channel(&client, &owner, &server_id);

    let res = request_token(&client, &owner, &server_id, &text_channel);
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn admin_surface_is_platform_admin_only() {
    let client = test_client();
    let (_admin, _, _) = register(&client, "root");
    let (pleb, _, _) = register(&client, "pleb");

    let res = client
        .get("/api/v1/admin/livekit-instances")
        .header(bearer(&pleb))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client.get("/api/v1/admin/users").header(bearer(&pleb)).dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn instances_are_listed_without_credentials() {
    let client = test_client();
    let (admin, _, _) = register(&client, "root");

    let res = client
        .get("/api/v1/admin/livekit-instances")
        .header(bearer(&admin))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let instances = body["data"].as_array().unwrap();
    assert_eq!(instances.len(), 1, "test config seeds one platform instance");
    let listing = serde_json::to_string(&body).unwrap();
    assert!(!listing.contains("devkey"));
    assert!(!listing.contains(TEST_SFU_SECRET));
    assert!(!listing.contains("api_key"));
}

#[test]
fn loaded_instance_delete_requires_an_absorbing_target() {
    let client = test_client();
    let (admin, _, _) = register(&client, "root");
    // The created server lands on the seeded platform instance.
    create_server(&client, &admin, "Alpha");

    let res = client
        .get("/api/v1/admin/livekit-instances")
        .header(bearer(&admin))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let loaded = body["data"][0].clone();
    assert_eq!(loaded["server_count"], 1);
    let loaded_id = loaded["id"].as_str().unwrap().to_string();

    let res = client
        .delete(format!("/api/v1/admin/livekit-instances/{loaded_id}"))
        .header(bearer(&admin))
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);

    // A full target cannot absorb the load either.
    let res = client
        .post("/api/v1/admin/livekit-instances")
        .header(ContentType::JSON)
        .header(bearer(&admin))
        .body(r#"{"url": "ws://other:7880", "api_key": "k2", "api_secret": "s2-very-secret", "max_servers": 1}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let target_id = body["data"]["id"].as_str().unwrap().to_string();

    // Occupy the target to capacity.
    {
        let conn = rusqlite::Connection::open(&client.db_path).unwrap();
        conn.execute(
            "INSERT INTO servers (id, name, owner_id, invite_required, instance_id, created_at)
             SELECT 'filler0000000001', 'Filler', owner_id, 0, ?1, created_at FROM servers LIMIT 1",
            rusqlite::params![&target_id],
        )
        .unwrap();
    }
    let res = client
        .delete(format!(
            "/api/v1/admin/livekit-instances/{loaded_id}?migrate_to={target_id}"
        ))
        .header(bearer(&admin))
        .dispatch();
    assert_eq!(res.status(), Status::ServiceUnavailable);
    assert_eq!(error_code(res), "resource_exhausted");

    // Free the target; migration then drains and deletes.
    {
        let conn = rusqlite::Connection::open(&client.db_path).unwrap();
        conn.execute("DELETE FROM servers WHERE id = 'filler0000000001'", [])
            .unwrap();
    }
    let res = client
        .delete(format!(
            "/api/v1/admin/livekit-instances/{loaded_id}?migrate_to={target_id}"
        ))
        .header(bearer(&admin))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .get("/api/v1/admin/livekit-instances")
        .header(bearer(&admin))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let instances = body["data"].as_array().unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0]["id"], target_id.as_str());
    assert_eq!(instances[0]["server_count"], 1);
}

#[test]
fn metrics_history_reports_all_three_windows() {
    let client = test_client();
    let (admin, _, _) = register(&client, "root");
    let res = client
        .get("/api/v1/admin/livekit-instances")
        .header(bearer(&admin))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let instance_id = body["data"][0]["id"].as_str().unwrap().to_string();

    // Plant two snapshots; summaries aggregate only available ones.
    {
        let conn = rusqlite::Connection::open(&client.db_path).unwrap();
        conn.execute(
            "INSERT INTO metrics_snapshots (instance_id, created_at, available, participants, rooms, cpu_load)
             VALUES (?1, datetime('now'), 1, 10, 3, 0.5),
                    (?1, datetime('now'), 0, 999, 999, 0.9)",
            rusqlite::params![&instance_id],
        )
        .unwrap();
    }

    let res = client
        .get(format!(
            "/api/v1/admin/livekit-instances/{instance_id}/metrics/history"
        ))
        .header(bearer(&admin))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let windows: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w["window"].as_str().unwrap())
        .collect();
    assert_eq!(windows, vec!["24h", "7d", "30d"]);
    assert_eq!(body["data"][0]["peak_participants"], 10);
    assert_eq!(body["data"][0]["samples"], 1, "unavailable snapshots are excluded");
}
