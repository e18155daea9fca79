use concord::config::Config;
use concord::rate_limit::RateLimitConfig;
use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::Client;

/// Wrapper around Client that auto-deletes the temp DB and upload dir on
/// drop. Uses Option<Client> so the SQLite connection is released before the
/// files go away (WAL mode holds the file).
pub struct TestClient {
    client: Option<Client>,
    pub db_path: String,
    upload_dir: String,
}

impl Drop for TestClient {
    fn drop(&mut self) {
        drop(self.client.take());
        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_file(format!("{}-wal", self.db_path));
        let _ = std::fs::remove_file(format!("{}-shm", self.db_path));
        let _ = std::fs::remove_dir_all(&self.upload_dir);
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().unwrap()
    }
}

pub fn test_client() -> TestClient {
    // Unique temp paths per test (avoids parallel test contention)
    let nonce = uuid::Uuid::new_v4().to_string();
    let nonce = nonce.split('-').next().unwrap();
    let db_path = format!("/tmp/concord_test_{nonce}.db");
    let upload_dir = format!("/tmp/concord_uploads_{nonce}");
    std::fs::create_dir_all(&upload_dir).unwrap();

    // Auth attempts are budgeted per rocket instance; tests register several
    // accounts, so raise the window well above any single test's needs.
    let rate_config = RateLimitConfig {
        auth_max: 1000,
        ..RateLimitConfig::default()
    };
    let config = Config::for_testing(&db_path, &upload_dir);
    let rocket = concord::rocket_with_config_and_limits(config, rate_config);
    let client = Client::tracked(rocket).expect("valid rocket instance");
    TestClient {
        client: Some(client),
        db_path,
        upload_dir,
    }
}

pub fn bearer(token: &str) -> Header<'static> {
    Header::new("Authorization", format!("Bearer {token}"))
}

/// Register a user; returns (access_token, refresh_token, user_id).
pub fn register(client: &Client, username: &str) -> (String, String, String) {
    let res = client
        .post("/api/v1/auth/register")
        .header(ContentType::JSON)
        .body(format!(
            r#"{{"username": "{username}", "password": "hunter2hunter2", "email": "{username}@example.test"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok, "register {username}");
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["success"], true);
    let data = &body["data"];
    (
        data["access_token"].as_str().unwrap().to_string(),
        data["refresh_token"].as_str().unwrap().to_string(),
        data["user"]["id"].as_str().unwrap().to_string(),
    )
}

/// Create a server; returns its id.
pub fn create_server(client: &Client, token: &str, name: &str) -> String {
    let res = client
        .post("/api/v1/servers")
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(format!(r#"{{"name": "{name}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok, "create server {name}");
    let body: serde_json::Value = res.into_json().unwrap();
    body["data"]["id"].as_str().unwrap().to_string()
}

/// First text channel of a server (every server seeds #general).
pub fn general_channel(client: &Client, token: &str, server_id: &str) -> String {
    let res = client
        .get(format!("/api/v1/servers/{server_id}/channels"))
        .header(bearer(token))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    body["data"]["channels"][0]["id"].as_str().unwrap().to_string()
}

/// Create an invite and have another user join with it; returns the invite code.
pub fn invite_and_join(client: &Client, owner_token: &str, member_token: &str, server_id: &str) -> String {
    let res = client
        .post(format!("/api/v1/servers/{server_id}/invites"))
        .header(ContentType::JSON)
        .header(bearer(owner_token))
        .body(r#"{"max_uses": 0}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let code = body["data"]["code"].as_str().unwrap().to_string();

    let res = client
        .post("/api/v1/servers/join")
        .header(ContentType::JSON)
        .header(bearer(member_token))
        .body(format!(r#"{{"invite_code": "{code}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok, "join via invite");
    code
}

/// Send a message; returns the message id.
pub fn send_message(
    client: &Client,
    token: &str,
    server_id: &str,
    channel_id: &str,
    content: &str,
) -> String {
    let res = client
        .post(format!(
            "/api/v1/servers/{server_id}/channels/{channel_id}/messages"
        ))
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(format!(r#"{{"content": "{content}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok, "send message");
    let body: serde_json::Value = res.into_json().unwrap();
    body["data"]["id"].as_str().unwrap().to_string()
}

/// Error code out of the `{success: false, error: {code}}` envelope.
pub fn error_code(res: rocket::local::blocking::LocalResponse<'_>) -> String {
    let body: serde_json::Value = res.into_json().unwrap();
    body["error"]["code"].as_str().unwrap_or_default().to_string()
}
