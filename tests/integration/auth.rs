use crate::common::{bearer, error_code, register, test_client};
use rocket::http::{ContentType, Status};

#[test]
fn register_login_and_me() {
    let client = test_client();
    let (token, _refresh, user_id) = register(&client, "nia");

    let res = client.get("/api/v1/users/me").header(bearer(&token)).dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["id"].as_str().unwrap(), user_id);
    assert_eq!(body["data"]["username"], "nia");

    let res = client
        .post("/api/v1/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"username": "NIA", "password": "hunter2hunter2"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok, "handle lookup is case-insensitive");
}

#[test]
fn first_registered_user_is_platform_admin() {
    let client = test_client();
    let (first_token, _, _) = register(&client, "first");
    let (second_token, _, _) = register(&client, "second");

    let res = client.get("/api/v1/users/me").header(bearer(&first_token)).dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["is_platform_admin"], true);

    let res = client.get("/api/v1/users/me").header(bearer(&second_token)).dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["is_platform_admin"], false);
}

#[test]
fn duplicate_username_conflicts_case_insensitively() {
    let client = test_client();
    register(&client, "taken");
    let res = client
        .post("/api/v1/auth/register")
        .header(ContentType::JSON)
        .body(r#"{"username": "Taken", "password": "hunter2hunter2"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
    assert_eq!(error_code(res), "conflict");
}

#[test]
fn register_validates_username_and_password() {
    let client = test_client();
    let res = client
        .post("/api/v1/auth/register")
        .header(ContentType::JSON)
        .body(r#"{"username": "ab", "password": "hunter2hunter2"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    let res = client
        .post("/api/v1/auth/register")
        .header(ContentType::JSON)
        .body(r#"{"username": "has space", "password": "hunter2hunter2"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    let res = client
        .post("/api/v1/auth/register")
        .header(ContentType::JSON)
        .body(r#"{"username": "shortpw", "password": "short"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn wrong_password_is_unauthenticated() {
    let client = test_client();
    register(&client, "nia");
    let res = client
        .post("/api/v1/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"username": "nia", "password": "wrong-password"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
    assert_eq!(error_code(res), "unauthenticated");
}

#[test]
fn refresh_rotates_and_kills_the_prior_token() {
    let client = test_client();
    let (_access, refresh, _) = register(&client, "nia");

    let res = client
        .post("/api/v1/auth/refresh")
        .header(ContentType::JSON)
        .body(format!(r#"{{"refresh_token": "{refresh}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let rotated = body["data"]["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(rotated, refresh);

    // The prior token is gone forever.
    let res = client
        .post("/api/v1/auth/refresh")
        .header(ContentType::JSON)
        .body(format!(r#"{{"refresh_token": "{refresh}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    // The rotated one works.
    let res = client
        .post("/api/v1/auth/refresh")
        .header(ContentType::JSON)
        .body(format!(r#"{{"refresh_token": "{rotated}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn logout_invalidates_the_refresh_token() {
    let client = test_client();
    let (_access, refresh, _) = register(&client, "nia");

    let res = client
        .post("/api/v1/auth/logout")
        .header(ContentType::JSON)
        .body(format!(r#"{{"refresh_token": "{refresh}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post("/api/v1/auth/refresh")
        .header(ContentType::JSON)
        .body(format!(r#"{{"refresh_token": "{refresh}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn password_change_invalidates_all_sessions() {
    let client = test_client();
    let (access, refresh, _) = register(&client, "nia");

    let res = client
        .post("/api/v1/auth/password")
        .header(ContentType::JSON)
        .header(bearer(&access))
        .body(r#"{"current_password": "hunter2hunter2", "new_password": "anotherpass99"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post("/api/v1/auth/refresh")
        .header(ContentType::JSON)
        .body(format!(r#"{{"refresh_token": "{refresh}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    let res = client
        .post("/api/v1/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"username": "nia", "password": "anotherpass99"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn reset_token_is_single_use_and_kills_sessions() {
    let client = test_client();
    let (_access, refresh, user_id) = register(&client, "nia");

    // Request a reset (response never reveals account existence), then plant
    // a known token directly so the test can apply it.
    let res = client
        .post("/api/v1/auth/forgot")
        .header(ContentType::JSON)
        .body(r#"{"email": "nia@example.test"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let plaintext = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    {
        let conn = rusqlite::Connection::open(&client.db_path).unwrap();
        conn.execute(
            "INSERT INTO password_resets (token_hash, user_id, expires_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                concord::crypto::token_hash(plaintext),
                user_id,
                "2999-01-01T00:00:00.000Z"
            ],
        )
        .unwrap();
    }

    let res = client
        .post("/api/v1/auth/reset")
        .header(ContentType::JSON)
        .body(format!(
            r#"{{"token": "{plaintext}", "new_password": "resetpass1234"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    // Old refresh session is gone; the token cannot be replayed.
    let res = client
        .post("/api/v1/auth/refresh")
        .header(ContentType::JSON)
        .body(format!(r#"{{"refresh_token": "{refresh}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    let res = client
        .post("/api/v1/auth/reset")
        .header(ContentType::JSON)
        .body(format!(
            r#"{{"token": "{plaintext}", "new_password": "resetpass5678"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    let res = client
        .post("/api/v1/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"username": "nia", "password": "resetpass1234"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn missing_token_is_rejected() {
    let client = test_client();
    let res = client.get("/api/v1/users/me").dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    let res = client
        .get("/api/v1/users/me")
        .header(bearer("not-a-jwt"))
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}
