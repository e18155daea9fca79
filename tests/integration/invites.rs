use crate::common::{bearer, create_server, error_code, register, test_client};
use rocket::http::{ContentType, Status};

fn make_invite(
    client: &rocket::local::blocking::Client,
    token: &str,
    server_id: &str,
    body: &str,
) -> String {
    let res = client
        .post(format!("/api/v1/servers/{server_id}/invites"))
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(body.to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    body["data"]["code"].as_str().unwrap().to_string()
}

fn join(client: &rocket::local::blocking::Client, token: &str, code: &str) -> Status {
    client
        .post("/api/v1/servers/join")
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(format!(r#"{{"invite_code": "{code}"}}"#))
        .dispatch()
        .status()
}

#[test]
fn max_uses_caps_acceptances() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let (a, _, _) = register(&client, "joinera");
    let (b, _, _) = register(&client, "joinerb");
    let (c, _, _) = register(&client, "joinerc");
    let server_id = create_server(&client, &owner, "Alpha");
    let code = make_invite(&client, &owner, &server_id, r#"{"max_uses": 2}"#);

    assert_eq!(join(&client, &a, &code), Status::Ok);
    assert_eq!(join(&client, &b, &code), Status::Ok);
    // Third acceptance finds the invite spent.
    assert_eq!(join(&client, &c, &code), Status::NotFound);

    let conn = rusqlite::Connection::open(&client.db_path).unwrap();
    let uses: i64 = conn
        .query_row(
            "SELECT uses FROM invites WHERE code = ?1",
            rusqlite::params![&code],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(uses, 2);
}

#[test]
fn expired_invites_read_as_missing() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let (joiner, _, _) = register(&client, "joiner");
    let server_id = create_server(&client, &owner, "Alpha");
    let code = make_invite(&client, &owner, &server_id, r#"{"max_uses": 0}"#);

    let conn = rusqlite::Connection::open(&client.db_path).unwrap();
    conn.execute(
        "UPDATE invites SET expires_at = '2000-01-01T00:00:00.000Z' WHERE code = ?1",
        rusqlite::params![&code],
    )
    .unwrap();
    drop(conn);

    assert_eq!(join(&client, &joiner, &code), Status::NotFound);
    let res = client.get(format!("/api/v1/invites/{code}")).dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn preview_is_unauthenticated_and_counts_members() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let server_id = create_server(&client, &owner, "Shown Off");
    let code = make_invite(&client, &owner, &server_id, r#"{"max_uses": 0}"#);

    let res = client.get(format!("/api/v1/invites/{code}")).dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["server_name"], "Shown Off");
    assert_eq!(body["data"]["member_count"], 1);
}

#[test]
fn invite_creation_is_gated_and_double_join_conflicts() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let (member, _, _) = register(&client, "member");
    let server_id = create_server(&client, &owner, "Alpha");
    let code = make_invite(&client, &owner, &server_id, r#"{"max_uses": 0}"#);
    assert_eq!(join(&client, &member, &code), Status::Ok);

    // Plain members lack MANAGE_INVITES.
    let res = client
        .post(format!("/api/v1/servers/{server_id}/invites"))
        .header(ContentType::JSON)
        .header(bearer(&member))
        .body(r#"{"max_uses": 0}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .post("/api/v1/servers/join")
        .header(ContentType::JSON)
        .header(bearer(&member))
        .body(format!(r#"{{"invite_code": "{code}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
    assert_eq!(error_code(res), "conflict");
}

#[test]
fn registration_bound_to_an_invite_joins_the_server() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let server_id = create_server(&client, &owner, "Alpha");
    let code = make_invite(&client, &owner, &server_id, r#"{"max_uses": 0}"#);

    let res = client
        .post("/api/v1/auth/register")
        .header(ContentType::JSON)
        .body(format!(
            r#"{{"username": "walkin", "password": "hunter2hunter2", "invite_code": "{code}"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let token = body["data"]["access_token"].as_str().unwrap().to_string();

    let res = client
        .get(format!("/api/v1/servers/{server_id}"))
        .header(bearer(&token))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}
