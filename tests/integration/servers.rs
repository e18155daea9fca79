use crate::common::{bearer, create_server, error_code, invite_and_join, register, test_client};
use rocket::http::{ContentType, Status};

#[test]
fn create_server_seeds_roles_and_general_channel() {
    let client = test_client();
    let (token, _, user_id) = register(&client, "owner");
    let server_id = create_server(&client, &token, "Alpha");

    let res = client
        .get(format!("/api/v1/servers/{server_id}/roles"))
        .header(bearer(&token))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let roles: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert!(roles.contains(&"everyone"));
    assert!(roles.contains(&"owner"));

    let res = client
        .get(format!("/api/v1/servers/{server_id}/channels"))
        .header(bearer(&token))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["channels"][0]["name"], "general");
    assert_eq!(body["data"]["channels"][0]["channel_type"], "text");

    let res = client
        .get(format!("/api/v1/servers/{server_id}/members"))
        .header(bearer(&token))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let members = body["data"].as_array().unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0]["user"]["id"].as_str().unwrap(), user_id);
    assert!(members[0]["role_ids"]
        .as_array()
        .unwrap()
        .iter()
        .any(|r| r == "owner"));
}

#[test]
fn non_members_cannot_see_a_server() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let (outsider, _, _) = register(&client, "outsider");
    let server_id = create_server(&client, &owner, "Private");

    let res = client
        .get(format!("/api/v1/servers/{server_id}"))
        .header(bearer(&outsider))
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn update_requires_manage_server() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let (member, _, _) = register(&client, "member");
    let server_id = create_server(&client, &owner, "Alpha");
    invite_and_join(&client, &owner, &member, &server_id);

    let res = client
        .patch(format!("/api/v1/servers/{server_id}"))
        .header(ContentType::JSON)
        .header(bearer(&member))
        .body(r#"{"name": "Renamed"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
    assert_eq!(error_code(res), "forbidden");

    let res = client
        .patch(format!("/api/v1/servers/{server_id}"))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(r#"{"name": "Renamed"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["name"], "Renamed");
}

#[test]
fn owner_cannot_leave_but_members_can() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let (member, _, _) = register(&client, "member");
    let server_id = create_server(&client, &owner, "Alpha");
    invite_and_join(&client, &owner, &member, &server_id);

    let res = client
        .post(format!("/api/v1/servers/{server_id}/leave"))
        .header(bearer(&owner))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    let res = client
        .post(format!("/api/v1/servers/{server_id}/leave"))
        .header(bearer(&member))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .get(format!("/api/v1/servers/{server_id}"))
        .header(bearer(&member))
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn delete_cascades_every_server_scoped_row() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let (member, _, _) = register(&client, "member");
    let server_id = create_server(&client, &owner, "Doomed");
    invite_and_join(&client, &owner, &member, &server_id);
    let channel_id = crate::common::general_channel(&client, &owner, &server_id);
    crate::common::send_message(&client, &owner, &server_id, &channel_id, "last words");

    // Only the owner may delete.
    let res = client
        .delete(format!("/api/v1/servers/{server_id}"))
        .header(bearer(&member))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .delete(format!("/api/v1/servers/{server_id}"))
        .header(bearer(&owner))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let conn = rusqlite::Connection::open(&client.db_path).unwrap();
    for table in [
        "channels",
        "roles",
        "server_members",
        "invites",
        "bans",
        "user_server_order",
    ] {
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE server_id = ?1"),
                rusqlite::params![&server_id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 0, "{table} rows must not survive server delete");
    }
    let messages: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM messages WHERE server_id = ?1",
            rusqlite::params![&server_id],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(messages, 0);
}

#[test]
fn server_list_reorder_is_per_user() {
    let client = test_client();
    let (token, _, _) = register(&client, "owner");
    let a = create_server(&client, &token, "A");
    let b = create_server(&client, &token, "B");

    let res = client
        .patch("/api/v1/servers/reorder")
        .header(ContentType::JSON)
        .header(bearer(&token))
        .body(format!(r#"{{"server_ids": ["{b}", "{a}"]}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client.get("/api/v1/servers").header(bearer(&token)).dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![b.as_str(), a.as_str()]);
}
