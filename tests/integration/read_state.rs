use crate::common::{
    bearer, create_server, general_channel, invite_and_join, register, send_message, test_client,
};
use rocket::http::{ContentType, Status};

fn unread_for(client: &rocket::local::blocking::Client, token: &str) -> serde_json::Value {
    let res = client.get("/api/v1/unread").header(bearer(token)).dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    body["data"].clone()
}

#[test]
fn unread_counts_exclude_own_messages_and_clear_on_mark() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let (member, _, _) = register(&client, "member");
    let server_id = create_server(&client, &owner, "Alpha");
    invite_and_join(&client, &owner, &member, &server_id);
    let channel = general_channel(&client, &owner, &server_id);

    send_message(&client, &member, &server_id, &channel, "my own words");
    let m2 = send_message(&client, &owner, &server_id, &channel, "from the owner");

    // The member's own message never counts against them.
    let unread = unread_for(&client, &member);
    let channels = unread["channels"].as_array().unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0]["channel_id"], channel.as_str());
    assert_eq!(channels[0]["unread_count"], 1);

    let res = client
        .post(format!(
            "/api/v1/servers/{server_id}/channels/{channel}/read"
        ))
        .header(ContentType::JSON)
        .header(bearer(&member))
        .body(format!(r#"{{"message_id": "{m2}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    // Zero-count channels are omitted entirely.
    let unread = unread_for(&client, &member);
    assert!(unread["channels"].as_array().unwrap().is_empty());
}

#[test]
fn watermark_never_moves_backwards() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let (member, _, member_id) = register(&client, "member");
    let server_id = create_server(&client, &owner, "Alpha");
    invite_and_join(&client, &owner, &member, &server_id);
    let channel = general_channel(&client, &owner, &server_id);

    let m1 = send_message(&client, &owner, &server_id, &channel, "first");
    let m2 = send_message(&client, &owner, &server_id, &channel, "second");

    for message_id in [&m2, &m1] {
        let res = client
            .post(format!(
                "/api/v1/servers/{server_id}/channels/{channel}/read"
            ))
            .header(ContentType::JSON)
            .header(bearer(&member))
            .body(format!(r#"{{"message_id": "{message_id}"}}"#))
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
    }

    // The later watermark survives the attempt to rewind.
    let conn = rusqlite::Connection::open(&client.db_path).unwrap();
    let marked: String = conn
        .query_row(
            "SELECT last_read_message_id FROM read_states WHERE user_id = ?1 AND channel_id = ?2",
            rusqlite::params![&member_id, &channel],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(marked, m2);
}

#[test]
fn mark_read_rejects_messages_from_other_channels() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let server_id = create_server(&client, &owner, "Alpha");
    let general = general_channel(&client, &owner, &server_id);
    let res = client
        .post(format!("/api/v1/servers/{server_id}/channels"))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(r#"{"name": "elsewhere"}"#)
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let elsewhere = body["data"]["id"].as_str().unwrap().to_string();
    let foreign = send_message(&client, &owner, &server_id, &elsewhere, "over here");

    let res = client
        .post(format!(
            "/api/v1/servers/{server_id}/channels/{general}/read"
        ))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(format!(r#"{{"message_id": "{foreign}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}
