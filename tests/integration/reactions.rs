use crate::common::{
    bearer, create_server, general_channel, invite_and_join, register, send_message, test_client,
};
use rocket::http::{ContentType, Status};

fn toggle(
    client: &rocket::local::blocking::Client,
    token: &str,
    server_id: &str,
    message_id: &str,
    emoji: &str,
) -> serde_json::Value {
    let res = client
        .post(format!(
            "/api/v1/servers/{server_id}/messages/{message_id}/reactions"
        ))
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(format!(r#"{{"emoji": "{emoji}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    body["data"].clone()
}

#[test]
fn toggle_alternates_with_call_parity() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let server_id = create_server(&client, &owner, "Alpha");
    let channel = general_channel(&client, &owner, &server_id);
    let message_id = send_message(&client, &owner, &server_id, &channel, "react to this");

    let first = toggle(&client, &owner, &server_id, &message_id, "👍");
    assert_eq!(first["added"], true);
    assert_eq!(first["reactions"][0]["count"], 1);

    let second = toggle(&client, &owner, &server_id, &message_id, "👍");
    assert_eq!(second["added"], false);
    assert!(second["reactions"].as_array().unwrap().is_empty());

    let third = toggle(&client, &owner, &server_id, &message_id, "👍");
    assert_eq!(third["added"], true);

    // Row count is 0 or 1 under any toggle sequence.
    let conn = rusqlite::Connection::open(&client.db_path).unwrap();
    let rows: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM reactions WHERE message_id = ?1",
            rusqlite::params![&message_id],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(rows, 1);
}

#[test]
fn aggregate_groups_by_emoji_with_user_lists() {
    let client = test_client();
    let (owner, _, owner_id) = register(&client, "owner");
    let (member, _, member_id) = register(&client, "member");
    let server_id = create_server(&client, &owner, "Alpha");
    invite_and_join(&client, &owner, &member, &server_id);
    let channel = general_channel(&client, &owner, &server_id);
    let message_id = send_message(&client, &owner, &server_id, &channel, "popular");

    toggle(&client, &owner, &server_id, &message_id, "👍");
    let agg = toggle(&client, &member, &server_id, &message_id, "👍");
    assert_eq!(agg["reactions"][0]["count"], 2);
    let users: Vec<&str> = agg["reactions"][0]["user_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u.as_str().unwrap())
        .collect();
    assert!(users.contains(&owner_id.as_str()));
    assert!(users.contains(&member_id.as_str()));

    let agg = toggle(&client, &member, &server_id, &message_id, "❤️");
    assert_eq!(agg["reactions"].as_array().unwrap().len(), 2);
}

#[test]
fn reactions_are_cleared_with_their_message() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let server_id = create_server(&client, &owner, "Alpha");
    let channel = general_channel(&client, &owner, &server_id);
    let message_id = send_message(&client, &owner, &server_id, &channel, "ephemeral");
    toggle(&client, &owner, &server_id, &message_id, "👍");

    let res = client
        .delete(format!("/api/v1/servers/{server_id}/messages/{message_id}"))
        .header(bearer(&owner))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let conn = rusqlite::Connection::open(&client.db_path).unwrap();
    let rows: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM reactions WHERE message_id = ?1",
            rusqlite::params![&message_id],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(rows, 0);
}
