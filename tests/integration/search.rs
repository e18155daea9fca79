use crate::common::{
    bearer, create_server, general_channel, register, send_message, test_client,
};
use rocket::http::{ContentType, Status};

#[test]
fn full_text_search_matches_tokens_case_insensitively() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let server_id = create_server(&client, &owner, "Alpha");
    let channel = general_channel(&client, &owner, &server_id);

    send_message(&client, &owner, &server_id, &channel, "Deploying the new SEARCH engine");
    send_message(&client, &owner, &server_id, &channel, "lunch plans anyone");

    let res = client
        .get(format!("/api/v1/servers/{server_id}/search?q=search"))
        .header(bearer(&owner))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["total_count"], 1);
    assert!(body["data"]["results"][0]["content"]
        .as_str()
        .unwrap()
        .contains("SEARCH"));
    // Author rides along on every result.
    assert_eq!(body["data"]["results"][0]["author"]["username"], "owner");
}

#[test]
fn search_scopes_to_a_channel_when_asked() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let server_id = create_server(&client, &owner, "Alpha");
    let general = general_channel(&client, &owner, &server_id);
    let res = client
        .post(format!("/api/v1/servers/{server_id}/channels"))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(r#"{"name": "side"}"#)
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let side = body["data"]["id"].as_str().unwrap().to_string();

    send_message(&client, &owner, &server_id, &general, "token in general");
    send_message(&client, &owner, &server_id, &side, "token in side");

    let res = client
        .get(format!(
            "/api/v1/servers/{server_id}/search?q=token&channel_id={side}"
        ))
        .header(bearer(&owner))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["total_count"], 1);
    assert_eq!(body["data"]["results"][0]["channel_id"], side);

    let res = client
        .get(format!("/api/v1/servers/{server_id}/search?q=token"))
        .header(bearer(&owner))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["total_count"], 2);
}

#[test]
fn search_validates_the_query_and_respects_pagination() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let server_id = create_server(&client, &owner, "Alpha");
    let channel = general_channel(&client, &owner, &server_id);

    let res = client
        .get(format!("/api/v1/servers/{server_id}/search?q="))
        .header(bearer(&owner))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    for i in 0..5 {
        send_message(&client, &owner, &server_id, &channel, &format!("needle {i}"));
    }
    let res = client
        .get(format!(
            "/api/v1/servers/{server_id}/search?q=needle&limit=2&offset=2"
        ))
        .header(bearer(&owner))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["total_count"], 5);
    assert_eq!(body["data"]["results"].as_array().unwrap().len(), 2);
}

#[test]
fn deleted_and_edited_messages_track_the_index() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let server_id = create_server(&client, &owner, "Alpha");
    let channel = general_channel(&client, &owner, &server_id);
    let message_id = send_message(&client, &owner, &server_id, &channel, "ephemeral zebra");

    let res = client
        .patch(format!("/api/v1/servers/{server_id}/messages/{message_id}"))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(r#"{"content": "quiet giraffe"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .get(format!("/api/v1/servers/{server_id}/search?q=zebra"))
        .header(bearer(&owner))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["total_count"], 0, "edits reindex");

    let res = client
        .get(format!("/api/v1/servers/{server_id}/search?q=giraffe"))
        .header(bearer(&owner))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["total_count"], 1);

    client
        .delete(format!("/api/v1/servers/{server_id}/messages/{message_id}"))
        .header(bearer(&owner))
        .dispatch();
    let res = client
        .get(format!("/api/v1/servers/{server_id}/search?q=giraffe"))
        .header(bearer(&owner))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["total_count"], 0, "deletes drop the row");
}
