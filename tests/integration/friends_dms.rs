use crate::common::{bearer, error_code, register, test_client};
use rocket::http::{ContentType, Status};

fn send_request(client: &rocket::local::blocking::Client, token: &str, username: &str) -> Status {
    client
        .post("/api/v1/friends/requests")
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(format!(r#"{{"username": "{username}"}}"#))
        .dispatch()
        .status()
}

fn open_dm(client: &rocket::local::blocking::Client, token: &str, user_id: &str) -> serde_json::Value {
    let res = client
        .post("/api/v1/dms")
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(format!(r#"{{"user_id": "{user_id}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    body["data"].clone()
}

#[test]
fn request_accept_flow_enforces_the_non_initiator_rule() {
    let client = test_client();
    let (alice, _, alice_id) = register(&client, "alice");
    let (bob, _, bob_id) = register(&client, "bob");

    assert_eq!(send_request(&client, &alice, "bob"), Status::Ok);
    // Sending again is a conflict, not a second request.
    assert_eq!(send_request(&client, &alice, "bob"), Status::Conflict);

    // The initiator cannot accept their own request.
    let res = client
        .post(format!("/api/v1/friends/requests/{bob_id}/accept"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .post(format!("/api/v1/friends/requests/{alice_id}/accept"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client.get("/api/v1/friends").header(bearer(&alice)).dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let entries = body["data"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["status"], "accepted");
    assert_eq!(entries[0]["user"]["username"], "bob");
}

#[test]
fn reverse_pending_request_auto_accepts() {
    let client = test_client();
    let (alice, _, _) = register(&client, "alice");
    let (bob, _, _) = register(&client, "bob");

    assert_eq!(send_request(&client, &alice, "bob"), Status::Ok);
    assert_eq!(send_request(&client, &bob, "alice"), Status::Ok);

    let res = client.get("/api/v1/friends").header(bearer(&bob)).dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"][0]["status"], "accepted");
}

#[test]
fn decline_and_remove_return_the_edge_to_none() {
    let client = test_client();
    let (alice, _, alice_id) = register(&client, "alice");
    let (bob, _, bob_id) = register(&client, "bob");

    send_request(&client, &alice, "bob");
    let res = client
        .post(format!("/api/v1/friends/requests/{alice_id}/decline"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    // Edge is gone; a fresh request works again.
    assert_eq!(send_request(&client, &alice, "bob"), Status::Ok);
    let res = client
        .post(format!("/api/v1/friends/requests/{alice_id}/accept"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .delete(format!("/api/v1/friends/{bob_id}"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let res = client.get("/api/v1/friends").header(bearer(&alice)).dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[test]
fn block_overrides_and_only_the_blocker_unblocks() {
    let client = test_client();
    let (alice, _, alice_id) = register(&client, "alice");
    let (bob, _, bob_id) = register(&client, "bob");

    send_request(&client, &alice, "bob");
    let res = client
        .post(format!("/api/v1/friends/{bob_id}/block"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    // Blocked: requests and DMs bounce both ways.
    assert_eq!(send_request(&client, &bob, "alice"), Status::Forbidden);
    assert_eq!(send_request(&client, &alice, "bob"), Status::Forbidden);
    let res = client
        .post("/api/v1/dms")
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(format!(r#"{{"user_id": "{alice_id}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    // The blocked side cannot lift it.
    let res = client
        .delete(format!("/api/v1/friends/{alice_id}/block"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .delete(format!("/api/v1/friends/{bob_id}/block"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    assert_eq!(send_request(&client, &bob, "alice"), Status::Ok);
}

#[test]
fn dm_channel_is_deterministic_and_reused() {
    let client = test_client();
    let (alice, _, alice_id) = register(&client, "alice");
    let (bob, _, bob_id) = register(&client, "bob");

    let first = open_dm(&client, &alice, &bob_id);
    let second = open_dm(&client, &bob, &alice_id);
    assert_eq!(first["id"], second["id"], "one channel per pair");
    assert_eq!(first["other_user"]["username"], "bob");
    assert_eq!(second["other_user"]["username"], "alice");
}

#[test]
fn dm_messaging_edit_pin_and_unread() {
    let client = test_client();
    let (alice, _, _) = register(&client, "alice");
    let (bob, _, bob_id) = register(&client, "bob");
    let channel = open_dm(&client, &alice, &bob_id);
    let channel_id = channel["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/api/v1/dms/{channel_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"content": "hi bob"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let message_id = body["data"]["id"].as_str().unwrap().to_string();

    // Author-only edit.
    let res = client
        .patch(format!("/api/v1/dms/messages/{message_id}"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"content": "not yours"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    // Either participant may pin.
    let res = client
        .post(format!("/api/v1/dms/messages/{message_id}/pin"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let res = client
        .get(format!("/api/v1/dms/{channel_id}/pinned"))
        .header(bearer(&alice))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    // Bob has one unread until he marks it.
    let res = client.get("/api/v1/dms").header(bearer(&bob)).dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"][0]["unread_count"], 1);

    let res = client
        .post(format!("/api/v1/dms/{channel_id}/read"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(format!(r#"{{"message_id": "{message_id}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client.get("/api/v1/dms").header(bearer(&bob)).dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"][0]["unread_count"], 0);
}

#[test]
fn dm_reactions_toggle_and_search_scopes_to_the_channel() {
    let client = test_client();
    let (alice, _, _) = register(&client, "alice");
    let (bob, _, bob_id) = register(&client, "bob");
    let (carol, _, carol_id) = register(&client, "carol");
    let channel = open_dm(&client, &alice, &bob_id);
    let channel_id = channel["id"].as_str().unwrap().to_string();
    let other = open_dm(&client, &alice, &carol_id);
    let other_id = other["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/api/v1/dms/{channel_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"content": "the sparrow flies at dawn"}"#)
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let message_id = body["data"]["id"].as_str().unwrap().to_string();
    client
        .post(format!("/api/v1/dms/{other_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"content": "the sparrow stays home"}"#)
        .dispatch();

    // Outsiders cannot react in a DM that is not theirs.
    let res = client
        .post(format!("/api/v1/dms/messages/{message_id}/reactions"))
        .header(ContentType::JSON)
        .header(bearer(&carol))
        .body(r#"{"emoji": "👀"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);

    let res = client
        .post(format!("/api/v1/dms/messages/{message_id}/reactions"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"emoji": "👀"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .get(format!("/api/v1/dms/{channel_id}/search?q=sparrow"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["total_count"], 1);
    assert_eq!(
        body["data"]["results"][0]["content"],
        "the sparrow flies at dawn"
    );
}

#[test]
fn self_dm_and_self_friendship_are_rejected() {
    let client = test_client();
    let (alice, _, alice_id) = register(&client, "alice");
    assert_eq!(send_request(&client, &alice, "alice"), Status::BadRequest);
    let res = client
        .post("/api/v1/dms")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"user_id": "{alice_id}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
    assert_eq!(error_code(res), "validation");
}
