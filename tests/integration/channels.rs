use crate::common::{bearer, create_server, general_channel, invite_and_join, register, test_client};
use rocket::http::{ContentType, Status};

#[test]
fn create_update_delete_channel_requires_manage_channels() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let (member, _, _) = register(&client, "member");
    let server_id = create_server(&client, &owner, "Alpha");
    invite_and_join(&client, &owner, &member, &server_id);

    let res = client
        .post(format!("/api/v1/servers/{server_id}/channels"))
        .header(ContentType::JSON)
        .header(bearer(&member))
        .body(r#"{"name": "nope"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .post(format!("/api/v1/servers/{server_id}/channels"))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(r#"{"name": "voice-lounge", "channel_type": "voice", "user_limit": 4}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let channel_id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["channel_type"], "voice");
    assert_eq!(body["data"]["user_limit"], 4);

    let res = client
        .patch(format!(
            "/api/v1/servers/{server_id}/channels/{channel_id}"
        ))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(r#"{"topic": "hang out"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["data"]["topic"], "hang out");

    let res = client
        .delete(format!(
            "/api/v1/servers/{server_id}/channels/{channel_id}"
        ))
        .header(bearer(&owner))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn channel_type_is_rejected_when_unknown() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let server_id = create_server(&client, &owner, "Alpha");

    let res = client
        .post(format!("/api/v1/servers/{server_id}/channels"))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(r#"{"name": "weird", "channel_type": "forum"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn categories_group_channels_and_release_them_on_delete() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let server_id = create_server(&client, &owner, "Alpha");

    let res = client
        .post(format!("/api/v1/servers/{server_id}/categories"))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(r#"{"name": "Texty"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let category_id = body["data"]["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/api/v1/servers/{server_id}/channels"))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(format!(
            r#"{{"name": "inside", "category_id": "{category_id}"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let channel_id = body["data"]["id"].as_str().unwrap().to_string();

    let res = client
        .delete(format!(
            "/api/v1/servers/{server_id}/categories/{category_id}"
        ))
        .header(bearer(&owner))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    // The channel survives without its category.
    let res = client
        .get(format!("/api/v1/servers/{server_id}/channels"))
        .header(bearer(&owner))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let surviving = body["data"]["channels"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["id"] == channel_id.as_str())
        .expect("channel survives category delete");
    assert!(surviving["category_id"].is_null());
}

#[test]
fn reorder_rewrites_positions_in_one_batch() {
    let client = test_client();
    let (owner, _, _) = register(&client, "owner");
    let server_id = create_server(&client, &owner, "Alpha");
    let general = general_channel(&client, &owner, &server_id);

    let res = client
        .post(format!("/api/v1/servers/{server_id}/channels"))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(r#"{"name": "second"}"#)
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let second = body["data"]["id"].as_str().unwrap().to_string();

    let res = client
        .patch(format!("/api/v1/servers/{server_id}/channels/reorder"))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(format!(
            r#"{{"items": [{{"id": "{second}", "position": 0}}, {{"id": "{general}", "position": 1}}]}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .get(format!("/api/v1/servers/{server_id}/channels"))
        .header(bearer(&owner))
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let names: Vec<&str> = body["data"]["channels"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["second", "general"]);
}
