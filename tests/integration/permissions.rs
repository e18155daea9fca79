use crate::common::{
    bearer, create_server, error_code, general_channel, invite_and_join, register, test_client,
};
use rocket::http::{ContentType, Status};

// Bits mirror the wire values of the permission bitfield.
const SEND_MESSAGES: u32 = 1 << 1;
const KICK_MEMBERS: u32 = 1 << 5;

fn create_role(client: &rocket::local::blocking::Client, token: &str, server_id: &str, name: &str, permissions: u32) -> String {
    let res = client
        .post(format!("/api/v1/servers/{server_id}/roles"))
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(format!(r#"{{"name": "{name}", "permissions": {permissions}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok, "create role {name}");
    let body: serde_json::Value = res.into_json().unwrap();
    body["data"]["id"].as_str().unwrap().to_string()
}

fn assign_roles(client: &rocket::local::blocking::Client, token: &str, server_id: &str, user_id: &str, roles: &[&str]) {
    let role_list = roles
        .iter()
        .map(|r| format!(r#""{r}""#))
        .collect::<Vec<_>>()
        .join(", ");
    let res = client
        .patch(format!("/api/v1/servers/{server_id}/members/{user_id}"))
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(format!(r#"{{"role_ids": [{role_list}]}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok, "assign roles");
}

/// Owner creates "Alpha"; A gets a kick-capable "mod" role. A can kick B,
/// cannot kick the owner, and cannot hand out the owner role.
#[test]
fn hierarchy_protects_the_owner() {
    let client = test_client();
    let (owner, _, owner_id) = register(&client, "boss");
    let (a_token, _, a_id) = register(&client, "moda");
    let (b_token, _, b_id) = register(&client, "plainb");
    let server_id = create_server(&client, &owner, "Alpha");
    invite_and_join(&client, &owner, &a_token, &server_id);
    invite_and_join(&client, &owner, &b_token, &server_id);

    let mod_role = create_role(&client, &owner, &server_id, "mod", KICK_MEMBERS);
    assign_roles(&client, &owner, &server_id, &a_id, &[&mod_role]);

    // A kicks B: mod (position ≥ 1) outranks B (default, position 0).
    let res = client
        .delete(format!("/api/v1/servers/{server_id}/members/{b_id}"))
        .header(bearer(&a_token))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    // A cannot kick the owner: owner rank is unreachable.
    let res = client
        .delete(format!("/api/v1/servers/{server_id}/members/{owner_id}"))
        .header(bearer(&a_token))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
    assert_eq!(error_code(res), "forbidden");

    // A cannot grant the owner role to anyone.
    invite_and_join(&client, &owner, &b_token, &server_id);
    let res = client
        .patch(format!("/api/v1/servers/{server_id}/members/{b_id}"))
        .header(ContentType::JSON)
        .header(bearer(&a_token))
        .body(r#"{"role_ids": ["owner"]}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

/// Deny override on the default role silences a channel; an allow override
/// on a second role reopens it for its holders.
#[test]
fn override_arithmetic_matches_the_engine() {
    let client = test_client();
    let (owner, _, _) = register(&client, "boss");
    let (member, _, member_id) = register(&client, "talker");
    let server_id = create_server(&client, &owner, "Alpha");
    invite_and_join(&client, &owner, &member, &server_id);

    // A second channel to verify the deny is channel-scoped.
    let res = client
        .post(format!("/api/v1/servers/{server_id}/channels"))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(r#"{"name": "secret"}"#)
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let secret = body["data"]["id"].as_str().unwrap().to_string();
    let general = general_channel(&client, &owner, &server_id);

    let res = client
        .put(format!(
            "/api/v1/servers/{server_id}/channels/{secret}/permissions/everyone"
        ))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(format!(r#"{{"allow": 0, "deny": {SEND_MESSAGES}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    // Denied in secret, fine elsewhere.
    let res = client
        .post(format!(
            "/api/v1/servers/{server_id}/channels/{secret}/messages"
        ))
        .header(ContentType::JSON)
        .header(bearer(&member))
        .body(r#"{"content": "can I speak?"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    crate::common::send_message(&client, &member, &server_id, &general, "hello general");

    // "trusted" has no base permissions but an allow override on secret.
    let trusted = create_role(&client, &owner, &server_id, "trusted", 0);
    let res = client
        .put(format!(
            "/api/v1/servers/{server_id}/channels/{secret}/permissions/{trusted}"
        ))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(format!(r#"{{"allow": {SEND_MESSAGES}, "deny": 0}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    assign_roles(&client, &owner, &server_id, &member_id, &[&trusted]);

    let res = client
        .post(format!(
            "/api/v1/servers/{server_id}/channels/{secret}/messages"
        ))
        .header(ContentType::JSON)
        .header(bearer(&member))
        .body(r#"{"content": "allowed now"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn override_masks_must_be_disjoint_and_channel_scoped() {
    let client = test_client();
    let (owner, _, _) = register(&client, "boss");
    let server_id = create_server(&client, &owner, "Alpha");
    let general = general_channel(&client, &owner, &server_id);

    let res = client
        .put(format!(
            "/api/v1/servers/{server_id}/channels/{general}/permissions/everyone"
        ))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(format!(
            r#"{{"allow": {SEND_MESSAGES}, "deny": {SEND_MESSAGES}}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    // MANAGE_ROLES (1 << 4) is a server-management bit.
    let res = client
        .put(format!(
            "/api/v1/servers/{server_id}/channels/{general}/permissions/everyone"
        ))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(format!(r#"{{"allow": {}, "deny": 0}}"#, 1u32 << 4))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn banned_users_cannot_rejoin_until_unbanned() {
    let client = test_client();
    let (owner, _, _) = register(&client, "boss");
    let (member, _, member_id) = register(&client, "trouble");
    let server_id = create_server(&client, &owner, "Alpha");
    let code = invite_and_join(&client, &owner, &member, &server_id);

    let res = client
        .post(format!(
            "/api/v1/servers/{server_id}/members/{member_id}/ban"
        ))
        .header(ContentType::JSON)
        .header(bearer(&owner))
        .body(r#"{"reason": "spam"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    // Membership is gone and the invite no longer admits them.
    let res = client
        .post("/api/v1/servers/join")
        .header(ContentType::JSON)
        .header(bearer(&member))
        .body(format!(r#"{{"invite_code": "{code}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
    assert_eq!(error_code(res), "banned");

    let res = client
        .delete(format!("/api/v1/servers/{server_id}/bans/{member_id}"))
        .header(bearer(&owner))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post("/api/v1/servers/join")
        .header(ContentType::JSON)
        .header(bearer(&member))
        .body(format!(r#"{{"invite_code": "{code}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}
