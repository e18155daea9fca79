use rocket::serde::json::Json;
use rocket::{catch, get};

#[get("/api/v1/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "concord",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[catch(401)]
pub fn unauthorized() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": false,
        "error": {"code": "unauthenticated", "message": "Missing or invalid access token"}
    }))
}

#[catch(403)]
pub fn forbidden_catcher() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": false,
        "error": {"code": "forbidden", "message": "Insufficient permissions"}
    }))
}

#[catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": false,
        "error": {"code": "not_found", "message": "Resource not found"}
    }))
}

#[catch(429)]
pub fn too_many_requests() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": false,
        "error": {"code": "rate_limited", "message": "Rate limited"}
    }))
}

#[catch(500)]
pub fn internal_error() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": false,
        "error": {"code": "internal", "message": "Internal error"}
    }))
}
