use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Success envelope: `{"success": true, "data": ...}`. Errors are built by
/// `routes::fail` with a stable error code.
#[derive(Debug, Serialize)]
pub struct ApiOk<T: Serialize> {
    pub success: bool,
    pub data: T,
}

pub fn ok<T: Serialize>(data: T) -> rocket::serde::json::Json<ApiOk<T>> {
    rocket::serde::json::Json(ApiOk {
        success: true,
        data,
    })
}

// --- Users ---

/// Public view of a user, embedded in member lists and message payloads.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_status: Option<String>,
}

impl UserProfile {
    /// Maps `SELECT id, username, display_name, avatar_url, status, custom_status`.
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(UserProfile {
            id: row.get(0)?,
            username: row.get(1)?,
            display_name: row.get(2)?,
            avatar_url: row.get(3)?,
            status: row.get(4)?,
            custom_status: row.get(5)?,
        })
    }
}

/// The caller's own account, returned from /users/me and registration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PrivateUser {
    pub id: String,
    pub username: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub preferred_language: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_status: Option<String>,
    pub is_platform_admin: bool,
    pub created_at: String,
}

impl PrivateUser {
    /// Maps `SELECT id, username, display_name, avatar_url, email,
    /// preferred_language, status, custom_status, is_platform_admin, created_at`.
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(PrivateUser {
            id: row.get(0)?,
            username: row.get(1)?,
            display_name: row.get(2)?,
            avatar_url: row.get(3)?,
            email: row.get(4)?,
            preferred_language: row.get(5)?,
            status: row.get(6)?,
            custom_status: row.get(7)?,
            is_platform_admin: row.get::<_, i64>(8)? != 0,
            created_at: row.get(9)?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub preferred_language: Option<String>,
    /// Optional invite code: registration + server join in one step.
    #[serde(default)]
    pub invite_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub user: PrivateUser,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMeRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub custom_status: Option<String>,
    #[serde(default)]
    pub preferred_language: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

// --- Servers ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Server {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    pub owner_id: String,
    pub invite_required: bool,
    /// Instance id only; credentials never serialize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub created_at: String,
}

impl Server {
    /// Maps `SELECT id, name, icon_url, owner_id, invite_required, instance_id, created_at`.
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Server {
            id: row.get(0)?,
            name: row.get(1)?,
            icon_url: row.get(2)?,
            owner_id: row.get(3)?,
            invite_required: row.get::<_, i64>(4)? != 0,
            instance_id: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    #[serde(default)]
    pub invite_required: bool,
    /// Self-hosted SFU credentials; absent means platform-managed assignment.
    #[serde(default)]
    pub livekit_url: Option<String>,
    #[serde(default)]
    pub livekit_api_key: Option<String>,
    #[serde(default)]
    pub livekit_api_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateServerRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub invite_required: Option<bool>,
    #[serde(default)]
    pub livekit_url: Option<String>,
    #[serde(default)]
    pub livekit_api_key: Option<String>,
    #[serde(default)]
    pub livekit_api_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReorderServersRequest {
    /// Server ids in the user's preferred order.
    pub server_ids: Vec<String>,
}

// --- Roles ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Role {
    pub id: String,
    pub server_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub position: i64,
    pub permissions: u32,
    pub is_default: bool,
}

impl Role {
    /// Maps `SELECT id, server_id, name, color, position, permissions, is_default`.
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Role {
            id: row.get(0)?,
            server_id: row.get(1)?,
            name: row.get(2)?,
            color: row.get(3)?,
            position: row.get(4)?,
            permissions: row.get(5)?,
            is_default: row.get::<_, i64>(6)? != 0,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub permissions: u32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub permissions: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ReorderItem {
    pub id: String,
    pub position: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub items: Vec<ReorderItem>,
}

// --- Members ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Member {
    pub user: UserProfile,
    pub joined_at: String,
    pub role_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    /// Full replacement set; the diff is computed server-side.
    pub role_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BanRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Ban {
    pub server_id: String,
    pub user: UserProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub banned_by: String,
    pub created_at: String,
}

// --- Categories & channels ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Category {
    pub id: String,
    pub server_id: String,
    pub name: String,
    pub position: i64,
}

impl Category {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Category {
            id: row.get(0)?,
            server_id: row.get(1)?,
            name: row.get(2)?,
            position: row.get(3)?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateCategoryRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCategoryRequest {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Channel {
    pub id: String,
    pub server_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    pub name: String,
    pub channel_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub position: i64,
    pub user_limit: i64,
    pub bitrate: i64,
    pub created_at: String,
}

impl Channel {
    /// Maps `SELECT id, server_id, category_id, name, channel_type, topic,
    /// position, user_limit, bitrate, created_at`.
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Channel {
            id: row.get(0)?,
            server_id: row.get(1)?,
            category_id: row.get(2)?,
            name: row.get(3)?,
            channel_type: row.get(4)?,
            topic: row.get(5)?,
            position: row.get(6)?,
            user_limit: row.get(7)?,
            bitrate: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

pub const CHANNEL_COLUMNS: &str =
    "id, server_id, category_id, name, channel_type, topic, position, user_limit, bitrate, created_at";

#[derive(Debug, Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
    #[serde(default = "default_channel_type")]
    pub channel_type: String,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub user_limit: Option<i64>,
    #[serde(default)]
    pub bitrate: Option<i64>,
}

fn default_channel_type() -> String {
    "text".to_string()
}

#[derive(Debug, Deserialize)]
pub struct UpdateChannelRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub category_id: Option<Option<String>>,
    #[serde(default)]
    pub user_limit: Option<i64>,
    #[serde(default)]
    pub bitrate: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub allow: u32,
    pub deny: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChannelOverride {
    pub channel_id: String,
    pub role_id: String,
    pub allow: u32,
    pub deny: u32,
}

// --- Messages ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub url: String,
    pub size: i64,
    pub mime: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: i64,
    pub user_ids: Vec<String>,
}

/// Reply preview, computed at read time from the referenced row.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReplyPreview {
    pub id: String,
    pub author_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Message {
    pub id: String,
    pub server_id: String,
    pub channel_id: String,
    pub author: UserProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
    pub is_pinned: bool,
    pub seq: i64,
    pub attachments: Vec<Attachment>,
    pub reactions: Vec<ReactionSummary>,
    pub mentions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct AttachmentUpload {
    pub filename: String,
    #[serde(default = "default_mime")]
    pub mime: String,
    /// base64-encoded bytes
    pub data: String,
}

fn default_mime() -> String {
    "application/octet-stream".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentUpload>,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
pub struct ToggleReactionRequest {
    pub emoji: String,
}

// --- Read state ---

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub message_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UnreadChannel {
    pub channel_id: String,
    pub unread_count: i64,
}

// --- Invites ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Invite {
    pub code: String,
    pub server_id: String,
    pub created_by: String,
    pub max_uses: i64,
    pub uses: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    pub created_at: String,
}

impl Invite {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Invite {
            code: row.get(0)?,
            server_id: row.get(1)?,
            created_by: row.get(2)?,
            max_uses: row.get(3)?,
            uses: row.get(4)?,
            expires_at: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateInviteRequest {
    #[serde(default)]
    pub max_uses: i64,
    /// Lifetime in seconds; 0 or absent means no expiry.
    #[serde(default)]
    pub expires_in_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct InvitePreview {
    pub server_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    pub member_count: i64,
}

#[derive(Debug, Deserialize)]
pub struct JoinServerRequest {
    pub invite_code: String,
}

// --- Friendship & DMs ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FriendEntry {
    pub user: UserProfile,
    pub status: String,
    /// True when the caller sent the request.
    pub outgoing: bool,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct FriendRequestBody {
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DmChannel {
    pub id: String,
    pub other_user: UserProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<String>,
    pub unread_count: i64,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenDmRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DmMessage {
    pub id: String,
    pub channel_id: String,
    pub author: UserProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
    pub is_pinned: bool,
    pub seq: i64,
    pub attachments: Vec<Attachment>,
    pub reactions: Vec<ReactionSummary>,
}

// --- Search ---

#[derive(Debug, Serialize)]
pub struct SearchResponse<T: Serialize> {
    pub results: Vec<T>,
    pub total_count: i64,
    pub query: String,
}

// --- Voice ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VoiceState {
    pub user_id: String,
    pub channel_id: String,
    pub server_id: String,
    pub mute: bool,
    pub deafen: bool,
    pub streaming: bool,
    pub server_mute: bool,
    pub server_deafen: bool,
    pub username: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VoiceTokenRequest {
    pub channel_id: String,
}

#[derive(Debug, Serialize)]
pub struct VoiceTokenResponse {
    pub token: String,
    pub url: String,
    pub channel_id: String,
}

// --- P2P calls ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CallInfo {
    pub id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub call_type: String,
    pub status: String,
    pub created_at: String,
}

// --- Platform admin ---

/// Client-facing instance view. Credentials exist only encrypted at rest and
/// are decrypted just-in-time for token signing; neither form serializes.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LiveKitInstanceView {
    pub id: String,
    pub url: String,
    pub is_platform_managed: bool,
    pub max_servers: i64,
    pub server_count: i64,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub is_platform_managed: bool,
    #[serde(default = "default_max_servers")]
    pub max_servers: i64,
}

fn default_max_servers() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct UpdateInstanceRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub max_servers: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AssignInstanceRequest {
    pub instance_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MetricsSnapshot {
    pub instance_id: String,
    pub created_at: String,
    pub available: bool,
    pub participants: i64,
    pub rooms: i64,
    pub memory_bytes: i64,
    pub cpu_load: f64,
    pub bytes_in_rate: f64,
    pub bytes_out_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSummary {
    pub window: String,
    pub peak_participants: i64,
    pub avg_participants: f64,
    pub peak_rooms: i64,
    pub avg_cpu_load: f64,
    pub samples: i64,
}

// --- Uploads ---

#[derive(Debug, Deserialize)]
pub struct IconUpload {
    pub filename: String,
    #[serde(default = "default_mime")]
    pub mime: String,
    pub data: String,
}
