use crate::crypto;
use crate::models::VoiceState;
use crate::permissions::Permissions;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// SFU admission token lifetime.
pub const VOICE_TOKEN_TTL_SECS: i64 = 10 * 60;

/// In-memory registry of who is in which voice channel. Wiped on restart;
/// clients rejoin over the push channel. The registry owns these maps
/// exclusively — the hub and routes reach it through method calls only.
pub struct VoiceRegistry {
    by_user: RwLock<HashMap<String, VoiceState>>,
    by_channel: RwLock<HashMap<String, HashSet<String>>>,
}

impl Default for VoiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VoiceRegistry {
    pub fn new() -> Self {
        VoiceRegistry {
            by_user: RwLock::new(HashMap::new()),
            by_channel: RwLock::new(HashMap::new()),
        }
    }

    /// Upsert a user's state. A join while already in another channel moves
    /// them; the returned previous state lets the caller emit a leave first.
    pub fn join(&self, state: VoiceState) -> Option<VoiceState> {
        let mut by_user = self.by_user.write().unwrap_or_else(|e| e.into_inner());
        let mut by_channel = self.by_channel.write().unwrap_or_else(|e| e.into_inner());

        let prior = by_user.insert(state.user_id.clone(), state.clone());
        if let Some(ref p) = prior
            && p.channel_id != state.channel_id
            && let Some(set) = by_channel.get_mut(&p.channel_id)
        {
            set.remove(&state.user_id);
        }
        by_channel
            .entry(state.channel_id.clone())
            .or_default()
            .insert(state.user_id.clone());
        prior.filter(|p| p.channel_id != state.channel_id)
    }

    /// Idempotent removal. Returns the cleared state on the first call only,
    /// so disconnect paths can run twice without duplicate events.
    pub fn leave(&self, user_id: &str) -> Option<VoiceState> {
        let mut by_user = self.by_user.write().unwrap_or_else(|e| e.into_inner());
        let state = by_user.remove(user_id)?;
        let mut by_channel = self.by_channel.write().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = by_channel.get_mut(&state.channel_id) {
            set.remove(user_id);
            if set.is_empty() {
                by_channel.remove(&state.channel_id);
            }
        }
        Some(state)
    }

    /// Partial update of the user-controlled flags.
    pub fn mutate(
        &self,
        user_id: &str,
        mute: Option<bool>,
        deafen: Option<bool>,
        streaming: Option<bool>,
    ) -> Option<VoiceState> {
        let mut by_user = self.by_user.write().unwrap_or_else(|e| e.into_inner());
        let state = by_user.get_mut(user_id)?;
        if let Some(m) = mute {
            state.mute = m;
        }
        if let Some(d) = deafen {
            state.deafen = d;
        }
        if let Some(s) = streaming {
            state.streaming = s;
        }
        Some(state.clone())
    }

    pub fn get(&self, user_id: &str) -> Option<VoiceState> {
        self.by_user
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned()
    }

    pub fn channel_occupancy(&self, channel_id: &str) -> usize {
        self.by_channel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Full snapshot for `voice_states_sync` on connect.
    pub fn snapshot(&self) -> Vec<VoiceState> {
        self.by_user
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// States within one server (voice panel listing).
    pub fn server_states(&self, server_id: &str) -> Vec<VoiceState> {
        self.by_user
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.server_id == server_id)
            .cloned()
            .collect()
    }

    /// Clear every state in a server (delete cascade, channel removal, ban).
    /// Returns the cleared states for leave-event emission.
    pub fn clear_server(&self, server_id: &str) -> Vec<VoiceState> {
        let users: Vec<String> = self
            .by_user
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.server_id == server_id)
            .map(|s| s.user_id.clone())
            .collect();
        users.iter().filter_map(|u| self.leave(u)).collect()
    }

    pub fn clear_channel(&self, channel_id: &str) -> Vec<VoiceState> {
        let users: Vec<String> = self
            .by_channel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        users.iter().filter_map(|u| self.leave(u)).collect()
    }

    /// A user banned from a server loses their state there.
    pub fn clear_user_in_server(&self, user_id: &str, server_id: &str) -> Option<VoiceState> {
        let in_server = self
            .by_user
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .map(|s| s.server_id == server_id)
            .unwrap_or(false);
        if in_server { self.leave(user_id) } else { None }
    }
}

/// Compose and sign the LiveKit room admission token. Publish rights follow
/// the member's effective permissions on the channel; screen share requires
/// STREAM. The API secret arrives decrypted just-in-time from the server's
/// instance row and is dropped with this stack frame.
pub fn issue_room_token(
    api_key: &str,
    api_secret: &str,
    user_id: &str,
    username: &str,
    display_name: &str,
    channel_id: &str,
    perms: Permissions,
) -> String {
    let now = chrono::Utc::now().timestamp();
    let mut sources = vec!["camera", "microphone"];
    if perms.contains(Permissions::STREAM) {
        sources.push("screen_share");
        sources.push("screen_share_audio");
    }
    let claims = json!({
        "iss": api_key,
        "sub": user_id,
        "nbf": now,
        "exp": now + VOICE_TOKEN_TTL_SECS,
        "name": display_name,
        "metadata": json!({"username": username}).to_string(),
        "video": {
            "room": channel_id,
            "roomJoin": true,
            "canPublish": perms.contains(Permissions::SPEAK),
            "canPublishData": true,
            "canPublishSources": sources,
            "canSubscribe": true,
        },
    });
    crypto::sign_jwt(&claims, api_secret)
}
