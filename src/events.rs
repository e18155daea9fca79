use crate::models::*;
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// Fan-out target for a push event. The hub resolves a scope against its
/// session registry; payload identity fields remain authoritative for
/// clients regardless of scope.
#[derive(Debug, Clone)]
pub enum Scope {
    All,
    AllExcept(String),
    Server(String),
    User(String),
    /// Explicit recipient list, for events that outlive the membership the
    /// server scope is derived from (server deletion).
    Users(Vec<String>),
    Pair(String, String),
}

/// Every event the server pushes over the long-lived channel. Domain routes
/// publish these through the bus after their transaction commits; the hub
/// dispatcher is the only subscriber that reaches clients.
#[derive(Debug, Clone)]
pub enum PushEvent {
    MessageCreate(Message),
    MessageUpdate(Message),
    MessageDelete {
        server_id: String,
        channel_id: String,
        message_id: String,
    },
    ChannelCreate(Channel),
    ChannelUpdate(Channel),
    ChannelDelete {
        server_id: String,
        channel_id: String,
    },
    /// Idempotent snapshot of the whole per-server tree after a reorder.
    ChannelReorder {
        server_id: String,
        categories: Vec<Category>,
        channels: Vec<Channel>,
    },
    CategoryCreate(Category),
    CategoryUpdate(Category),
    CategoryDelete {
        server_id: String,
        category_id: String,
    },
    RoleCreate(Role),
    RoleUpdate(Role),
    RoleDelete {
        server_id: String,
        role_id: String,
    },
    RoleReorder {
        server_id: String,
        roles: Vec<Role>,
    },
    MemberJoin {
        server_id: String,
        member: Member,
    },
    MemberLeave {
        server_id: String,
        user_id: String,
    },
    MemberUpdate {
        server_id: String,
        user_id: String,
        role_ids: Vec<String>,
    },
    ServerUpdate(Server),
    ServerDelete {
        server_id: String,
        member_ids: Vec<String>,
    },
    /// Direct notice to a user removed from a server (kick, ban, leave on
    /// another device) — their sessions no longer carry the server scope.
    ServerRemoved {
        user_id: String,
        server_id: String,
    },
    MessagePin {
        server_id: String,
        channel_id: String,
        message_id: String,
        pinned_by: String,
    },
    MessageUnpin {
        server_id: String,
        channel_id: String,
        message_id: String,
    },
    ReactionUpdate {
        server_id: String,
        channel_id: String,
        message_id: String,
        reactions: Vec<ReactionSummary>,
    },
    ChannelPermissionUpdate {
        server_id: String,
        override_row: ChannelOverride,
    },
    ChannelPermissionDelete {
        server_id: String,
        channel_id: String,
        role_id: String,
    },
    TypingStart {
        server_id: String,
        channel_id: String,
        user_id: String,
        username: String,
    },
    PresenceUpdate {
        user_id: String,
        status: String,
    },
    VoiceStateUpdate {
        action: String,
        state: VoiceState,
    },
    DmChannelCreate {
        user_low: String,
        user_high: String,
        payload: Value,
    },
    DmMessageCreate {
        user_low: String,
        user_high: String,
        message: DmMessage,
    },
    DmMessageUpdate {
        user_low: String,
        user_high: String,
        message: DmMessage,
    },
    DmMessageDelete {
        user_low: String,
        user_high: String,
        channel_id: String,
        message_id: String,
    },
    DmReactionUpdate {
        user_low: String,
        user_high: String,
        channel_id: String,
        message_id: String,
        reactions: Vec<ReactionSummary>,
    },
    DmMessagePin {
        user_low: String,
        user_high: String,
        channel_id: String,
        message_id: String,
        pinned: bool,
    },
    FriendRequest {
        user_low: String,
        user_high: String,
        payload: Value,
    },
    FriendUpdate {
        user_low: String,
        user_high: String,
        payload: Value,
    },
    P2pCallUpdate {
        op: &'static str,
        call: CallInfo,
    },
    P2pSignal {
        to_user: String,
        from_user: String,
        call_id: String,
        data: Value,
    },
}

impl PushEvent {
    pub fn scope(&self) -> Scope {
        use PushEvent::*;
        match self {
            MessageCreate(m) | MessageUpdate(m) => Scope::Server(m.server_id.clone()),
            MessageDelete { server_id, .. }
            | ChannelDelete { server_id, .. }
            | ChannelReorder { server_id, .. }
            | CategoryDelete { server_id, .. }
            | RoleDelete { server_id, .. }
            | RoleReorder { server_id, .. }
            | MemberJoin { server_id, .. }
            | MemberLeave { server_id, .. }
            | MemberUpdate { server_id, .. }
            | MessagePin { server_id, .. }
            | MessageUnpin { server_id, .. }
            | ReactionUpdate { server_id, .. }
            | ChannelPermissionUpdate { server_id, .. }
            | ChannelPermissionDelete { server_id, .. }
            | TypingStart { server_id, .. } => Scope::Server(server_id.clone()),
            ChannelCreate(c) | ChannelUpdate(c) => Scope::Server(c.server_id.clone()),
            CategoryCreate(c) | CategoryUpdate(c) => Scope::Server(c.server_id.clone()),
            RoleCreate(r) | RoleUpdate(r) => Scope::Server(r.server_id.clone()),
            ServerUpdate(s) => Scope::Server(s.id.clone()),
            ServerDelete { member_ids, .. } => Scope::Users(member_ids.clone()),
            ServerRemoved { user_id, .. } => Scope::User(user_id.clone()),
            PresenceUpdate { .. } => Scope::All,
            VoiceStateUpdate { state, .. } => Scope::Server(state.server_id.clone()),
            DmChannelCreate {
                user_low,
                user_high,
                ..
            }
            | DmMessageCreate {
                user_low,
                user_high,
                ..
            }
            | DmMessageUpdate {
                user_low,
                user_high,
                ..
            }
            | DmMessageDelete {
                user_low,
                user_high,
                ..
            }
            | DmReactionUpdate {
                user_low,
                user_high,
                ..
            }
            | DmMessagePin {
                user_low,
                user_high,
                ..
            }
            | FriendRequest {
                user_low,
                user_high,
                ..
            }
            | FriendUpdate {
                user_low,
                user_high,
                ..
            } => Scope::Pair(user_low.clone(), user_high.clone()),
            P2pCallUpdate { call, .. } => {
                Scope::Pair(call.caller_id.clone(), call.receiver_id.clone())
            }
            P2pSignal { to_user, .. } => Scope::User(to_user.clone()),
        }
    }

    /// Wire form: op name plus the `d` payload.
    pub fn to_frame(&self) -> (&'static str, Value) {
        use PushEvent::*;
        match self {
            MessageCreate(m) => ("message_create", json!(m)),
            MessageUpdate(m) => ("message_update", json!(m)),
            MessageDelete {
                server_id,
                channel_id,
                message_id,
            } => (
                "message_delete",
                json!({"server_id": server_id, "channel_id": channel_id, "id": message_id}),
            ),
            ChannelCreate(c) => ("channel_create", json!(c)),
            ChannelUpdate(c) => ("channel_update", json!(c)),
            ChannelDelete {
                server_id,
                channel_id,
            } => (
                "channel_delete",
                json!({"server_id": server_id, "id": channel_id}),
            ),
            ChannelReorder {
                server_id,
                categories,
                channels,
            } => (
                "channel_reorder",
                json!({"server_id": server_id, "categories": categories, "channels": channels}),
            ),
            CategoryCreate(c) => ("category_create", json!(c)),
            CategoryUpdate(c) => ("category_update", json!(c)),
            CategoryDelete {
                server_id,
                category_id,
            } => (
                "category_delete",
                json!({"server_id": server_id, "id": category_id}),
            ),
            RoleCreate(r) => ("role_create", json!(r)),
            RoleUpdate(r) => ("role_update", json!(r)),
            RoleDelete { server_id, role_id } => (
                "role_delete",
                json!({"server_id": server_id, "id": role_id}),
            ),
            RoleReorder { server_id, roles } => (
                "role_reorder",
                json!({"server_id": server_id, "roles": roles}),
            ),
            MemberJoin { server_id, member } => (
                "member_join",
                json!({"server_id": server_id, "member": member}),
            ),
            MemberLeave { server_id, user_id } => (
                "member_leave",
                json!({"server_id": server_id, "user_id": user_id}),
            ),
            MemberUpdate {
                server_id,
                user_id,
                role_ids,
            } => (
                "member_update",
                json!({"server_id": server_id, "user_id": user_id, "role_ids": role_ids}),
            ),
            ServerUpdate(s) => ("server_update", json!(s)),
            ServerDelete { server_id, .. } => ("server_delete", json!({"id": server_id})),
            ServerRemoved { server_id, .. } => ("server_leave", json!({"server_id": server_id})),
            MessagePin {
                server_id,
                channel_id,
                message_id,
                pinned_by,
            } => (
                "message_pin",
                json!({
                    "server_id": server_id,
                    "channel_id": channel_id,
                    "message_id": message_id,
                    "pinned_by": pinned_by
                }),
            ),
            MessageUnpin {
                server_id,
                channel_id,
                message_id,
            } => (
                "message_unpin",
                json!({"server_id": server_id, "channel_id": channel_id, "message_id": message_id}),
            ),
            ReactionUpdate {
                server_id,
                channel_id,
                message_id,
                reactions,
            } => (
                "reaction_update",
                json!({
                    "server_id": server_id,
                    "channel_id": channel_id,
                    "message_id": message_id,
                    "reactions": reactions
                }),
            ),
            ChannelPermissionUpdate {
                server_id,
                override_row,
            } => (
                "channel_permission_update",
                json!({"server_id": server_id, "override": override_row}),
            ),
            ChannelPermissionDelete {
                server_id,
                channel_id,
                role_id,
            } => (
                "channel_permission_delete",
                json!({"server_id": server_id, "channel_id": channel_id, "role_id": role_id}),
            ),
            TypingStart {
                server_id,
                channel_id,
                user_id,
                username,
            } => (
                "typing_start",
                json!({
                    "server_id": server_id,
                    "channel_id": channel_id,
                    "user_id": user_id,
                    "username": username
                }),
            ),
            PresenceUpdate { user_id, status } => (
                "presence_update",
                json!({"user_id": user_id, "status": status}),
            ),
            VoiceStateUpdate { action, state } => (
                "voice_state_update",
                json!({"action": action, "state": state}),
            ),
            DmChannelCreate { payload, .. } => ("dm_channel_create", payload.clone()),
            DmMessageCreate { message, .. } => ("dm_message_create", json!(message)),
            DmMessageUpdate { message, .. } => ("dm_message_update", json!(message)),
            DmMessageDelete {
                channel_id,
                message_id,
                ..
            } => (
                "dm_message_delete",
                json!({"channel_id": channel_id, "id": message_id}),
            ),
            DmReactionUpdate {
                channel_id,
                message_id,
                reactions,
                ..
            } => (
                "dm_reaction_update",
                json!({"channel_id": channel_id, "message_id": message_id, "reactions": reactions}),
            ),
            DmMessagePin {
                channel_id,
                message_id,
                pinned,
                ..
            } => (
                "dm_message_pin",
                json!({"channel_id": channel_id, "message_id": message_id, "pinned": pinned}),
            ),
            FriendRequest { payload, .. } => ("friend_request", payload.clone()),
            FriendUpdate { payload, .. } => ("friend_update", payload.clone()),
            P2pCallUpdate { op, call } => (*op, json!(call)),
            P2pSignal {
                from_user,
                call_id,
                data,
                ..
            } => (
                "p2p_signal",
                json!({"call_id": call_id, "from_user_id": from_user, "data": data}),
            ),
        }
    }
}

/// Narrow publisher interface. Domain routes publish after their store
/// transaction commits; subscribers (the hub dispatcher) never observe
/// state that is not yet durable.
pub struct EventBus {
    pub sender: broadcast::Sender<PushEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(4096);
        EventBus { sender }
    }

    pub fn publish(&self, event: PushEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }
}

/// Order a user pair deterministically (DM channels, friendships).
pub fn order_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}
