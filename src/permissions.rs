use bitflags::bitflags;
use rusqlite::{params, Connection};

bitflags! {
    /// The permission bitfield carried by roles and channel overrides.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        const VIEW_CHANNEL    = 1 << 0;
        const SEND_MESSAGES   = 1 << 1;
        const READ_MESSAGES   = 1 << 2;
        const MANAGE_CHANNELS = 1 << 3;
        const MANAGE_ROLES    = 1 << 4;
        const KICK_MEMBERS    = 1 << 5;
        const BAN_MEMBERS     = 1 << 6;
        const MANAGE_MESSAGES = 1 << 7;
        const MANAGE_INVITES  = 1 << 8;
        const MANAGE_SERVER   = 1 << 9;
        const CONNECT_VOICE   = 1 << 10;
        const SPEAK           = 1 << 11;
        const STREAM          = 1 << 12;
        const ADMIN           = 1 << 13;
    }
}

impl Permissions {
    /// Bits representable in a channel override. Server-management bits are
    /// rejected at the override boundary.
    pub fn channel_scoped() -> Permissions {
        Permissions::VIEW_CHANNEL
            | Permissions::SEND_MESSAGES
            | Permissions::READ_MESSAGES
            | Permissions::MANAGE_MESSAGES
            | Permissions::CONNECT_VOICE
            | Permissions::SPEAK
            | Permissions::STREAM
    }

    /// Seed mask for the per-server `everyone` role.
    pub fn everyone_default() -> Permissions {
        Permissions::VIEW_CHANNEL
            | Permissions::SEND_MESSAGES
            | Permissions::READ_MESSAGES
            | Permissions::CONNECT_VOICE
            | Permissions::SPEAK
    }
}

/// Reserved role ids. `owner` outranks every positional role and is not
/// editable; `everyone` sits at position 0 and is implicit for all members.
pub const ROLE_OWNER: &str = "owner";
pub const ROLE_EVERYONE: &str = "everyone";

/// A member's rank for hierarchy comparisons. Owner beats any position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Rank {
    Position(i64),
    Owner,
}

/// One override row as loaded from the store.
pub struct OverrideMasks {
    pub role_id: String,
    pub allow: Permissions,
    pub deny: Permissions,
}

/// Pure evaluation: base OR of role masks, ADMIN/owner short-circuit to ALL,
/// then union-of-allows applied over union-of-denies from the overrides of
/// every held role.
pub fn evaluate(
    role_ids: &[String],
    role_masks: &[(String, Permissions)],
    overrides: &[OverrideMasks],
) -> Permissions {
    if role_ids.iter().any(|r| r == ROLE_OWNER) {
        return Permissions::all();
    }

    let mut base = Permissions::empty();
    for (id, mask) in role_masks {
        if role_ids.contains(id) {
            base |= *mask;
        }
    }
    if base.contains(Permissions::ADMIN) {
        return Permissions::all();
    }

    let mut allow_total = Permissions::empty();
    let mut deny_total = Permissions::empty();
    for ov in overrides {
        if role_ids.contains(&ov.role_id) {
            allow_total |= ov.allow;
            deny_total |= ov.deny;
        }
    }

    (base & !deny_total) | allow_total
}

/// Role ids a member holds, including the implicit default role.
pub fn member_role_ids(conn: &Connection, server_id: &str, user_id: &str) -> Vec<String> {
    let mut ids: Vec<String> = conn
        .prepare("SELECT role_id FROM user_roles WHERE server_id = ?1 AND user_id = ?2")
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map(params![server_id, user_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .unwrap_or_default();
    if !ids.iter().any(|r| r == ROLE_EVERYONE) {
        ids.push(ROLE_EVERYONE.to_string());
    }
    ids
}

/// Effective permissions for a member, optionally resolved against a
/// channel's overrides.
pub fn effective(
    conn: &Connection,
    server_id: &str,
    user_id: &str,
    channel_id: Option<&str>,
) -> Permissions {
    let role_ids = member_role_ids(conn, server_id, user_id);

    let role_masks: Vec<(String, Permissions)> = conn
        .prepare("SELECT id, permissions FROM roles WHERE server_id = ?1")
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map(params![server_id], |row| {
                    let id: String = row.get(0)?;
                    let bits: u32 = row.get(1)?;
                    Ok((id, Permissions::from_bits_truncate(bits)))
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        })
        .unwrap_or_default();

    let overrides: Vec<OverrideMasks> = match channel_id {
        Some(cid) => conn
            .prepare("SELECT role_id, allow, deny FROM channel_overrides WHERE channel_id = ?1")
            .and_then(|mut stmt| {
                let rows = stmt
                    .query_map(params![cid], |row| {
                        let role_id: String = row.get(0)?;
                        let allow: u32 = row.get(1)?;
                        let deny: u32 = row.get(2)?;
                        Ok(OverrideMasks {
                            role_id,
                            allow: Permissions::from_bits_truncate(allow),
                            deny: Permissions::from_bits_truncate(deny),
                        })
                    })?
                    .filter_map(|r| r.ok())
                    .collect();
                Ok(rows)
            })
            .unwrap_or_default(),
        None => Vec::new(),
    };

    evaluate(&role_ids, &role_masks, &overrides)
}

/// Highest rank a member holds. Owner role is infinity; otherwise the max
/// position over held roles (the implicit default contributes position 0).
pub fn highest_rank(conn: &Connection, server_id: &str, user_id: &str) -> Rank {
    let role_ids = member_role_ids(conn, server_id, user_id);
    if role_ids.iter().any(|r| r == ROLE_OWNER) {
        return Rank::Owner;
    }
    let mut best = 0i64;
    for rid in &role_ids {
        let pos: i64 = conn
            .query_row(
                "SELECT position FROM roles WHERE server_id = ?1 AND id = ?2",
                params![server_id, rid],
                |r| r.get(0),
            )
            .unwrap_or(0);
        best = best.max(pos);
    }
    Rank::Position(best)
}

/// True when the actor strictly outranks the target. All hierarchy-gated
/// mutations (role edits, kick, ban, role-change) go through this.
pub fn outranks(conn: &Connection, server_id: &str, actor: &str, target: &str) -> bool {
    highest_rank(conn, server_id, actor) > highest_rank(conn, server_id, target)
}
