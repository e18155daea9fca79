use chrono::SecondsFormat;
use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handle over the SQLite store. One connection behind a mutex; every
/// route takes the lock for the duration of its statements, multi-row
/// mutations open a transaction on the guard.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

/// UTC now at millisecond precision, RFC 3339.
pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Db {
    pub fn new(path: &str) -> Self {
        let conn = Connection::open(path).expect("Failed to open database");
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )
        .expect("Failed to set pragmas");
        let db = Db {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate();
        db
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE COLLATE NOCASE,
                display_name TEXT NOT NULL,
                avatar_url TEXT,
                password_hash TEXT NOT NULL,
                email TEXT,
                preferred_language TEXT NOT NULL DEFAULT 'en',
                status TEXT NOT NULL DEFAULT 'offline',
                custom_status TEXT,
                is_platform_admin INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

            CREATE TABLE IF NOT EXISTS password_resets (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                expires_at TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS livekit_instances (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                api_key_enc TEXT NOT NULL,
                api_secret_enc TEXT NOT NULL,
                is_platform_managed INTEGER NOT NULL DEFAULT 0,
                max_servers INTEGER NOT NULL DEFAULT 100,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                icon_url TEXT,
                owner_id TEXT NOT NULL REFERENCES users(id),
                invite_required INTEGER NOT NULL DEFAULT 0,
                instance_id TEXT REFERENCES livekit_instances(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_servers_instance ON servers(instance_id);

            CREATE TABLE IF NOT EXISTS server_members (
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                joined_at TEXT NOT NULL,
                PRIMARY KEY (server_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_members_user ON server_members(user_id);

            CREATE TABLE IF NOT EXISTS user_server_order (
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                position INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, server_id)
            );

            CREATE TABLE IF NOT EXISTS roles (
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                color TEXT,
                position INTEGER NOT NULL DEFAULT 0,
                permissions INTEGER NOT NULL DEFAULT 0,
                is_default INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (server_id, id)
            );

            CREATE TABLE IF NOT EXISTS user_roles (
                server_id TEXT NOT NULL,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                role_id TEXT NOT NULL,
                PRIMARY KEY (server_id, user_id, role_id),
                FOREIGN KEY (server_id, role_id) REFERENCES roles(server_id, id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_user_roles_member ON user_roles(server_id, user_id);

            CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                position INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_categories_server ON categories(server_id);

            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                category_id TEXT REFERENCES categories(id) ON DELETE SET NULL,
                name TEXT NOT NULL,
                channel_type TEXT NOT NULL DEFAULT 'text',
                topic TEXT,
                position INTEGER NOT NULL DEFAULT 0,
                user_limit INTEGER NOT NULL DEFAULT 0,
                bitrate INTEGER NOT NULL DEFAULT 64000,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_channels_server ON channels(server_id);

            CREATE TABLE IF NOT EXISTS channel_overrides (
                channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                role_id TEXT NOT NULL,
                allow INTEGER NOT NULL DEFAULT 0,
                deny INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (channel_id, role_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                author_id TEXT NOT NULL,
                content TEXT,
                created_at TEXT NOT NULL,
                edited_at TEXT,
                reply_to_id TEXT,
                is_pinned INTEGER NOT NULL DEFAULT 0,
                seq INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_channel_seq ON messages(channel_id, seq);
            CREATE INDEX IF NOT EXISTS idx_messages_author ON messages(author_id);

            CREATE TABLE IF NOT EXISTS attachments (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                url TEXT NOT NULL,
                size INTEGER NOT NULL,
                mime TEXT NOT NULL DEFAULT 'application/octet-stream'
            );
            CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);

            CREATE TABLE IF NOT EXISTS reactions (
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                emoji TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id, emoji)
            );

            CREATE TABLE IF NOT EXISTS pins (
                message_id TEXT PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                pinned_by TEXT NOT NULL,
                pinned_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pins_channel ON pins(channel_id);

            CREATE TABLE IF NOT EXISTS read_states (
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                last_read_message_id TEXT NOT NULL,
                last_read_at TEXT NOT NULL,
                PRIMARY KEY (user_id, channel_id)
            );

            CREATE TABLE IF NOT EXISTS bans (
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                reason TEXT,
                banned_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (server_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS invites (
                code TEXT PRIMARY KEY,
                server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                created_by TEXT NOT NULL,
                max_uses INTEGER NOT NULL DEFAULT 0,
                uses INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_invites_server ON invites(server_id);

            CREATE TABLE IF NOT EXISTS friendships (
                user_low TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                user_high TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                initiator TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_low, user_high)
            );

            CREATE TABLE IF NOT EXISTS dm_channels (
                id TEXT PRIMARY KEY,
                user_low TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                user_high TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                last_message_at TEXT,
                UNIQUE (user_low, user_high)
            );

            CREATE TABLE IF NOT EXISTS dm_messages (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL REFERENCES dm_channels(id) ON DELETE CASCADE,
                author_id TEXT NOT NULL,
                content TEXT,
                created_at TEXT NOT NULL,
                edited_at TEXT,
                reply_to_id TEXT,
                is_pinned INTEGER NOT NULL DEFAULT 0,
                seq INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dm_messages_channel_seq ON dm_messages(channel_id, seq);

            CREATE TABLE IF NOT EXISTS dm_attachments (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL REFERENCES dm_messages(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                url TEXT NOT NULL,
                size INTEGER NOT NULL,
                mime TEXT NOT NULL DEFAULT 'application/octet-stream'
            );
            CREATE INDEX IF NOT EXISTS idx_dm_attachments_message ON dm_attachments(message_id);

            CREATE TABLE IF NOT EXISTS dm_reactions (
                message_id TEXT NOT NULL REFERENCES dm_messages(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                emoji TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id, emoji)
            );

            CREATE TABLE IF NOT EXISTS dm_pins (
                message_id TEXT PRIMARY KEY REFERENCES dm_messages(id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL REFERENCES dm_channels(id) ON DELETE CASCADE,
                pinned_by TEXT NOT NULL,
                pinned_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dm_read_states (
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL REFERENCES dm_channels(id) ON DELETE CASCADE,
                last_read_message_id TEXT NOT NULL,
                last_read_at TEXT NOT NULL,
                PRIMARY KEY (user_id, channel_id)
            );

            CREATE TABLE IF NOT EXISTS metrics_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL REFERENCES livekit_instances(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                available INTEGER NOT NULL DEFAULT 1,
                participants INTEGER NOT NULL DEFAULT 0,
                rooms INTEGER NOT NULL DEFAULT 0,
                memory_bytes INTEGER NOT NULL DEFAULT 0,
                cpu_load REAL NOT NULL DEFAULT 0,
                bytes_in_rate REAL NOT NULL DEFAULT 0,
                bytes_out_rate REAL NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_instance_time
                ON metrics_snapshots(instance_id, created_at);",
        )
        .expect("Failed to run migrations");

        // FTS5 indexes over message content, kept in sync by the upsert and
        // delete helpers below.
        conn.execute_batch(
            "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
                message_id UNINDEXED,
                content,
                tokenize='porter unicode61'
            );
            CREATE VIRTUAL TABLE IF NOT EXISTS dm_messages_fts USING fts5(
                message_id UNINDEXED,
                content,
                tokenize='porter unicode61'
            );",
        )
        .expect("Failed to create FTS5 tables");
    }
}

/// Insert or replace a server message in the FTS index (call after create/edit).
pub fn upsert_fts(conn: &Connection, message_id: &str) {
    conn.execute("DELETE FROM messages_fts WHERE message_id = ?1", [message_id])
        .ok();
    conn.execute(
        "INSERT INTO messages_fts (message_id, content)
         SELECT id, content FROM messages WHERE id = ?1 AND content IS NOT NULL",
        [message_id],
    )
    .ok();
}

/// Remove a server message from the FTS index (call after delete).
pub fn delete_fts(conn: &Connection, message_id: &str) {
    conn.execute("DELETE FROM messages_fts WHERE message_id = ?1", [message_id])
        .ok();
}

pub fn upsert_dm_fts(conn: &Connection, message_id: &str) {
    conn.execute(
        "DELETE FROM dm_messages_fts WHERE message_id = ?1",
        [message_id],
    )
    .ok();
    conn.execute(
        "INSERT INTO dm_messages_fts (message_id, content)
         SELECT id, content FROM dm_messages WHERE id = ?1 AND content IS NOT NULL",
        [message_id],
    )
    .ok();
}

pub fn delete_dm_fts(conn: &Connection, message_id: &str) {
    conn.execute(
        "DELETE FROM dm_messages_fts WHERE message_id = ?1",
        [message_id],
    )
    .ok();
}

/// Next monotonic message sequence number, shared across server and DM
/// messages so cursors stay comparable everywhere.
pub fn next_seq(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT COALESCE((SELECT MAX(seq) FROM messages), 0),
                COALESCE((SELECT MAX(seq) FROM dm_messages), 0)",
        [],
        |r| {
            let a: i64 = r.get(0)?;
            let b: i64 = r.get(1)?;
            Ok(a.max(b) + 1)
        },
    )
    .unwrap_or(1)
}

/// Escape a user query for FTS5 MATCH: strip operator characters, quote each
/// term. Porter stemming still applies inside the quotes.
pub fn fts_escape(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| {
            let clean: String = word
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || *c == '\'')
                .collect();
            let escaped = clean.replace('"', "\"\"");
            format!("\"{escaped}\"")
        })
        .filter(|s| s != "\"\"")
        .collect::<Vec<_>>()
        .join(" ")
}
