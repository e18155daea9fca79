use crate::events::{PushEvent, Scope};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, Notify};

/// Outbound queue depth per session. A client that lets this fill is evicted
/// rather than slowing producers down.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Seconds a repeat `typing` op from the same (channel, user) is absorbed.
const TYPING_DEDUP_SECS: u64 = 3;

/// One live push connection. The hub enqueues frames; only the session's
/// writer task touches the socket, so per-session order is the queue order.
pub struct SessionHandle {
    pub id: String,
    pub user_id: String,
    /// Set at connect time from the stored status; invisible users are
    /// omitted from visible-online sets and emit no presence transitions.
    pub invisible: bool,
    pub server_ids: RwLock<HashSet<String>>,
    tx: mpsc::Sender<String>,
    seq: AtomicU64,
    closing: AtomicBool,
    kill: Notify,
}

impl SessionHandle {
    /// Enqueue a frame. Overflow closes the session; the writer and reader
    /// loops observe the close and exit.
    pub fn send(&self, op: &str, d: &Value) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = json!({"op": op, "d": d, "seq": seq}).to_string();
        if self.tx.try_send(frame).is_err() {
            self.close();
        }
    }

    /// Signal both loops to wind down (eviction, disconnect teardown).
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.kill.notify_waiters();
    }

    /// Resolves once `close` has been called. The flag is re-checked after
    /// the waiter registers, so a close between polls is never missed.
    pub async fn closed(&self) {
        let notified = self.kill.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            notified.as_mut().await;
            notified.set(self.kill.notified());
        }
    }

    pub fn in_server(&self, server_id: &str) -> bool {
        self.server_ids
            .read()
            .map(|s| s.contains(server_id))
            .unwrap_or(false)
    }
}

/// Process-wide registry of client sessions and the fan-out dispatcher.
/// Owns the session maps exclusively; cross-registry effects (voice leave,
/// call teardown on disconnect) are function calls made by the socket route.
pub struct Hub {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    typing: Mutex<HashMap<String, u64>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Hub {
            sessions: RwLock::new(HashMap::new()),
            typing: Mutex::new(HashMap::new()),
        }
    }

    /// Register a session. Returns the handle, the outbound receiver for the
    /// writer task, and whether this is the user's first live session.
    pub fn register(
        &self,
        session_id: &str,
        user_id: &str,
        invisible: bool,
        server_ids: HashSet<String>,
    ) -> (Arc<SessionHandle>, mpsc::Receiver<String>, bool) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let handle = Arc::new(SessionHandle {
            id: session_id.to_string(),
            user_id: user_id.to_string(),
            invisible,
            server_ids: RwLock::new(server_ids),
            tx,
            seq: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            kill: Notify::new(),
        });
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let first = !sessions.values().any(|s| s.user_id == user_id);
        sessions.insert(session_id.to_string(), handle.clone());
        (handle, rx, first)
    }

    /// Remove a session. Returns true when this was the user's last session.
    /// Safe to call twice — the second call is a no-op reporting false.
    pub fn unregister(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        match sessions.remove(session_id) {
            Some(gone) => !sessions.values().any(|s| s.user_id == gone.user_id),
            None => false,
        }
    }

    /// User ids with at least one live, non-invisible session.
    pub fn online_visible_users(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let mut seen = HashSet::new();
        for s in sessions.values() {
            if !s.invisible {
                seen.insert(s.user_id.clone());
            }
        }
        seen.into_iter().collect()
    }

    pub fn user_is_connected(&self, user_id: &str) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.values().any(|s| s.user_id == user_id)
    }

    /// Membership changed: grow or shrink the server scope of every live
    /// session of the user. Kick/ban terminate the scope, not the socket.
    pub fn add_server(&self, user_id: &str, server_id: &str) {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        for s in sessions.values().filter(|s| s.user_id == user_id) {
            if let Ok(mut set) = s.server_ids.write() {
                set.insert(server_id.to_string());
            }
        }
    }

    pub fn remove_server(&self, user_id: &str, server_id: &str) {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        for s in sessions.values().filter(|s| s.user_id == user_id) {
            if let Ok(mut set) = s.server_ids.write() {
                set.remove(server_id);
            }
        }
    }

    /// Drop a server scope from every connected member's sessions (server
    /// delete cascade).
    pub fn remove_server_everywhere(&self, server_id: &str) {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        for s in sessions.values() {
            if let Ok(mut set) = s.server_ids.write() {
                set.remove(server_id);
            }
        }
    }

    /// Returns true when a typing notification should fan out; repeats
    /// within the dedup window are absorbed.
    pub fn typing_should_emit(&self, channel_id: &str, user_id: &str) -> bool {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let key = format!("{channel_id}:{user_id}");
        let mut map = self.typing.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(&key) {
            Some(last) if now.saturating_sub(*last) < TYPING_DEDUP_SECS => false,
            _ => {
                map.insert(key, now);
                true
            }
        }
    }

    /// Resolve an event's scope and enqueue its frame on every matching
    /// session. Enqueue order per session is observation order.
    pub fn dispatch(&self, event: &PushEvent) {
        let (op, d) = event.to_frame();
        self.fan_out(&event.scope(), op, &d);
    }

    /// The fan-out primitives, keyed by scope.
    pub fn fan_out(&self, scope: &Scope, op: &str, d: &Value) {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        match scope {
            Scope::All => {
                for s in sessions.values() {
                    s.send(op, d);
                }
            }
            Scope::AllExcept(user_id) => {
                for s in sessions.values().filter(|s| s.user_id != *user_id) {
                    s.send(op, d);
                }
            }
            Scope::Server(server_id) => {
                for s in sessions.values().filter(|s| s.in_server(server_id)) {
                    s.send(op, d);
                }
            }
            Scope::User(user_id) => {
                for s in sessions.values().filter(|s| s.user_id == *user_id) {
                    s.send(op, d);
                }
            }
            Scope::Users(user_ids) => {
                for s in sessions
                    .values()
                    .filter(|s| user_ids.iter().any(|u| *u == s.user_id))
                {
                    s.send(op, d);
                }
            }
            Scope::Pair(a, b) => {
                for s in sessions
                    .values()
                    .filter(|s| s.user_id == *a || s.user_id == *b)
                {
                    s.send(op, d);
                }
            }
        }
    }
}

/// Bridge the publisher bus into hub fan-out. Runs for the process lifetime.
pub fn spawn_dispatcher(hub: Arc<Hub>, mut receiver: broadcast::Receiver<PushEvent>) {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => hub.dispatch(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("⚠️ Push dispatcher lagged, dropped {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
