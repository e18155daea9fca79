use crate::crypto;
use crate::db::now_ts;
use crate::events::PushEvent;
use crate::models::CallInfo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Unanswered calls end after this long.
pub const RING_TIMEOUT_SECS: u64 = 60;

/// Ended calls linger briefly so duplicate end ops stay idempotent.
const ENDED_RETENTION_SECS: u64 = 30;

#[derive(Debug, PartialEq, Eq)]
pub enum CallError {
    /// Caller or receiver already holds a non-ended call.
    Busy,
    NotFound,
    /// The actor is not the party allowed to make this transition.
    Forbidden,
    /// The call is not in a state that permits the transition.
    InvalidState,
}

/// In-memory coordinator for one-to-one calls. Media never passes through
/// here; the coordinator tracks the ringing/active/ended machine and
/// publishes transitions, and the hub relays SDP/ICE blobs between the two
/// parties. State is process-local and does not survive a restart.
pub struct CallCoordinator {
    by_call: Mutex<HashMap<String, CallInfo>>,
    active_by_user: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<PushEvent>,
}

impl CallCoordinator {
    pub fn new(events: broadcast::Sender<PushEvent>) -> Self {
        CallCoordinator {
            by_call: Mutex::new(HashMap::new()),
            active_by_user: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn publish(&self, op: &'static str, call: CallInfo) {
        let _ = self.events.send(PushEvent::P2pCallUpdate { op, call });
    }

    /// `absent → ringing`. Block-edge checks happen at the call site, which
    /// has store access.
    pub fn initiate(
        self: &Arc<Self>,
        caller_id: &str,
        receiver_id: &str,
        call_type: &str,
    ) -> Result<CallInfo, CallError> {
        let call = {
            let mut active = self.active_by_user.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(caller_id) || active.contains_key(receiver_id) {
                return Err(CallError::Busy);
            }
            let call = CallInfo {
                id: crypto::generate_id(),
                caller_id: caller_id.to_string(),
                receiver_id: receiver_id.to_string(),
                call_type: call_type.to_string(),
                status: "ringing".to_string(),
                created_at: now_ts(),
            };
            active.insert(caller_id.to_string(), call.id.clone());
            active.insert(receiver_id.to_string(), call.id.clone());
            self.by_call
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(call.id.clone(), call.clone());
            call
        };

        // Ring timeout: still-ringing calls end on their own.
        let coordinator = Arc::clone(self);
        let call_id = call.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(RING_TIMEOUT_SECS)).await;
            coordinator.timeout_if_ringing(&call_id);
        });

        self.publish("p2p_call_initiate", call.clone());
        Ok(call)
    }

    /// `ringing → active`, receiver only.
    pub fn accept(&self, call_id: &str, user_id: &str) -> Result<CallInfo, CallError> {
        let call = {
            let mut calls = self.by_call.lock().unwrap_or_else(|e| e.into_inner());
            let call = calls.get_mut(call_id).ok_or(CallError::NotFound)?;
            if call.receiver_id != user_id {
                return Err(CallError::Forbidden);
            }
            if call.status != "ringing" {
                return Err(CallError::InvalidState);
            }
            call.status = "active".to_string();
            call.clone()
        };
        self.publish("p2p_call_accept", call.clone());
        Ok(call)
    }

    /// `ringing → ended`, receiver only.
    pub fn decline(self: &Arc<Self>, call_id: &str, user_id: &str) -> Result<CallInfo, CallError> {
        let call = {
            let calls = self.by_call.lock().unwrap_or_else(|e| e.into_inner());
            let call = calls.get(call_id).ok_or(CallError::NotFound)?;
            if call.receiver_id != user_id {
                return Err(CallError::Forbidden);
            }
            if call.status != "ringing" {
                return Err(CallError::InvalidState);
            }
            call.clone()
        };
        self.finish(call_id, "p2p_call_decline");
        Ok(call)
    }

    /// `ringing → ended` (caller cancel) or `active → ended` (either party).
    /// A second end on an already-ended call is a quiet no-op.
    pub fn end(self: &Arc<Self>, call_id: &str, user_id: &str) -> Result<(), CallError> {
        let allowed = {
            let calls = self.by_call.lock().unwrap_or_else(|e| e.into_inner());
            let call = calls.get(call_id).ok_or(CallError::NotFound)?;
            if call.caller_id != user_id && call.receiver_id != user_id {
                return Err(CallError::Forbidden);
            }
            match call.status.as_str() {
                "ended" => return Ok(()),
                "active" => true,
                "ringing" => call.caller_id == user_id,
                _ => false,
            }
        };
        if !allowed {
            return Err(CallError::Forbidden);
        }
        self.finish(call_id, "p2p_call_end");
        Ok(())
    }

    /// Peer-disconnect cleanup; idempotent.
    pub fn end_for_user(self: &Arc<Self>, user_id: &str) {
        let call_id = self
            .active_by_user
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned();
        if let Some(id) = call_id {
            self.finish(&id, "p2p_call_end");
        }
    }

    /// Other party of a non-ended call the user participates in.
    pub fn counterpart(&self, call_id: &str, user_id: &str) -> Option<String> {
        let calls = self.by_call.lock().unwrap_or_else(|e| e.into_inner());
        let call = calls.get(call_id)?;
        if call.status == "ended" {
            return None;
        }
        if call.caller_id == user_id {
            Some(call.receiver_id.clone())
        } else if call.receiver_id == user_id {
            Some(call.caller_id.clone())
        } else {
            None
        }
    }

    pub fn active_call_for(&self, user_id: &str) -> Option<CallInfo> {
        let id = self
            .active_by_user
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned()?;
        self.by_call
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn timeout_if_ringing(self: &Arc<Self>, call_id: &str) {
        let still_ringing = self
            .by_call
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(call_id)
            .map(|c| c.status == "ringing")
            .unwrap_or(false);
        if still_ringing {
            self.finish(call_id, "p2p_call_end");
        }
    }

    /// Move a call to `ended`, release both users, publish, schedule
    /// eviction. Only the first caller for a given call performs any of it.
    fn finish(self: &Arc<Self>, call_id: &str, op: &'static str) {
        let ended = {
            let mut calls = self.by_call.lock().unwrap_or_else(|e| e.into_inner());
            match calls.get_mut(call_id) {
                Some(call) if call.status != "ended" => {
                    call.status = "ended".to_string();
                    Some(call.clone())
                }
                _ => None,
            }
        };
        let Some(call) = ended else { return };

        {
            let mut active = self.active_by_user.lock().unwrap_or_else(|e| e.into_inner());
            if active.get(&call.caller_id).map(String::as_str) == Some(call_id) {
                active.remove(&call.caller_id);
            }
            if active.get(&call.receiver_id).map(String::as_str) == Some(call_id) {
                active.remove(&call.receiver_id);
            }
        }

        self.publish(op, call);

        let coordinator = Arc::clone(self);
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(ENDED_RETENTION_SECS)).await;
            coordinator
                .by_call
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&call_id);
        });
    }
}
