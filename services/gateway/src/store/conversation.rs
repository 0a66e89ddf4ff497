//! Conversation persistence: message records, sessions, duplicate keys.
//!
//! # Key layout
//! Timestamps are zero-padded to 15 digits so string order equals time order.
//!
//! - `message:{user}:{session}:{padded_ts}:{direction}` → [`MessageRecord`]
//! - `session:{user}:{session}`                         → [`Session`]
//! - `hash:event:{event_id}`                            → message key pointer
//! - `hash:{user}:{session}:{padded_ts}:{direction}`    → message key pointer
//!
//! A message save is atomic under the KV lock: the duplicate check, record
//! write, both hash pointers, and the session counter update all happen
//! inside one lock hold, so no hash pointer can exist without its record.

use super::{Kv, KvError, SharedKv};
use crate::util::{truncate_chars, unix_ms};
use serde::{Deserialize, Serialize};
use tracing::debug;

const PREVIEW_CHARS: usize = 120;
const SESSION_ID_MAX_CHARS: usize = 120;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("KV: {0}")]
    Kv(#[from] KvError),
    #[error("Encode: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Which side of the conversation a record belongs to.
///
/// `System` covers gateway-authored notices (insufficient balance, transient
/// errors); they persist on the bot side of the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Turn {
    User,
    Bot,
    System,
}

impl Turn {
    pub fn direction(self) -> &'static str {
        match self {
            Turn::User => "user",
            Turn::Bot | Turn::System => "bot",
        }
    }

    pub fn message_type(self) -> &'static str {
        match self {
            Turn::User => "question",
            Turn::Bot => "response",
            Turn::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    Dm,
    Public,
    Other,
}

/// One persisted conversational turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub user_key: String,
    pub session_id: String,
    pub timestamp_ms: u64,
    /// Originating event id, or a synthetic id for gateway-authored turns.
    pub message_id: String,
    pub text: String,
    pub turn: Turn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_kind: Option<u32>,
}

/// A logical conversation thread scoped to one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_key: String,
    pub session_id: String,
    pub created_at_ms: u64,
    pub last_message_at_ms: u64,
    pub message_count: u64,
    pub origin: SessionOrigin,
    pub last_preview: String,
    pub last_direction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
}

/// Parameters for [`ConversationStore::save_message`].
#[derive(Debug, Clone)]
pub struct SaveMessage {
    pub user_key: String,
    pub text: String,
    pub turn: Turn,
    pub session_id: Option<String>,
    /// `None` means "stamp with now".
    pub timestamp_ms: Option<u64>,
    pub message_id: Option<String>,
    pub reply_to: Option<String>,
    pub source_event_id: Option<String>,
    pub source_event_kind: Option<u32>,
    pub origin: SessionOrigin,
}

impl SaveMessage {
    pub fn new(user_key: impl Into<String>, text: impl Into<String>, turn: Turn) -> Self {
        Self {
            user_key: user_key.into(),
            text: text.into(),
            turn,
            session_id: None,
            timestamp_ms: None,
            message_id: None,
            reply_to: None,
            source_event_id: None,
            source_event_kind: None,
            origin: SessionOrigin::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub message_id: String,
    pub session_id: String,
    pub timestamp_ms: u64,
    pub duplicate: bool,
}

/// Per-user aggregate for the dashboard seam.
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub user_key: String,
    pub sessions: u64,
    pub messages: u64,
    pub last_message_at_ms: u64,
    pub last_preview: String,
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

fn pad_ts(ts_ms: u64) -> String {
    format!("{ts_ms:015}")
}

fn message_key(user: &str, session: &str, ts_ms: u64, direction: &str) -> String {
    format!("message:{user}:{session}:{}:{direction}", pad_ts(ts_ms))
}

fn session_key(user: &str, session: &str) -> String {
    format!("session:{user}:{session}")
}

fn hash_event_key(event_id: &str) -> String {
    format!("hash:event:{event_id}")
}

fn hash_composite_key(user: &str, session: &str, ts_ms: u64, direction: &str) -> String {
    format!("hash:{user}:{session}:{}:{direction}", pad_ts(ts_ms))
}

/// Recover the session segment from a `message:{user}:{session}:{ts}:{dir}`
/// key.  Session ids are colon-free by construction, so the split is exact.
fn session_from_message_key(key: &str) -> Option<String> {
    let parts: Vec<&str> = key.split(':').collect();
    if parts.len() == 5 && parts[0] == "message" {
        Some(parts[2].to_owned())
    } else {
        None
    }
}

/// Sanitize an externally supplied session id: trim, collapse whitespace
/// runs, strip non-printable characters, cap the length.  Colons become
/// dashes because the key layout is colon-delimited.
pub fn sanitize_session_id(requested: &str) -> String {
    let mut out = String::new();
    let mut last_was_space = false;
    for c in requested.trim().chars() {
        if c.is_control() {
            continue;
        }
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
            continue;
        }
        last_was_space = false;
        out.push(if c == ':' { '-' } else { c });
    }
    if out.chars().count() > SESSION_ID_MAX_CHARS {
        out = out.chars().take(SESSION_ID_MAX_CHARS).collect();
    }
    out
}

fn synthesize_session_id(ts_ms: u64) -> String {
    let rand8: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_owned();
    format!("session-{ts_ms}-{rand8}")
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ConversationStore {
    kv: SharedKv,
}

impl ConversationStore {
    pub fn new(kv: SharedKv) -> Self {
        Self { kv }
    }

    /// Resolve (or create) a session for `user`.  Returns the resolved id
    /// and whether the session was newly created.
    pub async fn ensure_session(
        &self,
        user: &str,
        requested: Option<&str>,
        origin: SessionOrigin,
    ) -> StoreResult<(String, bool)> {
        let kv = self.kv.lock().await;
        ensure_session_locked(&kv, user, requested, origin, unix_ms())
    }

    /// Persist one turn.  Duplicate saves (same originating event id, or the
    /// same composite `(user, session, timestamp, direction)` key) return
    /// `duplicate = true` without writing anything.
    pub async fn save_message(&self, req: SaveMessage) -> StoreResult<SaveOutcome> {
        let now = unix_ms();
        let ts = req.timestamp_ms.unwrap_or(now);
        let kv = self.kv.lock().await;

        let message_id = req
            .message_id
            .or_else(|| req.source_event_id.clone())
            .unwrap_or_else(|| {
                let rand8: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_owned();
                format!("msg-{ts}-{rand8}")
            });

        // An event-id replay resolves to the session it was first stored
        // under, whatever session hint this delivery carried.
        if let Some(event_id) = &req.source_event_id
            && let Some(pointer) = kv.get(&hash_event_key(event_id))?
        {
            let session_id = session_from_message_key(&pointer)
                .unwrap_or_else(|| req.session_id.clone().unwrap_or_default());
            debug!(user = %req.user_key, event = %event_id, "duplicate event suppressed");
            return Ok(SaveOutcome {
                message_id,
                session_id,
                timestamp_ms: ts,
                duplicate: true,
            });
        }

        let (session_id, _created) = ensure_session_locked(
            &kv,
            &req.user_key,
            req.session_id.as_deref(),
            req.origin,
            ts,
        )?;

        let direction = req.turn.direction();
        let composite = hash_composite_key(&req.user_key, &session_id, ts, direction);
        if kv.exists(&composite)? {
            debug!(user = %req.user_key, session = %session_id, "duplicate message suppressed");
            return Ok(SaveOutcome {
                message_id,
                session_id,
                timestamp_ms: ts,
                duplicate: true,
            });
        }

        let record = MessageRecord {
            user_key: req.user_key.clone(),
            session_id: session_id.clone(),
            timestamp_ms: ts,
            message_id: message_id.clone(),
            text: req.text.clone(),
            turn: req.turn,
            reply_to: req.reply_to,
            source_event_id: req.source_event_id.clone(),
            source_event_kind: req.source_event_kind,
        };
        let record_key = message_key(&req.user_key, &session_id, ts, direction);
        kv.put(&record_key, &serde_json::to_string(&record)?)?;
        kv.put(&composite, &record_key)?;
        if let Some(event_id) = &req.source_event_id {
            kv.put(&hash_event_key(event_id), &record_key)?;
        }

        // Session counters move only forward.
        let skey = session_key(&req.user_key, &session_id);
        if let Some(raw) = kv.get(&skey)?
            && let Ok(mut session) = serde_json::from_str::<Session>(&raw)
        {
            session.message_count += 1;
            session.last_message_at_ms = session.last_message_at_ms.max(ts);
            session.last_preview = truncate_chars(&req.text, PREVIEW_CHARS);
            session.last_direction = direction.to_owned();
            if req.source_event_id.is_some() {
                session.last_event_id = req.source_event_id.clone();
            }
            kv.put(&skey, &serde_json::to_string(&session)?)?;
        }

        Ok(SaveOutcome {
            message_id,
            session_id,
            timestamp_ms: ts,
            duplicate: false,
        })
    }

    /// Last `limit` messages for a user across all sessions, chronological.
    pub async fn history_by_user(&self, user: &str, limit: usize) -> StoreResult<Vec<MessageRecord>> {
        let kv = self.kv.lock().await;
        let rows = kv.scan_prefix(&format!("message:{user}:"), Some(limit), true)?;
        Ok(parse_chronological(rows))
    }

    /// Last `limit` messages within one session, chronological.
    pub async fn history_by_session(
        &self,
        user: &str,
        session: &str,
        limit: usize,
    ) -> StoreResult<Vec<MessageRecord>> {
        let kv = self.kv.lock().await;
        let rows = kv.scan_prefix(&format!("message:{user}:{session}:"), Some(limit), true)?;
        Ok(parse_chronological(rows))
    }

    /// Most recent messages across every user, newest first (dashboard read).
    pub async fn recent_all(&self, limit: usize) -> StoreResult<Vec<MessageRecord>> {
        let kv = self.kv.lock().await;
        let rows = kv.scan_prefix("message:", Some(limit), true)?;
        let mut records: Vec<MessageRecord> = rows
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_str(&v).ok())
            .collect();
        records.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        Ok(records)
    }

    /// Per-user aggregates from session records (dashboard read).
    pub async fn summary_all(&self) -> StoreResult<Vec<UserSummary>> {
        let kv = self.kv.lock().await;
        let rows = kv.scan_prefix("session:", None, false)?;
        drop(kv);

        let mut by_user: std::collections::HashMap<String, UserSummary> =
            std::collections::HashMap::new();
        for (_, raw) in rows {
            let Ok(session) = serde_json::from_str::<Session>(&raw) else {
                continue;
            };
            let entry = by_user
                .entry(session.user_key.clone())
                .or_insert_with(|| UserSummary {
                    user_key: session.user_key.clone(),
                    sessions: 0,
                    messages: 0,
                    last_message_at_ms: 0,
                    last_preview: String::new(),
                });
            entry.sessions += 1;
            entry.messages += session.message_count;
            if session.last_message_at_ms >= entry.last_message_at_ms {
                entry.last_message_at_ms = session.last_message_at_ms;
                entry.last_preview = session.last_preview.clone();
            }
        }
        let mut summaries: Vec<UserSummary> = by_user.into_values().collect();
        summaries.sort_by(|a, b| b.last_message_at_ms.cmp(&a.last_message_at_ms));
        Ok(summaries)
    }
}

fn ensure_session_locked(
    kv: &Kv,
    user: &str,
    requested: Option<&str>,
    origin: SessionOrigin,
    now_ms: u64,
) -> StoreResult<(String, bool)> {
    let mut sid = requested.map(sanitize_session_id).unwrap_or_default();
    if sid.is_empty() {
        sid = synthesize_session_id(now_ms);
    }

    let skey = session_key(user, &sid);
    if let Some(raw) = kv.get(&skey)? {
        if let Ok(mut session) = serde_json::from_str::<Session>(&raw) {
            // Idempotent metadata upgrade: a session first seen via an
            // unclassified path can later learn its real origin.
            if session.origin == SessionOrigin::Other && origin != SessionOrigin::Other {
                session.origin = origin;
                kv.put(&skey, &serde_json::to_string(&session)?)?;
            }
        }
        return Ok((sid, false));
    }

    let session = Session {
        user_key: user.to_owned(),
        session_id: sid.clone(),
        created_at_ms: now_ms,
        last_message_at_ms: now_ms,
        message_count: 0,
        origin,
        last_preview: String::new(),
        last_direction: String::new(),
        last_event_id: None,
    };
    kv.put(&skey, &serde_json::to_string(&session)?)?;
    Ok((sid, true))
}

fn parse_chronological(rows: Vec<(String, String)>) -> Vec<MessageRecord> {
    let mut records: Vec<MessageRecord> = rows
        .into_iter()
        .filter_map(|(_, v)| serde_json::from_str(&v).ok())
        .collect();
    records.sort_by(|a, b| a.timestamp_ms.cmp(&b.timestamp_ms));
    records
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
