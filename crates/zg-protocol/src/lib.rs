// zg-protocol: Relay protocol types and serialization.
//
// Events are signed JSON objects identified by a content hash.  Wire frames
// are JSON arrays with a leading verb string ("REQ", "EVENT", ...), so the
// frame enums carry hand-written serde impls instead of derives.  Unknown
// verbs deserialize to an explicit `Unknown` variant; dropping them is the
// caller's decision, not a parse error.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Frozen kind numbers consumed and produced by the gateway.
pub mod kinds {
    pub const PUBLIC_NOTE: u32 = 1;
    pub const DIRECT_MESSAGE: u32 = 4;
    /// Balance queries and balance snapshots share one kind; direction
    /// distinguishes them (inbound = query, gateway-signed = snapshot).
    pub const BALANCE: u32 = 1006;
    pub const PAYMENT_RECEIPT: u32 = 9735;
}

/// Classified event kind.  `Other` carries the raw number so routing can
/// ignore it without losing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PublicNote,
    DirectMessage,
    BalanceQuery,
    PaymentReceipt,
    Other(u32),
}

impl From<u32> for EventKind {
    fn from(kind: u32) -> Self {
        match kind {
            kinds::PUBLIC_NOTE => EventKind::PublicNote,
            kinds::DIRECT_MESSAGE => EventKind::DirectMessage,
            kinds::BALANCE => EventKind::BalanceQuery,
            kinds::PAYMENT_RECEIPT => EventKind::PaymentReceipt,
            other => EventKind::Other(other),
        }
    }
}

impl EventKind {
    pub fn as_u32(self) -> u32 {
        match self {
            EventKind::PublicNote => kinds::PUBLIC_NOTE,
            EventKind::DirectMessage => kinds::DIRECT_MESSAGE,
            EventKind::BalanceQuery => kinds::BALANCE,
            EventKind::PaymentReceipt => kinds::PAYMENT_RECEIPT,
            EventKind::Other(other) => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A signed, immutable protocol event.
///
/// `id` is the lowercase hex SHA-256 of the canonical serialization
/// `[0, pubkey, created_at, kind, tags, content]`; `sig` is a 128-char hex
/// schnorr signature over that id.  The struct stores the raw `kind`
/// number; use [`Event::kind`] for classified routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        EventKind::from(self.kind)
    }

    /// First value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().is_some_and(|n| n == name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// All first values of tags named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().is_some_and(|n| n == name))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
    }

    /// Whether any `p` tag addresses `pubkey`.
    pub fn is_addressed_to(&self, pubkey: &str) -> bool {
        self.tag_values("p").any(|p| p == pubkey)
    }

    /// Recompute the content hash from the event fields.
    pub fn compute_id(&self) -> String {
        event_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Whether the stored `id` matches the recomputed content hash.
    pub fn verify_id(&self) -> bool {
        self.id == self.compute_id()
    }
}

/// An unsigned event awaiting the signer.
///
/// `pubkey` is filled by the signer; builders leave it empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventTemplate {
    pub fn new(kind: u32, created_at: u64, tags: Vec<Vec<String>>, content: String) -> Self {
        Self {
            created_at,
            kind,
            tags,
            content,
        }
    }
}

/// Canonical content hash for an event: lowercase hex SHA-256 of
/// `[0, pubkey, created_at, kind, tags, content]` serialized compactly.
pub fn event_id(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    let canonical = json!([0, pubkey, created_at, kind, tags, content]).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

// ---------------------------------------------------------------------------
// Signer seam
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("key: {0}")]
    Key(String),
    #[error("sign: {0}")]
    Sign(String),
    #[error("encrypt: {0}")]
    Encrypt(String),
    #[error("decrypt: {0}")]
    Decrypt(String),
}

/// The opaque signing/encryption seam.
///
/// The gateway never touches key material directly; it hands templates to a
/// `Signer` and gets back complete signed events.  Encryption covers the
/// direct-message content format (peer-addressed, symmetric under the
/// shared secret, so `decrypt(peer, encrypt(peer, m)) == m` on both sides).
pub trait Signer: Send + Sync {
    /// Lowercase hex public identity used in `p` tags and as `pubkey`.
    fn public_key(&self) -> String;

    /// Fill in `pubkey`, compute the id, and sign.
    fn sign(&self, template: EventTemplate) -> Result<Event, SignerError>;

    /// Encrypt `plaintext` for `peer_pubkey`.
    fn encrypt(&self, peer_pubkey: &str, plaintext: &str) -> Result<String, SignerError>;

    /// Decrypt `ciphertext` from `peer_pubkey`.
    fn decrypt(&self, peer_pubkey: &str, ciphertext: &str) -> Result<String, SignerError>;

    /// Verify `sig` against the event id and author key.
    fn verify(&self, event: &Event) -> bool;
}

// ---------------------------------------------------------------------------
// Subscription filters
// ---------------------------------------------------------------------------

/// A subscription filter as carried in `REQ` frames.
///
/// Tag-value filters use the `#`-prefixed field names from the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<String>>,
    #[serde(rename = "#e", skip_serializing_if = "Option::is_none")]
    pub e_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl Filter {
    /// The gateway's standing filter: watched kinds, addressed to `pubkey`,
    /// starting from `since` (startup time).
    pub fn addressed_to(pubkey: &str, since: u64) -> Self {
        Filter {
            kinds: Some(vec![
                kinds::PUBLIC_NOTE,
                kinds::DIRECT_MESSAGE,
                kinds::BALANCE,
                kinds::PAYMENT_RECEIPT,
            ]),
            p_tags: Some(vec![pubkey.to_owned()]),
            since: Some(since),
            ..Filter::default()
        }
    }

    /// Whether `event` matches every populated constraint.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }
        if let Some(authors) = &self.authors
            && !authors.contains(&event.pubkey)
        {
            return false;
        }
        if let Some(p_tags) = &self.p_tags
            && !p_tags.iter().any(|p| event.is_addressed_to(p))
        {
            return false;
        }
        if let Some(e_tags) = &self.e_tags
            && !e_tags
                .iter()
                .any(|e| event.tag_values("e").any(|v| v == e.as_str()))
        {
            return false;
        }
        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame is not a JSON array")]
    NotAnArray,
    #[error("frame is missing elements for verb {0}")]
    Truncated(String),
    #[error("frame element has wrong type: {0}")]
    BadElement(String),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frames sent by a client to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// `["REQ", sub_id, filter, ...]`
    Req {
        sub_id: String,
        filters: Vec<Filter>,
    },
    /// `["EVENT", event]`
    Event(Event),
    /// `["CLOSE", sub_id]`
    Close { sub_id: String },
}

/// Frames sent by a relay to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    /// `["EVENT", sub_id, event]`
    Event { sub_id: String, event: Event },
    /// `["EOSE", sub_id]`: end of stored events, informational.
    Eose { sub_id: String },
    /// `["OK", event_id, accepted, message]`: publish acknowledgement.
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["CLOSED", sub_id, message]`: subscription terminated by the relay.
    Closed { sub_id: String, message: String },
    /// `["NOTICE", message]`
    Notice { message: String },
    /// Any verb this crate does not know.  Callers drop it.
    Unknown,
}

fn frame_str(arr: &[Value], idx: usize, verb: &str) -> Result<String, WireError> {
    arr.get(idx)
        .ok_or_else(|| WireError::Truncated(verb.to_owned()))?
        .as_str()
        .ok_or_else(|| WireError::BadElement(format!("{verb}[{idx}] not a string")))
        .map(str::to_owned)
}

impl ClientFrame {
    pub fn from_value(value: Value) -> Result<Self, WireError> {
        let Value::Array(arr) = value else {
            return Err(WireError::NotAnArray);
        };
        let verb = frame_str(&arr, 0, "frame")?;
        match verb.as_str() {
            "REQ" => {
                let sub_id = frame_str(&arr, 1, "REQ")?;
                let filters = arr
                    .into_iter()
                    .skip(2)
                    .map(serde_json::from_value)
                    .collect::<Result<Vec<Filter>, _>>()?;
                Ok(ClientFrame::Req { sub_id, filters })
            }
            "EVENT" => {
                let event = arr
                    .into_iter()
                    .nth(1)
                    .ok_or_else(|| WireError::Truncated("EVENT".to_owned()))?;
                Ok(ClientFrame::Event(serde_json::from_value(event)?))
            }
            "CLOSE" => Ok(ClientFrame::Close {
                sub_id: frame_str(&arr, 1, "CLOSE")?,
            }),
            other => Err(WireError::BadElement(format!("unknown client verb {other}"))),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            ClientFrame::Req { sub_id, filters } => {
                let mut arr = vec![json!("REQ"), json!(sub_id)];
                arr.extend(filters.iter().map(|f| json!(f)));
                Value::Array(arr)
            }
            ClientFrame::Event(event) => json!(["EVENT", event]),
            ClientFrame::Close { sub_id } => json!(["CLOSE", sub_id]),
        }
    }
}

impl RelayFrame {
    pub fn from_value(value: Value) -> Result<Self, WireError> {
        let Value::Array(arr) = value else {
            return Err(WireError::NotAnArray);
        };
        let verb = frame_str(&arr, 0, "frame")?;
        match verb.as_str() {
            "EVENT" => {
                let sub_id = frame_str(&arr, 1, "EVENT")?;
                let event = arr
                    .into_iter()
                    .nth(2)
                    .ok_or_else(|| WireError::Truncated("EVENT".to_owned()))?;
                Ok(RelayFrame::Event {
                    sub_id,
                    event: serde_json::from_value(event)?,
                })
            }
            "EOSE" => Ok(RelayFrame::Eose {
                sub_id: frame_str(&arr, 1, "EOSE")?,
            }),
            "OK" => {
                let event_id = frame_str(&arr, 1, "OK")?;
                let accepted = arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| WireError::BadElement("OK[2] not a bool".to_owned()))?;
                let message = arr
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                Ok(RelayFrame::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "CLOSED" => Ok(RelayFrame::Closed {
                sub_id: frame_str(&arr, 1, "CLOSED")?,
                message: arr
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            }),
            "NOTICE" => Ok(RelayFrame::Notice {
                message: frame_str(&arr, 1, "NOTICE")?,
            }),
            _ => Ok(RelayFrame::Unknown),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            RelayFrame::Event { sub_id, event } => json!(["EVENT", sub_id, event]),
            RelayFrame::Eose { sub_id } => json!(["EOSE", sub_id]),
            RelayFrame::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            RelayFrame::Closed { sub_id, message } => json!(["CLOSED", sub_id, message]),
            RelayFrame::Notice { message } => json!(["NOTICE", message]),
            RelayFrame::Unknown => json!(["UNKNOWN"]),
        }
    }
}

impl Serialize for ClientFrame {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClientFrame {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        ClientFrame::from_value(value).map_err(serde::de::Error::custom)
    }
}

impl Serialize for RelayFrame {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RelayFrame {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        RelayFrame::from_value(value).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
