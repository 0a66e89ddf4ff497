//! Signed outbound events: DM replies, public replies, balance snapshots,
//! zap acknowledgements.
//!
//! Everything published by the gateway is built here from an
//! `EventTemplate`, signed at the `Signer` seam, and fanned out through the
//! relay pool.  Publishing succeeds when at least one relay takes the frame.

use crate::supervisor::RelayPool;
use crate::util::{unix_ms, unix_secs};
use serde_json::json;
use std::sync::Arc;
use zg_protocol::{Event, EventTemplate, Signer, SignerError, kinds};

#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("signer: {0}")]
    Signer(#[from] SignerError),
    #[error("no relay accepted the event")]
    NoRelayAccepted,
}

pub struct Outbound {
    signer: Arc<dyn Signer>,
    pool: RelayPool,
}

impl Outbound {
    pub fn new(signer: Arc<dyn Signer>, pool: RelayPool) -> Self {
        Self { signer, pool }
    }

    fn sign_and_publish(&self, template: EventTemplate) -> Result<Event, OutboundError> {
        let event = self.signer.sign(template)?;
        if self.pool.publish(&event) == 0 {
            return Err(OutboundError::NoRelayAccepted);
        }
        Ok(event)
    }

    /// Encrypted direct message to `peer`, carrying the session tag when
    /// the conversation has one.
    pub fn send_dm(
        &self,
        peer: &str,
        session: Option<&str>,
        text: &str,
    ) -> Result<Event, OutboundError> {
        let content = self.signer.encrypt(peer, text)?;
        let mut tags = vec![vec!["p".to_owned(), peer.to_owned()]];
        if let Some(session_id) = session {
            tags.push(vec!["session".to_owned(), session_id.to_owned()]);
        }
        self.sign_and_publish(EventTemplate::new(
            kinds::DIRECT_MESSAGE,
            unix_secs(),
            tags,
            content,
        ))
    }

    /// Plaintext public reply threaded under `parent`.
    pub fn send_public_reply(&self, parent: &Event, text: &str) -> Result<Event, OutboundError> {
        let tags = vec![
            vec![
                "e".to_owned(),
                parent.id.clone(),
                String::new(),
                "reply".to_owned(),
            ],
            vec!["p".to_owned(), parent.pubkey.clone()],
        ];
        self.sign_and_publish(EventTemplate::new(
            kinds::PUBLIC_NOTE,
            unix_secs(),
            tags,
            text.to_owned(),
        ))
    }

    /// Balance snapshot addressed to `user`, tagged for filterability.
    pub fn send_balance_snapshot(&self, user: &str, balance: u64) -> Result<Event, OutboundError> {
        let content = json!({
            "balance": balance,
            "currency": "units",
            "timestamp": unix_ms(),
        })
        .to_string();
        let tags = vec![
            vec!["p".to_owned(), user.to_owned()],
            vec!["balance".to_owned(), balance.to_string()],
        ];
        self.sign_and_publish(EventTemplate::new(kinds::BALANCE, unix_secs(), tags, content))
    }

    /// Public thank-you note after an applied payment receipt.
    pub fn send_zap_ack(&self, payer: &str, amount: u64) -> Result<Event, OutboundError> {
        let text = format!("⚡ Thanks for the {amount}-unit zap! Your balance is topped up.");
        let tags = vec![vec!["p".to_owned(), payer.to_owned()]];
        self.sign_and_publish(EventTemplate::new(
            kinds::PUBLIC_NOTE,
            unix_secs(),
            tags,
            text,
        ))
    }
}
