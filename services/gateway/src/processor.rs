//! The worker body: decrypt → dedup → persist → debit → generate → publish
//! → persist the reply.
//!
//! Drop-class outcomes (bad decrypt, empty content, duplicates, unsupported
//! kinds, insufficient funds) complete the job so the queue does not retry
//! them.  Only infrastructure failures (storage, publish-all-relays) bubble
//! up as errors for the retry machinery.  A retry skips the fingerprint
//! check (attempt 0 planted it) but still hits the store-level duplicate
//! guard: once the user turn is persisted, and therefore possibly charged,
//! a retry must not debit or respond a second time.

use crate::breaker::CircuitBreaker;
use crate::dedup::FingerprintCache;
use crate::dispatcher::ProcessJob;
use crate::oracle::{Oracle, assemble_turns};
use crate::outbound::{Outbound, OutboundError};
use crate::queue::JobRunner;
use crate::stats::GatewayStats;
use crate::store::conversation::{
    ConversationStore, SaveMessage, SessionOrigin, StoreError, Turn,
};
use crate::store::ledger::{Ledger, LedgerError};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, warn};
use zg_protocol::{Event, EventKind, Signer};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub bot_name: String,
    pub dm_cost: u64,
    pub public_cost: u64,
    pub response_delay: Duration,
    /// How many stored messages to load as context.
    pub history_limit: usize,
    /// Hard cap on history turns handed to the oracle.
    pub max_history_turns: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            bot_name: "ZapAI".to_owned(),
            dm_cost: 20,
            public_cost: 50,
            response_delay: Duration::from_millis(2000),
            history_limit: 50,
            max_history_turns: 40,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("publish: {0}")]
    Publish(#[from] OutboundError),
}

pub struct Processor<O: Oracle> {
    signer: Arc<dyn Signer>,
    oracle: O,
    breaker: Arc<CircuitBreaker>,
    store: ConversationStore,
    ledger: Ledger,
    outbound: Arc<Outbound>,
    fingerprints: Arc<FingerprintCache>,
    stats: Arc<GatewayStats>,
    cfg: ProcessorConfig,
}

impl<O: Oracle> Processor<O> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signer: Arc<dyn Signer>,
        oracle: O,
        breaker: Arc<CircuitBreaker>,
        store: ConversationStore,
        ledger: Ledger,
        outbound: Arc<Outbound>,
        fingerprints: Arc<FingerprintCache>,
        stats: Arc<GatewayStats>,
        cfg: ProcessorConfig,
    ) -> Self {
        Self {
            signer,
            oracle,
            breaker,
            store,
            ledger,
            outbound,
            fingerprints,
            stats,
            cfg,
        }
    }

    fn reply(
        &self,
        event: &Event,
        is_dm: bool,
        session: Option<&str>,
        text: &str,
    ) -> Result<Event, OutboundError> {
        if is_dm {
            self.outbound.send_dm(&event.pubkey, session, text)
        } else {
            self.outbound.send_public_reply(event, text)
        }
    }

    async fn persist_reply(
        &self,
        event: &Event,
        session_id: &str,
        text: &str,
        turn: Turn,
        reply_to: &str,
        message_id: Option<String>,
        origin: SessionOrigin,
    ) -> Result<(), ProcessError> {
        self.store
            .save_message(SaveMessage {
                user_key: event.pubkey.clone(),
                text: text.to_owned(),
                turn,
                session_id: Some(session_id.to_owned()),
                timestamp_ms: None,
                message_id,
                reply_to: Some(reply_to.to_owned()),
                source_event_id: None,
                source_event_kind: None,
                origin,
            })
            .await?;
        Ok(())
    }

    async fn handle(&self, job: &ProcessJob, attempt: u32) -> Result<(), ProcessError> {
        let event = &job.event;
        let (is_dm, cost, origin) = match event.kind() {
            EventKind::DirectMessage => (true, self.cfg.dm_cost, SessionOrigin::Dm),
            EventKind::PublicNote => (false, self.cfg.public_cost, SessionOrigin::Public),
            other => {
                debug!(kind = other.as_u32(), "processor rejecting unsupported kind");
                return Ok(());
            }
        };
        let requested_session = if is_dm { event.tag_value("session") } else { None };

        let plaintext = if is_dm {
            match self.signer.decrypt(&event.pubkey, &event.content) {
                Ok(text) => text,
                Err(e) => {
                    debug!(event = %event.id, error = %e, "decrypt failed, dropping");
                    return Ok(());
                }
            }
        } else {
            event.content.clone()
        };
        let plaintext = plaintext.trim().to_owned();
        if plaintext.is_empty() {
            debug!(event = %event.id, "empty plaintext, dropping");
            return Ok(());
        }

        if attempt == 0 && !self.fingerprints.check_and_insert(&event.pubkey, &plaintext) {
            self.stats.fingerprint_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(author = %event.pubkey, "identical content within window, dropping");
            return Ok(());
        }

        let saved = self
            .store
            .save_message(SaveMessage {
                user_key: event.pubkey.clone(),
                text: plaintext.clone(),
                turn: Turn::User,
                session_id: requested_session.map(str::to_owned),
                timestamp_ms: Some(event.created_at.saturating_mul(1000)),
                message_id: Some(event.id.clone()),
                reply_to: None,
                source_event_id: Some(event.id.clone()),
                source_event_kind: Some(event.kind),
                origin,
            })
            .await?;
        if saved.duplicate {
            self.stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(event = %event.id, attempt, "already persisted, dropping");
            return Ok(());
        }
        let session_id = saved.session_id;
        let user_message_id = saved.message_id;

        // Debit before generate.  A reply is only ever produced after the
        // charge sticks; a post-debit failure is not refunded.
        let balance = self.ledger.balance(&event.pubkey).await?;
        if balance < cost {
            self.stats.insufficient_funds.fetch_add(1, Ordering::Relaxed);
            let text = format!(
                "Insufficient balance. Required: {cost} units, available: {balance}. \
                 Send a zap to top up and try again."
            );
            if let Err(e) = self.reply(event, is_dm, Some(&session_id), &text) {
                warn!(error = %e, "insufficient-balance notice publish failed");
            }
            self.persist_reply(
                event,
                &session_id,
                &text,
                Turn::System,
                &user_message_id,
                None,
                origin,
            )
            .await?;
            return Ok(());
        }

        let new_balance = match self.ledger.debit(&event.pubkey, cost).await {
            Ok(balance) => balance,
            Err(LedgerError::InsufficientFunds { .. }) => {
                // Lost a race against a concurrent debit; no charge, no oracle.
                let text = "Your balance changed while I was processing. Please try again.";
                if let Err(e) = self.reply(event, is_dm, Some(&session_id), text) {
                    warn!(error = %e, "debit-race notice publish failed");
                }
                self.persist_reply(
                    event,
                    &session_id,
                    text,
                    Turn::System,
                    &user_message_id,
                    None,
                    origin,
                )
                .await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut history = if requested_session.is_some() {
            self.store
                .history_by_session(&event.pubkey, &session_id, self.cfg.history_limit)
                .await?
        } else {
            self.store
                .history_by_user(&event.pubkey, self.cfg.history_limit)
                .await?
        };
        // The turn being answered is already persisted; keep it out of the
        // context so it only appears once in the prompt.
        history.retain(|r| r.message_id != user_message_id);

        let system_prompt = format!(
            "You are {}, a helpful assistant reachable over a relay network. \
             Replies are paid for in advance, so answer directly and keep it concise.",
            self.cfg.bot_name
        );
        let turns = assemble_turns(
            &system_prompt,
            &history,
            &plaintext,
            self.cfg.max_history_turns,
        );
        let outcome = self.breaker.call(|| self.oracle.generate(&turns)).await;
        if outcome.is_fallback() {
            self.stats.oracle_fallbacks.fetch_add(1, Ordering::Relaxed);
        }
        let answer = outcome.into_text();

        if !self.cfg.response_delay.is_zero() {
            tokio::time::sleep(self.cfg.response_delay).await;
        }

        let reply_text = if is_dm {
            format!("{answer}\n\n⚡ Balance: {new_balance} units (this reply cost {cost})")
        } else {
            answer
        };
        let published = self.reply(event, is_dm, Some(&session_id), &reply_text)?;
        self.persist_reply(
            event,
            &session_id,
            &reply_text,
            Turn::Bot,
            &user_message_id,
            Some(published.id.clone()),
            origin,
        )
        .await?;

        if is_dm
            && let Err(e) = self.outbound.send_balance_snapshot(&event.pubkey, new_balance)
        {
            warn!(error = %e, "post-reply balance snapshot failed");
        }

        self.stats.responses_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl<O: Oracle> JobRunner<ProcessJob> for Processor<O> {
    type Error = ProcessError;

    async fn run(&self, job: &ProcessJob, attempt: u32) -> Result<(), ProcessError> {
        match self.handle(job, attempt).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if job.event.kind() == EventKind::DirectMessage {
                    let session = job.event.tag_value("session");
                    let notice = "Something went wrong while answering. I'll retry shortly.";
                    if let Err(notice_err) =
                        self.outbound.send_dm(&job.event.pubkey, session, notice)
                    {
                        debug!(error = %notice_err, "error notice publish failed");
                    }
                }
                Err(e)
            }
        }
    }
}
