//! Inbound event admission: authenticate, deduplicate, route, rate-limit,
//! enqueue.
//!
//! Runs inline on the relay-receive path and never blocks it: every step is
//! O(1) or a non-blocking channel/queue handoff.  Receipt and balance-query
//! handling touch storage, so those are spawned off the hot path instead of
//! going through the work queue.

use crate::dedup::ProcessedEvents;
use crate::outbound::Outbound;
use crate::payments::Payments;
use crate::queue::{QueueError, WorkQueue};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::stats::GatewayStats;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};
use zg_protocol::{Event, EventKind, Signer};

/// One unit of processing work: the admitted event and the relay it first
/// arrived from.
#[derive(Debug, Clone)]
pub struct ProcessJob {
    pub event: Event,
    pub relay_url: String,
}

pub struct Dispatcher {
    self_key: String,
    signer: Arc<dyn Signer>,
    processed: ProcessedEvents,
    rate: Arc<RateLimiter>,
    queue: WorkQueue<ProcessJob>,
    payments: Arc<Payments>,
    outbound: Arc<Outbound>,
    stats: Arc<GatewayStats>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signer: Arc<dyn Signer>,
        processed: ProcessedEvents,
        rate: Arc<RateLimiter>,
        queue: WorkQueue<ProcessJob>,
        payments: Arc<Payments>,
        outbound: Arc<Outbound>,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            self_key: signer.public_key(),
            signer,
            processed,
            rate,
            queue,
            payments,
            outbound,
            stats,
        }
    }

    /// Admit one relay-delivered event.
    pub fn dispatch(&self, event: Event, relay_url: &str) {
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);

        if !self.signer.verify(&event) {
            self.stats.invalid_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(event = %event.id, "dropping event with bad id or signature");
            return;
        }

        // First observation wins; later copies from other relays drop here.
        if !self.processed.insert(&event.id) {
            self.stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if event.pubkey == self.self_key {
            self.stats.self_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match event.kind() {
            EventKind::PaymentReceipt => {
                let payments = Arc::clone(&self.payments);
                tokio::spawn(async move {
                    payments.handle_receipt(&event).await;
                });
            }
            EventKind::BalanceQuery => {
                let payments = Arc::clone(&self.payments);
                tokio::spawn(async move {
                    payments.handle_balance_request(&event).await;
                });
            }
            EventKind::DirectMessage | EventKind::PublicNote => {
                self.admit(event, relay_url);
            }
            EventKind::Other(kind) => {
                self.stats.ignored_kinds.fetch_add(1, Ordering::Relaxed);
                debug!(kind, "ignoring unhandled event kind");
            }
        }
    }

    fn admit(&self, event: Event, relay_url: &str) {
        let is_dm = event.kind() == EventKind::DirectMessage;

        match self.rate.check(&event.pubkey) {
            RateDecision::Denied { retry_after_secs } => {
                self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
                debug!(author = %event.pubkey, retry_after_secs, "rate limited");
                if is_dm {
                    // One-shot notice; public over-rate events stay silent.
                    let text = format!(
                        "You're sending messages too quickly. Please retry in {retry_after_secs} seconds."
                    );
                    let session = event.tag_value("session");
                    if let Err(e) = self.outbound.send_dm(&event.pubkey, session, &text) {
                        debug!(error = %e, "rate-limit notice publish failed");
                    }
                }
            }
            RateDecision::Allowed { remaining } => {
                debug!(author = %event.pubkey, remaining, "admitted");
                let author = event.pubkey.clone();
                let session = event.tag_value("session").map(str::to_owned);
                let job = ProcessJob {
                    event,
                    relay_url: relay_url.to_owned(),
                };
                match self.queue.enqueue(job) {
                    Ok(_id) => {}
                    Err(QueueError::Full | QueueError::Stopped) => {
                        self.stats.queue_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(author = %author, "work queue rejected event");
                        if is_dm {
                            let text =
                                "I'm overloaded right now. Please try again in a moment.";
                            if let Err(e) =
                                self.outbound.send_dm(&author, session.as_deref(), text)
                            {
                                debug!(error = %e, "overload notice publish failed");
                            }
                        }
                    }
                }
            }
        }
    }
}
