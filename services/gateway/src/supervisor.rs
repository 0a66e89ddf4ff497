//! Multi-relay supervision: one long-running task per configured relay URL.
//!
//! Each loop connects, runs the subscription session, and reconnects with
//! exponential backoff (`min(base · 2^attempt, ceiling)`).  Attempts reset
//! when a relay actually delivers an event; a relay that exhausts its
//! reconnect budget is marked permanently failed and never retried within
//! this process lifetime.  One relay's failure never blocks the others.

use crate::dispatcher::Dispatcher;
use crate::relay::{SessionEnd, run_relay_session};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zg_protocol::{ClientFrame, Event, Filter};

/// Outbound frames queued per relay while it is connected (or reconnecting).
const OUTBOUND_CHANNEL_CAP: usize = 256;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub reconnect_base: Duration,
    pub reconnect_ceiling: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(5),
            reconnect_ceiling: Duration::from_secs(60),
            max_reconnect_attempts: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Relay state registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RelayState {
    pub url: String,
    pub connected: bool,
    pub last_seen_ms: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub permanently_failed: bool,
}

impl RelayState {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_owned(),
            connected: false,
            last_seen_ms: 0,
            messages_in: 0,
            messages_out: 0,
            errors: 0,
            last_error: None,
            reconnect_attempts: 0,
            permanently_failed: false,
        }
    }
}

#[derive(Default)]
pub struct RelayRegistry {
    states: Mutex<HashMap<String, RelayState>>,
}

impl RelayRegistry {
    pub fn new(urls: &[String]) -> Self {
        let states = urls
            .iter()
            .map(|u| (u.clone(), RelayState::new(u)))
            .collect();
        Self {
            states: Mutex::new(states),
        }
    }

    fn with_state<R>(&self, url: &str, f: impl FnOnce(&mut RelayState) -> R) -> R {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry(url.to_owned())
            .or_insert_with(|| RelayState::new(url));
        f(state)
    }

    pub fn mark_connected(&self, url: &str, connected: bool) {
        self.with_state(url, |s| s.connected = connected);
    }

    /// An event arrived: refresh liveness and reset the reconnect budget.
    pub fn record_event_in(&self, url: &str) {
        let now = crate::util::unix_ms();
        self.with_state(url, |s| {
            s.messages_in += 1;
            s.last_seen_ms = now;
            s.reconnect_attempts = 0;
        });
    }

    pub fn record_out(&self, url: &str) {
        self.with_state(url, |s| s.messages_out += 1);
    }

    pub fn record_error(&self, url: &str, error: &str) {
        self.with_state(url, |s| {
            s.errors += 1;
            s.last_error = Some(error.to_owned());
        });
    }

    pub fn bump_attempts(&self, url: &str) -> u32 {
        self.with_state(url, |s| {
            s.reconnect_attempts += 1;
            s.reconnect_attempts
        })
    }

    pub fn mark_permanently_failed(&self, url: &str) {
        self.with_state(url, |s| s.permanently_failed = true);
    }

    pub fn is_permanently_failed(&self, url: &str) -> bool {
        self.with_state(url, |s| s.permanently_failed)
    }

    pub fn snapshot(&self) -> Vec<RelayState> {
        let mut states: Vec<RelayState> = self.states.lock().unwrap().values().cloned().collect();
        states.sort_by(|a, b| a.url.cmp(&b.url));
        states
    }
}

// ---------------------------------------------------------------------------
// Publish fanout
// ---------------------------------------------------------------------------

/// Cloneable handle used to publish signed events to every relay.
///
/// Publishing hands the frame to each relay loop's bounded channel; frames
/// queued while a relay reconnects flush once the session is back.  "At
/// least one relay accepted" means at least one live loop took the frame.
#[derive(Clone)]
pub struct RelayPool {
    senders: Arc<HashMap<String, mpsc::Sender<ClientFrame>>>,
}

impl RelayPool {
    /// Returns how many relay loops accepted the event.
    pub fn publish(&self, event: &Event) -> usize {
        let mut accepted = 0;
        for (url, tx) in self.senders.iter() {
            match tx.try_send(ClientFrame::Event(event.clone())) {
                Ok(()) => accepted += 1,
                Err(e) => debug!(relay = %url, error = %e, "relay did not take outbound frame"),
            }
        }
        accepted
    }
}

/// Create the publish fanout for `urls`: the pool of senders plus the
/// per-relay receivers the supervisor loops will drain.
pub fn build_pool(urls: &[String]) -> (RelayPool, Vec<(String, mpsc::Receiver<ClientFrame>)>) {
    let mut senders = HashMap::new();
    let mut receivers = Vec::new();
    for url in urls {
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAP);
        senders.insert(url.clone(), tx);
        receivers.push((url.clone(), rx));
    }
    (
        RelayPool {
            senders: Arc::new(senders),
        },
        receivers,
    )
}

// ---------------------------------------------------------------------------
// Relay loops
// ---------------------------------------------------------------------------

/// Spawn one subscription loop per relay.  `connected_tx` tracks how many
/// relays currently hold a live connection (the startup gate watches it).
pub fn spawn_relay_loops(
    cfg: SupervisorConfig,
    filters: Vec<Filter>,
    receivers: Vec<(String, mpsc::Receiver<ClientFrame>)>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<RelayRegistry>,
    shutdown: watch::Receiver<bool>,
    connected_tx: watch::Sender<usize>,
) -> Vec<JoinHandle<()>> {
    receivers
        .into_iter()
        .map(|(url, rx)| {
            let cfg = cfg.clone();
            let filters = filters.clone();
            let dispatcher = Arc::clone(&dispatcher);
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();
            let connected_tx = connected_tx.clone();
            tokio::spawn(async move {
                relay_loop(
                    &url,
                    cfg,
                    filters,
                    rx,
                    dispatcher,
                    registry,
                    shutdown,
                    connected_tx,
                )
                .await;
            })
        })
        .collect()
}

fn backoff_delay(base: Duration, ceiling: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(ceiling)
}

#[allow(clippy::too_many_arguments)]
async fn relay_loop(
    url: &str,
    cfg: SupervisorConfig,
    filters: Vec<Filter>,
    mut outbound_rx: mpsc::Receiver<ClientFrame>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<RelayRegistry>,
    mut shutdown: watch::Receiver<bool>,
    connected_tx: watch::Sender<usize>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match tokio_tungstenite::connect_async(url).await {
            Ok((ws, _response)) => {
                info!(relay = %url, "connected");
                registry.mark_connected(url, true);
                connected_tx.send_modify(|n| *n += 1);

                let end = run_relay_session(
                    ws,
                    url,
                    &filters,
                    &mut outbound_rx,
                    &dispatcher,
                    &registry,
                    shutdown.clone(),
                )
                .await;

                registry.mark_connected(url, false);
                connected_tx.send_modify(|n| *n = n.saturating_sub(1));

                match end {
                    Ok(SessionEnd::Shutdown) => break,
                    Ok(SessionEnd::StreamClosed) => {
                        warn!(relay = %url, "stream closed");
                        registry.record_error(url, "stream closed");
                    }
                    Ok(SessionEnd::SubscriptionClosed(message)) => {
                        warn!(relay = %url, message = %message, "subscription closed by relay");
                        registry.record_error(url, &format!("subscription closed: {message}"));
                    }
                    Err(e) => {
                        warn!(relay = %url, error = %e, "session error");
                        registry.record_error(url, &e.to_string());
                    }
                }
            }
            Err(e) => {
                warn!(relay = %url, error = %e, "connect failed");
                registry.record_error(url, &e.to_string());
            }
        }

        let attempts = registry.bump_attempts(url);
        if attempts >= cfg.max_reconnect_attempts {
            registry.mark_permanently_failed(url);
            error!(relay = %url, attempts, "reconnect budget exhausted, removing relay from rotation");
            break;
        }

        let delay = backoff_delay(cfg.reconnect_base, cfg.reconnect_ceiling, attempts);
        debug!(relay = %url, attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!(relay = %url, "relay loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let base = Duration::from_secs(5);
        let ceiling = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, ceiling, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, ceiling, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, ceiling, 3), Duration::from_secs(20));
        assert_eq!(backoff_delay(base, ceiling, 4), Duration::from_secs(40));
        assert_eq!(backoff_delay(base, ceiling, 5), Duration::from_secs(60));
        assert_eq!(backoff_delay(base, ceiling, 12), Duration::from_secs(60));
    }

    #[test]
    fn registry_tracks_counters_and_attempt_reset() {
        let registry = RelayRegistry::new(&["wss://a".to_owned()]);
        assert_eq!(registry.bump_attempts("wss://a"), 1);
        assert_eq!(registry.bump_attempts("wss://a"), 2);
        registry.record_event_in("wss://a");
        let state = &registry.snapshot()[0];
        assert_eq!(state.reconnect_attempts, 0, "event reception resets attempts");
        assert_eq!(state.messages_in, 1);
        assert!(state.last_seen_ms > 0);
    }

    #[test]
    fn registry_marks_permanent_failure() {
        let registry = RelayRegistry::new(&["wss://a".to_owned(), "wss://b".to_owned()]);
        registry.mark_permanently_failed("wss://a");
        assert!(registry.is_permanently_failed("wss://a"));
        assert!(!registry.is_permanently_failed("wss://b"));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[0].permanently_failed);
    }

    #[tokio::test]
    async fn pool_counts_only_accepting_relays() {
        let urls = vec!["wss://a".to_owned(), "wss://b".to_owned()];
        let (pool, mut receivers) = build_pool(&urls);
        // Drop one receiver to simulate a dead relay loop.
        receivers.remove(1);

        let event = Event {
            id: "00".repeat(32),
            pubkey: "11".repeat(32),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "22".repeat(64),
        };
        assert_eq!(pool.publish(&event), 1);
        // The surviving receiver got the frame.
        let (_, rx) = &mut receivers[0];
        assert!(matches!(rx.try_recv(), Ok(ClientFrame::Event(_))));
    }
}
