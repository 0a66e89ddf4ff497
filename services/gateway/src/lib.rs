// gateway: Relay-to-AI gateway with micropayment metering.
//
// Library entry point.  `run` wires the pipeline (stores, rate limiter,
// circuit breaker, work queue, dispatcher, relay supervisor) and blocks
// until the shutdown watch fires.  Modules are exposed for integration
// testing.

pub mod breaker;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod oracle;
pub mod outbound;
pub mod payments;
pub mod processor;
pub mod queue;
pub mod rate_limit;
pub mod relay;
pub mod signer;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod util;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::config::GatewayConfig;
use crate::dedup::{FingerprintCache, ProcessedEvents};
use crate::dispatcher::Dispatcher;
use crate::oracle::Oracle;
use crate::outbound::Outbound;
use crate::payments::Payments;
use crate::processor::{Processor, ProcessorConfig};
use crate::queue::{QueueConfig, WorkQueue};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::stats::{GatewayStats, StatsHub, StatsProvider};
use crate::store::conversation::ConversationStore;
use crate::store::ledger::Ledger;
use crate::supervisor::{RelayRegistry, SupervisorConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use zg_protocol::{Filter, Signer};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("storage: {0}")]
    Kv(#[from] store::KvError),
    #[error("no relay connected within the startup window")]
    NoRelayConnected,
}

/// Run the gateway until `shutdown` flips to true.
///
/// Fails fast when storage cannot open or when no relay connects within
/// the startup window.
pub async fn run<O: Oracle>(
    cfg: GatewayConfig,
    signer: Arc<dyn Signer>,
    oracle: O,
    shutdown: watch::Receiver<bool>,
) -> Result<(), GatewayError> {
    let kv = store::Kv::open(Path::new(&cfg.storage.sqlite_path))?.into_shared();
    let conversations = ConversationStore::new(Arc::clone(&kv));
    let ledger = Ledger::new(Arc::clone(&kv));
    let stats = Arc::new(GatewayStats::default());
    let registry = Arc::new(RelayRegistry::new(&cfg.relays));

    let (pool, receivers) = supervisor::build_pool(&cfg.relays);
    let outbound = Arc::new(Outbound::new(Arc::clone(&signer), pool));
    let payments = Arc::new(Payments::new(
        ledger.clone(),
        Arc::clone(&outbound),
        Arc::clone(&stats),
    ));

    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
        failure_threshold: cfg.circuit.failure_threshold,
        success_threshold: cfg.circuit.success_threshold,
        reset_timeout: Duration::from_millis(cfg.circuit.reset_timeout_ms),
        call_timeout: Duration::from_millis(cfg.ai.timeout_ms),
        fallback_text: cfg.ai.fallback_message.clone(),
    }));
    let fingerprints = Arc::new(FingerprintCache::default());
    let rate = Arc::new(RateLimiter::new(RateLimitConfig {
        max_tokens: cfg.rate_limit.max_tokens,
        refill_per_sec: cfg.rate_limit.refill_rate,
        idle_window: Duration::from_millis(cfg.rate_limit.window_ms),
    }));

    let queue = WorkQueue::new(QueueConfig {
        max_queue_size: cfg.queue.max_queue_size,
        max_concurrent: cfg.queue.max_concurrent,
        task_timeout: Duration::from_millis(cfg.queue.task_timeout_ms),
        retry_attempts: cfg.queue.retry_attempts,
        retry_delay: Duration::from_millis(cfg.queue.retry_delay_ms),
    });
    let processor = Arc::new(Processor::new(
        Arc::clone(&signer),
        oracle,
        Arc::clone(&breaker),
        conversations.clone(),
        ledger.clone(),
        Arc::clone(&outbound),
        Arc::clone(&fingerprints),
        Arc::clone(&stats),
        ProcessorConfig {
            bot_name: cfg.bot_name.clone(),
            dm_cost: cfg.costs.dm_cost,
            public_cost: cfg.costs.public_cost,
            response_delay: Duration::from_millis(cfg.response_delay_ms),
            ..ProcessorConfig::default()
        },
    ));
    let worker_handles = queue.start(processor, shutdown.clone());

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&signer),
        ProcessedEvents::default(),
        Arc::clone(&rate),
        queue.clone(),
        payments,
        Arc::clone(&outbound),
        Arc::clone(&stats),
    ));

    let (connected_tx, mut connected_rx) = watch::channel(0usize);
    let filters = vec![Filter::addressed_to(&signer.public_key(), util::unix_secs())];
    let relay_handles = supervisor::spawn_relay_loops(
        SupervisorConfig {
            reconnect_base: cfg.relay_tuning.reconnect_base(),
            reconnect_ceiling: cfg.relay_tuning.reconnect_ceiling(),
            max_reconnect_attempts: cfg.relay_tuning.max_reconnect_attempts,
        },
        filters,
        receivers,
        Arc::clone(&dispatcher),
        Arc::clone(&registry),
        shutdown.clone(),
        connected_tx,
    );

    // Startup gate: at least one relay must come up.
    let connected = matches!(
        tokio::time::timeout(
            cfg.relay_tuning.startup_timeout(),
            connected_rx.wait_for(|connected| *connected >= 1),
        )
        .await,
        Ok(Ok(_))
    );
    if !connected {
        queue.stop(worker_handles).await;
        for handle in relay_handles {
            handle.abort();
        }
        return Err(GatewayError::NoRelayConnected);
    }

    info!(
        bot = %cfg.bot_name,
        relays = cfg.relays.len(),
        "gateway running"
    );

    // Housekeeping: idle rate buckets, expired fingerprints, stats pulse.
    let hub = StatsHub::new(
        Arc::clone(&stats),
        queue.clone(),
        Arc::clone(&registry),
        Arc::clone(&breaker),
        Arc::clone(&rate),
    );
    let sweeper = {
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        let swept = rate.sweep_idle();
                        let pruned = fingerprints.prune();
                        if swept + pruned > 0 {
                            debug!(swept, pruned, "idle state swept");
                        }
                        let snapshot = hub.snapshot();
                        debug!(
                            received = snapshot.stats.events_received,
                            responded = snapshot.stats.responses_sent,
                            queue = snapshot.queue.queue_size,
                            breaker = snapshot.breaker_state,
                            "stats pulse"
                        );
                    }
                }
            }
        })
    };

    // Block until shutdown.
    let mut shutdown_wait = shutdown.clone();
    while !*shutdown_wait.borrow() {
        if shutdown_wait.changed().await.is_err() {
            break;
        }
    }

    info!("shutdown signal received, draining");
    queue.stop(worker_handles).await;
    for handle in relay_handles {
        let _ = handle.await;
    }
    let _ = sweeper.await;
    info!("gateway stopped");
    Ok(())
}
