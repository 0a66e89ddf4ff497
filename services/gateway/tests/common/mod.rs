// Shared harness for the gateway integration suites: a scripted oracle and
// a config builder pointing the gateway at mock relays and a temp SQLite
// file.
#![allow(dead_code)]

use gateway::config::{
    AiConfig, CircuitSettings, CostSettings, GatewayConfig, QueueSettings, RateLimitSettings,
    RelayTuning, StorageSettings,
};
use gateway::oracle::{ChatTurn, Oracle, OracleError};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Oracle whose replies are scripted per call; unscripted calls return the
/// default reply.  Counts invocations so tests can assert the
/// charge-before-generate contract.
pub struct ScriptedOracle {
    script: Mutex<VecDeque<Result<String, String>>>,
    default_reply: String,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn replying(default_reply: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_reply: default_reply.to_owned(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_reply(&self, reply: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(reply.to_owned()));
    }

    pub fn push_failure(&self, error: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(error.to_owned()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Oracle for ScriptedOracle {
    async fn generate(&self, _turns: &[ChatTurn]) -> Result<String, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(error)) => Err(OracleError::Request(error)),
            None => Ok(self.default_reply.clone()),
        }
    }
}

/// Cloneable oracle handle: the test keeps the inner `Arc` for call-count
/// assertions while the gateway owns this wrapper.
#[derive(Clone)]
pub struct SharedOracle(pub std::sync::Arc<ScriptedOracle>);

impl Oracle for SharedOracle {
    async fn generate(&self, turns: &[ChatTurn]) -> Result<String, OracleError> {
        self.0.as_ref().generate(turns).await
    }
}

/// Spawn the gateway; returns the join handle and the shutdown switch.
pub fn start_gateway(
    cfg: GatewayConfig,
    signer: std::sync::Arc<dyn zg_protocol::Signer>,
    oracle: SharedOracle,
) -> (
    tokio::task::JoinHandle<Result<(), gateway::GatewayError>>,
    tokio::sync::watch::Sender<bool>,
) {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(gateway::run(cfg, signer, oracle, shutdown_rx));
    (handle, shutdown_tx)
}

/// Flip the shutdown switch and wait for a clean exit.
pub async fn stop_gateway(
    handle: tokio::task::JoinHandle<Result<(), gateway::GatewayError>>,
    shutdown_tx: &tokio::sync::watch::Sender<bool>,
) {
    let _ = shutdown_tx.send(true);
    handle
        .await
        .expect("gateway task panicked")
        .expect("gateway exited with error");
}

/// Credit a user before the gateway starts (its own KV handle, then closed).
pub async fn prefund(sqlite_path: &Path, user: &str, amount: u64) {
    let kv = gateway::store::Kv::open(sqlite_path)
        .expect("open kv")
        .into_shared();
    gateway::store::ledger::Ledger::new(kv)
        .credit(user, amount)
        .await
        .expect("credit");
}

/// Read a balance after the gateway has stopped.
pub async fn balance_of(sqlite_path: &Path, user: &str) -> u64 {
    let kv = gateway::store::Kv::open(sqlite_path)
        .expect("open kv")
        .into_shared();
    gateway::store::ledger::Ledger::new(kv)
        .balance(user)
        .await
        .expect("balance")
}

/// Read a session's history after the gateway has stopped.
pub async fn session_history(
    sqlite_path: &Path,
    user: &str,
    session: &str,
) -> Vec<gateway::store::conversation::MessageRecord> {
    let kv = gateway::store::Kv::open(sqlite_path)
        .expect("open kv")
        .into_shared();
    gateway::store::conversation::ConversationStore::new(kv)
        .history_by_session(user, session, 100)
        .await
        .expect("history")
}

/// Gateway config tuned for tests: tiny delays, fast reconnects.
pub fn test_config(relays: Vec<String>, sqlite_path: &Path) -> GatewayConfig {
    GatewayConfig {
        schema_version: 1,
        private_key: "test".to_owned(),
        bot_name: "TestBot".to_owned(),
        relays,
        response_delay_ms: 0,
        web_port: 0,
        ai: AiConfig {
            api_url: "http://unused.invalid".to_owned(),
            api_key: "unused".to_owned(),
            model: "scripted".to_owned(),
            timeout_ms: 5_000,
            fallback_message: "The AI service is unavailable right now.".to_owned(),
        },
        queue: QueueSettings {
            max_concurrent: 4,
            max_queue_size: 100,
            task_timeout_ms: 10_000,
            retry_attempts: 3,
            retry_delay_ms: 50,
        },
        rate_limit: RateLimitSettings {
            max_tokens: 50,
            refill_rate: 5.0,
            window_ms: 60_000,
        },
        costs: CostSettings {
            dm_cost: 20,
            public_cost: 50,
        },
        circuit: CircuitSettings {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout_ms: 1_000,
        },
        storage: StorageSettings {
            sqlite_path: sqlite_path.to_string_lossy().into_owned(),
        },
        relay_tuning: RelayTuning {
            reconnect_base_ms: 100,
            reconnect_ceiling_ms: 500,
            max_reconnect_attempts: 5,
            startup_timeout_ms: 5_000,
        },
    }
}
