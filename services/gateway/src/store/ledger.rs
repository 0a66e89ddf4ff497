//! Per-user balance ledger and receipt idempotency markers.
//!
//! Balances live at `balance:{user}` as decimal strings; applied receipts
//! leave a marker at `receipt:{receipt_event_id}`.  Every read-modify-write
//! holds the KV lock for its whole duration, which is the single-writer
//! discipline that makes debit and credit atomic per user.

use super::{KvError, SharedKv};
use crate::util::unix_ms;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("KV: {0}")]
    Kv(#[from] KvError),
    #[error("Encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: u64, required: u64 },
}

pub type LedgerResult<T> = Result<T, LedgerError>;

fn balance_key(user: &str) -> String {
    format!("balance:{user}")
}

fn receipt_key(receipt_event_id: &str) -> String {
    format!("receipt:{receipt_event_id}")
}

/// Marker stored when a receipt is applied, for replay suppression.
#[derive(Debug, Serialize, Deserialize)]
struct ReceiptMarker {
    payer: String,
    amount: u64,
    applied_at_ms: u64,
}

#[derive(Clone)]
pub struct Ledger {
    kv: SharedKv,
}

impl Ledger {
    pub fn new(kv: SharedKv) -> Self {
        Self { kv }
    }

    pub async fn balance(&self, user: &str) -> LedgerResult<u64> {
        let kv = self.kv.lock().await;
        Ok(read_balance(&kv, user)?)
    }

    /// Add `amount` to the user's balance, returning the new balance.
    pub async fn credit(&self, user: &str, amount: u64) -> LedgerResult<u64> {
        let kv = self.kv.lock().await;
        let new_balance = read_balance(&kv, user)?.saturating_add(amount);
        kv.put(&balance_key(user), &new_balance.to_string())?;
        Ok(new_balance)
    }

    /// Subtract `amount`, returning the new balance.  A failing debit leaves
    /// the balance untouched.
    pub async fn debit(&self, user: &str, amount: u64) -> LedgerResult<u64> {
        let kv = self.kv.lock().await;
        let balance = read_balance(&kv, user)?;
        if balance < amount {
            return Err(LedgerError::InsufficientFunds {
                balance,
                required: amount,
            });
        }
        let new_balance = balance - amount;
        kv.put(&balance_key(user), &new_balance.to_string())?;
        Ok(new_balance)
    }

    /// Apply a payment receipt exactly once.
    ///
    /// Returns `Some(new_balance)` when the credit was applied, `None` when
    /// this receipt id was already seen.  Marker and credit are written
    /// under one lock hold so a replay can never double-credit.
    pub async fn apply_receipt(
        &self,
        receipt_event_id: &str,
        payer: &str,
        amount: u64,
    ) -> LedgerResult<Option<u64>> {
        let kv = self.kv.lock().await;
        let rkey = receipt_key(receipt_event_id);
        if kv.exists(&rkey)? {
            return Ok(None);
        }
        let marker = ReceiptMarker {
            payer: payer.to_owned(),
            amount,
            applied_at_ms: unix_ms(),
        };
        kv.put(&rkey, &serde_json::to_string(&marker)?)?;
        let new_balance = read_balance(&kv, payer)?.saturating_add(amount);
        kv.put(&balance_key(payer), &new_balance.to_string())?;
        Ok(Some(new_balance))
    }
}

fn read_balance(kv: &super::Kv, user: &str) -> Result<u64, KvError> {
    Ok(kv
        .get(&balance_key(user))?
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0))
}
