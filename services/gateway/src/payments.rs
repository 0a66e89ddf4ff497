//! Payment receipts and balance queries.
//!
//! A receipt (kind 9735) carries the paid invoice in a `bolt11` tag and the
//! original payment request, serialized as JSON, in a `description` tag.
//! The payer is the inner request's author (the outer event is authored by
//! the payee's payment service); amounts are millipayment-units and credit
//! whole units after integer division by 1000.

use crate::outbound::Outbound;
use crate::stats::GatewayStats;
use crate::store::ledger::Ledger;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};
use zg_protocol::Event;

/// The inner payment request embedded in the receipt's description tag.
#[derive(Debug, Deserialize)]
struct InnerRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    pubkey: Option<String>,
    #[serde(default)]
    tags: Vec<Vec<String>>,
}

impl InnerRequest {
    fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().is_some_and(|n| n == name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReceipt {
    pub payer: String,
    pub amount_units: u64,
    pub receipt_event_id: String,
    pub request_event_id: Option<String>,
    pub bolt11: Option<String>,
    pub description: String,
}

/// Parse a receipt event.  Returns `None` when the receipt is unusable
/// (no description, or no positive amount anywhere).
pub fn parse_receipt(event: &Event) -> Option<ParsedReceipt> {
    let description = event.tag_value("description")?;
    let bolt11 = event.tag_value("bolt11").map(str::to_owned);

    let inner: Option<InnerRequest> = serde_json::from_str(description).ok();

    // Inner-request author wins; the outer author is the payment service.
    let payer = inner
        .as_ref()
        .and_then(|r| r.pubkey.clone())
        .unwrap_or_else(|| event.pubkey.clone());

    let millis = inner
        .as_ref()
        .and_then(|r| r.tag_value("amount"))
        .and_then(|a| a.parse::<u64>().ok())
        .filter(|a| *a > 0)
        .or_else(|| {
            event
                .tag_value("amount")
                .and_then(|a| a.parse::<u64>().ok())
        })
        .unwrap_or(0);
    let amount_units = millis / 1000;
    if amount_units == 0 {
        return None;
    }

    Some(ParsedReceipt {
        payer,
        amount_units,
        receipt_event_id: event.id.clone(),
        request_event_id: inner.and_then(|r| r.id),
        bolt11,
        description: description.to_owned(),
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub struct Payments {
    ledger: Ledger,
    outbound: Arc<Outbound>,
    stats: Arc<GatewayStats>,
}

impl Payments {
    pub fn new(ledger: Ledger, outbound: Arc<Outbound>, stats: Arc<GatewayStats>) -> Self {
        Self {
            ledger,
            outbound,
            stats,
        }
    }

    /// Apply a kind-9735 receipt: idempotent credit, then a public
    /// acknowledgement and a balance snapshot.
    pub async fn handle_receipt(&self, event: &Event) {
        let Some(receipt) = parse_receipt(event) else {
            debug!(event = %event.id, "unusable payment receipt dropped");
            return;
        };

        match self
            .ledger
            .apply_receipt(&receipt.receipt_event_id, &receipt.payer, receipt.amount_units)
            .await
        {
            Ok(Some(new_balance)) => {
                self.stats.receipts_applied.fetch_add(1, Ordering::Relaxed);
                info!(
                    payer = %receipt.payer,
                    amount = receipt.amount_units,
                    balance = new_balance,
                    "payment receipt applied"
                );
                if let Err(e) = self.outbound.send_zap_ack(&receipt.payer, receipt.amount_units) {
                    warn!(error = %e, "zap acknowledgement publish failed");
                }
                if let Err(e) = self
                    .outbound
                    .send_balance_snapshot(&receipt.payer, new_balance)
                {
                    warn!(error = %e, "balance snapshot publish failed");
                }
            }
            Ok(None) => {
                debug!(receipt = %receipt.receipt_event_id, "receipt already applied");
            }
            Err(e) => {
                warn!(receipt = %receipt.receipt_event_id, error = %e, "receipt credit failed");
            }
        }
    }

    /// Answer a balance query with a signed snapshot.
    pub async fn handle_balance_request(&self, event: &Event) {
        match self.ledger.balance(&event.pubkey).await {
            Ok(balance) => {
                self.stats.balance_queries.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.outbound.send_balance_snapshot(&event.pubkey, balance) {
                    warn!(user = %event.pubkey, error = %e, "balance response publish failed");
                }
            }
            Err(e) => warn!(user = %event.pubkey, error = %e, "balance read failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use zg_protocol::kinds;

    fn receipt_event(tags: Vec<Vec<String>>) -> Event {
        Event {
            id: "r1".to_owned(),
            pubkey: "zapservice".to_owned(),
            created_at: 1_720_000_000,
            kind: kinds::PAYMENT_RECEIPT,
            tags,
            content: String::new(),
            sig: String::new(),
        }
    }

    fn description(payer: &str, amount_millis: &str) -> String {
        json!({
            "id": "req1",
            "pubkey": payer,
            "kind": 9734,
            "tags": [["amount", amount_millis], ["p", "gateway"]],
            "content": "",
        })
        .to_string()
    }

    #[test]
    fn parses_payer_and_amount_from_inner_request() {
        let event = receipt_event(vec![
            vec!["bolt11".to_owned(), "lnbc25u...".to_owned()],
            vec!["description".to_owned(), description("payer1", "2500")],
        ]);
        let receipt = parse_receipt(&event).unwrap();
        assert_eq!(receipt.payer, "payer1");
        assert_eq!(receipt.amount_units, 2, "2500 millis floor to 2 units");
        assert_eq!(receipt.receipt_event_id, "r1");
        assert_eq!(receipt.request_event_id.as_deref(), Some("req1"));
        assert_eq!(receipt.bolt11.as_deref(), Some("lnbc25u..."));
    }

    #[test]
    fn falls_back_to_outer_author_when_inner_has_none() {
        let desc = json!({"tags": [["amount", "3000"]]}).to_string();
        let event = receipt_event(vec![vec!["description".to_owned(), desc]]);
        let receipt = parse_receipt(&event).unwrap();
        assert_eq!(receipt.payer, "zapservice");
        assert_eq!(receipt.amount_units, 3);
    }

    #[test]
    fn falls_back_to_outer_amount_tag() {
        let desc = json!({"pubkey": "payer1", "tags": []}).to_string();
        let event = receipt_event(vec![
            vec!["description".to_owned(), desc],
            vec!["amount".to_owned(), "5000".to_owned()],
        ]);
        let receipt = parse_receipt(&event).unwrap();
        assert_eq!(receipt.amount_units, 5);
    }

    #[test]
    fn zero_or_unparsable_amounts_are_dropped() {
        let event = receipt_event(vec![
            vec!["description".to_owned(), description("payer1", "900")],
        ]);
        assert!(parse_receipt(&event).is_none(), "sub-unit amounts floor to zero");

        let event = receipt_event(vec![
            vec!["description".to_owned(), description("payer1", "lots")],
        ]);
        assert!(parse_receipt(&event).is_none());

        let event = receipt_event(vec![vec!["bolt11".to_owned(), "lnbc...".to_owned()]]);
        assert!(parse_receipt(&event).is_none(), "no description tag");
    }

    #[test]
    fn malformed_description_still_credits_outer_author() {
        let event = receipt_event(vec![
            vec!["description".to_owned(), "not json".to_owned()],
            vec!["amount".to_owned(), "2000".to_owned()],
        ]);
        let receipt = parse_receipt(&event).unwrap();
        assert_eq!(receipt.payer, "zapservice");
        assert_eq!(receipt.amount_units, 2);
    }
}
