// Event fixtures for pipeline tests.

use crate::fake_signer::FakeSigner;
use serde_json::json;
use zg_protocol::{Event, EventTemplate, Signer, kinds};

/// Encrypted direct message from `author` to `recipient_pub`.
pub fn dm_event(
    author: &FakeSigner,
    recipient_pub: &str,
    text: &str,
    session: Option<&str>,
    created_at: u64,
) -> Event {
    let content = author
        .encrypt(recipient_pub, text)
        .expect("fake encryption cannot fail");
    let mut tags = vec![vec!["p".to_owned(), recipient_pub.to_owned()]];
    if let Some(session_id) = session {
        tags.push(vec!["session".to_owned(), session_id.to_owned()]);
    }
    author
        .sign(EventTemplate::new(
            kinds::DIRECT_MESSAGE,
            created_at,
            tags,
            content,
        ))
        .expect("fake signing cannot fail")
}

/// Public note mentioning `mention_pub`.
pub fn note_event(author: &FakeSigner, mention_pub: &str, text: &str, created_at: u64) -> Event {
    author
        .sign(EventTemplate::new(
            kinds::PUBLIC_NOTE,
            created_at,
            vec![vec!["p".to_owned(), mention_pub.to_owned()]],
            text.to_owned(),
        ))
        .expect("fake signing cannot fail")
}

/// Payment receipt authored by a payment `service`, crediting `payer_pub`
/// with `amount_millis` millipayment-units.
pub fn receipt_event(
    service: &FakeSigner,
    payer_pub: &str,
    gateway_pub: &str,
    amount_millis: u64,
    created_at: u64,
) -> Event {
    let description = json!({
        "id": format!("req-{amount_millis}-{created_at}"),
        "pubkey": payer_pub,
        "kind": 9734,
        "tags": [["amount", amount_millis.to_string()], ["p", gateway_pub]],
        "content": "",
    })
    .to_string();
    service
        .sign(EventTemplate::new(
            kinds::PAYMENT_RECEIPT,
            created_at,
            vec![
                vec!["p".to_owned(), gateway_pub.to_owned()],
                vec!["bolt11".to_owned(), format!("lnbc-test-{amount_millis}")],
                vec!["description".to_owned(), description],
            ],
            String::new(),
        ))
        .expect("fake signing cannot fail")
}

/// Balance query addressed to the gateway.
pub fn balance_request(author: &FakeSigner, gateway_pub: &str, created_at: u64) -> Event {
    author
        .sign(EventTemplate::new(
            kinds::BALANCE,
            created_at,
            vec![vec!["p".to_owned(), gateway_pub.to_owned()]],
            String::new(),
        ))
        .expect("fake signing cannot fail")
}
