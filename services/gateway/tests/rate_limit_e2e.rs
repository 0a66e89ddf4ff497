// Per-user rate limiting through the full pipeline.

mod common;

use common::{
    ScriptedOracle, SharedOracle, balance_of, prefund, start_gateway, stop_gateway, test_config,
};
use std::sync::Arc;
use std::time::Duration;
use zg_protocol::{Signer, kinds};
use zg_test_utils::{FakeSigner, MockRelay, fixtures};

const SUB_WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn third_rapid_dm_is_declined_with_a_notice() {
    let relay = MockRelay::start().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("gateway.sqlite3");

    let gateway_signer = Arc::new(FakeSigner::new("gateway"));
    let gateway_pub = gateway_signer.public_key();
    let alice = FakeSigner::new("alice");
    prefund(&db, &alice.public_key(), 1000).await;

    let mut cfg = test_config(vec![relay.url()], &db);
    cfg.rate_limit.max_tokens = 2;
    cfg.rate_limit.refill_rate = 0.0;

    let oracle = Arc::new(ScriptedOracle::replying("answer"));
    let (handle, shutdown) = start_gateway(cfg, gateway_signer, SharedOracle(Arc::clone(&oracle)));
    relay.wait_for_subscriber(SUB_WAIT).await;

    for (i, text) in ["first", "second", "third"].iter().enumerate() {
        relay.inject(fixtures::dm_event(
            &alice,
            &gateway_pub,
            text,
            Some("s1"),
            1_700_000_100 + i as u64,
        ));
    }

    // Two answers plus one decline notice, all as DMs.
    let dms = relay
        .wait_for_published(kinds::DIRECT_MESSAGE, 3, SUB_WAIT)
        .await;
    let decrypted: Vec<String> = dms
        .iter()
        .map(|e| alice.decrypt(&gateway_pub, &e.content).unwrap())
        .collect();
    let answers = decrypted.iter().filter(|t| t.starts_with("answer")).count();
    let notices = decrypted
        .iter()
        .filter(|t| t.contains("too quickly"))
        .count();
    assert_eq!(answers, 2, "got {decrypted:?}");
    assert_eq!(notices, 1, "got {decrypted:?}");
    assert!(
        decrypted.iter().any(|t| t.contains("retry in")),
        "notice should carry a retry hint: {decrypted:?}"
    );

    // No more traffic arrives for the denied message.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(oracle.calls(), 2);
    assert_eq!(relay.published_of_kind(kinds::DIRECT_MESSAGE).len(), 3);

    stop_gateway(handle, &shutdown).await;
    // Only the two admitted messages were charged.
    assert_eq!(balance_of(&db, &alice.public_key()).await, 1000 - 2 * 20);
}

#[tokio::test]
async fn rate_limited_public_mention_is_dropped_silently() {
    let relay = MockRelay::start().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("gateway.sqlite3");

    let gateway_signer = Arc::new(FakeSigner::new("gateway"));
    let gateway_pub = gateway_signer.public_key();
    let alice = FakeSigner::new("alice");
    prefund(&db, &alice.public_key(), 1000).await;

    let mut cfg = test_config(vec![relay.url()], &db);
    cfg.rate_limit.max_tokens = 1;
    cfg.rate_limit.refill_rate = 0.0;

    let oracle = Arc::new(ScriptedOracle::replying("answer"));
    let (handle, shutdown) = start_gateway(cfg, gateway_signer, SharedOracle(Arc::clone(&oracle)));
    relay.wait_for_subscriber(SUB_WAIT).await;

    relay.inject(fixtures::note_event(&alice, &gateway_pub, "one", 1_700_000_100));
    relay.inject(fixtures::note_event(&alice, &gateway_pub, "two", 1_700_000_101));

    let replies = relay
        .wait_for_published(kinds::PUBLIC_NOTE, 1, SUB_WAIT)
        .await;
    assert_eq!(replies[0].content, "answer");

    tokio::time::sleep(Duration::from_millis(300)).await;
    // The over-rate mention produced nothing: no reply, no notice, no DM.
    assert_eq!(relay.published_of_kind(kinds::PUBLIC_NOTE).len(), 1);
    assert!(relay.published_of_kind(kinds::DIRECT_MESSAGE).is_empty());
    assert_eq!(oracle.calls(), 1);

    stop_gateway(handle, &shutdown).await;
    assert_eq!(balance_of(&db, &alice.public_key()).await, 1000 - 50);
}
