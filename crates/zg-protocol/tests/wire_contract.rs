/// Wire contract tests: serialize each frame, re-parse, and check the JSON
/// shape against the frozen array form a relay expects.
use serde_json::{Value, json};
use zg_protocol::{ClientFrame, Event, Filter, RelayFrame, event_id, kinds};

fn sample_event() -> Event {
    let pubkey = "e".repeat(64);
    let tags = vec![
        vec!["p".to_owned(), "f".repeat(64)],
        vec!["session".to_owned(), "travel-plans".to_owned()],
    ];
    let id = event_id(&pubkey, 1_720_000_000, kinds::DIRECT_MESSAGE, &tags, "ct?iv=abcd");
    Event {
        id,
        pubkey,
        created_at: 1_720_000_000,
        kind: kinds::DIRECT_MESSAGE,
        tags,
        content: "ct?iv=abcd".to_owned(),
        sig: "9".repeat(128),
    }
}

fn round_trip_client(frame: &ClientFrame) -> Value {
    let text = serde_json::to_string(frame).unwrap();
    let reparsed: ClientFrame = serde_json::from_str(&text).unwrap();
    assert_eq!(&reparsed, frame, "client frame round-trip mismatch");
    serde_json::from_str(&text).unwrap()
}

fn round_trip_relay(frame: &RelayFrame) -> Value {
    let text = serde_json::to_string(frame).unwrap();
    let reparsed: RelayFrame = serde_json::from_str(&text).unwrap();
    assert_eq!(&reparsed, frame, "relay frame round-trip mismatch");
    serde_json::from_str(&text).unwrap()
}

#[test]
fn req_frame_is_verb_subid_filters() {
    let filter = Filter::addressed_to(&"a".repeat(64), 1_720_000_000);
    let value = round_trip_client(&ClientFrame::Req {
        sub_id: "zap-sub".to_owned(),
        filters: vec![filter],
    });

    let arr = value.as_array().unwrap();
    assert_eq!(arr[0], json!("REQ"));
    assert_eq!(arr[1], json!("zap-sub"));
    // The filter must use the wire field names, including "#p".
    let filter = arr[2].as_object().unwrap();
    assert_eq!(filter["kinds"], json!([1, 4, 1006, 9735]));
    assert_eq!(filter["#p"], json!(["a".repeat(64)]));
    assert_eq!(filter["since"], json!(1_720_000_000));
    assert!(!filter.contains_key("authors"), "unset fields must be omitted");
}

#[test]
fn publish_frame_is_verb_event_object() {
    let event = sample_event();
    let value = round_trip_client(&ClientFrame::Event(event.clone()));
    let arr = value.as_array().unwrap();
    assert_eq!(arr[0], json!("EVENT"));
    assert_eq!(arr[1]["id"], json!(event.id));
    assert_eq!(arr[1]["kind"], json!(4));
    assert_eq!(arr[1]["tags"][1][0], json!("session"));
}

#[test]
fn close_frame_round_trips() {
    let value = round_trip_client(&ClientFrame::Close {
        sub_id: "zap-sub".to_owned(),
    });
    assert_eq!(value, json!(["CLOSE", "zap-sub"]));
}

#[test]
fn inbound_event_frame_round_trips() {
    let event = sample_event();
    let value = round_trip_relay(&RelayFrame::Event {
        sub_id: "zap-sub".to_owned(),
        event: event.clone(),
    });
    let arr = value.as_array().unwrap();
    assert_eq!(arr[0], json!("EVENT"));
    assert_eq!(arr[1], json!("zap-sub"));
    assert_eq!(arr[2]["pubkey"], json!(event.pubkey));
}

#[test]
fn eose_ok_closed_notice_round_trip() {
    assert_eq!(
        round_trip_relay(&RelayFrame::Eose {
            sub_id: "s".to_owned()
        }),
        json!(["EOSE", "s"])
    );
    assert_eq!(
        round_trip_relay(&RelayFrame::Ok {
            event_id: "abc".to_owned(),
            accepted: true,
            message: String::new(),
        }),
        json!(["OK", "abc", true, ""])
    );
    assert_eq!(
        round_trip_relay(&RelayFrame::Closed {
            sub_id: "s".to_owned(),
            message: "rate limited".to_owned(),
        }),
        json!(["CLOSED", "s", "rate limited"])
    );
    assert_eq!(
        round_trip_relay(&RelayFrame::Notice {
            message: "hello".to_owned(),
        }),
        json!(["NOTICE", "hello"])
    );
}

#[test]
fn ok_frame_tolerates_missing_message() {
    let frame: RelayFrame = serde_json::from_str(r#"["OK","abc",false]"#).unwrap();
    assert_eq!(
        frame,
        RelayFrame::Ok {
            event_id: "abc".to_owned(),
            accepted: false,
            message: String::new(),
        }
    );
}

#[test]
fn event_parses_from_relay_literal() {
    // Literal frame as a relay would send it, not produced by this crate.
    let text = r#"["EVENT","sub1",{"id":"00","pubkey":"ab","created_at":1720000000,"kind":9735,"tags":[["bolt11","lnbc1..."],["description","{}"]],"content":"","sig":"ff"}]"#;
    let frame: RelayFrame = serde_json::from_str(text).unwrap();
    match frame {
        RelayFrame::Event { sub_id, event } => {
            assert_eq!(sub_id, "sub1");
            assert_eq!(event.kind(), zg_protocol::EventKind::PaymentReceipt);
            assert_eq!(event.tag_value("bolt11"), Some("lnbc1..."));
        }
        other => panic!("expected EVENT, got {other:?}"),
    }
}
