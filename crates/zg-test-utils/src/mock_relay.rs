// mock_relay: An in-process relay WebSocket server for gateway tests.
//
// Binds to port 0 (random) and exposes the bound URL.  Each test spins up
// its own isolated instance.
//
// # Behavior
// - `["REQ", sub_id, ...]` registers the subscription and answers EOSE.
// - Events injected via `inject` are delivered to every connection with a
//   registered subscription as `["EVENT", sub_id, event]`.
// - `["EVENT", event]` publishes are recorded and acked `["OK", id, true]`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::Message;
use zg_protocol::{ClientFrame, Event, RelayFrame};

pub struct MockRelay {
    addr: SocketAddr,
    published: Arc<Mutex<Vec<Event>>>,
    subscribers: Arc<AtomicUsize>,
    inject_tx: broadcast::Sender<Event>,
    kill_tx: broadcast::Sender<()>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockRelay {
    /// Start the mock relay on a random port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let published = Arc::new(Mutex::new(Vec::new()));
        let subscribers = Arc::new(AtomicUsize::new(0));
        let (inject_tx, _) = broadcast::channel(256);
        let (kill_tx, _) = broadcast::channel(4);

        let task = {
            let published = Arc::clone(&published);
            let subscribers = Arc::clone(&subscribers);
            let inject_tx = inject_tx.clone();
            let kill_tx = kill_tx.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _peer)) => {
                            let published = Arc::clone(&published);
                            let subscribers = Arc::clone(&subscribers);
                            let inject_rx = inject_tx.subscribe();
                            let kill_rx = kill_tx.subscribe();
                            tokio::spawn(async move {
                                let _ = handle_connection(
                                    stream,
                                    published,
                                    subscribers,
                                    inject_rx,
                                    kill_rx,
                                )
                                .await;
                            });
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        Ok(Self {
            addr,
            published,
            subscribers,
            inject_tx,
            kill_tx,
            _task: task,
        })
    }

    /// Drop every open connection, forcing clients into their reconnect
    /// path.  The listener stays up, so reconnects succeed.
    pub fn close_connections(&self) {
        let _ = self.kill_tx.send(());
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Deliver `event` to every subscribed connection.
    pub fn inject(&self, event: Event) {
        let _ = self.inject_tx.send(event);
    }

    /// Everything clients have published, in arrival order.
    pub fn published(&self) -> Vec<Event> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_of_kind(&self, kind: u32) -> Vec<Event> {
        self.published()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    /// Wait until a client has subscribed (sent REQ), or panic on timeout.
    pub async fn wait_for_subscriber(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.subscribers.load(Ordering::SeqCst) == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no client subscribed within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until at least `count` events of `kind` were published.
    pub async fn wait_for_published(
        &self,
        kind: u32,
        count: usize,
        timeout: Duration,
    ) -> Vec<Event> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let matching = self.published_of_kind(kind);
            if matching.len() >= count {
                return matching;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {count} published events of kind {kind} within {timeout:?}, \
                 got {} (all published: {:?})",
                matching.len(),
                self.published()
                    .iter()
                    .map(|e| e.kind)
                    .collect::<Vec<_>>()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    published: Arc<Mutex<Vec<Event>>>,
    subscribers: Arc<AtomicUsize>,
    mut inject_rx: broadcast::Receiver<Event>,
    mut kill_rx: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    let mut sub_id: Option<String> = None;
    let mut counted = false;

    loop {
        tokio::select! {
            _ = kill_rx.recv() => {
                let _ = ws.close(None).await;
                break;
            }
            injected = inject_rx.recv() => {
                match injected {
                    Ok(event) => {
                        if let Some(sub) = &sub_id {
                            let frame = RelayFrame::Event { sub_id: sub.clone(), event };
                            ws.send(Message::Text(serde_json::to_string(&frame)?.into())).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = ws.next() => {
                let msg = match msg {
                    None => break,
                    Some(Err(_)) => break,
                    Some(Ok(msg)) => msg,
                };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    Message::Ping(data) => {
                        ws.send(Message::Pong(data)).await?;
                        continue;
                    }
                    _ => continue,
                };
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Req { sub_id: requested, .. }) => {
                        sub_id = Some(requested.clone());
                        if !counted {
                            counted = true;
                            subscribers.fetch_add(1, Ordering::SeqCst);
                        }
                        let eose = RelayFrame::Eose { sub_id: requested };
                        ws.send(Message::Text(serde_json::to_string(&eose)?.into())).await?;
                    }
                    Ok(ClientFrame::Event(event)) => {
                        let ok = RelayFrame::Ok {
                            event_id: event.id.clone(),
                            accepted: true,
                            message: String::new(),
                        };
                        published.lock().unwrap().push(event);
                        ws.send(Message::Text(serde_json::to_string(&ok)?.into())).await?;
                    }
                    Ok(ClientFrame::Close { .. }) => {
                        sub_id = None;
                    }
                    Err(_) => {}
                }
            }
        }
    }

    if counted {
        subscribers.fetch_sub(1, Ordering::SeqCst);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_signer::FakeSigner;
    use crate::fixtures::note_event;
    use zg_protocol::{Filter, Signer};

    #[tokio::test]
    async fn subscribe_inject_and_publish_round_trip() {
        let relay = MockRelay::start().await.unwrap();
        let (ws, _) = tokio_tungstenite::connect_async(relay.url()).await.unwrap();
        let (mut write, mut read) = ws.split();

        // Subscribe.
        let req = ClientFrame::Req {
            sub_id: "test-sub".to_owned(),
            filters: vec![Filter::default()],
        };
        write
            .send(Message::Text(serde_json::to_string(&req).unwrap().into()))
            .await
            .unwrap();
        relay.wait_for_subscriber(Duration::from_secs(2)).await;

        // First frame back is EOSE.
        let frame: RelayFrame = match read.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };
        assert!(matches!(frame, RelayFrame::Eose { .. }));

        // Injected events arrive on the subscription.
        let alice = FakeSigner::new("alice");
        let event = note_event(&alice, &FakeSigner::new("bot").public_key(), "hi", 100);
        relay.inject(event.clone());
        let frame: RelayFrame = match read.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };
        match frame {
            RelayFrame::Event { sub_id, event: received } => {
                assert_eq!(sub_id, "test-sub");
                assert_eq!(received, event);
            }
            other => panic!("expected EVENT, got {other:?}"),
        }

        // Publishes are recorded and acked.
        let reply = note_event(&alice, "someone", "reply", 101);
        write
            .send(Message::Text(
                serde_json::to_string(&ClientFrame::Event(reply.clone()))
                    .unwrap()
                    .into(),
            ))
            .await
            .unwrap();
        let published = relay
            .wait_for_published(1, 1, Duration::from_secs(2))
            .await;
        assert_eq!(published[0], reply);
        let frame: RelayFrame = match read.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };
        assert!(matches!(frame, RelayFrame::Ok { accepted: true, .. }));
    }
}
