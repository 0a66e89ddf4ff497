//! A single relay subscription session.
//!
//! Generic over the WebSocket stream so tests can drive it with an
//! in-process duplex.  The loop subscribes with the standing filters,
//! multiplexes inbound frames to the dispatcher, and drains the outbound
//! publish channel onto the same socket.

use crate::dispatcher::Dispatcher;
use crate::supervisor::RelayRegistry;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use zg_protocol::{ClientFrame, Filter, RelayFrame};

/// The single standing subscription id this gateway uses everywhere.
pub const SUBSCRIPTION_ID: &str = "zapgate";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("WS: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a session loop returned.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// Shutdown signal observed; the supervisor must not reconnect.
    Shutdown,
    /// The socket closed or the peer went away.
    StreamClosed,
    /// The relay terminated our subscription.
    SubscriptionClosed(String),
}

pub async fn run_relay_session<S>(
    mut ws: S,
    url: &str,
    filters: &[Filter],
    outbound_rx: &mut mpsc::Receiver<ClientFrame>,
    dispatcher: &Dispatcher,
    registry: &RelayRegistry,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SessionEnd, RelayError>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let req = ClientFrame::Req {
        sub_id: SUBSCRIPTION_ID.to_owned(),
        filters: filters.to_vec(),
    };
    ws.send(Message::Text(serde_json::to_string(&req)?.into()))
        .await?;

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(SessionEnd::Shutdown);
                }
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        ws.send(Message::Text(serde_json::to_string(&frame)?.into())).await?;
                        registry.record_out(url);
                    }
                    // The publish side is gone; the process is tearing down.
                    None => return Ok(SessionEnd::Shutdown),
                }
            }
            msg = ws.next() => {
                match msg {
                    None => return Ok(SessionEnd::StreamClosed),
                    Some(Err(e)) => return Err(RelayError::Ws(e)),
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RelayFrame>(&text) {
                            Ok(RelayFrame::Event { sub_id, event }) => {
                                if sub_id != SUBSCRIPTION_ID {
                                    debug!(relay = %url, sub = %sub_id, "event for unknown subscription");
                                    continue;
                                }
                                registry.record_event_in(url);
                                dispatcher.dispatch(event, url);
                            }
                            Ok(RelayFrame::Eose { .. }) => {
                                debug!(relay = %url, "end of stored events");
                            }
                            Ok(RelayFrame::Ok { event_id, accepted, message }) => {
                                if accepted {
                                    debug!(relay = %url, event = %event_id, "publish acked");
                                } else {
                                    warn!(relay = %url, event = %event_id, message = %message, "publish rejected");
                                }
                            }
                            Ok(RelayFrame::Closed { message, .. }) => {
                                return Ok(SessionEnd::SubscriptionClosed(message));
                            }
                            Ok(RelayFrame::Notice { message }) => {
                                info!(relay = %url, message = %message, "relay notice");
                            }
                            Ok(RelayFrame::Unknown) => {
                                debug!(relay = %url, "ignoring unknown frame");
                            }
                            Err(e) => warn!(relay = %url, error = %e, "frame deserialize"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => return Ok(SessionEnd::StreamClosed),
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
