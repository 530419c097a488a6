// WebSocket subscription server: streams committed auction events to
// connected observers.
//
// The read side of a connection accepts only subscribe/unsubscribe
// frames; all state changes travel through the service API, so a socket
// can observe an auction but never mutate one.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::{SplitSink, Stream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::auction::service::AuctionService;
use crate::error::ServiceError;
use crate::hub::ObserverId;
use crate::protocol::{self, ClientMessage, ErrorFrame};

/// Run the WebSocket server on the given port.
///
/// Binds a TCP listener on `127.0.0.1:{port}` and spawns one task per
/// accepted connection. Each client subscribes to auction channels and
/// receives a point-in-time snapshot followed by committed events. The
/// server runs forever (until the task is cancelled or the process
/// exits).
pub async fn run(port: u16, service: Arc<AuctionService>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    let local_addr = listener.local_addr()?;
    info!("WebSocket server listening on {local_addr}");

    loop {
        let (stream, addr) = listener.accept().await?;
        let addr_str = addr.to_string();
        info!("Accepted TCP connection from {addr_str}");

        let service = service.clone();
        tokio::spawn(async move {
            let ws_stream = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake failed for {addr_str}: {e}");
                    return;
                }
            };
            handle_connection(ws_stream, service, &addr_str).await;
        });
    }
}

/// Serve one connection until the peer goes away, then release every
/// subscription it held.
async fn handle_connection<S>(
    ws_stream: WebSocketStream<S>,
    service: Arc<AuctionService>,
    addr: &str,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (write, read) = ws_stream.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(forward_outgoing(out_rx, write));

    let mut conn = ConnectionState::new(service, out_tx);
    process_message_stream(read, &mut conn, addr).await;

    conn.release();
    drop(conn); // last outgoing sender; the writer task drains and ends
    let _ = writer.await;
    info!("Connection from {addr} closed");
}

/// Process raw WebSocket [`Message`] items from any [`Stream`],
/// dispatching text frames to the connection state. Generic over the
/// stream type so it can be tested with in-memory streams without
/// opening TCP ports.
async fn process_message_stream<St>(mut stream: St, conn: &mut ConnectionState, addr: &str)
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => conn.handle_text(&text, addr),
            Ok(Message::Close(_)) => {
                info!("Client {addr} sent close frame");
                break;
            }
            Err(e) => {
                warn!("WebSocket error from {addr}: {e}");
                break;
            }
            _ => {
                // Ignore Binary, Ping, Pong, Frame variants.
            }
        }
    }
}

/// Drain serialized frames into the WebSocket sink. Ends when every
/// sender is gone or the peer stops accepting writes.
async fn forward_outgoing<S>(
    mut rx: mpsc::UnboundedReceiver<String>,
    mut write: SplitSink<WebSocketStream<S>, Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(json) = rx.recv().await {
        if write.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }
    let _ = write.close().await;
}

/// Per-connection subscription bookkeeping.
struct ConnectionState {
    service: Arc<AuctionService>,
    out_tx: mpsc::UnboundedSender<String>,
    /// auction id -> (hub observer handle, event-forwarding task)
    subscriptions: HashMap<String, (ObserverId, tokio::task::JoinHandle<()>)>,
}

impl ConnectionState {
    fn new(service: Arc<AuctionService>, out_tx: mpsc::UnboundedSender<String>) -> Self {
        ConnectionState {
            service,
            out_tx,
            subscriptions: HashMap::new(),
        }
    }

    /// Handle one text frame from the client.
    fn handle_text(&mut self, text: &str, addr: &str) {
        let msg = match protocol::parse_client_message(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Malformed message from {addr}: {e}");
                self.send_frame(&ErrorFrame::malformed());
                return;
            }
        };
        match msg {
            ClientMessage::Subscribe { auction_id } => self.subscribe(&auction_id),
            ClientMessage::Unsubscribe { auction_id } => self.unsubscribe(&auction_id),
        }
    }

    fn subscribe(&mut self, auction_id: &str) {
        // Re-subscribing replaces the old stream with a fresh snapshot.
        self.unsubscribe(auction_id);

        match self.service.subscribe(auction_id) {
            Ok((observer, mut rx)) => {
                let out = self.out_tx.clone();
                let handle = tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        let Ok(json) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if out.send(json).is_err() {
                            break;
                        }
                    }
                });
                self.subscriptions
                    .insert(auction_id.to_string(), (observer, handle));
            }
            Err(err) => self.send_error(&err),
        }
    }

    fn unsubscribe(&mut self, auction_id: &str) {
        if let Some((observer, handle)) = self.subscriptions.remove(auction_id) {
            self.service.unsubscribe(auction_id, observer);
            handle.abort();
        }
    }

    /// Release every subscription held by this connection.
    fn release(&mut self) {
        let auction_ids: Vec<String> = self.subscriptions.keys().cloned().collect();
        for auction_id in auction_ids {
            self.unsubscribe(&auction_id);
        }
    }

    fn send_error(&self, err: &ServiceError) {
        self.send_frame(&ErrorFrame::from_error(err));
    }

    fn send_frame(&self, frame: &ErrorFrame) {
        if let Ok(json) = serde_json::to_string(frame) {
            let _ = self.out_tx.send(json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, ManagerAuthorizer, Role};
    use crate::db::Database;
    use crate::hub::BroadcastHub;
    use futures_util::stream;
    use tokio_tungstenite::tungstenite::Error as WsError;

    /// Helper: engine with one funded team, one player, and one ongoing
    /// auction; returns the service and the auction id.
    fn test_service() -> (Arc<AuctionService>, String) {
        let db = Arc::new(Database::open(":memory:").unwrap());
        db.upsert_team("team_1", "Vorticists", "mgr_1", Some(10_000))
            .unwrap();
        db.upsert_player("p1", "Player One", 100).unwrap();
        let service = Arc::new(AuctionService::new(
            db,
            Arc::new(BroadcastHub::new()),
            Arc::new(ManagerAuthorizer),
            100,
        ));
        let auction = service.create("Test Lot", None, "p1", None).unwrap();
        service.start(&auction.id).unwrap();
        (service, auction.id)
    }

    fn manager() -> Identity {
        Identity::new("mgr_1", Role::TeamManager)
    }

    /// Helper: create a stream of Message results from a vec.
    fn mock_stream(
        messages: Vec<Result<Message, WsError>>,
    ) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        stream::iter(messages)
    }

    #[tokio::test]
    async fn subscribe_delivers_snapshot_then_events() {
        let (service, auction_id) = test_service();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut conn = ConnectionState::new(service.clone(), out_tx);

        conn.handle_text(
            &format!(r#"{{"type":"subscribe","auction_id":"{auction_id}"}}"#),
            "test",
        );

        let snapshot: serde_json::Value =
            serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
        assert_eq!(snapshot["type"], "snapshot");
        assert_eq!(snapshot["auction_id"], auction_id);
        assert_eq!(snapshot["status"], "ongoing");

        service
            .place_bid(&auction_id, "team_1", 500, None, &manager())
            .unwrap();
        let event: serde_json::Value =
            serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
        assert_eq!(event["type"], "bid_placed");
        assert_eq!(event["current_bid"], 500);
    }

    #[tokio::test]
    async fn subscribe_unknown_auction_sends_error_frame() {
        let (service, _) = test_service();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut conn = ConnectionState::new(service, out_tx);

        conn.handle_text(r#"{"type":"subscribe","auction_id":"ghost"}"#, "test");

        let frame: serde_json::Value =
            serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["code"], "not_found");
    }

    #[tokio::test]
    async fn malformed_message_sends_error_frame() {
        let (service, _) = test_service();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut conn = ConnectionState::new(service, out_tx);

        conn.handle_text("{{{", "test");

        let frame: serde_json::Value =
            serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["code"], "invalid_argument");
    }

    #[tokio::test]
    async fn unsubscribe_stops_the_stream() {
        let (service, auction_id) = test_service();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut conn = ConnectionState::new(service.clone(), out_tx);

        conn.handle_text(
            &format!(r#"{{"type":"subscribe","auction_id":"{auction_id}"}}"#),
            "test",
        );
        let _snapshot = out_rx.recv().await.unwrap();

        conn.handle_text(
            &format!(r#"{{"type":"unsubscribe","auction_id":"{auction_id}"}}"#),
            "test",
        );
        assert_eq!(
            service.observer_count(&auction_id),
            0,
        );

        service
            .place_bid(&auction_id, "team_1", 500, None, &manager())
            .unwrap();
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_frame_stops_processing() {
        let (service, auction_id) = test_service();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut conn = ConnectionState::new(service, out_tx);

        let messages = vec![
            Ok(Message::Text(
                format!(r#"{{"type":"subscribe","auction_id":"{auction_id}"}}"#).into(),
            )),
            Ok(Message::Close(None)),
            Ok(Message::Text(r#"{"type":"subscribe","auction_id":"ghost"}"#.into())),
        ];
        process_message_stream(mock_stream(messages), &mut conn, "test").await;

        // The pre-close subscribe produced a snapshot; the post-close
        // frame was never processed, so no error frame follows.
        let snapshot: serde_json::Value =
            serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
        assert_eq!(snapshot["type"], "snapshot");
        assert!(out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn release_unsubscribes_everything() {
        let (service, auction_id) = test_service();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let mut conn = ConnectionState::new(service.clone(), out_tx);

        conn.handle_text(
            &format!(r#"{{"type":"subscribe","auction_id":"{auction_id}"}}"#),
            "test",
        );
        assert_eq!(service.observer_count(&auction_id), 1);

        conn.release();
        assert_eq!(service.observer_count(&auction_id), 0);
    }
}
