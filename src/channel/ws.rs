//! WebSocket implementation of the conversation channel.

use crate::channel::protocol::{self, ClientEvent, OutboundMessage};
use crate::channel::{ChannelEvent, ConnectionState, ConversationChannel};
use crate::controller::EventSink;
use crate::defaults::{CHANNEL_RECONNECT_BASE_MS, CHANNEL_RECONNECT_MAX_MS};
use crate::error::{CoraError, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Delay before redial number `attempt` (1-based).
fn reconnect_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    let ms = CHANNEL_RECONNECT_BASE_MS.saturating_mul(1u64 << exp);
    Duration::from_millis(ms.min(CHANNEL_RECONNECT_MAX_MS))
}

/// Channel backed by a WebSocket that is redialed whenever it drops.
///
/// One supervisor task owns the socket. It dials, then pumps the outbound
/// queue and inbound frames until the connection ends, then dials again with
/// exponential backoff. The outbound queue outlives individual connections,
/// so a message sent while disconnected goes out after the next dial.
pub struct WsChannel {
    outbound: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    supervisor: JoinHandle<()>,
}

impl WsChannel {
    /// Start the channel in the `Disconnected` state and dial in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(url: &str, sink: EventSink) -> Self {
        let (outbound, queue) = mpsc::unbounded_channel::<String>();
        let connected = Arc::new(AtomicBool::new(false));
        let supervisor = tokio::spawn(supervise(
            url.to_string(),
            sink,
            queue,
            Arc::clone(&connected),
        ));
        Self {
            outbound,
            connected,
            supervisor,
        }
    }
}

async fn supervise(
    url: String,
    sink: EventSink,
    mut queue: mpsc::UnboundedReceiver<String>,
    connected: Arc<AtomicBool>,
) {
    let mut failures = 0u32;
    loop {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                failures = 0;
                info!(url = %url, "conversation channel connected");
                connected.store(true, Ordering::SeqCst);
                sink.channel(ChannelEvent::Connection(ConnectionState::Connected));

                let owner_gone = pump(socket, &sink, &mut queue).await;

                connected.store(false, Ordering::SeqCst);
                info!("conversation channel disconnected");
                sink.channel(ChannelEvent::Connection(ConnectionState::Disconnected));
                if owner_gone {
                    return;
                }
            }
            Err(e) if failures == 0 => {
                warn!(url = %url, error = %e, "conversation channel unreachable; will keep trying");
            }
            Err(e) => debug!(url = %url, error = %e, attempt = failures, "channel redial failed"),
        }
        failures += 1;
        tokio::time::sleep(reconnect_delay(failures)).await;
    }
}

/// Move frames both ways until the connection ends.
///
/// Returns `true` when the outbound queue is closed, i.e. nobody owns the channel anymore.
async fn pump(
    socket: Socket,
    sink: &EventSink,
    queue: &mut mpsc::UnboundedReceiver<String>,
) -> bool {
    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            frame = queue.recv() => {
                let Some(frame) = frame else {
                    if let Err(e) = ws_tx.close().await {
                        debug!(error = %e, "channel close failed");
                    }
                    return true;
                };
                if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                    warn!(error = %e, "channel write failed");
                    sink.channel(ChannelEvent::Error(format!("send failed: {}", e)));
                    return false;
                }
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => match protocol::decode(text.as_str()) {
                    Ok(event) => sink.channel(event.into()),
                    Err(e) => {
                        warn!(error = %e, "unreadable channel frame");
                        sink.channel(ChannelEvent::Error(format!(
                            "unreadable message from server: {}",
                            e
                        )));
                    }
                },
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "channel read failed");
                    sink.channel(ChannelEvent::Error(format!("connection lost: {}", e)));
                    return false;
                }
            }
        }
    }
}

impl ConversationChannel for WsChannel {
    fn send(&self, message: OutboundMessage) -> Result<()> {
        let frame = protocol::encode(&ClientEvent::SendMessage(message))?;
        self.outbound.send(frame).map_err(|_| CoraError::Channel {
            message: "channel shut down".to_string(),
        })
    }

    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{DriverEvent, Input, event_channel};
    use crate::session::SessionId;
    use tokio::net::TcpListener;

    async fn next_channel_event(inbox: &mut crate::controller::Inbox) -> ChannelEvent {
        let wait = async {
            loop {
                match inbox.recv().await {
                    Some(Input::Event(DriverEvent::Channel(ev))) => return ev,
                    Some(_) => continue,
                    None => panic!("inbox closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("no channel event within 10s")
    }

    fn outbound(id: &str, text: &str) -> OutboundMessage {
        OutboundMessage {
            conversation_id: SessionId::new(id),
            message: text.into(),
            is_scenario_prompt: false,
        }
    }

    /// Answer every send_message on `ws` with a message_response echoing it.
    async fn echo(mut ws: WebSocketStream<TcpStream>) {
        while let Some(Ok(Message::Text(text))) = ws.next().await {
            let sent: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            let reply = serde_json::json!({
                "event": "message_response",
                "conversation_id": sent["conversation_id"],
                "message": {"content": format!("echo: {}", sent["message"].as_str().unwrap())},
            });
            ws.send(Message::Text(reply.to_string().into())).await.unwrap();
        }
    }

    fn reply_content(event: ChannelEvent) -> String {
        match event {
            ChannelEvent::Reply { content, .. } => content,
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_reconnect_delay_doubles_up_to_ceiling() {
        assert_eq!(reconnect_delay(1), Duration::from_millis(500));
        assert_eq!(reconnect_delay(2), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(4), Duration::from_millis(4000));
        assert_eq!(reconnect_delay(50), Duration::from_millis(CHANNEL_RECONNECT_MAX_MS));
    }

    #[tokio::test]
    async fn test_send_and_receive_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let sent: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                let reply = serde_json::json!({
                    "event": "message_response",
                    "conversation_id": sent["conversation_id"],
                    "message": {"content": format!("echo: {}", sent["message"].as_str().unwrap())},
                });
                ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                ws.send(Message::Text("garbage".into())).await.unwrap();
            }
            echo(ws).await;
        });

        let (sink, mut inbox) = event_channel();
        let channel = WsChannel::open(&format!("ws://{}", addr), sink);
        assert_eq!(
            next_channel_event(&mut inbox).await,
            ChannelEvent::Connection(ConnectionState::Connected)
        );
        assert_eq!(channel.state(), ConnectionState::Connected);

        channel.send(outbound("c-9", "Hello")).unwrap();

        match next_channel_event(&mut inbox).await {
            ChannelEvent::Reply {
                conversation_id,
                content,
                ..
            } => {
                assert_eq!(conversation_id.as_str(), "c-9");
                assert_eq!(content, "echo: Hello");
            }
            other => panic!("expected reply, got {:?}", other),
        }
        match next_channel_event(&mut inbox).await {
            ChannelEvent::Error(msg) => assert!(msg.contains("unreadable"), "got {}", msg),
            other => panic!("expected error notice, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_redials_after_server_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            // First connection: accepted, then closed by the server.
            let (tcp, _) = listener.accept().await.unwrap();
            let mut first = tokio_tungstenite::accept_async(tcp).await.unwrap();
            first.close(None).await.unwrap();
            while first.next().await.is_some() {}

            let (tcp, _) = listener.accept().await.unwrap();
            echo(tokio_tungstenite::accept_async(tcp).await.unwrap()).await;
        });

        let (sink, mut inbox) = event_channel();
        let channel = WsChannel::open(&format!("ws://{}", addr), sink);
        assert_eq!(
            next_channel_event(&mut inbox).await,
            ChannelEvent::Connection(ConnectionState::Connected)
        );
        assert_eq!(
            next_channel_event(&mut inbox).await,
            ChannelEvent::Connection(ConnectionState::Disconnected)
        );
        assert_eq!(channel.state(), ConnectionState::Disconnected);

        // Queued while down, delivered over the second connection.
        channel.send(outbound("c-1", "still there?")).unwrap();

        assert_eq!(
            next_channel_event(&mut inbox).await,
            ChannelEvent::Connection(ConnectionState::Connected)
        );
        assert_eq!(reply_content(next_channel_event(&mut inbox).await), "echo: still there?");

        channel.send(outbound("c-1", "and again")).unwrap();
        assert_eq!(reply_content(next_channel_event(&mut inbox).await), "echo: and again");
    }

    #[tokio::test]
    async fn test_starts_disconnected_and_connects_once_server_appears() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let (sink, mut inbox) = event_channel();
        let channel = WsChannel::open(&format!("ws://{}", addr), sink);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        channel.send(outbound("c-2", "hello?")).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            echo(tokio_tungstenite::accept_async(tcp).await.unwrap()).await;
        });

        assert_eq!(
            next_channel_event(&mut inbox).await,
            ChannelEvent::Connection(ConnectionState::Connected)
        );
        assert_eq!(reply_content(next_channel_event(&mut inbox).await), "echo: hello?");
    }
}
