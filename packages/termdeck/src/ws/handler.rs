//! WebSocket Handler
//!
//! One connection carries every session the client has attached. The
//! registry queues messages for the connection; the sender task writes them
//! out while the input task applies client frames.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::metrics::ServerMetrics;
use crate::session_registry::SessionRegistry;

use super::dispatch::ConnectionContext;

pub async fn handle_connection(
    socket: WebSocket,
    registry: SessionRegistry,
    metrics: Arc<ServerMetrics>,
    owner_id: String,
) {
    let (conn_id, mut rx) = registry.register_connection(&owner_id).await;
    metrics.connection_opened();
    info!(conn_id = %conn_id, owner = %owner_id, "WebSocket connection opened");

    let ctx = ConnectionContext::new(conn_id.clone(), owner_id, registry.clone(), metrics.clone());
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let sender_metrics = metrics.clone();
    let sender_task = async move {
        while let Some(msg) = rx.recv().await {
            let json = match msg.to_frame() {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
            sender_metrics.message_sent();
        }
        let _ = ws_sender.close().await;
    };

    let input_task = async {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => ctx.handle_frame(text.as_str()).await,
                Ok(Message::Binary(_)) => {
                    ctx.metrics.protocol_error();
                    ctx.reply_error(None, "binary frames are not supported".to_string())
                        .await;
                }
                Ok(Message::Close(_)) => {
                    debug!(conn_id = %ctx.conn_id, "Client closed connection");
                    break;
                }
                Err(e) => {
                    debug!(conn_id = %ctx.conn_id, "WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(conn_id = %conn_id, "Sender task ended"),
        _ = input_task => debug!(conn_id = %conn_id, "Input task ended"),
    }

    registry.disconnect(&conn_id).await;
    metrics.connection_closed();
    info!(conn_id = %conn_id, "WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use termdeck_protocol::{ClientMessage, ServerMessage};
    use tokio_tungstenite::tungstenite::{self, Message};

    use crate::test_helpers::test_app_state;

    async fn serve(state: crate::AppState) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::app_router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    type Socket = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn send(ws: &mut Socket, msg: ClientMessage) {
        ws.send(Message::Text(msg.to_frame().unwrap().into()))
            .await
            .unwrap();
    }

    async fn next_message(ws: &mut Socket) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = frame {
                return ServerMessage::from_frame(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_upgrade_without_token_is_401() {
        let (state, _spawner, _tmp) = test_app_state();
        let addr = serve(state).await;
        let err = tokio_tungstenite::connect_async(format!("ws://{}/api/ws", addr))
            .await
            .unwrap_err();
        match err {
            tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 401),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attach_output_input_over_socket() {
        let (state, spawner, tmp) = test_app_state();
        let registry = state.registry.clone();
        let id = registry.create("alice", tmp.path(), None).await.unwrap().session_id;
        spawner.process(0).emit(b"$ ");
        let addr = serve(state).await;

        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{}/api/ws?token=alice-token", addr))
                .await
                .unwrap();

        send(
            &mut ws,
            ClientMessage::Attach {
                session_id: id.clone(),
                since: None,
            },
        )
        .await;
        assert_eq!(
            next_message(&mut ws).await,
            ServerMessage::Attached {
                session_id: id.clone(),
                offset: 0
            }
        );
        assert_eq!(
            next_message(&mut ws).await,
            ServerMessage::Output {
                session_id: id.clone(),
                offset: 0,
                data: b"$ ".to_vec()
            }
        );

        send(
            &mut ws,
            ClientMessage::Input {
                session_id: id.clone(),
                data: b"ls\r".to_vec(),
            },
        )
        .await;
        let process = spawner.process(0);
        tokio::time::timeout(Duration::from_secs(2), async {
            while process.input().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(process.input(), b"ls\r");

        process.emit(b"file.txt\r\n");
        assert_eq!(
            next_message(&mut ws).await,
            ServerMessage::Output {
                session_id: id.clone(),
                offset: 2,
                data: b"file.txt\r\n".to_vec()
            }
        );

        registry.destroy(&id, Some("alice")).await.unwrap();
        assert_eq!(
            next_message(&mut ws).await,
            ServerMessage::Closed { session_id: id }
        );
    }

    #[tokio::test]
    async fn test_foreign_session_over_socket() {
        let (state, spawner, tmp) = test_app_state();
        let id = state
            .registry
            .create("alice", tmp.path(), None)
            .await
            .unwrap()
            .session_id;
        let addr = serve(state).await;

        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{}/api/ws?token=bob-token", addr))
                .await
                .unwrap();
        send(
            &mut ws,
            ClientMessage::Resize {
                session_id: id.clone(),
                cols: 10,
                rows: 10,
            },
        )
        .await;
        match next_message(&mut ws).await {
            ServerMessage::Error { session_id, message } => {
                assert_eq!(session_id.as_deref(), Some(id.as_str()));
                assert_eq!(message, termdeck_protocol::SESSION_NOT_FOUND);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(spawner.process(0).sizes().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_releases_connection() {
        let (state, _spawner, _tmp) = test_app_state();
        let metrics = state.metrics.clone();
        let addr = serve(state).await;

        let (mut ws, _) =
            tokio_tungstenite::connect_async(format!("ws://{}/api/ws?token=alice-token", addr))
                .await
                .unwrap();
        ws.close(None).await.unwrap();
        drop(ws);

        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = metrics.snapshot();
                if snapshot.connections.total == 1 && snapshot.connections.active == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok());
    }
}
