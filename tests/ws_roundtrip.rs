use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use servesync_sync::{
    cache::QueryCache, config::ChannelConfig, synchronizer::CacheSynchronizer,
    transport::WsConnector, CacheKey, ChannelClient, ChannelError, ConnectionState,
    EventEnvelope, Topic,
};
use tokio::{net::TcpListener, sync::mpsc};

async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(serve_socket)
}

async fn reply(socket: &mut WebSocket, frame: Value) -> bool {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .is_ok()
}

async fn serve_socket(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };

        let ok = match frame["type"].as_str() {
            Some("auth") if frame["token"] == "good" => {
                reply(&mut socket, json!({ "type": "auth_ok", "user_id": "cust-1" })).await
            }
            Some("auth") => {
                reply(&mut socket, json!({ "type": "auth_rejected", "reason": "bad token" })).await
            }
            Some("subscribe") => {
                let topic = frame["topic"].clone();
                reply(&mut socket, json!({ "type": "subscribed", "topic": topic })).await
                    && reply(
                        &mut socket,
                        json!({
                            "type": "event",
                            "topic": topic,
                            "seq": 1,
                            "event": {
                                "type": "order_status_changed",
                                "order_id": "order-1",
                                "status": "preparing",
                                "order": { "id": "order-1", "status": "preparing" }
                            }
                        }),
                    )
                    .await
            }
            Some("ping") => {
                reply(&mut socket, json!({ "type": "pong", "nonce": frame["nonce"] })).await
            }
            _ => true,
        };

        if !ok {
            break;
        }
    }
}

async fn spawn_server() -> SocketAddr {
    let app = Router::new().route("/ws", get(ws_handler));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client(addr: SocketAddr) -> (ChannelClient, Arc<QueryCache>) {
    let cache = Arc::new(QueryCache::new());
    let sync = Arc::new(CacheSynchronizer::new(cache.clone()));
    let connector = Arc::new(WsConnector::new(format!("ws://{addr}/ws")));
    (
        ChannelClient::new(ChannelConfig::default(), connector, sync),
        cache,
    )
}

#[tokio::test]
async fn subscribed_events_patch_cache_and_reach_handler() {
    let addr = spawn_server().await;
    let (client, cache) = client(addr);
    let (tx, mut rx) = mpsc::unbounded_channel();

    client.connect("good").await.unwrap();
    assert_eq!(client.status().state, ConnectionState::Authenticated);

    client
        .registry()
        .subscribe(Topic::order("order-1"), move |ev: &EventEnvelope| -> anyhow::Result<()> {
            tx.send(ev.clone())?;
            Ok(())
        });

    let event = rx.recv().await.unwrap();
    assert_eq!(event.topic, Topic::order("order-1"));
    assert_eq!(event.seq, 1);
    assert_eq!(
        cache.value(&CacheKey::order("order-1")).await.unwrap()["status"],
        "preparing"
    );

    client.disconnect().await;
    assert_eq!(client.status().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn bad_token_is_an_authentication_error() {
    let addr = spawn_server().await;
    let (client, _cache) = client(addr);

    let err = client.connect("bad").await.unwrap_err();
    assert!(matches!(err, ChannelError::Authentication(ref reason) if reason == "bad token"));
    assert_eq!(client.status().state, ConnectionState::Failed);
}

#[tokio::test]
async fn unreachable_endpoint_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let (client, _cache) = client(addr);

    let err = client.connect("good").await.unwrap_err();
    assert!(matches!(err, ChannelError::Connection(_)));
}
