#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Feed client against a local WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use market_ingest::infrastructure::binance::ReconnectConfig;
use market_ingest::{
    FeedClient, FeedClientConfig, FeedClientError, FeedConnectionState, MarketEvent,
};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const AGG_TRADE: &str = r#"{"e":"aggTrade","E":1700000000123,"a":5933014,"s":"BTCUSDT","p":"43250.10","q":"0.015","f":100,"l":105,"T":1700000000120,"m":true}"#;

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

/// Read frames until a text request arrives and return it as JSON.
async fn next_request(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            _ => continue,
        }
    }
}

fn config(url: &str) -> FeedClientConfig {
    let mut config = FeedClientConfig::new(url, vec!["btcusdt@aggTrade".to_string()]);
    config.reconnect = ReconnectConfig::fixed(Duration::from_millis(20), 3);
    config.connect_timeout = Duration::from_secs(2);
    config
}

async fn wait_for_state(client: &FeedClient, state: FeedConnectionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn subscribes_and_forwards_trades() {
    let (listener, url) = listen().await;
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let client = Arc::new(FeedClient::new(config(&url), tx, cancel.clone()));
    let running = tokio::spawn(Arc::clone(&client).run());

    let mut ws = accept(&listener).await;
    let request = next_request(&mut ws).await;
    assert_eq!(request["method"], "SUBSCRIBE");
    assert_eq!(request["params"][0], "btcusdt@aggTrade");

    let id = request["id"].as_u64().unwrap();
    ws.send(Message::Text(format!(r#"{{"result":null,"id":{id}}}"#).into()))
        .await
        .unwrap();
    ws.send(Message::Text("{not json".into())).await.unwrap();
    ws.send(Message::Text(
        r#"{"e":"markPriceUpdate","E":1700000000000,"s":"BTCUSDT","p":"43251.00"}"#.into(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text(AGG_TRADE.into())).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let MarketEvent::AggTrade(trade) = event else {
        panic!("expected aggregate trade");
    };
    assert_eq!(trade.symbol, "BTCUSDT");
    assert_eq!(trade.agg_trade_id, 5_933_014);
    assert!(trade.buyer_is_maker);

    let feed = client.feed_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        while feed.get_events_forwarded() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(feed.get_state(), FeedConnectionState::Connected);
    assert_eq!(feed.get_messages_received(), 4);
    assert_eq!(feed.get_malformed(), 1);
    assert_eq!(feed.get_ignored(), 1);
    assert_eq!(feed.get_events_forwarded(), 1);

    cancel.cancel();
    assert!(running.await.unwrap().is_ok());
    assert_eq!(client.state(), FeedConnectionState::Stopped);
}

#[tokio::test]
async fn resubscribes_after_server_closes_connection() {
    let (listener, url) = listen().await;
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let client = Arc::new(FeedClient::new(config(&url), tx, cancel.clone()));
    let running = tokio::spawn(Arc::clone(&client).run());

    let mut first = accept(&listener).await;
    next_request(&mut first).await;
    client.subscribe(vec!["ethusdt@trade".to_string()]);
    let live = next_request(&mut first).await;
    assert_eq!(live["params"][0], "ethusdt@trade");
    first.close(None).await.unwrap();

    let mut second = accept(&listener).await;
    let resubscribe = next_request(&mut second).await;
    let streams: Vec<&str> = resubscribe["params"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(streams, vec!["btcusdt@aggTrade", "ethusdt@trade"]);

    second.send(Message::Text(AGG_TRADE.into())).await.unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.symbol(), "BTCUSDT");
    assert!(client.feed_state().get_reconnects() >= 1);

    cancel.cancel();
    assert!(running.await.unwrap().is_ok());
}

#[tokio::test]
async fn gives_up_after_max_reconnect_attempts() {
    let (listener, url) = listen().await;
    drop(listener);

    let (tx, _rx) = mpsc::channel(1);
    let client = Arc::new(FeedClient::new(config(&url), tx, CancellationToken::new()));

    let result = tokio::time::timeout(Duration::from_secs(5), Arc::clone(&client).run())
        .await
        .unwrap();

    assert!(matches!(
        result,
        Err(FeedClientError::MaxReconnectAttemptsExceeded(3))
    ));
    assert_eq!(client.state(), FeedConnectionState::Stopped);
    assert!(client.feed_state().get_last_error().is_some());
}

#[tokio::test]
async fn cancel_while_waiting_to_reconnect_stops_cleanly() {
    let (listener, url) = listen().await;
    drop(listener);

    let (tx, _rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let mut config = config(&url);
    config.reconnect = ReconnectConfig::fixed(Duration::from_secs(60), 0);
    let client = Arc::new(FeedClient::new(config, tx, cancel.clone()));
    let running = tokio::spawn(Arc::clone(&client).run());

    wait_for_state(&client, FeedConnectionState::Reconnecting).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(client.state(), FeedConnectionState::Stopped);
}
