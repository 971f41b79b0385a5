use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::{SinkExt, StreamExt};
use lotusx_fstream::core::config::{ClientOptions, ExchangeConfig};
use lotusx_fstream::core::errors::ExchangeError;
use lotusx_fstream::core::kernel::{StreamSession, WsConnector, WsSink, WsStream};
use lotusx_fstream::core::types::{KlineInterval, StreamEvent, SubscriptionId, SubscriptionState};
use lotusx_fstream::exchanges::binance_perp::builder::connect_socket_with;
use lotusx_fstream::exchanges::binance_perp::{
    BinancePerpCodec, BinancePerpKline, BinancePerpSocketClient, UserDataHandlers, UserDataState,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Server end of an in-memory socket
struct MockServer {
    sent: UnboundedReceiver<Message>,
    inbound: UnboundedSender<Result<Message, ExchangeError>>,
}

impl MockServer {
    /// Next text frame written by the client, parsed as JSON
    async fn next_control(&mut self) -> Value {
        loop {
            let message = timeout(Duration::from_secs(2), self.sent.next())
                .await
                .expect("client sent no control frame")
                .expect("client sink closed");
            if let Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn push(&self, value: Value) {
        self.inbound
            .unbounded_send(Ok(Message::Text(value.to_string())))
            .unwrap();
    }

    fn ack(&self, id: u64) {
        self.push(json!({"result": null, "id": id}));
    }

    /// Accept the next control request and return it
    async fn accept_next(&mut self) -> Value {
        let request = self.next_control().await;
        self.ack(request["id"].as_u64().unwrap());
        request
    }

    /// Close the connection from the server side
    fn close(&self) {
        self.inbound
            .unbounded_send(Ok(Message::Close(None)))
            .unwrap();
    }

    fn has_pending_frames(&mut self) -> bool {
        self.sent.try_next().is_ok()
    }

    /// Text frames written by the client that nobody has read yet
    fn drain_text_frames(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(Some(message)) = self.sent.try_next() {
            if let Message::Text(text) = message {
                frames.push(text);
            }
        }
        frames
    }
}

fn memory_socket() -> (WsSink, WsStream, MockServer) {
    let (client_tx, server_rx) = unbounded::<Message>();
    let (server_tx, client_rx) = unbounded::<Result<Message, ExchangeError>>();
    let sink: WsSink = Box::pin(client_tx.sink_map_err(|_| ExchangeError::ConnectionClosed));
    let stream: WsStream = Box::pin(client_rx);
    (
        sink,
        stream,
        MockServer {
            sent: server_rx,
            inbound: server_tx,
        },
    )
}

fn start_client(response_timeout: Duration) -> (BinancePerpSocketClient, MockServer) {
    let (sink, stream, server) = memory_socket();
    let options = ClientOptions {
        socket_response_timeout: response_timeout,
        ..ClientOptions::default()
    };
    let session = StreamSession::start(sink, stream, BinancePerpCodec, &options, "binance_perp");
    (BinancePerpSocketClient::from_session(session), server)
}

async fn wait_closed(client: &BinancePerpSocketClient) {
    timeout(Duration::from_secs(2), async {
        while !client.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session should notice the closed socket");
}

/// Round-trip a marker stream so every frame pushed before it has been routed
async fn flush(client: &BinancePerpSocketClient, server: &mut MockServer, marker: &str) {
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let topic = format!("{}@marker", marker);
    let (result, _) = tokio::join!(
        client.subscribe(
            vec![topic.clone()],
            move |_: StreamEvent<Value>| {
                let _ = tx.send(());
            },
            &cancel,
        ),
        server.accept_next()
    );
    result.unwrap();
    server.push(json!({"stream": topic, "data": {}}));
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("marker frame never delivered");
}

fn kline_frame(stream: &str, symbol: &str) -> Value {
    json!({
        "stream": stream,
        "data": {
            "e": "kline",
            "E": 1638747660000_i64,
            "s": symbol,
            "k": {
                "t": 1638747660000_i64, "T": 1638747719999_i64, "s": symbol, "i": "1m",
                "f": 100, "L": 200, "o": "0.0010", "c": "0.0020", "h": "0.0025",
                "l": "0.0015", "v": "1000", "n": 100, "x": false, "q": "1.0000",
                "V": "500", "Q": "0.500", "B": "123456"
            }
        }
    })
}

fn margin_call_frame(listen_key: &str) -> Value {
    json!({
        "stream": listen_key,
        "data": {
            "e": "MARGIN_CALL",
            "E": 1587727187525_i64,
            "cw": "3.16812045",
            "p": [{
                "s": "ETHUSDT", "ps": "LONG", "pa": "1.327", "mt": "CROSSED",
                "iw": "0", "mp": "187.17127", "up": "-1.166074", "mm": "1.614445"
            }]
        }
    })
}

/// Connector handing out one pre-built in-memory socket
struct MemoryConnector {
    socket: Mutex<Option<(WsSink, WsStream)>>,
}

#[async_trait]
impl WsConnector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<(WsSink, WsStream), ExchangeError> {
        self.socket
            .lock()
            .unwrap()
            .take()
            .ok_or(ExchangeError::ConnectionClosed)
    }
}

#[cfg(test)]
mod subscription_tests {
    use super::*;

    #[tokio::test]
    async fn test_kline_subscribe_ack_and_route() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_secs(2));
        let (tx, mut rx) = mpsc::unbounded_channel::<StreamEvent<BinancePerpKline>>();

        let (result, request) = tokio::join!(
            client.subscribe_klines(
                &["BTCUSDT"],
                &[KlineInterval::Minutes1],
                move |event| {
                    let _ = tx.send(event);
                },
                &cancel,
            ),
            async {
                let request = server.next_control().await;
                server.push(json!({"id": 1, "result": null}));
                request
            }
        );

        assert_eq!(
            request,
            json!({"method": "SUBSCRIBE", "params": ["btcusdt@kline_1m"], "id": 1})
        );
        let id = result.unwrap();
        assert_eq!(
            client.subscription(id).map(|info| info.state),
            Some(SubscriptionState::Active)
        );

        server.push(kline_frame("btcusdt@kline_1m", "BTCUSDT"));
        let event = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.topic, "btcusdt@kline_1m");
        assert_eq!(event.data.kline.interval, "1m");
        assert_eq!(event.data.symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn test_disjoint_topics_never_cross() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_secs(2));
        let btc_calls = Arc::new(AtomicUsize::new(0));
        let eth_calls = Arc::new(AtomicUsize::new(0));

        let btc = btc_calls.clone();
        let (first, _) = tokio::join!(
            client.subscribe_klines(
                &["BTCUSDT"],
                &[KlineInterval::Minutes1],
                move |_| {
                    btc.fetch_add(1, Ordering::SeqCst);
                },
                &cancel,
            ),
            server.accept_next()
        );
        first.unwrap();

        let eth = eth_calls.clone();
        let (second, _) = tokio::join!(
            client.subscribe_klines(
                &["ETHUSDT"],
                &[KlineInterval::Minutes1],
                move |_| {
                    eth.fetch_add(1, Ordering::SeqCst);
                },
                &cancel,
            ),
            server.accept_next()
        );
        second.unwrap();

        server.push(kline_frame("btcusdt@kline_1m", "BTCUSDT"));
        server.push(kline_frame("btcusdt@kline_1m", "BTCUSDT"));
        server.push(kline_frame("ethusdt@kline_1m", "ETHUSDT"));
        // Unknown topic is dropped without reaching anyone
        server.push(kline_frame("solusdt@kline_1m", "SOLUSDT"));
        flush(&client, &mut server, "disjoint").await;

        assert_eq!(btc_calls.load(Ordering::SeqCst), 2);
        assert_eq!(eth_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_before_ack_silences_handler() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_secs(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let (result, ()) = tokio::join!(
            client.subscribe_klines(
                &["BTCUSDT"],
                &[KlineInterval::Minutes1],
                move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                },
                &cancel,
            ),
            async {
                let subscribe = server.next_control().await;
                assert_eq!(subscribe["method"], "SUBSCRIBE");

                let (unsubscribed, unsubscribe) = tokio::join!(
                    client.unsubscribe(SubscriptionId(1)),
                    server.accept_next()
                );
                unsubscribed.unwrap();
                assert_eq!(unsubscribe["method"], "UNSUBSCRIBE");
                assert_eq!(unsubscribe["params"], json!(["btcusdt@kline_1m"]));

                // Late acknowledgement for the original subscribe
                server.ack(1);
            }
        );

        assert!(matches!(result, Err(ExchangeError::Cancelled(_))));
        server.push(kline_frame("btcusdt@kline_1m", "BTCUSDT"));
        flush(&client, &mut server, "late").await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(client.subscription(SubscriptionId(1)).is_none());
    }

    #[tokio::test]
    async fn test_rejected_subscribe_returns_server_error() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_secs(2));

        let (result, ()) = tokio::join!(
            client.subscribe_agg_trades(&["BTCUSDT"], |_| {}, &cancel),
            async {
                let request = server.next_control().await;
                server.push(json!({
                    "id": request["id"],
                    "result": {"code": 2, "msg": "Invalid request: unknown property"}
                }));
            }
        );

        match result {
            Err(ExchangeError::SubscriptionRejected { code, message }) => {
                assert_eq!(code, 2);
                assert!(message.contains("Invalid request"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(client.session().registry().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_times_out_without_ack() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_millis(100));

        let (result, _) = tokio::join!(
            client.subscribe_book_tickers(&["BTCUSDT"], |_| {}, &cancel),
            server.next_control()
        );

        assert!(matches!(
            result,
            Err(ExchangeError::SubscriptionTimeout { id: 1, .. })
        ));
        assert!(client.session().registry().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_subscribe_sends_no_teardown() {
        let (client, mut server) = start_client(Duration::from_secs(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let cancel = CancellationToken::new();

        let (result, ()) = tokio::join!(
            client.subscribe_mark_prices(
                &["BTCUSDT"],
                None,
                move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                },
                &cancel,
            ),
            async {
                server.next_control().await;
                cancel.cancel();
            }
        );
        assert!(matches!(result, Err(ExchangeError::Cancelled(_))));

        server.ack(1);
        server.push(json!({
            "stream": "btcusdt@markPrice",
            "data": {"e": "markPriceUpdate", "E": 1, "s": "BTCUSDT", "p": "11794.15"}
        }));
        assert!(!server.has_pending_frames(), "no UNSUBSCRIBE expected");

        flush(&client, &mut server, "cancelled").await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_symbol_sends_nothing() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_secs(2));
        let result = client
            .subscribe_tickers(&["BTC-USDT"], |_| {}, &cancel)
            .await;
        assert!(matches!(result, Err(ExchangeError::InvalidParameters(_))));
        assert!(!server.has_pending_frames());
    }

    #[tokio::test]
    async fn test_duplicate_topic_is_rejected_locally() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_secs(2));
        let (first, _) = tokio::join!(
            client.subscribe_tickers(&["BTCUSDT"], |_| {}, &cancel),
            server.accept_next()
        );
        first.unwrap();

        let second = client
            .subscribe_tickers(&["BTCUSDT"], |_| {}, &cancel)
            .await;
        assert!(matches!(second, Err(ExchangeError::InvalidParameters(_))));
    }
}

#[cfg(test)]
mod user_data_tests {
    use super::*;

    const LISTEN_KEY: &str = "pqia91ma19a5s61cv6a81va65sdf19v8a65a1";

    #[tokio::test]
    async fn test_margin_call_reaches_only_margin_callback() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_secs(2));
        let margin_calls = Arc::new(AtomicUsize::new(0));
        let order_calls = Arc::new(AtomicUsize::new(0));

        let margin = margin_calls.clone();
        let order = order_calls.clone();
        let handlers = UserDataHandlers::new()
            .on_margin_call(move |event| {
                assert_eq!(event.topic, LISTEN_KEY);
                margin.fetch_add(1, Ordering::SeqCst);
            })
            .on_order_update(move |_| {
                order.fetch_add(1, Ordering::SeqCst);
            });

        let (result, request) = tokio::join!(
            client.subscribe_user_data(LISTEN_KEY, handlers, &cancel),
            server.accept_next()
        );
        assert_eq!(request["params"], json!([LISTEN_KEY]));
        let subscription = result.unwrap();
        assert_eq!(subscription.state(), UserDataState::Subscribed);

        server.push(margin_call_frame(LISTEN_KEY));
        flush(&client, &mut server, "margin").await;

        assert_eq!(margin_calls.load(Ordering::SeqCst), 1);
        assert_eq!(order_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_event_does_not_stop_processing() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_secs(2));
        let margin_calls = Arc::new(AtomicUsize::new(0));
        let margin = margin_calls.clone();
        let handlers = UserDataHandlers::new().on_margin_call(move |_| {
            margin.fetch_add(1, Ordering::SeqCst);
        });

        let (result, _) = tokio::join!(
            client.subscribe_user_data(LISTEN_KEY, handlers, &cancel),
            server.accept_next()
        );
        result.unwrap();

        server.push(json!({"stream": LISTEN_KEY, "data": {"e": "GRID_UPDATE", "E": 1}}));
        server.push(json!({"stream": LISTEN_KEY, "data": {"e": "MARGIN_CALL", "E": "bad"}}));
        server.push(margin_call_frame(LISTEN_KEY));
        flush(&client, &mut server, "unknown").await;

        assert_eq!(margin_calls.load(Ordering::SeqCst), 1);
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_listen_key_expiry_moves_to_expired() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_secs(2));
        let expired_calls = Arc::new(AtomicUsize::new(0));
        let expired = expired_calls.clone();
        let handlers = UserDataHandlers::new().on_listen_key_expired(move |_| {
            expired.fetch_add(1, Ordering::SeqCst);
        });

        let (result, _) = tokio::join!(
            client.subscribe_user_data(LISTEN_KEY, handlers, &cancel),
            server.accept_next()
        );
        let subscription = result.unwrap();

        server.push(json!({
            "stream": LISTEN_KEY,
            "data": {"e": "listenKeyExpired", "E": 1576653824250_i64, "listenKey": LISTEN_KEY}
        }));
        flush(&client, &mut server, "expiry").await;

        assert_eq!(expired_calls.load(Ordering::SeqCst), 1);
        assert_eq!(subscription.state(), UserDataState::Expired);
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_through_connector() {
        let cancel = CancellationToken::new();
        let (sink, stream, mut server) = memory_socket();
        let connector = MemoryConnector {
            socket: Mutex::new(Some((sink, stream))),
        };
        let config = ExchangeConfig::read_only();
        let client = connect_socket_with(&config, &connector).await.unwrap();

        let (result, _) = tokio::join!(
            client.subscribe_all_book_tickers(|_| {}, &cancel),
            server.accept_next()
        );
        result.unwrap();

        // A second connect has no socket left to hand out
        assert!(connect_socket_with(&config, &connector).await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_all_removes_everything() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_secs(2));
        let (a, _) = tokio::join!(
            client.subscribe_all_mini_tickers(|_| {}, &cancel),
            server.accept_next()
        );
        a.unwrap();
        let (b, _) = tokio::join!(
            client.subscribe_diff_depth(&["BTCUSDT"], Some(100), |_| {}, &cancel),
            server.accept_next()
        );
        b.unwrap();

        let (removed, ()) = tokio::join!(client.unsubscribe_all(), async {
            for _ in 0..2 {
                let request = server.accept_next().await;
                assert_eq!(request["method"], "UNSUBSCRIBE");
            }
        });
        assert_eq!(removed.unwrap(), 2);
        assert!(client.session().registry().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_timeout_still_removes_locally() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_millis(100));
        let (id, _) = tokio::join!(
            client.subscribe_all_tickers(|_| {}, &cancel),
            server.accept_next()
        );
        let id = id.unwrap();

        let (result, _) = tokio::join!(client.unsubscribe(id), server.next_control());
        assert!(result.is_ok());
        assert!(client.subscription(id).is_none());
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_later_calls() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_secs(5));

        let (result, ()) = tokio::join!(
            client.subscribe_all_liquidations(|_| {}, &cancel),
            async {
                server.next_control().await;
                client.close().await.unwrap();
            }
        );
        assert!(matches!(result, Err(ExchangeError::ConnectionClosed)));
        assert!(client.is_closed());

        let after = client
            .subscribe_all_liquidations(|_| {}, &cancel)
            .await;
        assert!(matches!(after, Err(ExchangeError::ConnectionClosed)));

        // Ids unknown after close are a no-op
        assert!(client.unsubscribe(SubscriptionId(42)).await.is_ok());
    }

    #[tokio::test]
    async fn test_server_disconnect_closes_session() {
        let (client, server) = start_client(Duration::from_secs(2));
        drop(server);
        wait_closed(&client).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_after_server_close_sends_nothing() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_secs(2));
        let (id, _) = tokio::join!(
            client.subscribe_klines(&["BTCUSDT"], &[KlineInterval::Minutes1], |_| {}, &cancel),
            server.accept_next()
        );
        let id = id.unwrap();

        server.close();
        wait_closed(&client).await;
        // A server-side close leaves local bookkeeping in place
        assert_eq!(
            client.subscription(id).map(|info| info.state),
            Some(SubscriptionState::Active)
        );

        assert!(client.unsubscribe(id).await.is_ok());
        assert!(client.subscription(id).is_none());
        assert!(server.drain_text_frames().is_empty(), "no UNSUBSCRIBE expected");
    }

    #[tokio::test]
    async fn test_panicking_handler_keeps_connection_routing() {
        let cancel = CancellationToken::new();
        let (client, mut server) = start_client(Duration::from_secs(2));
        let eth_calls = Arc::new(AtomicUsize::new(0));

        let (faulty, _) = tokio::join!(
            client.subscribe_klines(
                &["BTCUSDT"],
                &[KlineInterval::Minutes1],
                |_| panic!("handler failure"),
                &cancel,
            ),
            server.accept_next()
        );
        faulty.unwrap();

        let eth = eth_calls.clone();
        let (healthy, _) = tokio::join!(
            client.subscribe_klines(
                &["ETHUSDT"],
                &[KlineInterval::Minutes1],
                move |_| {
                    eth.fetch_add(1, Ordering::SeqCst);
                },
                &cancel,
            ),
            server.accept_next()
        );
        healthy.unwrap();

        server.push(kline_frame("btcusdt@kline_1m", "BTCUSDT"));
        server.push(kline_frame("ethusdt@kline_1m", "ETHUSDT"));
        flush(&client, &mut server, "panic").await;

        assert_eq!(eth_calls.load(Ordering::SeqCst), 1);
        assert!(!client.is_closed());
    }
}
