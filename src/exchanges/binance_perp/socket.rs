use crate::core::config::ClientOptions;
use crate::core::errors::ExchangeError;
use crate::core::kernel::{FrameHandler, StreamSession, SubscriptionInfo, WsConnector};
use crate::core::types::{KlineInterval, StreamEvent, SubscriptionId};
use crate::exchanges::binance_perp::codec::BinancePerpCodec;
use crate::exchanges::binance_perp::topics;
use crate::exchanges::binance_perp::types::{
    BinancePerpAggTrade, BinancePerpBookTicker, BinancePerpCompositeIndex, BinancePerpDepthUpdate,
    BinancePerpKline, BinancePerpLiquidation, BinancePerpMarkPrice, BinancePerpMiniTicker,
    BinancePerpTicker, BinancePerpTokenNav,
};
use crate::exchanges::binance_perp::user_data::{
    UserDataDispatcher, UserDataHandlers, UserDataState,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

pub const EXCHANGE_NAME: &str = "binance_perp";

/// Handle to an acknowledged account-channel subscription
#[derive(Debug, Clone)]
pub struct UserDataSubscription {
    pub id: SubscriptionId,
    dispatcher: Arc<UserDataDispatcher>,
}

impl UserDataSubscription {
    pub fn state(&self) -> UserDataState {
        self.dispatcher.state()
    }
}

/// Streaming client for the USD-M futures combined-stream socket.
///
/// Every `subscribe_*` call waits for the server to acknowledge its topics and
/// returns the local subscription id; payloads are decoded into the typed
/// model before reaching the handler.
pub struct BinancePerpSocketClient {
    session: StreamSession<BinancePerpCodec>,
}

impl BinancePerpSocketClient {
    #[instrument(skip(connector, options), fields(exchange = EXCHANGE_NAME))]
    pub async fn connect(
        connector: &dyn WsConnector,
        url: &str,
        options: &ClientOptions,
    ) -> Result<Self, ExchangeError> {
        let session =
            StreamSession::connect(connector, url, BinancePerpCodec, options, EXCHANGE_NAME)
                .await?;
        Ok(Self { session })
    }

    pub fn from_session(session: StreamSession<BinancePerpCodec>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &StreamSession<BinancePerpCodec> {
        &self.session
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        self.session.subscription(id)
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Subscribe to arbitrary topics, decoding each payload as `T`
    pub async fn subscribe<T, F>(
        &self,
        topics: Vec<String>,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        T: DeserializeOwned + 'static,
        F: Fn(StreamEvent<T>) + Send + Sync + 'static,
    {
        self.session
            .subscribe(topics, typed_handler(handler), cancel)
            .await
    }

    pub async fn subscribe_klines<S, F>(
        &self,
        symbols: &[S],
        intervals: &[KlineInterval],
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        S: AsRef<str>,
        F: Fn(StreamEvent<BinancePerpKline>) + Send + Sync + 'static,
    {
        let topics = topics::kline_topics(symbols, intervals)?;
        self.subscribe(topics, handler, cancel).await
    }

    /// Mark price and funding rate; `update_interval_ms` is 1000 or 3000
    pub async fn subscribe_mark_prices<S, F>(
        &self,
        symbols: &[S],
        update_interval_ms: Option<u32>,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        S: AsRef<str>,
        F: Fn(StreamEvent<BinancePerpMarkPrice>) + Send + Sync + 'static,
    {
        let topics = topics::for_symbols(symbols, |s| topics::mark_price(s, update_interval_ms))?;
        self.subscribe(topics, handler, cancel).await
    }

    pub async fn subscribe_all_mark_prices<F>(
        &self,
        update_interval_ms: Option<u32>,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        F: Fn(StreamEvent<Vec<BinancePerpMarkPrice>>) + Send + Sync + 'static,
    {
        let topic = topics::all_mark_price(update_interval_ms)?;
        self.subscribe(vec![topic], handler, cancel).await
    }

    pub async fn subscribe_mini_tickers<S, F>(
        &self,
        symbols: &[S],
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        S: AsRef<str>,
        F: Fn(StreamEvent<BinancePerpMiniTicker>) + Send + Sync + 'static,
    {
        let topics = topics::for_symbols(symbols, topics::mini_ticker)?;
        self.subscribe(topics, handler, cancel).await
    }

    pub async fn subscribe_all_mini_tickers<F>(
        &self,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        F: Fn(StreamEvent<Vec<BinancePerpMiniTicker>>) + Send + Sync + 'static,
    {
        self.subscribe(vec![topics::ALL_MINI_TICKERS.to_string()], handler, cancel)
            .await
    }

    pub async fn subscribe_tickers<S, F>(
        &self,
        symbols: &[S],
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        S: AsRef<str>,
        F: Fn(StreamEvent<BinancePerpTicker>) + Send + Sync + 'static,
    {
        let topics = topics::for_symbols(symbols, topics::ticker)?;
        self.subscribe(topics, handler, cancel).await
    }

    pub async fn subscribe_all_tickers<F>(
        &self,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        F: Fn(StreamEvent<Vec<BinancePerpTicker>>) + Send + Sync + 'static,
    {
        self.subscribe(vec![topics::ALL_TICKERS.to_string()], handler, cancel)
            .await
    }

    pub async fn subscribe_agg_trades<S, F>(
        &self,
        symbols: &[S],
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        S: AsRef<str>,
        F: Fn(StreamEvent<BinancePerpAggTrade>) + Send + Sync + 'static,
    {
        let topics = topics::for_symbols(symbols, topics::agg_trade)?;
        self.subscribe(topics, handler, cancel).await
    }

    pub async fn subscribe_book_tickers<S, F>(
        &self,
        symbols: &[S],
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        S: AsRef<str>,
        F: Fn(StreamEvent<BinancePerpBookTicker>) + Send + Sync + 'static,
    {
        let topics = topics::for_symbols(symbols, topics::book_ticker)?;
        self.subscribe(topics, handler, cancel).await
    }

    pub async fn subscribe_all_book_tickers<F>(
        &self,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        F: Fn(StreamEvent<BinancePerpBookTicker>) + Send + Sync + 'static,
    {
        self.subscribe(vec![topics::ALL_BOOK_TICKERS.to_string()], handler, cancel)
            .await
    }

    pub async fn subscribe_liquidations<S, F>(
        &self,
        symbols: &[S],
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        S: AsRef<str>,
        F: Fn(StreamEvent<BinancePerpLiquidation>) + Send + Sync + 'static,
    {
        let topics = topics::for_symbols(symbols, topics::liquidation)?;
        self.subscribe(topics, handler, cancel).await
    }

    /// Liquidation orders across the market, one order per frame
    pub async fn subscribe_all_liquidations<F>(
        &self,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        F: Fn(StreamEvent<BinancePerpLiquidation>) + Send + Sync + 'static,
    {
        self.subscribe(vec![topics::ALL_LIQUIDATIONS.to_string()], handler, cancel)
            .await
    }

    /// Top `levels` bids and asks (5, 10 or 20) every 100, 250 or 500 ms
    pub async fn subscribe_partial_depth<S, F>(
        &self,
        symbols: &[S],
        levels: u32,
        update_speed_ms: Option<u32>,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        S: AsRef<str>,
        F: Fn(StreamEvent<BinancePerpDepthUpdate>) + Send + Sync + 'static,
    {
        let topics = topics::for_symbols(symbols, |s| {
            topics::partial_depth(s, levels, update_speed_ms)
        })?;
        self.subscribe(topics, handler, cancel).await
    }

    pub async fn subscribe_diff_depth<S, F>(
        &self,
        symbols: &[S],
        update_speed_ms: Option<u32>,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        S: AsRef<str>,
        F: Fn(StreamEvent<BinancePerpDepthUpdate>) + Send + Sync + 'static,
    {
        let topics = topics::for_symbols(symbols, |s| topics::diff_depth(s, update_speed_ms))?;
        self.subscribe(topics, handler, cancel).await
    }

    pub async fn subscribe_composite_index<S, F>(
        &self,
        symbols: &[S],
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        S: AsRef<str>,
        F: Fn(StreamEvent<BinancePerpCompositeIndex>) + Send + Sync + 'static,
    {
        let topics = topics::for_symbols(symbols, topics::composite_index)?;
        self.subscribe(topics, handler, cancel).await
    }

    pub async fn subscribe_token_nav<S, F>(
        &self,
        tokens: &[S],
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        S: AsRef<str>,
        F: Fn(StreamEvent<BinancePerpTokenNav>) + Send + Sync + 'static,
    {
        let topics = topics::for_symbols(tokens, topics::token_nav)?;
        self.subscribe(topics, handler, cancel).await
    }

    pub async fn subscribe_token_klines<S, F>(
        &self,
        tokens: &[S],
        interval: KlineInterval,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, ExchangeError>
    where
        S: AsRef<str>,
        F: Fn(StreamEvent<BinancePerpKline>) + Send + Sync + 'static,
    {
        let topics = topics::for_symbols(tokens, |t| topics::token_kline(t, interval))?;
        self.subscribe(topics, handler, cancel).await
    }

    /// Subscribe to account events using a listen key from `start_user_stream`
    #[instrument(skip(self, listen_key, handlers, cancel), fields(exchange = EXCHANGE_NAME))]
    pub async fn subscribe_user_data(
        &self,
        listen_key: &str,
        handlers: UserDataHandlers,
        cancel: &CancellationToken,
    ) -> Result<UserDataSubscription, ExchangeError> {
        if listen_key.is_empty() {
            return Err(ExchangeError::InvalidParameters(
                "listen key must not be empty".to_string(),
            ));
        }

        let dispatcher = Arc::new(UserDataDispatcher::new(handlers));
        let routed = dispatcher.clone();
        let handler: FrameHandler = Arc::new(move |event: &StreamEvent<Value>| {
            routed.dispatch(event);
        });

        let id = self
            .session
            .subscribe(vec![listen_key.to_string()], handler, cancel)
            .await?;
        dispatcher.mark_subscribed();
        Ok(UserDataSubscription { id, dispatcher })
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ExchangeError> {
        self.session.unsubscribe(id).await
    }

    pub async fn unsubscribe_all(&self) -> Result<usize, ExchangeError> {
        self.session.unsubscribe_all().await
    }

    pub async fn close(&self) -> Result<(), ExchangeError> {
        self.session.close().await
    }
}

/// Wrap a typed callback so the session can hand it raw payloads
fn typed_handler<T, F>(handler: F) -> FrameHandler
where
    T: DeserializeOwned + 'static,
    F: Fn(StreamEvent<T>) + Send + Sync + 'static,
{
    Arc::new(move |event: &StreamEvent<Value>| match T::deserialize(&event.data) {
        Ok(data) => handler(event.with_data(data)),
        Err(e) => warn!(
            topic = %event.topic,
            error = %e,
            payload = %event.data,
            "Couldn't deserialize stream payload"
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_typed_handler_drops_undecodable_payloads() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler = typed_handler(move |event: StreamEvent<BinancePerpAggTrade>| {
            assert_eq!(event.data.symbol, "BTCUSDT");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        handler(&StreamEvent::new("btcusdt@aggTrade", json!({"e": "aggTrade"})));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handler(&StreamEvent::new(
            "btcusdt@aggTrade",
            json!({
                "e": "aggTrade", "E": 123456789, "s": "BTCUSDT", "a": 5933014,
                "p": "0.001", "q": "100", "f": 100, "l": 105, "T": 123456785, "m": true
            }),
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
