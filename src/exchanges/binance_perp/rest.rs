use crate::core::errors::ExchangeError;
use crate::core::kernel::{RestClient, ServerClock, Signing};
use crate::exchanges::binance_perp::types::{BinancePerpListenKey, BinancePerpServerTime};
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use tracing::instrument;

pub const SERVER_TIME_ENDPOINT: &str = "/fapi/v1/time";
pub const LISTEN_KEY_ENDPOINT: &str = "/fapi/v1/listenKey";

/// REST API operations for Binance Perpetual
pub struct BinancePerpRestClient<R: RestClient> {
    rest: R,
}

impl<R: RestClient> BinancePerpRestClient<R> {
    /// Create a new REST client wrapper
    pub fn new(rest: R) -> Self {
        Self { rest }
    }

    pub fn inner(&self) -> &R {
        &self.rest
    }

    /// Get the server clock in epoch milliseconds
    #[instrument(skip(self), fields(exchange = "binance_perp"))]
    pub async fn server_time(&self) -> Result<BinancePerpServerTime, ExchangeError> {
        self.rest
            .request_json(
                Method::GET,
                SERVER_TIME_ENDPOINT,
                &HashMap::new(),
                Signing::Unsigned,
            )
            .await
    }

    /// Send a timestamped, signed request.
    ///
    /// The clock offset is refreshed through this client when it is due, and a
    /// stale-timestamp rejection schedules a recalculation for the next call.
    pub async fn signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        params: &HashMap<String, String>,
    ) -> Result<T, ExchangeError> {
        self.rest
            .request_json(method, endpoint, params, Signing::Signed(self))
            .await
    }

    /// Open a user data stream and return its listen key
    #[instrument(skip(self), fields(exchange = "binance_perp"))]
    pub async fn start_user_stream(&self) -> Result<String, ExchangeError> {
        let key: BinancePerpListenKey = self
            .rest
            .request_json(
                Method::POST,
                LISTEN_KEY_ENDPOINT,
                &HashMap::new(),
                Signing::Unsigned,
            )
            .await?;
        Ok(key.listen_key)
    }

    /// Extend the validity of the current listen key by 60 minutes
    #[instrument(skip(self), fields(exchange = "binance_perp"))]
    pub async fn keep_alive_user_stream(&self) -> Result<(), ExchangeError> {
        self.rest
            .request(
                Method::PUT,
                LISTEN_KEY_ENDPOINT,
                &HashMap::new(),
                Signing::Unsigned,
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(exchange = "binance_perp"))]
    pub async fn stop_user_stream(&self) -> Result<(), ExchangeError> {
        self.rest
            .request(
                Method::DELETE,
                LISTEN_KEY_ENDPOINT,
                &HashMap::new(),
                Signing::Unsigned,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<R: RestClient> ServerClock for BinancePerpRestClient<R> {
    async fn server_time(&self) -> Result<i64, ExchangeError> {
        Ok(Self::server_time(self).await?.server_time)
    }
}
