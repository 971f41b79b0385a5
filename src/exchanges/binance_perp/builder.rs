use crate::core::config::ExchangeConfig;
use crate::core::errors::ExchangeError;
use crate::core::kernel::{
    ReqwestRest, RestClientBuilder, RestClientConfig, TimeSyncState, TungsteniteConnector,
    WsConfig, WsConnector,
};
use crate::exchanges::binance_perp::{
    rest::BinancePerpRestClient, signer::BinancePerpSigner, socket::BinancePerpSocketClient,
    socket::EXCHANGE_NAME,
};
use std::sync::Arc;

pub const MAINNET_REST_URL: &str = "https://fapi.binance.com";
pub const MAINNET_WS_URL: &str = "wss://fstream.binance.com/stream";
pub const TESTNET_REST_URL: &str = "https://testnet.binancefuture.com";
pub const TESTNET_WS_URL: &str = "wss://stream.binancefuture.com/stream";

/// REST base URL: explicit override, then testnet, then mainnet
pub fn rest_url(config: &ExchangeConfig) -> String {
    config.base_url.clone().unwrap_or_else(|| {
        if config.testnet {
            TESTNET_REST_URL.to_string()
        } else {
            MAINNET_REST_URL.to_string()
        }
    })
}

/// Combined-stream socket URL: explicit override, then testnet, then mainnet
pub fn ws_url(config: &ExchangeConfig) -> String {
    config.ws_url.clone().unwrap_or_else(|| {
        if config.testnet {
            TESTNET_WS_URL.to_string()
        } else {
            MAINNET_WS_URL.to_string()
        }
    })
}

/// Clock-offset state for one account, shared by every client built from it
pub fn time_sync(config: &ExchangeConfig) -> Arc<TimeSyncState> {
    Arc::new(TimeSyncState::new(
        config.options.auto_timestamp,
        config.options.timestamp_recalculation_interval,
    ))
}

/// Create a Binance Perpetual REST client with its own clock-offset state
pub fn build_rest_client(
    config: &ExchangeConfig,
) -> Result<BinancePerpRestClient<ReqwestRest>, ExchangeError> {
    build_rest_client_with_time_sync(config, time_sync(config))
}

/// Create a Binance Perpetual REST client sharing `time_sync` with other clients
pub fn build_rest_client_with_time_sync(
    config: &ExchangeConfig,
    time_sync: Arc<TimeSyncState>,
) -> Result<BinancePerpRestClient<ReqwestRest>, ExchangeError> {
    let rest_config = RestClientConfig::new(rest_url(config), EXCHANGE_NAME.to_string())
        .with_timeout(config.options.rest_timeout_seconds);

    let mut rest_builder = RestClientBuilder::new(rest_config).with_time_sync(time_sync);

    // Add authentication if credentials are provided
    if let Some(credentials) = config.credentials.as_ref().filter(|c| !c.is_empty()) {
        let signer = BinancePerpSigner::new(credentials.clone())
            .with_receive_window(config.options.receive_window_ms);
        rest_builder = rest_builder.with_signer(Arc::new(signer));
    }

    Ok(BinancePerpRestClient::new(rest_builder.build()?))
}

/// Connect the streaming client over a TLS socket
pub async fn connect_socket(
    config: &ExchangeConfig,
) -> Result<BinancePerpSocketClient, ExchangeError> {
    connect_socket_with(config, &socket_connector(config)).await
}

/// Transport honouring the configured connect timeout
pub fn socket_connector(config: &ExchangeConfig) -> TungsteniteConnector {
    TungsteniteConnector::new().with_config(WsConfig {
        connect_timeout_ms: config.options.socket_connect_timeout.as_millis() as u64,
    })
}

/// Connect the streaming client through a caller-supplied transport
pub async fn connect_socket_with(
    config: &ExchangeConfig,
    connector: &dyn WsConnector,
) -> Result<BinancePerpSocketClient, ExchangeError> {
    BinancePerpSocketClient::connect(connector, &ws_url(config), &config.options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_url_selection() {
        let mainnet = ExchangeConfig::read_only();
        assert_eq!(rest_url(&mainnet), MAINNET_REST_URL);
        assert_eq!(ws_url(&mainnet), MAINNET_WS_URL);

        let testnet = ExchangeConfig::read_only().testnet(true);
        assert_eq!(rest_url(&testnet), TESTNET_REST_URL);
        assert_eq!(ws_url(&testnet), TESTNET_WS_URL);

        let custom = ExchangeConfig::read_only()
            .testnet(true)
            .base_url("http://localhost:8080".to_string());
        assert_eq!(rest_url(&custom), "http://localhost:8080");
    }

    #[test]
    fn test_rest_client_shares_time_sync() {
        let config = ExchangeConfig::new("key".to_string(), "secret".to_string());
        let shared = time_sync(&config);
        let first = build_rest_client_with_time_sync(&config, shared.clone()).unwrap();
        let second = build_rest_client_with_time_sync(&config, shared.clone()).unwrap();
        assert!(Arc::ptr_eq(first.inner().time_sync(), second.inner().time_sync()));
        assert!(first.inner().time_sync().is_auto());
    }

    #[test]
    fn test_socket_connector_uses_configured_timeout() {
        let mut config = ExchangeConfig::read_only();
        config.options.socket_connect_timeout = Duration::from_millis(1500);
        assert_eq!(socket_connector(&config).config().connect_timeout_ms, 1500);
    }

    #[test]
    fn test_auto_timestamp_off_disables_sync() {
        let config = ExchangeConfig::read_only().auto_timestamp(false);
        let client = build_rest_client(&config).unwrap();
        assert!(!client.inner().time_sync().is_auto());
    }
}
