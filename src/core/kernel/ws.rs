use crate::core::errors::ExchangeError;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{info, instrument};

/// Write half of a connected socket
pub type WsSink = Pin<Box<dyn Sink<Message, Error = ExchangeError> + Send>>;

/// Read half of a connected socket
pub type WsStream = Pin<Box<dyn Stream<Item = Result<Message, ExchangeError>> + Send>>;

/// WebSocket transport configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
        }
    }
}

/// Opens socket connections - pure transport layer.
///
/// The returned halves carry raw frames; ping/pong and close handling is left
/// to the session driving them.
#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(WsSink, WsStream), ExchangeError>;
}

/// Tungstenite-based connector
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector {
    config: WsConfig,
}

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set custom WebSocket configuration
    pub fn with_config(mut self, config: WsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }
}

#[async_trait]
impl WsConnector for TungsteniteConnector {
    #[instrument(skip(self), fields(url = %url))]
    async fn connect(&self, url: &str) -> Result<(WsSink, WsStream), ExchangeError> {
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);

        let (ws_stream, _) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                ExchangeError::ConnectionTimeout("WebSocket connection timeout".to_string())
            })?
            .map_err(|e| {
                ExchangeError::NetworkError(format!("WebSocket connection failed: {}", e))
            })?;

        info!("WebSocket connected");

        let (write, read) = ws_stream.split();
        let sink = write.sink_map_err(|e| {
            ExchangeError::NetworkError(format!("Failed to send WebSocket message: {}", e))
        });
        let stream = read.map(|frame| {
            frame.map_err(|e| ExchangeError::NetworkError(format!("WebSocket error: {}", e)))
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
