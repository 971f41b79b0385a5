use crate::core::errors::ExchangeError;
use serde_json::Value;
use std::fmt;
use tokio_tungstenite::tungstenite::Message;

/// Control operation carried by an outbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMethod {
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for ControlMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe => f.write_str("SUBSCRIBE"),
            Self::Unsubscribe => f.write_str("UNSUBSCRIBE"),
        }
    }
}

/// One subscribe or unsubscribe request, tagged with its correlation id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub id: u64,
    pub method: ControlMethod,
    pub topics: Vec<String>,
}

/// Failure reported by the server in reply to a control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckError {
    pub code: i32,
    pub message: String,
}

impl From<AckError> for ExchangeError {
    fn from(err: AckError) -> Self {
        Self::SubscriptionRejected {
            code: err.code,
            message: err.message,
        }
    }
}

/// Server reply to a control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlAck {
    pub id: u64,
    pub outcome: Result<(), AckError>,
}

/// A decoded inbound text frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Reply to a control request
    Ack(ControlAck),
    /// Payload published on a named stream
    Data { stream: String, payload: Value },
    /// Anything else the server sent; never delivered to handlers
    Other(Value),
}

/// Codec trait for handling exchange-specific WebSocket message encoding/decoding
///
/// Control frames (ping, pong, close) are handled at the transport level and
/// never reach the codec.
pub trait WsCodec: Send + Sync + 'static {
    /// Encode a subscribe or unsubscribe request
    fn encode_control(&self, request: &ControlRequest) -> Result<Message, ExchangeError>;

    /// Decode a raw WebSocket message
    ///
    /// # Returns
    /// - `Ok(Some(frame))` - Successfully decoded frame
    /// - `Ok(None)` - Message was ignored by the codec
    /// - `Err(error)` - Failed to decode message
    fn decode_message(&self, message: &Message) -> Result<Option<InboundFrame>, ExchangeError>;
}
