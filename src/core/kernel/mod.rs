/// Exchange-agnostic transport layer.
///
/// # Components
///
/// ## Transport
/// - `RestClient`: signed/unsigned HTTP requests with clock-offset correction
/// - `WsConnector`: opens a socket and hands back its raw halves
/// - `StreamSession`: one socket multiplexing many subscriptions
///
/// ## Authentication
/// - `Signer`: pluggable request signing
/// - `TimeSyncState`: shared server clock offset with single-flight recalculation
///
/// ## Stream plumbing
/// - `WsCodec`: exchange-specific control frame encoding and inbound decoding
/// - `Correlator`: matches control requests to their acknowledgements
/// - `SubscriptionRegistry`: topic set to handler bindings
/// - `StreamRouter`: the read path, dispatching each frame to one consumer
///
/// ## Example
/// ```rust,no_run
/// use lotusx_fstream::core::config::ClientOptions;
/// use lotusx_fstream::core::kernel::*;
/// use lotusx_fstream::core::types::StreamEvent;
/// use serde_json::Value;
/// use lotusx_fstream::exchanges::binance_perp::codec::BinancePerpCodec;
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session = StreamSession::connect(
///     &TungsteniteConnector::new(),
///     "wss://fstream.binance.com/stream",
///     BinancePerpCodec,
///     &ClientOptions::default(),
///     "binance_perp",
/// )
/// .await?;
///
/// let id = session
///     .subscribe(
///         vec!["btcusdt@markPrice".to_string()],
///         Arc::new(|event: &StreamEvent<Value>| println!("{}: {}", event.topic, event.data)),
///         &CancellationToken::new(),
///     )
///     .await?;
/// session.unsubscribe(id).await?;
/// session.close().await?;
/// # Ok(())
/// # }
/// ```
pub mod codec;
pub mod correlator;
pub mod registry;
pub mod rest;
pub mod router;
pub mod session;
pub mod signer;
pub mod time_sync;
pub mod ws;

// Re-export key types for convenience
pub use codec::{AckError, ControlAck, ControlMethod, ControlRequest, InboundFrame, WsCodec};
pub use correlator::{Correlator, PendingAck};
pub use registry::{FrameHandler, SubscriptionInfo, SubscriptionRegistry};
pub use rest::{ReqwestRest, RestClient, RestClientBuilder, RestClientConfig, Signing};
pub use router::{RouteOutcome, StreamRouter};
pub use session::StreamSession;
pub use signer::{ParameterPosition, SignedRequest, Signer};
pub use time_sync::{OffsetLease, ServerClock, TimeSyncState};
pub use ws::{TungsteniteConnector, WsConfig, WsConnector, WsSink, WsStream};
