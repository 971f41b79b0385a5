// Core modules - one responsibility per file
pub mod codec; // impl WsCodec (combined-stream dialect)
pub mod rest; // thin typed wrapper around RestClient
pub mod signer; // HMAC-SHA256 request signing
pub mod topics; // stream name builders
pub mod types; // serde structs ← raw JSON
pub mod user_data; // account event dispatch

pub mod builder; // config → concrete clients
pub mod socket; // typed subscriptions over one StreamSession

// Re-export main types for easier importing
pub use builder::{build_rest_client, build_rest_client_with_time_sync, connect_socket};
pub use codec::BinancePerpCodec;
pub use rest::BinancePerpRestClient;
pub use signer::BinancePerpSigner;
pub use socket::{BinancePerpSocketClient, UserDataSubscription};
pub use types::*;
pub use user_data::{
    DispatchOutcome, UserDataDispatcher, UserDataEvent, UserDataHandlers, UserDataState,
};
