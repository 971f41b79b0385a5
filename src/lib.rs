pub mod core;
pub mod exchanges;

pub use crate::core::{
    config::{ClientOptions, Credentials, ExchangeConfig},
    errors::ExchangeError,
    types::*,
};
pub use crate::exchanges::binance_perp::{BinancePerpRestClient, BinancePerpSocketClient};
