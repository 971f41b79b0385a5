use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// REST types

#[derive(Debug, Clone, Deserialize)]
pub struct BinancePerpServerTime {
    #[serde(rename = "serverTime")]
    pub server_time: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinancePerpListenKey {
    #[serde(rename = "listenKey")]
    pub listen_key: String,
}

// WebSocket market data types for perpetual futures

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpKlineData {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "f")]
    pub first_trade_id: i64,
    #[serde(rename = "L")]
    pub last_trade_id: i64,
    #[serde(rename = "o")]
    pub open_price: Decimal,
    #[serde(rename = "c")]
    pub close_price: Decimal,
    #[serde(rename = "h")]
    pub high_price: Decimal,
    #[serde(rename = "l")]
    pub low_price: Decimal,
    #[serde(rename = "v")]
    pub volume: Decimal,
    #[serde(rename = "n")]
    pub number_of_trades: i64,
    #[serde(rename = "x")]
    pub final_bar: bool,
    #[serde(rename = "q")]
    pub quote_volume: Decimal,
    #[serde(rename = "V")]
    pub taker_buy_volume: Decimal,
    #[serde(rename = "Q")]
    pub taker_buy_quote_volume: Decimal,
}

/// Kline update; also used for leveraged-token NAV klines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpKline {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: BinancePerpKlineData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpMarkPrice {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub mark_price: Decimal,
    #[serde(rename = "i", default)]
    pub index_price: Option<Decimal>,
    #[serde(rename = "P", default)]
    pub estimated_settle_price: Option<Decimal>,
    #[serde(rename = "r", default)]
    pub funding_rate: Option<Decimal>,
    #[serde(rename = "T", default)]
    pub next_funding_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpMiniTicker {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub close_price: Decimal,
    #[serde(rename = "o")]
    pub open_price: Decimal,
    #[serde(rename = "h")]
    pub high_price: Decimal,
    #[serde(rename = "l")]
    pub low_price: Decimal,
    #[serde(rename = "v")]
    pub volume: Decimal,
    #[serde(rename = "q")]
    pub quote_volume: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpTicker {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price_change: Decimal,
    #[serde(rename = "P")]
    pub price_change_percent: Decimal,
    #[serde(rename = "w")]
    pub weighted_avg_price: Decimal,
    #[serde(rename = "c")]
    pub last_price: Decimal,
    #[serde(rename = "Q")]
    pub last_quantity: Decimal,
    #[serde(rename = "o")]
    pub open_price: Decimal,
    #[serde(rename = "h")]
    pub high_price: Decimal,
    #[serde(rename = "l")]
    pub low_price: Decimal,
    #[serde(rename = "v")]
    pub volume: Decimal,
    #[serde(rename = "q")]
    pub quote_volume: Decimal,
    #[serde(rename = "O")]
    pub open_time: i64,
    #[serde(rename = "C")]
    pub close_time: i64,
    #[serde(rename = "F")]
    pub first_trade_id: i64,
    #[serde(rename = "L")]
    pub last_trade_id: i64,
    #[serde(rename = "n")]
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpAggTrade {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "a")]
    pub aggregate_trade_id: i64,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "q")]
    pub quantity: Decimal,
    #[serde(rename = "f")]
    pub first_trade_id: i64,
    #[serde(rename = "l")]
    pub last_trade_id: i64,
    #[serde(rename = "T")]
    pub trade_time: i64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpBookTicker {
    #[serde(rename = "u")]
    pub update_id: i64,
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
    #[serde(rename = "T", default)]
    pub transaction_time: Option<i64>,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub best_bid_price: Decimal,
    #[serde(rename = "B")]
    pub best_bid_quantity: Decimal,
    #[serde(rename = "a")]
    pub best_ask_price: Decimal,
    #[serde(rename = "A")]
    pub best_ask_quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpLiquidationOrder {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "o")]
    pub order_type: String,
    #[serde(rename = "f")]
    pub time_in_force: String,
    #[serde(rename = "q")]
    pub quantity: Decimal,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "ap")]
    pub average_price: Decimal,
    #[serde(rename = "X")]
    pub status: String,
    #[serde(rename = "l")]
    pub last_filled_quantity: Decimal,
    #[serde(rename = "z")]
    pub filled_accumulated_quantity: Decimal,
    #[serde(rename = "T")]
    pub trade_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpLiquidation {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "o")]
    pub order: BinancePerpLiquidationOrder,
}

/// Partial or diff book depth update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpDepthUpdate {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "T")]
    pub transaction_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "U")]
    pub first_update_id: i64,
    #[serde(rename = "u")]
    pub final_update_id: i64,
    #[serde(rename = "pu")]
    pub prev_final_update_id: i64,
    #[serde(rename = "b")]
    pub bids: Vec<[Decimal; 2]>,
    #[serde(rename = "a")]
    pub asks: Vec<[Decimal; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpIndexComponent {
    #[serde(rename = "b")]
    pub base_asset: String,
    #[serde(rename = "q")]
    pub quote_asset: String,
    #[serde(rename = "w")]
    pub weight_in_quantity: Decimal,
    #[serde(rename = "W")]
    pub weight_in_percentage: Decimal,
    #[serde(rename = "i")]
    pub index_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpCompositeIndex {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "C", default)]
    pub base_asset_type: Option<String>,
    #[serde(rename = "c")]
    pub composition: Vec<BinancePerpIndexComponent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpBasket {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "n")]
    pub position: Decimal,
}

/// Leveraged token net asset value update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpTokenNav {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub token: String,
    #[serde(rename = "m")]
    pub tokens_issued: Decimal,
    #[serde(rename = "b")]
    pub baskets: Vec<BinancePerpBasket>,
    #[serde(rename = "n")]
    pub nav: Decimal,
    #[serde(rename = "l")]
    pub real_leverage: Decimal,
    #[serde(rename = "t")]
    pub target_leverage: Decimal,
    #[serde(rename = "f")]
    pub funding_ratio: Decimal,
}

// User data stream types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpLeverageConfig {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "l")]
    pub leverage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpMultiAssetsConfig {
    #[serde(rename = "j")]
    pub multi_assets_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpAccountConfigUpdate {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "T")]
    pub transaction_time: i64,
    #[serde(rename = "ac", default)]
    pub leverage: Option<BinancePerpLeverageConfig>,
    #[serde(rename = "ai", default)]
    pub multi_assets: Option<BinancePerpMultiAssetsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpMarginCallPosition {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "ps")]
    pub position_side: String,
    #[serde(rename = "pa")]
    pub position_amount: Decimal,
    #[serde(rename = "mt")]
    pub margin_type: String,
    #[serde(rename = "iw", default)]
    pub isolated_wallet: Option<Decimal>,
    #[serde(rename = "mp")]
    pub mark_price: Decimal,
    #[serde(rename = "up")]
    pub unrealized_pnl: Decimal,
    #[serde(rename = "mm")]
    pub maintenance_margin: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpMarginCall {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "cw", default)]
    pub cross_wallet_balance: Option<Decimal>,
    #[serde(rename = "p")]
    pub positions: Vec<BinancePerpMarginCallPosition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpBalanceUpdate {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "wb")]
    pub wallet_balance: Decimal,
    #[serde(rename = "cw")]
    pub cross_wallet_balance: Decimal,
    #[serde(rename = "bc", default)]
    pub balance_change: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpPositionUpdate {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "pa")]
    pub position_amount: Decimal,
    #[serde(rename = "ep")]
    pub entry_price: Decimal,
    #[serde(rename = "cr", default)]
    pub accumulated_realized: Option<Decimal>,
    #[serde(rename = "up")]
    pub unrealized_pnl: Decimal,
    #[serde(rename = "mt")]
    pub margin_type: String,
    #[serde(rename = "iw", default)]
    pub isolated_wallet: Option<Decimal>,
    #[serde(rename = "ps")]
    pub position_side: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpAccountData {
    /// Reason for the update, e.g. ORDER, FUNDING_FEE, DEPOSIT
    #[serde(rename = "m")]
    pub reason: String,
    #[serde(rename = "B", default)]
    pub balances: Vec<BinancePerpBalanceUpdate>,
    #[serde(rename = "P", default)]
    pub positions: Vec<BinancePerpPositionUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpAccountUpdate {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "T")]
    pub transaction_time: i64,
    #[serde(rename = "a")]
    pub update: BinancePerpAccountData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpOrderUpdateData {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub client_order_id: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "o")]
    pub order_type: String,
    #[serde(rename = "f")]
    pub time_in_force: String,
    #[serde(rename = "q")]
    pub quantity: Decimal,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "ap")]
    pub average_price: Decimal,
    #[serde(rename = "sp")]
    pub stop_price: Decimal,
    #[serde(rename = "x")]
    pub execution_type: String,
    #[serde(rename = "X")]
    pub status: String,
    #[serde(rename = "i")]
    pub order_id: i64,
    #[serde(rename = "l")]
    pub last_filled_quantity: Decimal,
    #[serde(rename = "z")]
    pub filled_accumulated_quantity: Decimal,
    #[serde(rename = "L")]
    pub last_filled_price: Decimal,
    #[serde(rename = "N", default)]
    pub commission_asset: Option<String>,
    #[serde(rename = "n", default)]
    pub commission: Option<Decimal>,
    #[serde(rename = "T")]
    pub trade_time: i64,
    #[serde(rename = "t")]
    pub trade_id: i64,
    #[serde(rename = "b", default)]
    pub bid_notional: Option<Decimal>,
    #[serde(rename = "a", default)]
    pub ask_notional: Option<Decimal>,
    #[serde(rename = "m", default)]
    pub is_maker: bool,
    #[serde(rename = "R", default)]
    pub reduce_only: bool,
    #[serde(rename = "wt", default)]
    pub working_type: Option<String>,
    #[serde(rename = "ot", default)]
    pub original_order_type: Option<String>,
    #[serde(rename = "ps", default)]
    pub position_side: Option<String>,
    #[serde(rename = "cp", default)]
    pub close_position: bool,
    #[serde(rename = "rp", default)]
    pub realized_profit: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpOrderTradeUpdate {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "T")]
    pub transaction_time: i64,
    #[serde(rename = "o")]
    pub order: BinancePerpOrderUpdateData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinancePerpListenKeyExpired {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "listenKey", default)]
    pub listen_key: Option<String>,
}
