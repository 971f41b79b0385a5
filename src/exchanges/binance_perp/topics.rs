use crate::core::errors::ExchangeError;
use crate::core::types::KlineInterval;

pub const ALL_MARK_PRICE: &str = "!markPrice@arr";
pub const ALL_MINI_TICKERS: &str = "!miniTicker@arr";
pub const ALL_TICKERS: &str = "!ticker@arr";
pub const ALL_BOOK_TICKERS: &str = "!bookTicker";
pub const ALL_LIQUIDATIONS: &str = "!forceOrder@arr";

const MIN_SYMBOL_LEN: usize = 5;

/// Check a market symbol: ASCII letters and digits only, at least five long
pub fn validate_symbol(symbol: &str) -> Result<(), ExchangeError> {
    if symbol.len() < MIN_SYMBOL_LEN || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ExchangeError::InvalidParameters(format!(
            "{} is not a valid Binance symbol. Should be [BaseAsset][QuoteAsset], e.g. BTCUSDT",
            symbol
        )));
    }
    Ok(())
}

fn validate_one_of(name: &str, value: u32, allowed: &[u32]) -> Result<(), ExchangeError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(ExchangeError::InvalidParameters(format!(
            "{} should be one of {:?}, got {}",
            name, allowed, value
        )))
    }
}

fn symbol_topic(symbol: &str, suffix: &str) -> Result<String, ExchangeError> {
    validate_symbol(symbol)?;
    Ok(format!("{}{}", symbol.to_lowercase(), suffix))
}

fn token_topic(token: &str, suffix: &str) -> Result<String, ExchangeError> {
    validate_symbol(token)?;
    Ok(format!("{}{}", token.to_uppercase(), suffix))
}

/// Apply `build` to every symbol, failing on the first invalid one
pub fn for_symbols<S, F>(symbols: &[S], mut build: F) -> Result<Vec<String>, ExchangeError>
where
    S: AsRef<str>,
    F: FnMut(&str) -> Result<String, ExchangeError>,
{
    if symbols.is_empty() {
        return Err(ExchangeError::InvalidParameters(
            "at least one symbol is required".to_string(),
        ));
    }
    symbols.iter().map(|s| build(s.as_ref())).collect()
}

/// One topic per symbol and interval pair
pub fn kline_topics<S: AsRef<str>>(
    symbols: &[S],
    intervals: &[KlineInterval],
) -> Result<Vec<String>, ExchangeError> {
    if intervals.is_empty() {
        return Err(ExchangeError::InvalidParameters(
            "at least one interval is required".to_string(),
        ));
    }
    let per_symbol = for_symbols(symbols, |s| symbol_topic(s, ""))?;
    Ok(per_symbol
        .iter()
        .flat_map(|base| {
            intervals
                .iter()
                .map(move |interval| format!("{}@kline_{}", base, interval))
        })
        .collect())
}

fn mark_price_suffix(update_interval_ms: Option<u32>) -> Result<&'static str, ExchangeError> {
    match update_interval_ms {
        Some(ms) => {
            validate_one_of("updateInterval", ms, &[1000, 3000])?;
            Ok(if ms == 1000 { "@1s" } else { "" })
        }
        None => Ok(""),
    }
}

/// `<symbol>@markPrice`, with `@1s` appended for one-second updates
pub fn mark_price(symbol: &str, update_interval_ms: Option<u32>) -> Result<String, ExchangeError> {
    let suffix = mark_price_suffix(update_interval_ms)?;
    symbol_topic(symbol, &format!("@markPrice{}", suffix))
}

pub fn all_mark_price(update_interval_ms: Option<u32>) -> Result<String, ExchangeError> {
    Ok(format!("{}{}", ALL_MARK_PRICE, mark_price_suffix(update_interval_ms)?))
}

pub fn mini_ticker(symbol: &str) -> Result<String, ExchangeError> {
    symbol_topic(symbol, "@miniTicker")
}

pub fn ticker(symbol: &str) -> Result<String, ExchangeError> {
    symbol_topic(symbol, "@ticker")
}

pub fn agg_trade(symbol: &str) -> Result<String, ExchangeError> {
    symbol_topic(symbol, "@aggTrade")
}

pub fn book_ticker(symbol: &str) -> Result<String, ExchangeError> {
    symbol_topic(symbol, "@bookTicker")
}

pub fn liquidation(symbol: &str) -> Result<String, ExchangeError> {
    symbol_topic(symbol, "@forceOrder")
}

fn depth_speed_suffix(update_speed_ms: Option<u32>) -> Result<String, ExchangeError> {
    match update_speed_ms {
        Some(ms) => {
            validate_one_of("updateInterval", ms, &[100, 250, 500])?;
            Ok(format!("@{}ms", ms))
        }
        None => Ok(String::new()),
    }
}

/// `<symbol>@depth<levels>[@<ms>ms]`
pub fn partial_depth(
    symbol: &str,
    levels: u32,
    update_speed_ms: Option<u32>,
) -> Result<String, ExchangeError> {
    validate_one_of("levels", levels, &[5, 10, 20])?;
    let speed = depth_speed_suffix(update_speed_ms)?;
    symbol_topic(symbol, &format!("@depth{}{}", levels, speed))
}

/// `<symbol>@depth[@<ms>ms]`
pub fn diff_depth(symbol: &str, update_speed_ms: Option<u32>) -> Result<String, ExchangeError> {
    let speed = depth_speed_suffix(update_speed_ms)?;
    symbol_topic(symbol, &format!("@depth{}", speed))
}

/// Composite index symbols are used exactly as given
pub fn composite_index(symbol: &str) -> Result<String, ExchangeError> {
    validate_symbol(symbol)?;
    Ok(format!("{}@compositeIndex", symbol))
}

pub fn token_nav(token: &str) -> Result<String, ExchangeError> {
    token_topic(token, "@tokenNav")
}

pub fn token_kline(token: &str, interval: KlineInterval) -> Result<String, ExchangeError> {
    token_topic(token, &format!("@nav_kline_{}", interval))
}
