use anyhow::Context;
use lotusx_fstream::core::config::ExchangeConfig;
use lotusx_fstream::core::types::KlineInterval;
use lotusx_fstream::exchanges::binance_perp::{build_rest_client, connect_socket, UserDataHandlers};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Public streams work without credentials
    let config = ExchangeConfig::from_env("BINANCE_PERP")
        .unwrap_or_else(|_| ExchangeConfig::read_only());

    let socket = connect_socket(&config)
        .await
        .context("failed to connect to the futures stream")?;
    let cancel = CancellationToken::new();

    let klines = socket
        .subscribe_klines(
            &["BTCUSDT", "ETHUSDT"],
            &[KlineInterval::Minutes1],
            |event| {
                let k = &event.data.kline;
                info!(topic = %event.topic, close = %k.close_price, final_bar = k.final_bar, "kline");
            },
            &cancel,
        )
        .await?;

    let mark = socket
        .subscribe_mark_prices(
            &["BTCUSDT"],
            Some(1000),
            |event| info!(mark = %event.data.mark_price, funding = ?event.data.funding_rate, "mark price"),
            &cancel,
        )
        .await?;

    if config.has_credentials() {
        let rest = build_rest_client(&config)?;
        let listen_key = rest.start_user_stream().await?;
        let handlers = UserDataHandlers::new()
            .on_order_update(|event| {
                let order = &event.data.order;
                info!(symbol = %order.symbol, status = %order.status, "order update");
            })
            .on_margin_call(|event| warn!(positions = event.data.positions.len(), "margin call"))
            .on_listen_key_expired(|_| warn!("listen key expired"));
        let account = socket
            .subscribe_user_data(&listen_key, handlers, &cancel)
            .await?;
        info!(subscription = %account.id, "Account stream active");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        () = tokio::time::sleep(Duration::from_secs(30)) => {}
    }

    socket.unsubscribe(klines).await?;
    socket.unsubscribe(mark).await?;
    let remaining = socket.unsubscribe_all().await?;
    info!(remaining, "Unsubscribed");
    socket.close().await?;
    Ok(())
}
