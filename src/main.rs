use std::sync::Arc;
use std::time::Instant;

use doge_bridge_relay::api::{self, AppState};
use doge_bridge_relay::address_manager::AddressManager;
use doge_bridge_relay::config::Config;
use doge_bridge_relay::rate_limit::RateLimiter;
use doge_bridge_relay::resilience::{Resilient, ResilientCaller};
use doge_bridge_relay::service::BridgeService;
use doge_bridge_relay::settlement::{EvmSettlementClient, SettlementChain};
use doge_bridge_relay::source::{SourceChainRpc, SourceRpcClient};
use doge_bridge_relay::tx_builder::{parse_secret_key, TransactionBuilder};
use doge_bridge_relay::withdrawal::WithdrawalLedger;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting Dogecoin bridge relay");

    let config = Config::load()?;
    tracing::info!(
        network = %config.source.network,
        settlement_chain_id = config.settlement.chain_id,
        confirmations = config.deposits.required_confirmations,
        "Configuration loaded"
    );

    // Remote clients, each behind its own breaker
    let source_caller = Arc::new(ResilientCaller::new(
        "source",
        config.retry_config(),
        config.breaker_config(),
        config.rpc_timeout(),
    ));
    let settlement_caller = Arc::new(ResilientCaller::new(
        "settlement",
        config.retry_config(),
        config.breaker_config(),
        config.rpc_timeout(),
    ));

    let source: Arc<dyn SourceChainRpc> = Arc::new(Resilient::new(
        SourceRpcClient::new(&config.source_rpc_config())?,
        source_caller.clone(),
    ));
    let settlement: Arc<dyn SettlementChain> = Arc::new(Resilient::new(
        EvmSettlementClient::new(&config.settlement_client_config())?,
        settlement_caller.clone(),
    ));

    let builder = TransactionBuilder::new(
        config.source.network,
        parse_secret_key(&config.source.private_key)?,
        config.deposits.dust_threshold,
        config.fee_policy(),
    );
    let operator_address = builder.operator_address();
    tracing::info!(operator_address = %operator_address, "Operator payout address");

    let addresses = Arc::new(AddressManager::new(config.source.network));
    let ledger = WithdrawalLedger::shared(
        config.withdrawal_retention(),
        config.withdrawals.max_records,
    );

    let mut service = BridgeService::new(
        config.service_config(),
        source,
        settlement,
        addresses,
        builder,
        ledger,
    )
    .with_callers(vec![source_caller, settlement_caller]);

    service.start().await?;

    let (api_shutdown_tx, api_shutdown_rx) = tokio::sync::watch::channel(false);
    let state = AppState {
        handle: service.handle(),
        limiter: Arc::new(RateLimiter::new(config.rate_limit_config())),
        network: config.source.network,
        dust_threshold: config.deposits.dust_threshold,
        operator_address,
        started_at: Instant::now(),
        admin_token: config.api.admin_token.clone(),
        signature_max_age: std::time::Duration::from_secs(config.api.signature_max_age_secs),
    };
    if state.admin_token.is_none() {
        tracing::warn!("API_ADMIN_TOKEN not set, operator endpoints are disabled");
    }
    let api_addr = config.api.bind_addr;
    let api_task = tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, state, api_shutdown_rx).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    wait_for_shutdown_signal().await;

    let _ = api_shutdown_tx.send(true);
    service.stop().await;
    if let Err(e) = api_task.await {
        tracing::error!(error = %e, "API task ended abnormally");
    }

    let in_flight = service.in_flight_withdrawals().await;
    if !in_flight.is_empty() {
        tracing::warn!(
            count = in_flight.len(),
            ids = ?in_flight.iter().map(|w| w.withdrawal_id.as_str()).collect::<Vec<_>>(),
            "Withdrawals still processing at shutdown, reconcile against the source chain"
        );
    }

    tracing::info!("Dogecoin bridge relay stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output.
/// `LOG_FORMAT=json` switches to JSON lines.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,doge_bridge_relay=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
