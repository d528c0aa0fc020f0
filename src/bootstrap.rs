use chrono::Duration as ChronoDuration;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    cache::TtlCache,
    clock::{Clock, SystemClock},
    config::Config,
    error::AppResult,
    gateway::{PaymentGateway, PaystackGateway},
    ledger::{LedgerRepository, LedgerStore, MemoryLedger},
    settlement::{
        scheduler::SettlementScheduler, Commission, EscrowReleaseJob, PayoutBatchJob,
        ReconciliationJob, Settlement,
    },
};

pub async fn initialize_app_state(config: Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let ledger: Arc<dyn LedgerStore> = match config.database_url.as_deref() {
        Some(database_url) if !database_url.is_empty() => {
            let pool = initialize_database(database_url).await?;
            Arc::new(LedgerRepository::new(pool))
        }
        _ => {
            warn!("⚠️  DATABASE_URL not set - using in-memory ledger, state is lost on restart");
            Arc::new(MemoryLedger::new())
        }
    };
    info!("✅ Ledger store initialized ({})", ledger.name());

    if config.gateway_secret_key.is_empty() {
        warn!("⚠️  GATEWAY_SECRET_KEY not set - gateway calls will be rejected");
    }
    let gateway: Arc<dyn PaymentGateway> = Arc::new(PaystackGateway::new(
        config.gateway_base_url.clone(),
        config.gateway_secret_key.clone(),
    ));
    info!("✅ Payment gateway initialized: {}", config.gateway_base_url);

    if config.cron_secret().is_none() {
        warn!("⚠️  CRON_SECRET not set - /cron endpoints are OPEN to anyone");
    }

    let state = assemble_state(config, ledger, gateway, Arc::new(SystemClock));

    if state.config.scheduler_enabled {
        SettlementScheduler::new(state.config.scheduler_hour_utc, state.settlement.clone()).start();
        info!(
            "✅ Settlement scheduler started (daily at {:02}:00 UTC)",
            state.config.scheduler_hour_utc
        );
    }

    // Drop expired in-flight markers left by runs that never returned
    let settlement = state.settlement.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            let purged = settlement.purge_stale_locks();
            if purged > 0 {
                info!("🗑️  Purged {} stale job lock(s)", purged);
            }
        }
    });

    Ok(state)
}

/// Wire the jobs and shared state around a store, gateway and clock
pub fn assemble_state(
    config: Config,
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
) -> AppState {
    let escrow = EscrowReleaseJob::new(
        ledger.clone(),
        clock.clone(),
        Commission::new(config.commission_rate),
        config.escrow_holding_period(),
    );
    let payouts = PayoutBatchJob::new(
        ledger.clone(),
        gateway.clone(),
        clock.clone(),
        config.currency.clone(),
        config.payout_stale_after(),
    );
    let reconciliation = ReconciliationJob::new(
        ledger.clone(),
        gateway.clone(),
        clock.clone(),
        config.reconciliation_window(),
        config.reconciliation_gateway_slack(),
    );
    let in_flight = TtlCache::new(
        ChronoDuration::seconds(config.cron_lock_ttl_seconds as i64),
        clock.clone(),
    );

    AppState {
        ledger,
        gateway,
        settlement: Arc::new(Settlement::new(escrow, payouts, reconciliation, in_flight)),
        config: Arc::new(config),
        clock,
    }
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 20 max connections");

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
