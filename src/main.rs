use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};

use petcare_core as petcare;
use petcare_core::events::{EventSender, LoggingSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = petcare::config::load_config().context("loading configuration")?;
    petcare::config::init_tracing(cfg.log_level(), cfg.log_json);
    info!(environment = %cfg.environment, "Starting petcare worker");

    let db_pool = petcare::db::establish_connection_from_app_config(&cfg)
        .await
        .context("connecting to database")?;
    if cfg.auto_migrate {
        petcare::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    petcare::db::check_connection(&db_pool).await?;

    let db = Arc::new(db_pool);
    let (event_sender, event_rx) = EventSender::channel(cfg.event_channel_capacity);
    let events = tokio::spawn(petcare::events::process_events(
        event_rx,
        Arc::new(LoggingSink),
    ));

    let services = petcare::CoreServices::new(db.clone(), cfg.clone(), event_sender);

    run_until(&services, cfg.reconciliation_interval_secs, shutdown_signal()).await;

    info!("Shutting down");
    drop(services);
    // All senders are gone once the services are dropped, so the processor drains and exits.
    if let Err(e) = events.await {
        warn!(error = %e, "Event processor ended abnormally");
    }

    match Arc::try_unwrap(db) {
        Ok(pool) => petcare::db::close_pool(pool).await?,
        Err(_) => warn!("Database pool still shared at shutdown; leaving it to drop"),
    }
    Ok(())
}

/// Runs maintenance every `interval_secs` (0 disables it) until `shutdown` resolves.
async fn run_until<F>(services: &petcare::CoreServices, interval_secs: u64, shutdown: F)
where
    F: Future<Output = ()>,
{
    // Polled across iterations so a signal arriving mid-pass is still seen
    tokio::pin!(shutdown);

    if interval_secs == 0 {
        info!("Periodic reconciliation disabled");
        shutdown.await;
        return;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tokio::select! {
                    _ = run_maintenance(services) => {}
                    _ = &mut shutdown => break,
                }
            }
            _ = &mut shutdown => break,
        }
    }
}

async fn run_maintenance(services: &petcare::CoreServices) {
    match services.reports.reconcile().await {
        Ok(report) if !report.is_clean() => warn!(
            discrepancies = report.discrepancies.len(),
            items = report.items_checked,
            "Reconciliation found drift"
        ),
        Ok(_) => {}
        Err(e) => error!(error = %e, "Reconciliation failed"),
    }

    match services.reports.low_stock().await {
        Ok(levels) => {
            for level in levels {
                warn!(
                    variant_id = %level.variant_id,
                    location_code = %level.location_code,
                    available = level.available,
                    reorder_threshold = level.reorder_threshold,
                    "Low stock"
                );
            }
        }
        Err(e) => error!(error = %e, "Low stock scan failed"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
