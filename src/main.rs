use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courtbook::notify::BookingNotice;
use courtbook::{BookingService, Config, FacilityCatalog};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    courtbook::observability::init(config.metrics_port);

    let catalog = match &config.catalog {
        Some(path) => FacilityCatalog::load(path)?,
        None => FacilityCatalog::sports_complex(),
    };

    info!("courtbook starting");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  timezone: {}", config.timezone);
    info!("  facilities: {}", catalog.facilities().len());
    info!("  clear policy: {:?}", config.clear_policy);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let service = Arc::new(BookingService::open(&config, catalog).await?);
    let shutdown = CancellationToken::new();

    let scheduler = tokio::spawn(service.lifecycle().run(shutdown.clone()));

    let mut tasks = vec![scheduler];
    for facility in service.catalog().facilities() {
        let mut rx = service.subscribe(&facility.name);
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    notice = rx.recv() => match notice {
                        Ok(BookingNotice::Created(b)) => {
                            info!(booking_id = %b.id, facility = %b.facility, user_id = %b.user_id, "booking created");
                        }
                        Ok(BookingNotice::StatusChanged(b)) => {
                            info!(booking_id = %b.id, facility = %b.facility, status = %b.status, "booking status changed");
                        }
                        Err(RecvError::Lagged(n)) => tracing::warn!("notice logger lagged by {n}"),
                        Err(RecvError::Closed) => return,
                    },
                    _ = token.cancelled() => return,
                }
            }
        }));
    }

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received");
    shutdown.cancel();

    let drain = futures::future::join_all(tasks);
    if tokio::time::timeout(std::time::Duration::from_secs(10), drain).await.is_err() {
        tracing::warn!("drain timeout, background tasks still running");
    }

    info!("courtbook stopped");
    Ok(())
}
