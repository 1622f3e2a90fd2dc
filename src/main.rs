use std::sync::Arc;

use tracing::info;

use labres::clock::SystemClock;
use labres::config::Config;
use labres::engine::{Engine, EngineDeps};
use labres::notify::{self, LogNotifier, NotifyQueue};
use labres::reconciler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    labres::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let (queue, notify_rx) = NotifyQueue::channel(config.notify_queue);
    let dispatcher = tokio::spawn(notify::run_dispatcher(notify_rx, Arc::new(LogNotifier)));

    let deps = EngineDeps {
        clock: Arc::new(SystemClock),
        notify: queue,
        policy: config.policy,
        admin_email: config.admin_email.clone(),
    };
    let engine = Arc::new(Engine::new(config.wal_path(), deps)?);

    let reconciler = tokio::spawn(reconciler::run_reconciler(
        engine.clone(),
        config.reconcile_interval,
        config.reminder_lead,
    ));
    let compactor = tokio::spawn(reconciler::run_compactor(
        engine.clone(),
        config.compact_threshold,
    ));

    info!("labres started");
    info!("  data_dir: {}", config.data_dir.display());
    info!(
        "  hours: {}:00-{}:00 (utc offset {}s)",
        config.policy.open_hour, config.policy.close_hour, config.policy.utc_offset_secs
    );
    info!("  reconcile every {}s", config.reconcile_interval.as_secs());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown on SIGTERM/ctrl-c
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received, stopping background tasks");
    reconciler.abort();
    compactor.abort();
    let _ = reconciler.await;
    let _ = compactor.await;
    // Dropping the engine closes the notification queue; let the dispatcher
    // flush what is already queued.
    drop(engine);
    let drain = tokio::time::timeout(std::time::Duration::from_secs(5), dispatcher).await;
    if drain.is_err() {
        tracing::warn!("notification dispatcher did not drain in time");
    }

    info!("labres stopped");
    Ok(())
}
