use clap::Parser;
use loyalty::{Config, Loyalty, telemetry};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully..."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before anything else that might build a TLS client
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = loyalty::config::Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export)?;
    tracing::debug!("{:?}", args);

    let pool_settings = &config.database.pool;
    let pool = PgPoolOptions::new()
        .max_connections(pool_settings.max_connections)
        .min_connections(pool_settings.min_connections)
        .acquire_timeout(pool_settings.acquire_timeout)
        .connect(&config.database.url)
        .await?;

    loyalty::migrator().run(&pool).await?;
    info!("Database migrations applied");

    let service = Loyalty::new(pool.clone(), &config)?;
    let shutdown = CancellationToken::new();

    let job = if config.voucher_check.enabled {
        Some(tokio::spawn(service.usage_job().run(shutdown.clone())))
    } else {
        info!("Voucher usage job disabled");
        None
    };

    shutdown_signal().await;
    shutdown.cancel();

    if let Some(job) = job
        && let Err(e) = job.await
    {
        tracing::error!(error = %e, "Voucher usage job panicked");
    }

    pool.close().await;
    telemetry::shutdown_telemetry();
    Ok(())
}
