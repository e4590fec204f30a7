use bigbrotr::config::{self, FinderConfig, Secrets};
use bigbrotr::db::{ConnectionPool, Database};
use bigbrotr::lifecycle::Lifecycle;
use bigbrotr::metrics::{self, ServiceMetrics};
use bigbrotr::services::finder::Finder;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "finder", about = "Grows the candidate relay pool")]
struct Args {
    #[arg(long, env = "BIGBROTR_CONFIG")]
    config: PathBuf,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    std::env::set_var("RUST_LOG", &args.log_level);
    bigbrotr::init_tracing();

    let cfg: FinderConfig = config::load(&args.config)?;
    cfg.service.validate()?;
    cfg.database.validate()?;
    let secrets = Secrets::from_env();

    let pool = ConnectionPool::connect(&cfg.database, "writer", secrets.writer_password()?).await?;
    let db = Database::new(pool, cfg.database.batch_max_size);
    db.migrate().await?;

    let metrics = Arc::new(ServiceMetrics::new("finder"));
    let metrics_cfg = cfg.service.metrics.clone();
    tokio::spawn({
        let metrics = metrics.clone();
        async move {
            if let Err(e) = metrics::serve(&metrics_cfg, metrics).await {
                tracing::error!(target: "bigbrotr::finder", error = %e, "metrics server exited");
            }
        }
    });

    let service = Arc::new(Finder::new(db, cfg.clone()));
    let lifecycle = Lifecycle::new(
        service,
        cfg.service.interval(),
        cfg.service.max_consecutive_failures,
        metrics,
    );

    if args.once {
        let outcome = lifecycle.run_once().await;
        std::process::exit(if outcome == bigbrotr::lifecycle::CycleOutcome::Success {
            0
        } else {
            1
        });
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::select! {
        _ = lifecycle.run_forever() => {}
        _ = shutdown => {
            tracing::info!(target: "bigbrotr::finder", "received ctrl-c, shutting down");
            lifecycle.request_shutdown();
        }
    }

    Ok(())
}
