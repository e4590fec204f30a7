use bigbrotr::config::{self, Secrets, SynchronizerConfig};
use bigbrotr::db::{ConnectionPool, Database};
use bigbrotr::lifecycle::{CycleOutcome, Lifecycle};
use bigbrotr::metrics::{self, ServiceMetrics};
use bigbrotr::services::synchronizer::Synchronizer;
use bigbrotr::ws::ProxyConfig;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "synchronizer", about = "Archives events from validated relays")]
struct Args {
    #[arg(long, env = "BIGBROTR_CONFIG")]
    config: PathBuf,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long)]
    once: bool,
    #[arg(long, env = "BIGBROTR_SOCKS5_ADDR")]
    socks5_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    std::env::set_var("RUST_LOG", &args.log_level);
    bigbrotr::init_tracing();

    let cfg: SynchronizerConfig = config::load(&args.config)?;
    cfg.service.validate()?;
    cfg.database.validate()?;
    let secrets = Secrets::from_env();

    let pool = ConnectionPool::connect(&cfg.database, "writer", secrets.writer_password()?).await?;
    let db = Database::new(pool, cfg.database.batch_max_size);
    db.migrate().await?;

    let metrics = Arc::new(ServiceMetrics::new("synchronizer"));
    let metrics_cfg = cfg.service.metrics.clone();
    tokio::spawn({
        let metrics = metrics.clone();
        async move {
            if let Err(e) = metrics::serve(&metrics_cfg, metrics).await {
                tracing::error!(target: "bigbrotr::synchronizer", error = %e, "metrics server exited");
            }
        }
    });

    let proxy = args.socks5_addr.map(|addr| ProxyConfig { socks5_addr: addr });
    let keys = secrets.nostr_keys()?;
    let service = Arc::new(Synchronizer::new(db, cfg.clone(), proxy, keys));
    let lifecycle = Lifecycle::new(
        service,
        cfg.service.interval(),
        cfg.service.max_consecutive_failures,
        metrics,
    );

    if args.once {
        let outcome = lifecycle.run_once().await;
        std::process::exit(if outcome == CycleOutcome::Success { 0 } else { 1 });
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::select! {
        _ = lifecycle.run_forever() => {}
        _ = shutdown => {
            tracing::info!(target: "bigbrotr::synchronizer", "received ctrl-c, shutting down");
            lifecycle.request_shutdown();
        }
    }

    Ok(())
}
