use bigbrotr::config::{self, Secrets, SeederConfig};
use bigbrotr::db::{ConnectionPool, Database};
use bigbrotr::model::{CandidatePayload, Relay, ServiceState, StateType};
use clap::Parser;
use std::path::PathBuf;

const SERVICE_NAME: &str = "validator";

#[derive(Parser)]
#[command(name = "seeder", about = "Loads an initial set of relay URLs as validator candidates")]
struct Args {
    #[arg(long, env = "BIGBROTR_CONFIG")]
    config: PathBuf,
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    std::env::set_var("RUST_LOG", &args.log_level);
    bigbrotr::init_tracing();

    let cfg: SeederConfig = config::load(&args.config)?;
    cfg.database.validate()?;
    let secrets = Secrets::from_env();

    let pool = ConnectionPool::connect(&cfg.database, "writer", secrets.writer_password()?).await?;
    let db = Database::new(pool, cfg.database.batch_max_size);
    db.migrate().await?;

    let raw = std::fs::read_to_string(&cfg.file_path)?;
    let now = chrono::Utc::now().timestamp();

    let existing = db.list_relays(None).await?;
    let known: std::collections::HashSet<String> =
        existing.iter().map(|r| r.url().to_string()).collect();

    let mut states = Vec::new();
    let mut skipped = 0usize;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let relay = match Relay::new(line, now) {
            Ok(relay) => relay,
            Err(e) => {
                tracing::warn!(target: "bigbrotr::seeder", url = line, error = %e, "skipping invalid seed url");
                skipped += 1;
                continue;
            }
        };
        if known.contains(relay.url()) {
            continue;
        }
        let payload = CandidatePayload {
            network: relay.network().as_str().to_string(),
            failed_attempts: 0,
            discovered_at: now,
        };
        let value = serde_json::to_value(&payload)?;
        states.push(ServiceState::new(
            SERVICE_NAME,
            StateType::Candidate,
            relay.url(),
            value,
            now,
        ));
    }

    let accepted = states.len();
    if !states.is_empty() {
        db.upsert_service_state(&states).await?;
    }

    tracing::info!(
        target: "bigbrotr::seeder",
        accepted,
        skipped,
        file = %cfg.file_path,
        "seeding complete"
    );

    Ok(())
}
