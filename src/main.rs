mod clock;
mod database;
mod notify;
mod orchestrator;
mod pesapal;
mod server;
mod settings;
mod vouchers;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::clock::{Clock, SystemClock};
use crate::database::Database;
use crate::orchestrator::{OrchestratorSettings, PaymentOrchestrator};
use crate::pesapal::PesapalProvider;
use crate::server::AppState;
use crate::vouchers::VoucherStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load configuration from config.toml and the environment
    let cfg = settings::Config::load();
    if let Err(e) = cfg.validate() {
        tracing::error!(error = %e, "invalid configuration; exiting");
        return Err(e.into());
    }
    tracing::info!(pesapal = ?cfg.pesapal, sms = ?cfg.sms, "Starting VoucherWave payment processor");

    let db = Database::open(&cfg.database_path)
        .with_context(|| format!("opening database at {}", cfg.database_path))?;
    let store = VoucherStore::new(db);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ipn_url = format!("{}/payment-notifications", cfg.public_base_url());
    let provider = PesapalProvider::new(&cfg.pesapal, ipn_url.clone(), clock.clone())?;

    // Registering early surfaces bad credentials at start-up; submit_order
    // registers lazily if this fails.
    if let Err(e) = provider.register_callback_channel(&ipn_url).await {
        tracing::warn!(error = %e, "Could not register Pesapal IPN at start-up");
    }

    let timeout = Duration::from_millis(cfg.pesapal.timeout_ms.max(1));
    let notifier = notify::build_notifier(&cfg.sms, timeout)?;

    let orchestrator = PaymentOrchestrator::new(
        store,
        Arc::new(provider),
        notifier,
        clock.clone(),
        OrchestratorSettings::from_config(&cfg),
    );
    let state = AppState::new(orchestrator, clock, cfg.public_base_url())?;

    server::run_server(cfg.server_port, state).await
}
