pub mod config;
pub mod detector;
pub mod download;
pub mod error;
pub mod gateway;
pub mod monitor;
pub mod notify;
pub mod paths;
pub mod platform;
pub mod scheduler;
pub mod settings;
pub mod supervisor;
pub mod update;
pub mod version;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::broadcast;

use config::load_config;
pub use error::{AppError, ErrorKind, Result};
use gateway::HttpGateway;
use notify::LogNotificationSink;
use settings::JsonFileSettingsStore;
pub use supervisor::{Supervisor, SupervisorDeps, SupervisorEvent, SupervisorOptions};
use update::SystemInstallHandoff;

/// Run the supervisor headless until Ctrl-C.
pub async fn run() -> Result<()> {
    let data_dir = paths::get_data_dir();
    paths::ensure_data_dirs(&data_dir)?;

    let config = load_config(&paths::config_path(&data_dir))?;
    let settings = Arc::new(JsonFileSettingsStore::open(&paths::settings_path(
        &data_dir,
    )));

    let client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(AppError::from)?;
    let gateway = Arc::new(
        HttpGateway::new(client, &config.api_base).with_request_timeout(config.request_timeout()),
    );

    log::info!(
        "MineGlance supervisor {} ({}), {} wallet(s) configured",
        env!("CARGO_PKG_VERSION"),
        config.platform().id(),
        config.wallets.len()
    );

    let supervisor = Supervisor::new(
        SupervisorOptions::from_config(&config, paths::get_updates_dir(&data_dir)),
        SupervisorDeps {
            stats: Arc::clone(&gateway) as Arc<dyn gateway::StatsGateway>,
            releases: Arc::clone(&gateway) as Arc<dyn gateway::ReleaseGateway>,
            account: gateway,
            sink: Arc::new(LogNotificationSink),
            settings,
            handoff: Arc::new(SystemInstallHandoff),
        },
    )
    .await?;
    supervisor.start();

    let mut events = supervisor.subscribe_events();
    let listener = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SupervisorEvent::StatsRefreshed { wallets, at }) => {
                    for stats in &wallets {
                        log::info!(
                            "{}: {} {} | {} online, {} offline",
                            stats.wallet_id,
                            stats.hashrate,
                            stats.hashrate_unit,
                            stats.workers_online,
                            stats.workers_offline
                        );
                    }
                    log::debug!("Stats refreshed at {}", at);
                }
                Ok(SupervisorEvent::WorkersOffline(_)) => {}
                Ok(SupervisorEvent::SubscriptionRefreshed(info)) => {
                    log::info!("Subscription: {}", info.plan.as_deref().unwrap_or("free"));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Event listener lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
    }

    supervisor.shutdown();
    listener.abort();
    Ok(())
}
