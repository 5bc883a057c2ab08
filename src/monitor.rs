//! One stats-refresh cycle: fetch every enabled wallet, feed the detector,
//! deliver offline alerts.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;

use crate::config::WalletConfig;
use crate::detector::{AlertEvent, BaselineRecord, OfflineDetector};
use crate::error::{AppError, Result};
use crate::gateway::{StatsGateway, WalletStats};
use crate::notify::{Notification, NotificationGate, NotificationSink};
use crate::settings::ScheduleConfig;

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub at: DateTime<Utc>,
    pub stats: Vec<WalletStats>,
    pub alerts: Vec<AlertEvent>,
    /// Wallet ids whose fetch failed this cycle.
    pub failed: Vec<String>,
}

pub struct StatsMonitor {
    gateway: Arc<dyn StatsGateway>,
    sink: Arc<dyn NotificationSink>,
    detector: Mutex<OfflineDetector>,
    /// Wallets removed since the last cycle boundary. Their baselines are
    /// dropped by the cycle itself, so a cycle still running on the old
    /// wallet list cannot seed them again afterwards.
    removed: Mutex<HashSet<String>>,
    request_timeout: Duration,
}

impl StatsMonitor {
    pub fn new(
        gateway: Arc<dyn StatsGateway>,
        sink: Arc<dyn NotificationSink>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            sink,
            detector: Mutex::new(OfflineDetector::new()),
            removed: Mutex::new(HashSet::new()),
            request_timeout,
        }
    }

    async fn fetch(&self, wallet: &WalletConfig) -> Result<WalletStats> {
        match tokio::time::timeout(self.request_timeout, self.gateway.fetch_wallet_stats(wallet))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::timeout(&format!("stats fetch for {}", wallet.id))),
        }
    }

    /// Run one cycle over `wallets` with the settings captured at cycle start.
    ///
    /// A wallet whose fetch fails keeps its baseline untouched and does not
    /// hold up the others.
    pub async fn run_cycle(&self, wallets: &[WalletConfig], schedule: ScheduleConfig) -> CycleReport {
        self.drop_removed_baselines();
        let gate = NotificationGate::new(Arc::clone(&self.sink), schedule.notifications_enabled);
        let active: Vec<&WalletConfig> = wallets.iter().filter(|w| w.enabled).collect();
        log::debug!("Refreshing stats for {} wallet(s)", active.len());

        let results = join_all(active.iter().map(|wallet| async move {
            (*wallet, self.fetch(wallet).await)
        }))
        .await;

        let mut report = CycleReport {
            at: Utc::now(),
            stats: Vec::with_capacity(results.len()),
            alerts: Vec::new(),
            failed: Vec::new(),
        };

        for (wallet, result) in results {
            let stats = match result {
                Ok(stats) => stats,
                Err(e) => {
                    log::warn!("Stats fetch for {} failed: {}", wallet.name, e);
                    report.failed.push(wallet.id.clone());
                    continue;
                }
            };

            let alert = self
                .detector
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .observe(&wallet.id, stats.workers_online, stats.workers_offline);

            if let Some(alert) = alert {
                log::warn!(
                    "{}: {} worker(s) went offline ({} online, {} offline)",
                    wallet.name,
                    alert.went_offline,
                    alert.online_count,
                    alert.offline_count
                );
                let notification = Notification::workers_offline(&wallet.name, &alert);
                if let Err(e) = gate.deliver(&notification).await {
                    log::error!("Failed to send notification: {}", e);
                }
                report.alerts.push(alert);
            }
            report.stats.push(stats);
        }

        self.drop_removed_baselines();
        report
    }

    fn drop_removed_baselines(&self) {
        let removed = {
            let mut pending = self.removed.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        if removed.is_empty() {
            return;
        }
        self.detector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .forget_entities(removed.iter().map(String::as_str));
    }

    pub fn baseline(&self, wallet_id: &str) -> Option<BaselineRecord> {
        self.detector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .baseline(wallet_id)
    }

    /// Mark wallets as removed. Their baselines go at the next cycle
    /// boundary, even if the wallet has been added back by then.
    pub fn forget_wallets(&self, wallet_ids: impl IntoIterator<Item = String>) {
        self.removed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(wallet_ids);
    }

    pub fn clear_baselines(&self) {
        self.removed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.detector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
