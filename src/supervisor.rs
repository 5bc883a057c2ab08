//! Session-level wiring of timers, stats monitoring and the update pipeline.

use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::config::{SupervisorConfig, WalletConfig};
use crate::detector::AlertEvent;
use crate::error::{AppError, Result};
use crate::gateway::{AccountGateway, ReleaseGateway, StatsGateway, SubscriptionInfo, WalletStats};
use crate::monitor::StatsMonitor;
use crate::notify::NotificationSink;
use crate::platform::Platform;
use crate::scheduler::{tick_fn, PollScheduler, TickFn, TimerKind, TimerSpec, TimerState, TriggerOutcome};
use crate::settings::{
    ensure_install_id, keys, ScheduleConfig, SettingsStore, MAX_REFRESH_INTERVAL_MINUTES,
};
use crate::update::{CheckOutcome, InstallHandoff, PipelineOptions, UpdatePipeline, UpdateState};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    StatsRefreshed {
        wallets: Vec<WalletStats>,
        at: DateTime<Utc>,
    },
    WorkersOffline(AlertEvent),
    SubscriptionRefreshed(SubscriptionInfo),
}

/// External collaborators of the supervisor.
pub struct SupervisorDeps {
    pub stats: Arc<dyn StatsGateway>,
    pub releases: Arc<dyn ReleaseGateway>,
    pub account: Arc<dyn AccountGateway>,
    pub sink: Arc<dyn NotificationSink>,
    pub settings: Arc<dyn SettingsStore>,
    pub handoff: Arc<dyn InstallHandoff>,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub version: String,
    pub platform: Platform,
    pub updates_dir: PathBuf,
    pub request_timeout: Duration,
    pub download_timeout: Duration,
    pub heartbeat_period: Duration,
    pub subscription_period: Duration,
    pub update_check_period: Duration,
    pub wallets: Vec<WalletConfig>,
}

impl SupervisorOptions {
    pub fn from_config(config: &SupervisorConfig, updates_dir: PathBuf) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: config.platform(),
            updates_dir,
            request_timeout: config.request_timeout(),
            download_timeout: config.download_timeout(),
            heartbeat_period: config.heartbeat_period(),
            subscription_period: config.subscription_period(),
            update_check_period: config.update_check_period(),
            wallets: config.wallets.clone(),
        }
    }
}

const EVENT_CAPACITY: usize = 128;

pub struct Supervisor {
    options: SupervisorOptions,
    install_id: String,
    scheduler: PollScheduler,
    monitor: StatsMonitor,
    pipeline: Arc<UpdatePipeline>,
    account: Arc<dyn AccountGateway>,
    settings: Arc<dyn SettingsStore>,
    wallets: RwLock<Vec<WalletConfig>>,
    subscription: RwLock<Option<SubscriptionInfo>>,
    auth_token: RwLock<Option<String>>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    /// Build a supervisor. Nothing is scheduled until [`Supervisor::start`].
    pub async fn new(options: SupervisorOptions, deps: SupervisorDeps) -> Result<Arc<Self>> {
        let install_id = ensure_install_id(deps.settings.as_ref()).await?;

        let pipeline = UpdatePipeline::new(
            PipelineOptions {
                current_version: options.version.clone(),
                platform: options.platform,
                updates_dir: options.updates_dir.clone(),
                request_timeout: options.request_timeout,
                download_timeout: options.download_timeout,
            },
            deps.releases,
            Arc::clone(&deps.settings),
            deps.handoff,
        );
        let monitor = StatsMonitor::new(deps.stats, deps.sink, options.request_timeout);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Arc::new(Self {
            wallets: RwLock::new(options.wallets.clone()),
            options,
            install_id,
            scheduler: PollScheduler::new(),
            monitor,
            pipeline,
            account: deps.account,
            settings: deps.settings,
            subscription: RwLock::new(None),
            auth_token: RwLock::new(None),
            events,
        }))
    }

    /// Install the update-check timer and resume a saved session, if any.
    pub fn start(self: &Arc<Self>) {
        self.install_update_timer();
        if let Some(token) = self.settings.get_string(keys::AUTH_TOKEN) {
            log::info!("Resuming saved session");
            self.start_session(token);
        }
    }

    /// Start a session: heartbeat, subscription and stats timers.
    pub async fn login(self: &Arc<Self>, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::other("Empty auth token"));
        }
        self.settings
            .set(keys::AUTH_TOKEN, Value::String(token.to_string()));
        if let Err(e) = self.settings.save().await {
            log::error!("Failed to persist session token: {}", e);
        }
        if self.is_logged_in() {
            self.end_session();
            self.install_update_timer();
        }
        self.start_session(token.to_string());
        Ok(())
    }

    /// Tear down every timer of the session and forget its state.
    pub async fn logout(self: &Arc<Self>) -> Result<()> {
        self.end_session();
        self.install_update_timer();

        self.settings.remove(keys::AUTH_TOKEN);
        self.settings.save().await?;
        log::info!("Logged out");
        Ok(())
    }

    fn start_session(self: &Arc<Self>, token: String) {
        *self
            .auth_token
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        let schedule = ScheduleConfig::from_store(self.settings.as_ref());
        let weak = Arc::downgrade(self);

        self.scheduler.start(
            TimerKind::Heartbeat,
            TimerSpec::every(self.options.heartbeat_period).immediately(),
            session_tick(&weak, move |this| {
                let token = token.clone();
                async move { this.send_heartbeat(&token).await }
            }),
        );
        self.scheduler.start(
            TimerKind::Subscription,
            TimerSpec::every(self.options.subscription_period).immediately(),
            session_tick(&weak, |this| async move { this.refresh_subscription().await }),
        );
        self.scheduler.start(
            TimerKind::StatsRefresh,
            TimerSpec::every(schedule.refresh_period()).immediately(),
            session_tick(&weak, |this| async move {
                this.refresh_stats().await;
                Ok(())
            }),
        );
        log::info!(
            "Session started, refreshing stats every {} minute(s)",
            schedule.refresh_interval_minutes
        );
    }

    fn end_session(&self) {
        self.scheduler.stop_all();
        self.monitor.clear_baselines();
        *self
            .subscription
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
        *self
            .auth_token
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn install_update_timer(self: &Arc<Self>) {
        self.scheduler.start(
            TimerKind::UpdateCheck,
            TimerSpec::every(self.options.update_check_period).immediately(),
            session_tick(&Arc::downgrade(self), |this| async move {
                this.check_for_updates().await;
                Ok(())
            }),
        );
    }

    async fn send_heartbeat(&self, token: &str) -> Result<()> {
        match tokio::time::timeout(
            self.options.request_timeout,
            self.account
                .send_heartbeat(token, &self.install_id, &self.options.version),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::timeout("heartbeat")),
        }
    }

    async fn refresh_subscription(&self) -> Result<()> {
        let Some(token) = self.auth_token() else {
            return Ok(());
        };
        let info = match tokio::time::timeout(
            self.options.request_timeout,
            self.account.fetch_subscription(&token),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(AppError::timeout("subscription refresh")),
        };

        log::debug!("Subscription plan: {:?}", info.plan);
        *self
            .subscription
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(info.clone());
        let _ = self.events.send(SupervisorEvent::SubscriptionRefreshed(info));
        Ok(())
    }

    /// One stats cycle over the wallets and settings as they are right now.
    pub async fn refresh_stats(&self) {
        let wallets = self.wallets();
        let schedule = ScheduleConfig::from_store(self.settings.as_ref());
        let report = self.monitor.run_cycle(&wallets, schedule).await;

        for alert in report.alerts {
            let _ = self.events.send(SupervisorEvent::WorkersOffline(alert));
        }
        let _ = self.events.send(SupervisorEvent::StatsRefreshed {
            wallets: report.stats,
            at: report.at,
        });
    }

    pub async fn check_for_updates(&self) -> CheckOutcome {
        self.pipeline.check().await
    }

    /// Persist a new refresh interval and reschedule the stats timer.
    pub async fn set_refresh_interval(&self, minutes: u64) -> Result<()> {
        if !(1..=MAX_REFRESH_INTERVAL_MINUTES).contains(&minutes) {
            return Err(AppError::config(format!(
                "refresh interval must be between 1 and {} minutes, got {}",
                MAX_REFRESH_INTERVAL_MINUTES, minutes
            )));
        }
        self.settings
            .set(keys::REFRESH_INTERVAL, Value::from(minutes));
        self.settings.save().await?;

        let period = ScheduleConfig::from_store(self.settings.as_ref()).refresh_period();
        if self.scheduler.set_period(TimerKind::StatsRefresh, period) {
            log::info!("Stats refresh interval set to {} minute(s)", minutes);
        }
        Ok(())
    }

    /// Persist the notification toggle. Applies from the next stats cycle.
    pub async fn set_notifications_enabled(&self, enabled: bool) -> Result<()> {
        self.settings
            .set(keys::SHOW_NOTIFICATIONS, Value::Bool(enabled));
        self.settings.save().await
    }

    /// The app window gained focus.
    pub fn on_focus(&self) -> TriggerOutcome {
        self.scheduler.trigger_now(TimerKind::UpdateCheck)
    }

    /// Refresh stats now, unless a refresh is already running.
    pub fn refresh_now(&self) -> TriggerOutcome {
        self.scheduler.trigger_now(TimerKind::StatsRefresh)
    }

    /// Replace the monitored wallets. Baselines of removed wallets are
    /// dropped at the next cycle boundary, so a wallet added back later is
    /// seeded again.
    pub fn set_wallets(&self, wallets: Vec<WalletConfig>) {
        let mut current = self.wallets.write().unwrap_or_else(|e| e.into_inner());
        let removed: Vec<String> = current
            .iter()
            .filter(|old| !wallets.iter().any(|w| w.id == old.id))
            .map(|old| old.id.clone())
            .collect();
        self.monitor.forget_wallets(removed);
        *current = wallets;
    }

    pub fn wallets(&self) -> Vec<WalletConfig> {
        self.wallets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn dismiss_update(&self) -> Result<()> {
        self.pipeline.dismiss().await
    }

    pub fn install_update(&self) -> Result<()> {
        self.pipeline.install()
    }

    pub fn update_state(&self) -> UpdateState {
        self.pipeline.state()
    }

    pub fn subscribe_updates(&self) -> watch::Receiver<UpdateState> {
        self.pipeline.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn subscription(&self) -> Option<SubscriptionInfo> {
        self.subscription
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn auth_token(&self) -> Option<String> {
        self.auth_token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.auth_token().is_some()
    }

    pub fn timer_state(&self, kind: TimerKind) -> TimerState {
        self.scheduler.state(kind)
    }

    pub fn timer_period(&self, kind: TimerKind) -> Option<Duration> {
        self.scheduler.period(kind)
    }

    /// Stop every timer and abort a running download.
    pub fn shutdown(&self) {
        self.scheduler.stop_all();
        self.pipeline.shutdown();
        log::info!("Supervisor stopped");
    }
}

/// Build a tick that runs `f` against the supervisor while it is alive.
fn session_tick<F, Fut>(weak: &Weak<Supervisor>, f: F) -> TickFn
where
    F: Fn(Arc<Supervisor>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let weak = Weak::clone(weak);
    let f = Arc::new(f);
    tick_fn(move || {
        let weak = Weak::clone(&weak);
        let f = Arc::clone(&f);
        async move {
            match weak.upgrade() {
                Some(this) => (*f)(this).await,
                None => Ok(()),
            }
        }
    })
}
