//! Self-update pipeline.
//!
//! ```text
//! Idle ──check──▶ Checking ──newer, not dismissed, url──▶ Downloading ──ok──▶ Staged ──install──▶ Installing
//!   ▲                │  no release / up to date / dismissed     │ error                │ dismiss
//!   └────────────────┘                                          ▼                      ▼
//!   ▲                                                         Failed                  Idle
//!   └──────────────────────────── next check ──────────────────┘
//! ```
//!
//! Downloads run on their own task; `check` returns as soon as the
//! download has started. Artifacts are staged at a per-version path, and
//! a version whose artifact is already on disk is never downloaded again.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::download::remove_stale_partials;
use crate::error::{AppError, Result};
use crate::gateway::ReleaseGateway;
use crate::paths::staged_artifact_path;
use crate::platform::Platform;
use crate::settings::{keys, SettingsStore};
use crate::version::{is_newer, version_ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    Checking,
    Downloading,
    Staged,
    Installing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateState {
    pub phase: UpdatePhase,
    pub current_version: String,
    pub latest_version: Option<String>,
    pub download_url: Option<String>,
    pub release_notes: Vec<String>,
    pub staged_artifact_path: Option<PathBuf>,
    pub dismissed_version: Option<String>,
    pub last_error: Option<String>,
    pub progress: Option<DownloadProgress>,
}

/// What the UI should show for the update, if anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateBanner {
    Available {
        version: String,
    },
    Downloading {
        version: String,
        progress: Option<DownloadProgress>,
    },
    Ready {
        version: String,
    },
    Failed {
        version: String,
        error: String,
    },
}

impl UpdateState {
    fn new(current_version: &str, dismissed_version: Option<String>) -> Self {
        Self {
            phase: UpdatePhase::Idle,
            current_version: current_version.to_string(),
            latest_version: None,
            download_url: None,
            release_notes: Vec::new(),
            staged_artifact_path: None,
            dismissed_version,
            last_error: None,
            progress: None,
        }
    }

    /// True when the known latest version is covered by the dismissal.
    pub fn is_suppressed(&self) -> bool {
        match (&self.latest_version, &self.dismissed_version) {
            (Some(latest), Some(dismissed)) => {
                version_ordering(latest, dismissed) != std::cmp::Ordering::Greater
            }
            _ => false,
        }
    }

    pub fn update_available(&self) -> bool {
        self.latest_version
            .as_deref()
            .map(|latest| is_newer(latest, &self.current_version))
            .unwrap_or(false)
    }

    pub fn banner(&self) -> Option<UpdateBanner> {
        if !self.update_available() || self.is_suppressed() {
            return None;
        }
        let version = self.latest_version.clone()?;
        match self.phase {
            UpdatePhase::Idle => Some(UpdateBanner::Available { version }),
            UpdatePhase::Downloading => Some(UpdateBanner::Downloading {
                version,
                progress: self.progress,
            }),
            UpdatePhase::Staged => Some(UpdateBanner::Ready { version }),
            UpdatePhase::Failed => Some(UpdateBanner::Failed {
                version,
                error: self.last_error.clone().unwrap_or_default(),
            }),
            UpdatePhase::Checking | UpdatePhase::Installing => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Another check, a download or an install is in progress.
    Busy,
    /// The version endpoint could not be reached or timed out.
    Unreachable,
    /// The endpoint had no release information.
    NoRelease,
    UpToDate,
    /// A newer version exists but the user dismissed it (or a newer one).
    Suppressed,
    /// A newer version exists but has no download URL.
    Available,
    AlreadyStaged,
    DownloadStarted,
}

/// Hands a staged installer to the OS and ends this process.
pub trait InstallHandoff: Send + Sync {
    fn launch(&self, artifact: &Path) -> Result<()>;
    fn exit(&self);
}

/// Opens the installer with the OS shell and exits with status 0.
#[derive(Debug, Default)]
pub struct SystemInstallHandoff;

impl InstallHandoff for SystemInstallHandoff {
    fn launch(&self, artifact: &Path) -> Result<()> {
        open::that_detached(artifact)
            .map_err(|e| AppError::install(format!("Failed to launch {:?}: {}", artifact, e)))
    }

    fn exit(&self) {
        log::info!("Exiting so the installer can replace application files");
        std::process::exit(0);
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub current_version: String,
    pub platform: Platform,
    pub updates_dir: PathBuf,
    pub request_timeout: Duration,
    pub download_timeout: Duration,
}

/// Holds the pipeline in `Checking` while the version fetch is pending.
/// Dropped unfinished (the check future was cancelled), it settles the
/// pipeline back to where the check found it.
struct CheckingGuard<'a> {
    pipeline: &'a UpdatePipeline,
    prior_staged: Option<PathBuf>,
}

impl CheckingGuard<'_> {
    fn finish(self) -> Option<PathBuf> {
        let mut this = std::mem::ManuallyDrop::new(self);
        this.prior_staged.take()
    }
}

impl Drop for CheckingGuard<'_> {
    fn drop(&mut self) {
        log::debug!("Update check abandoned before the version fetch completed");
        self.pipeline.settle(self.prior_staged.take());
    }
}

pub struct UpdatePipeline {
    options: PipelineOptions,
    gateway: Arc<dyn ReleaseGateway>,
    settings: Arc<dyn SettingsStore>,
    handoff: Arc<dyn InstallHandoff>,
    state: watch::Sender<UpdateState>,
    download: Mutex<Option<JoinHandle<()>>>,
}

impl UpdatePipeline {
    /// Build the pipeline. The dismissed version is loaded from the
    /// settings store here, before any check can run.
    pub fn new(
        options: PipelineOptions,
        gateway: Arc<dyn ReleaseGateway>,
        settings: Arc<dyn SettingsStore>,
        handoff: Arc<dyn InstallHandoff>,
    ) -> Arc<Self> {
        let dismissed = settings.get_string(keys::DISMISSED_UPDATE_VERSION);
        if let Some(version) = &dismissed {
            log::info!("Update {} and older were dismissed earlier", version);
        }

        let removed = remove_stale_partials(&options.updates_dir);
        if removed > 0 {
            log::info!("Removed {} interrupted update download(s)", removed);
        }

        let (state, _) = watch::channel(UpdateState::new(&options.current_version, dismissed));
        Arc::new(Self {
            options,
            gateway,
            settings,
            handoff,
            state,
            download: Mutex::new(None),
        })
    }

    pub fn state(&self) -> UpdateState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdateState> {
        self.state.subscribe()
    }

    /// Run one version check and, when warranted, start the background
    /// download. Never fails: errors are logged and folded into the state.
    pub async fn check(self: &Arc<Self>) -> CheckOutcome {
        let mut prior_staged: Option<PathBuf> = None;
        let began = self.state.send_if_modified(|s| match s.phase {
            UpdatePhase::Checking | UpdatePhase::Downloading | UpdatePhase::Installing => false,
            _ => {
                prior_staged = s.staged_artifact_path.take();
                s.phase = UpdatePhase::Checking;
                s.last_error = None;
                s.progress = None;
                true
            }
        });
        if !began {
            log::debug!("Update check skipped, pipeline busy");
            return CheckOutcome::Busy;
        }

        let checking = CheckingGuard {
            pipeline: self,
            prior_staged,
        };
        let fetched = match tokio::time::timeout(
            self.options.request_timeout,
            self.gateway.fetch_latest_release(self.options.platform),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::timeout("version check")),
        };
        let prior_staged = checking.finish();

        let release = match fetched {
            Ok(Some(release)) => release,
            Ok(None) => {
                log::debug!("No release information for {}", self.options.platform.id());
                self.settle(prior_staged);
                return CheckOutcome::NoRelease;
            }
            Err(e) => {
                log::warn!("Update check failed: {}", e);
                self.settle(prior_staged);
                return CheckOutcome::Unreachable;
            }
        };

        if !is_newer(&release.version, &self.options.current_version) {
            log::debug!(
                "Latest version {} is not newer than {}",
                release.version,
                self.options.current_version
            );
            self.state.send_modify(|s| {
                s.phase = UpdatePhase::Idle;
                s.latest_version = None;
                s.download_url = None;
                s.release_notes.clear();
            });
            return CheckOutcome::UpToDate;
        }

        let dest = staged_artifact_path(
            &self.options.updates_dir,
            &release.version,
            self.options.platform,
        );
        let already_staged = dest.is_file();

        let mut outcome = CheckOutcome::Suppressed;
        self.state.send_modify(|s| {
            s.latest_version = Some(release.version.clone());
            s.download_url = release.download_url.clone();
            s.release_notes = release.release_notes.clone();

            if s.is_suppressed() {
                s.phase = UpdatePhase::Idle;
            } else if already_staged {
                s.phase = UpdatePhase::Staged;
                s.staged_artifact_path = Some(dest.clone());
                outcome = CheckOutcome::AlreadyStaged;
            } else if s.download_url.is_none() {
                s.phase = UpdatePhase::Idle;
                outcome = CheckOutcome::Available;
            } else {
                s.phase = UpdatePhase::Downloading;
                s.progress = Some(DownloadProgress {
                    downloaded: 0,
                    total: None,
                });
                outcome = CheckOutcome::DownloadStarted;
            }
        });

        match outcome {
            CheckOutcome::Suppressed => {
                log::debug!("Update {} suppressed by dismissal", release.version)
            }
            CheckOutcome::AlreadyStaged => {
                log::info!("Update {} already staged at {:?}", release.version, dest)
            }
            CheckOutcome::Available => {
                log::info!("Update {} available without download URL", release.version)
            }
            CheckOutcome::DownloadStarted => {
                if let Some(url) = release.download_url {
                    self.spawn_download(release.version, url, dest);
                }
            }
            _ => {}
        }
        outcome
    }

    /// Return to the phase held before a check that produced nothing.
    fn settle(&self, prior_staged: Option<PathBuf>) {
        self.state.send_modify(|s| match prior_staged {
            Some(path) => {
                s.phase = UpdatePhase::Staged;
                s.staged_artifact_path = Some(path);
            }
            None => s.phase = UpdatePhase::Idle,
        });
    }

    fn spawn_download(self: &Arc<Self>, version: String, url: String, dest: PathBuf) {
        let pipeline = Arc::clone(self);
        let handle = tokio::spawn(async move {
            pipeline.run_download(version, url, dest).await;
        });
        let mut slot = self.download.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handle);
    }

    async fn run_download(&self, version: String, url: String, dest: PathBuf) {
        log::info!("Downloading update {} from {}", version, url);

        let progress = |downloaded: u64, total: Option<u64>| {
            self.state.send_if_modified(|s| {
                if s.phase != UpdatePhase::Downloading {
                    return false;
                }
                s.progress = Some(DownloadProgress { downloaded, total });
                true
            });
        };

        let result = match tokio::time::timeout(
            self.options.download_timeout,
            self.gateway.download_artifact(&url, &dest, &progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                remove_stale_partials(&self.options.updates_dir);
                Err(AppError::timeout("artifact download"))
            }
        };

        match result {
            Ok(bytes) => {
                let mut staged = false;
                self.state.send_modify(|s| {
                    if s.phase != UpdatePhase::Downloading
                        || s.latest_version.as_deref() != Some(version.as_str())
                    {
                        return;
                    }
                    s.progress = None;
                    if s.is_suppressed() {
                        s.phase = UpdatePhase::Idle;
                    } else {
                        s.phase = UpdatePhase::Staged;
                        s.staged_artifact_path = Some(dest.clone());
                        staged = true;
                    }
                });
                if staged {
                    log::info!("Update {} staged at {:?} ({} bytes)", version, dest, bytes);
                } else {
                    log::info!("Update {} downloaded but no longer wanted", version);
                }
            }
            Err(e) => {
                log::warn!("Update {} download failed: {}", version, e);
                self.state.send_modify(|s| {
                    if s.phase == UpdatePhase::Downloading {
                        s.phase = UpdatePhase::Failed;
                        s.last_error = Some(e.to_string());
                        s.progress = None;
                    }
                });
            }
        }
    }

    /// Wait for the background download started by the last check, if any.
    pub async fn wait_for_download(&self) {
        let handle = self
            .download
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    log::error!("Update download task failed: {}", e);
                }
            }
        }
    }

    /// Stop caring about the current latest version (and anything older).
    ///
    /// The dismissal is kept in memory even if persisting it fails; the
    /// error is returned so the caller can surface it. A staged artifact
    /// stays on disk.
    pub async fn dismiss(&self) -> Result<()> {
        let current = self.state();
        if current.phase == UpdatePhase::Installing {
            return Err(AppError::invalid_state("installing"));
        }
        let Some(latest) = current.latest_version else {
            return Ok(());
        };

        let mut recorded = latest.clone();
        self.state.send_modify(|s| {
            let covered = s
                .dismissed_version
                .as_deref()
                .map(|d| version_ordering(&latest, d) != std::cmp::Ordering::Greater)
                .unwrap_or(false);
            if covered {
                if let Some(d) = &s.dismissed_version {
                    recorded = d.clone();
                }
            } else {
                s.dismissed_version = Some(latest.clone());
            }

            match s.phase {
                UpdatePhase::Staged | UpdatePhase::Failed => {
                    s.phase = UpdatePhase::Idle;
                    s.staged_artifact_path = None;
                    s.last_error = None;
                }
                _ => {}
            }
        });

        log::info!("Update {} dismissed", recorded);
        self.settings
            .set(keys::DISMISSED_UPDATE_VERSION, Value::String(recorded));
        if let Err(e) = self.settings.save().await {
            log::error!("Failed to persist dismissed update: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// Launch the staged installer and exit. Only valid while staged.
    pub fn install(&self) -> Result<()> {
        let mut phase = UpdatePhase::Idle;
        let mut artifact: Option<PathBuf> = None;
        self.state.send_if_modified(|s| {
            phase = s.phase;
            if s.phase != UpdatePhase::Staged {
                return false;
            }
            artifact = s.staged_artifact_path.clone();
            s.phase = UpdatePhase::Installing;
            true
        });

        let Some(artifact) = artifact else {
            return Err(AppError::invalid_state(&format!("{:?}", phase).to_lowercase()));
        };

        if !artifact.is_file() {
            self.state.send_modify(|s| {
                s.phase = UpdatePhase::Idle;
                s.staged_artifact_path = None;
                s.last_error = Some("staged installer is missing".to_string());
            });
            return Err(AppError::install(format!("{:?} is missing", artifact)));
        }

        if let Err(e) = self.handoff.launch(&artifact) {
            log::error!("Installer launch failed: {}", e);
            self.state.send_modify(|s| {
                s.phase = UpdatePhase::Staged;
                s.last_error = Some(e.to_string());
            });
            return Err(e);
        }

        log::info!("Installer {:?} launched", artifact);
        self.handoff.exit();
        Ok(())
    }

    /// Abort a running download. Used on logout and shutdown.
    pub fn shutdown(&self) {
        let handle = self
            .download
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let aborted = self.state.send_if_modified(|s| {
            if s.phase != UpdatePhase::Downloading {
                return false;
            }
            s.phase = UpdatePhase::Idle;
            s.progress = None;
            true
        });
        if aborted {
            remove_stale_partials(&self.options.updates_dir);
            log::info!("Update download aborted");
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::{FakeHandoff, FakeReleases};
    use super::*;
    use crate::settings::MemorySettingsStore;

    struct Harness {
        _dir: tempfile::TempDir,
        updates_dir: PathBuf,
        releases: Arc<FakeReleases>,
        settings: Arc<MemorySettingsStore>,
        handoff: Arc<FakeHandoff>,
        pipeline: Arc<UpdatePipeline>,
    }

    fn harness_with(releases: FakeReleases, settings: MemorySettingsStore) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let updates_dir = dir.path().join("updates");
        std::fs::create_dir_all(&updates_dir).unwrap();
        let releases = Arc::new(releases);
        let settings = Arc::new(settings);
        let handoff = Arc::new(FakeHandoff::default());
        let pipeline = UpdatePipeline::new(
            PipelineOptions {
                current_version: "1.3.2".to_string(),
                platform: Platform::Windows,
                updates_dir: updates_dir.clone(),
                request_timeout: Duration::from_secs(5),
                download_timeout: Duration::from_secs(60),
            },
            Arc::<FakeReleases>::clone(&releases),
            Arc::<MemorySettingsStore>::clone(&settings),
            Arc::<FakeHandoff>::clone(&handoff),
        );
        Harness {
            _dir: dir,
            updates_dir,
            releases,
            settings,
            handoff,
            pipeline,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeReleases::new(), MemorySettingsStore::new())
    }

    async fn check_and_wait(h: &Harness) -> CheckOutcome {
        let outcome = h.pipeline.check().await;
        h.pipeline.wait_for_download().await;
        outcome
    }

    #[tokio::test]
    async fn equal_or_older_version_stays_idle() {
        let h = harness();
        h.releases.offer("1.3.2");
        assert_eq!(h.pipeline.check().await, CheckOutcome::UpToDate);
        h.releases.offer("1.3");
        assert_eq!(h.pipeline.check().await, CheckOutcome::UpToDate);

        let state = h.pipeline.state();
        assert_eq!(state.phase, UpdatePhase::Idle);
        assert_eq!(state.latest_version, None);
        assert_eq!(state.banner(), None);
        assert_eq!(h.releases.download_count(), 0);
    }

    #[tokio::test]
    async fn no_release_info_is_not_an_error() {
        let h = harness();
        assert_eq!(h.pipeline.check().await, CheckOutcome::NoRelease);
        let state = h.pipeline.state();
        assert_eq!(state.phase, UpdatePhase::Idle);
        assert_eq!(state.last_error, None);
    }

    #[tokio::test]
    async fn network_failure_returns_to_idle_quietly() {
        let h = harness();
        h.releases.go_offline();
        assert_eq!(h.pipeline.check().await, CheckOutcome::Unreachable);
        let state = h.pipeline.state();
        assert_eq!(state.phase, UpdatePhase::Idle);
        assert_eq!(state.last_error, None);
        assert_eq!(state.banner(), None);
    }

    #[tokio::test]
    async fn newer_version_is_downloaded_and_staged() {
        let h = harness();
        h.releases.offer("2.0.0");

        assert_eq!(check_and_wait(&h).await, CheckOutcome::DownloadStarted);

        let state = h.pipeline.state();
        let expected = staged_artifact_path(&h.updates_dir, "2.0.0", Platform::Windows);
        assert_eq!(state.phase, UpdatePhase::Staged);
        assert_eq!(state.staged_artifact_path.as_deref(), Some(expected.as_path()));
        assert_eq!(state.progress, None);
        assert_eq!(std::fs::read(&expected).unwrap(), b"installer");
        assert_eq!(
            state.banner(),
            Some(UpdateBanner::Ready {
                version: "2.0.0".to_string()
            })
        );
    }

    #[tokio::test]
    async fn staged_version_is_never_downloaded_twice() {
        let h = harness();
        h.releases.offer("2.0.0");
        check_and_wait(&h).await;

        assert_eq!(check_and_wait(&h).await, CheckOutcome::AlreadyStaged);
        assert_eq!(h.releases.download_count(), 1);
        assert_eq!(h.pipeline.state().phase, UpdatePhase::Staged);
        assert!(h.pipeline.state().staged_artifact_path.is_some());
    }

    #[tokio::test]
    async fn artifact_from_earlier_session_is_reused() {
        let h = harness();
        let staged = staged_artifact_path(&h.updates_dir, "2.0.0", Platform::Windows);
        std::fs::write(&staged, b"installer").unwrap();
        h.releases.offer("2.0.0");

        assert_eq!(h.pipeline.check().await, CheckOutcome::AlreadyStaged);
        assert_eq!(h.releases.download_count(), 0);
    }

    #[tokio::test]
    async fn dismissal_is_monotonic() {
        let h = harness();
        h.releases.offer_without_url("2.0.0");
        assert_eq!(h.pipeline.check().await, CheckOutcome::Available);
        h.pipeline.dismiss().await.unwrap();
        assert_eq!(
            h.settings.get_string(keys::DISMISSED_UPDATE_VERSION).as_deref(),
            Some("2.0.0")
        );
        assert_eq!(h.settings.save_count(), 1);

        h.releases.offer("1.9.9");
        assert_eq!(h.pipeline.check().await, CheckOutcome::Suppressed);
        h.releases.offer("2.0.0");
        assert_eq!(h.pipeline.check().await, CheckOutcome::Suppressed);
        assert_eq!(h.pipeline.state().banner(), None);
        assert_eq!(h.releases.download_count(), 0);

        h.releases.offer("2.0.1");
        assert_eq!(check_and_wait(&h).await, CheckOutcome::DownloadStarted);
        assert_eq!(h.pipeline.state().phase, UpdatePhase::Staged);
    }

    #[tokio::test]
    async fn dismissal_from_earlier_session_applies_before_first_check() {
        let settings = MemorySettingsStore::with_values([(
            keys::DISMISSED_UPDATE_VERSION,
            Value::String("2.0.0".to_string()),
        )]);
        let h = harness_with(FakeReleases::new(), settings);
        assert_eq!(
            h.pipeline.state().dismissed_version.as_deref(),
            Some("2.0.0")
        );

        h.releases.offer("2.0.0");
        assert_eq!(h.pipeline.check().await, CheckOutcome::Suppressed);
        assert_eq!(h.releases.download_count(), 0);
    }

    #[tokio::test]
    async fn dismissing_staged_update_keeps_artifact() {
        let h = harness();
        h.releases.offer("2.0.0");
        check_and_wait(&h).await;
        let artifact = h.pipeline.state().staged_artifact_path.unwrap();

        h.pipeline.dismiss().await.unwrap();
        let state = h.pipeline.state();
        assert_eq!(state.phase, UpdatePhase::Idle);
        assert_eq!(state.staged_artifact_path, None);
        assert_eq!(state.banner(), None);
        assert!(artifact.exists());
    }

    #[tokio::test]
    async fn failed_save_still_dismisses_in_memory() {
        let h = harness();
        h.releases.offer_without_url("2.0.0");
        h.pipeline.check().await;
        h.settings.fail_saves(true);

        let err = h.pipeline.dismiss().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Settings);
        assert!(h.pipeline.state().is_suppressed());
    }

    #[tokio::test]
    async fn download_failure_is_not_sticky() {
        let h = harness();
        h.releases.offer("2.0.0");
        h.releases.fail_downloads.store(true, Ordering::SeqCst);

        assert_eq!(check_and_wait(&h).await, CheckOutcome::DownloadStarted);
        let state = h.pipeline.state();
        assert_eq!(state.phase, UpdatePhase::Failed);
        assert!(state.last_error.is_some());
        assert_eq!(state.staged_artifact_path, None);
        assert!(matches!(state.banner(), Some(UpdateBanner::Failed { .. })));

        h.releases.fail_downloads.store(false, Ordering::SeqCst);
        assert_eq!(check_and_wait(&h).await, CheckOutcome::DownloadStarted);
        let state = h.pipeline.state();
        assert_eq!(state.phase, UpdatePhase::Staged);
        assert_eq!(state.last_error, None);
        assert_eq!(h.releases.download_count(), 2);
    }

    #[tokio::test]
    async fn check_during_download_is_busy() {
        let h = harness_with(FakeReleases::held(), MemorySettingsStore::new());
        h.releases.offer("2.0.0");

        assert_eq!(h.pipeline.check().await, CheckOutcome::DownloadStarted);
        assert_eq!(h.pipeline.state().phase, UpdatePhase::Downloading);
        assert_eq!(h.pipeline.check().await, CheckOutcome::Busy);

        if let Some(hold) = &h.releases.hold {
            hold.notify_one();
        }
        h.pipeline.wait_for_download().await;
        assert_eq!(h.pipeline.state().phase, UpdatePhase::Staged);
        assert_eq!(h.releases.download_count(), 1);
    }

    #[tokio::test]
    async fn offline_check_keeps_staged_update() {
        let h = harness();
        h.releases.offer("2.0.0");
        check_and_wait(&h).await;

        h.releases.go_offline();
        assert_eq!(h.pipeline.check().await, CheckOutcome::Unreachable);
        let state = h.pipeline.state();
        assert_eq!(state.phase, UpdatePhase::Staged);
        assert!(state.staged_artifact_path.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_check_does_not_leave_pipeline_checking() {
        let h = harness();
        h.releases.hang_fetch.store(true, Ordering::SeqCst);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), h.pipeline.check()).await;
        assert!(cancelled.is_err());
        assert_eq!(h.pipeline.state().phase, UpdatePhase::Idle);

        h.releases.hang_fetch.store(false, Ordering::SeqCst);
        h.releases.offer_without_url("2.0.0");
        assert_eq!(h.pipeline.check().await, CheckOutcome::Available);
    }

    #[tokio::test]
    async fn cancelled_check_keeps_staged_update() {
        let h = harness();
        h.releases.offer("2.0.0");
        check_and_wait(&h).await;
        let artifact = h.pipeline.state().staged_artifact_path;

        h.releases.hang_fetch.store(true, Ordering::SeqCst);
        let mut check = Box::pin(h.pipeline.check());
        tokio::select! {
            _ = &mut check => panic!("version fetch should still be pending"),
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
        assert_eq!(h.pipeline.state().phase, UpdatePhase::Checking);
        drop(check);

        let state = h.pipeline.state();
        assert_eq!(state.phase, UpdatePhase::Staged);
        assert_eq!(state.staged_artifact_path, artifact);
    }

    #[tokio::test]
    async fn install_requires_staged_artifact() {
        let h = harness();
        let err = h.pipeline.install().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
        assert_eq!(h.handoff.exits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn install_launches_then_exits() {
        let h = harness();
        h.releases.offer("2.0.0");
        check_and_wait(&h).await;
        let artifact = h.pipeline.state().staged_artifact_path.unwrap();

        h.pipeline.install().unwrap();
        assert_eq!(*h.handoff.launched.lock().unwrap(), vec![artifact]);
        assert_eq!(h.handoff.exits.load(Ordering::SeqCst), 1);
        assert_eq!(h.pipeline.state().phase, UpdatePhase::Installing);

        assert_eq!(h.pipeline.check().await, CheckOutcome::Busy);
        assert!(h.pipeline.dismiss().await.is_err());
    }

    #[tokio::test]
    async fn failed_launch_returns_to_staged() {
        let h = harness();
        h.releases.offer("2.0.0");
        check_and_wait(&h).await;
        h.handoff.fail_launch.store(true, Ordering::SeqCst);

        assert!(h.pipeline.install().is_err());
        let state = h.pipeline.state();
        assert_eq!(state.phase, UpdatePhase::Staged);
        assert!(state.last_error.is_some());
        assert_eq!(h.handoff.exits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_aborts_download() {
        let h = harness_with(FakeReleases::held(), MemorySettingsStore::new());
        h.releases.offer("2.0.0");
        h.pipeline.check().await;

        h.pipeline.shutdown();
        assert_eq!(h.pipeline.state().phase, UpdatePhase::Idle);
        h.pipeline.wait_for_download().await;
        assert_eq!(h.pipeline.state().phase, UpdatePhase::Idle);
    }
}
