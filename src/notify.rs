//! Permission-gated alert delivery.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::detector::AlertEvent;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn workers_offline(wallet_name: &str, alert: &AlertEvent) -> Self {
        Self {
            title: "Workers offline".to_string(),
            body: format!(
                "{}: {} worker(s) went offline ({} online, {} offline)",
                wallet_name, alert.went_offline, alert.online_count, alert.offline_count
            ),
        }
    }
}

/// OS notification facility.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn is_permission_granted(&self) -> bool;
    /// Ask the user for permission; returns whether it was granted.
    async fn request_permission(&self) -> bool;
    async fn send_notification(&self, notification: &Notification) -> Result<()>;
}

/// Sink for headless runs: every notification goes to the log.
#[derive(Debug, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn is_permission_granted(&self) -> bool {
        true
    }

    async fn request_permission(&self) -> bool {
        true
    }

    async fn send_notification(&self, notification: &Notification) -> Result<()> {
        log::warn!("[notification] {}: {}", notification.title, notification.body);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Disabled,
    PermissionDenied,
}

/// Delivery policy for one refresh cycle.
///
/// The enabled flag is captured when the cycle starts. Permission is
/// resolved on the first alert of the cycle and reused for the rest of it,
/// so every alert in a cycle sees the same answer.
pub struct NotificationGate {
    sink: Arc<dyn NotificationSink>,
    enabled: bool,
    permission: OnceCell<bool>,
}

impl NotificationGate {
    pub fn new(sink: Arc<dyn NotificationSink>, enabled: bool) -> Self {
        Self {
            sink,
            enabled,
            permission: OnceCell::new(),
        }
    }

    async fn permitted(&self) -> bool {
        *self
            .permission
            .get_or_init(|| async {
                if self.sink.is_permission_granted().await {
                    return true;
                }
                self.sink.request_permission().await
            })
            .await
    }

    pub async fn deliver(&self, notification: &Notification) -> Result<Delivery> {
        if !self.enabled {
            log::debug!("Notifications disabled, not sending '{}'", notification.title);
            return Ok(Delivery::Disabled);
        }
        if !self.permitted().await {
            log::info!(
                "Notification permission denied, skipping '{}'",
                notification.title
            );
            return Ok(Delivery::PermissionDenied);
        }
        self.sink.send_notification(notification).await?;
        Ok(Delivery::Sent)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{Notification, NotificationSink};
    use crate::error::Result;

    /// Sink that records what it was asked to do.
    #[derive(Default)]
    pub struct RecordingSink {
        pub granted: AtomicBool,
        pub grant_on_request: AtomicBool,
        pub permission_checks: AtomicUsize,
        pub requests: AtomicUsize,
        pub sent: Mutex<Vec<Notification>>,
    }

    impl RecordingSink {
        pub fn granted() -> Self {
            let sink = Self::default();
            sink.granted.store(true, Ordering::SeqCst);
            sink
        }

        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn is_permission_granted(&self) -> bool {
            self.permission_checks.fetch_add(1, Ordering::SeqCst);
            self.granted.load(Ordering::SeqCst)
        }

        async fn request_permission(&self) -> bool {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let grant = self.grant_on_request.load(Ordering::SeqCst);
            if grant {
                self.granted.store(true, Ordering::SeqCst);
            }
            grant
        }

        async fn send_notification(&self, notification: &Notification) -> Result<()> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::RecordingSink;
    use super::*;

    fn alert() -> AlertEvent {
        AlertEvent {
            entity_id: "w1".to_string(),
            went_offline: 3,
            online_count: 1,
            offline_count: 3,
        }
    }

    #[test]
    fn offline_text() {
        let n = Notification::workers_offline("Rig A", &alert());
        assert_eq!(n.title, "Workers offline");
        assert_eq!(n.body, "Rig A: 3 worker(s) went offline (1 online, 3 offline)");
    }

    #[tokio::test]
    async fn disabled_gate_never_touches_permission() {
        let sink = Arc::new(RecordingSink::granted());
        let gate = NotificationGate::new(Arc::<RecordingSink>::clone(&sink), false);
        let n = Notification::workers_offline("Rig A", &alert());

        assert_eq!(gate.deliver(&n).await.unwrap(), Delivery::Disabled);
        assert_eq!(sink.permission_checks.load(Ordering::SeqCst), 0);
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn permission_is_requested_lazily_once_per_gate() {
        let sink = Arc::new(RecordingSink::default());
        sink.grant_on_request.store(true, Ordering::SeqCst);
        let gate = NotificationGate::new(Arc::<RecordingSink>::clone(&sink), true);
        assert_eq!(sink.permission_checks.load(Ordering::SeqCst), 0);

        let n = Notification::workers_offline("Rig A", &alert());
        assert_eq!(gate.deliver(&n).await.unwrap(), Delivery::Sent);
        assert_eq!(gate.deliver(&n).await.unwrap(), Delivery::Sent);
        assert_eq!(sink.permission_checks.load(Ordering::SeqCst), 1);
        assert_eq!(sink.requests.load(Ordering::SeqCst), 1);
        assert_eq!(sink.sent().len(), 2);
    }

    #[tokio::test]
    async fn denied_permission_skips_without_error() {
        let sink = Arc::new(RecordingSink::default());
        let gate = NotificationGate::new(Arc::<RecordingSink>::clone(&sink), true);
        let n = Notification::workers_offline("Rig A", &alert());

        assert_eq!(gate.deliver(&n).await.unwrap(), Delivery::PermissionDenied);
        assert_eq!(gate.deliver(&n).await.unwrap(), Delivery::PermissionDenied);
        assert_eq!(sink.requests.load(Ordering::SeqCst), 1);
        assert!(sink.sent().is_empty());
    }
}
