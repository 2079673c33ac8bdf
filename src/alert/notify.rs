use serde::Serialize;

use super::{Alert, Severity};

/// Whether the host lets us show notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPermission {
    Granted,
    Denied,
    /// The host has no notification API.
    Unsupported,
}

/// Out-of-band delivery of alerts, e.g. desktop notifications.
///
/// Permission is requested once, on the first alert that qualifies. Errors
/// from `notify` are logged and otherwise ignored.
pub trait Notifier: Send + Sync {
    fn request_permission(&self) -> NotificationPermission;

    fn notify(&self, alert: &Alert) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn request_permission(&self) -> NotificationPermission {
        NotificationPermission::Unsupported
    }

    fn notify(&self, _: &Alert) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes alerts to the `kansoku::notify` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn request_permission(&self) -> NotificationPermission {
        NotificationPermission::Granted
    }

    fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        match alert.severity {
            Severity::Critical => tracing::error!(
                target: "kansoku::notify",
                id = %alert.id,
                source = %alert.source,
                "{}: {}", alert.title, alert.message
            ),
            _ => tracing::warn!(
                target: "kansoku::notify",
                id = %alert.id,
                source = %alert.source,
                "{}: {}", alert.title, alert.message
            ),
        }
        Ok(())
    }
}
