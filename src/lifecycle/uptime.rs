//! Max-uptime monitor.

use std::time::Duration;

use super::Supervisor;
use crate::notifier::EventKind;

/// Powers the instance off once it reaches its maximum age.
pub struct UptimeMonitor {
    sup: Supervisor,
    max_uptime: Duration,
}

impl UptimeMonitor {
    pub fn new(sup: Supervisor, max_uptime: Duration) -> Self {
        Self { sup, max_uptime }
    }

    pub async fn run(self) {
        let deadline = chrono::Duration::from_std(self.max_uptime)
            .ok()
            .and_then(|d| chrono::Utc::now().checked_add_signed(d));
        tracing::info!(
            max_uptime = %humantime::format_duration(self.max_uptime),
            deadline = ?deadline.map(|d| d.to_rfc3339()),
            "Hard shutdown scheduled"
        );

        let warn_after = self.max_uptime.saturating_sub(self.sup.timing.uptime_warning);
        tokio::time::sleep(warn_after).await;

        tracing::warn!("Max age reached, shutting down");
        if self.sup.state.shutdown.try_set() {
            self.sup.notify_async(EventKind::MaxAgeShutdown, None);
        } else {
            tracing::info!("Shutdown already announced, skipping max-age notification");
        }

        tokio::time::sleep(self.max_uptime - warn_after).await;
        self.sup.shutdown_now().await;
    }
}
