//! Operator alerts
//!
//! Alerts never change a run's outcome. They are logged at error level
//! with `alert = true` and kept in memory for the API.

use keel_core::domain::alert::Alert;
use tokio::sync::RwLock;
use tracing::error;

/// Keeps at most this many alerts, dropping the oldest
const MAX_ALERTS: usize = 1000;

#[derive(Debug, Default)]
pub struct AlertLog {
    alerts: RwLock<Vec<Alert>>,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn raise(&self, alert: Alert) {
        error!(
            alert = true,
            pipeline = %alert.pipeline,
            run_id = ?alert.run_id,
            kind = ?alert.kind,
            "{}",
            alert.message
        );

        let mut alerts = self.alerts.write().await;
        if alerts.len() >= MAX_ALERTS {
            alerts.remove(0);
        }
        alerts.push(alert);
    }

    /// Alerts, oldest first
    pub async fn list(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }
}
