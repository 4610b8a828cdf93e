//! Periodic refresh scheduler
//!
//! Fires `refresh_if_stale` every `interval_secs`. The first tick is
//! immediate, so a fresh start with stale (or no) data refreshes right away.

use crate::refresh::{RefreshController, RefreshStatus};
use ppm_common::config::RefreshConfig;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub struct RefreshScheduler {
    controller: Arc<RefreshController>,
    config: RefreshConfig,
}

impl RefreshScheduler {
    pub fn new(controller: Arc<RefreshController>, config: RefreshConfig) -> Self {
        Self { controller, config }
    }

    /// Spawn the scheduling loop; `None` when scheduling is disabled
    pub fn spawn(self) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            info!("Refresh scheduler disabled");
            return None;
        }

        info!(
            interval_secs = self.config.interval_secs,
            min_refresh_age_secs = self.config.min_refresh_age_secs,
            timeout_secs = self.config.timeout_secs,
            "Starting refresh scheduler"
        );

        Some(tokio::spawn(async move {
            let mut timer = interval(self.config.interval());
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                timer.tick().await;
                self.tick().await;
            }
        }))
    }

    async fn tick(&self) {
        let result = self
            .controller
            .refresh_if_stale(self.config.min_refresh_age(), Some(self.config.timeout()))
            .await;

        match result {
            Ok(None) => debug!("Scheduled refresh skipped"),
            Ok(Some(report)) if report.status == RefreshStatus::Failed => {
                warn!(cycle_id = %report.cycle_id, "Scheduled refresh failed; will retry next interval");
            }
            Ok(Some(report)) => {
                debug!(cycle_id = %report.cycle_id, status = report.status.as_str(), "Scheduled refresh done");
            }
            Err(e) => error!(error = %e, "Could not read refresh status; scheduled cycle not run"),
        }
    }
}
