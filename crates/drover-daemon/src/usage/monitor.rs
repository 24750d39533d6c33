//! Periodic usage checks with one-shot threshold alerts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use drover_core::Config;
use drover_core::config::UsageBucket;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::reporter::{UsageReporter, UsageSample};
use super::reset_time::format_reset_time;
use super::UsageError;
use crate::notify::{NotificationEmitter, NotificationRecord, NotificationType};
use crate::storage::{Database, DatabaseError};

/// Extra bucket mirrored into the snapshot file but never alerted on.
const SESSION_BUCKET: &str = "session";

#[derive(Debug, Clone)]
pub struct UsageMonitorConfig {
    pub poll_interval: Duration,
    pub force_check_interval: Duration,
    /// Ascending alert thresholds, in percent.
    pub thresholds: Vec<u32>,
    pub buckets: Vec<UsageBucket>,
    pub channel: Option<String>,
    /// Latest sample, for other local readers.
    pub snapshot_file: PathBuf,
    /// Presence of this file triggers an immediate check.
    pub force_check_file: PathBuf,
}

impl UsageMonitorConfig {
    pub fn from_config(config: &Config) -> Self {
        let mut thresholds = config.usage.thresholds.clone();
        thresholds.sort_unstable();
        thresholds.dedup();
        Self {
            poll_interval: Duration::from_secs(config.usage.poll_interval_secs),
            force_check_interval: Duration::from_secs(config.usage.force_check_interval_secs.max(1)),
            thresholds,
            buckets: config.usage.buckets.clone(),
            channel: config.usage_channel().map(String::from),
            snapshot_file: config.usage_data_file(),
            force_check_file: config.usage_force_check_file(),
        }
    }
}

/// A threshold crossing that produced a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageAlert {
    pub bucket: String,
    pub label: String,
    pub percent: f64,
    pub threshold: u32,
    /// Reset time already rendered for display.
    pub resets: Option<String>,
}

impl UsageAlert {
    /// `Weekly usage (Sonnet): 45% (resets Thu Jan 15, 10:30AM PT)`
    pub fn line(&self) -> String {
        match &self.resets {
            Some(resets) => format!("{}: {}% (resets {resets})", self.label, self.percent),
            None => format!("{}: {}%", self.label, self.percent),
        }
    }
}

/// Highest threshold at or below `percent`.
pub fn crossed_threshold(thresholds: &[u32], percent: f64) -> Option<u32> {
    thresholds
        .iter()
        .copied()
        .filter(|t| f64::from(*t) <= percent)
        .max()
}

pub struct UsageMonitor {
    reporter: Arc<dyn UsageReporter>,
    db: Database,
    emitter: NotificationEmitter,
    config: UsageMonitorConfig,
}

impl UsageMonitor {
    pub fn new(
        reporter: Arc<dyn UsageReporter>,
        db: Database,
        emitter: NotificationEmitter,
        config: UsageMonitorConfig,
    ) -> Self {
        Self {
            reporter,
            db,
            emitter,
            config,
        }
    }

    /// Sample usage once and alert on new crossings.
    ///
    /// The watermark is raised before the alert is emitted; the conditional
    /// upsert makes sure only one check can win a given crossing.
    pub async fn check(&self) -> Result<Vec<UsageAlert>, UsageError> {
        let Some(sample) = self.reporter.sample().await? else {
            return Ok(Vec::new());
        };

        self.write_snapshot(&sample);

        let mut alerts = Vec::new();
        for bucket in &self.config.buckets {
            let Some(percent) = sample.percent(&bucket.key) else {
                debug!(bucket = %bucket.key, "No reading for bucket");
                continue;
            };
            debug!(bucket = %bucket.key, percent, "Usage reading");

            let Some(threshold) = crossed_threshold(&self.config.thresholds, percent) else {
                continue;
            };
            if threshold == 0 {
                continue;
            }
            if !self
                .db
                .raise_watermark(&bucket.key, i64::from(threshold))
                .await?
            {
                continue;
            }

            let alert = UsageAlert {
                bucket: bucket.key.clone(),
                label: bucket.label.clone(),
                percent,
                threshold,
                resets: sample
                    .resets(&bucket.key)
                    .map(format_reset_time)
                    .filter(|s| !s.is_empty()),
            };
            info!(bucket = %alert.bucket, percent, threshold, "Usage threshold crossed");
            self.emitter.emit(self.alert_record(&alert));
            alerts.push(alert);
        }

        Ok(alerts)
    }

    /// Forget the alerted threshold for `bucket`, so it alerts again.
    pub async fn reset(&self, bucket: &str) -> Result<bool, DatabaseError> {
        let cleared = self.db.clear_watermark(bucket).await?;
        info!(bucket, cleared, "Usage watermark reset");
        Ok(cleared)
    }

    /// Check on every poll interval and whenever the force-check file shows
    /// up, until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            buckets = self.config.buckets.len(),
            "Usage monitor started"
        );

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut force = tokio::time::interval(self.config.force_check_interval);
        force.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = poll.tick() => self.check_logged().await,
                _ = force.tick() => {
                    if self.take_force_request() {
                        info!("Forced usage check requested");
                        self.check_logged().await;
                        poll.reset();
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Usage monitor stopped");
    }

    async fn check_logged(&self) {
        match self.check().await {
            Ok(alerts) if !alerts.is_empty() => {
                debug!(count = alerts.len(), "Usage alerts emitted");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Usage check failed"),
        }
    }

    /// Consume the force-check marker file, if present.
    fn take_force_request(&self) -> bool {
        match std::fs::remove_file(&self.config.force_check_file) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(error = %e, "Could not remove force-check file");
                false
            }
        }
    }

    fn alert_record(&self, alert: &UsageAlert) -> NotificationRecord {
        let message = format!("Usage Alert:\n{}", alert.line());
        let payload = json!({
            "bucket": alert.bucket,
            "label": alert.label,
            "percent": alert.percent,
            "threshold": alert.threshold,
            "resets": alert.resets,
            "message": message,
        });
        NotificationRecord::new(
            NotificationType::UsageAlert,
            format!("{} at {}%", alert.label, alert.percent),
            self.config.channel.clone(),
            payload,
            format!(
                "usage_alert:{}:{}:{}",
                alert.bucket,
                alert.threshold,
                drover_core::db::unix_timestamp()
            ),
        )
    }

    fn write_snapshot(&self, sample: &UsageSample) {
        let mut fields = Map::new();
        let keys = self
            .config
            .buckets
            .iter()
            .map(|b| b.key.as_str())
            .chain(std::iter::once(SESSION_BUCKET));
        for key in keys {
            let percent = sample.percent(key).map_or(Value::from(0), Value::from);
            fields.insert(format!("{key}_percent"), percent);
            fields.insert(
                format!("{key}_resets"),
                Value::from(sample.resets(key).unwrap_or_default()),
            );
        }
        let now = chrono::Local::now().to_rfc3339();
        fields.insert(
            "timestamp".into(),
            Value::from(sample.timestamp().unwrap_or(now.as_str())),
        );
        fields.insert("updated_at".into(), Value::from(now.as_str()));

        let path = &self.config.snapshot_file;
        let result = serde_json::to_string_pretty(&Value::Object(fields))
            .map_err(std::io::Error::other)
            .and_then(|text| {
                let tmp = path.with_extension("json.tmp");
                std::fs::write(&tmp, text)?;
                std::fs::rename(&tmp, path)
            });
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to save usage snapshot");
        }
    }
}
