use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
    },
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use data_model::MetricsSnapshot;
use tokio::{io::AsyncWriteExt, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MetricsPublisherConfig;

const METRICS_FILE_EXTENSION: &str = "json";

/// Periodically writes a usage snapshot into the metrics directory for the
/// external scale controller. Each tick produces one uniquely named file and
/// the directory never holds more than `max_file_count` of them.
pub struct MetricsPublisher {
    config: MetricsPublisherConfig,
    completed: AtomicU64,
    active: AtomicU64,
    running: Mutex<Option<CancellationToken>>,
    last_publish: Mutex<Instant>,
}

impl MetricsPublisher {
    pub fn new(config: MetricsPublisherConfig) -> Self {
        Self {
            config,
            completed: AtomicU64::new(0),
            active: AtomicU64::new(0),
            running: Mutex::new(None),
            last_publish: Mutex::new(Instant::now()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    pub fn on_function_started(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub fn on_function_completed(&self) {
        // saturating: a completion without a start must not wrap
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn active_function_count(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    pub fn start(self: &Arc<Self>) {
        let Some(metrics_path) = self.config.metrics_path.clone() else {
            debug!("metrics path not configured, metrics publisher disabled");
            return;
        };
        let Ok(mut running) = self.running.lock() else {
            return;
        };
        if running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *running = Some(cancel.clone());
        drop(running);

        if let Ok(mut last) = self.last_publish.lock() {
            *last = Instant::now();
        }
        info!(
            "Starting metrics publisher (AlwaysReady={}, MetricsPath='{}')",
            self.config.always_ready,
            metrics_path.display()
        );
        tokio::spawn(self.clone().run(cancel));
    }

    pub fn stop(&self) {
        let token = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(_) => None,
        };
        if let Some(token) = token {
            token.cancel();
            info!("metrics publisher stopped");
        }
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let initial_delay = Duration::from_millis(self.config.initial_publish_delay_ms);
        let period = self.config.publish_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + initial_delay + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            if let Err(err) = self.publish_metrics().await {
                warn!("failed to publish metrics, skipping this interval: {:?}", err);
            }
        }
    }

    fn take_snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let total = match self.last_publish.lock() {
            Ok(mut last) => {
                let elapsed = now.saturating_duration_since(*last);
                *last = now;
                elapsed
            }
            Err(_) => Duration::ZERO,
        };
        let execution_count = self.completed.swap(0, Ordering::AcqRel);
        MetricsSnapshot {
            execution_count,
            execution_time_ms: execution_count
                .saturating_mul(self.config.minimum_activity_interval_ms),
            total_time_ms: total.as_millis() as u64,
            is_always_ready: self.config.always_ready,
        }
    }

    /// Publishes one snapshot. Returns the written file, or `None` when
    /// publishing is disabled or there was nothing to report.
    pub async fn publish_metrics(&self) -> Result<Option<PathBuf>> {
        let Some(metrics_path) = self.config.metrics_path.as_deref() else {
            return Ok(None);
        };
        let snapshot = self.take_snapshot();
        if !snapshot.has_activity() && !snapshot.is_always_ready {
            debug!("no activity since last interval, nothing to publish");
            return Ok(None);
        }
        tokio::fs::create_dir_all(metrics_path)
            .await
            .with_context(|| format!("unable to create {}", metrics_path.display()))?;
        self.purge_old_files(metrics_path).await?;
        let path = write_snapshot(metrics_path, &snapshot).await?;
        debug!(
            path = %path.display(),
            execution_count = snapshot.execution_count,
            "published metrics"
        );
        Ok(Some(path))
    }

    /// Makes room for one more file by deleting the oldest ones.
    async fn purge_old_files(&self, metrics_path: &Path) -> Result<()> {
        let mut files = list_metrics_files(metrics_path).await?;
        let keep = self.config.max_file_count.saturating_sub(1);
        if files.len() <= keep {
            return Ok(());
        }
        files.sort();
        let excess = files.len() - keep;
        info!("Deleting {} metrics file(s).", excess);
        for (_, path) in files.into_iter().take(excess) {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), "unable to delete metrics file: {:?}", err);
            }
        }
        Ok(())
    }
}

/// Published metrics files keyed by (modified time, path) for oldest-first
/// ordering. Temp files are hidden and excluded.
async fn list_metrics_files(dir: &Path) -> Result<Vec<(SystemTime, PathBuf)>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let is_metrics = path
            .extension()
            .is_some_and(|ext| ext == METRICS_FILE_EXTENSION);
        if hidden || !is_metrics {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        files.push((metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH), path));
    }
    Ok(files)
}

async fn write_snapshot(dir: &Path, snapshot: &MetricsSnapshot) -> Result<PathBuf> {
    let id = Uuid::new_v4();
    let tmp_path = dir.join(format!(".{}.tmp", id));
    let final_path = dir.join(format!("{}.{}", id, METRICS_FILE_EXTENSION));
    let body = serde_json::to_vec(snapshot)?;

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(&body).await?;
    file.sync_all().await?;
    drop(file);
    if let Err(err) = tokio::fs::rename(&tmp_path, &final_path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }
    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;

    fn config(dir: Option<&Path>, always_ready: bool, max_file_count: usize) -> MetricsPublisherConfig {
        MetricsPublisherConfig {
            metrics_path: dir.map(Path::to_path_buf),
            publish_interval_ms: 500,
            initial_publish_delay_ms: 0,
            minimum_activity_interval_ms: 1_000,
            max_file_count,
            always_ready,
        }
    }

    fn json_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == "json"))
            .collect();
        files.sort();
        files
    }

    #[tokio::test]
    async fn test_disabled_without_path() -> Result<()> {
        let publisher = Arc::new(MetricsPublisher::new(config(None, true, 10)));
        publisher.start();
        assert!(!publisher.is_running());
        publisher.on_function_completed();
        assert_eq!(publisher.publish_metrics().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_counts_completed_executions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let publisher = MetricsPublisher::new(config(Some(dir.path()), false, 10));

        assert_eq!(publisher.publish_metrics().await?, None);
        assert!(json_files(dir.path()).is_empty());

        for _ in 0..3 {
            publisher.on_function_started();
        }
        assert_eq!(publisher.active_function_count(), 3);
        for _ in 0..3 {
            publisher.on_function_completed();
        }
        assert_eq!(publisher.active_function_count(), 0);

        let path = publisher.publish_metrics().await?.unwrap();
        let snapshot: MetricsSnapshot = serde_json::from_slice(&std::fs::read(&path)?)?;
        assert_eq!(snapshot.execution_count, 3);
        assert_eq!(snapshot.execution_time_ms, 3_000);
        assert!(!snapshot.is_always_ready);

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path)?)?;
        assert!(raw.get("ExecutionTimeMS").is_some());
        assert!(raw.get("TotalTimeMS").is_some());

        // the count restarts every interval
        assert_eq!(publisher.publish_metrics().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_retention_deletes_oldest_first() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = SystemTime::now() - Duration::from_secs(3_600);
        let mut seeded = Vec::new();
        for i in 0..5u64 {
            let path = dir.path().join(format!("seed-{}.json", i));
            std::fs::write(&path, "{}")?;
            File::options()
                .write(true)
                .open(&path)?
                .set_modified(base + Duration::from_secs(i * 60))?;
            seeded.push(path);
        }
        std::fs::write(dir.path().join("notes.txt"), "not a metrics file")?;

        let publisher = MetricsPublisher::new(config(Some(dir.path()), true, 3));
        let written = publisher.publish_metrics().await?.unwrap();

        let files = json_files(dir.path());
        assert_eq!(files.len(), 3);
        assert!(files.contains(&written));
        assert!(files.contains(&seeded[3]));
        assert!(files.contains(&seeded[4]));
        for old in &seeded[..3] {
            assert!(!old.exists());
        }
        assert!(dir.path().join("notes.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, "a file where the directory should be")?;
        let publisher = MetricsPublisher::new(config(Some(&blocked), true, 3));
        assert!(publisher.publish_metrics().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let publisher = Arc::new(MetricsPublisher::new(config(Some(dir.path()), true, 10)));
        publisher.start();
        publisher.start();
        assert!(publisher.is_running());
        publisher.stop();
        publisher.stop();
        assert!(!publisher.is_running());
        Ok(())
    }
}
