use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Result;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::builder::FUNCTION_METADATA_FILE;

/// Hash over every `function.json` below `script_root`, in path order.
pub async fn fingerprint(script_root: &Path) -> Result<String> {
    let mut files: Vec<PathBuf> = Vec::new();
    let mut entries = tokio::fs::read_dir(script_root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let candidate = entry.path().join(FUNCTION_METADATA_FILE);
        if candidate.is_file() {
            files.push(candidate);
        }
    }
    files.sort();

    let mut hasher = Sha256::new();
    for file in files {
        let contents = tokio::fs::read(&file).await?;
        hasher.update(file.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(&contents);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Polls the script root and calls `on_change` once per detected change.
/// Returns the token that stops the poller.
pub fn spawn_change_monitor<F>(
    script_root: PathBuf,
    interval: Duration,
    on_change: F,
) -> CancellationToken
where
    F: Fn() + Send + Sync + 'static,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        let mut last = fingerprint(&script_root).await.ok();
        info!(script_root = %script_root.display(), "watching function metadata for changes");
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            match fingerprint(&script_root).await {
                Ok(current) => {
                    if last.as_ref() != Some(&current) {
                        if last.is_some() {
                            info!(script_root = %script_root.display(), "function metadata changed");
                            on_change();
                        }
                        last = Some(current);
                    }
                }
                Err(err) => {
                    debug!(script_root = %script_root.display(), "unable to fingerprint script root: {:?}", err);
                    if last.take().is_some() {
                        warn!(script_root = %script_root.display(), "script root disappeared");
                    }
                }
            }
        }
    });
    cancel
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::testing::{wait_until, write_function};

    #[tokio::test]
    async fn test_fingerprint_tracks_metadata_only() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_function(dir.path(), "hello", "httpTrigger")?;
        let before = fingerprint(dir.path()).await?;
        assert_eq!(before, fingerprint(dir.path()).await?);

        std::fs::write(dir.path().join("hello").join("index.js"), "changed")?;
        assert_eq!(before, fingerprint(dir.path()).await?);

        write_function(dir.path(), "hello", "timerTrigger")?;
        assert_ne!(before, fingerprint(dir.path()).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_monitor_reports_change() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_function(dir.path(), "hello", "httpTrigger")?;
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = changes.clone();
        let cancel = spawn_change_monitor(
            dir.path().to_path_buf(),
            Duration::from_millis(20),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(changes.load(Ordering::SeqCst), 0);

        write_function(dir.path(), "second", "httpTrigger")?;
        wait_until(Duration::from_secs(5), || async {
            changes.load(Ordering::SeqCst) == 1
        })
        .await?;
        cancel.cancel();
        Ok(())
    }
}
