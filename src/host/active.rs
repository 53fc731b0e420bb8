use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use tracing::{debug, info, warn};

use super::script_host::{HostLease, ScriptHost};

/// The host that new invocations resolve to. Replacing it never blocks an
/// invocation already holding a lease on the previous host; that host is
/// disposed once its leases drain or the grace period runs out.
pub struct ActiveHost {
    current: ArcSwapOption<ScriptHost>,
    grace_period: Duration,
}

impl ActiveHost {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            current: ArcSwapOption::empty(),
            grace_period,
        }
    }

    pub fn load(&self) -> Option<Arc<ScriptHost>> {
        self.current.load_full()
    }

    /// Leases the current host. A host swapped out between the load and the
    /// lease is given back and the new one is tried, since its retirement may
    /// already have seen it idle.
    pub fn lease(&self) -> Option<HostLease> {
        loop {
            let host = self.current.load_full()?;
            let lease = host.lease();
            let still_current = matches!(&*self.current.load(), Some(c) if Arc::ptr_eq(c, &host));
            if still_current && !lease.is_disposed() {
                return Some(lease);
            }
            debug!(generation = host.generation(), "host retired while leasing, retrying");
        }
    }

    /// Publishes `host` and retires the previous one.
    pub fn swap(&self, host: Arc<ScriptHost>) -> Option<Arc<ScriptHost>> {
        let generation = host.generation();
        let previous = self.current.swap(Some(host));
        info!(
            generation,
            previous = ?previous.as_ref().map(|h| h.generation()),
            "active host replaced"
        );
        if let Some(old) = &previous {
            self.retire(old.clone());
        }
        previous
    }

    /// Clears the slot and disposes the host that was in it.
    pub fn clear(&self) -> Option<Arc<ScriptHost>> {
        let previous = self.current.swap(None);
        if let Some(old) = &previous {
            self.retire(old.clone());
        }
        previous
    }

    fn retire(&self, host: Arc<ScriptHost>) {
        let grace = self.grace_period;
        tokio::spawn(async move {
            if !host.wait_idle(grace).await {
                warn!(
                    generation = host.generation(),
                    in_flight = host.in_flight(),
                    "grace period elapsed before host went idle"
                );
            }
            host.dispose();
        });
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use data_model::HostMode;

    use super::*;
    use crate::{host::LoadContext, testing::wait_until};

    fn host(generation: u64) -> Arc<ScriptHost> {
        Arc::new(ScriptHost::new(
            generation,
            HostMode::Specialized,
            None,
            PathBuf::from("/tmp"),
            Vec::new(),
            Arc::new(LoadContext::new(generation, HostMode::Specialized)),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_host_disposed_after_leases_drain() -> anyhow::Result<()> {
        let active = ActiveHost::new(Duration::from_secs(30));
        assert!(active.load().is_none());

        let first = host(1);
        active.swap(first.clone());
        let lease = active.load().unwrap().lease();

        active.swap(host(2));
        assert_eq!(active.lease().map(|l| l.generation()), Some(2));
        // the lease still resolves to the host it was taken on
        assert_eq!(lease.generation(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!first.is_disposed());

        drop(lease);
        wait_until(Duration::from_secs(1), || async { first.is_disposed() }).await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_bounds_retirement() -> anyhow::Result<()> {
        let active = ActiveHost::new(Duration::from_secs(5));
        let first = host(1);
        active.swap(first.clone());
        let _stuck = first.lease();

        active.swap(host(2));
        wait_until(Duration::from_secs(10), || async { first.is_disposed() }).await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_skips_retired_host() -> anyhow::Result<()> {
        let active = ActiveHost::new(Duration::from_secs(5));
        assert!(active.lease().is_none());

        let first = host(1);
        active.swap(first.clone());
        active.swap(host(2));
        wait_until(Duration::from_secs(1), || async { first.is_disposed() }).await?;

        let lease = active.lease().unwrap();
        assert_eq!(lease.generation(), 2);
        assert!(!lease.is_disposed());
        // the retired host holds no lease taken after its swap
        assert_eq!(first.in_flight(), 0);
        Ok(())
    }
}
