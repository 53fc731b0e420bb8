use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use data_model::HostMode;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub path: PathBuf,
    pub sha256: String,
    pub size: usize,
}

/// Cache of user code loaded for one host generation. Standby and
/// specialized hosts never share one; a context goes away when the last host
/// holding it is dropped.
#[derive(Debug)]
pub struct LoadContext {
    generation: u64,
    mode: HostMode,
    modules: DashMap<PathBuf, Arc<LoadedModule>>,
}

impl LoadContext {
    pub fn new(generation: u64, mode: HostMode) -> Self {
        Self {
            generation,
            mode,
            modules: DashMap::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mode(&self) -> HostMode {
        self.mode
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn cached(&self, path: &Path) -> Option<Arc<LoadedModule>> {
        self.modules.get(path).map(|m| m.value().clone())
    }

    pub async fn load_module(&self, path: &Path) -> Result<Arc<LoadedModule>> {
        if let Some(module) = self.cached(path) {
            return Ok(module);
        }
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("unable to load module {}", path.display()))?;
        let module = Arc::new(LoadedModule {
            path: path.to_path_buf(),
            sha256: hex::encode(Sha256::digest(&bytes)),
            size: bytes.len(),
        });
        self.modules.insert(path.to_path_buf(), module.clone());
        debug!(
            load_context = self.generation,
            path = %path.display(),
            "loaded module"
        );
        Ok(module)
    }
}

impl Drop for LoadContext {
    fn drop(&mut self) {
        info!(
            load_context = self.generation,
            mode = %self.mode,
            modules = self.modules.len(),
            "load context disposed"
        );
    }
}

pub struct LoadContextProvider {
    current: ArcSwap<LoadContext>,
    next_generation: AtomicU64,
}

impl Default for LoadContextProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadContextProvider {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(LoadContext::new(1, HostMode::Standby)),
            next_generation: AtomicU64::new(2),
        }
    }

    pub fn current(&self) -> Arc<LoadContext> {
        self.current.load_full()
    }

    /// Replaces the current context with an empty one. Hosts built on the old
    /// context keep it alive until they are dropped.
    pub fn reset(&self, mode: HostMode) -> Arc<LoadContext> {
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
        let fresh = Arc::new(LoadContext::new(generation, mode));
        self.current.store(fresh.clone());
        info!(load_context = generation, mode = %mode, "load context reset");
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reset_yields_distinct_context() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("index.js");
        std::fs::write(&script, "module.exports = () => 1;")?;

        let provider = LoadContextProvider::new();
        let standby = provider.current();
        standby.load_module(&script).await?;
        assert_eq!(standby.module_count(), 1);

        let specialized = provider.reset(HostMode::Specialized);
        assert_ne!(standby.generation(), specialized.generation());
        assert_eq!(specialized.mode(), HostMode::Specialized);
        assert!(specialized.cached(&script).is_none());
        assert!(Arc::ptr_eq(&provider.current(), &specialized));

        let module = specialized.load_module(&script).await?;
        assert_eq!(module.size, 25);
        Ok(())
    }

    #[tokio::test]
    async fn test_old_context_lives_while_referenced() {
        let provider = LoadContextProvider::new();
        let standby = provider.current();
        let weak = Arc::downgrade(&standby);
        provider.reset(HostMode::Specialized);
        assert!(weak.upgrade().is_some());
        drop(standby);
        assert!(weak.upgrade().is_none());
    }
}
