use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use data_model::{FunctionMetadata, FunctionMetadataBuilder, HostMode, SpecializationContext};
use serde::Deserialize;
use tracing::{info, warn};

use super::{load_context::LoadContext, script_host::ScriptHost};

pub const FUNCTION_METADATA_FILE: &str = "function.json";

#[derive(Debug, Clone)]
pub struct HostBuildRequest {
    pub generation: u64,
    pub mode: HostMode,
    pub script_root: PathBuf,
    pub context: Option<SpecializationContext>,
    pub load_context: Arc<LoadContext>,
}

impl HostBuildRequest {
    pub fn worker_runtime(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.worker_runtime.as_str())
    }
}

#[async_trait::async_trait]
pub trait HostBuilder: Send + Sync {
    async fn build(&self, request: HostBuildRequest) -> Result<ScriptHost>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionJson {
    #[serde(default)]
    bindings: Vec<BindingJson>,
    #[serde(default)]
    script_file: Option<String>,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Deserialize)]
struct BindingJson {
    #[serde(rename = "type")]
    binding_type: String,
    #[serde(default)]
    direction: Option<String>,
}

impl FunctionJson {
    fn trigger(&self) -> Option<&str> {
        self.bindings
            .iter()
            .find(|b| {
                b.binding_type.ends_with("Trigger") &&
                    b.direction.as_deref().is_none_or(|d| d == "in")
            })
            .map(|b| b.binding_type.as_str())
    }
}

/// Builds hosts from `<script_root>/<function>/function.json`. Standby hosts
/// carry no customer functions.
pub struct ScriptHostBuilder {}

impl ScriptHostBuilder {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for ScriptHostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HostBuilder for ScriptHostBuilder {
    async fn build(&self, request: HostBuildRequest) -> Result<ScriptHost> {
        let functions = match request.mode {
            HostMode::Standby => Vec::new(),
            HostMode::Specialized => {
                let runtime = request
                    .worker_runtime()
                    .ok_or_else(|| anyhow!("specialized host requires a worker runtime"))?
                    .to_string();
                load_functions(&request.script_root, &runtime, &request.load_context).await?
            }
        };
        info!(
            generation = request.generation,
            mode = %request.mode,
            functions = functions.len(),
            script_root = %request.script_root.display(),
            "built script host"
        );
        Ok(ScriptHost::new(
            request.generation,
            request.mode,
            request.worker_runtime().map(str::to_string),
            request.script_root,
            functions,
            request.load_context,
        ))
    }
}

pub async fn load_functions(
    script_root: &Path,
    language: &str,
    load_context: &LoadContext,
) -> Result<Vec<FunctionMetadata>> {
    let mut entries = tokio::fs::read_dir(script_root)
        .await
        .with_context(|| format!("unable to read script root {}", script_root.display()))?;
    let mut functions = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let dir = entry.path();
        let metadata_path = dir.join(FUNCTION_METADATA_FILE);
        if !entry.file_type().await?.is_dir() || !metadata_path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let raw = tokio::fs::read_to_string(&metadata_path).await?;
        let function_json: FunctionJson = serde_json::from_str(&raw)
            .with_context(|| format!("invalid {}", metadata_path.display()))?;
        let Some(trigger) = function_json.trigger() else {
            warn!(function = %name, "function has no trigger binding, skipping");
            continue;
        };
        if let Some(script_file) = &function_json.script_file {
            load_context.load_module(&dir.join(script_file)).await?;
        }
        let function = FunctionMetadataBuilder::default()
            .name(name)
            .language(language.to_string())
            .trigger_type(trigger.to_string())
            .script_file(function_json.script_file.clone())
            .disabled(function_json.disabled)
            .build()?;
        functions.push(function);
    }
    functions.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(functions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::write_function;

    fn request(root: &Path, mode: HostMode, runtime: Option<&str>) -> HostBuildRequest {
        HostBuildRequest {
            generation: 1,
            mode,
            script_root: root.to_path_buf(),
            context: runtime.map(SpecializationContext::new),
            load_context: Arc::new(LoadContext::new(1, mode)),
        }
    }

    #[tokio::test]
    async fn test_build_specialized_host() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_function(dir.path(), "hello", "httpTrigger")?;
        write_function(dir.path(), "tick", "timerTrigger")?;
        std::fs::create_dir(dir.path().join("not_a_function"))?;

        let host = ScriptHostBuilder::new()
            .build(request(dir.path(), HostMode::Specialized, Some("node")))
            .await?;
        assert_eq!(host.function_names(), vec!["hello", "tick"]);
        assert_eq!(host.function("tick").unwrap().trigger_type, "timerTrigger");
        assert_eq!(host.function("hello").unwrap().language, "node");
        assert_eq!(host.load_context().module_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_standby_host_has_no_functions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_function(dir.path(), "hello", "httpTrigger")?;
        let host = ScriptHostBuilder::new()
            .build(request(dir.path(), HostMode::Standby, None))
            .await?;
        assert!(host.function_names().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_metadata_fails_build() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fn_dir = dir.path().join("broken");
        std::fs::create_dir(&fn_dir)?;
        std::fs::write(fn_dir.join(FUNCTION_METADATA_FILE), "{ not json")?;
        let res = ScriptHostBuilder::new()
            .build(request(dir.path(), HostMode::Specialized, Some("node")))
            .await;
        assert!(res.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_script_root_fails_build() {
        let res = ScriptHostBuilder::new()
            .build(request(
                Path::new("/nonexistent/funchost/root"),
                HostMode::Specialized,
                Some("node"),
            ))
            .await;
        assert!(res.is_err());
    }
}
