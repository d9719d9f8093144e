//! Fleet supervisor: one [`ProviderHandle`] per configured provider.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use serde_json::Value;
use tracing::{error, info, warn};

use maestro_config::{McpConfig, ProviderConfig};
use maestro_core::{Awaiter, Error, ErrorKind, Result};

use crate::provider::{ProviderHandle, ToolInfo};

pub struct ProviderSupervisor {
    mcp: McpConfig,
    configs: HashMap<String, ProviderConfig>,
    providers: RwLock<HashMap<String, Arc<ProviderHandle>>>,
}

impl ProviderSupervisor {
    pub fn new(mcp: McpConfig, configs: HashMap<String, ProviderConfig>) -> Self {
        Self {
            mcp,
            configs,
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn and handshake every enabled provider concurrently. Individual
    /// failures are isolated; the call succeeds if at least one provider ends
    /// up ready and fails only when all of them fail.
    pub async fn start_all(&self) -> Result<()> {
        let enabled: Vec<(String, ProviderConfig)> = self
            .configs
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();

        if enabled.is_empty() {
            info!("no providers configured");
            return Ok(());
        }

        let startups = enabled.into_iter().map(|(name, config)| {
            let mcp = self.mcp.clone();
            async move {
                let handle = match ProviderHandle::spawn(&name, &config, &mcp) {
                    Ok(handle) => Arc::new(handle),
                    Err(err) => {
                        error!(provider = %name, %err, "spawn failed");
                        return (name, Err(err));
                    }
                };
                match handle.handshake(&mcp).await {
                    Ok(()) => (name, Ok(handle)),
                    Err(err) => {
                        error!(provider = %name, %err, "handshake failed");
                        (name, Err(err))
                    }
                }
            }
        });

        let mut ready = 0usize;
        let mut failed = 0usize;
        for (name, outcome) in join_all(startups).await {
            match outcome {
                Ok(handle) => {
                    info!(provider = %name, tools = handle.tools().len(), "provider ready");
                    self.providers.write().unwrap().insert(name, handle);
                    ready += 1;
                }
                Err(_) => failed += 1,
            }
        }

        if ready == 0 {
            return Err(Error::new(
                ErrorKind::ProviderUnreachable,
                format!("all {failed} providers failed to start"),
            ));
        }
        if failed > 0 {
            warn!(ready, failed, "some providers failed to start");
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderHandle>> {
        self.providers.read().unwrap().get(name).cloned()
    }

    pub fn ready_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .read()
            .unwrap()
            .iter()
            .filter(|(_, handle)| handle.is_ready())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Per-provider tool snapshots, ready providers only.
    pub fn tools_snapshot(&self) -> Vec<(String, Arc<Vec<ToolInfo>>)> {
        let mut snapshot: Vec<(String, Arc<Vec<ToolInfo>>)> = self
            .providers
            .read()
            .unwrap()
            .iter()
            .filter(|(_, handle)| handle.is_ready())
            .map(|(name, handle)| (name.clone(), handle.tools()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    /// Route a `tools/call` to the named provider.
    pub async fn call(
        &self,
        provider: &str,
        raw_tool: &str,
        arguments: &Value,
    ) -> Result<Awaiter<Value>> {
        let handle = self.get(provider).ok_or_else(|| {
            Error::new(
                ErrorKind::ProviderUnreachable,
                format!("no provider named {provider}"),
            )
        })?;
        handle.call(raw_tool, arguments).await
    }

    /// Graceful shutdown of the whole fleet, concurrently.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<ProviderHandle>> =
            self.providers.write().unwrap().drain().map(|(_, h)| h).collect();
        let grace = self.mcp.shutdown_grace();
        join_all(handles.iter().map(|handle| handle.shutdown(grace))).await;
        info!(count = handles.len(), "supervisor shut down");
    }
}
