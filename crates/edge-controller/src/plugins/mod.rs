use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use common::api::PluginData;

use crate::error::{ApiResult, AppError};

pub mod metrics;

/// Describes a plugin and the configuration flags it understands.
#[derive(Debug, Clone, Copy)]
pub struct PluginDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub flags: &'static [FlagDescriptor],
}

/// One configuration flag of a plugin, resolved from the plugin option map.
#[derive(Debug, Clone, Copy)]
pub struct FlagDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub default: &'static str,
}

/// A controller-side plugin handling payloads that agents embed in their
/// periodic checks.
#[async_trait]
pub trait EdgePlugin: Send + Sync {
    fn descriptor(&self) -> &'static PluginDescriptor;

    async fn start(&self) -> ApiResult<()>;

    async fn stop(&self);

    /// Handle a payload reported by `asset_id`. Plugins that only perform
    /// outbound work keep the default, which rejects agent data.
    async fn handle_agent_data(&self, asset_id: &str, data: &PluginData) -> ApiResult<()> {
        let _ = (asset_id, data);
        Err(AppError::invalid_argument(format!(
            "plugin {} does not accept agent data",
            self.descriptor().name
        )))
    }
}

/// Plugin name to instance. Built explicitly at startup and threaded through
/// construction so tests stay isolated and startup order stays visible.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn EdgePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn EdgePlugin>) {
        let name = plugin.descriptor().name;
        info!(plugin = name, "registering edge plugin");
        self.plugins.insert(name, plugin);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn EdgePlugin>> {
        self.plugins.get(name)
    }

    /// Dispatch one embedded payload to its plugin.
    ///
    /// An unknown plugin name usually means the agent speaks a newer protocol
    /// revision than this controller.
    pub async fn handle_agent_data(&self, asset_id: &str, data: &PluginData) -> ApiResult<()> {
        let plugin = self.plugins.get(data.plugin.as_str()).ok_or_else(|| {
            AppError::invalid_argument(format!(
                "plugin {} not registered; agent and controller protocol versions likely differ",
                data.plugin
            ))
        })?;
        plugin.handle_agent_data(asset_id, data).await
    }

    pub async fn start_all(&self) -> ApiResult<()> {
        for plugin in self.plugins.values() {
            plugin.start().await?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        for plugin in self.plugins.values() {
            plugin.stop().await;
        }
    }
}
