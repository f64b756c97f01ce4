//! Plugin system: manifest-described handlers reacting to bus events
//!
//! Plugins are held purely by capability: `init`, `on_event`, `shutdown`.
//! There is no type hierarchy among them; shared behavior lives in the
//! context value the host passes to every call. Manifests on disk describe
//! scheduling (dependencies, priority, timeout); the `main` field names a
//! compiled-in handler from the builtin registry.

pub mod builtin;
pub mod host;
pub mod manifest;

pub use host::{PluginHost, PluginHostConfig};
pub use manifest::PluginManifest;

use crate::bus::EventBus;
use crate::events::Event;
use crate::store::Store;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Cross-plugin scratch space. Eventually consistent; plugins must not
/// hold the lock across await points.
pub type SharedState = Arc<Mutex<HashMap<String, Value>>>;

/// Everything a plugin may touch. Cloning is cheap; plugins never receive
/// the host itself.
#[derive(Clone)]
pub struct PluginContext {
    pub bus: Arc<EventBus>,
    pub store: Arc<Store>,
    /// Records queued here reach the store in batches
    pub records: Arc<crate::batch::BatchWriter<crate::events::StoreRecord>>,
    /// This plugin's `config` block from its manifest
    pub config: Value,
    pub shared_state: SharedState,
}

/// The capability set every plugin implements. Default impls make `init`
/// and `shutdown` optional.
#[async_trait]
pub trait EventPlugin: Send + Sync {
    async fn init(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_event(&self, event: &Event, ctx: &PluginContext) -> anyhow::Result<()>;

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
