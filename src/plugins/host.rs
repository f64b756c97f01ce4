// Plugin host: discovery, ordering, lifecycle, and guarded dispatch
//
// Discovery scans a directory of plugin folders for manifests. Load builds
// a dependency graph, refuses cycles (or excludes their members when the
// override allows), orders by Kahn's algorithm with ties broken by
// descending priority then name, and initializes in that order. Dispatch
// walks enabled plugins sequentially in descending priority order (ties by
// name; events are immutable, so dispatch owes nothing to dependency
// order) under a per-plugin timeout and a circuit breaker; a misbehaving
// plugin can slow its own slot but never stall the passthrough or other
// plugins' delivery.

use super::builtin;
use super::manifest::PluginManifest;
use super::{EventPlugin, PluginContext, SharedState};
use crate::batch::BatchWriter;
use crate::bus::{EventBus, Handler, SubscribeOptions, Subscription};
use crate::events::{Event, StoreRecord};
use crate::store::Store;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

pub type PluginFactory = Arc<dyn Fn() -> Box<dyn EventPlugin> + Send + Sync>;
pub type PluginRegistry = HashMap<String, PluginFactory>;

#[derive(Debug, Clone)]
pub struct PluginHostConfig {
    /// Overrides every manifest's timeout when set
    pub timeout_override_ms: Option<u64>,
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit skips dispatch
    pub cooldown: Duration,
    /// Disable cycle members instead of refusing the whole graph
    pub allow_cycle_exclusion: bool,
    /// When set, only these plugins load
    pub enabled: Option<Vec<String>>,
    pub disabled: Vec<String>,
}

impl Default for PluginHostConfig {
    fn default() -> Self {
        PluginHostConfig {
            timeout_override_ms: None,
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            allow_cycle_exclusion: true,
            enabled: None,
            disabled: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug, Clone)]
pub struct PluginMetricsSnapshot {
    pub invocations: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub avg_latency_ms: f64,
    pub circuit_state: CircuitState,
}

#[derive(Debug, Default)]
struct PluginMetrics {
    invocations: u64,
    failures: u64,
    timeouts: u64,
    total_latency: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

struct PluginInstance {
    manifest: PluginManifest,
    handler: Box<dyn EventPlugin>,
    ctx: PluginContext,
    enabled: bool,
    metrics: PluginMetrics,
}

/// What the host needs to build each plugin's context.
#[derive(Clone)]
pub struct ContextSeed {
    pub bus: Arc<EventBus>,
    pub store: Arc<Store>,
    pub records: Arc<BatchWriter<StoreRecord>>,
    pub shared_state: SharedState,
    /// Per-plugin config overrides from the wrapper's config file; the
    /// manifest's own `config` block is the fallback
    pub plugin_configs: HashMap<String, Value>,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// name → reason
    pub disabled: Vec<(String, String)>,
}

pub struct PluginHost {
    config: PluginHostConfig,
    instances: AsyncMutex<Vec<PluginInstance>>,
}

impl PluginHost {
    pub fn new(config: PluginHostConfig) -> Arc<Self> {
        Arc::new(PluginHost {
            config,
            instances: AsyncMutex::new(Vec::new()),
        })
    }

    /// Scan `dir` for `<plugin>/manifest.json`. Invalid manifests are
    /// skipped with a diagnostic; one bad plugin never aborts discovery.
    pub fn discover(dir: &Path) -> Vec<PluginManifest> {
        let mut manifests = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!("plugin directory {} not readable: {err}", dir.display());
                return manifests;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let manifest_path = path.join("manifest.json");
            if !manifest_path.is_file() {
                continue;
            }
            match PluginManifest::load(&manifest_path) {
                Ok(manifest) => manifests.push(manifest),
                Err(err) => {
                    tracing::warn!("skipping plugin at {}: {err}", path.display());
                }
            }
        }
        manifests
    }

    /// Validate, order, instantiate, and initialize the candidate set.
    pub async fn load(&self, candidates: Vec<PluginManifest>, seed: &ContextSeed) -> LoadReport {
        self.load_with_registry(candidates, seed, &builtin::registry())
            .await
    }

    pub async fn load_with_registry(
        &self,
        candidates: Vec<PluginManifest>,
        seed: &ContextSeed,
        registry: &PluginRegistry,
    ) -> LoadReport {
        let mut report = LoadReport::default();

        // Enable/disable lists, then duplicate rejection (first wins)
        let mut manifests: Vec<PluginManifest> = Vec::new();
        let mut seen = HashSet::new();
        for manifest in candidates {
            if let Some(enabled) = &self.config.enabled {
                if !enabled.contains(&manifest.name) {
                    tracing::debug!(plugin = %manifest.name, "not in enabled list");
                    continue;
                }
            }
            if self.config.disabled.contains(&manifest.name) {
                report
                    .disabled
                    .push((manifest.name.clone(), "disabled by configuration".to_string()));
                continue;
            }
            if !seen.insert(manifest.name.clone()) {
                report
                    .disabled
                    .push((manifest.name.clone(), "duplicate plugin name".to_string()));
                tracing::warn!(plugin = %manifest.name, "duplicate plugin name rejected");
                continue;
            }
            manifests.push(manifest);
        }

        // Dependencies must name known plugins
        let known: HashSet<String> = manifests.iter().map(|m| m.name.clone()).collect();
        let mut unresolved: Vec<(String, String)> = Vec::new();
        manifests.retain(|m| {
            let missing: Vec<&String> = m
                .dependencies
                .iter()
                .filter(|d| !known.contains(*d))
                .collect();
            if missing.is_empty() {
                true
            } else {
                unresolved.push((
                    m.name.clone(),
                    format!("missing dependencies: {}", missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")),
                ));
                false
            }
        });
        report.disabled.extend(unresolved.iter().cloned());
        // Dependents of removed plugins fall out through the same check on
        // the next pass; iterate until stable.
        loop {
            let known: HashSet<String> = manifests.iter().map(|m| m.name.clone()).collect();
            let before = manifests.len();
            manifests.retain(|m| {
                let ok = m.dependencies.iter().all(|d| known.contains(d));
                if !ok {
                    report.disabled.push((
                        m.name.clone(),
                        "depends on a disabled plugin".to_string(),
                    ));
                }
                ok
            });
            if manifests.len() == before {
                break;
            }
        }

        // Topological order; leftovers are cycle members
        let (ordered, cycle) = topo_sort(manifests);
        if !cycle.is_empty() {
            let names: Vec<&str> = cycle.iter().map(|m| m.name.as_str()).collect();
            tracing::error!("plugin dependency cycle: {}", names.join(" -> "));
            if self.config.allow_cycle_exclusion {
                for member in &cycle {
                    report
                        .disabled
                        .push((member.name.clone(), "member of a dependency cycle".to_string()));
                }
            } else {
                for m in ordered.iter().chain(cycle.iter()) {
                    report
                        .disabled
                        .push((m.name.clone(), "plugin graph rejected (dependency cycle)".to_string()));
                }
                return report;
            }
        }

        // Instantiate and initialize in order; an init failure disables the
        // plugin and, transitively, its dependents.
        let mut failed: HashSet<String> = HashSet::new();
        let mut instances = self.instances.lock().await;
        for manifest in ordered {
            if manifest.dependencies.iter().any(|d| failed.contains(d)) {
                failed.insert(manifest.name.clone());
                report.disabled.push((
                    manifest.name.clone(),
                    "dependency failed to initialize".to_string(),
                ));
                continue;
            }
            let factory = match registry.get(&manifest.main) {
                Some(factory) => factory,
                None => {
                    failed.insert(manifest.name.clone());
                    report.disabled.push((
                        manifest.name.clone(),
                        format!("unknown handler {:?}", manifest.main),
                    ));
                    continue;
                }
            };
            let handler = factory();
            let ctx = PluginContext {
                bus: seed.bus.clone(),
                store: seed.store.clone(),
                records: seed.records.clone(),
                config: seed
                    .plugin_configs
                    .get(&manifest.name)
                    .cloned()
                    .unwrap_or_else(|| manifest.config.clone()),
                shared_state: seed.shared_state.clone(),
            };
            match handler.init(&ctx).await {
                Ok(()) => {
                    tracing::info!(plugin = %manifest.name, version = %manifest.version, "plugin initialized");
                    report.loaded.push(manifest.name.clone());
                    instances.push(PluginInstance {
                        manifest,
                        handler,
                        ctx,
                        enabled: true,
                        metrics: PluginMetrics::default(),
                    });
                }
                Err(err) => {
                    tracing::warn!(plugin = %manifest.name, "plugin init failed: {err:#}");
                    failed.insert(manifest.name.clone());
                    report
                        .disabled
                        .push((manifest.name.clone(), format!("init failed: {err}")));
                }
            }
        }
        report
    }

    /// Subscribe the host's dispatch to every event on the bus.
    pub fn attach(self: &Arc<Self>, bus: &Arc<EventBus>) {
        let host = Arc::clone(self);
        bus.subscribe(
            Subscription::Wildcard,
            Handler::asynchronous(move |event| {
                let host = Arc::clone(&host);
                Box::pin(async move {
                    host.dispatch(&event).await;
                    Ok(())
                })
            }),
            SubscribeOptions::default(),
        );
    }

    /// Deliver one event to every enabled plugin, sequentially, in
    /// descending priority order (ties by name). The instances lock also
    /// guarantees no plugin is ever invoked re-entrantly.
    pub async fn dispatch(&self, event: &Event) {
        let mut instances = self.instances.lock().await;
        let mut order: Vec<usize> = (0..instances.len()).collect();
        order.sort_by(|&a, &b| {
            instances[b]
                .manifest
                .priority
                .cmp(&instances[a].manifest.priority)
                .then_with(|| instances[a].manifest.name.cmp(&instances[b].manifest.name))
        });
        for idx in order {
            let instance = &mut instances[idx];
            if !instance.enabled {
                continue;
            }
            if let Some(opened_at) = instance.metrics.opened_at {
                if opened_at.elapsed() < self.config.cooldown {
                    continue;
                }
                // Cool-down over: this call is the trial
            }

            let timeout = Duration::from_millis(
                self.config
                    .timeout_override_ms
                    .unwrap_or(instance.manifest.timeout_ms),
            );
            instance.metrics.invocations += 1;
            let start = Instant::now();
            let outcome =
                tokio::time::timeout(timeout, instance.handler.on_event(event, &instance.ctx))
                    .await;
            instance.metrics.total_latency += start.elapsed();

            match outcome {
                Ok(Ok(())) => {
                    if instance.metrics.opened_at.take().is_some() {
                        tracing::info!(plugin = %instance.manifest.name, "circuit closed");
                    }
                    instance.metrics.consecutive_failures = 0;
                }
                Ok(Err(err)) => {
                    tracing::warn!(plugin = %instance.manifest.name, "plugin failed: {err:#}");
                    Self::note_failure(instance, self.config.failure_threshold);
                }
                Err(_) => {
                    tracing::warn!(
                        plugin = %instance.manifest.name,
                        timeout_ms = timeout.as_millis() as u64,
                        "plugin timed out; result abandoned"
                    );
                    instance.metrics.timeouts += 1;
                    Self::note_failure(instance, self.config.failure_threshold);
                }
            }
        }
    }

    fn note_failure(instance: &mut PluginInstance, threshold: u32) {
        instance.metrics.failures += 1;
        instance.metrics.consecutive_failures += 1;
        if instance.metrics.consecutive_failures >= threshold
            && instance.metrics.opened_at.is_none()
        {
            tracing::warn!(plugin = %instance.manifest.name, "circuit opened");
            instance.metrics.opened_at = Some(Instant::now());
        } else if instance.metrics.opened_at.is_some() {
            // Failed trial call: restart the cool-down
            instance.metrics.opened_at = Some(Instant::now());
        }
    }

    /// Shut plugins down in reverse initialization order. Failures are
    /// logged and do not abort the remaining shutdowns.
    pub async fn shutdown(&self) {
        let mut instances = self.instances.lock().await;
        for instance in instances.iter_mut().rev() {
            if !instance.enabled {
                continue;
            }
            instance.enabled = false;
            let timeout = Duration::from_millis(instance.manifest.timeout_ms);
            match tokio::time::timeout(timeout, instance.handler.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(plugin = %instance.manifest.name, "plugin shutdown failed: {err:#}");
                }
                Err(_) => {
                    tracing::warn!(plugin = %instance.manifest.name, "plugin shutdown timed out");
                }
            }
        }
    }

    pub async fn metrics(&self) -> HashMap<String, PluginMetricsSnapshot> {
        let instances = self.instances.lock().await;
        instances
            .iter()
            .map(|instance| {
                let m = &instance.metrics;
                let circuit_state = match m.opened_at {
                    Some(opened_at) if opened_at.elapsed() < self.config.cooldown => {
                        CircuitState::Open
                    }
                    _ => CircuitState::Closed,
                };
                (
                    instance.manifest.name.clone(),
                    PluginMetricsSnapshot {
                        invocations: m.invocations,
                        failures: m.failures,
                        timeouts: m.timeouts,
                        avg_latency_ms: if m.invocations > 0 {
                            m.total_latency.as_secs_f64() * 1_000.0 / m.invocations as f64
                        } else {
                            0.0
                        },
                        circuit_state,
                    },
                )
            })
            .collect()
    }
}

/// Kahn's algorithm over the dependency edges. Ready nodes are picked by
/// descending priority, then name. Returns (ordered, cycle_members).
fn topo_sort(manifests: Vec<PluginManifest>) -> (Vec<PluginManifest>, Vec<PluginManifest>) {
    let mut by_name: HashMap<String, PluginManifest> = manifests
        .into_iter()
        .map(|m| (m.name.clone(), m))
        .collect();

    let mut in_degree: HashMap<String, usize> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for manifest in by_name.values() {
        in_degree.entry(manifest.name.clone()).or_insert(0);
        for dep in &manifest.dependencies {
            *in_degree.entry(manifest.name.clone()).or_insert(0) += 1;
            dependents
                .entry(dep.clone())
                .or_default()
                .push(manifest.name.clone());
        }
    }

    let mut ordered = Vec::new();
    loop {
        let mut ready: Vec<String> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(name, _)| name.clone())
            .collect();
        if ready.is_empty() {
            break;
        }
        ready.sort_by(|a, b| {
            let pa = by_name[a].priority;
            let pb = by_name[b].priority;
            pb.cmp(&pa).then(a.cmp(b))
        });
        for name in ready {
            in_degree.remove(&name);
            for dependent in dependents.get(&name).cloned().unwrap_or_default() {
                if let Some(deg) = in_degree.get_mut(&dependent) {
                    *deg -= 1;
                }
            }
            ordered.push(by_name.remove(&name).expect("ordered node present"));
        }
    }

    let mut cycle: Vec<PluginManifest> = by_name.into_values().collect();
    cycle.sort_by(|a, b| a.name.cmp(&b.name));
    (ordered, cycle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchConfig, BatchWriter};
    use crate::store::StoreKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn manifest(name: &str, deps: &[&str], priority: i32) -> PluginManifest {
        serde_json::from_value(json!({
            "name": name,
            "version": "1.0.0",
            "main": name,
            "dependencies": deps,
            "priority": priority,
        }))
        .unwrap()
    }

    fn seed() -> ContextSeed {
        let store = Arc::new(Store::open(StoreKind::Memory).unwrap());
        let store_for_batches = store.clone();
        let records = Arc::new(BatchWriter::new(BatchConfig {
            batch_size: 16,
            flush_interval: Duration::from_millis(50),
            handler: Arc::new(move |batch: Vec<StoreRecord>| {
                let store = store_for_batches.clone();
                Box::pin(async move {
                    tokio::task::spawn_blocking(move || store.save_batch(&batch)).await?
                })
            }),
            retries: 0,
            retry_delay: Duration::from_millis(1),
            max_concurrent: 1,
            on_error: None,
        }));
        ContextSeed {
            bus: EventBus::new("sess"),
            store,
            records,
            shared_state: Arc::new(Mutex::new(HashMap::new())),
            plugin_configs: HashMap::new(),
        }
    }

    struct RecordingPlugin {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventPlugin for RecordingPlugin {
        async fn init(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("init:{}", self.name));
            Ok(())
        }

        async fn on_event(&self, _event: &Event, _ctx: &PluginContext) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("event:{}", self.name));
            Ok(())
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("shutdown:{}", self.name));
            Ok(())
        }
    }

    fn recording_registry(
        names: &[&'static str],
        log: &Arc<Mutex<Vec<String>>>,
    ) -> PluginRegistry {
        names
            .iter()
            .map(|name| {
                let name = *name;
                let log = log.clone();
                let factory: PluginFactory = Arc::new(move || {
                    Box::new(RecordingPlugin { name, log: log.clone() }) as Box<dyn EventPlugin>
                });
                (name.to_string(), factory)
            })
            .collect()
    }

    fn event() -> Event {
        Event::from_record(
            json!({"kind": "query", "text": "hi"}),
            crate::events::EventSource::Child,
            "sess",
        )
    }

    #[tokio::test]
    async fn init_follows_dependencies_dispatch_follows_priority() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(&["a", "b", "c"], &log);
        let host = PluginHost::new(PluginHostConfig::default());

        // c depends on a, so it initializes last despite its priority;
        // dispatch within an event is pure descending priority
        let report = host
            .load_with_registry(
                vec![
                    manifest("a", &[], 10),
                    manifest("b", &[], 90),
                    manifest("c", &["a"], 100),
                ],
                &seed(),
                &registry,
            )
            .await;
        assert_eq!(report.loaded, vec!["b", "a", "c"]);
        assert!(report.disabled.is_empty());

        host.dispatch(&event()).await;
        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                "init:b", "init:a", "init:c",
                "event:c", "event:b", "event:a",
            ]
        );
    }

    #[tokio::test]
    async fn dispatch_breaks_priority_ties_by_name() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(&["zeta", "alpha"], &log);
        let host = PluginHost::new(PluginHostConfig::default());

        host.load_with_registry(
            vec![manifest("zeta", &[], 50), manifest("alpha", &[], 50)],
            &seed(),
            &registry,
        )
        .await;
        host.dispatch(&event()).await;

        let log = log.lock().unwrap();
        let events: Vec<&String> = log.iter().filter(|l| l.starts_with("event:")).collect();
        assert_eq!(events, vec!["event:alpha", "event:zeta"]);
    }

    #[tokio::test]
    async fn cycle_members_are_excluded_with_one_diagnostic() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(&["a", "b", "c"], &log);
        let host = PluginHost::new(PluginHostConfig::default());

        let report = host
            .load_with_registry(
                vec![
                    manifest("a", &["b"], 50),
                    manifest("b", &["a"], 50),
                    manifest("c", &[], 50),
                ],
                &seed(),
                &registry,
            )
            .await;
        assert_eq!(report.loaded, vec!["c"]);
        let disabled: Vec<&str> = report.disabled.iter().map(|(n, _)| n.as_str()).collect();
        assert!(disabled.contains(&"a"));
        assert!(disabled.contains(&"b"));
    }

    #[tokio::test]
    async fn strict_mode_rejects_whole_graph_on_cycle() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(&["a", "b", "c"], &log);
        let host = PluginHost::new(PluginHostConfig {
            allow_cycle_exclusion: false,
            ..Default::default()
        });

        let report = host
            .load_with_registry(
                vec![
                    manifest("a", &["b"], 50),
                    manifest("b", &["a"], 50),
                    manifest("c", &[], 50),
                ],
                &seed(),
                &registry,
            )
            .await;
        assert!(report.loaded.is_empty());
        assert_eq!(report.disabled.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_names_first_wins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(&["a"], &log);
        let host = PluginHost::new(PluginHostConfig::default());

        let report = host
            .load_with_registry(
                vec![manifest("a", &[], 50), manifest("a", &[], 90)],
                &seed(),
                &registry,
            )
            .await;
        assert_eq!(report.loaded, vec!["a"]);
        assert_eq!(report.disabled.len(), 1);
    }

    struct FailingInitPlugin;

    #[async_trait]
    impl EventPlugin for FailingInitPlugin {
        async fn init(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("refuses to start"))
        }

        async fn on_event(&self, _event: &Event, _ctx: &PluginContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn init_failure_disables_dependents() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = recording_registry(&["dependent"], &log);
        registry.insert(
            "flaky".to_string(),
            Arc::new(|| Box::new(FailingInitPlugin) as Box<dyn EventPlugin>),
        );
        let host = PluginHost::new(PluginHostConfig::default());

        let report = host
            .load_with_registry(
                vec![manifest("flaky", &[], 50), manifest("dependent", &["flaky"], 50)],
                &seed(),
                &registry,
            )
            .await;
        assert!(report.loaded.is_empty());
        assert_eq!(report.disabled.len(), 2);
    }

    struct SleepyPlugin {
        sleep: Duration,
    }

    #[async_trait]
    impl EventPlugin for SleepyPlugin {
        async fn on_event(&self, _event: &Event, _ctx: &PluginContext) -> anyhow::Result<()> {
            tokio::time::sleep(self.sleep).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn timeout_is_counted_and_others_still_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = recording_registry(&["witness"], &log);
        registry.insert(
            "slow".to_string(),
            Arc::new(|| {
                Box::new(SleepyPlugin { sleep: Duration::from_millis(200) }) as Box<dyn EventPlugin>
            }),
        );
        let host = PluginHost::new(PluginHostConfig::default());

        let mut slow = manifest("slow", &[], 90);
        slow.timeout_ms = 50;
        let report = host
            .load_with_registry(
                vec![slow, manifest("witness", &[], 50)],
                &seed(),
                &registry,
            )
            .await;
        assert_eq!(report.loaded, vec!["slow", "witness"]);

        host.dispatch(&event()).await;

        let metrics = host.metrics().await;
        assert_eq!(metrics["slow"].timeouts, 1);
        assert_eq!(metrics["slow"].failures, 1);
        assert!(log.lock().unwrap().contains(&"event:witness".to_string()));
    }

    struct FailingPlugin;

    #[async_trait]
    impl EventPlugin for FailingPlugin {
        async fn on_event(&self, _event: &Event, _ctx: &PluginContext) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("always fails"))
        }
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_and_closes_after_cooldown() {
        let mut registry: PluginRegistry = HashMap::new();
        let call_count = Arc::new(std::sync::atomic::AtomicU64::new(0));

        struct CountingFlaky {
            calls: Arc<std::sync::atomic::AtomicU64>,
            fail_first: u64,
        }

        #[async_trait]
        impl EventPlugin for CountingFlaky {
            async fn on_event(&self, _event: &Event, _ctx: &PluginContext) -> anyhow::Result<()> {
                let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if n < self.fail_first {
                    Err(anyhow::anyhow!("failure {n}"))
                } else {
                    Ok(())
                }
            }
        }

        let calls = call_count.clone();
        registry.insert(
            "flaky".to_string(),
            Arc::new(move || {
                Box::new(CountingFlaky { calls: calls.clone(), fail_first: 3 })
                    as Box<dyn EventPlugin>
            }),
        );

        let host = PluginHost::new(PluginHostConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(50),
            ..Default::default()
        });
        host.load_with_registry(vec![manifest("flaky", &[], 50)], &seed(), &registry)
            .await;

        for _ in 0..3 {
            host.dispatch(&event()).await;
        }
        assert_eq!(host.metrics().await["flaky"].circuit_state, CircuitState::Open);

        // Open circuit skips dispatch entirely
        host.dispatch(&event()).await;
        assert_eq!(call_count.load(std::sync::atomic::Ordering::SeqCst), 3);

        // After the cool-down, the trial call succeeds and closes the circuit
        tokio::time::sleep(Duration::from_millis(60)).await;
        host.dispatch(&event()).await;
        let metrics = host.metrics().await;
        assert_eq!(metrics["flaky"].circuit_state, CircuitState::Closed);
        assert_eq!(call_count.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn shutdown_runs_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(&["a", "b"], &log);
        let host = PluginHost::new(PluginHostConfig::default());

        host.load_with_registry(
            vec![manifest("a", &[], 90), manifest("b", &[], 50)],
            &seed(),
            &registry,
        )
        .await;
        host.shutdown().await;

        let log = log.lock().unwrap();
        let shutdowns: Vec<&String> =
            log.iter().filter(|l| l.starts_with("shutdown:")).collect();
        assert_eq!(shutdowns, vec!["shutdown:b", "shutdown:a"]);
    }

    #[tokio::test]
    async fn unknown_handler_disables_plugin() {
        let registry: PluginRegistry = HashMap::new();
        let host = PluginHost::new(PluginHostConfig::default());
        let report = host
            .load_with_registry(vec![manifest("ghost", &[], 50)], &seed(), &registry)
            .await;
        assert!(report.loaded.is_empty());
        assert!(report.disabled[0].1.contains("unknown handler"));
    }
}
