// Orchestration: wire the components into one run
//
// Startup: store → batch writer → bus → plugin host → child → splitter,
// then signal forwarding. Shutdown runs the same chain in reverse under a
// global graceful window: drain the observed streams to EOF, gate the
// analysis taps, drain the bus, shut plugins down, flush the batch writer,
// close the store, clean up the child. Exceeding the window escalates to a
// forced kill and best-effort close.

use crate::batch::{BatchConfig, BatchWriter};
use crate::bus::EventBus;
use crate::child::{ChildSignal, ChildSupervisor, ExitInfo, SpawnError};
use crate::config::Config;
use crate::events::{generate_session_id, EventSource, StoreRecord};
use crate::plugins::host::ContextSeed;
use crate::plugins::{PluginHost, PluginHostConfig};
use crate::splitter::StreamSplitter;
use crate::store::Store;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

enum RunError {
    /// Before the child existed; exits 2 with a diagnostic on stderr
    PreSpawn(anyhow::Error),
    /// After the child spawned; exits 1
    Orchestration(anyhow::Error),
}

pub struct Orchestrator {
    config: Config,
    session_id: String,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Orchestrator {
            config,
            session_id: generate_session_id(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wrap the configured tool on the real stdio streams.
    pub async fn run(&self, forwarded: Vec<String>) -> i32 {
        self.run_wired(
            forwarded,
            tokio::io::stdout(),
            tokio::io::stderr(),
            tokio::io::stdin(),
        )
        .await
    }

    /// Same run with injectable stdio, so tests can observe the
    /// passthrough.
    pub async fn run_wired<O, E, I>(
        &self,
        forwarded: Vec<String>,
        parent_out: O,
        parent_err: E,
        parent_in: I,
    ) -> i32
    where
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
        I: AsyncRead + Unpin + Send + 'static,
    {
        match self
            .try_run(forwarded, parent_out, parent_err, parent_in)
            .await
        {
            Ok(code) => code,
            Err(RunError::PreSpawn(err)) => {
                eprintln!("codetap: {err:#}");
                2
            }
            Err(RunError::Orchestration(err)) => {
                tracing::error!("orchestration failed: {err:#}");
                1
            }
        }
    }

    async fn try_run<O, E, I>(
        &self,
        forwarded: Vec<String>,
        parent_out: O,
        parent_err: E,
        parent_in: I,
    ) -> Result<i32, RunError>
    where
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
        I: AsyncRead + Unpin + Send + 'static,
    {
        let config = &self.config;
        tracing::info!(session_id = %self.session_id, "session starting");

        // Store first; an unusable store is fatal before the child exists
        let store =
            Arc::new(Store::open(config.store_kind()).map_err(RunError::PreSpawn)?);

        // Batched path from plugins into the store
        let store_for_batches = store.clone();
        let records = Arc::new(BatchWriter::new(BatchConfig {
            batch_size: config.database.batch_size,
            flush_interval: config.flush_interval(),
            handler: Arc::new(move |batch: Vec<StoreRecord>| {
                let store = store_for_batches.clone();
                Box::pin(async move {
                    tokio::task::spawn_blocking(move || store.save_batch(&batch)).await?
                })
            }),
            retries: config.plugins.retry_attempts,
            retry_delay: Duration::from_millis(100),
            max_concurrent: 2,
            on_error: Some(Arc::new(|err, batch: &[StoreRecord], attempts| {
                tracing::error!(
                    batch_len = batch.len(),
                    attempts,
                    "dropping batch after retries: {err:#}"
                );
            })),
        }));

        let bus = EventBus::new(self.session_id.clone());

        let host = PluginHost::new(PluginHostConfig {
            timeout_override_ms: config.plugins.timeout_ms,
            enabled: config.plugins.enabled_plugins.clone(),
            disabled: config.plugins.disabled_plugins.clone(),
            ..Default::default()
        });
        let candidates = PluginHost::discover(&config.plugins.directory);
        let seed = ContextSeed {
            bus: bus.clone(),
            store: store.clone(),
            records: records.clone(),
            shared_state: Arc::new(Mutex::new(HashMap::new())),
            plugin_configs: HashMap::new(),
        };
        let report = host.load(candidates, &seed).await;
        tracing::info!(loaded = report.loaded.len(), "plugins ready");
        for (name, reason) in &report.disabled {
            tracing::warn!(plugin = %name, "disabled: {reason}");
        }
        host.attach(&bus);

        // Spawn the wrapped tool
        let supervisor = ChildSupervisor::new();
        let streams = supervisor
            .spawn(config.binary(), &forwarded, None)
            .await
            .map_err(|err: SpawnError| RunError::PreSpawn(err.into()))?;

        // Passthrough + analysis taps; stdin is forwarded untouched
        let splitter = StreamSplitter::new(config.wrapper.buffer_size);
        splitter.attach_observed(streams.stdout, parent_out, bus.clone(), EventSource::Child);
        splitter.attach_observed(streams.stderr, parent_err, bus.clone(), EventSource::Child);
        splitter.attach_passthrough(parent_in, streams.stdin);

        supervisor.forward_signals();

        // The run now belongs to the child
        let exit = wait_for_child(&supervisor).await;

        // Reverse teardown under the graceful window
        let graceful = config.graceful_shutdown();
        let orderly = async {
            // The pipes may still hold the child's final output; drain to
            // EOF so the tail records are analyzed, then gate the taps.
            splitter.drain().await;
            splitter.detach_analysis();
            bus.drain().await;
            host.shutdown().await;
            records.stop().await;
            if let Ok(stats) = store.stats(Default::default()) {
                tracing::info!(
                    total_queries = stats.total_queries,
                    total_tokens = stats.total_tokens,
                    error_rate = stats.error_rate,
                    "store totals"
                );
            }
            store.close();
            supervisor.cleanup().await;
            // Stops the stdin forwarder; observed streams already drained
            splitter.cleanup();
        };
        if tokio::time::timeout(graceful, orderly).await.is_err() {
            tracing::warn!("graceful window exceeded; forcing shutdown");
            let _ = supervisor.signal_child(ChildSignal::Kill);
            splitter.cleanup();
            store.close();
            supervisor.cleanup().await;
        }

        let bus_metrics = bus.metrics();
        let tap_metrics = splitter.metrics();
        let batch_metrics = records.metrics();
        tracing::info!(
            session_id = %self.session_id,
            events = bus_metrics.total_published,
            handler_errors = bus_metrics.error_count,
            bytes_passed = tap_metrics.bytes_passed,
            records = tap_metrics.records_emitted,
            parse_errors = tap_metrics.parse_errors,
            drops = tap_metrics.backpressure_drops,
            batches = batch_metrics.total_batches,
            failed_batches = batch_metrics.failed_batches,
            "session finished"
        );

        Ok(exit_code(exit))
    }
}

async fn wait_for_child(supervisor: &Arc<ChildSupervisor>) -> Option<ExitInfo> {
    let mut exited = supervisor.on_exit();
    loop {
        if let Some(info) = *exited.borrow() {
            return Some(info);
        }
        if exited.changed().await.is_err() {
            return None;
        }
    }
}

/// Exit-code policy: pass the child's code through; a signal death maps to
/// the shell convention; no observed exit is a clean self-shutdown.
fn exit_code(exit: Option<ExitInfo>) -> i32 {
    match exit {
        Some(info) => match (info.code, info.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 0,
        },
        None => 0,
    }
}
