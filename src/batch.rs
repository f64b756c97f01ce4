// Generic size/time-triggered batching queue
//
// Amortizes per-item I/O into batches: a batch is dispatched as soon as the
// queue reaches `batch_size`, or `flush_interval` after the first item
// arrived, whichever comes first. Handler failures are retried with linear
// backoff; exhausted batches go to `on_error` and are not re-enqueued.
// Items added while a flush is in flight land in a fresh queue.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};

pub type BatchHandler<T> =
    Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type BatchErrorHook<T> = Arc<dyn Fn(&anyhow::Error, &[T], u32) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
#[error("batch writer is stopped")]
pub struct WriterStopped;

pub struct BatchConfig<T> {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub handler: BatchHandler<T>,
    /// Retries after the first attempt; 0 means fail fast
    pub retries: u32,
    /// Linear backoff step: attempt N waits N * retry_delay
    pub retry_delay: Duration,
    pub max_concurrent: usize,
    pub on_error: Option<BatchErrorHook<T>>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchMetrics {
    pub total_items: u64,
    pub total_batches: u64,
    pub failed_batches: u64,
    pub avg_batch_size: f64,
    pub avg_handler_latency_ms: f64,
    pub queued: usize,
    pub in_flight: usize,
}

struct WriterState<T> {
    config: BatchConfig<T>,
    queue: Mutex<Vec<T>>,
    /// Bumped whenever the queue is detached; lets a delayed flush detect
    /// that its queue generation was already dispatched
    generation: AtomicU64,
    stopped: AtomicBool,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    idle: Notify,
    total_items: AtomicU64,
    total_batches: AtomicU64,
    failed_batches: AtomicU64,
    batched_items: AtomicU64,
    handler_latency_us: AtomicU64,
    handler_calls: AtomicU64,
}

pub struct BatchWriter<T> {
    state: Arc<WriterState<T>>,
}

impl<T: Clone + Send + Sync + 'static> BatchWriter<T> {
    pub fn new(config: BatchConfig<T>) -> Self {
        assert!(config.batch_size > 0, "batch_size must be positive");
        assert!(config.max_concurrent >= 1, "max_concurrent must be at least 1");
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        BatchWriter {
            state: Arc::new(WriterState {
                semaphore,
                config,
                queue: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                total_items: AtomicU64::new(0),
                total_batches: AtomicU64::new(0),
                failed_batches: AtomicU64::new(0),
                batched_items: AtomicU64::new(0),
                handler_latency_us: AtomicU64::new(0),
                handler_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Append an item. Reaching `batch_size` dispatches immediately;
    /// otherwise a flush is scheduled within `flush_interval`. Refused
    /// after `stop`.
    pub fn add(&self, item: T) -> Result<(), WriterStopped> {
        let state = &self.state;
        if state.stopped.load(Ordering::Acquire) {
            return Err(WriterStopped);
        }

        let (dispatch, schedule_timer) = {
            let mut queue = state.queue.lock().unwrap();
            queue.push(item);
            state.total_items.fetch_add(1, Ordering::Relaxed);
            if queue.len() >= state.config.batch_size {
                (Some(Self::detach_locked(state, &mut queue)), false)
            } else {
                (None, queue.len() == 1)
            }
        };

        if let Some(batch) = dispatch {
            Self::spawn_batch(state.clone(), batch);
        } else if schedule_timer {
            let state = state.clone();
            let generation = state.generation.load(Ordering::Acquire);
            tokio::spawn(async move {
                tokio::time::sleep(state.config.flush_interval).await;
                let batch = {
                    let mut queue = state.queue.lock().unwrap();
                    if state.generation.load(Ordering::Acquire) != generation
                        || queue.is_empty()
                    {
                        None
                    } else {
                        Some(Self::detach_locked(&state, &mut queue))
                    }
                };
                if let Some(batch) = batch {
                    Self::spawn_batch(state.clone(), batch);
                }
            });
        }
        Ok(())
    }

    /// Force an immediate drain and await completion of all in-flight work.
    pub async fn flush(&self) {
        let state = &self.state;
        let batch = {
            let mut queue = state.queue.lock().unwrap();
            if queue.is_empty() {
                None
            } else {
                Some(Self::detach_locked(state, &mut queue))
            }
        };
        if let Some(batch) = batch {
            Self::spawn_batch(state.clone(), batch);
        }
        self.wait_idle().await;
    }

    /// Refuse further adds, drain pending items, and await in-flight work.
    pub async fn stop(&self) {
        self.state.stopped.store(true, Ordering::Release);
        self.flush().await;
    }

    pub fn metrics(&self) -> BatchMetrics {
        let state = &self.state;
        let batches = state.total_batches.load(Ordering::Relaxed);
        let calls = state.handler_calls.load(Ordering::Relaxed);
        BatchMetrics {
            total_items: state.total_items.load(Ordering::Relaxed),
            total_batches: batches,
            failed_batches: state.failed_batches.load(Ordering::Relaxed),
            avg_batch_size: if batches > 0 {
                state.batched_items.load(Ordering::Relaxed) as f64 / batches as f64
            } else {
                0.0
            },
            avg_handler_latency_ms: if calls > 0 {
                state.handler_latency_us.load(Ordering::Relaxed) as f64 / calls as f64 / 1000.0
            } else {
                0.0
            },
            queued: state.queue.lock().unwrap().len(),
            in_flight: state.in_flight.load(Ordering::Acquire),
        }
    }

    async fn wait_idle(&self) {
        let state = &self.state;
        loop {
            let notified = state.idle.notified();
            if state.in_flight.load(Ordering::Acquire) == 0
                && state.queue.lock().unwrap().is_empty()
            {
                return;
            }
            notified.await;
        }
    }

    /// Atomically detach the queue contents as a batch. New adds go into
    /// the fresh queue and never join an already-dispatched batch.
    fn detach_locked(state: &WriterState<T>, queue: &mut Vec<T>) -> Vec<T> {
        state.generation.fetch_add(1, Ordering::AcqRel);
        std::mem::take(queue)
    }

    fn spawn_batch(state: Arc<WriterState<T>>, batch: Vec<T>) {
        state.in_flight.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            let permit = state
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("batch semaphore closed");
            Self::run_batch(&state, batch).await;
            drop(permit);
            state.in_flight.fetch_sub(1, Ordering::AcqRel);
            state.idle.notify_waiters();
        });
    }

    async fn run_batch(state: &WriterState<T>, batch: Vec<T>) {
        let size = batch.len() as u64;
        state.total_batches.fetch_add(1, Ordering::Relaxed);
        state.batched_items.fetch_add(size, Ordering::Relaxed);

        let attempts = state.config.retries + 1;
        let mut last_err = None;
        for attempt in 1..=attempts {
            let start = Instant::now();
            let result = (state.config.handler)(batch.clone()).await;
            state
                .handler_latency_us
                .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
            state.handler_calls.fetch_add(1, Ordering::Relaxed);

            match result {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(attempt, "batch handler failed: {err:#}");
                    last_err = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(state.config.retry_delay * attempt).await;
                    }
                }
            }
        }

        state.failed_batches.fetch_add(1, Ordering::Relaxed);
        if let (Some(err), Some(hook)) = (last_err.as_ref(), state.config.on_error.as_ref()) {
            hook(err, &batch, attempts);
        }
    }
}
