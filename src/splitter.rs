// Stream splitting: untouched passthrough plus a parallel analysis tap
//
// Each observed source has one read loop. Every chunk is written to the
// destination first (awaited, flushed), then offered to the analysis
// channel with try_send. A full channel drops the chunk and bumps a
// counter; the passthrough is never gated on analysis keeping up. The
// analysis task feeds the frame parser and publishes resulting records to
// the bus.

use crate::bus::EventBus;
use crate::events::{Event, EventSource};
use crate::frame::FrameParser;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const READ_BUF_SIZE: usize = 8_192;

#[derive(Debug, Clone, Default)]
pub struct SplitterMetrics {
    pub bytes_passed: u64,
    pub bytes_analyzed: u64,
    pub records_emitted: u64,
    pub parse_errors: u64,
    pub backpressure_drops: u64,
}

#[derive(Default)]
struct MetricsInner {
    bytes_passed: AtomicU64,
    bytes_analyzed: AtomicU64,
    records_emitted: AtomicU64,
    parse_errors: AtomicU64,
    backpressure_drops: AtomicU64,
    drop_warned: AtomicBool,
}

pub struct StreamSplitter {
    metrics: Arc<MetricsInner>,
    analysis_enabled: Arc<AtomicBool>,
    analysis_capacity: usize,
    /// Observed-stream tasks; finish at source EOF and are awaited by drain
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Pure passthroughs (stdin forwarding); aborted on cleanup
    aux: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamSplitter {
    pub fn new(analysis_capacity: usize) -> Self {
        StreamSplitter {
            metrics: Arc::new(MetricsInner::default()),
            analysis_enabled: Arc::new(AtomicBool::new(true)),
            analysis_capacity: analysis_capacity.max(1),
            tasks: Mutex::new(Vec::new()),
            aux: Mutex::new(Vec::new()),
        }
    }

    /// Byte-for-byte forwarding with no tap, closed when the source closes.
    pub fn attach_passthrough<R, W>(&self, mut source: R, mut dest: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let metrics = self.metrics.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                match source.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if dest.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        let _ = dest.flush().await;
                        metrics.bytes_passed.fetch_add(n as u64, Ordering::Relaxed);
                    }
                }
            }
            let _ = dest.shutdown().await;
        });
        self.aux.lock().unwrap().push(task);
    }

    /// Passthrough plus analysis: the destination sees every byte
    /// unmodified; a copy of each chunk feeds the parser → bus pipeline.
    pub fn attach_observed<R, W>(
        &self,
        mut source: R,
        mut dest: W,
        bus: Arc<EventBus>,
        event_source: EventSource,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Bytes>(self.analysis_capacity);

        // Analysis side: reassemble records, publish them
        let metrics = self.metrics.clone();
        let analysis = tokio::spawn(async move {
            let mut parser = FrameParser::new();
            while let Some(chunk) = rx.recv().await {
                metrics
                    .bytes_analyzed
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                for record in parser.feed(&chunk) {
                    let event = Event::from_record(record, event_source, bus.session_id());
                    bus.publish(event);
                    metrics.records_emitted.fetch_add(1, Ordering::Relaxed);
                }
                metrics
                    .parse_errors
                    .store(parser.parse_errors(), Ordering::Relaxed);
            }
        });

        // Passthrough side: write first, then offer the copy
        let metrics = self.metrics.clone();
        let enabled = self.analysis_enabled.clone();
        let passthrough = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                match source.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if dest.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        let _ = dest.flush().await;
                        metrics.bytes_passed.fetch_add(n as u64, Ordering::Relaxed);

                        if enabled.load(Ordering::Acquire) {
                            match tx.try_send(Bytes::copy_from_slice(&buf[..n])) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    metrics
                                        .backpressure_drops
                                        .fetch_add(1, Ordering::Relaxed);
                                    if !metrics.drop_warned.swap(true, Ordering::Relaxed) {
                                        tracing::warn!(
                                            "analysis tap overflowed; dropping chunks"
                                        );
                                    }
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {}
                            }
                        }
                    }
                }
            }
            let _ = dest.flush().await;
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(passthrough);
        tasks.push(analysis);
    }

    /// Stop feeding the analysis taps. Passthroughs keep running; pending
    /// analysis drains on its own.
    pub fn detach_analysis(&self) {
        self.analysis_enabled.store(false, Ordering::Release);
    }

    /// Await completion of observed streams (source EOF and analysis
    /// drained). Callers bound this with their own timeout.
    pub async fn drain(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Detach everything, idempotently. Un-drained tasks are aborted.
    pub fn cleanup(&self) {
        self.detach_analysis();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for task in self.aux.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    pub fn metrics(&self) -> SplitterMetrics {
        SplitterMetrics {
            bytes_passed: self.metrics.bytes_passed.load(Ordering::Relaxed),
            bytes_analyzed: self.metrics.bytes_analyzed.load(Ordering::Relaxed),
            records_emitted: self.metrics.records_emitted.load(Ordering::Relaxed),
            parse_errors: self.metrics.parse_errors.load(Ordering::Relaxed),
            backpressure_drops: self.metrics.backpressure_drops.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Handler, SubscribeOptions, Subscription};
    use crate::events::EventKind;
    use tokio::io::duplex;

    async fn read_all(mut reader: impl AsyncRead + Unpin) -> Vec<u8> {
        let mut out = Vec::new();
        let _ = reader.read_to_end(&mut out).await;
        out
    }

    #[tokio::test]
    async fn passthrough_preserves_bytes_exactly() {
        let (mut source_writer, source_reader) = duplex(1024);
        let (dest_writer, dest_reader) = duplex(1024);
        let splitter = StreamSplitter::new(64);
        let bus = EventBus::new("sess");

        splitter.attach_observed(source_reader, dest_writer, bus, EventSource::Child);

        let payload = b"{\"kind\":\"response\",\"text\":\"hi\"}\nnot json at all\n\x00\x01binary";
        source_writer.write_all(payload).await.unwrap();
        drop(source_writer);

        let seen = read_all(dest_reader).await;
        assert_eq!(seen, payload);
        splitter.drain().await;
        assert_eq!(splitter.metrics().bytes_passed, payload.len() as u64);
    }

    #[tokio::test]
    async fn records_are_published_with_session_identity() {
        let (mut source_writer, source_reader) = duplex(1024);
        let (dest_writer, dest_reader) = duplex(1024);
        let splitter = StreamSplitter::new(64);
        let bus = EventBus::new("sess-77");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            Subscription::Wildcard,
            Handler::sync(move |e| {
                sink.lock()
                    .unwrap()
                    .push((e.kind, e.metadata.session_id.clone()));
                Ok(())
            }),
            SubscribeOptions::default(),
        );

        splitter.attach_observed(source_reader, dest_writer, bus, EventSource::Child);
        source_writer
            .write_all(b"{\"kind\":\"response\",\"text\":\"hi\"}\n")
            .await
            .unwrap();
        drop(source_writer);

        let _ = read_all(dest_reader).await;
        splitter.drain().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, EventKind::Response);
        assert_eq!(seen[0].1, "sess-77");
        assert_eq!(splitter.metrics().records_emitted, 1);
    }

    #[tokio::test]
    async fn split_records_across_chunks_still_parse() {
        let (mut source_writer, source_reader) = duplex(1024);
        let (dest_writer, dest_reader) = duplex(1024);
        let splitter = StreamSplitter::new(64);
        let bus = EventBus::new("sess");

        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        bus.subscribe(
            Subscription::Wildcard,
            Handler::sync(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            SubscribeOptions::default(),
        );

        splitter.attach_observed(source_reader, dest_writer, bus, EventSource::Child);
        source_writer.write_all(b"{\"kind\":\"res").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        source_writer
            .write_all(b"ponse\",\"text\":\"ok\"}\n")
            .await
            .unwrap();
        drop(source_writer);

        let _ = read_all(dest_reader).await;
        splitter.drain().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn garbage_counts_parse_errors_but_passes_through() {
        let (mut source_writer, source_reader) = duplex(1024);
        let (dest_writer, dest_reader) = duplex(1024);
        let splitter = StreamSplitter::new(64);
        let bus = EventBus::new("sess");

        splitter.attach_observed(source_reader, dest_writer, bus, EventSource::Child);
        source_writer
            .write_all(b"plain human output\n{\"kind\":\"response\"}\n")
            .await
            .unwrap();
        drop(source_writer);

        let seen = read_all(dest_reader).await;
        assert_eq!(seen, b"plain human output\n{\"kind\":\"response\"}\n");
        splitter.drain().await;
        let metrics = splitter.metrics();
        assert_eq!(metrics.parse_errors, 1);
        assert_eq!(metrics.records_emitted, 1);
    }

    #[tokio::test]
    async fn detached_analysis_stops_publishing_but_not_passthrough() {
        let (mut source_writer, source_reader) = duplex(1024);
        let (dest_writer, dest_reader) = duplex(1024);
        let splitter = StreamSplitter::new(64);
        let bus = EventBus::new("sess");

        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        bus.subscribe(
            Subscription::Wildcard,
            Handler::sync(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            SubscribeOptions::default(),
        );

        splitter.attach_observed(source_reader, dest_writer, bus, EventSource::Child);
        splitter.detach_analysis();

        source_writer
            .write_all(b"{\"kind\":\"response\"}\n")
            .await
            .unwrap();
        drop(source_writer);

        let seen = read_all(dest_reader).await;
        assert_eq!(seen, b"{\"kind\":\"response\"}\n");
        splitter.drain().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overflow_drops_chunks_without_stalling_passthrough() {
        let (mut source_writer, source_reader) = duplex(256 * 1024);
        let (dest_writer, dest_reader) = duplex(256 * 1024);
        let splitter = StreamSplitter::new(1);
        let bus = EventBus::new("sess");

        // A deliberately slow subscriber stalls the analysis drain
        bus.subscribe(
            Subscription::Wildcard,
            Handler::sync(|_| {
                std::thread::sleep(std::time::Duration::from_millis(30));
                Ok(())
            }),
            SubscribeOptions::default(),
        );

        splitter.attach_observed(source_reader, dest_writer, bus, EventSource::Child);

        let reader_task = tokio::spawn(read_all(dest_reader));
        for i in 0..50 {
            let line = format!("{{\"kind\":\"response\",\"n\":{i}}}\n");
            source_writer.write_all(line.as_bytes()).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        drop(source_writer);

        let seen = reader_task.await.unwrap();
        let lines = seen.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count();
        assert_eq!(lines, 50, "passthrough must not drop");

        splitter.drain().await;
        assert!(splitter.metrics().backpressure_drops > 0);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let splitter = StreamSplitter::new(8);
        let (_writer, reader) = duplex(64);
        let (dest, _sink) = duplex(64);
        splitter.attach_passthrough(reader, dest);
        splitter.cleanup();
        splitter.cleanup();
    }
}
