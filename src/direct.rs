// Direct-invocation adapter
//
// Drives the same bus → plugins → store pipeline without a child process:
// `ask` opens a message stream from the underlying source and mirrors it as
// events — one `query` up front, a `response` per message, an aggregated
// final `response` carrying accumulated usage, or an `error` that also
// terminates the returned sequence.
//
// The returned stream is finite and not restartable. A consumer that walks
// away cancels the producer: each send observes a bounded grace window and
// the task stops when the window lapses or the receiver is gone.

use crate::bus::EventBus;
use crate::events::{generate_id, Event, EventSource};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    pub model: Option<String>,
    pub metadata: Option<Value>,
}

/// One message from the underlying assistant.
#[derive(Debug, Clone)]
pub struct SourceMessage {
    pub text: String,
    pub model: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub finish_reason: Option<String>,
}

/// The underlying AI call. External collaborators implement this; the
/// adapter never knows what is behind it.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn open(
        &self,
        prompt: &str,
        options: &AskOptions,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<SourceMessage>>>;
}

pub struct DirectAdapter {
    bus: Arc<EventBus>,
    source: Arc<dyn MessageSource>,
    /// How long a send may wait on a stalled consumer before the producer
    /// gives up
    grace: Duration,
}

impl DirectAdapter {
    pub fn new(bus: Arc<EventBus>, source: Arc<dyn MessageSource>) -> Self {
        DirectAdapter {
            bus,
            source,
            grace: Duration::from_secs(5),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn ask(
        &self,
        prompt: impl Into<String>,
        options: AskOptions,
    ) -> ReceiverStream<anyhow::Result<SourceMessage>> {
        let prompt = prompt.into();
        let query_id = generate_id();
        let model = options.model.clone().unwrap_or_else(|| "default".to_string());

        let mut query_payload = json!({
            "kind": "query",
            "id": query_id,
            "text": prompt,
            "model": model,
        });
        if let Some(metadata) = &options.metadata {
            query_payload["metadata"] = metadata.clone();
        }
        self.bus.publish(Event::from_record(
            query_payload,
            EventSource::Direct,
            self.bus.session_id(),
        ));

        let (tx, rx) = mpsc::channel(8);
        let bus = self.bus.clone();
        let source = self.source.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            let started = Instant::now();
            let mut stream = match source.open(&prompt, &options).await {
                Ok(stream) => stream,
                Err(err) => {
                    publish_error(&bus, &query_id, &err);
                    let _ = tokio::time::timeout(grace, tx.send(Err(err))).await;
                    return;
                }
            };

            let mut message_count: u64 = 0;
            let mut input_tokens: u64 = 0;
            let mut output_tokens: u64 = 0;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(message) => {
                        message_count += 1;
                        input_tokens += u64::from(message.input_tokens.unwrap_or(0));
                        output_tokens += u64::from(message.output_tokens.unwrap_or(0));

                        let mut event = Event::from_record(
                            json!({
                                "kind": "response",
                                "queryId": query_id,
                                "text": message.text,
                                "model": message.model,
                                "inputTokens": message.input_tokens,
                                "outputTokens": message.output_tokens,
                                "finishReason": message.finish_reason,
                            }),
                            EventSource::Direct,
                            bus.session_id(),
                        );
                        event.metadata.latency_ms = Some(started.elapsed().as_millis() as u64);
                        bus.publish(event);

                        match tokio::time::timeout(grace, tx.send(Ok(message))).await {
                            Ok(Ok(())) => {}
                            // Consumer gone or stalled past the grace window
                            Ok(Err(_)) | Err(_) => return,
                        }
                    }
                    Err(err) => {
                        publish_error(&bus, &query_id, &err);
                        let _ = tokio::time::timeout(grace, tx.send(Err(err))).await;
                        return;
                    }
                }
            }

            // End of sequence: aggregated usage summary
            let mut event = Event::from_record(
                json!({
                    "kind": "response",
                    "queryId": query_id,
                    "text": "",
                    "model": model,
                    "aggregate": true,
                    "messageCount": message_count,
                    "inputTokens": input_tokens,
                    "outputTokens": output_tokens,
                }),
                EventSource::Direct,
                bus.session_id(),
            );
            event.metadata.latency_ms = Some(started.elapsed().as_millis() as u64);
            bus.publish(event);
        });

        ReceiverStream::new(rx)
    }
}

fn publish_error(bus: &Arc<EventBus>, query_id: &str, err: &anyhow::Error) {
    bus.publish(Event::from_record(
        json!({
            "kind": "error",
            "queryId": query_id,
            "error": err.to_string(),
        }),
        EventSource::Direct,
        bus.session_id(),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Handler, SubscribeOptions, Subscription};
    use crate::events::EventKind;
    use std::sync::Mutex;

    struct StaticSource {
        messages: Vec<SourceMessage>,
        delay: Duration,
    }

    #[async_trait]
    impl MessageSource for StaticSource {
        async fn open(
            &self,
            _prompt: &str,
            _options: &AskOptions,
        ) -> anyhow::Result<BoxStream<'static, anyhow::Result<SourceMessage>>> {
            let messages = self.messages.clone();
            let delay = self.delay;
            Ok(futures::stream::iter(messages)
                .then(move |m| async move {
                    tokio::time::sleep(delay).await;
                    Ok(m)
                })
                .boxed())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl MessageSource for FailingSource {
        async fn open(
            &self,
            _prompt: &str,
            _options: &AskOptions,
        ) -> anyhow::Result<BoxStream<'static, anyhow::Result<SourceMessage>>> {
            Err(anyhow::anyhow!("upstream unavailable"))
        }
    }

    fn message(text: &str) -> SourceMessage {
        SourceMessage {
            text: text.to_string(),
            model: "haiku".to_string(),
            input_tokens: Some(10),
            output_tokens: Some(20),
            finish_reason: Some("end_turn".to_string()),
        }
    }

    fn kind_log(bus: &Arc<EventBus>) -> Arc<Mutex<Vec<(EventKind, Value)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        bus.subscribe(
            Subscription::Wildcard,
            Handler::sync(move |e| {
                sink.lock().unwrap().push((e.kind, e.payload.clone()));
                Ok(())
            }),
            SubscribeOptions::default(),
        );
        log
    }

    #[tokio::test]
    async fn emits_query_responses_and_aggregate() {
        let bus = EventBus::new("sess");
        let log = kind_log(&bus);
        let adapter = DirectAdapter::new(
            bus.clone(),
            Arc::new(StaticSource {
                messages: vec![message("one"), message("two")],
                delay: Duration::from_millis(1),
            }),
        );

        let mut stream = adapter.ask("hello", AskOptions::default());
        let mut received = Vec::new();
        while let Some(item) = stream.next().await {
            received.push(item.unwrap().text);
        }
        assert_eq!(received, vec!["one", "two"]);

        // Producer publishes the aggregate after the last send
        tokio::time::sleep(Duration::from_millis(20)).await;

        let log = log.lock().unwrap();
        let kinds: Vec<EventKind> = log.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Query,
                EventKind::Response,
                EventKind::Response,
                EventKind::Response,
            ]
        );
        let aggregate = &log.last().unwrap().1;
        assert_eq!(aggregate["aggregate"], true);
        assert_eq!(aggregate["messageCount"], 2);
        assert_eq!(aggregate["inputTokens"], 20);
        assert_eq!(aggregate["outputTokens"], 40);
    }

    #[tokio::test]
    async fn responses_correlate_to_the_query() {
        let bus = EventBus::new("sess");
        let correlations = Arc::new(Mutex::new(Vec::new()));
        let sink = correlations.clone();
        bus.subscribe(
            Subscription::Wildcard,
            Handler::sync(move |e| {
                sink.lock().unwrap().push(e.metadata.correlation_id.clone());
                Ok(())
            }),
            SubscribeOptions::default(),
        );

        let adapter = DirectAdapter::new(
            bus.clone(),
            Arc::new(StaticSource {
                messages: vec![message("only")],
                delay: Duration::from_millis(1),
            }),
        );
        let mut stream = adapter.ask("hello", AskOptions::default());
        while stream.next().await.is_some() {}
        tokio::time::sleep(Duration::from_millis(20)).await;

        let correlations = correlations.lock().unwrap();
        assert!(correlations.len() >= 3);
        assert!(correlations.iter().all(|c| c == &correlations[0]));
    }

    #[tokio::test]
    async fn upstream_failure_becomes_error_event_and_err_item() {
        let bus = EventBus::new("sess");
        let log = kind_log(&bus);
        let adapter = DirectAdapter::new(bus.clone(), Arc::new(FailingSource));

        let mut stream = adapter.ask("hello", AskOptions::default());
        let first = stream.next().await.unwrap();
        assert!(first.is_err());
        assert!(stream.next().await.is_none());

        let log = log.lock().unwrap();
        let kinds: Vec<EventKind> = log.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![EventKind::Query, EventKind::Error]);
    }

    #[tokio::test]
    async fn dropping_the_stream_cancels_the_producer() {
        let bus = EventBus::new("sess");
        let log = kind_log(&bus);
        let adapter = DirectAdapter::new(
            bus.clone(),
            Arc::new(StaticSource {
                messages: (0..100).map(|i| message(&format!("m{i}"))).collect(),
                delay: Duration::from_millis(5),
            }),
        )
        .with_grace(Duration::from_millis(50));

        let mut stream = adapter.ask("hello", AskOptions::default());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.text, "m0");
        drop(stream);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let count_after = log.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(log.lock().unwrap().len(), count_after, "producer kept publishing");
        assert!(count_after < 100);
    }
}
