// Built-in plugin handlers
//
// A manifest's `main` field names one of these. The host still drives
// discovery, ordering, and lifecycle from the on-disk manifests; only the
// handler code itself is compiled in.

use super::host::{PluginFactory, PluginRegistry};
use super::{EventPlugin, PluginContext};
use crate::events::{
    Complexity, Confidence, Event, EventKind, OptimizationNote, QueryRecord, ResponseRecord,
    StoreRecord,
};
use crate::pricing;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub const QUERY_COLLECTOR: &str = "query-collector";
pub const MODEL_ADVISOR: &str = "model-advisor";

/// All handlers a manifest may bind.
pub fn registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.insert(
        QUERY_COLLECTOR.to_string(),
        Arc::new(|| Box::new(QueryCollector) as Box<dyn EventPlugin>) as PluginFactory,
    );
    registry.insert(
        MODEL_ADVISOR.to_string(),
        Arc::new(|| Box::new(ModelAdvisor) as Box<dyn EventPlugin>) as PluginFactory,
    );
    registry
}

/// Persists query/response/error observations through the batch writer.
/// This is the path by which observed traffic reaches the store.
pub struct QueryCollector;

#[async_trait]
impl EventPlugin for QueryCollector {
    async fn on_event(&self, event: &Event, ctx: &PluginContext) -> anyhow::Result<()> {
        let record = match event.kind {
            EventKind::Query => QueryRecord::from_event(event).map(StoreRecord::Query),
            EventKind::Response | EventKind::Error => {
                ResponseRecord::from_event(event).map(StoreRecord::Response)
            }
            EventKind::ToolUse => None,
        };
        if let Some(record) = record {
            ctx.records
                .add(record)
                .map_err(|e| anyhow::anyhow!("record sink refused: {e}"))?;
        }
        Ok(())
    }
}

/// Flags queries that look cheap enough for a smaller model and records an
/// optimization note with the estimated saving.
pub struct ModelAdvisor;

impl ModelAdvisor {
    fn classify(text: &str) -> Complexity {
        let heavy = ["implement", "refactor", "architect", "debug", "design"]
            .iter()
            .any(|kw| text.to_lowercase().contains(kw));
        if heavy || text.len() > 1_000 {
            Complexity::High
        } else if text.len() > 200 {
            Complexity::Medium
        } else {
            Complexity::Low
        }
    }
}

#[async_trait]
impl EventPlugin for ModelAdvisor {
    async fn on_event(&self, event: &Event, ctx: &PluginContext) -> anyhow::Result<()> {
        if event.kind != EventKind::Query {
            return Ok(());
        }
        let Some(query) = QueryRecord::from_event(event) else {
            return Ok(());
        };

        let complexity = Self::classify(&query.text);
        {
            let mut shared = ctx.shared_state.lock().unwrap();
            shared.insert(
                format!("advisor.complexity.{}", query.id),
                Value::from(complexity.as_str()),
            );
        }

        if complexity != Complexity::Low || !query.model.contains("opus") {
            return Ok(());
        }

        let alternative = ctx
            .config
            .get("alternativeModel")
            .and_then(Value::as_str)
            .unwrap_or("claude-3-5-haiku-20241022")
            .to_string();
        // Rough token estimate when the record doesn't carry one
        let input_tokens = query
            .token_count
            .unwrap_or_else(|| (query.text.len() / 4).max(1) as u32);
        let savings =
            pricing::estimate_savings(&query.model, &alternative, input_tokens, input_tokens * 2);

        let note = OptimizationNote {
            query_id: query.id.clone(),
            suggestion: format!(
                "query {} looks low-complexity; consider routing to {alternative}",
                query.id
            ),
            alternative_model: Some(alternative),
            estimated_savings: Some(savings),
            confidence: if query.token_count.is_some() {
                Confidence::Medium
            } else {
                Confidence::Low
            },
        };
        ctx.records
            .add(StoreRecord::Optimization(note))
            .map_err(|e| anyhow::anyhow!("record sink refused: {e}"))?;
        Ok(())
    }
}
