//! Usage, cost and activity reporting.
//!
//! Every model call produces an [`ActivityEvent::Started`], an
//! [`ActivityEvent::Finished`] and, on success, a [`UsageRecord`]. Delivery to
//! the [`UsageSink`] happens on a spawned task: the call never waits for it and
//! sink errors are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::CallContext;
use crate::types::Usage;

// ─────────────────────────────────────────────────────────────────────────────
// Pricing
// ─────────────────────────────────────────────────────────────────────────────

/// Per-model token rates in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Cost of the given usage, rounded to 6 decimal places.
    pub fn cost(&self, usage: &Usage) -> f64 {
        let raw = usage.input_tokens as f64 / 1e6 * self.input_per_million
            + usage.output_tokens as f64 / 1e6 * self.output_per_million;
        (raw * 1e6).round() / 1e6
    }
}

/// Model name → pricing lookup.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a model's rates.
    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(model.into(), pricing);
        self
    }

    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    /// Estimated cost, or `None` if the model has no pricing.
    pub fn estimate_cost(&self, model: &str, usage: &Usage) -> Option<f64> {
        self.get(model).map(|p| p.cost(usage))
    }
}

impl FromIterator<(String, ModelPricing)> for PricingTable {
    fn from_iter<I: IntoIterator<Item = (String, ModelPricing)>>(iter: I) -> Self {
        Self {
            models: iter.into_iter().collect(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// Token usage and cost of one completed model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    /// RFC 3339 completion time.
    pub timestamp: String,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_role: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Absent when the model is not in the pricing table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    pub latency_ms: u64,
    pub streaming: bool,
    pub fallback_used: bool,
}

/// Inputs to [`UsageRecord::build`] that vary per call.
#[derive(Debug, Clone)]
pub(crate) struct CallOutcome<'a> {
    pub provider: &'a str,
    pub model: &'a str,
    pub usage: Usage,
    pub latency_ms: u64,
    pub streaming: bool,
    pub fallback_used: bool,
}

impl UsageRecord {
    pub(crate) fn build(outcome: CallOutcome<'_>, ctx: &CallContext, pricing: &PricingTable) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            provider: outcome.provider.to_string(),
            model: outcome.model.to_string(),
            conversation_id: ctx.conversation_id.clone(),
            agent_role: ctx.agent_role.clone(),
            input_tokens: outcome.usage.input_tokens,
            output_tokens: outcome.usage.output_tokens,
            cost_usd: pricing.estimate_cost(outcome.model, &outcome.usage),
            latency_ms: outcome.latency_ms,
            streaming: outcome.streaming,
            fallback_used: outcome.fallback_used,
        }
    }
}

/// Start/end notification for a model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEvent {
    Started {
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_role: Option<String>,
        streaming: bool,
    },
    Finished {
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_role: Option<String>,
        success: bool,
        latency_ms: u64,
    },
}

impl ActivityEvent {
    pub(crate) fn started(model: &str, ctx: &CallContext, streaming: bool) -> Self {
        Self::Started {
            model: model.to_string(),
            conversation_id: ctx.conversation_id.clone(),
            agent_role: ctx.agent_role.clone(),
            streaming,
        }
    }

    pub(crate) fn finished(model: &str, ctx: &CallContext, success: bool, latency_ms: u64) -> Self {
        Self::Finished {
            model: model.to_string(),
            conversation_id: ctx.conversation_id.clone(),
            agent_role: ctx.agent_role.clone(),
            success,
            latency_ms,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sinks
// ─────────────────────────────────────────────────────────────────────────────

/// Error type for sinks. Always swallowed by the reporter.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Destination for usage records and activity notifications.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record_usage(&self, record: UsageRecord) -> Result<(), SinkError>;

    async fn record_activity(&self, event: ActivityEvent) -> Result<(), SinkError>;
}

/// Writes records as structured tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record_usage(&self, record: UsageRecord) -> Result<(), SinkError> {
        tracing::info!(
            target: "hearth_llm::usage",
            provider = %record.provider,
            model = %record.model,
            conversation_id = record.conversation_id.as_deref().unwrap_or(""),
            agent_role = record.agent_role.as_deref().unwrap_or(""),
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            cost_usd = record.cost_usd,
            latency_ms = record.latency_ms,
            streaming = record.streaming,
            fallback_used = record.fallback_used,
            "LLM usage"
        );
        Ok(())
    }

    async fn record_activity(&self, event: ActivityEvent) -> Result<(), SinkError> {
        match event {
            ActivityEvent::Started { model, streaming, .. } => {
                tracing::debug!(target: "hearth_llm::usage", %model, streaming, "LLM call started");
            }
            ActivityEvent::Finished {
                model,
                success,
                latency_ms,
                ..
            } => {
                tracing::debug!(
                    target: "hearth_llm::usage",
                    %model,
                    success,
                    latency_ms,
                    "LLM call finished"
                );
            }
        }
        Ok(())
    }
}

/// Collects records in memory. Useful for tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    usage: parking_lot::Mutex<Vec<UsageRecord>>,
    activity: parking_lot::Mutex<Vec<ActivityEvent>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usage(&self) -> Vec<UsageRecord> {
        self.usage.lock().clone()
    }

    pub fn activity(&self) -> Vec<ActivityEvent> {
        self.activity.lock().clone()
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn record_usage(&self, record: UsageRecord) -> Result<(), SinkError> {
        self.usage.lock().push(record);
        Ok(())
    }

    async fn record_activity(&self, event: ActivityEvent) -> Result<(), SinkError> {
        self.activity.lock().push(event);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reporter
// ─────────────────────────────────────────────────────────────────────────────

/// Fire-and-forget delivery to a sink.
#[derive(Clone)]
pub(crate) struct UsageReporter {
    sink: Arc<dyn UsageSink>,
}

impl UsageReporter {
    pub fn new(sink: Arc<dyn UsageSink>) -> Self {
        Self { sink }
    }

    pub fn activity(&self, event: ActivityEvent) {
        let sink = Arc::clone(&self.sink);
        spawn_detached(async move {
            if let Err(e) = sink.record_activity(event).await {
                tracing::debug!(error = %e, "Dropping activity notification");
            }
        });
    }

    pub fn usage(&self, record: UsageRecord) {
        let sink = Arc::clone(&self.sink);
        spawn_detached(async move {
            if let Err(e) = sink.record_usage(record).await {
                tracing::debug!(error = %e, "Dropping usage record");
            }
        });
    }
}

/// Spawn on the current runtime, or drop the work if there is none.
fn spawn_detached<F>(fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
        }
        Err(_) => tracing::debug!("No runtime for usage reporting"),
    }
}
