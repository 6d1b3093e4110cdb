//! Wiring from configuration to a running orchestrator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};

use hearth_agent::{
    AgentConfig, ConversationOrchestrator, DispatchTimeouts, MutationGate, ToolRegistry,
};
use hearth_config::{ConfigError, HearthConfig, ProviderConfig, resolve_api_key_with};
use hearth_llm::openai::DEFAULT_OPENAI_BASE;
use hearth_llm::{
    BreakerConfig, BreakerRegistry, ModelPricing, OpenAiBackend, OpenAiConfig, PricingTable,
    ResilientInvoker, RetryPolicy, SharedBackend, TracingUsageSink,
};

/// Build the invoker for the configured providers.
///
/// `lookup` resolves environment variables for API keys.
pub fn build_invoker(
    config: &HearthConfig,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<ResilientInvoker> {
    let primary = build_backend(config.primary()?, lookup).context("primary provider")?;

    let r = &config.resilience;
    let breakers = BreakerRegistry::new(BreakerConfig::new(
        r.breaker_threshold,
        Duration::from_secs(r.breaker_cooldown_secs),
    ));
    let retry = RetryPolicy::new(
        r.max_retries,
        r.backoff_ms.iter().copied().map(Duration::from_millis).collect(),
    );

    let mut invoker = ResilientInvoker::new(primary)
        .with_breakers(Arc::new(breakers))
        .with_retry_policy(retry)
        .with_pricing(pricing_table(config))
        .with_usage_sink(Arc::new(TracingUsageSink));

    if let Some(ref fallback) = config.llm.fallback {
        let backend = build_backend(fallback, lookup).context("fallback provider")?;
        invoker = invoker.with_fallback(backend);
    }

    Ok(invoker)
}

/// Build an OpenAI-compatible backend for one provider entry.
///
/// A key is required unless the provider authenticates by header.
pub fn build_backend(
    provider: &ProviderConfig,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<SharedBackend> {
    let base_url = provider
        .base_url
        .clone()
        .unwrap_or_else(|| DEFAULT_OPENAI_BASE.to_string());
    let mut config = OpenAiConfig::compatible(&provider.provider, base_url);

    match resolve_api_key_with(provider, lookup) {
        Some(secret) => {
            tracing::debug!(provider = %provider.provider, source = %secret.source, "Resolved API key");
            config = config.with_api_key(secret.value);
        }
        None if provider.headers.is_empty() => {
            return Err(ConfigError::ApiKeyNotFound {
                provider: provider.provider.clone(),
                env_var: provider.effective_api_key_env(),
            }
            .into());
        }
        None => {}
    }

    if let Some(ref model) = provider.model {
        config = config.with_model(model);
    }
    if let Some(secs) = provider.timeout_secs {
        config = config.with_timeout(Duration::from_secs(secs));
    }
    for (name, value) in &provider.headers {
        config = config.with_header(name, value);
    }

    Ok(Arc::new(OpenAiBackend::new(config)?))
}

/// Pricing entries from the `[pricing]` table.
pub fn pricing_table(config: &HearthConfig) -> PricingTable {
    config
        .pricing
        .iter()
        .map(|(model, p)| {
            (
                model.clone(),
                ModelPricing::new(p.input_per_million, p.output_per_million),
            )
        })
        .collect()
}

/// Orchestrator settings from the `[agent]` table.
pub fn agent_config(config: &HearthConfig) -> AgentConfig {
    let section = &config.agent;
    let model = config
        .llm
        .primary
        .as_ref()
        .and_then(|p| p.model.clone())
        .unwrap_or_else(|| section.model.clone());

    let mut agent = AgentConfig::new(model)
        .with_max_tokens(section.max_tokens)
        .with_max_tool_iterations(section.max_tool_iterations);
    if let Some(ref prompt) = section.system_prompt {
        agent = agent.with_system_prompt(prompt);
    }
    if let Some(t) = section.temperature {
        agent = agent.with_temperature(t);
    }
    if let Some(ref markers) = section.reasoning_markers {
        agent = agent.with_reasoning_markers(markers.clone());
    }
    agent
}

/// Assemble the orchestrator around an invoker and registry.
pub fn build_orchestrator(
    config: &HearthConfig,
    invoker: ResilientInvoker,
    registry: ToolRegistry,
) -> ConversationOrchestrator {
    let section = &config.agent;
    let gate = match section.read_only_tools {
        Some(ref names) => MutationGate::new(names.iter().cloned()),
        None => MutationGate::default(),
    };
    let timeouts = DispatchTimeouts::new(
        Duration::from_secs(section.tool_timeout_secs),
        Duration::from_secs(section.delegate_timeout_secs),
    );

    ConversationOrchestrator::new(Arc::new(invoker), Arc::new(registry), agent_config(config))
        .with_gate(gate)
        .with_timeouts(timeouts)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
