//! Capability flags and the negotiation step that reconciles requested
//! options with what a provider can actually do.
//!
//! Negotiation never fails. Unsupported options are dropped (or degraded to
//! text by the normalizer), each drop is logged and returned so callers and
//! tests can see exactly what changed.

use tracing::warn;

use crate::types::ChatOptions;

/// What a provider/model combination supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub vision: bool,
    pub documents: bool,
    pub thinking: bool,
    pub prefill: bool,
    pub prompt_caching: bool,
    pub structured_output: bool,
    pub strict_tools: bool,
    pub effort: bool,
    pub system_role: bool,
    pub streaming: bool,
    pub tool_streaming: bool,
    /// Provider rate-limits aggressively; retry backoff starts higher.
    pub aggressive_rate_limits: bool,
}

impl Default for Capabilities {
    /// Baseline for an OpenAI-compatible endpoint: text, tools, streaming.
    fn default() -> Self {
        Self {
            vision: false,
            documents: false,
            thinking: false,
            prefill: false,
            prompt_caching: false,
            structured_output: false,
            strict_tools: false,
            effort: false,
            system_role: true,
            streaming: true,
            tool_streaming: true,
            aggressive_rate_limits: false,
        }
    }
}

/// An option removed during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DroppedOption {
    Thinking,
    ThinkingBudget,
    Prefill,
    PromptCache,
    StructuredOutput,
    StrictTools,
    Effort,
    /// Temperature is mutually exclusive with thinking.
    TemperatureWithThinking,
}

impl DroppedOption {
    fn as_str(&self) -> &'static str {
        match self {
            DroppedOption::Thinking => "thinking",
            DroppedOption::ThinkingBudget => "thinking_budget",
            DroppedOption::Prefill => "prefill",
            DroppedOption::PromptCache => "prompt_cache",
            DroppedOption::StructuredOutput => "structured_output",
            DroppedOption::StrictTools => "strict_tools",
            DroppedOption::Effort => "effort",
            DroppedOption::TemperatureWithThinking => "temperature",
        }
    }
}

/// Reconcile requested options with provider capabilities.
///
/// Returns the effective options an adapter may serialize without checking
/// flags again, plus the list of everything that was dropped. Vision and
/// document degradation is content rewriting, so it happens in the
/// normalizer, not here.
pub fn negotiate(options: &ChatOptions, caps: &Capabilities) -> (ChatOptions, Vec<DroppedOption>) {
    let mut effective = options.clone();
    let mut dropped = Vec::new();

    if options.thinking && !caps.thinking {
        effective.thinking = false;
        effective.thinking_budget = None;
        dropped.push(DroppedOption::Thinking);
        if options.thinking_budget.is_some() {
            dropped.push(DroppedOption::ThinkingBudget);
        }
    }

    // Providers reject temperature alongside extended thinking.
    if effective.thinking && effective.temperature.is_some() {
        effective.temperature = None;
        dropped.push(DroppedOption::TemperatureWithThinking);
    }

    if options.prefill.is_some() && !caps.prefill {
        effective.prefill = None;
        dropped.push(DroppedOption::Prefill);
    }

    if options.enable_cache && !caps.prompt_caching {
        effective.enable_cache = false;
        dropped.push(DroppedOption::PromptCache);
    }

    if options.output_format.is_some() && !caps.structured_output {
        effective.output_format = None;
        dropped.push(DroppedOption::StructuredOutput);
    }

    if options.strict_tools && !caps.strict_tools {
        effective.strict_tools = false;
        dropped.push(DroppedOption::StrictTools);
    }

    if options.effort.is_some() && !caps.effort {
        effective.effort = None;
        dropped.push(DroppedOption::Effort);
    }

    for d in &dropped {
        warn!(option = d.as_str(), "option not supported by provider, dropping");
    }

    (effective, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Effort;
    use serde_json::json;

    fn full_caps() -> Capabilities {
        Capabilities {
            vision: true,
            documents: true,
            thinking: true,
            prefill: true,
            prompt_caching: true,
            structured_output: true,
            strict_tools: true,
            effort: true,
            system_role: true,
            streaming: true,
            tool_streaming: true,
            aggressive_rate_limits: false,
        }
    }

    #[test]
    fn test_nothing_dropped_when_supported() {
        let opts = ChatOptions {
            thinking: true,
            thinking_budget: Some(2048),
            prefill: Some("{".into()),
            enable_cache: true,
            output_format: Some(json!({"type": "object"})),
            strict_tools: true,
            effort: Some(Effort::High),
            ..Default::default()
        };
        let (effective, dropped) = negotiate(&opts, &full_caps());
        assert!(dropped.is_empty());
        assert!(effective.thinking);
        assert_eq!(effective.prefill.as_deref(), Some("{"));
    }

    #[test]
    fn test_thinking_dropped_with_budget() {
        let opts = ChatOptions {
            thinking: true,
            thinking_budget: Some(4096),
            ..Default::default()
        };
        let (effective, dropped) = negotiate(&opts, &Capabilities::default());
        assert!(!effective.thinking);
        assert_eq!(effective.thinking_budget, None);
        assert_eq!(
            dropped,
            vec![DroppedOption::Thinking, DroppedOption::ThinkingBudget]
        );
    }

    #[test]
    fn test_temperature_excluded_by_thinking() {
        let opts = ChatOptions {
            thinking: true,
            temperature: Some(0.7),
            ..Default::default()
        };
        let (effective, dropped) = negotiate(&opts, &full_caps());
        assert!(effective.thinking);
        assert_eq!(effective.temperature, None);
        assert_eq!(dropped, vec![DroppedOption::TemperatureWithThinking]);
    }

    #[test]
    fn test_temperature_kept_when_thinking_dropped() {
        let opts = ChatOptions {
            thinking: true,
            temperature: Some(0.7),
            ..Default::default()
        };
        let (effective, dropped) = negotiate(&opts, &Capabilities::default());
        assert!(!effective.thinking);
        assert_eq!(effective.temperature, Some(0.7));
        assert_eq!(dropped, vec![DroppedOption::Thinking]);
    }

    #[test]
    fn test_multiple_drops_listed() {
        let opts = ChatOptions {
            prefill: Some("Sure".into()),
            enable_cache: true,
            strict_tools: true,
            output_format: Some(json!({})),
            effort: Some(Effort::Low),
            ..Default::default()
        };
        let (effective, dropped) = negotiate(&opts, &Capabilities::default());
        assert_eq!(effective.prefill, None);
        assert!(!effective.enable_cache);
        assert!(!effective.strict_tools);
        assert_eq!(effective.output_format, None);
        assert_eq!(effective.effort, None);
        assert_eq!(dropped.len(), 5);
        assert!(dropped.contains(&DroppedOption::Prefill));
        assert!(dropped.contains(&DroppedOption::PromptCache));
        assert!(dropped.contains(&DroppedOption::StrictTools));
        assert!(dropped.contains(&DroppedOption::StructuredOutput));
        assert!(dropped.contains(&DroppedOption::Effort));
    }
}
