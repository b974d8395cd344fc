//! Shared pricing lookup for the per-provider cost tables

use llmtap_core::{CostEstimate, TokenUsage};

/// Pricing entries: (model prefix, input USD per million tokens, output USD
/// per million tokens).
pub(crate) type PricingTable = &'static [(&'static str, f64, f64)];

/// Find pricing for a model: exact match first, then the longest matching
/// prefix (so `gpt-4o-mini` wins over `gpt-4o` wins over `gpt-4`).
pub(crate) fn lookup(table: PricingTable, model: &str) -> Option<(f64, f64)> {
    if let Some((_, input, output)) = table.iter().find(|(key, _, _)| *key == model) {
        return Some((*input, *output));
    }
    table
        .iter()
        .filter(|(key, _, _)| model.starts_with(key))
        .max_by_key(|(key, _, _)| key.len())
        .map(|(_, input, output)| (*input, *output))
}

/// Build a cost estimate from a pricing table. Unknown models yield a
/// zero-cost estimate carrying an explanatory note rather than nothing.
pub(crate) fn estimate_from_table(
    table: PricingTable,
    model: &str,
    usage: &TokenUsage,
) -> CostEstimate {
    let Some((input_per_million, output_per_million)) = lookup(table, model) else {
        return CostEstimate {
            model: Some(model.to_string()),
            note: Some("Unknown model, no pricing available".to_string()),
            ..Default::default()
        };
    };

    let input_cost = usage.input_tokens.unwrap_or(0) as f64 / 1_000_000.0 * input_per_million;
    let output_cost = usage.output_tokens.unwrap_or(0) as f64 / 1_000_000.0 * output_per_million;

    CostEstimate {
        input_cost,
        output_cost,
        total_cost: input_cost + output_cost,
        model: Some(model.to_string()),
        note: None,
    }
}
