// Pricing data used by the advisor plugin for savings estimates
//
// Prefix matching rather than exact model ids: wrapped tools report dated
// model strings ("claude-3-5-haiku-20241022") and we only need the family.

/// Per-million-token pricing for a model family
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// Get pricing for a model by family prefix.
/// Returns mid-tier pricing for unknown models.
pub fn get_pricing(model: &str) -> ModelPricing {
    if model.contains("opus") {
        ModelPricing {
            input_per_million: 15.00,
            output_per_million: 75.00,
        }
    } else if model.contains("haiku") {
        ModelPricing {
            input_per_million: 1.00,
            output_per_million: 5.00,
        }
    } else {
        // Sonnet-class default
        ModelPricing {
            input_per_million: 3.00,
            output_per_million: 15.00,
        }
    }
}

/// Calculate cost in USD for the given token usage
pub fn calculate_cost(model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
    let pricing = get_pricing(model);
    (input_tokens as f64 / 1_000_000.0) * pricing.input_per_million
        + (output_tokens as f64 / 1_000_000.0) * pricing.output_per_million
}

/// Estimated saving from routing the same token volume to another model.
/// Negative when the alternative is more expensive.
pub fn estimate_savings(
    current_model: &str,
    alternative_model: &str,
    input_tokens: u32,
    output_tokens: u32,
) -> f64 {
    calculate_cost(current_model, input_tokens, output_tokens)
        - calculate_cost(alternative_model, input_tokens, output_tokens)
}
