//! Model pricing registry.
//!
//! Costs are in nanodollars (1e-9 USD) per token.

use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_nanos_per_token: i64,
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// GPT-4: $30.00/1M input, $60.00/1M output
const GPT_4: ModelPricing = ModelPricing::new(30_000, 60_000);
// GPT-4 Turbo: $10.00/1M input, $30.00/1M output
const GPT_4_TURBO: ModelPricing = ModelPricing::new(10_000, 30_000);
// GPT-4o: $2.50/1M input, $10.00/1M output
const GPT_4O: ModelPricing = ModelPricing::new(2_500, 10_000);
// GPT-4o-mini: $0.15/1M input, $0.60/1M output
const GPT_4O_MINI: ModelPricing = ModelPricing::new(150, 600);
// GPT-3.5 Turbo: $0.50/1M input, $1.50/1M output
const GPT_35_TURBO: ModelPricing = ModelPricing::new(500, 1_500);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();
    map.insert("gpt-4", GPT_4);
    map.insert("gpt-4-0613", GPT_4);
    map.insert("gpt-4-turbo", GPT_4_TURBO);
    map.insert("gpt-4o", GPT_4O);
    map.insert("gpt-4o-mini", GPT_4O_MINI);
    map.insert("gpt-3.5-turbo", GPT_35_TURBO);
    map
}

pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let map = PRICING_MAP.get_or_init(init_pricing);
    map.get(model_id).copied()
}

/// Calculate chat cost; unknown models are priced like GPT-4.
pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    get_pricing(model)
        .unwrap_or(GPT_4)
        .calculate_cost(input_tokens, output_tokens)
}
