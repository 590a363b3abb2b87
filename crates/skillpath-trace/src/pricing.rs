/// Token pricing for the models the pipeline calls. Used to estimate a
/// stage's cost when the usage descriptor does not carry one from the
/// provider.
#[derive(Clone, Debug)]
pub struct ModelPricing {
    pub name: &'static str,
    pub provider: &'static str,
    pub input_cost_per_mtok: f64,
    pub output_cost_per_mtok: f64,
}

impl ModelPricing {
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input = input_tokens as f64 / 1_000_000.0 * self.input_cost_per_mtok;
        let output = output_tokens as f64 / 1_000_000.0 * self.output_cost_per_mtok;
        input + output
    }
}

pub static GPT_4O: ModelPricing = ModelPricing {
    name: "gpt-4o",
    provider: "openai",
    input_cost_per_mtok: 2.50,
    output_cost_per_mtok: 10.0,
};

pub static GPT_4O_MINI: ModelPricing = ModelPricing {
    name: "gpt-4o-mini",
    provider: "openai",
    input_cost_per_mtok: 0.15,
    output_cost_per_mtok: 0.60,
};

pub static CLAUDE_SONNET_4_5: ModelPricing = ModelPricing {
    name: "claude-sonnet-4-5-20250929",
    provider: "anthropic",
    input_cost_per_mtok: 3.0,
    output_cost_per_mtok: 15.0,
};

pub static CLAUDE_HAIKU_4_5: ModelPricing = ModelPricing {
    name: "claude-haiku-4-5-20251001",
    provider: "anthropic",
    input_cost_per_mtok: 0.80,
    output_cost_per_mtok: 4.0,
};

static ALL_MODELS: &[&ModelPricing] = &[
    &GPT_4O,
    &GPT_4O_MINI,
    &CLAUDE_SONNET_4_5,
    &CLAUDE_HAIKU_4_5,
];

pub fn find_pricing(name: &str) -> Option<&'static ModelPricing> {
    ALL_MODELS.iter().find(|m| m.name == name).copied()
}

/// Fallback pricing for models not in the table, so estimates stay non-zero
/// rather than silently free.
pub fn fallback_pricing() -> &'static ModelPricing {
    &GPT_4O_MINI
}

/// Estimated cost for one invocation of `model`.
pub fn estimate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    find_pricing(model)
        .unwrap_or_else(fallback_pricing)
        .calculate_cost(input_tokens, output_tokens)
}
