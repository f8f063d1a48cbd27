//! Static model price table.
//!
//! Prices are USD per 1K tokens. Lookup is a case-insensitive substring
//! match over the table in order, so `gpt-4o` must stay ahead of `gpt-4`.
//! Models that match nothing are charged the fallback rate and logged as
//! unpriced; costs are best-effort estimates, not billing figures.

use tracing::debug;

/// Price per 1K tokens for one model family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    /// Substring matched against the lowercased model name.
    pub pattern: &'static str,
    pub prompt_per_1k: f64,
    pub output_per_1k: f64,
}

/// Ordered price table. First match wins.
pub const PRICE_TABLE: &[ModelPrice] = &[
    ModelPrice {
        pattern: "gpt-4o",
        prompt_per_1k: 0.005,
        output_per_1k: 0.015,
    },
    ModelPrice {
        pattern: "gpt-4",
        prompt_per_1k: 0.03,
        output_per_1k: 0.06,
    },
    ModelPrice {
        pattern: "gpt-3.5",
        prompt_per_1k: 0.0015,
        output_per_1k: 0.002,
    },
    ModelPrice {
        pattern: "claude",
        prompt_per_1k: 0.008,
        output_per_1k: 0.024,
    },
];

/// Rate for models not in [`PRICE_TABLE`].
pub const FALLBACK_PRICE: ModelPrice = ModelPrice {
    pattern: "",
    prompt_per_1k: 0.001,
    output_per_1k: 0.002,
};

/// Find the table entry for `model`, if any.
pub fn lookup(model: &str) -> Option<&'static ModelPrice> {
    let model = model.to_lowercase();
    PRICE_TABLE.iter().find(|p| model.contains(p.pattern))
}

/// Estimated cost in USD of one call.
pub fn calculate_cost(model: &str, prompt_tokens: u64, output_tokens: u64) -> f64 {
    let price = match lookup(model) {
        Some(price) => price,
        None => {
            debug!(model, "Unpriced model, using fallback rate");
            &FALLBACK_PRICE
        }
    };

    (prompt_tokens as f64 / 1000.0) * price.prompt_per_1k
        + (output_tokens as f64 / 1000.0) * price.output_per_1k
}
