//! Model pricing table
//!
//! USD per 1k tokens for each token class. Cache reads are priced
//! separately from fresh input; cache creation carries a premium.

/// (model prefix, input, output, cache create, cache read), per 1k tokens.
/// Longest matching prefix wins.
const MODEL_PRICES: &[(&str, f64, f64, f64, f64)] = &[
    ("claude-opus-4", 0.015, 0.075, 0.01875, 0.0015),
    ("claude-sonnet-4", 0.003, 0.015, 0.00375, 0.0003),
    ("claude-haiku-4", 0.001, 0.005, 0.00125, 0.0001),
    ("claude-3-5-haiku", 0.0008, 0.004, 0.001, 0.00008),
    ("gemini-2.5-pro", 0.00125, 0.01, 0.0, 0.00031),
    ("gemini-2.5-flash-lite", 0.0001, 0.0004, 0.0, 0.000025),
    ("gemini-2.5-flash", 0.0003, 0.0025, 0.0, 0.000075),
    ("gpt-5-codex", 0.00125, 0.01, 0.0, 0.000125),
    ("gpt-5-mini", 0.00025, 0.002, 0.0, 0.000025),
    ("gpt-5", 0.00125, 0.01, 0.0, 0.000125),
    ("gpt-4o", 0.0025, 0.01, 0.0, 0.00125),
];

/// Fallback for unknown models: conservative mid-tier pricing.
const DEFAULT_PRICE: (f64, f64, f64, f64) = (0.003, 0.015, 0.00375, 0.0003);

/// Per-1k prices for a model: (input, output, cache create, cache read).
pub fn prices_for(model: &str) -> (f64, f64, f64, f64) {
    let mut best: Option<(&str, f64, f64, f64, f64)> = None;
    for entry in MODEL_PRICES {
        if model.starts_with(entry.0) {
            match best {
                Some(current) if current.0.len() >= entry.0.len() => {}
                _ => best = Some(*entry),
            }
        }
    }
    match best {
        Some((_, input, output, cache_create, cache_read)) => {
            (input, output, cache_create, cache_read)
        }
        None => DEFAULT_PRICE,
    }
}

/// Known model ids, for the static models listing.
pub fn known_models() -> Vec<&'static str> {
    MODEL_PRICES.iter().map(|entry| entry.0).collect()
}

pub fn cost_usd(
    model: &str,
    input_tokens: i64,
    output_tokens: i64,
    cache_create_tokens: i64,
    cache_read_tokens: i64,
) -> f64 {
    let (input, output, cache_create, cache_read) = prices_for(model);
    (input_tokens as f64 / 1000.0) * input
        + (output_tokens as f64 / 1000.0) * output
        + (cache_create_tokens as f64 / 1000.0) * cache_create
        + (cache_read_tokens as f64 / 1000.0) * cache_read
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        assert_eq!(prices_for("gemini-2.5-flash-lite-001").0, 0.0001);
        assert_eq!(prices_for("gemini-2.5-flash-002").0, 0.0003);
        assert_eq!(prices_for("gpt-5-codex").1, 0.01);
    }

    #[test]
    fn unknown_model_uses_default() {
        assert_eq!(prices_for("totally-unknown"), DEFAULT_PRICE);
    }

    #[test]
    fn cache_reads_priced_distinctly() {
        let fresh = cost_usd("claude-sonnet-4-20250514", 1000, 0, 0, 0);
        let cached = cost_usd("claude-sonnet-4-20250514", 0, 0, 0, 1000);
        assert!(cached < fresh);
    }

    #[test]
    fn calc_cost() {
        let cost = cost_usd("claude-sonnet-4-20250514", 1000, 2000, 0, 0);
        assert!((cost - (0.003 + 2.0 * 0.015)).abs() < 1e-9);
    }
}
