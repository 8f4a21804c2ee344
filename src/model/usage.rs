//! Token accounting for planning calls.

use serde::{Deserialize, Serialize};

/// Tokens spent by one planning call, or summed over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Accumulate `other` into this total.
    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.input_tokens == 0 && self.output_tokens == 0
    }

    /// Price this usage at per-million-token rates.
    pub fn cost(&self, pricing: &Pricing) -> f64 {
        (self.input_tokens as f64 / 1_000_000.0) * pricing.input_per_million
            + (self.output_tokens as f64 / 1_000_000.0) * pricing.output_per_million
    }
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates_every_counter() {
        let mut total = Usage::default();
        assert!(total.is_empty());
        total.merge(&Usage::new(100, 20));
        total.merge(&Usage::new(150, 5));
        assert_eq!(total, Usage::new(250, 25));
        assert_eq!(total.total_tokens, 275);
    }

    #[test]
    fn cost_uses_per_million_rates() {
        let pricing = Pricing {
            input_per_million: 2.5,
            output_per_million: 10.0,
        };
        let cost = Usage::new(1_000_000, 100_000).cost(&pricing);
        assert!((cost - 3.5).abs() < 1e-9);
    }
}
