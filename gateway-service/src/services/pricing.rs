//! Per-model token prices.

use crate::config::ModelPrice;
use crate::models::TokenUsage;
use std::collections::HashMap;

const PER_MILLION: f64 = 1_000_000.0;

pub trait PricingCatalog: Send + Sync {
    /// Monetary cost of `usage` on `model`. Unknown models cost nothing.
    fn cost(&self, model: &str, usage: &TokenUsage) -> f64;
}

/// Prices loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPricing {
    prices: HashMap<String, ModelPrice>,
}

impl StaticPricing {
    pub fn new(prices: HashMap<String, ModelPrice>) -> Self {
        Self { prices }
    }
}

impl PricingCatalog for StaticPricing {
    fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        self.prices.get(model).map_or(0.0, |price| {
            usage.prompt_tokens as f64 * price.prompt_per_million / PER_MILLION
                + usage.completion_tokens as f64 * price.completion_per_million / PER_MILLION
        })
    }
}
