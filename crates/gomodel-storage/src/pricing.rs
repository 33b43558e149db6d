use std::collections::HashMap;

use crate::entry::UsageEntry;

/// Per-million-token rates for one (model, provider) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    rates: HashMap<(String, String), Pricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model: impl Into<String>, provider: impl Into<String>, pricing: Pricing) {
        self.rates.insert((model.into(), provider.into()), pricing);
    }

    pub fn lookup(&self, model: &str, provider: &str) -> Option<Pricing> {
        self.rates
            .get(&(model.to_string(), provider.to_string()))
            .copied()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// `tokens × rate ÷ 1,000,000` per direction plus the summed total.
    /// Unknown (model, provider) pairs leave the cost fields unset.
    pub fn apply(&self, entry: &mut UsageEntry) {
        let Some(pricing) = self.lookup(&entry.model, &entry.provider) else {
            return;
        };
        let input = entry.input_tokens as f64 * pricing.input_per_million / 1_000_000.0;
        let output = entry.output_tokens as f64 * pricing.output_per_million / 1_000_000.0;
        entry.input_cost = Some(input);
        entry.output_cost = Some(output);
        entry.total_cost = Some(input + output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_math() {
        let mut table = PricingTable::new();
        table.insert(
            "gpt-4",
            "openai",
            Pricing {
                input_per_million: 30.0,
                output_per_million: 60.0,
            },
        );

        let mut entry = UsageEntry::new("rid", "resp", "gpt-4", "openai", "chat")
            .with_tokens(1_000_000, 500_000, 1_500_000);
        table.apply(&mut entry);

        assert_eq!(entry.input_cost, Some(30.0));
        assert_eq!(entry.output_cost, Some(30.0));
        assert_eq!(entry.total_cost, Some(60.0));
    }

    #[test]
    fn unknown_pair_leaves_costs_unset() {
        let table = PricingTable::new();
        let mut entry =
            UsageEntry::new("rid", "resp", "gpt-4", "openai", "chat").with_tokens(10, 8, 18);
        table.apply(&mut entry);
        assert!(entry.input_cost.is_none());
        assert!(entry.total_cost.is_none());
    }
}
