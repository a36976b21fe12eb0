//! Model pricing and per-class origin cost estimates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
    pub currency: String,
}

impl ModelPricing {
    pub fn new(model: &str, input: f64, output: f64) -> Self {
        Self {
            model: model.into(),
            input_cost_per_1k: input,
            output_cost_per_1k: output,
            currency: "USD".into(),
        }
    }
    pub fn call_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_cost_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_cost_per_1k
    }
    pub fn gpt_4o() -> Self {
        Self::new("gpt-4o", 0.005, 0.015)
    }
    pub fn gpt_4o_mini() -> Self {
        Self::new("gpt-4o-mini", 0.00015, 0.0006)
    }
    pub fn claude_35_sonnet() -> Self {
        Self::new("claude-3-5-sonnet", 0.003, 0.015)
    }
    pub fn claude_3_haiku() -> Self {
        Self::new("claude-3-haiku", 0.00025, 0.00125)
    }
    pub fn for_model(model: &str) -> Option<Self> {
        let m = model.to_lowercase();
        if m.contains("gpt-4o-mini") {
            Some(Self::gpt_4o_mini())
        } else if m.contains("gpt-4o") {
            Some(Self::gpt_4o())
        } else if m.contains("claude-3-5-sonnet") {
            Some(Self::claude_35_sonnet())
        } else if m.contains("claude-3-haiku") {
            Some(Self::claude_3_haiku())
        } else {
            None
        }
    }
}

/// Typical token footprint of one origin call for a request class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallProfile {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

const DEFAULT_PROFILES: &[(&str, u32, u32)] = &[
    ("chat", 800, 300),
    ("recommendation", 900, 500),
    ("meal_plan", 1500, 2500),
    ("workout_plan", 1500, 2000),
    ("nutrition_analysis", 1200, 1000),
    ("progress_analysis", 1200, 800),
];

/// Estimated USD cost of one origin call, per request class.
#[derive(Debug, Clone)]
pub struct CostTable {
    per_class: HashMap<String, f64>,
    default_cost: f64,
}

impl Default for CostTable {
    fn default() -> Self {
        Self::from_pricing(&ModelPricing::gpt_4o())
    }
}

impl CostTable {
    /// Built-in class profiles priced with `pricing`.
    pub fn from_pricing(pricing: &ModelPricing) -> Self {
        let per_class = DEFAULT_PROFILES
            .iter()
            .map(|(class, i, o)| (class.to_string(), pricing.call_cost(*i, *o)))
            .collect();
        Self {
            per_class,
            default_cost: pricing.call_cost(1000, 500),
        }
    }

    pub fn with_class_cost(mut self, class: impl Into<String>, usd: f64) -> Self {
        self.per_class.insert(class.into(), usd.max(0.0));
        self
    }

    pub fn with_profile(
        mut self,
        class: impl Into<String>,
        pricing: &ModelPricing,
        profile: CallProfile,
    ) -> Self {
        self.per_class.insert(
            class.into(),
            pricing.call_cost(profile.input_tokens, profile.output_tokens),
        );
        self
    }

    pub fn with_default_cost(mut self, usd: f64) -> Self {
        self.default_cost = usd.max(0.0);
        self
    }

    pub fn cost_for(&self, request_class: &str) -> f64 {
        self.per_class
            .get(request_class)
            .copied()
            .unwrap_or(self.default_cost)
    }
}
