//! Token pricing for generations.
//!
//! The same function prices the estimate shown before submission and the
//! charge taken at submission; the two must never disagree.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Caller;

/// Per-image rate for models missing from the table.
pub const DEFAULT_MODEL_RATE: i64 = 5;

/// Per-model token rates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Tokens per image, keyed by provider model identifier.
    pub model_rates: HashMap<String, i64>,

    /// Tokens per image for unlisted models.
    pub default_rate: i64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let model_rates = [
            ("sd_xl_base_1.0.safetensors", 5),
            ("dreamshaper_8_93211.safetensors", 4),
            ("realisticVisionV51_v51VAE_94301.safetensors", 4),
            ("juggernautXL_v9Rdphoto2Lightning_285361.safetensors", 6),
            ("animagineXLV31_v31_325600.safetensors", 6),
        ]
        .into_iter()
        .map(|(model, rate)| (model.to_string(), rate))
        .collect();

        Self {
            model_rates,
            default_rate: DEFAULT_MODEL_RATE,
        }
    }
}

impl PricingConfig {
    /// Per-image rate for `model`.
    #[must_use]
    pub fn rate_for(&self, model: &str) -> i64 {
        self.model_rates
            .get(model)
            .copied()
            .unwrap_or(self.default_rate)
    }

    /// Token cost of generating `image_count` images with `model`.
    ///
    /// A single image is free; batches pay the model rate for every image.
    #[must_use]
    pub fn token_cost(&self, model: &str, image_count: u32) -> i64 {
        if image_count <= 1 {
            return 0;
        }
        self.rate_for(model) * i64::from(image_count)
    }
}

/// Tokens `caller` would be charged. Admins are never charged.
#[must_use]
pub fn quote_cost(caller: &Caller, model: &str, image_count: u32, pricing: &PricingConfig) -> i64 {
    if caller.is_admin {
        0
    } else {
        pricing.token_cost(model, image_count)
    }
}
