use std::collections::HashMap;

use thiserror::Error;

/// Version tag of the built-in table; bump whenever a rate changes.
pub const BUILTIN_PRICING_VERSION: &str = "gemini-2024-12";

// (model, input USD per 1M tokens, output USD per 1M tokens)
const BUILTIN_RATES: &[(&str, f64, f64)] = &[
    ("gemini-1.0-pro", 0.50, 1.50),
    ("gemini-1.5-flash", 0.075, 0.30),
    ("gemini-1.5-flash-8b", 0.0375, 0.15),
    ("gemini-1.5-pro", 1.25, 5.00),
    ("gemini-2.0-flash", 0.10, 0.40),
    ("gemini-2.0-flash-lite", 0.075, 0.30),
];

/// Single source of per-model prices, keyed by normalized model name.
#[derive(Clone, Debug, Default)]
pub struct PricingTable {
    version: String,
    models: HashMap<String, ModelPricing>,
}

/// Rates in micro-USD per one million tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_usd_micros_per_mtok: u64,
    pub output_usd_micros_per_mtok: u64,
}

#[derive(Debug, Error)]
pub enum PricingTableError {
    #[error("invalid pricing json: expected object at root")]
    InvalidRoot,
    #[error("invalid pricing entry for model {model}: expected object")]
    InvalidModelEntry { model: String },
    #[error("invalid pricing entry for model {model}: missing both input/output cost")]
    MissingCosts { model: String },
    #[error("invalid pricing entry for model {model}: invalid cost value for {field}")]
    InvalidCostValue { model: String, field: &'static str },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PricingTable {
    pub fn builtin() -> Self {
        let mut models = HashMap::new();
        for (model, input, output) in BUILTIN_RATES {
            models.insert(
                (*model).to_string(),
                ModelPricing {
                    input_usd_micros_per_mtok: usd_to_micros(*input),
                    output_usd_micros_per_mtok: usd_to_micros(*output),
                },
            );
        }
        Self {
            version: BUILTIN_PRICING_VERSION.to_string(),
            models,
        }
    }

    /// Loads a LiteLLM-style price map (`input_cost_per_token` / `output_cost_per_token`
    /// or the `_per_1k_tokens` variants).
    pub fn from_litellm_json_str(version: &str, raw: &str) -> Result<Self, PricingTableError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Self::from_litellm_json_value(version, &value)
    }

    pub fn from_litellm_json_value(
        version: &str,
        value: &serde_json::Value,
    ) -> Result<Self, PricingTableError> {
        let Some(root) = value.as_object() else {
            return Err(PricingTableError::InvalidRoot);
        };

        let mut models = HashMap::new();
        for (model, entry) in root {
            let Some(obj) = entry.as_object() else {
                return Err(PricingTableError::InvalidModelEntry {
                    model: model.clone(),
                });
            };

            let input = per_token_cost(obj, "input_cost_per_token", "input_cost_per_1k_tokens")
                .map(|usd| usd_per_token_to_micros_per_mtok(usd, model, "input_cost"))
                .transpose()?;
            let output = per_token_cost(obj, "output_cost_per_token", "output_cost_per_1k_tokens")
                .map(|usd| usd_per_token_to_micros_per_mtok(usd, model, "output_cost"))
                .transpose()?;

            if input.is_none() && output.is_none() {
                return Err(PricingTableError::MissingCosts {
                    model: model.clone(),
                });
            }

            models.insert(
                normalize_model(model),
                ModelPricing {
                    input_usd_micros_per_mtok: input.unwrap_or(0),
                    output_usd_micros_per_mtok: output.unwrap_or(0),
                },
            );
        }

        Ok(Self {
            version: version.to_string(),
            models,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn model_pricing(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(&normalize_model(model))
    }

    /// Cost of one call in micro-USD, rounded half-up. `None` for unpriced models.
    pub fn compute_cost(
        &self,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Option<u64> {
        let pricing = self.model_pricing(model)?;
        let input = u128::from(prompt_tokens) * u128::from(pricing.input_usd_micros_per_mtok);
        let output =
            u128::from(completion_tokens) * u128::from(pricing.output_usd_micros_per_mtok);
        let micros = (input + output + 500_000) / 1_000_000;
        Some(u64::try_from(micros).unwrap_or(u64::MAX))
    }
}

/// Strips the `models/` resource prefix and surrounding whitespace.
pub fn normalize_model(model: &str) -> String {
    let model = model.trim();
    model.strip_prefix("models/").unwrap_or(model).to_string()
}

/// Converts a caller-reported USD amount to micro-USD, rejecting negative or
/// non-finite values.
pub fn usd_to_usd_micros(usd: f64) -> Option<u64> {
    if !usd.is_finite() || usd < 0.0 {
        return None;
    }
    Some(usd_to_micros(usd))
}

fn usd_to_micros(usd: f64) -> u64 {
    let micros = (usd * 1_000_000.0).round();
    if micros > u64::MAX as f64 {
        u64::MAX
    } else {
        micros as u64
    }
}

fn per_token_cost(
    obj: &serde_json::Map<String, serde_json::Value>,
    per_token_key: &'static str,
    per_1k_key: &'static str,
) -> Option<f64> {
    obj.get(per_token_key)
        .and_then(|value| value.as_f64())
        .or_else(|| {
            obj.get(per_1k_key)
                .and_then(|value| value.as_f64())
                .map(|per_1k| per_1k / 1000.0)
        })
}

fn usd_per_token_to_micros_per_mtok(
    usd_per_token: f64,
    model: &str,
    field: &'static str,
) -> Result<u64, PricingTableError> {
    if !usd_per_token.is_finite() || usd_per_token < 0.0 {
        return Err(PricingTableError::InvalidCostValue {
            model: model.to_string(),
            field,
        });
    }
    Ok(usd_to_micros(usd_per_token * 1_000_000.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_prices_gemini_flash() {
        let table = PricingTable::builtin();
        assert_eq!(table.version(), BUILTIN_PRICING_VERSION);
        let pricing = table.model_pricing("gemini-1.5-flash").expect("pricing");
        assert_eq!(pricing.input_usd_micros_per_mtok, 75_000);
        assert_eq!(pricing.output_usd_micros_per_mtok, 300_000);

        // 100 * 0.075/M + 50 * 0.30/M = 22.5 micro-USD
        assert_eq!(table.compute_cost("gemini-1.5-flash", 100, 50), Some(23));
        assert_eq!(
            table.compute_cost("models/gemini-1.5-flash", 1_000_000, 0),
            Some(75_000)
        );
        assert_eq!(table.compute_cost("unknown-model", 10, 10), None);
    }

    #[test]
    fn parses_litellm_pricing_json() {
        let raw = r#"{
          "gemini-1.5-pro": {"input_cost_per_token": 0.00000125, "output_cost_per_token": 0.000005},
          "legacy": {"input_cost_per_1k_tokens": 1.0}
        }"#;
        let table = PricingTable::from_litellm_json_str("custom-1", raw).expect("pricing");
        assert_eq!(table.version(), "custom-1");
        let pro = table.model_pricing("gemini-1.5-pro").expect("pro");
        assert_eq!(pro.input_usd_micros_per_mtok, 1_250_000);
        assert_eq!(pro.output_usd_micros_per_mtok, 5_000_000);

        let legacy = table.model_pricing("legacy").expect("legacy");
        assert_eq!(legacy.input_usd_micros_per_mtok, 1_000_000_000);
        assert_eq!(legacy.output_usd_micros_per_mtok, 0);
    }

    #[test]
    fn rejects_negative_costs() {
        let raw = r#"{"bad": {"input_cost_per_token": -1.0}}"#;
        let err = PricingTable::from_litellm_json_str("v", raw).unwrap_err();
        assert!(matches!(err, PricingTableError::InvalidCostValue { .. }));
        assert_eq!(usd_to_usd_micros(-0.5), None);
        assert_eq!(usd_to_usd_micros(f64::NAN), None);
        assert_eq!(usd_to_usd_micros(0.0001), Some(100));
    }
}
