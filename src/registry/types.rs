//! Raw and unified model records
//!
//! Raw records mirror provider truth verbatim; every derived field of a
//! [`UnifiedModel`] is reproducible from the two raw payload snapshots it
//! carries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Access provider identity for everything fetched through the gateway.
pub const ACCESS_PROVIDER_ID: &str = "openrouter";

/// One base model row from the catalog endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBaseModel {
    pub id: String,
    pub human_name: String,
    pub description: String,
    pub modality: String,
    pub input_modalities: Vec<String>,
    pub default_context_tokens: Option<u64>,
    pub supported_parameters: Vec<String>,
    /// Verbatim catalog payload.
    pub raw_payload: Value,
}

impl RawBaseModel {
    /// Parse a catalog entry. Missing fields default; the payload is kept
    /// verbatim.
    pub fn from_payload(payload: Value) -> Self {
        let id = str_field(&payload, "id").unwrap_or_default();
        let human_name = str_field(&payload, "name").unwrap_or_else(|| id.clone());
        let description = str_field(&payload, "description").unwrap_or_default();

        let architecture = payload.get("architecture");
        let modality = architecture
            .and_then(|a| a.get("modality"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let input_modalities = architecture
            .and_then(|a| a.get("input_modalities"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let default_context_tokens = payload.get("context_length").and_then(Value::as_u64);
        let supported_parameters = payload
            .get("supported_parameters")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id,
            human_name,
            description,
            modality,
            input_modalities,
            default_context_tokens,
            supported_parameters,
            raw_payload: payload,
        }
    }

    /// Prompt/completion pricing from the base payload, USD per token.
    pub fn pricing(&self) -> (Option<f64>, Option<f64>) {
        let pricing = self.raw_payload.get("pricing");
        (
            pricing.and_then(|p| price_field(p.get("prompt"))),
            pricing.and_then(|p| price_field(p.get("completion"))),
        )
    }
}

/// One hosting endpoint row for a base model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEndpoint {
    pub base_model_id: String,
    pub provider_short_name: String,
    /// USD per token.
    pub pricing_in: Option<f64>,
    /// USD per token.
    pub pricing_out: Option<f64>,
    /// USD per image, when the endpoint prices image input.
    pub pricing_image: Option<f64>,
    pub context_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub quantization: Option<String>,
    pub supported_parameters: Vec<String>,
    /// Verbatim endpoint payload.
    pub raw_payload: Value,
}

impl RawEndpoint {
    /// Parse an endpoint entry for the given base model.
    pub fn from_payload(base_model_id: &str, payload: Value) -> Self {
        let provider_short_name = str_field(&payload, "provider_name")
            .unwrap_or_else(|| "OpenRouter".to_string());

        let pricing = payload.get("pricing");
        let pricing_in = pricing.and_then(|p| price_field(p.get("prompt")));
        let pricing_out = pricing.and_then(|p| price_field(p.get("completion")));
        let pricing_image = pricing.and_then(|p| price_field(p.get("image")));

        let context_tokens = payload.get("context_length").and_then(Value::as_u64);
        let max_output_tokens = payload
            .get("max_completion_tokens")
            .and_then(Value::as_u64);
        let quantization = str_field(&payload, "quantization");
        let supported_parameters = payload
            .get("supported_parameters")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            base_model_id: base_model_id.to_string(),
            provider_short_name,
            pricing_in,
            pricing_out,
            pricing_image,
            context_tokens,
            max_output_tokens,
            quantization,
            supported_parameters,
            raw_payload: payload,
        }
    }

    /// Synthetic routed endpoint for a base model that exposes none.
    ///
    /// Mirrors the base model's pricing and context so the merge still
    /// produces one unified row per catalog model.
    pub fn routed_fallback(base: &RawBaseModel) -> Self {
        let payload = serde_json::json!({
            "provider_name": "OpenRouter",
            "pricing": base.raw_payload.get("pricing").cloned().unwrap_or(Value::Null),
            "context_length": base.default_context_tokens,
        });
        Self::from_payload(&base.id, payload)
    }
}

/// All endpoints fetched for one base model, stored as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEndpointSet {
    pub base_model_id: String,
    pub endpoints: Vec<RawEndpoint>,
    pub fetched_at: DateTime<Utc>,
}

impl RawEndpointSet {
    pub fn endpoints_count(&self) -> usize {
        self.endpoints.len()
    }
}

/// Boolean capability flags of a unified model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub tools: bool,
    pub vision: bool,
    pub reasoning: bool,
    pub thinking: bool,
    pub json_mode: bool,
}

/// Cost of a unified model, normalized to USD per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostInfo {
    pub cost_1m_input_usd: f64,
    pub cost_1m_output_usd: f64,
    pub is_free: bool,
}

/// Technical limits of a unified model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnicalInfo {
    pub context_tokens: u64,
    pub max_output_tokens: Option<u64>,
    pub quantization: Option<String>,
}

/// One merged (base model, hosting endpoint) pair: the routable unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedModel {
    /// `base_model_id ":" normalized_provider_name`.
    pub unified_id: String,
    pub developer_id: String,
    pub base_model_id: String,
    pub base_model_name: String,
    pub variant_name: Option<String>,
    pub print_name_part1: String,
    pub print_name_part2: String,
    pub access_provider_id: String,
    pub hosting_provider_id: String,
    pub capabilities: Capabilities,
    pub cost: CostInfo,
    pub technical: TechnicalInfo,
    /// Rolling average over completed council runs, EWMA α ≈ 0.3.
    pub latency_ms: Option<f64>,
    pub last_latency_check: Option<DateTime<Utc>>,
    /// Latest single on-demand probe, overwritten on each probe.
    pub latency_live_ms: Option<f64>,
    pub latency_live_at: Option<DateTime<Utc>>,
    /// Verbatim base-model payload this row was merged from.
    pub raw_base_model_snapshot: Value,
    /// Verbatim endpoint payload this row was merged from.
    pub raw_endpoint_snapshot: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UnifiedModel {
    /// The model id sent to the chat gateway.
    pub fn routable_id(&self) -> &str {
        &self.base_model_id
    }

    /// Uniqueness key across the unified table.
    pub fn identity_key(&self) -> (String, String, String, String, Option<String>) {
        (
            self.developer_id.clone(),
            self.access_provider_id.clone(),
            self.hosting_provider_id.clone(),
            self.base_model_id.clone(),
            self.variant_name.clone(),
        )
    }

    /// Stable query ordering key.
    pub fn sort_key(&self) -> (String, String, Option<String>, String) {
        (
            self.developer_id.clone(),
            self.base_model_name.clone(),
            self.variant_name.clone(),
            self.hosting_provider_id.clone(),
        )
    }

    /// Human-facing display name.
    pub fn print_name(&self) -> String {
        format!("{} - {}", self.print_name_part1, self.print_name_part2)
    }
}

fn str_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Parse a pricing field that may be a number or a numeric string.
///
/// A present-but-zero price is meaningful (free tier), so `Some(0.0)` is
/// distinct from `None`.
pub(crate) fn price_field(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
