//! Endpoint-first merge
//!
//! For every (base model, hosting endpoint) pair, produce one unified row.
//! Endpoint data overrides base-model data wherever both speak; the two raw
//! payloads are kept verbatim so the merge can be re-run from the row alone.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::{
    Capabilities, CostInfo, RawBaseModel, RawEndpoint, TechnicalInfo, UnifiedModel,
    ACCESS_PROVIDER_ID,
};

const TOKENS_PER_MILLION: f64 = 1_000_000.0;

/// Normalize a hosting provider name: casefold and strip punctuation.
///
/// `"Deep Infra"` and `"deep-infra"` both become `"deep_infra"`.
pub fn normalize_provider_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut last_was_sep = true;

    for c in name.to_lowercase().chars() {
        if c.is_alphanumeric() {
            normalized.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            normalized.push('_');
            last_was_sep = true;
        }
    }

    while normalized.ends_with('_') {
        normalized.pop();
    }

    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

/// Two-letter uppercase provider tag for display names.
fn provider_short(name: &str) -> String {
    name.chars().take(2).collect::<String>().to_uppercase()
}

/// Merge one endpoint against its base model.
///
/// Idempotent: the output depends only on the two inputs (and the supplied
/// timestamps), so re-merging a row's snapshots reproduces the row.
pub fn merge_endpoint_first(
    base: &RawBaseModel,
    endpoint: &RawEndpoint,
    now: DateTime<Utc>,
) -> UnifiedModel {
    // Capabilities: endpoint supported_parameters win outright when present.
    let params: &[String] = if endpoint.supported_parameters.is_empty() {
        &base.supported_parameters
    } else {
        &endpoint.supported_parameters
    };
    let has = |name: &str| params.iter().any(|p| p == name);

    let reasoning = has("reasoning") || has("include_reasoning");
    let description_lower = base.description.to_lowercase();
    let thinking = reasoning
        || description_lower.contains("thinking")
        || description_lower.contains("chain-of-thought")
        || description_lower.contains("reasoning");

    let capabilities = Capabilities {
        tools: has("tools") || has("tool_choice") || has("function_calling"),
        json_mode: has("response_format") || has("structured_outputs"),
        reasoning,
        thinking,
        vision: base.input_modalities.iter().any(|m| m == "image")
            || endpoint.pricing_image.map(|p| p > 0.0).unwrap_or(false),
    };

    // Cost: endpoint pricing is authoritative; base pricing is the rare
    // fallback. Inbound units are USD per token, stored per million.
    let (base_in, base_out) = base.pricing();
    let has_endpoint_pricing = endpoint.pricing_in.is_some() || endpoint.pricing_out.is_some();
    let (price_in, price_out) = if has_endpoint_pricing {
        (
            endpoint.pricing_in.unwrap_or(0.0),
            endpoint.pricing_out.unwrap_or(0.0),
        )
    } else {
        (base_in.unwrap_or(0.0), base_out.unwrap_or(0.0))
    };

    let cost = CostInfo {
        cost_1m_input_usd: price_in * TOKENS_PER_MILLION,
        cost_1m_output_usd: price_out * TOKENS_PER_MILLION,
        is_free: (price_in == 0.0 && price_out == 0.0) || base.id.ends_with(":free"),
    };

    let technical = TechnicalInfo {
        context_tokens: endpoint
            .context_tokens
            .or(base.default_context_tokens)
            .unwrap_or(0),
        max_output_tokens: endpoint.max_output_tokens,
        quantization: endpoint.quantization.clone(),
    };

    // Identity.
    let (developer_id, base_model_name) = match base.id.split_once('/') {
        Some((developer, name)) => (developer.to_string(), name.to_string()),
        None => ("unknown".to_string(), base.id.clone()),
    };
    let variant_name = base_model_name
        .split_once(':')
        .map(|(_, variant)| variant.to_string());

    let hosting_provider_id = normalize_provider_name(&endpoint.provider_short_name);
    let unified_id = format!("{}:{}", base.id, hosting_provider_id);

    // Display names.
    let print_name_part1 = format!("{}:{}", developer_id, base_model_name);
    let mut flags = String::new();
    if capabilities.reasoning {
        flags.push('R');
    }
    if capabilities.vision {
        flags.push('V');
    }
    if capabilities.tools {
        flags.push('T');
    }
    if capabilities.json_mode {
        flags.push('J');
    }
    let price_display = if cost.is_free {
        "[FREE]".to_string()
    } else {
        format!("[${:.2}/mT]", cost.cost_1m_input_usd)
    };
    let print_name_part2 = format!(
        "{} {} {} {}",
        provider_short(&endpoint.provider_short_name),
        endpoint.quantization.as_deref().unwrap_or("unknown"),
        flags,
        price_display
    );

    UnifiedModel {
        unified_id,
        developer_id,
        base_model_id: base.id.clone(),
        base_model_name,
        variant_name,
        print_name_part1,
        print_name_part2,
        access_provider_id: ACCESS_PROVIDER_ID.to_string(),
        hosting_provider_id,
        capabilities,
        cost,
        technical,
        latency_ms: None,
        last_latency_check: None,
        latency_live_ms: None,
        latency_live_at: None,
        raw_base_model_snapshot: base.raw_payload.clone(),
        raw_endpoint_snapshot: endpoint.raw_payload.clone(),
        created_at: now,
        updated_at: now,
    }
}

/// Re-run the merge from a unified row's own provenance snapshots.
///
/// Used by the origin-trace consumer and the idempotence checks: all
/// non-latency fields of the result equal the stored row.
pub fn remerge_from_snapshots(
    base_snapshot: &Value,
    endpoint_snapshot: &Value,
    now: DateTime<Utc>,
) -> UnifiedModel {
    let base = RawBaseModel::from_payload(base_snapshot.clone());
    let endpoint = RawEndpoint::from_payload(&base.id, endpoint_snapshot.clone());
    merge_endpoint_first(&base, &endpoint, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_fixture() -> RawBaseModel {
        RawBaseModel::from_payload(json!({
            "id": "openai/gpt-4o",
            "name": "GPT-4o",
            "description": "Multimodal flagship",
            "context_length": 32000,
            "architecture": {
                "modality": "text+image->text",
                "input_modalities": ["text", "image"]
            },
            "pricing": {"prompt": "0.000005", "completion": "0.000015"},
            "supported_parameters": ["tools"]
        }))
    }

    fn endpoint_fixture() -> RawEndpoint {
        RawEndpoint::from_payload(
            "openai/gpt-4o",
            json!({
                "provider_name": "Deep Infra",
                "context_length": 8192,
                "max_completion_tokens": 4096,
                "quantization": "fp8",
                "pricing": {"prompt": "0.000001", "completion": "0.000002"},
                "supported_parameters": ["tools", "response_format", "reasoning"]
            }),
        )
    }

    #[test]
    fn test_normalize_provider_name() {
        assert_eq!(normalize_provider_name("Deep Infra"), "deep_infra");
        assert_eq!(normalize_provider_name("deep-infra"), "deep_infra");
        assert_eq!(normalize_provider_name("Together.AI"), "together_ai");
        assert_eq!(normalize_provider_name(""), "unknown");
        assert_eq!(normalize_provider_name("!!!"), "unknown");
    }

    #[test]
    fn test_endpoint_context_wins() {
        let unified = merge_endpoint_first(&base_fixture(), &endpoint_fixture(), Utc::now());
        assert_eq!(unified.technical.context_tokens, 8192);
    }

    #[test]
    fn test_base_context_when_endpoint_silent() {
        let endpoint = RawEndpoint::from_payload(
            "openai/gpt-4o",
            json!({"provider_name": "Deep Infra", "pricing": {"prompt": "0.000001"}}),
        );
        let unified = merge_endpoint_first(&base_fixture(), &endpoint, Utc::now());
        assert_eq!(unified.technical.context_tokens, 32000);
    }

    #[test]
    fn test_endpoint_pricing_authoritative() {
        let unified = merge_endpoint_first(&base_fixture(), &endpoint_fixture(), Utc::now());
        assert!((unified.cost.cost_1m_input_usd - 1.0).abs() < 1e-9);
        assert!((unified.cost.cost_1m_output_usd - 2.0).abs() < 1e-9);
        assert!(!unified.cost.is_free);
    }

    #[test]
    fn test_base_pricing_fallback() {
        let endpoint = RawEndpoint::from_payload(
            "openai/gpt-4o",
            json!({"provider_name": "Deep Infra", "context_length": 8192}),
        );
        let unified = merge_endpoint_first(&base_fixture(), &endpoint, Utc::now());
        assert!((unified.cost.cost_1m_input_usd - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_capabilities_from_endpoint_params() {
        let unified = merge_endpoint_first(&base_fixture(), &endpoint_fixture(), Utc::now());
        assert!(unified.capabilities.tools);
        assert!(unified.capabilities.json_mode);
        assert!(unified.capabilities.reasoning);
        assert!(unified.capabilities.vision); // image input modality
    }

    #[test]
    fn test_capabilities_fall_back_to_base_params() {
        let endpoint = RawEndpoint::from_payload(
            "openai/gpt-4o",
            json!({"provider_name": "Deep Infra"}),
        );
        let unified = merge_endpoint_first(&base_fixture(), &endpoint, Utc::now());
        // Base lists only "tools".
        assert!(unified.capabilities.tools);
        assert!(!unified.capabilities.json_mode);
    }

    #[test]
    fn test_vision_via_image_pricing() {
        let base = RawBaseModel::from_payload(json!({
            "id": "acme/text-only",
            "architecture": {"input_modalities": ["text"]}
        }));
        let endpoint = RawEndpoint::from_payload(
            "acme/text-only",
            json!({"provider_name": "Acme", "pricing": {"prompt": "0.000001", "image": "0.001"}}),
        );
        let unified = merge_endpoint_first(&base, &endpoint, Utc::now());
        assert!(unified.capabilities.vision);
    }

    #[test]
    fn test_free_variant_detection() {
        let base = RawBaseModel::from_payload(json!({
            "id": "z-ai/glm-4.5-air:free",
            "pricing": {"prompt": "0", "completion": "0"}
        }));
        let endpoint = RawEndpoint::routed_fallback(&base);
        let unified = merge_endpoint_first(&base, &endpoint, Utc::now());

        assert!(unified.cost.is_free);
        assert_eq!(unified.variant_name.as_deref(), Some("free"));
        assert_eq!(unified.base_model_name, "glm-4.5-air:free");
        assert!(unified.print_name_part2.contains("[FREE]"));
    }

    #[test]
    fn test_identity_and_print_names() {
        let unified = merge_endpoint_first(&base_fixture(), &endpoint_fixture(), Utc::now());
        assert_eq!(unified.unified_id, "openai/gpt-4o:deep_infra");
        assert_eq!(unified.developer_id, "openai");
        assert_eq!(unified.base_model_name, "gpt-4o");
        assert_eq!(unified.hosting_provider_id, "deep_infra");
        assert_eq!(unified.print_name_part1, "openai:gpt-4o");
        assert!(unified.print_name_part2.starts_with("DE fp8"));
        assert!(unified.print_name_part2.contains("RVTJ"));
    }

    #[test]
    fn test_remerge_reproduces_row() {
        let now = Utc::now();
        let unified = merge_endpoint_first(&base_fixture(), &endpoint_fixture(), now);
        let again = remerge_from_snapshots(
            &unified.raw_base_model_snapshot,
            &unified.raw_endpoint_snapshot,
            now,
        );

        assert_eq!(again.unified_id, unified.unified_id);
        assert_eq!(again.capabilities, unified.capabilities);
        assert_eq!(again.cost, unified.cost);
        assert_eq!(again.technical, unified.technical);
        assert_eq!(again.print_name_part1, unified.print_name_part1);
        assert_eq!(again.print_name_part2, unified.print_name_part2);
    }

    #[test]
    fn test_remerge_without_endpoint_restores_base_context() {
        // Endpoint reports 8192; removing it (routed fallback) restores the
        // base model's 32000.
        let base = base_fixture();
        let with_endpoint = merge_endpoint_first(&base, &endpoint_fixture(), Utc::now());
        assert_eq!(with_endpoint.technical.context_tokens, 8192);

        let without = merge_endpoint_first(&base, &RawEndpoint::routed_fallback(&base), Utc::now());
        assert_eq!(without.technical.context_tokens, 32000);
    }
}
