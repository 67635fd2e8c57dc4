//! Registry pipeline integration tests: refresh from a fixture catalog,
//! route against the unified table, probe health, and verify the fail list
//! gates routing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use council::consensus::ConsensusStrategy;
use council::health::HealthManager;
use council::provider::{
    ChatGateway, ChatMessage, Completion, CompletionParams, DeltaStream, ProviderError,
    ProviderResult, Usage,
};
use council::registry::{
    remerge_from_snapshots, CatalogSource, ModelRegistry, RawBaseModel, RawEndpoint,
};
use council::router::ModelRouter;
use council::state::{Board, SessionStore, Skill};

// ── Fixtures ───────────────────────────────────────────────────────

struct FixtureCatalog;

#[async_trait]
impl CatalogSource for FixtureCatalog {
    async fn fetch_base_models(&self) -> ProviderResult<Vec<RawBaseModel>> {
        Ok(vec![
            RawBaseModel::from_payload(serde_json::json!({
                "id": "openai/gpt-4o",
                "name": "GPT-4o",
                "description": "Multimodal flagship",
                "context_length": 32000,
                "architecture": {"input_modalities": ["text", "image"]},
                "pricing": {"prompt": "0.000005", "completion": "0.000015"}
            })),
            RawBaseModel::from_payload(serde_json::json!({
                "id": "acme/scribe",
                "name": "Scribe",
                "context_length": 8000,
                "pricing": {"prompt": "0", "completion": "0"}
            })),
        ])
    }

    async fn fetch_endpoints(&self, base_model_id: &str) -> ProviderResult<Vec<RawEndpoint>> {
        let payloads = match base_model_id {
            "openai/gpt-4o" => vec![
                serde_json::json!({
                    "provider_name": "DeepInfra",
                    "context_length": 8192,
                    "pricing": {"prompt": "0.000001", "completion": "0.000002"},
                    "supported_parameters": ["tools", "reasoning"]
                }),
                serde_json::json!({
                    "provider_name": "Azure",
                    "context_length": 16384,
                    "pricing": {"prompt": "0.000004", "completion": "0.000008"},
                    "supported_parameters": ["tools"]
                }),
            ],
            _ => Vec::new(),
        };
        Ok(payloads
            .into_iter()
            .map(|p| RawEndpoint::from_payload(base_model_id, p))
            .collect())
    }
}

/// Gateway where one host answers probes and another refuses.
struct FlakyGateway;

#[async_trait]
impl ChatGateway for FlakyGateway {
    async fn complete(
        &self,
        model_id: &str,
        _messages: &[ChatMessage],
        _params: &CompletionParams,
        _timeout: Duration,
    ) -> ProviderResult<Completion> {
        if model_id.starts_with("acme/") {
            return Err(ProviderError::Status {
                status: 503,
                body: "maintenance".to_string(),
            });
        }
        Ok(Completion {
            content: "ready".to_string(),
            reasoning: None,
            finish_reason: Some("stop".to_string()),
            usage: Usage::default(),
        })
    }

    async fn complete_stream(
        &self,
        _model_id: &str,
        _messages: &[ChatMessage],
        _params: &CompletionParams,
        _timeout: Duration,
    ) -> ProviderResult<DeltaStream> {
        Err(ProviderError::Malformed("not scripted".to_string()))
    }
}

fn board_over(members: &[&str]) -> Board {
    Board {
        id: "b1".to_string(),
        name: "pipeline".to_string(),
        description: None,
        council_members: members.iter().map(|m| m.to_string()).collect(),
        chairman: members[0].to_string(),
        substitutes: HashMap::new(),
        personalities: HashMap::new(),
        consensus_strategy: ConsensusStrategy::BordaCount,
        response_timeout_s: 10,
        usage_count: 0,
        last_used_at: None,
        created_at: chrono::Utc::now(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_refresh_route_probe_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(dir.path().join("db")).unwrap().shared();
    let registry = ModelRegistry::new(store.clone()).shared();

    // Refresh: two base models, three unified rows (one routed fallback).
    let report = registry.refresh(&FixtureCatalog).await.unwrap();
    assert_eq!(report.base_models, 2);
    assert_eq!(report.unified_rows, 3);

    // Routing a reasoning task lands on the only reasoning-capable host.
    let router = ModelRouter::new(store.clone());
    let board = board_over(&["openai/gpt-4o"]);
    let resolution = router
        .resolve("openai/gpt-4o", &[Skill::Reasoning], &board)
        .unwrap();
    assert_eq!(resolution.unified_id, "openai/gpt-4o:deepinfra");
    assert_eq!(resolution.wire_id, "openai/gpt-4o");

    // Probe both base models: the acme host is down, so the fresh active
    // fail list names it and routing to it now dead-ends.
    let health = HealthManager::new(Arc::new(FlakyGateway), registry.clone());
    let probe = health
        .probe_all(&["openai/gpt-4o:deepinfra".to_string(), "acme/scribe:openrouter".to_string()])
        .await
        .unwrap();
    assert_eq!(probe.failed_count, 1);

    let active = store.active_fail_list().unwrap().unwrap();
    assert_eq!(active.failed_model_ids, vec!["acme/scribe:openrouter".to_string()]);

    let board = board_over(&["acme/scribe"]);
    let err = router.resolve("acme/scribe", &[], &board).unwrap_err();
    assert_eq!(err.kind(), "no_capable_model");

    // The healthy host's live probe landed on its unified row.
    let model = registry.get("openai/gpt-4o:deepinfra").unwrap().unwrap();
    assert!(model.latency_live_ms.is_some());
}

#[tokio::test]
async fn test_provenance_snapshots_reproduce_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(dir.path().join("db")).unwrap().shared();
    let registry = ModelRegistry::new(store.clone()).shared();
    registry.refresh(&FixtureCatalog).await.unwrap();

    for row in store.list_unified_models().unwrap() {
        let again = remerge_from_snapshots(
            &row.raw_base_model_snapshot,
            &row.raw_endpoint_snapshot,
            row.created_at,
        );
        assert_eq!(again.unified_id, row.unified_id);
        assert_eq!(again.capabilities, row.capabilities);
        assert_eq!(again.cost, row.cost);
        assert_eq!(again.technical, row.technical);
        assert_eq!(again.hosting_provider_id, row.hosting_provider_id);
        assert_eq!(again.print_name_part1, row.print_name_part1);
        assert_eq!(again.print_name_part2, row.print_name_part2);
    }
}

#[tokio::test]
async fn test_raw_old_generation_supports_diffing() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(dir.path().join("db")).unwrap().shared();
    let registry = ModelRegistry::new(store.clone()).shared();

    registry.refresh(&FixtureCatalog).await.unwrap();
    assert!(store.raw_base_models_old().unwrap().is_empty());

    registry.refresh(&FixtureCatalog).await.unwrap();
    let old = store.raw_base_models_old().unwrap();
    let current = store.raw_base_models().unwrap();
    assert_eq!(old.len(), current.len());

    let old_ids: Vec<&str> = old.iter().map(|m| m.id.as_str()).collect();
    let current_ids: Vec<&str> = current.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(old_ids, current_ids);
}
