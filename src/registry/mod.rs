//! Unified Model Registry
//!
//! Owns the dual-fetch refresh (catalog + per-model endpoints), the
//! endpoint-first merge into unified rows, and the latency bookkeeping.
//! Raw tables are swapped atomically on refresh; a refresh holds the
//! registry write lock so readers see the old generation until the swap
//! lands.

pub mod fetch;
pub mod merge;
pub mod types;

pub use fetch::{CatalogSource, OpenRouterCatalog};
pub use merge::{merge_endpoint_first, normalize_provider_name, remerge_from_snapshots};
pub use types::{
    Capabilities, CostInfo, RawBaseModel, RawEndpoint, RawEndpointSet, TechnicalInfo,
    UnifiedModel, ACCESS_PROVIDER_ID,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::state::{SharedSessionStore, StoreError};
use crate::provider::ProviderError;

/// Concurrent endpoint fetches during a refresh.
const ENDPOINT_FETCH_CONCURRENCY: usize = 8;

/// Smoothing factor for the rolling run-latency average.
const LATENCY_EWMA_ALPHA: f64 = 0.3;

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Shared reference to ModelRegistry
pub type SharedModelRegistry = Arc<ModelRegistry>;

/// Outcome of a refresh or reprocess pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshReport {
    pub base_models: usize,
    pub endpoint_sets: usize,
    pub unified_rows: usize,
    pub skipped_duplicates: usize,
    pub failed_endpoint_fetches: usize,
}

/// One row of the grouped base-model listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseModelSummary {
    pub base_model_id: String,
    pub base_model_name: String,
    pub developer_id: String,
    pub print_name_part1: String,
    pub variants_count: usize,
    pub free_available: bool,
}

/// Aggregate statistics over the unified table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub total_models: usize,
    pub total_base_models: usize,
    pub providers: Vec<String>,
    pub provider_counts: HashMap<String, usize>,
    pub free_models: usize,
    pub capability_counts: HashMap<String, usize>,
    pub average_latency_ms: Option<f64>,
}

/// The Unified Model Registry.
pub struct ModelRegistry {
    store: SharedSessionStore,
    refresh_lock: RwLock<()>,
}

impl ModelRegistry {
    pub fn new(store: SharedSessionStore) -> Self {
        Self {
            store,
            refresh_lock: RwLock::new(()),
        }
    }

    pub fn shared(self) -> SharedModelRegistry {
        Arc::new(self)
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Full dual-fetch refresh: pull the catalog and every model's
    /// endpoints, swap the raw tables, then re-merge the unified table.
    pub async fn refresh(&self, catalog: &dyn CatalogSource) -> RegistryResult<RefreshReport> {
        let _guard = self.refresh_lock.write().await;

        let base_models = catalog.fetch_base_models().await?;
        info!(count = base_models.len(), "fetched base models");

        let mut failed_endpoint_fetches = 0usize;
        let fetches = futures::stream::iter(base_models.iter().map(|base| {
            let id = base.id.clone();
            async move {
                let endpoints = catalog.fetch_endpoints(&id).await;
                (id, endpoints)
            }
        }))
        .buffer_unordered(ENDPOINT_FETCH_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

        let mut endpoints_by_model: HashMap<String, Vec<RawEndpoint>> = HashMap::new();
        for (id, result) in fetches {
            match result {
                Ok(endpoints) => {
                    endpoints_by_model.insert(id, endpoints);
                }
                Err(e) => {
                    warn!(model = %id, error = %e, "endpoint fetch failed");
                    failed_endpoint_fetches += 1;
                    endpoints_by_model.insert(id, Vec::new());
                }
            }
        }

        let now = Utc::now();
        let endpoint_sets: Vec<RawEndpointSet> = base_models
            .iter()
            .map(|base| RawEndpointSet {
                base_model_id: base.id.clone(),
                endpoints: endpoints_by_model.remove(&base.id).unwrap_or_default(),
                fetched_at: now,
            })
            .collect();

        // Atomic swap: current generation moves to _old inside one batch.
        self.store.replace_raw_base_models(&base_models)?;
        self.store.replace_raw_endpoint_sets(&endpoint_sets)?;

        let mut report = self.merge_raw_tables()?;
        report.failed_endpoint_fetches = failed_endpoint_fetches;
        Ok(report)
    }

    /// Re-merge the unified table from the raw tables already on disk.
    /// Running this twice against unchanged raw tables is a no-op apart
    /// from `updated_at`.
    pub fn reprocess(&self) -> RegistryResult<RefreshReport> {
        self.merge_raw_tables()
    }

    fn merge_raw_tables(&self) -> RegistryResult<RefreshReport> {
        let base_models = self.store.raw_base_models()?;
        let endpoint_sets = self.store.raw_endpoint_sets()?;

        let by_id: HashMap<&str, &RawBaseModel> =
            base_models.iter().map(|b| (b.id.as_str(), b)).collect();

        let now = Utc::now();
        let mut seen: HashSet<String> = HashSet::new();
        let mut unified_rows = 0usize;
        let mut skipped_duplicates = 0usize;

        for set in &endpoint_sets {
            let Some(base) = by_id.get(set.base_model_id.as_str()) else {
                warn!(model = %set.base_model_id, "no base model for endpoint set, skipping");
                continue;
            };

            // A model with no endpoints still gets one routed row.
            let routed;
            let endpoints: &[RawEndpoint] = if set.endpoints.is_empty() {
                routed = [RawEndpoint::routed_fallback(base)];
                &routed
            } else {
                &set.endpoints
            };

            for endpoint in endpoints {
                let row = merge_endpoint_first(base, endpoint, now);
                if !seen.insert(row.unified_id.clone()) {
                    skipped_duplicates += 1;
                    continue;
                }
                self.store.upsert_unified_model(&row)?;
                unified_rows += 1;
            }
        }

        info!(unified_rows, skipped_duplicates, "unified table merged");

        Ok(RefreshReport {
            base_models: base_models.len(),
            endpoint_sets: endpoint_sets.len(),
            unified_rows,
            skipped_duplicates,
            failed_endpoint_fetches: 0,
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Grouped base models, stable-ordered by (developer, name).
    pub fn list_base_models(
        &self,
        filter: Option<&str>,
        limit: Option<usize>,
    ) -> RegistryResult<Vec<BaseModelSummary>> {
        let models = self.store.list_unified_models()?;

        let mut grouped: Vec<BaseModelSummary> = Vec::new();
        for model in models {
            if let Some(existing) = grouped
                .iter_mut()
                .find(|g| g.base_model_id == model.base_model_id)
            {
                existing.variants_count += 1;
                existing.free_available |= model.cost.is_free;
            } else {
                grouped.push(BaseModelSummary {
                    base_model_id: model.base_model_id.clone(),
                    base_model_name: model.base_model_name.clone(),
                    developer_id: model.developer_id.clone(),
                    print_name_part1: model.print_name_part1.clone(),
                    variants_count: 1,
                    free_available: model.cost.is_free,
                });
            }
        }

        if let Some(filter) = filter {
            let needle = filter.to_lowercase();
            grouped.retain(|g| {
                g.base_model_id.to_lowercase().contains(&needle)
                    || g.base_model_name.to_lowercase().contains(&needle)
                    || g.developer_id.to_lowercase().contains(&needle)
            });
        }

        grouped.sort_by(|a, b| {
            a.developer_id
                .cmp(&b.developer_id)
                .then_with(|| a.base_model_name.cmp(&b.base_model_name))
        });

        if let Some(limit) = limit {
            grouped.truncate(limit);
        }
        Ok(grouped)
    }

    /// All variants of a base model, stable-ordered.
    pub fn list_variants(&self, base_model_id: &str) -> RegistryResult<Vec<UnifiedModel>> {
        Ok(self.store.list_unified_variants(base_model_id)?)
    }

    /// One unified row by id.
    pub fn get(&self, unified_id: &str) -> RegistryResult<Option<UnifiedModel>> {
        Ok(self.store.get_unified_model(unified_id)?)
    }

    /// Weighted substring search over display and identity fields, free
    /// models boosted.
    pub fn search(&self, query: &str, limit: usize) -> RegistryResult<Vec<UnifiedModel>> {
        let models = self.store.list_unified_models()?;
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Ok(models.into_iter().take(limit).collect());
        }

        let mut scored: Vec<(f64, UnifiedModel)> = models
            .into_iter()
            .filter_map(|model| {
                let score = search_score(&query, &model);
                (score > 0.0).then_some((score, model))
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, m)| m).collect())
    }

    /// Aggregate statistics over the unified table.
    pub fn statistics(&self) -> RegistryResult<RegistryStatistics> {
        let models = self.store.list_unified_models()?;
        if models.is_empty() {
            return Ok(RegistryStatistics::default());
        }

        let mut provider_counts: HashMap<String, usize> = HashMap::new();
        let mut capability_counts: HashMap<String, usize> = HashMap::new();
        let mut base_ids: HashSet<&str> = HashSet::new();
        let mut free_models = 0usize;
        let mut latencies: Vec<f64> = Vec::new();

        for model in &models {
            *provider_counts
                .entry(model.hosting_provider_id.clone())
                .or_insert(0) += 1;
            base_ids.insert(&model.base_model_id);
            if model.cost.is_free {
                free_models += 1;
            }
            if let Some(latency) = model.latency_ms {
                latencies.push(latency);
            }

            for (name, enabled) in [
                ("tools", model.capabilities.tools),
                ("vision", model.capabilities.vision),
                ("reasoning", model.capabilities.reasoning),
                ("thinking", model.capabilities.thinking),
                ("json_mode", model.capabilities.json_mode),
            ] {
                if enabled {
                    *capability_counts.entry(name.to_string()).or_insert(0) += 1;
                }
            }
        }

        let mut providers: Vec<String> = provider_counts.keys().cloned().collect();
        providers.sort();

        let average_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        Ok(RegistryStatistics {
            total_models: models.len(),
            total_base_models: base_ids.len(),
            providers,
            provider_counts,
            free_models,
            capability_counts,
            average_latency_ms,
        })
    }

    // =========================================================================
    // Latency bookkeeping
    // =========================================================================

    /// Fold one completed-run latency sample into the rolling average.
    pub fn record_run_latency(&self, unified_id: &str, sample_ms: f64) -> RegistryResult<()> {
        self.store.update_unified_latency(unified_id, |model| {
            let updated = match model.latency_ms {
                Some(previous) => {
                    previous * (1.0 - LATENCY_EWMA_ALPHA) + sample_ms * LATENCY_EWMA_ALPHA
                }
                None => sample_ms,
            };
            model.latency_ms = Some(updated);
            model.last_latency_check = Some(Utc::now());
        })?;
        Ok(())
    }

    /// Overwrite the live-probe latency fields.
    pub fn record_live_probe(&self, unified_id: &str, sample_ms: f64) -> RegistryResult<()> {
        self.store.update_unified_latency(unified_id, |model| {
            model.latency_live_ms = Some(sample_ms);
            model.latency_live_at = Some(Utc::now());
        })?;
        Ok(())
    }

    /// Access the backing store (shared with the rest of the system).
    pub fn store(&self) -> &SharedSessionStore {
        &self.store
    }
}

fn search_score(query: &str, model: &UnifiedModel) -> f64 {
    let mut score = 0.0;

    let fields: [(String, f64); 5] = [
        (model.print_name(), 10.0),
        (model.print_name_part1.clone(), 8.0),
        (model.base_model_name.clone(), 6.0),
        (model.developer_id.clone(), 4.0),
        (model.variant_name.clone().unwrap_or_default(), 3.0),
    ];

    for (content, weight) in fields {
        let content = content.to_lowercase();
        if content == query {
            score += weight * 2.0;
        } else if content.starts_with(query) {
            score += weight * 1.5;
        } else if content.contains(query) {
            score += weight;
        }
    }

    for (name, enabled) in [
        ("tools", model.capabilities.tools),
        ("vision", model.capabilities.vision),
        ("reasoning", model.capabilities.reasoning),
        ("thinking", model.capabilities.thinking),
        ("json_mode", model.capabilities.json_mode),
    ] {
        if enabled && name.contains(query) {
            score += 2.0;
        }
    }

    if model.cost.is_free && score > 0.0 {
        score += 1.0;
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionStore;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::tempdir;

    struct FixtureCatalog {
        models: Vec<serde_json::Value>,
        endpoints: HashMap<String, Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl CatalogSource for FixtureCatalog {
        async fn fetch_base_models(&self) -> crate::provider::ProviderResult<Vec<RawBaseModel>> {
            Ok(self
                .models
                .iter()
                .cloned()
                .map(RawBaseModel::from_payload)
                .collect())
        }

        async fn fetch_endpoints(
            &self,
            base_model_id: &str,
        ) -> crate::provider::ProviderResult<Vec<RawEndpoint>> {
            Ok(self
                .endpoints
                .get(base_model_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|p| RawEndpoint::from_payload(base_model_id, p))
                .collect())
        }
    }

    fn fixture_catalog() -> FixtureCatalog {
        let models = vec![
            json!({
                "id": "openai/gpt-4o",
                "name": "GPT-4o",
                "description": "Multimodal flagship",
                "context_length": 32000,
                "architecture": {"input_modalities": ["text", "image"]},
                "pricing": {"prompt": "0.000005", "completion": "0.000015"}
            }),
            json!({
                "id": "z-ai/glm-4.5-air:free",
                "name": "GLM 4.5 Air (free)",
                "context_length": 128000,
                "pricing": {"prompt": "0", "completion": "0"}
            }),
        ];

        let mut endpoints = HashMap::new();
        endpoints.insert(
            "openai/gpt-4o".to_string(),
            vec![
                json!({
                    "provider_name": "DeepInfra",
                    "context_length": 8192,
                    "pricing": {"prompt": "0.000001", "completion": "0.000002"},
                    "supported_parameters": ["tools", "reasoning"]
                }),
                json!({
                    "provider_name": "Azure",
                    "context_length": 16384,
                    "pricing": {"prompt": "0.000004", "completion": "0.000008"},
                    "supported_parameters": ["tools"]
                }),
            ],
        );

        FixtureCatalog { models, endpoints }
    }

    fn test_registry() -> (ModelRegistry, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("test.db")).unwrap().shared();
        (ModelRegistry::new(store), dir)
    }

    #[tokio::test]
    async fn test_refresh_produces_unified_rows() {
        let (registry, _dir) = test_registry();
        let report = registry.refresh(&fixture_catalog()).await.unwrap();

        assert_eq!(report.base_models, 2);
        // gpt-4o has two endpoints; the free model gets one routed fallback.
        assert_eq!(report.unified_rows, 3);

        let variants = registry.list_variants("openai/gpt-4o").unwrap();
        assert_eq!(variants.len(), 2);
        let providers: Vec<&str> = variants
            .iter()
            .map(|v| v.hosting_provider_id.as_str())
            .collect();
        assert!(providers.contains(&"deepinfra"));
        assert!(providers.contains(&"azure"));
    }

    #[tokio::test]
    async fn test_refresh_twice_is_stable() {
        let (registry, _dir) = test_registry();
        let catalog = fixture_catalog();

        registry.refresh(&catalog).await.unwrap();
        let first: Vec<UnifiedModel> = registry.store.list_unified_models().unwrap();

        registry.refresh(&catalog).await.unwrap();
        let second: Vec<UnifiedModel> = registry.store.list_unified_models().unwrap();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.unified_id, b.unified_id);
            assert_eq!(a.capabilities, b.capabilities);
            assert_eq!(a.cost, b.cost);
            assert_eq!(a.technical, b.technical);
            assert_eq!(a.created_at, b.created_at);
            assert_eq!(a.raw_base_model_snapshot, b.raw_base_model_snapshot);
            assert_eq!(a.raw_endpoint_snapshot, b.raw_endpoint_snapshot);
        }
    }

    #[tokio::test]
    async fn test_reprocess_without_refetch_is_stable() {
        let (registry, _dir) = test_registry();
        registry.refresh(&fixture_catalog()).await.unwrap();
        let before: Vec<UnifiedModel> = registry.store.list_unified_models().unwrap();

        let report = registry.reprocess().unwrap();
        assert_eq!(report.unified_rows, before.len());

        let after: Vec<UnifiedModel> = registry.store.list_unified_models().unwrap();
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.unified_id, b.unified_id);
            assert_eq!(a.cost, b.cost);
            assert_eq!(a.technical, b.technical);
            assert_eq!(a.created_at, b.created_at);
        }
    }

    #[tokio::test]
    async fn test_list_base_models_grouped() {
        let (registry, _dir) = test_registry();
        registry.refresh(&fixture_catalog()).await.unwrap();

        let grouped = registry.list_base_models(None, None).unwrap();
        assert_eq!(grouped.len(), 2);

        let gpt = grouped
            .iter()
            .find(|g| g.base_model_id == "openai/gpt-4o")
            .unwrap();
        assert_eq!(gpt.variants_count, 2);
        assert!(!gpt.free_available);

        let glm = grouped
            .iter()
            .find(|g| g.base_model_id == "z-ai/glm-4.5-air:free")
            .unwrap();
        assert!(glm.free_available);
    }

    #[tokio::test]
    async fn test_list_base_models_filter_and_limit() {
        let (registry, _dir) = test_registry();
        registry.refresh(&fixture_catalog()).await.unwrap();

        let filtered = registry.list_base_models(Some("gpt"), None).unwrap();
        assert_eq!(filtered.len(), 1);

        let limited = registry.list_base_models(None, Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_latency_ewma() {
        let (registry, _dir) = test_registry();
        registry.refresh(&fixture_catalog()).await.unwrap();

        let id = "openai/gpt-4o:deepinfra";
        registry.record_run_latency(id, 1000.0).unwrap();
        let model = registry.get(id).unwrap().unwrap();
        assert_eq!(model.latency_ms, Some(1000.0));

        registry.record_run_latency(id, 2000.0).unwrap();
        let model = registry.get(id).unwrap().unwrap();
        // 1000 * 0.7 + 2000 * 0.3 = 1300
        assert!((model.latency_ms.unwrap() - 1300.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_live_probe_overwrites() {
        let (registry, _dir) = test_registry();
        registry.refresh(&fixture_catalog()).await.unwrap();

        let id = "openai/gpt-4o:azure";
        registry.record_live_probe(id, 900.0).unwrap();
        registry.record_live_probe(id, 450.0).unwrap();

        let model = registry.get(id).unwrap().unwrap();
        assert_eq!(model.latency_live_ms, Some(450.0));
        assert!(model.latency_live_at.is_some());
    }

    #[tokio::test]
    async fn test_search_ranks_exact_higher() {
        let (registry, _dir) = test_registry();
        registry.refresh(&fixture_catalog()).await.unwrap();

        let hits = registry.search("gpt-4o", 10).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].base_model_name, "gpt-4o");
    }

    #[tokio::test]
    async fn test_statistics() {
        let (registry, _dir) = test_registry();
        registry.refresh(&fixture_catalog()).await.unwrap();

        let stats = registry.statistics().unwrap();
        assert_eq!(stats.total_models, 3);
        assert_eq!(stats.total_base_models, 2);
        assert_eq!(stats.free_models, 1);
        assert!(stats.capability_counts.get("tools").copied().unwrap_or(0) >= 2);
    }
}
