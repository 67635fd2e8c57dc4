//! Health probing and fail-list management
//!
//! Batch latency probes with bounded concurrency classify each model as ok
//! or failed. Every probe batch produces a fresh fail list that becomes the
//! single active list; the router reads it on every resolution.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::provider::ChatGateway;
use crate::registry::SharedModelRegistry;
use crate::state::{FailList, StoreError};

/// Default number of concurrent probes.
const DEFAULT_PROBE_CONCURRENCY: usize = 8;

/// Error type for health operations
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),
}

/// Result type for health operations
pub type HealthResult<T> = Result<T, HealthError>;

/// Outcome of probing one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub model_id: String,
    pub ok: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Outcome of a probe batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    /// Per-model results in input order.
    pub results: Vec<ProbeResult>,
    /// The fail list created from this batch (now active).
    pub fail_list_id: String,
    pub failed_count: usize,
}

/// Health manager: probes availability and maintains fail lists.
pub struct HealthManager {
    gateway: Arc<dyn ChatGateway>,
    registry: SharedModelRegistry,
    concurrency: usize,
}

impl HealthManager {
    pub fn new(gateway: Arc<dyn ChatGateway>, registry: SharedModelRegistry) -> Self {
        Self {
            gateway,
            registry,
            concurrency: DEFAULT_PROBE_CONCURRENCY,
        }
    }

    /// Override the probe concurrency bound.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Probe every given model, record live latencies, and atomically
    /// activate a fresh fail list built from the failures.
    pub async fn probe_all(&self, model_ids: &[String]) -> HealthResult<ProbeReport> {
        let mut outcomes: Vec<(usize, ProbeResult)> =
            futures::stream::iter(model_ids.iter().enumerate().map(|(index, model_id)| {
                let gateway = self.gateway.clone();
                let model_id = model_id.clone();
                let wire_id = self.wire_id_for(&model_id);
                async move {
                    let result = match gateway.probe_latency(&wire_id).await {
                        Ok(latency_ms) => ProbeResult {
                            model_id,
                            ok: true,
                            latency_ms: Some(latency_ms),
                            error: None,
                        },
                        Err(e) => ProbeResult {
                            model_id,
                            ok: false,
                            latency_ms: None,
                            error: Some(e.to_string()),
                        },
                    };
                    (index, result)
                }
            }))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        // Completions arrive in arrival order; report in input order.
        outcomes.sort_by_key(|(index, _)| *index);
        let results: Vec<ProbeResult> = outcomes.into_iter().map(|(_, r)| r).collect();

        let mut failed_model_ids = Vec::new();
        for result in &results {
            if result.ok {
                if let Some(latency_ms) = result.latency_ms {
                    self.registry
                        .record_live_probe(&result.model_id, latency_ms as f64)?;
                }
            } else {
                warn!(model = %result.model_id, error = ?result.error, "probe failed");
                failed_model_ids.push(result.model_id.clone());
            }
        }

        let failed_count = failed_model_ids.len();
        let name = format!("probe-{}", Utc::now().format("%Y%m%d-%H%M%S"));
        let fail_list = FailList::new(name, failed_model_ids);

        let store = self.registry.store();
        store.save_fail_list(&fail_list)?;
        store.set_active_fail_list(&fail_list.id)?;

        info!(
            probed = results.len(),
            failed = failed_count,
            fail_list = %fail_list.id,
            "probe batch complete"
        );

        Ok(ProbeReport {
            results,
            fail_list_id: fail_list.id,
            failed_count,
        })
    }

    /// Model id to put on the wire: unified ids probe their base model.
    fn wire_id_for(&self, model_id: &str) -> String {
        self.registry
            .get(model_id)
            .ok()
            .flatten()
            .map(|m| m.routable_id().to_string())
            .unwrap_or_else(|| model_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        ChatMessage, Completion, CompletionParams, DeltaStream, ProviderError, ProviderResult,
        Usage,
    };
    use crate::registry::ModelRegistry;
    use crate::state::SessionStore;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Gateway that fails every model named in `down`.
    struct PartialOutageGateway {
        down: HashSet<String>,
    }

    #[async_trait]
    impl ChatGateway for PartialOutageGateway {
        async fn complete(
            &self,
            model_id: &str,
            _messages: &[ChatMessage],
            _params: &CompletionParams,
            _timeout: Duration,
        ) -> ProviderResult<Completion> {
            if self.down.contains(model_id) {
                return Err(ProviderError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
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
            unimplemented!("probes never stream")
        }
    }

    fn setup(down: &[&str]) -> (HealthManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("test.db")).unwrap().shared();
        let registry = ModelRegistry::new(store).shared();
        let gateway = Arc::new(PartialOutageGateway {
            down: down.iter().map(|m| m.to_string()).collect(),
        });
        (HealthManager::new(gateway, registry), dir)
    }

    #[tokio::test]
    async fn test_probe_all_classifies_and_activates() {
        let (health, _dir) = setup(&["a/down"]);

        let models = vec![
            "a/up".to_string(),
            "a/down".to_string(),
            "a/also-up".to_string(),
        ];
        let report = health.probe_all(&models).await.unwrap();

        assert_eq!(report.results.len(), 3);
        assert_eq!(report.failed_count, 1);
        assert!(report.results[0].ok);
        assert!(!report.results[1].ok);
        assert_eq!(report.results[1].model_id, "a/down");

        let active = health
            .registry
            .store()
            .active_fail_list()
            .unwrap()
            .unwrap();
        assert_eq!(active.id, report.fail_list_id);
        assert_eq!(active.failed_model_ids, vec!["a/down".to_string()]);
    }

    #[tokio::test]
    async fn test_new_probe_batch_replaces_active_list() {
        let (health, _dir) = setup(&["a/down"]);

        let first = health.probe_all(&["a/down".to_string()]).await.unwrap();
        let second = health.probe_all(&["a/up".to_string()]).await.unwrap();
        assert_ne!(first.fail_list_id, second.fail_list_id);

        let active = health
            .registry
            .store()
            .active_fail_list()
            .unwrap()
            .unwrap();
        assert_eq!(active.id, second.fail_list_id);
        assert!(active.failed_model_ids.is_empty());
    }

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let (health, _dir) = setup(&[]);
        let models: Vec<String> = (0..10).map(|i| format!("a/m{}", i)).collect();
        let report = health.probe_all(&models).await.unwrap();
        let reported: Vec<&str> = report.results.iter().map(|r| r.model_id.as_str()).collect();
        let expected: Vec<&str> = models.iter().map(String::as_str).collect();
        assert_eq!(reported, expected);
    }
}
