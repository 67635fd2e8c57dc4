//! Model router
//!
//! Binds board members to concrete model variants. Candidates come from the
//! unified registry, the active fail-list gates every resolution, required
//! capabilities filter the set, and ties break by lower run latency, then
//! lower input cost. A member with no capable candidate falls back to its
//! configured substitute before the task fails.

use tracing::debug;

use crate::registry::types::{Capabilities, UnifiedModel};
use crate::state::{Board, SharedSessionStore, Skill, StoreError};

/// Error type for router operations
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no capable model for member {member} (requires {required:?})")]
    NoCapableModel { member: String, required: Vec<Skill> },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl RouterError {
    /// Stable failure kind for the engine's error taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoCapableModel { .. } => "no_capable_model",
            Self::Store(e) => e.kind(),
        }
    }
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// A member bound to a concrete model variant.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The configured board member this resolution serves.
    pub member_id: String,
    /// Concrete routable unit.
    pub unified_id: String,
    /// Model id sent to the chat gateway.
    pub wire_id: String,
    /// Set when the substitute answered instead of the main model.
    pub substituted_from: Option<String>,
    /// Rolling latency of the chosen variant, for bookkeeping.
    pub latency_ms: Option<f64>,
}

/// One routable candidate during resolution.
struct Candidate {
    unified_id: String,
    wire_id: String,
    /// None for models the registry has never seen; such candidates only
    /// satisfy tasks with no capability requirements.
    capabilities: Option<Capabilities>,
    latency_ms: Option<f64>,
    cost_input: f64,
}

impl Candidate {
    fn from_unified(model: &UnifiedModel) -> Self {
        Self {
            unified_id: model.unified_id.clone(),
            wire_id: model.routable_id().to_string(),
            capabilities: Some(model.capabilities),
            latency_ms: model.latency_ms,
            cost_input: model.cost.cost_1m_input_usd,
        }
    }

    fn unregistered(member: &str) -> Self {
        Self {
            unified_id: member.to_string(),
            wire_id: member.to_string(),
            capabilities: None,
            latency_ms: None,
            cost_input: 0.0,
        }
    }

    fn satisfies(&self, required: &[Skill]) -> bool {
        if required.is_empty() {
            return true;
        }
        let Some(caps) = self.capabilities else {
            return false;
        };
        required.iter().all(|skill| match skill {
            Skill::Reasoning => caps.reasoning,
            Skill::Vision => caps.vision,
            Skill::Tools => caps.tools,
            Skill::JsonMode => caps.json_mode,
            Skill::Thinking => caps.thinking,
        })
    }
}

/// The model router.
pub struct ModelRouter {
    store: SharedSessionStore,
}

impl ModelRouter {
    pub fn new(store: SharedSessionStore) -> Self {
        Self { store }
    }

    /// Resolve one board member for a task requiring `required`.
    ///
    /// Falls back to the member's substitute when the member has no capable
    /// candidate outside the active fail-list.
    pub fn resolve(
        &self,
        member: &str,
        required: &[Skill],
        board: &Board,
    ) -> RouterResult<Resolution> {
        let fail_list = self
            .store
            .active_fail_list()?
            .map(|l| l.failed_model_ids)
            .unwrap_or_default();

        if let Some(resolution) = self.resolve_one(member, required, &fail_list)? {
            return Ok(resolution);
        }

        if let Some(substitute) = board.substitutes.get(member) {
            if let Some(mut resolution) = self.resolve_one(substitute, required, &fail_list)? {
                debug!(member, substitute, "member resolved through substitute");
                resolution.substituted_from = Some(member.to_string());
                return Ok(resolution);
            }
        }

        Err(RouterError::NoCapableModel {
            member: member.to_string(),
            required: required.to_vec(),
        })
    }

    /// Resolve the chairman for synthesis duties.
    pub fn resolve_chairman(&self, board: &Board, required: &[Skill]) -> RouterResult<Resolution> {
        self.resolve(&board.chairman, required, board)
    }

    /// Resolve every member for a generic task. The returned order is the
    /// stable board order, which is also the anonymized label order used in
    /// Stage 2.
    pub fn resolve_board(&self, board: &Board) -> RouterResult<Vec<Resolution>> {
        board
            .council_members
            .iter()
            .map(|member| self.resolve(member, &[], board))
            .collect()
    }

    fn resolve_one(
        &self,
        member: &str,
        required: &[Skill],
        fail_list: &[String],
    ) -> RouterResult<Option<Resolution>> {
        let mut candidates = self.candidates_for(member)?;

        candidates.retain(|c| {
            !fail_list.contains(&c.unified_id) && !fail_list.contains(&c.wire_id)
        });
        candidates.retain(|c| c.satisfies(required));

        // Lower rolling latency wins; unknown latencies sort last. Cost is
        // the final tie-break.
        candidates.sort_by(|a, b| {
            match (a.latency_ms, b.latency_ms) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
            .then_with(|| {
                a.cost_input
                    .partial_cmp(&b.cost_input)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });

        Ok(candidates.into_iter().next().map(|c| Resolution {
            member_id: member.to_string(),
            unified_id: c.unified_id,
            wire_id: c.wire_id,
            substituted_from: None,
            latency_ms: c.latency_ms,
        }))
    }

    /// Candidates for a member id: the exact unified row when the id names
    /// one, else every registered variant of the base model, else the bare
    /// id itself (capability-unknown).
    fn candidates_for(&self, member: &str) -> RouterResult<Vec<Candidate>> {
        if let Some(exact) = self.store.get_unified_model(member)? {
            return Ok(vec![Candidate::from_unified(&exact)]);
        }

        let variants = self.store.list_unified_variants(member)?;
        if !variants.is_empty() {
            return Ok(variants.iter().map(Candidate::from_unified).collect());
        }

        Ok(vec![Candidate::unregistered(member)])
    }
}
