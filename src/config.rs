//! Council configuration
//!
//! Settings are loaded from a JSON file when present, otherwise defaults
//! apply. The member list is clamped to 1–6 models and the response timeout
//! to the 10–300 second range on every update.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::consensus::ConsensusStrategy;

/// Minimum number of council members.
pub const MIN_COUNCIL_MEMBERS: usize = 1;

/// Maximum number of council members.
pub const MAX_COUNCIL_MEMBERS: usize = 6;

/// Allowed range for the per-call response timeout, in seconds.
pub const RESPONSE_TIMEOUT_RANGE_S: (u64, u64) = (10, 300);

/// Error type for configuration operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Full council configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilSettings {
    /// Models sitting on the council (1–6 entries).
    pub council_models: Vec<String>,

    /// Model performing blueprint drafting and Stage-3 synthesis.
    pub chairman_model: String,

    /// Per-member substitute used when the main model fails.
    #[serde(default)]
    pub substitute_models: HashMap<String, String>,

    /// Personality text injected into each member's system prompt.
    #[serde(default)]
    pub model_personalities: HashMap<String, String>,

    /// How peer rankings are turned into a winner.
    #[serde(default)]
    pub consensus_strategy: ConsensusStrategy,

    /// Per-call deadline in seconds, clamped to [10, 300].
    #[serde(default = "default_response_timeout_s")]
    pub response_timeout_s: u64,

    /// Fast model used for conversation title generation.
    #[serde(default = "default_title_model")]
    pub title_model: String,
}

fn default_response_timeout_s() -> u64 {
    60
}

fn default_title_model() -> String {
    "google/gemini-2.0-flash-001".to_string()
}

impl Default for CouncilSettings {
    fn default() -> Self {
        let council_models = vec![
            "xiaomi/mimo-v2-flash:free".to_string(),
            "tngtech/deepseek-r1t2-chimera:free".to_string(),
            "nex-agi/deepseek-v3.1-nex-n1:free".to_string(),
            "z-ai/glm-4.5-air:free".to_string(),
            "nvidia/nemotron-nano-12b-v2-vl:free".to_string(),
        ];

        let mut model_personalities = HashMap::new();
        model_personalities.insert(
            council_models[0].clone(),
            "Fast multimodal reasoning".to_string(),
        );
        model_personalities.insert(
            council_models[1].clone(),
            "Deep analytical reasoning".to_string(),
        );
        model_personalities.insert(
            council_models[2].clone(),
            "Advanced logical reasoning".to_string(),
        );
        model_personalities.insert(
            council_models[3].clone(),
            "Balanced reasoning with insights".to_string(),
        );
        model_personalities.insert(
            council_models[4].clone(),
            "Vision-enhanced reasoning".to_string(),
        );

        Self {
            council_models,
            chairman_model: "z-ai/glm-4.5-air:free".to_string(),
            substitute_models: HashMap::new(),
            model_personalities,
            consensus_strategy: ConsensusStrategy::BordaCount,
            response_timeout_s: default_response_timeout_s(),
            title_model: default_title_model(),
        }
    }
}

impl CouncilSettings {
    /// Load settings from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default().normalized());
        }
        let raw = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&raw)?;
        Ok(settings.normalized())
    }

    /// Persist settings to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Clamp member count and timeout into their allowed ranges.
    pub fn normalized(mut self) -> Self {
        if self.council_models.is_empty() {
            warn!("empty council_models, restoring defaults");
            self.council_models = Self::default().council_models;
        } else if self.council_models.len() > MAX_COUNCIL_MEMBERS {
            warn!(
                configured = self.council_models.len(),
                max = MAX_COUNCIL_MEMBERS,
                "too many council members, truncating"
            );
            self.council_models.truncate(MAX_COUNCIL_MEMBERS);
        }

        let (min_t, max_t) = RESPONSE_TIMEOUT_RANGE_S;
        if self.response_timeout_s < min_t || self.response_timeout_s > max_t {
            warn!(
                configured = self.response_timeout_s,
                "response_timeout_s out of range, clamping"
            );
            self.response_timeout_s = self.response_timeout_s.clamp(min_t, max_t);
        }

        self
    }
}
