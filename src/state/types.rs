//! Persistent domain types for council sessions
//!
//! Conversations own their messages and session snapshot; boards own their
//! personalities and substitutes; audit events are append-only. These rows
//! are what the store serializes.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::consensus::{ConsensusOutcome, ConsensusStrategy};
use crate::provider::Usage;

/// Unique identifier for conversations. A conversation's run state is its
/// session, so the same id addresses both.
pub type ConversationId = String;

/// Unique identifier for sessions (alias of the conversation id).
pub type SessionId = String;

/// Role of a persisted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    HumanChairman,
    Assistant,
    System,
}

/// Per-stage loading flags mirrored to clients while a run is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLoading {
    pub stage1: bool,
    pub stage2: bool,
    pub stage3: bool,
}

/// One member's Stage-1 draft (or its failure placeholder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftRecord {
    /// Board member this slot belongs to.
    pub member_id: String,
    /// Concrete model that produced the draft (the substitute, if one ran).
    pub model_id: String,
    /// Gateway id the draft was requested on; Stage-2 ballots reuse it.
    pub wire_id: String,
    pub response: String,
    pub reasoning: Option<String>,
    pub usage: Usage,
    pub failed: bool,
    pub error: Option<String>,
    /// Set when a substitute answered for the configured member.
    pub substituted_from: Option<String>,
}

/// One member's Stage-2 ranking, raw and parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingRecord {
    pub voter_model_id: String,
    pub raw_text: String,
    /// Present only when the ballot validated as a full permutation.
    pub parsed_ranking: Option<Vec<char>>,
}

/// The chairman's Stage-3 synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisRecord {
    pub model_id: String,
    pub response: String,
    pub reasoning: Option<String>,
    pub usage: Usage,
    /// True when the chairman failed twice and the Borda winner's draft was
    /// emitted instead.
    pub fallback: bool,
}

/// Aggregate ranking entry surfaced in stage-2 metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRanking {
    pub model_id: String,
    pub average_rank: f64,
    pub rankings_count: u32,
    pub borda_score: f64,
}

/// Run metadata attached to an assistant message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Blinded label → model id mapping for Stage 2.
    pub label_to_model: BTreeMap<String, String>,
    pub aggregate_rankings: Vec<AggregateRanking>,
    pub consensus: Option<ConsensusOutcome>,
    /// Winner label under the active strategy.
    pub consensus_winner: Option<String>,
    pub strategy: Option<ConsensusStrategy>,
    /// `"main→substitute"` entries for members that fell back.
    pub substitutes_used: Vec<String>,
    pub discarded_ballots: u32,
    pub chairman_fallback: bool,
}

/// Human feedback submitted at a Stage-4 breakpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanFeedback {
    pub continue_discussion: bool,
    pub feedback: String,
}

/// A persisted message within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub stage1: Option<Vec<DraftRecord>>,
    pub stage2: Option<Vec<RankingRecord>>,
    pub stage3: Option<SynthesisRecord>,
    pub metadata: Option<RunMetadata>,
    pub loading: StageLoading,
    /// Human feedback payload for `human_chairman` messages.
    pub feedback: Option<HumanFeedback>,
    /// Assistant messages stay mutable until finalized; only finalized
    /// messages count as revisions.
    pub finalized: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn base(role: MessageRole, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content,
            stage1: None,
            stage2: None,
            stage3: None,
            metadata: None,
            loading: StageLoading::default(),
            feedback: None,
            finalized: true,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(MessageRole::User, content.into())
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::base(MessageRole::System, content.into())
    }

    pub fn human_chairman(feedback: HumanFeedback) -> Self {
        let mut message = Self::base(MessageRole::HumanChairman, feedback.feedback.clone());
        message.feedback = Some(feedback);
        message
    }

    /// Fresh assistant message with all stages pending.
    pub fn assistant_shell() -> Self {
        let mut message = Self::base(MessageRole::Assistant, String::new());
        message.finalized = false;
        message.loading = StageLoading {
            stage1: true,
            stage2: true,
            stage3: true,
        };
        message
    }
}

/// Conversation row. Messages and the session snapshot live in their own
/// column families, keyed by the conversation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub archived: bool,
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: None,
            created_at: now,
            last_modified: now,
            archived: false,
        }
    }
}

/// Conversation metadata for list views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub archived: bool,
    pub message_count: usize,
    /// Count of finalized assistant messages.
    pub revision_count: usize,
}

/// Kind of a blueprint task. Chairman output may name kinds this build does
/// not know; those land on `Other` instead of failing the whole blueprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Draft,
    Analyze,
    Vision,
    Code,
    Refine,
    Other,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Draft => "draft",
            TaskKind::Analyze => "analyze",
            TaskKind::Vision => "vision",
            TaskKind::Code => "code",
            TaskKind::Refine => "refine",
            TaskKind::Other => "other",
        }
    }

    /// Capabilities a task of this kind needs even when the blueprint lists
    /// none explicitly.
    pub fn implied_skills(&self) -> &'static [Skill] {
        match self {
            TaskKind::Analyze => &[Skill::Reasoning],
            TaskKind::Vision => &[Skill::Vision],
            _ => &[],
        }
    }
}

impl Serialize for TaskKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "draft" => TaskKind::Draft,
            "analyze" => TaskKind::Analyze,
            "vision" => TaskKind::Vision,
            "code" => TaskKind::Code,
            "refine" => TaskKind::Refine,
            _ => TaskKind::Other,
        })
    }
}

/// Capability a task can require from its models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Skill {
    Reasoning,
    Vision,
    Tools,
    JsonMode,
    Thinking,
}

/// One task in a blueprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default = "generate_task_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub breakpoint: bool,
    #[serde(default)]
    pub required_skills: Vec<Skill>,
}

fn generate_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl TaskSpec {
    pub fn draft(label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: TaskKind::Draft,
            label: label.into(),
            breakpoint: false,
            required_skills: Vec::new(),
        }
    }

    /// Explicit requirements plus the kind's implied ones, deduplicated.
    pub fn effective_skills(&self) -> Vec<Skill> {
        let mut skills = self.required_skills.clone();
        for skill in self.kind.implied_skills() {
            if !skills.contains(skill) {
                skills.push(*skill);
            }
        }
        skills
    }
}

/// The ordered task list for a run. Kept as a simple list with a cursor;
/// `edges` records declared ordering for clients but execution is always
/// sequential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Blueprint {
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub edges: Vec<(usize, usize)>,
}

impl Blueprint {
    /// Fallback blueprint: one draft task over the raw query.
    pub fn single_draft(query: &str) -> Self {
        Self {
            tasks: vec![TaskSpec::draft(query)],
            edges: Vec::new(),
        }
    }

    pub fn is_consumed(&self, current_task_index: usize) -> bool {
        current_task_index >= self.tasks.len()
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    AwaitingHuman,
    Complete,
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::AwaitingHuman => write!(f, "awaiting_human"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Intermediate artifacts of the in-flight task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageBuffers {
    pub stage1: Option<Vec<DraftRecord>>,
    pub stage2: Option<Vec<RankingRecord>>,
    pub stage3: Option<SynthesisRecord>,
}

/// The checkpointed snapshot a run resumes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub blueprint: Blueprint,
    pub current_task_index: usize,
    pub status: SessionStatus,
    pub stage_buffers: StageBuffers,
    pub pending_human_input: Option<HumanFeedback>,
}

impl SessionState {
    pub fn new(blueprint: Blueprint) -> Self {
        Self {
            blueprint,
            current_task_index: 0,
            status: SessionStatus::Idle,
            stage_buffers: StageBuffers::default(),
            pending_human_input: None,
        }
    }
}

/// A configured council team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// 1–6 members.
    pub council_members: Vec<String>,
    pub chairman: String,
    /// main → substitute.
    pub substitutes: HashMap<String, String>,
    /// model → personality text.
    pub personalities: HashMap<String, String>,
    pub consensus_strategy: ConsensusStrategy,
    pub response_timeout_s: u64,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Board {
    /// Board assembled from the active settings.
    pub fn from_settings(name: impl Into<String>, settings: &crate::config::CouncilSettings) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            council_members: settings.council_models.clone(),
            chairman: settings.chairman_model.clone(),
            substitutes: settings.substitute_models.clone(),
            personalities: settings.model_personalities.clone(),
            consensus_strategy: settings.consensus_strategy,
            response_timeout_s: settings.response_timeout_s,
            usage_count: 0,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn member_count(&self) -> usize {
        self.council_members.len()
    }
}

/// A named set of model ids excluded from routing. At most one is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailList {
    pub id: String,
    pub name: String,
    pub failed_model_ids: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl FailList {
    pub fn new(name: impl Into<String>, failed_model_ids: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            failed_model_ids,
            active: false,
            created_at: Utc::now(),
        }
    }
}

/// One append-only audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub step: String,
    pub model_id: Option<String>,
    pub task_id: Option<String>,
    pub log_message: String,
    pub raw_data: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(session_id: impl Into<String>, step: impl Into<String>, log_message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            step: step.into(),
            model_id: None,
            task_id: None,
            log_message: log_message.into(),
            raw_data: None,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_raw_data(mut self, raw_data: serde_json::Value) -> Self {
        self.raw_data = Some(raw_data);
        self
    }
}

/// A saved prompt from the prompt library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptEntry {
    pub id: String,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub rating: i32,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
}

impl PromptEntry {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            content: content.into(),
            tags: Vec::new(),
            rating: 0,
            usage_count: 0,
            created_at: Utc::now(),
        }
    }
}
