//! Council engine: the staged orchestrator
//!
//! Drives a run through blueprint drafting, parallel member drafts, blinded
//! peer ranking, chairman synthesis, and human review, checkpointing the
//! session snapshot after every stage and emitting the protocol event
//! stream. Recoverable member failures are absorbed through substitutes;
//! quorum loss, ballot starvation, routing dead-ends, and storage failures
//! surface as `error` frames and mark the session failed.

pub mod blueprint;
pub mod prompts;

pub use blueprint::{parse_blueprint, BlueprintParseError};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::consensus::{
    self, borda_count, collect_ballots, parse_ranking, parse_winner_label, top_labels,
    ConsensusError, ConsensusOutcome, ConsensusStrategy,
};
use crate::events::{CouncilEvent, EventBusError, SharedEventBus, StageTwoMetadata};
use crate::provider::{ChatGateway, ChatMessage, Completion, CompletionParams, ProviderError};
use crate::registry::SharedModelRegistry;
use crate::router::{ModelRouter, Resolution, RouterError};
use crate::state::{
    AggregateRanking, AuditEvent, Blueprint, Board, DraftRecord, HumanFeedback, Message,
    RankingRecord, RunMetadata, SessionState, SessionStatus, SharedSessionStore, StoreError,
    SynthesisRecord, TaskKind, TaskSpec,
};

/// Attempts per provider call for transient failures.
const MAX_CALL_ATTEMPTS: u32 = 2;

/// Base backoff between retry attempts.
const RETRY_BACKOFF_MS: u64 = 500;

/// Random jitter added on top of the base backoff.
const RETRY_JITTER_MS: u64 = 250;

/// Deadline for title generation, independent of the board timeout.
const TITLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum stored title length.
const TITLE_MAX_CHARS: usize = 50;

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("council quorum lost: {got} of {need} required drafts arrived")]
    CouncilQuorumLost { got: usize, need: usize },

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("event bus error: {0}")]
    Bus(#[from] EventBusError),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl EngineError {
    /// Stable failure kind exposed to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CouncilQuorumLost { .. } => "council_quorum_lost",
            Self::Consensus(e) => e.kind(),
            Self::Router(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Bus(_) => "internal_error",
            Self::ConversationNotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run paused at a Stage-4 breakpoint (or consumed the blueprint)
    /// and awaits human input for the given task index.
    AwaitingHuman {
        task_index: usize,
        revision_index: usize,
    },
    /// The session transitioned to complete.
    Complete,
}

/// The council engine.
pub struct CouncilEngine {
    store: SharedSessionStore,
    bus: SharedEventBus,
    registry: SharedModelRegistry,
    router: ModelRouter,
    gateway: Arc<dyn ChatGateway>,
    title_model: String,
}

impl CouncilEngine {
    pub fn new(
        store: SharedSessionStore,
        bus: SharedEventBus,
        registry: SharedModelRegistry,
        gateway: Arc<dyn ChatGateway>,
    ) -> Self {
        let router = ModelRouter::new(store.clone());
        Self {
            store,
            bus,
            registry,
            router,
            gateway,
            title_model: "google/gemini-2.0-flash-001".to_string(),
        }
    }

    /// Override the fast model used for title generation.
    pub fn with_title_model(mut self, model: impl Into<String>) -> Self {
        self.title_model = model.into();
        self
    }

    /// Access the router used for board binding.
    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Submit a user message and run the council until the next breakpoint.
    pub async fn submit_message(
        &self,
        conversation_id: &str,
        board: &Board,
        content: &str,
    ) -> EngineResult<RunOutcome> {
        self.store
            .get_conversation(conversation_id)?
            .ok_or_else(|| EngineError::ConversationNotFound(conversation_id.to_string()))?;

        let is_first_message = self.store.conversation_messages(conversation_id)?.is_empty();
        self.store
            .append_message(conversation_id, Message::user(content))?;

        // Board bookkeeping is best-effort; ad-hoc boards are not persisted.
        match self.store.touch_board_usage(&board.id) {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let prior_state = self.store.get_session_state(conversation_id)?;

        // The leading log frames and the single session_state sync belong
        // to the session's first run; later runs append stage cycles to the
        // same stream directly.
        let is_first_run = prior_state.is_none();
        if is_first_run {
            self.log(conversation_id, "Initializing council session")?;
        }

        if is_first_message {
            let title = self.generate_title(content).await;
            self.store.set_conversation_title(conversation_id, &title)?;
            self.log(conversation_id, &format!("Conversation titled: {}", title))?;
        }

        let prior_blueprint = prior_state.map(|s| s.blueprint);

        let query = self.build_query_context(conversation_id)?;
        let blueprint = self
            .stage0_blueprint(conversation_id, board, &query, prior_blueprint.as_ref())
            .await?;

        let mut state = SessionState::new(blueprint);
        if is_first_run {
            self.emit(
                conversation_id,
                CouncilEvent::SessionState {
                    state: state.clone(),
                },
            )?;
        }
        self.run_tasks(conversation_id, board, &mut state, &query).await
    }

    /// Submit human feedback for the task the session paused on.
    ///
    /// Idempotent by `task_index`: once an approval advances the cursor, a
    /// second identical call observes a stale index and is rejected with
    /// `invalid_state` instead of producing another revision.
    pub async fn submit_human_feedback(
        &self,
        conversation_id: &str,
        board: &Board,
        feedback: HumanFeedback,
        task_index: usize,
    ) -> EngineResult<RunOutcome> {
        let mut state = self
            .store
            .get_session_state(conversation_id)?
            .ok_or_else(|| EngineError::InvalidState("no session to review".to_string()))?;

        if state.status != SessionStatus::AwaitingHuman {
            return Err(EngineError::InvalidState(format!(
                "session is {}, not awaiting_human",
                state.status
            )));
        }
        if state.current_task_index != task_index {
            return Err(EngineError::InvalidState(format!(
                "approval targets task {} but session is at task {}",
                task_index, state.current_task_index
            )));
        }

        self.store
            .append_message(conversation_id, Message::human_chairman(feedback.clone()))?;

        if !feedback.continue_discussion {
            state.status = SessionStatus::Complete;
            state.pending_human_input = None;
            self.store.save_session(conversation_id, &state)?;
            self.emit(conversation_id, CouncilEvent::Complete)?;
            info!(conversation_id, "session complete");
            return Ok(RunOutcome::Complete);
        }

        // Approving the reviewed task advances the cursor; with the
        // blueprint consumed, the feedback spawns a refinement pass.
        state.current_task_index += 1;
        if state.blueprint.is_consumed(state.current_task_index) {
            state.blueprint.tasks.push(TaskSpec {
                id: uuid::Uuid::new_v4().to_string(),
                kind: TaskKind::Refine,
                label: feedback.feedback.clone(),
                breakpoint: false,
                required_skills: Vec::new(),
            });
        }
        state.pending_human_input = Some(feedback);

        let query = self.build_query_context(conversation_id)?;
        self.run_tasks(conversation_id, board, &mut state, &query).await
    }

    /// Cancel a running session.
    ///
    /// The caller aborts the run future itself (dropping it cancels
    /// outstanding provider calls best-effort); this marks the session
    /// failed and emits the terminal error frame. A paused session is not
    /// cancellable; it holds its snapshot until resumed, reset, or deleted.
    pub fn cancel(&self, conversation_id: &str) -> EngineResult<()> {
        let mut state = self
            .store
            .get_session_state(conversation_id)?
            .ok_or_else(|| EngineError::InvalidState("no session to cancel".to_string()))?;

        if state.status != SessionStatus::Running {
            return Err(EngineError::InvalidState(format!(
                "session is {}, not running",
                state.status
            )));
        }

        state.status = SessionStatus::Failed;
        self.store.save_session(conversation_id, &state)?;
        self.emit(
            conversation_id,
            CouncilEvent::Error {
                kind: "cancelled".to_string(),
                message: "run cancelled".to_string(),
            },
        )?;
        info!(conversation_id, "session cancelled");
        Ok(())
    }

    /// End a completed session with a 0–5 rating.
    pub fn end_session(&self, conversation_id: &str, rating: u8) -> EngineResult<()> {
        if rating > 5 {
            return Err(EngineError::InvalidState(format!(
                "rating {} out of range 0-5",
                rating
            )));
        }

        let state = self
            .store
            .get_session_state(conversation_id)?
            .ok_or_else(|| EngineError::InvalidState("no session to rate".to_string()))?;
        if state.status != SessionStatus::Complete {
            return Err(EngineError::InvalidState(format!(
                "session is {}, not complete",
                state.status
            )));
        }

        self.store.append_message(
            conversation_id,
            Message::system(format!("Session ended with rating: {}/5", rating)),
        )?;
        Ok(())
    }

    // =========================================================================
    // Stage 0: blueprint
    // =========================================================================

    /// Ask the chairman for a task list. Any failure (call, parse, empty)
    /// is absorbed into the default single-draft blueprint with a warning.
    async fn stage0_blueprint(
        &self,
        conversation_id: &str,
        board: &Board,
        query: &str,
        prior: Option<&Blueprint>,
    ) -> EngineResult<Blueprint> {
        let chairman = self.router.resolve_chairman(board, &[])?;
        let timeout = Duration::from_secs(board.response_timeout_s);

        let messages = vec![
            ChatMessage::system(prompts::blueprint_system_prompt()),
            ChatMessage::user(prompts::blueprint_user_prompt(query, prior)),
        ];

        let blueprint = match self
            .query_with_retry(&chairman.wire_id, &messages, &CompletionParams::default(), timeout)
            .await
        {
            Ok((completion, elapsed_ms)) => {
                self.note_latency(&chairman, elapsed_ms);
                match parse_blueprint(&completion.content) {
                    Ok(blueprint) => blueprint,
                    Err(e) => {
                        warn!(conversation_id, error = %e, "blueprint parse failed");
                        self.log(
                            conversation_id,
                            "Chairman plan did not parse; falling back to a single draft task",
                        )?;
                        Blueprint::single_draft(query)
                    }
                }
            }
            Err(e) => {
                warn!(conversation_id, error = %e, "blueprint drafting failed");
                self.log(
                    conversation_id,
                    "Chairman unavailable for planning; falling back to a single draft task",
                )?;
                Blueprint::single_draft(query)
            }
        };

        self.store.append_audit(
            AuditEvent::new(conversation_id, "stage0_plan", "blueprint drafted")
                .with_model(&chairman.unified_id)
                .with_raw_data(serde_json::to_value(&blueprint).unwrap_or_default()),
        )?;

        Ok(blueprint)
    }

    // =========================================================================
    // Task loop
    // =========================================================================

    async fn run_tasks(
        &self,
        conversation_id: &str,
        board: &Board,
        state: &mut SessionState,
        query: &str,
    ) -> EngineResult<RunOutcome> {
        loop {
            if state.blueprint.is_consumed(state.current_task_index) {
                // Nothing left to execute; wait for the human verdict.
                state.status = SessionStatus::AwaitingHuman;
                self.store.save_session(conversation_id, state)?;
                self.emit(
                    conversation_id,
                    CouncilEvent::HumanInputRequired {
                        task_id: String::new(),
                    },
                )?;
                return Ok(RunOutcome::AwaitingHuman {
                    task_index: state.current_task_index,
                    revision_index: 0,
                });
            }

            let task = state.blueprint.tasks[state.current_task_index].clone();
            let task_query = if task.label.is_empty() || task.kind == TaskKind::Draft {
                query.to_string()
            } else {
                format!("{}\n\nCurrent task: {}", query, task.label)
            };

            state.status = SessionStatus::Running;
            state.stage_buffers = Default::default();
            self.store.save_session(conversation_id, state)?;

            let (message_index, revision_index) = self
                .store
                .append_message(conversation_id, Message::assistant_shell())?;
            let revision_index = revision_index.unwrap_or(0);

            // ── Stage 1: parallel drafts ─────────────────────────────────
            self.emit(conversation_id, CouncilEvent::Stage1Start)?;
            let drafts = match self.stage1_drafts(conversation_id, board, &task, &task_query).await
            {
                Ok(drafts) => drafts,
                Err(e) => return self.abort_run(conversation_id, state, e),
            };

            state.stage_buffers.stage1 = Some(drafts.clone());
            self.store.save_session(conversation_id, state)?;
            self.store
                .update_assistant_message(conversation_id, message_index, |m| {
                    m.stage1 = Some(drafts.clone());
                    m.loading.stage1 = false;
                })?;
            self.emit(
                conversation_id,
                CouncilEvent::Stage1Complete {
                    drafts: drafts.clone(),
                },
            )?;

            // ── Stage 2: blinded peer ranking ────────────────────────────
            self.emit(conversation_id, CouncilEvent::Stage2Start)?;
            let stage2 = match self
                .stage2_rankings(conversation_id, board, &task_query, &drafts)
                .await
            {
                Ok(stage2) => stage2,
                Err(e) => return self.abort_run(conversation_id, state, e),
            };

            let mut metadata = RunMetadata {
                label_to_model: stage2.label_to_model.clone(),
                aggregate_rankings: stage2.aggregate_rankings.clone(),
                consensus: Some(stage2.outcome.clone()),
                consensus_winner: None,
                strategy: Some(board.consensus_strategy),
                substitutes_used: drafts
                    .iter()
                    .filter_map(|d| {
                        d.substituted_from
                            .as_ref()
                            .map(|main| format!("{}→{}", main, d.model_id))
                    })
                    .collect(),
                discarded_ballots: stage2.discarded_ballots,
                chairman_fallback: false,
            };

            state.stage_buffers.stage2 = Some(stage2.rankings.clone());
            self.store.save_session(conversation_id, state)?;
            self.store
                .update_assistant_message(conversation_id, message_index, |m| {
                    m.stage2 = Some(stage2.rankings.clone());
                    m.metadata = Some(metadata.clone());
                    m.loading.stage2 = false;
                })?;
            self.emit(
                conversation_id,
                CouncilEvent::Stage2Complete {
                    rankings: stage2.rankings.clone(),
                    metadata: StageTwoMetadata {
                        label_to_model: stage2.label_to_model.clone(),
                        aggregate_rankings: stage2.aggregate_rankings.clone(),
                        discarded_ballots: stage2.discarded_ballots,
                    },
                },
            )?;

            // ── Stage 3: synthesis ───────────────────────────────────────
            self.emit(conversation_id, CouncilEvent::Stage3Start)?;
            let (synthesis, winner_label, chairman_fallback) = match self
                .stage3_synthesis(conversation_id, board, &task_query, &drafts, &stage2)
                .await
            {
                Ok(result) => result,
                Err(e) => return self.abort_run(conversation_id, state, e),
            };

            metadata.consensus_winner = Some(winner_label.to_string());
            metadata.chairman_fallback = chairman_fallback;

            state.stage_buffers.stage3 = Some(synthesis.clone());
            self.store.save_session(conversation_id, state)?;
            self.store
                .update_assistant_message(conversation_id, message_index, |m| {
                    m.content = synthesis.response.clone();
                    m.stage3 = Some(synthesis.clone());
                    m.metadata = Some(metadata.clone());
                    m.loading.stage3 = false;
                })?;
            self.store.finalize_message(conversation_id, message_index)?;
            self.emit(
                conversation_id,
                CouncilEvent::Stage3Complete {
                    synthesis: synthesis.clone(),
                },
            )?;

            // ── Stage 4: human review ────────────────────────────────────
            let is_last_task = state.current_task_index + 1 >= state.blueprint.tasks.len();
            if task.breakpoint || is_last_task {
                state.status = SessionStatus::AwaitingHuman;
                state.stage_buffers = Default::default();
                self.store.save_session(conversation_id, state)?;
                self.emit(
                    conversation_id,
                    CouncilEvent::HumanInputRequired {
                        task_id: task.id.clone(),
                    },
                )?;
                info!(
                    conversation_id,
                    task = %task.id,
                    revision_index,
                    "run paused for human review"
                );
                return Ok(RunOutcome::AwaitingHuman {
                    task_index: state.current_task_index,
                    revision_index,
                });
            }

            state.current_task_index += 1;
            self.store.save_session(conversation_id, state)?;
        }
    }

    /// Surface a fatal error: emit the `error` frame and mark the session
    /// failed.
    fn abort_run(
        &self,
        conversation_id: &str,
        state: &mut SessionState,
        error: EngineError,
    ) -> EngineResult<RunOutcome> {
        warn!(conversation_id, kind = error.kind(), "run failed: {}", error);
        state.status = SessionStatus::Failed;
        self.store.save_session(conversation_id, state)?;
        self.emit(
            conversation_id,
            CouncilEvent::Error {
                kind: error.kind().to_string(),
                message: error.to_string(),
            },
        )?;
        Err(error)
    }

    // =========================================================================
    // Stage 1: drafts
    // =========================================================================

    async fn stage1_drafts(
        &self,
        conversation_id: &str,
        board: &Board,
        task: &TaskSpec,
        query: &str,
    ) -> EngineResult<Vec<DraftRecord>> {
        let skills = task.effective_skills();
        let timeout = Duration::from_secs(board.response_timeout_s);

        // Routing failures are fatal for the task; they surface before any
        // provider call is made.
        let resolutions: Vec<Resolution> = board
            .council_members
            .iter()
            .map(|member| self.router.resolve(member, &skills, board))
            .collect::<Result<_, _>>()?;

        let instruction = (task.kind != TaskKind::Draft && !task.label.is_empty())
            .then_some(task.label.as_str());

        let futures = board
            .council_members
            .iter()
            .zip(resolutions.into_iter())
            .map(|(member, resolution)| {
                let personality = board.personalities.get(member).map(String::as_str);
                let system = prompts::member_system_prompt(personality, instruction);
                let messages = vec![ChatMessage::system(system), ChatMessage::user(query)];
                self.draft_one_member(board, member, resolution, messages, &skills, timeout)
            });

        // join_all preserves input order, so drafts land in stable member
        // order regardless of completion order.
        let drafts: Vec<DraftRecord> = join_all(futures).await;

        for draft in &drafts {
            let step = if draft.failed { "stage1_failed" } else { "stage1_draft" };
            self.store.append_audit(
                AuditEvent::new(conversation_id, step, format!("member {}", draft.member_id))
                    .with_model(&draft.model_id)
                    .with_task(&task.id),
            )?;
        }

        let arrived = drafts.iter().filter(|d| !d.failed).count();
        let need = consensus::quorum(board.member_count());
        if arrived < need {
            return Err(EngineError::CouncilQuorumLost { got: arrived, need });
        }

        debug!(conversation_id, arrived, need, "stage 1 quorum met");
        Ok(drafts)
    }

    /// One member's draft with retry, substitute fallback, and failure
    /// placeholder. Never errors; failures become a failed record.
    async fn draft_one_member(
        &self,
        board: &Board,
        member: &str,
        resolution: Resolution,
        messages: Vec<ChatMessage>,
        skills: &[crate::state::Skill],
        timeout: Duration,
    ) -> DraftRecord {
        let params = CompletionParams::default();

        match self
            .query_with_retry(&resolution.wire_id, &messages, &params, timeout)
            .await
        {
            Ok((completion, elapsed_ms)) => {
                self.note_latency(&resolution, elapsed_ms);
                return DraftRecord {
                    member_id: member.to_string(),
                    model_id: resolution.unified_id.clone(),
                    wire_id: resolution.wire_id.clone(),
                    response: completion.content,
                    reasoning: completion.reasoning,
                    usage: completion.usage,
                    failed: false,
                    error: None,
                    substituted_from: resolution.substituted_from.clone(),
                };
            }
            Err(first_error) => {
                warn!(member, error = %first_error, "member draft failed");

                // The member's substitute gets one shot, unless the router
                // already routed through it.
                if resolution.substituted_from.is_none() {
                    if let Some(substitute) = board.substitutes.get(member) {
                        if let Ok(sub_resolution) = self.router.resolve(substitute, skills, board) {
                            if let Ok((completion, elapsed_ms)) = self
                                .query_with_retry(
                                    &sub_resolution.wire_id,
                                    &messages,
                                    &params,
                                    timeout,
                                )
                                .await
                            {
                                self.note_latency(&sub_resolution, elapsed_ms);
                                return DraftRecord {
                                    member_id: member.to_string(),
                                    model_id: sub_resolution.unified_id,
                                    wire_id: sub_resolution.wire_id,
                                    response: completion.content,
                                    reasoning: completion.reasoning,
                                    usage: completion.usage,
                                    failed: false,
                                    error: None,
                                    substituted_from: Some(member.to_string()),
                                };
                            }
                        }
                    }
                }

                DraftRecord {
                    member_id: member.to_string(),
                    model_id: resolution.unified_id,
                    wire_id: resolution.wire_id,
                    response: String::new(),
                    reasoning: None,
                    usage: Default::default(),
                    failed: true,
                    error: Some(first_error.to_string()),
                    substituted_from: None,
                }
            }
        }
    }

    // =========================================================================
    // Stage 2: peer ranking
    // =========================================================================

    async fn stage2_rankings(
        &self,
        conversation_id: &str,
        board: &Board,
        query: &str,
        drafts: &[DraftRecord],
    ) -> EngineResult<StageTwoOutput> {
        let timeout = Duration::from_secs(board.response_timeout_s);

        // Blinded labels in stable member order, successful drafts only.
        let labeled: Vec<(char, &DraftRecord)> = drafts
            .iter()
            .filter(|d| !d.failed)
            .enumerate()
            .map(|(i, d)| ((b'A' + i as u8) as char, d))
            .collect();
        let labels: Vec<char> = labeled.iter().map(|(l, _)| *l).collect();

        let label_to_model: std::collections::BTreeMap<String, String> = labeled
            .iter()
            .map(|(label, draft)| (label.to_string(), draft.model_id.clone()))
            .collect();
        let own_label: HashMap<&str, char> = labeled
            .iter()
            .map(|(label, draft)| (draft.member_id.as_str(), *label))
            .collect();

        let futures = labeled.iter().map(|(label, draft)| {
            let prompt = prompts::ranking_prompt(query, &labeled, *label);
            let messages = vec![
                ChatMessage::system(prompts::judge_system_prompt()),
                ChatMessage::user(prompt),
            ];
            let voter = draft.member_id.clone();
            let wire_id = draft.wire_id.clone();
            async move {
                let result = self
                    .query_with_retry(&wire_id, &messages, &CompletionParams::default(), timeout)
                    .await;
                (voter, result)
            }
        });

        let responses: Vec<(String, Result<(Completion, u64), ProviderError>)> =
            join_all(futures).await;

        let mut rankings = Vec::new();
        let mut raw_ballots: Vec<(String, Vec<char>)> = Vec::new();

        for (voter, result) in responses {
            match result {
                Ok((completion, _)) => {
                    let own = own_label.get(voter.as_str()).copied();
                    let mut parsed = parse_ranking(&completion.content);
                    // Removing a self-rank is mechanical; missing labels are
                    // never filled in.
                    if let Some(own) = own {
                        parsed.retain(|l| *l != own);
                    }
                    raw_ballots.push((voter.clone(), parsed.clone()));
                    rankings.push(RankingRecord {
                        voter_model_id: voter,
                        raw_text: completion.content,
                        parsed_ranking: Some(parsed),
                    });
                }
                Err(e) => {
                    warn!(voter = %voter, error = %e, "ballot collection failed");
                    rankings.push(RankingRecord {
                        voter_model_id: voter,
                        raw_text: String::new(),
                        parsed_ranking: None,
                    });
                }
            }
        }

        let expected_for = |voter: &str| -> Vec<char> {
            let own = own_label.get(voter).copied();
            labels
                .iter()
                .copied()
                .filter(|l| Some(*l) != own)
                .collect()
        };

        let (ballots, discarded_ballots) =
            collect_ballots(&raw_ballots, expected_for, labeled.len())?;

        // Reflect validation back into the records: only surviving ballots
        // keep their parsed ranking.
        let valid_voters: Vec<&str> = ballots.iter().map(|b| b.voter.as_str()).collect();
        for record in &mut rankings {
            if !valid_voters.contains(&record.voter_model_id.as_str()) {
                record.parsed_ranking = None;
            }
        }

        let outcome = borda_count(&ballots, &labels)?;

        let aggregate_rankings = aggregate_rankings(&outcome, &label_to_model);

        self.store.append_audit(
            AuditEvent::new(conversation_id, "stage2_consensus", "peer rankings aggregated")
                .with_raw_data(serde_json::to_value(&outcome).unwrap_or_default()),
        )?;

        Ok(StageTwoOutput {
            rankings,
            outcome,
            label_to_model,
            aggregate_rankings,
            discarded_ballots,
        })
    }

    // =========================================================================
    // Stage 3: synthesis
    // =========================================================================

    async fn stage3_synthesis(
        &self,
        conversation_id: &str,
        board: &Board,
        query: &str,
        drafts: &[DraftRecord],
        stage2: &StageTwoOutput,
    ) -> EngineResult<(SynthesisRecord, char, bool)> {
        let chairman = self.router.resolve_chairman(board, &[])?;
        let timeout = Duration::from_secs(board.response_timeout_s);

        let labeled: Vec<(char, &DraftRecord)> = drafts
            .iter()
            .filter(|d| !d.failed)
            .enumerate()
            .map(|(i, d)| ((b'A' + i as u8) as char, d))
            .collect();

        let borda_winner = stage2.outcome.winner_label;

        let messages = match board.consensus_strategy {
            ConsensusStrategy::BordaCount => {
                let ranking_texts: Vec<(String, String)> = stage2
                    .rankings
                    .iter()
                    .filter(|r| !r.raw_text.is_empty())
                    .map(|r| (r.voter_model_id.clone(), r.raw_text.clone()))
                    .collect();
                let context =
                    prompts::synthesis_context(query, &labeled, &ranking_texts, borda_winner);
                vec![
                    ChatMessage::system(prompts::synthesis_system_prompt()),
                    ChatMessage::user(context),
                ]
            }
            ConsensusStrategy::ChairmanCut => {
                let top = top_labels(&stage2.outcome, 3);
                let top_drafts: Vec<(char, &DraftRecord)> = labeled
                    .iter()
                    .filter(|(label, _)| top.contains(label))
                    .map(|(label, draft)| (*label, *draft))
                    .collect();
                vec![ChatMessage::user(prompts::chairman_cut_prompt(
                    query,
                    &top_drafts,
                ))]
            }
        };

        // One retry with a short backoff; the second failure falls back to
        // the Borda winner's draft.
        let mut last_error = None;
        for attempt in 0..2u32 {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(0)).await;
            }
            let start = Instant::now();
            match tokio::time::timeout(
                timeout,
                self.gateway
                    .complete(&chairman.wire_id, &messages, &CompletionParams::default(), timeout),
            )
            .await
            .unwrap_or(Err(ProviderError::Timeout(timeout)))
            {
                Ok(completion) => {
                    self.note_latency(&chairman, start.elapsed().as_millis() as u64);
                    let winner = match board.consensus_strategy {
                        ConsensusStrategy::BordaCount => borda_winner,
                        ConsensusStrategy::ChairmanCut => {
                            let candidates = top_labels(&stage2.outcome, 3);
                            parse_winner_label(&completion.content, &candidates)
                                .unwrap_or(borda_winner)
                        }
                    };
                    let synthesis = SynthesisRecord {
                        model_id: chairman.unified_id.clone(),
                        response: completion.content,
                        reasoning: completion.reasoning,
                        usage: completion.usage,
                        fallback: false,
                    };
                    return Ok((synthesis, winner, false));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "chairman synthesis failed");
                    last_error = Some(e);
                }
            }
        }

        // Chairman is out; the Borda winner's draft becomes the answer.
        let winner_draft = labeled
            .iter()
            .find(|(label, _)| *label == borda_winner)
            .map(|(_, draft)| (*draft).clone());

        let response = winner_draft
            .as_ref()
            .map(|d| d.response.clone())
            .unwrap_or_default();

        self.store.append_audit(
            AuditEvent::new(
                conversation_id,
                "chairman_fallback",
                format!(
                    "chairman failed twice ({}); emitting Borda winner draft",
                    last_error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                ),
            )
            .with_model(&chairman.unified_id),
        )?;

        let synthesis = SynthesisRecord {
            model_id: chairman.unified_id,
            response,
            reasoning: None,
            usage: Default::default(),
            fallback: true,
        };
        Ok((synthesis, borda_winner, true))
    }

    // =========================================================================
    // Provider call policy
    // =========================================================================

    /// Bounded retry with jittered backoff for transient failures. Timeouts
    /// are not retried (the stage deadline is shared) and permanent
    /// failures surface immediately.
    async fn query_with_retry(
        &self,
        wire_id: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
        timeout: Duration,
    ) -> Result<(Completion, u64), ProviderError> {
        let mut attempt = 0u32;
        loop {
            let start = Instant::now();
            let outcome = tokio::time::timeout(
                timeout,
                self.gateway.complete(wire_id, messages, params, timeout),
            )
            .await
            .unwrap_or(Err(ProviderError::Timeout(timeout)));

            match outcome {
                Ok(completion) => {
                    return Ok((completion, start.elapsed().as_millis() as u64));
                }
                Err(e @ ProviderError::Timeout(_)) => return Err(e),
                Err(e) if e.is_transient() && attempt + 1 < MAX_CALL_ATTEMPTS => {
                    debug!(wire_id, attempt, error = %e, "transient failure, retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fold a completed call's wall-clock into the rolling latency average.
    fn note_latency(&self, resolution: &Resolution, elapsed_ms: u64) {
        if elapsed_ms == 0 {
            return;
        }
        if let Err(e) = self
            .registry
            .record_run_latency(&resolution.unified_id, elapsed_ms as f64)
        {
            debug!(model = %resolution.unified_id, error = %e, "latency bookkeeping skipped");
        }
    }

    // =========================================================================
    // Context and titles
    // =========================================================================

    /// The query the council deliberates on: the latest user message plus
    /// any human chairman feedback submitted after it.
    fn build_query_context(&self, conversation_id: &str) -> EngineResult<String> {
        let messages = self.store.conversation_messages(conversation_id)?;

        let last_user_position = messages
            .iter()
            .rposition(|m| m.role == crate::state::MessageRole::User)
            .ok_or_else(|| EngineError::InvalidState("no user message in conversation".to_string()))?;

        let mut query = messages[last_user_position].content.clone();
        for message in &messages[last_user_position + 1..] {
            if message.role == crate::state::MessageRole::HumanChairman {
                query.push_str(&format!(
                    "\n\nHuman Chairman Feedback: {}\n\nPlease reconsider your analysis taking this feedback into account.",
                    message.content
                ));
            }
        }
        Ok(query)
    }

    /// Generate a 3–5 word conversation title with the fast title model.
    /// Failures fall back to a generic title.
    async fn generate_title(&self, query: &str) -> String {
        let messages = vec![ChatMessage::user(prompts::title_prompt(query))];
        let params = CompletionParams {
            max_tokens: Some(24),
            temperature: None,
        };

        let title = match tokio::time::timeout(
            TITLE_TIMEOUT,
            self.gateway
                .complete(&self.title_model, &messages, &params, TITLE_TIMEOUT),
        )
        .await
        {
            Ok(Ok(completion)) => completion.content,
            _ => return "New Conversation".to_string(),
        };

        let title = title
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .trim()
            .to_string();
        if title.is_empty() {
            return "New Conversation".to_string();
        }
        if title.chars().count() > TITLE_MAX_CHARS {
            let truncated: String = title.chars().take(TITLE_MAX_CHARS - 3).collect();
            format!("{}...", truncated)
        } else {
            title
        }
    }

    // =========================================================================
    // Event plumbing
    // =========================================================================

    /// Publish a frame and write it through to the audit log.
    fn emit(&self, conversation_id: &str, event: CouncilEvent) -> EngineResult<()> {
        let frame = self.bus.publish(conversation_id, event)?;
        self.store.append_audit(
            AuditEvent::new(
                conversation_id,
                frame.event.event_type(),
                format!("seq {}", frame.seq),
            )
            .with_raw_data(serde_json::to_value(&frame).unwrap_or_default()),
        )?;
        Ok(())
    }

    fn log(&self, conversation_id: &str, message: &str) -> EngineResult<()> {
        self.emit(
            conversation_id,
            CouncilEvent::Log {
                message: message.to_string(),
            },
        )
    }
}

/// Stage-2 artifacts handed to Stage 3.
struct StageTwoOutput {
    rankings: Vec<RankingRecord>,
    outcome: ConsensusOutcome,
    label_to_model: std::collections::BTreeMap<String, String>,
    aggregate_rankings: Vec<AggregateRanking>,
    discarded_ballots: u32,
}

/// Jittered exponential backoff for retry attempt `attempt`.
fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BACKOFF_MS * 2u64.pow(attempt);
    let jitter = rand::thread_rng().gen_range(0..=RETRY_JITTER_MS);
    Duration::from_millis(base + jitter)
}

/// Map consensus label scores onto models for stage-2 metadata, sorted by
/// average rank (best first).
fn aggregate_rankings(
    outcome: &ConsensusOutcome,
    label_to_model: &std::collections::BTreeMap<String, String>,
) -> Vec<AggregateRanking> {
    let mut aggregate: Vec<AggregateRanking> = outcome
        .per_label_scores
        .iter()
        .filter_map(|(label, score)| {
            let model_id = label_to_model.get(&label.to_string())?.clone();
            Some(AggregateRanking {
                model_id,
                average_rank: outcome
                    .per_label_mean_position
                    .get(label)
                    .copied()
                    .unwrap_or_default(),
                rankings_count: outcome.per_label_votes.get(label).copied().unwrap_or(0),
                borda_score: *score,
            })
        })
        .collect();

    aggregate.sort_by(|a, b| {
        a.average_rank
            .partial_cmp(&b.average_rank)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    aggregate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Ballot;

    #[test]
    fn test_backoff_grows_with_attempts() {
        let first = backoff_delay(0);
        let second = backoff_delay(1);
        assert!(first >= Duration::from_millis(RETRY_BACKOFF_MS));
        assert!(first <= Duration::from_millis(RETRY_BACKOFF_MS + RETRY_JITTER_MS));
        assert!(second >= Duration::from_millis(RETRY_BACKOFF_MS * 2));
    }

    #[test]
    fn test_aggregate_rankings_sorted_by_average() {
        let ballots = vec![
            Ballot {
                voter: "m1".to_string(),
                ordering: vec!['B', 'C'],
            },
            Ballot {
                voter: "m2".to_string(),
                ordering: vec!['A', 'C'],
            },
            Ballot {
                voter: "m3".to_string(),
                ordering: vec!['A', 'B'],
            },
        ];
        let outcome = borda_count(&ballots, &['A', 'B', 'C']).unwrap();

        let label_to_model: std::collections::BTreeMap<String, String> = [
            ("A".to_string(), "model-a".to_string()),
            ("B".to_string(), "model-b".to_string()),
            ("C".to_string(), "model-c".to_string()),
        ]
        .into_iter()
        .collect();

        let aggregate = aggregate_rankings(&outcome, &label_to_model);
        assert_eq!(aggregate[0].model_id, "model-a");
        assert_eq!(aggregate.last().unwrap().model_id, "model-c");
        assert!(aggregate[0].average_rank <= aggregate[1].average_rank);
    }

    #[test]
    fn test_engine_error_kinds() {
        assert_eq!(
            EngineError::CouncilQuorumLost { got: 1, need: 2 }.kind(),
            "council_quorum_lost"
        );
        assert_eq!(
            EngineError::InvalidState("x".to_string()).kind(),
            "invalid_state"
        );
        assert_eq!(
            EngineError::Consensus(ConsensusError::InsufficientBallots { got: 0, need: 2 }).kind(),
            "insufficient_ballots"
        );
    }
}
