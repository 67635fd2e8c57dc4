//! Session state store
//!
//! Snapshot-oriented persistence for conversations, messages, session
//! snapshots, boards, prompts, fail lists, the audit log, and the model
//! registry tables.

pub mod schema;
pub mod store;
pub mod types;

pub use store::{SessionStore, SharedSessionStore, StoreError, StoreResult};
pub use types::{
    AggregateRanking, AuditEvent, Blueprint, Board, Conversation, ConversationId,
    ConversationSummary, DraftRecord, FailList, HumanFeedback, Message, MessageRole,
    PromptEntry, RankingRecord, RunMetadata, SessionId, SessionState, SessionStatus, Skill,
    StageBuffers, StageLoading, SynthesisRecord, TaskKind, TaskSpec,
};
