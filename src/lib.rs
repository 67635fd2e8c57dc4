//! Council: deliberative multi-model orchestration
//!
//! This crate coordinates several independent model endpoints through a
//! staged protocol: individual drafting, blinded peer ranking, chairman
//! synthesis, and human-in-the-loop review, with resumable breakpoints and
//! a streaming event protocol. The Unified Model Registry feeding the
//! router merges heterogeneous provider metadata into one authoritative,
//! provenance-carrying view.
//!
//! # Components
//!
//! - [`provider`]: chat completions and latency probes against the
//!   provider gateway
//! - [`registry`]: dual-fetch catalog mirror and endpoint-first merge
//! - [`router`]: capability-driven binding of board members to variants
//! - [`consensus`]: Borda-Count and Chairman-Cut over validated ballots
//! - [`state`]: RocksDB-backed conversations, snapshots, boards, prompts,
//!   fail lists, and the audit log
//! - [`engine`]: the staged orchestrator
//! - [`events`]: per-session ordered event bus with reconnect replay
//! - [`health`]: batch probing and fail-list activation

pub mod audit;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod events;
pub mod health;
pub mod provider;
pub mod registry;
pub mod router;
pub mod state;

// Re-export the types most callers wire together.
pub use config::CouncilSettings;
pub use consensus::{ConsensusOutcome, ConsensusStrategy};
pub use engine::{CouncilEngine, EngineError, RunOutcome};
pub use events::{CouncilEvent, EventBus, SessionFrame, SharedEventBus};
pub use health::{HealthManager, ProbeReport};
pub use provider::{ChatGateway, OpenRouterClient, ProviderError};
pub use registry::{ModelRegistry, OpenRouterCatalog, SharedModelRegistry, UnifiedModel};
pub use router::{ModelRouter, Resolution, RouterError};
pub use state::{
    Board, Conversation, FailList, HumanFeedback, Message, SessionState, SessionStatus,
    SessionStore, SharedSessionStore,
};
