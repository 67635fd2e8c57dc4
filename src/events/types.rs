//! Event types for the council stream
//!
//! One frame vocabulary serves the live bus, the persisted audit log, and
//! reconnect replay. Frame names match the service boundary's event-stream
//! `type` field exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::state::{
    AggregateRanking, DraftRecord, RankingRecord, SessionId, SessionState, SynthesisRecord,
};

/// Metadata attached to the `stage2_complete` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTwoMetadata {
    /// Blinded label → model id.
    pub label_to_model: BTreeMap<String, String>,
    pub aggregate_rankings: Vec<AggregateRanking>,
    pub discarded_ballots: u32,
}

/// All frames a session can emit, in protocol vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouncilEvent {
    Log {
        message: String,
    },
    SessionState {
        state: SessionState,
    },
    Stage1Start,
    Stage1Complete {
        drafts: Vec<DraftRecord>,
    },
    Stage2Start,
    Stage2Complete {
        rankings: Vec<RankingRecord>,
        metadata: StageTwoMetadata,
    },
    Stage3Start,
    Stage3Complete {
        synthesis: SynthesisRecord,
    },
    HumanInputRequired {
        task_id: String,
    },
    Complete,
    Error {
        kind: String,
        message: String,
    },
}

impl CouncilEvent {
    /// Frame name as exposed on the service boundary.
    pub fn event_type(&self) -> &'static str {
        match self {
            CouncilEvent::Log { .. } => "log",
            CouncilEvent::SessionState { .. } => "session_state",
            CouncilEvent::Stage1Start => "stage1_start",
            CouncilEvent::Stage1Complete { .. } => "stage1_complete",
            CouncilEvent::Stage2Start => "stage2_start",
            CouncilEvent::Stage2Complete { .. } => "stage2_complete",
            CouncilEvent::Stage3Start => "stage3_start",
            CouncilEvent::Stage3Complete { .. } => "stage3_complete",
            CouncilEvent::HumanInputRequired { .. } => "human_input_required",
            CouncilEvent::Complete => "complete",
            CouncilEvent::Error { .. } => "error",
        }
    }

    /// Whether this frame terminates the session's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CouncilEvent::Complete | CouncilEvent::Error { .. })
    }
}

/// A published frame: event plus session routing and ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFrame {
    pub session_id: SessionId,
    /// Monotonically increasing per-session counter.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: CouncilEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names_match_protocol() {
        assert_eq!(CouncilEvent::Stage1Start.event_type(), "stage1_start");
        assert_eq!(CouncilEvent::Complete.event_type(), "complete");
        assert_eq!(
            CouncilEvent::HumanInputRequired {
                task_id: "t1".to_string()
            }
            .event_type(),
            "human_input_required"
        );
    }

    #[test]
    fn test_frame_serialization_carries_type_tag() {
        let frame = SessionFrame {
            session_id: "s1".to_string(),
            seq: 7,
            timestamp: Utc::now(),
            event: CouncilEvent::Log {
                message: "Stage 1: querying council members".to_string(),
            },
        };

        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["session_id"], "s1");
    }

    #[test]
    fn test_terminal_events() {
        assert!(CouncilEvent::Complete.is_terminal());
        assert!(CouncilEvent::Error {
            kind: "council_quorum_lost".to_string(),
            message: String::new()
        }
        .is_terminal());
        assert!(!CouncilEvent::Stage2Start.is_terminal());
    }
}
