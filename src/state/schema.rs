//! Column family definitions for the RocksDB session store
//!
//! Each logical table gets its own column family on the shared RocksDB
//! instance. Raw catalog tables keep the previous generation under an
//! `old:` key prefix for diffing after a refresh.

/// Column family for conversations
pub const CF_CONVERSATIONS: &str = "conversations";

/// Column family for messages
pub const CF_MESSAGES: &str = "messages";

/// Column family for session snapshots
pub const CF_SESSION_STATE: &str = "session_state";

/// Column family for boards
pub const CF_BOARDS: &str = "boards";

/// Column family for the prompt library
pub const CF_PROMPTS: &str = "prompts";

/// Column family for fail lists
pub const CF_FAIL_LISTS: &str = "fail_lists";

/// Column family for the append-only audit log
pub const CF_AUDIT_EVENTS: &str = "audit_events";

/// Column family for raw catalog base models
pub const CF_RAW_BASE_MODELS: &str = "raw_base_models";

/// Column family for raw per-model endpoint sets
pub const CF_RAW_ENDPOINTS: &str = "raw_endpoints";

/// Column family for merged unified models
pub const CF_UNIFIED_MODELS: &str = "unified_models";

/// All column family names
pub const ALL_CFS: &[&str] = &[
    CF_CONVERSATIONS,
    CF_MESSAGES,
    CF_SESSION_STATE,
    CF_BOARDS,
    CF_PROMPTS,
    CF_FAIL_LISTS,
    CF_AUDIT_EVENTS,
    CF_RAW_BASE_MODELS,
    CF_RAW_ENDPOINTS,
    CF_UNIFIED_MODELS,
];

/// Key prefix for the current generation of a raw table
pub const RAW_CURRENT_PREFIX: &str = "cur:";

/// Key prefix for the previous generation of a raw table
pub const RAW_OLD_PREFIX: &str = "old:";

/// Key builders for compound keys
pub mod keys {
    /// Create a conversation key
    pub fn conversation(conversation_id: &str) -> String {
        format!("conv:{}", conversation_id)
    }

    /// Create a message key, ordered by index within the conversation
    pub fn message(conversation_id: &str, index: usize) -> String {
        format!("msg:{}:{:06}", conversation_id, index)
    }

    /// Prefix matching all messages of a conversation
    pub fn message_prefix(conversation_id: &str) -> String {
        format!("msg:{}:", conversation_id)
    }

    /// Create a session snapshot key
    pub fn session(conversation_id: &str) -> String {
        format!("sess:{}", conversation_id)
    }

    /// Create a board key
    pub fn board(board_id: &str) -> String {
        format!("board:{}", board_id)
    }

    /// Create a prompt key
    pub fn prompt(prompt_id: &str) -> String {
        format!("prompt:{}", prompt_id)
    }

    /// Create a fail-list key, sortable by creation time
    pub fn fail_list(created_nanos: i64, fail_list_id: &str) -> String {
        format!("flist:{:020}:{}", created_nanos, fail_list_id)
    }

    /// Create an audit event key, sortable by timestamp within a session
    pub fn audit(session_id: &str, timestamp_nanos: i64, counter: u64) -> String {
        format!("audit:{}:{:020}:{:06}", session_id, timestamp_nanos, counter)
    }

    /// Prefix matching all audit events of a session
    pub fn audit_prefix(session_id: &str) -> String {
        format!("audit:{}:", session_id)
    }

    /// Create a current-generation raw table key
    pub fn raw_current(id: &str) -> String {
        format!("{}{}", super::RAW_CURRENT_PREFIX, id)
    }

    /// Create a previous-generation raw table key
    pub fn raw_old(id: &str) -> String {
        format!("{}{}", super::RAW_OLD_PREFIX, id)
    }

    /// Create a unified model key
    pub fn unified(unified_id: &str) -> String {
        format!("um:{}", unified_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        assert_eq!(keys::conversation("c1"), "conv:c1");
        assert_eq!(keys::message("c1", 3), "msg:c1:000003");
        assert_eq!(keys::session("c1"), "sess:c1");
        assert_eq!(keys::board("b1"), "board:b1");
        assert_eq!(keys::unified("openai/gpt-4o:deep_infra"), "um:openai/gpt-4o:deep_infra");
    }

    #[test]
    fn test_message_keys_order_by_index() {
        assert!(keys::message("c1", 2) < keys::message("c1", 10));
    }

    #[test]
    fn test_audit_keys_order_by_timestamp() {
        let k1 = keys::audit("s1", 1_000, 0);
        let k2 = keys::audit("s1", 2_000, 0);
        let k3 = keys::audit("s1", 2_000, 1);
        assert!(k1 < k2);
        assert!(k2 < k3);
    }

    #[test]
    fn test_raw_generation_prefixes() {
        assert_eq!(keys::raw_current("openai/gpt-4o"), "cur:openai/gpt-4o");
        assert_eq!(keys::raw_old("openai/gpt-4o"), "old:openai/gpt-4o");
    }
}
