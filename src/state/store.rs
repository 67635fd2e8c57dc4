//! RocksDB-backed session store
//!
//! One column family per logical table, bincode row encoding for session
//! data, and verbatim JSON for anything carrying provider provenance
//! (raw catalog rows, unified models, audit payloads). Writes are
//! serialized per store handle; reads go against the last committed state.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::schema::{self, keys, ALL_CFS};
use super::types::*;
use crate::registry::types::{RawBaseModel, RawEndpointSet, UnifiedModel};

/// How many fail lists are retained; older ones are pruned on insert.
const FAIL_LIST_RETENTION: usize = 5;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock poisoned")]
    LockPoisoned,

    #[error("column family not found: {0}")]
    ColumnFamilyNotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl StoreError {
    /// Stable failure kind for the engine's error taxonomy.
    pub fn kind(&self) -> &'static str {
        "storage_error"
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to SessionStore
pub type SharedSessionStore = Arc<SessionStore>;

/// RocksDB-backed persistent store for conversations, sessions, boards,
/// prompts, fail lists, the audit log, and the model registry tables.
pub struct SessionStore {
    db: RwLock<DB>,
    path: PathBuf,
    audit_counter: AtomicU64,
}

impl SessionStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

        Ok(Self {
            db: RwLock::new(db),
            path,
            audit_counter: AtomicU64::new(0),
        })
    }

    /// Create a shared reference to this store.
    pub fn shared(self) -> SharedSessionStore {
        Arc::new(self)
    }

    /// Get the database path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    // =========================================================================
    // Generic operations
    // =========================================================================

    fn put<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let bytes =
            bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        db.put_cf(&cf, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        match db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => {
                let value = bincode::deserialize(&bytes)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// JSON-encoded variant for rows that carry `serde_json::Value`
    /// provenance (bincode cannot round-trip untyped JSON).
    fn put_json<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let bytes =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        db.put_cf(&cf, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        match db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn delete(&self, cf_name: &str, key: &str) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        db.delete_cf(&cf, key.as_bytes())?;
        Ok(())
    }

    fn list_keys(&self, cf_name: &str, prefix: &str) -> StoreResult<Vec<String>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let mut found = Vec::new();
        let iter = db.iterator_cf(
            &cf,
            rocksdb::IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward),
        );
        for result in iter {
            let (key, _) = result?;
            match String::from_utf8(key.to_vec()) {
                Ok(key_str) if key_str.starts_with(prefix) => found.push(key_str),
                _ => break,
            }
        }
        Ok(found)
    }

    fn scan<T: DeserializeOwned>(&self, cf_name: &str, prefix: &str) -> StoreResult<Vec<T>> {
        let keys = self.list_keys(cf_name, prefix)?;
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(row) = self.get(cf_name, &key)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn scan_json<T: DeserializeOwned>(&self, cf_name: &str, prefix: &str) -> StoreResult<Vec<T>> {
        let keys = self.list_keys(cf_name, prefix)?;
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(row) = self.get_json(cf_name, &key)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn delete_prefix(&self, cf_name: &str, prefix: &str) -> StoreResult<usize> {
        let keys = self.list_keys(cf_name, prefix)?;
        let count = keys.len();
        for key in keys {
            self.delete(cf_name, &key)?;
        }
        Ok(count)
    }

    // =========================================================================
    // Conversation operations
    // =========================================================================

    /// Create a conversation, generating an id when none is supplied.
    pub fn create_conversation(&self, id: Option<String>) -> StoreResult<Conversation> {
        let conversation =
            Conversation::new(id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()));
        self.put(
            schema::CF_CONVERSATIONS,
            &keys::conversation(&conversation.id),
            &conversation,
        )?;
        Ok(conversation)
    }

    pub fn get_conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        self.get(schema::CF_CONVERSATIONS, &keys::conversation(conversation_id))
    }

    fn require_conversation(&self, conversation_id: &str) -> StoreResult<Conversation> {
        self.get_conversation(conversation_id)?
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", conversation_id)))
    }

    fn touch_conversation(&self, conversation_id: &str) -> StoreResult<()> {
        let mut conversation = self.require_conversation(conversation_id)?;
        conversation.last_modified = chrono::Utc::now();
        self.put(
            schema::CF_CONVERSATIONS,
            &keys::conversation(conversation_id),
            &conversation,
        )
    }

    /// All messages of a conversation in append order.
    pub fn conversation_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        self.scan(schema::CF_MESSAGES, &keys::message_prefix(conversation_id))
    }

    /// List conversations, newest activity first.
    pub fn list_conversations(
        &self,
        include_archived: bool,
    ) -> StoreResult<Vec<ConversationSummary>> {
        let conversations: Vec<Conversation> = self.scan(schema::CF_CONVERSATIONS, "conv:")?;

        let mut summaries = Vec::new();
        for conversation in conversations {
            if conversation.archived && !include_archived {
                continue;
            }
            let messages = self.conversation_messages(&conversation.id)?;
            let revision_count = messages
                .iter()
                .filter(|m| m.role == MessageRole::Assistant && m.finalized)
                .count();
            summaries.push(ConversationSummary {
                id: conversation.id,
                title: conversation.title,
                created_at: conversation.created_at,
                last_modified: conversation.last_modified,
                archived: conversation.archived,
                message_count: messages.len(),
                revision_count,
            });
        }

        summaries.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(summaries)
    }

    pub fn set_conversation_title(&self, conversation_id: &str, title: &str) -> StoreResult<()> {
        let mut conversation = self.require_conversation(conversation_id)?;
        conversation.title = Some(title.to_string());
        conversation.last_modified = chrono::Utc::now();
        self.put(
            schema::CF_CONVERSATIONS,
            &keys::conversation(conversation_id),
            &conversation,
        )
    }

    pub fn archive_conversation(&self, conversation_id: &str) -> StoreResult<()> {
        let mut conversation = self.require_conversation(conversation_id)?;
        conversation.archived = true;
        self.put(
            schema::CF_CONVERSATIONS,
            &keys::conversation(conversation_id),
            &conversation,
        )
    }

    /// Delete a conversation with its messages, session state, and audit log.
    pub fn delete_conversation_permanent(&self, conversation_id: &str) -> StoreResult<()> {
        self.require_conversation(conversation_id)?;
        self.delete_prefix(schema::CF_MESSAGES, &keys::message_prefix(conversation_id))?;
        self.delete_prefix(schema::CF_AUDIT_EVENTS, &keys::audit_prefix(conversation_id))?;
        self.delete(schema::CF_SESSION_STATE, &keys::session(conversation_id))?;
        self.delete(schema::CF_CONVERSATIONS, &keys::conversation(conversation_id))?;
        Ok(())
    }

    /// Clear messages and session state; the title is preserved and the
    /// audit log stays (it is append-only).
    pub fn reset_conversation(&self, conversation_id: &str) -> StoreResult<()> {
        self.require_conversation(conversation_id)?;
        self.delete_prefix(schema::CF_MESSAGES, &keys::message_prefix(conversation_id))?;
        self.delete(schema::CF_SESSION_STATE, &keys::session(conversation_id))?;
        self.touch_conversation(conversation_id)
    }

    // =========================================================================
    // Message operations
    // =========================================================================

    /// Append a message. Returns its index and, for assistant messages, the
    /// revision index (count of prior assistant messages).
    pub fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> StoreResult<(usize, Option<usize>)> {
        self.require_conversation(conversation_id)?;
        let existing = self.conversation_messages(conversation_id)?;
        let index = existing.len();

        let revision_index = if message.role == MessageRole::Assistant {
            Some(
                existing
                    .iter()
                    .filter(|m| m.role == MessageRole::Assistant)
                    .count(),
            )
        } else {
            None
        };

        self.put(
            schema::CF_MESSAGES,
            &keys::message(conversation_id, index),
            &message,
        )?;
        self.touch_conversation(conversation_id)?;

        debug!(
            conversation_id,
            index,
            role = ?message.role,
            "message appended"
        );

        Ok((index, revision_index))
    }

    pub fn get_message(&self, conversation_id: &str, index: usize) -> StoreResult<Option<Message>> {
        self.get(schema::CF_MESSAGES, &keys::message(conversation_id, index))
    }

    /// Mutate an assistant message's stage buffers. Fails once the message
    /// is finalized; finalized messages are immutable revisions.
    pub fn update_assistant_message(
        &self,
        conversation_id: &str,
        index: usize,
        mutate: impl FnOnce(&mut Message),
    ) -> StoreResult<Message> {
        let mut message = self
            .get_message(conversation_id, index)?
            .ok_or_else(|| StoreError::NotFound(format!("message {}:{}", conversation_id, index)))?;

        if message.role != MessageRole::Assistant {
            return Err(StoreError::InvalidOperation(
                "only assistant messages carry stage buffers".to_string(),
            ));
        }
        if message.finalized {
            return Err(StoreError::InvalidOperation(
                "message already finalized".to_string(),
            ));
        }

        mutate(&mut message);
        self.put(
            schema::CF_MESSAGES,
            &keys::message(conversation_id, index),
            &message,
        )?;
        Ok(message)
    }

    /// Mark an assistant message finalized; it now counts as a revision.
    pub fn finalize_message(&self, conversation_id: &str, index: usize) -> StoreResult<Message> {
        let message = self.update_assistant_message(conversation_id, index, |m| {
            m.finalized = true;
            m.loading = StageLoading::default();
        })?;
        self.touch_conversation(conversation_id)?;
        Ok(message)
    }

    // =========================================================================
    // Session snapshot operations
    // =========================================================================

    /// Atomically overwrite the session snapshot. The replaced state is
    /// retained only in the audit log.
    pub fn save_session(
        &self,
        conversation_id: &str,
        state: &SessionState,
    ) -> StoreResult<()> {
        self.require_conversation(conversation_id)?;

        if let Some(previous) = self.get_session_state(conversation_id)? {
            let raw = serde_json::to_value(&previous)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            self.append_audit(
                AuditEvent::new(conversation_id, "session_state_replaced", "session snapshot overwritten")
                    .with_raw_data(raw),
            )?;
        }

        self.put(schema::CF_SESSION_STATE, &keys::session(conversation_id), state)
    }

    pub fn get_session_state(&self, conversation_id: &str) -> StoreResult<Option<SessionState>> {
        self.get(schema::CF_SESSION_STATE, &keys::session(conversation_id))
    }

    // =========================================================================
    // Board operations
    // =========================================================================

    pub fn save_board(&self, board: &Board) -> StoreResult<()> {
        self.put(schema::CF_BOARDS, &keys::board(&board.id), board)
    }

    pub fn get_board(&self, board_id: &str) -> StoreResult<Option<Board>> {
        self.get(schema::CF_BOARDS, &keys::board(board_id))
    }

    /// List boards, most recently used first.
    pub fn list_boards(&self) -> StoreResult<Vec<Board>> {
        let mut boards: Vec<Board> = self.scan(schema::CF_BOARDS, "board:")?;
        boards.sort_by(|a, b| {
            b.last_used_at
                .cmp(&a.last_used_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(boards)
    }

    pub fn delete_board(&self, board_id: &str) -> StoreResult<()> {
        self.delete(schema::CF_BOARDS, &keys::board(board_id))
    }

    /// Bump usage counters when a board is bound to a run.
    pub fn touch_board_usage(&self, board_id: &str) -> StoreResult<()> {
        let mut board = self
            .get_board(board_id)?
            .ok_or_else(|| StoreError::NotFound(format!("board {}", board_id)))?;
        board.usage_count += 1;
        board.last_used_at = Some(chrono::Utc::now());
        self.save_board(&board)
    }

    // =========================================================================
    // Prompt library operations
    // =========================================================================

    pub fn save_prompt(&self, prompt: &PromptEntry) -> StoreResult<()> {
        self.put(schema::CF_PROMPTS, &keys::prompt(&prompt.id), prompt)
    }

    pub fn get_prompt(&self, prompt_id: &str) -> StoreResult<Option<PromptEntry>> {
        self.get(schema::CF_PROMPTS, &keys::prompt(prompt_id))
    }

    /// List prompts, newest first.
    pub fn list_prompts(&self) -> StoreResult<Vec<PromptEntry>> {
        let mut prompts: Vec<PromptEntry> = self.scan(schema::CF_PROMPTS, "prompt:")?;
        prompts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(prompts)
    }

    pub fn delete_prompt(&self, prompt_id: &str) -> StoreResult<()> {
        self.delete(schema::CF_PROMPTS, &keys::prompt(prompt_id))
    }

    pub fn track_prompt_usage(&self, prompt_id: &str) -> StoreResult<()> {
        let mut prompt = self
            .get_prompt(prompt_id)?
            .ok_or_else(|| StoreError::NotFound(format!("prompt {}", prompt_id)))?;
        prompt.usage_count += 1;
        self.save_prompt(&prompt)
    }

    // =========================================================================
    // Fail-list operations
    // =========================================================================

    /// Insert a fail list, pruning to the newest five.
    pub fn save_fail_list(&self, fail_list: &FailList) -> StoreResult<()> {
        let created_nanos = fail_list.created_at.timestamp_nanos_opt().unwrap_or(0);
        self.put(
            schema::CF_FAIL_LISTS,
            &keys::fail_list(created_nanos, &fail_list.id),
            fail_list,
        )?;

        let keys = self.list_keys(schema::CF_FAIL_LISTS, "flist:")?;
        if keys.len() > FAIL_LIST_RETENTION {
            // Keys sort by creation time; drop the oldest surplus.
            for stale in keys.iter().take(keys.len() - FAIL_LIST_RETENTION) {
                self.delete(schema::CF_FAIL_LISTS, stale)?;
            }
        }
        Ok(())
    }

    /// All fail lists, newest first.
    pub fn list_fail_lists(&self) -> StoreResult<Vec<FailList>> {
        let mut lists: Vec<FailList> = self.scan(schema::CF_FAIL_LISTS, "flist:")?;
        lists.reverse();
        Ok(lists)
    }

    /// Activate one fail list and deactivate every other in a single batch.
    pub fn set_active_fail_list(&self, fail_list_id: &str) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_FAIL_LISTS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_FAIL_LISTS.to_string()))?;

        let mut batch = WriteBatch::default();
        let mut found = false;

        let iter = db.iterator_cf(&cf, rocksdb::IteratorMode::Start);
        for result in iter {
            let (key, value) = result?;
            let mut list: FailList = bincode::deserialize(&value)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            let should_be_active = list.id == fail_list_id;
            found |= should_be_active;
            if list.active != should_be_active {
                list.active = should_be_active;
                let bytes = bincode::serialize(&list)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                batch.put_cf(&cf, key, bytes);
            }
        }

        if !found {
            return Err(StoreError::NotFound(format!("fail list {}", fail_list_id)));
        }

        db.write(batch)?;
        Ok(())
    }

    /// The single active fail list, if any.
    pub fn active_fail_list(&self) -> StoreResult<Option<FailList>> {
        let lists = self.list_fail_lists()?;
        Ok(lists.into_iter().find(|l| l.active))
    }

    // =========================================================================
    // Audit log operations
    // =========================================================================

    /// Append an audit event. Events are keyed by timestamp plus a local
    /// counter so same-instant entries keep their order.
    pub fn append_audit(&self, event: AuditEvent) -> StoreResult<()> {
        let timestamp_nanos = event.timestamp.timestamp_nanos_opt().unwrap_or(0);
        let counter = self.audit_counter.fetch_add(1, Ordering::Relaxed);
        let key = keys::audit(&event.session_id, timestamp_nanos, counter);
        self.put_json(schema::CF_AUDIT_EVENTS, &key, &event)
    }

    /// All audit events for a session in chronological order.
    pub fn audit_log(&self, session_id: &str) -> StoreResult<Vec<AuditEvent>> {
        self.scan_json(schema::CF_AUDIT_EVENTS, &keys::audit_prefix(session_id))
    }

    // =========================================================================
    // Raw catalog tables
    // =========================================================================

    /// Swap in a fresh generation of raw base models. The previous
    /// generation moves to `old:` keys for diffing; both moves happen in one
    /// write batch so readers never observe a half-swap.
    pub fn replace_raw_base_models(&self, models: &[RawBaseModel]) -> StoreResult<()> {
        self.swap_raw_generation(
            schema::CF_RAW_BASE_MODELS,
            models
                .iter()
                .map(|m| serde_json::to_vec(m).map(|bytes| (m.id.clone(), bytes)))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        )
    }

    /// Swap in a fresh generation of raw endpoint sets.
    pub fn replace_raw_endpoint_sets(&self, sets: &[RawEndpointSet]) -> StoreResult<()> {
        self.swap_raw_generation(
            schema::CF_RAW_ENDPOINTS,
            sets.iter()
                .map(|s| serde_json::to_vec(s).map(|bytes| (s.base_model_id.clone(), bytes)))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        )
    }

    fn swap_raw_generation(
        &self,
        cf_name: &str,
        rows: Vec<(String, Vec<u8>)>,
    ) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let mut batch = WriteBatch::default();

        // Drop the stale previous generation.
        let old_iter = db.iterator_cf(
            &cf,
            rocksdb::IteratorMode::From(
                schema::RAW_OLD_PREFIX.as_bytes(),
                rocksdb::Direction::Forward,
            ),
        );
        for result in old_iter {
            let (key, _) = result?;
            if !key.starts_with(schema::RAW_OLD_PREFIX.as_bytes()) {
                break;
            }
            batch.delete_cf(&cf, key);
        }

        // Move the current generation to old.
        let cur_iter = db.iterator_cf(
            &cf,
            rocksdb::IteratorMode::From(
                schema::RAW_CURRENT_PREFIX.as_bytes(),
                rocksdb::Direction::Forward,
            ),
        );
        for result in cur_iter {
            let (key, value) = result?;
            if !key.starts_with(schema::RAW_CURRENT_PREFIX.as_bytes()) {
                break;
            }
            let suffix = &key[schema::RAW_CURRENT_PREFIX.len()..];
            let mut old_key = schema::RAW_OLD_PREFIX.as_bytes().to_vec();
            old_key.extend_from_slice(suffix);
            batch.put_cf(&cf, old_key, value);
            batch.delete_cf(&cf, key);
        }

        // Write the fresh generation.
        for (id, bytes) in rows {
            batch.put_cf(&cf, keys::raw_current(&id).as_bytes(), bytes);
        }

        db.write(batch)?;
        Ok(())
    }

    pub fn raw_base_models(&self) -> StoreResult<Vec<RawBaseModel>> {
        self.scan_json(schema::CF_RAW_BASE_MODELS, schema::RAW_CURRENT_PREFIX)
    }

    pub fn raw_base_models_old(&self) -> StoreResult<Vec<RawBaseModel>> {
        self.scan_json(schema::CF_RAW_BASE_MODELS, schema::RAW_OLD_PREFIX)
    }

    pub fn raw_endpoint_sets(&self) -> StoreResult<Vec<RawEndpointSet>> {
        self.scan_json(schema::CF_RAW_ENDPOINTS, schema::RAW_CURRENT_PREFIX)
    }

    pub fn raw_endpoint_sets_old(&self) -> StoreResult<Vec<RawEndpointSet>> {
        self.scan_json(schema::CF_RAW_ENDPOINTS, schema::RAW_OLD_PREFIX)
    }

    // =========================================================================
    // Unified model table
    // =========================================================================

    /// Insert or update a unified row. Updates preserve `created_at` and all
    /// latency fields the incoming row does not carry.
    pub fn upsert_unified_model(&self, model: &UnifiedModel) -> StoreResult<UnifiedModel> {
        let key = keys::unified(&model.unified_id);
        let mut row = model.clone();

        if let Some(existing) = self.get_json::<UnifiedModel>(schema::CF_UNIFIED_MODELS, &key)? {
            row.created_at = existing.created_at;
            if row.latency_ms.is_none() {
                row.latency_ms = existing.latency_ms;
                row.last_latency_check = existing.last_latency_check;
            }
            if row.latency_live_ms.is_none() {
                row.latency_live_ms = existing.latency_live_ms;
                row.latency_live_at = existing.latency_live_at;
            }
        }

        self.put_json(schema::CF_UNIFIED_MODELS, &key, &row)?;
        Ok(row)
    }

    pub fn get_unified_model(&self, unified_id: &str) -> StoreResult<Option<UnifiedModel>> {
        self.get_json(schema::CF_UNIFIED_MODELS, &keys::unified(unified_id))
    }

    /// All unified rows in stable order:
    /// (developer, base model name, variant, hosting provider).
    pub fn list_unified_models(&self) -> StoreResult<Vec<UnifiedModel>> {
        let mut models: Vec<UnifiedModel> = self.scan_json(schema::CF_UNIFIED_MODELS, "um:")?;
        models.sort_by_key(|m| m.sort_key());
        Ok(models)
    }

    /// All variants of one base model, in stable order.
    pub fn list_unified_variants(&self, base_model_id: &str) -> StoreResult<Vec<UnifiedModel>> {
        let mut variants: Vec<UnifiedModel> = self
            .scan_json::<UnifiedModel>(schema::CF_UNIFIED_MODELS, "um:")?
            .into_iter()
            .filter(|m| m.base_model_id == base_model_id)
            .collect();
        variants.sort_by_key(|m| m.sort_key());
        Ok(variants)
    }

    /// Mutate latency bookkeeping on one unified row.
    pub fn update_unified_latency(
        &self,
        unified_id: &str,
        mutate: impl FnOnce(&mut UnifiedModel),
    ) -> StoreResult<Option<UnifiedModel>> {
        let key = keys::unified(unified_id);
        let Some(mut row) = self.get_json::<UnifiedModel>(schema::CF_UNIFIED_MODELS, &key)? else {
            return Ok(None);
        };
        mutate(&mut row);
        row.updated_at = chrono::Utc::now();
        self.put_json(schema::CF_UNIFIED_MODELS, &key, &row)?;
        Ok(Some(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_conversation_crud() {
        let (store, _dir) = test_store();

        let conversation = store.create_conversation(None).unwrap();
        let loaded = store.get_conversation(&conversation.id).unwrap().unwrap();
        assert_eq!(loaded.id, conversation.id);
        assert!(loaded.title.is_none());

        store.set_conversation_title(&conversation.id, "Eventual consistency").unwrap();
        let loaded = store.get_conversation(&conversation.id).unwrap().unwrap();
        assert_eq!(loaded.title.as_deref(), Some("Eventual consistency"));

        store.archive_conversation(&conversation.id).unwrap();
        assert!(store.list_conversations(false).unwrap().is_empty());
        assert_eq!(store.list_conversations(true).unwrap().len(), 1);
    }

    #[test]
    fn test_message_append_and_revision_index() {
        let (store, _dir) = test_store();
        let conversation = store.create_conversation(None).unwrap();

        let (index, revision) = store
            .append_message(&conversation.id, Message::user("question"))
            .unwrap();
        assert_eq!(index, 0);
        assert!(revision.is_none());

        let (_, revision) = store
            .append_message(&conversation.id, Message::assistant_shell())
            .unwrap();
        assert_eq!(revision, Some(0));

        let (_, revision) = store
            .append_message(&conversation.id, Message::assistant_shell())
            .unwrap();
        assert_eq!(revision, Some(1));
    }

    #[test]
    fn test_finalized_message_is_immutable() {
        let (store, _dir) = test_store();
        let conversation = store.create_conversation(None).unwrap();

        let (index, _) = store
            .append_message(&conversation.id, Message::assistant_shell())
            .unwrap();

        store
            .update_assistant_message(&conversation.id, index, |m| {
                m.content = "draft".to_string();
            })
            .unwrap();
        store.finalize_message(&conversation.id, index).unwrap();

        let err = store
            .update_assistant_message(&conversation.id, index, |m| {
                m.content = "tamper".to_string();
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperation(_)));
    }

    #[test]
    fn test_session_round_trip_and_overwrite_audit() {
        let (store, _dir) = test_store();
        let conversation = store.create_conversation(None).unwrap();

        let state = SessionState::new(Blueprint::single_draft("q"));
        store.save_session(&conversation.id, &state).unwrap();

        let mut advanced = state.clone();
        advanced.current_task_index = 1;
        advanced.status = SessionStatus::AwaitingHuman;
        store.save_session(&conversation.id, &advanced).unwrap();

        let loaded = store.get_session_state(&conversation.id).unwrap().unwrap();
        assert_eq!(loaded.current_task_index, 1);
        assert_eq!(loaded.status, SessionStatus::AwaitingHuman);

        // The replaced state landed in the audit log.
        let audit = store.audit_log(&conversation.id).unwrap();
        assert!(audit.iter().any(|e| e.step == "session_state_replaced"));
    }

    #[test]
    fn test_reset_preserves_title() {
        let (store, _dir) = test_store();
        let conversation = store.create_conversation(None).unwrap();
        store.set_conversation_title(&conversation.id, "kept").unwrap();
        store
            .append_message(&conversation.id, Message::user("hello"))
            .unwrap();
        store
            .save_session(&conversation.id, &SessionState::new(Blueprint::single_draft("q")))
            .unwrap();

        store.reset_conversation(&conversation.id).unwrap();

        assert!(store.conversation_messages(&conversation.id).unwrap().is_empty());
        assert!(store.get_session_state(&conversation.id).unwrap().is_none());
        let conversation = store.get_conversation(&conversation.id).unwrap().unwrap();
        assert_eq!(conversation.title.as_deref(), Some("kept"));
    }

    #[test]
    fn test_fail_list_activation_is_exclusive() {
        let (store, _dir) = test_store();

        let first = FailList::new("first", vec!["a/m1".to_string()]);
        let second = FailList::new("second", vec!["a/m2".to_string()]);
        store.save_fail_list(&first).unwrap();
        store.save_fail_list(&second).unwrap();

        store.set_active_fail_list(&first.id).unwrap();
        assert_eq!(store.active_fail_list().unwrap().unwrap().id, first.id);

        store.set_active_fail_list(&second.id).unwrap();
        let active = store.active_fail_list().unwrap().unwrap();
        assert_eq!(active.id, second.id);

        let actives = store
            .list_fail_lists()
            .unwrap()
            .into_iter()
            .filter(|l| l.active)
            .count();
        assert_eq!(actives, 1);
    }

    #[test]
    fn test_fail_list_retention() {
        let (store, _dir) = test_store();
        for i in 0..8 {
            let list = FailList::new(format!("list-{}", i), vec![]);
            store.save_fail_list(&list).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let lists = store.list_fail_lists().unwrap();
        assert_eq!(lists.len(), 5);
        assert_eq!(lists[0].name, "list-7");
    }

    #[test]
    fn test_prompt_library_usage_tracking() {
        let (store, _dir) = test_store();

        let prompt = PromptEntry::new("Summarize", "Summarize the following text:");
        store.save_prompt(&prompt).unwrap();
        store.track_prompt_usage(&prompt.id).unwrap();
        store.track_prompt_usage(&prompt.id).unwrap();

        let loaded = store.get_prompt(&prompt.id).unwrap().unwrap();
        assert_eq!(loaded.usage_count, 2);

        store.delete_prompt(&prompt.id).unwrap();
        assert!(store.get_prompt(&prompt.id).unwrap().is_none());
    }

    #[test]
    fn test_board_usage_orders_listing() {
        let (store, _dir) = test_store();
        let settings = crate::config::CouncilSettings::default();

        let first = Board::from_settings("first", &settings);
        let second = Board::from_settings("second", &settings);
        store.save_board(&first).unwrap();
        store.save_board(&second).unwrap();

        store.touch_board_usage(&first.id).unwrap();

        let boards = store.list_boards().unwrap();
        assert_eq!(boards[0].name, "first");
        assert_eq!(boards[0].usage_count, 1);
        assert!(boards[0].last_used_at.is_some());
        assert_eq!(boards[1].usage_count, 0);
    }

    #[test]
    fn test_audit_ordering() {
        let (store, _dir) = test_store();
        for i in 0..4 {
            store
                .append_audit(AuditEvent::new("s1", "log", format!("entry {}", i)))
                .unwrap();
        }
        let log = store.audit_log("s1").unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0].log_message, "entry 0");
        assert_eq!(log[3].log_message, "entry 3");
    }

    #[test]
    fn test_raw_swap_keeps_old_generation() {
        let (store, _dir) = test_store();

        let first = vec![RawBaseModel::from_payload(serde_json::json!({
            "id": "acme/one", "context_length": 1000
        }))];
        store.replace_raw_base_models(&first).unwrap();

        let second = vec![RawBaseModel::from_payload(serde_json::json!({
            "id": "acme/two", "context_length": 2000
        }))];
        store.replace_raw_base_models(&second).unwrap();

        let current = store.raw_base_models().unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].id, "acme/two");

        let old = store.raw_base_models_old().unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].id, "acme/one");
    }

    #[test]
    fn test_unified_upsert_preserves_latency() {
        let (store, _dir) = test_store();

        let base = RawBaseModel::from_payload(serde_json::json!({
            "id": "acme/one", "context_length": 1000
        }));
        let endpoint = crate::registry::types::RawEndpoint::routed_fallback(&base);
        let row = crate::registry::merge::merge_endpoint_first(&base, &endpoint, chrono::Utc::now());

        let stored = store.upsert_unified_model(&row).unwrap();
        store
            .update_unified_latency(&stored.unified_id, |m| {
                m.latency_live_ms = Some(420.0);
                m.latency_live_at = Some(chrono::Utc::now());
            })
            .unwrap();

        // A re-merge without latency data must not clobber the probe.
        let again = store.upsert_unified_model(&row).unwrap();
        assert_eq!(again.latency_live_ms, Some(420.0));
        assert_eq!(again.created_at, stored.created_at);
    }
}
