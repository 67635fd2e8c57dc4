//! Audit bundle export
//!
//! Writes everything the audit viewer needs for one conversation into a
//! timestamped export directory: the chronological log entries as
//! individual JSON files, the full conversation history, and the latest
//! session snapshot.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;

use crate::state::{SessionStore, StoreError};

/// Error type for audit export
#[derive(Debug, thiserror::Error)]
pub enum AuditExportError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Export a conversation's audit bundle under `output_dir`.
///
/// Returns the created bundle directory:
/// `audit_{conversation_id}_{timestamp}/` containing `logs/`,
/// `conversation_history.json`, and `session_state.json`.
pub fn export_audit_bundle(
    store: &SessionStore,
    conversation_id: &str,
    output_dir: impl AsRef<Path>,
) -> Result<PathBuf, AuditExportError> {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let bundle_dir = output_dir
        .as_ref()
        .join(format!("audit_{}_{}", conversation_id, timestamp));
    let logs_dir = bundle_dir.join("logs");
    std::fs::create_dir_all(&logs_dir)?;

    // Individual log files, prefixed for chronological ordering.
    let events = store.audit_log(conversation_id)?;
    for (index, event) in events.iter().enumerate() {
        let timestamp = event
            .timestamp
            .format("%Y%m%d_%H%M%S%.3f")
            .to_string()
            .replace('.', "-");
        let model = event
            .model_id
            .as_deref()
            .unwrap_or("unknown")
            .rsplit('/')
            .next()
            .unwrap_or("unknown");
        let filename = format!("{}_{:03}_{}_{}.json", timestamp, index, event.step, model);
        let content = serde_json::to_string_pretty(event)?;
        std::fs::write(logs_dir.join(filename), content)?;
    }

    // Full conversation history.
    let messages = store.conversation_messages(conversation_id)?;
    let history: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            json!({
                "role": m.role,
                "content": m.content,
                "timestamp": m.created_at,
            })
        })
        .collect();
    std::fs::write(
        bundle_dir.join("conversation_history.json"),
        serde_json::to_string_pretty(&history)?,
    )?;

    // Latest session snapshot.
    let session_state = store.get_session_state(conversation_id)?;
    std::fs::write(
        bundle_dir.join("session_state.json"),
        serde_json::to_string_pretty(&session_state)?,
    )?;

    Ok(bundle_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AuditEvent, Blueprint, Message, SessionState};
    use tempfile::tempdir;

    #[test]
    fn test_export_bundle_layout() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("db")).unwrap();

        let conversation = store.create_conversation(None).unwrap();
        store
            .append_message(&conversation.id, Message::user("question"))
            .unwrap();
        store
            .save_session(&conversation.id, &SessionState::new(Blueprint::single_draft("q")))
            .unwrap();
        store
            .append_audit(
                AuditEvent::new(&conversation.id, "stage1_draft", "member answered")
                    .with_model("openai/gpt-4o:deep_infra"),
            )
            .unwrap();

        let bundle = export_audit_bundle(&store, &conversation.id, dir.path().join("exports")).unwrap();

        assert!(bundle.join("conversation_history.json").exists());
        assert!(bundle.join("session_state.json").exists());

        let logs: Vec<_> = std::fs::read_dir(bundle.join("logs")).unwrap().collect();
        assert_eq!(logs.len(), 1);
        let name = logs[0].as_ref().unwrap().file_name();
        let name = name.to_string_lossy().to_string();
        assert!(name.contains("stage1_draft"));
        assert!(name.ends_with("deep_infra.json"));
    }

    #[test]
    fn test_export_empty_conversation() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("db")).unwrap();
        let conversation = store.create_conversation(None).unwrap();

        let bundle = export_audit_bundle(&store, &conversation.id, dir.path().join("exports")).unwrap();
        let history = std::fs::read_to_string(bundle.join("conversation_history.json")).unwrap();
        assert_eq!(history.trim(), "[]");
    }
}
