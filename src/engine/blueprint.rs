//! Blueprint parsing
//!
//! The chairman's Stage-0 output must parse as a task list. Markdown fences
//! are tolerated; anything else that fails to parse falls back to the
//! default single-draft blueprint at the call site.

use serde::Deserialize;

use crate::state::{Blueprint, TaskSpec};

/// Hard cap on tasks per blueprint; chairman output beyond it is truncated.
const MAX_BLUEPRINT_TASKS: usize = 5;

/// Error type for blueprint parsing
#[derive(Debug, thiserror::Error)]
pub enum BlueprintParseError {
    #[error("blueprint JSON did not parse: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blueprint contained no tasks")]
    Empty,
}

#[derive(Deserialize)]
struct BlueprintPayload {
    tasks: Vec<TaskSpec>,
    #[serde(default)]
    edges: Vec<(usize, usize)>,
}

/// Parse a chairman reply into a blueprint.
pub fn parse_blueprint(content: &str) -> Result<Blueprint, BlueprintParseError> {
    let stripped = strip_code_fences(content);
    let payload: BlueprintPayload = serde_json::from_str(stripped.trim())?;

    if payload.tasks.is_empty() {
        return Err(BlueprintParseError::Empty);
    }

    let mut tasks = payload.tasks;
    tasks.truncate(MAX_BLUEPRINT_TASKS);

    Ok(Blueprint {
        tasks,
        edges: payload.edges,
    })
}

/// Pull the payload out of a ```json fence when the model wrapped it.
fn strip_code_fences(content: &str) -> &str {
    for marker in ["```json", "```"] {
        if let Some(start) = content.find(marker) {
            let after = &content[start + marker.len()..];
            if let Some(end) = after.find("```") {
                return &after[..end];
            }
        }
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskKind;

    #[test]
    fn test_parse_plain_json() {
        let content = r#"{"tasks": [{"id": "t1", "type": "draft", "label": "answer the question"}]}"#;
        let blueprint = parse_blueprint(content).unwrap();
        assert_eq!(blueprint.tasks.len(), 1);
        assert_eq!(blueprint.tasks[0].kind, TaskKind::Draft);
        assert!(!blueprint.tasks[0].breakpoint);
    }

    #[test]
    fn test_parse_fenced_json() {
        let content = "Here is the plan:\n```json\n{\"tasks\": [{\"type\": \"analyze\", \"label\": \"compare\", \"breakpoint\": true}]}\n```\nDone.";
        let blueprint = parse_blueprint(content).unwrap();
        assert_eq!(blueprint.tasks[0].kind, TaskKind::Analyze);
        assert!(blueprint.tasks[0].breakpoint);
        // Missing ids are generated.
        assert!(!blueprint.tasks[0].id.is_empty());
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert!(parse_blueprint("I think we should just answer.").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_tasks() {
        let err = parse_blueprint(r#"{"tasks": []}"#).unwrap_err();
        assert!(matches!(err, BlueprintParseError::Empty));
    }

    #[test]
    fn test_parse_truncates_runaway_plans() {
        let tasks: Vec<String> = (0..9)
            .map(|i| format!(r#"{{"type": "draft", "label": "t{}"}}"#, i))
            .collect();
        let content = format!(r#"{{"tasks": [{}]}}"#, tasks.join(","));
        let blueprint = parse_blueprint(&content).unwrap();
        assert_eq!(blueprint.tasks.len(), 5);
    }

    #[test]
    fn test_parse_edges() {
        let content = r#"{"tasks": [{"type": "draft", "label": "a"}, {"type": "refine", "label": "b"}], "edges": [[0, 1]]}"#;
        let blueprint = parse_blueprint(content).unwrap();
        assert_eq!(blueprint.edges, vec![(0, 1)]);
    }
}
