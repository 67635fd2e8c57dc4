//! Prompt builders for the council stages

use crate::state::{Blueprint, DraftRecord};

/// System prompt for a council member's Stage-1 draft.
pub fn member_system_prompt(personality: Option<&str>, instruction: Option<&str>) -> String {
    let mut prompt = format!(
        "You are a council member with the following personality: {}.",
        personality.unwrap_or("Expert AI Assistant")
    );
    if let Some(instruction) = instruction {
        prompt.push_str("\n\nIMPORTANT CURRENT GOAL: ");
        prompt.push_str(instruction);
    }
    prompt
}

/// System prompt for the chairman's blueprint drafting (Stage 0).
pub fn blueprint_system_prompt() -> &'static str {
    r#"You are the Strategic Planner of the council.
Break the user's request into an ordered list of tasks for the council to work through.

Task types: "draft" (answer directly), "analyze" (requires deep reasoning),
"vision" (requires image understanding), "code" (produce code), "refine"
(improve a previous result).

Set "breakpoint": true on a task when a human should review its result
before the council moves on. List "required_skills" from
["reasoning", "vision", "tools", "json_mode", "thinking"] only when a task
genuinely needs them.

Your output must be a JSON object:
{
  "tasks": [
    {"id": "t1", "type": "draft", "label": "what this task should produce", "breakpoint": false, "required_skills": []}
  ]
}

Most requests need exactly one task. Never output more than five."#
}

/// User prompt for blueprint drafting, carrying the prior blueprint when
/// one exists.
pub fn blueprint_user_prompt(query: &str, prior: Option<&Blueprint>) -> String {
    match prior {
        Some(prior) if !prior.tasks.is_empty() => {
            let prior_json = serde_json::to_string(prior).unwrap_or_default();
            format!(
                "Previous task list:\n{}\n\nLatest user request:\n{}",
                prior_json, query
            )
        }
        _ => query.to_string(),
    }
}

/// System prompt for the Stage-2 judging role.
pub fn judge_system_prompt() -> &'static str {
    "You are a critical judge evaluating multiple AI responses."
}

/// Stage-2 ranking prompt over blinded, labeled drafts.
///
/// `own_label` tells the voter which draft is theirs; their ranking must
/// cover every other label.
pub fn ranking_prompt(query: &str, labeled_drafts: &[(char, &DraftRecord)], own_label: char) -> String {
    let responses_text = labeled_drafts
        .iter()
        .map(|(label, draft)| format!("Response {}:\n{}", label, draft.response))
        .collect::<Vec<_>>()
        .join("\n\n");

    let other_count = labeled_drafts.len().saturating_sub(1);

    format!(
        r#"You are evaluating different responses to the following question:

Question: {query}

Here are the responses from different models (anonymized):

{responses_text}

Response {own_label} is your own response. Do NOT include it in your ranking.

Your task:
1. Evaluate each other response: what it does well and what it does poorly.
2. At the very end, rank ALL {other_count} other responses.

IMPORTANT: Your final ranking MUST be formatted EXACTLY as follows:
Ranking: Response X > Response Y > ...

For example, if Response B is best, followed by C:
Ranking: Response B > Response C"#
    )
}

/// System prompt for Stage-3 synthesis.
pub fn synthesis_system_prompt() -> &'static str {
    r#"You are the Chairman of the council.
Review the member responses and the peer rankings, then synthesize one final,
high-quality answer to the user's question. Favor the preferred response but
fold in the strongest points from the others. Answer the user directly; do
not describe the process."#
}

/// Stage-3 context under Borda-Count: all drafts plus the peer evaluations.
pub fn synthesis_context(
    query: &str,
    labeled_drafts: &[(char, &DraftRecord)],
    ranking_texts: &[(String, String)],
    preferred_label: char,
) -> String {
    let mut context = format!("Original User Question: {}\n\n", query);

    context.push_str("Council Member Responses:\n");
    for (label, draft) in labeled_drafts {
        context.push_str(&format!("Response {}:\n{}\n\n", label, draft.response));
    }

    context.push_str("Peer Evaluations and Rankings:\n");
    for (voter, text) in ranking_texts {
        context.push_str(&format!("Judge {}:\n{}\n\n", voter, text));
    }

    context.push_str(&format!(
        "The peer consensus prefers Response {}.\n",
        preferred_label
    ));
    context
}

/// Combined Chairman-Cut prompt: pick a winner among the top drafts and
/// synthesize from it. The reply must begin with the winner declaration so
/// the label survives even terse replies.
pub fn chairman_cut_prompt(query: &str, top_drafts: &[(char, &DraftRecord)]) -> String {
    let responses_text = top_drafts
        .iter()
        .map(|(label, draft)| format!("Response {}:\n{}", label, draft.response))
        .collect::<Vec<_>>()
        .join("\n\n");

    let labels = top_drafts
        .iter()
        .map(|(label, _)| label.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"You are the Chairman of the council. The question was:

{query}

These are the top-rated responses ({labels}), anonymized:

{responses_text}

First line of your reply MUST be exactly "Winner: Response X" naming the
single best response. Then write the final answer to the user's question,
using the winner as its basis."#
    )
}

/// Prompt for generating a short conversation title.
pub fn title_prompt(query: &str) -> String {
    format!(
        r#"Generate a very short title (3-5 words maximum) that summarizes the following question.
The title should be concise and descriptive. Do not use quotes or punctuation in the title.

Question: {}

Title:"#,
        query
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Usage;

    fn draft(text: &str) -> DraftRecord {
        DraftRecord {
            member_id: "a/m".to_string(),
            model_id: "a/m".to_string(),
            wire_id: "a/m".to_string(),
            response: text.to_string(),
            reasoning: None,
            usage: Usage::default(),
            failed: false,
            error: None,
            substituted_from: None,
        }
    }

    #[test]
    fn test_member_prompt_with_instruction() {
        let prompt = member_system_prompt(Some("Deep analytical reasoning"), Some("agree on terms"));
        assert!(prompt.contains("Deep analytical reasoning"));
        assert!(prompt.contains("agree on terms"));
    }

    #[test]
    fn test_ranking_prompt_excludes_self() {
        let d1 = draft("first");
        let d2 = draft("second");
        let labeled = vec![('A', &d1), ('B', &d2)];
        let prompt = ranking_prompt("why?", &labeled, 'A');
        assert!(prompt.contains("Response A is your own response"));
        assert!(prompt.contains("rank ALL 1 other responses"));
    }

    #[test]
    fn test_chairman_cut_prompt_lists_labels() {
        let d1 = draft("first");
        let d2 = draft("second");
        let labeled = vec![('A', &d1), ('C', &d2)];
        let prompt = chairman_cut_prompt("why?", &labeled);
        assert!(prompt.contains("A, C"));
        assert!(prompt.contains("Winner: Response X"));
    }
}
