//! Prompt construction and response parsing.

use crate::error::LlmError;
use crate::llm::LlmClassification;
use crate::retrieval::ContextBundle;
use crate::scoring::PriorityResult;

/// Max body characters sent to the model.
const BODY_PREVIEW_CHARS: usize = 2000;
/// Max characters per context message.
const CONTEXT_PREVIEW_CHARS: usize = 300;

/// A system/user prompt pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// The message fields a prompt is built from.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationInput<'a> {
    pub sender: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub category_options: &'a [String],
}

// ── Prompt construction ─────────────────────────────────────────────

/// Build the classification prompt.
pub fn classification_prompt(input: &ClassificationInput<'_>) -> Prompt {
    let system = format!(
        "You are an email triage engine. Classify the message into exactly one category.\n\n\
         Categories: {}\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"category\": \"...\", \"reasoning\": \"...\", \"needs_response\": true, \
         \"priority_hint\": \"high|normal|low\", \"confidence\": 0.0, \
         \"language\": \"en\", \"tone\": \"formal|casual|professional\", \"draft\": \"...\"}}\n\n\
         Rules:\n\
         - \"category\" must be one of the listed categories\n\
         - \"reasoning\" is one sentence\n\
         - \"needs_response\" is true only if the sender expects an answer\n\
         - \"language\" is the ISO 639-1 code of the message\n\
         - Include \"draft\" only when a reply is needed, in the message's language",
        input.category_options.join(", ")
    );

    let mut user = String::with_capacity(512);
    user.push_str(&format!("From: {}\n", input.sender));
    user.push_str(&format!("Subject: {}\n", input.subject));
    let preview: String = input.body.chars().take(BODY_PREVIEW_CHARS).collect();
    user.push_str(&format!("\nMessage:\n{preview}"));

    Prompt { system, user }
}

/// Build the draft-generation prompt.
pub fn draft_prompt(
    input: &ClassificationInput<'_>,
    category: &str,
    language: &str,
    tone: &str,
    priority: Option<&PriorityResult>,
    context: &ContextBundle,
) -> Prompt {
    let system = format!(
        "You write email replies on behalf of the user.\n\n\
         Rules:\n\
         - Reply in the language with code \"{language}\"\n\
         - Use a {tone} tone\n\
         - Be concise and concrete; do not invent facts or commitments\n\
         - Output ONLY the reply body, no subject line, no commentary"
    );

    let mut user = String::with_capacity(1024);
    user.push_str(&format!("From: {}\n", input.sender));
    user.push_str(&format!("Subject: {}\n", input.subject));
    user.push_str(&format!("Category: {category}\n"));
    if let Some(p) = priority
        && p.is_priority
    {
        user.push_str(&format!("Priority: high ({})\n", p.reason_names()));
    }

    if !context.thread_history.is_empty() {
        user.push_str("\nEarlier in this thread:\n");
        for (i, msg) in context.thread_history.iter().enumerate() {
            let preview: String = msg.body.chars().take(CONTEXT_PREVIEW_CHARS).collect();
            user.push_str(&format!("  [{}] {}: {}\n", i + 1, msg.sender, preview));
        }
    }

    if !context.semantic_results.is_empty() {
        user.push_str("\nRelated past messages:\n");
        for r in &context.semantic_results {
            let preview: String = r.snippet.chars().take(CONTEXT_PREVIEW_CHARS).collect();
            user.push_str(&format!("  - {} ({}): {}\n", r.subject, r.sender, preview));
        }
    }

    let preview: String = input.body.chars().take(BODY_PREVIEW_CHARS).collect();
    user.push_str(&format!("\nMessage to answer:\n{preview}"));

    Prompt { system, user }
}

// ── Response parsing ────────────────────────────────────────────────

/// Parse the model's classification answer.
pub fn parse_classification(provider: &str, text: &str) -> Result<LlmClassification, LlmError> {
    let json = extract_json_object(text);
    let parsed: LlmClassification =
        serde_json::from_str(&json).map_err(|e| LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: format!("classification is not valid JSON: {e}"),
        })?;

    if parsed.category.trim().is_empty() {
        return Err(LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: "classification has an empty category".into(),
        });
    }
    Ok(parsed)
}

/// Strip code fences and surrounding whitespace from a generated draft.
pub fn clean_draft(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
        return rest.trim_end_matches("```").trim().to_string();
    }
    trimmed.to_string()
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::RankedContext;
    use crate::store::HistoryMessage;
    use chrono::Utc;

    fn options() -> Vec<String> {
        vec!["Work".into(), "Finance".into(), "Other".into()]
    }

    #[test]
    fn classification_prompt_lists_categories() {
        let opts = options();
        let input = ClassificationInput {
            sender: "alice@example.com",
            subject: "Invoice",
            body: "Please pay",
            category_options: &opts,
        };
        let p = classification_prompt(&input);
        assert!(p.system.contains("Work, Finance, Other"));
        assert!(p.user.contains("alice@example.com"));
        assert!(p.user.contains("Please pay"));
    }

    #[test]
    fn draft_prompt_includes_context() {
        let opts = options();
        let input = ClassificationInput {
            sender: "bob@x.com",
            subject: "Re: plan",
            body: "Can we meet?",
            category_options: &opts,
        };
        let bundle = ContextBundle {
            thread_history: vec![HistoryMessage {
                item_id: "h".into(),
                sender: "bob@x.com".into(),
                subject: "plan".into(),
                body: "first draft of the plan".into(),
                received_at: Utc::now(),
            }],
            semantic_results: vec![RankedContext {
                item_id: "s".into(),
                sender: "carol@x.com".into(),
                subject: "older plan".into(),
                snippet: "we met last quarter".into(),
                received_at: Utc::now(),
                similarity: 0.9,
                recency: 0.5,
                fused: 0.78,
            }],
            retrieval_window_days: 60,
            token_budget_used: 20,
        };
        let p = draft_prompt(&input, "Work", "de", "formal", None, &bundle);
        assert!(p.system.contains("\"de\""));
        assert!(p.system.contains("formal"));
        assert!(p.user.contains("first draft of the plan"));
        assert!(p.user.contains("we met last quarter"));
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "Sure:\n```json\n{\"category\": \"Work\", \"reasoning\": \"r\", \"needs_response\": true, \"confidence\": 0.9}\n```";
        let c = parse_classification("test", raw).unwrap();
        assert_eq!(c.category, "Work");
        assert!(c.needs_response);
        assert_eq!(c.confidence, Some(0.9));
        assert!(c.draft.is_none());
    }

    #[test]
    fn missing_optional_fields_default() {
        let c = parse_classification("test", "{\"category\": \"Other\"}").unwrap();
        assert!(!c.needs_response);
        assert_eq!(c.reasoning, "");
    }

    #[test]
    fn garbage_is_invalid_response() {
        let err = parse_classification("test", "I cannot help with that").unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
        let empty = parse_classification("test", "{\"category\": \"  \"}").unwrap_err();
        assert!(matches!(empty, LlmError::InvalidResponse { .. }));
    }

    #[test]
    fn clean_draft_strips_fences() {
        assert_eq!(clean_draft("```\nHello there\n```"), "Hello there");
        assert_eq!(clean_draft("```text\nHi\n```"), "Hi");
        assert_eq!(clean_draft("  plain  "), "plain");
    }
}
