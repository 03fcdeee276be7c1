//! Deterministic priority scoring.
//!
//! Additive, capped rule scheme evaluated without any network call:
//! - sender domain on the high-priority list → +50
//! - urgency keyword in subject or snippet → +30
//! - sender is a user-configured important contact → +40
//!
//! The sum is capped at 100; `is_priority` holds at 70 and above.

pub mod fallback;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Points for a sender on a high-priority domain.
pub const DOMAIN_POINTS: u8 = 50;
/// Points for an urgency keyword hit.
pub const KEYWORD_POINTS: u8 = 30;
/// Points for an important contact.
pub const CONTACT_POINTS: u8 = 40;
/// Maximum score.
pub const MAX_SCORE: u8 = 100;
/// Scores at or above this are priority.
pub const PRIORITY_THRESHOLD: u8 = 70;

/// Default urgency keywords (en, de, fr, es, it, nl).
pub const DEFAULT_URGENCY_KEYWORDS: &[&str] = &[
    "urgent",
    "asap",
    "immediately",
    "emergency",
    "deadline",
    "action required",
    "dringend",
    "eilig",
    "sofort",
    "frist",
    "umgehend",
    "urgence",
    "immédiatement",
    "délai",
    "urgente",
    "inmediato",
    "plazo",
    "subito",
    "scadenza",
    "spoed",
    "onmiddellijk",
];

/// Which rule contributed to a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityRule {
    HighPriorityDomain,
    UrgencyKeyword,
    ImportantContact,
}

impl PriorityRule {
    /// Rule name for logs and reasons.
    pub fn name(&self) -> &'static str {
        match self {
            Self::HighPriorityDomain => "high_priority_domain",
            Self::UrgencyKeyword => "urgency_keyword",
            Self::ImportantContact => "important_contact",
        }
    }

    fn points(&self) -> u8 {
        match self {
            Self::HighPriorityDomain => DOMAIN_POINTS,
            Self::UrgencyKeyword => KEYWORD_POINTS,
            Self::ImportantContact => CONTACT_POINTS,
        }
    }
}

/// A matched rule and what triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityReason {
    pub rule: PriorityRule,
    /// The domain, keyword, or contact that matched.
    pub matched: String,
    pub points: u8,
}

/// Outcome of scoring one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityResult {
    pub score: u8,
    pub is_priority: bool,
    /// Matched rules in evaluation order.
    pub reasons: Vec<PriorityReason>,
}

impl PriorityResult {
    /// Comma-separated rule names, for notification text.
    pub fn reason_names(&self) -> String {
        self.reasons
            .iter()
            .map(|r| r.rule.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Global scoring rules (from configuration).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoringRules {
    /// Lowercased domains; subdomains match too.
    pub high_priority_domains: Vec<String>,
    /// Lowercased keywords, matched as substrings.
    pub urgency_keywords: Vec<String>,
}

impl ScoringRules {
    /// Rules with the default multilingual keyword set and no domains.
    pub fn with_default_keywords() -> Self {
        Self {
            high_priority_domains: Vec::new(),
            urgency_keywords: DEFAULT_URGENCY_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }

    pub fn with_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.high_priority_domains = domains
            .into_iter()
            .map(|d| d.as_ref().trim().trim_start_matches('@').to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        self
    }
}

/// Per-user rules (from the store).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserRules {
    /// Full addresses, or `@domain` entries matching a whole domain.
    pub important_contacts: Vec<String>,
}

/// Stateless rule evaluator.
#[derive(Debug, Clone)]
pub struct PriorityScorer {
    rules: ScoringRules,
}

impl PriorityScorer {
    pub fn new(rules: ScoringRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ScoringRules {
        &self.rules
    }

    /// Score a message.
    pub fn score(
        &self,
        sender: &str,
        subject: &str,
        body_snippet: &str,
        user_rules: &UserRules,
    ) -> PriorityResult {
        let address = normalize_address(sender);
        let domain = sender_domain(&address);
        let mut reasons = Vec::new();

        if let Some(domain) = domain
            && let Some(hit) = self
                .rules
                .high_priority_domains
                .iter()
                .find(|d| domain_matches(domain, d))
        {
            reasons.push(reason(PriorityRule::HighPriorityDomain, hit));
        }

        let subject_lower = subject.to_lowercase();
        let snippet_lower = body_snippet.to_lowercase();
        if let Some(hit) = self.rules.urgency_keywords.iter().find(|k| {
            let k = k.to_lowercase();
            !k.is_empty() && (subject_lower.contains(&k) || snippet_lower.contains(&k))
        }) {
            reasons.push(reason(PriorityRule::UrgencyKeyword, hit));
        }

        if let Some(hit) = user_rules
            .important_contacts
            .iter()
            .find(|c| contact_matches(&address, domain, c))
        {
            reasons.push(reason(PriorityRule::ImportantContact, hit));
        }

        let total: u32 = reasons.iter().map(|r| r.points as u32).sum();
        let score = total.min(MAX_SCORE as u32) as u8;
        let result = PriorityResult {
            score,
            is_priority: score >= PRIORITY_THRESHOLD,
            reasons,
        };

        debug!(
            sender = %address,
            score = result.score,
            is_priority = result.is_priority,
            rules = %result.reason_names(),
            "Priority scored"
        );
        result
    }
}

fn reason(rule: PriorityRule, matched: &str) -> PriorityReason {
    PriorityReason {
        rule,
        matched: matched.to_string(),
        points: rule.points(),
    }
}

/// Extract the bare lowercased address from `Name <addr@host>` forms.
pub fn normalize_address(sender: &str) -> String {
    let trimmed = sender.trim();
    let inner = match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if end > start => &trimmed[start + 1..end],
        _ => trimmed,
    };
    inner.trim().to_lowercase()
}

/// Domain part of a normalized address.
pub fn sender_domain(address: &str) -> Option<&str> {
    address
        .rsplit_once('@')
        .map(|(_, d)| d)
        .filter(|d| !d.is_empty())
}

fn domain_matches(domain: &str, rule: &str) -> bool {
    let rule = rule.trim_start_matches('@');
    domain == rule || domain.ends_with(&format!(".{rule}"))
}

fn contact_matches(address: &str, domain: Option<&str>, contact: &str) -> bool {
    let contact = normalize_address(contact);
    if let Some(rule_domain) = contact.strip_prefix('@') {
        domain.is_some_and(|d| d == rule_domain)
    } else {
        !contact.is_empty() && contact == address
    }
}
