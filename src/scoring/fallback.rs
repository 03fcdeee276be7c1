//! Local fallback classification.
//!
//! Produces a complete classification with zero network calls. Used whenever
//! the LLM classify call fails permanently or exhausts its retries, and when
//! a workflow aborts before classification ran.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::scoring::{normalize_address, sender_domain};

/// Register inferred from the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Formal,
    Casual,
    Professional,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Formal => "formal",
            Self::Casual => "casual",
            Self::Professional => "professional",
        }
    }
}

/// Free-mail providers; senders there are addressed casually.
const FREE_MAIL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "yahoo.de",
    "yahoo.fr",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "icloud.com",
    "me.com",
    "aol.com",
    "gmx.de",
    "gmx.net",
    "web.de",
    "t-online.de",
    "proton.me",
    "protonmail.com",
    "orange.fr",
    "libero.it",
];

/// Suffixes and labels that identify public administration.
const GOVERNMENT_MARKERS: &[&str] = &[".gov", ".gouv.fr", ".bund.de", ".admin.ch", ".gv.at", ".gob.es", ".gov.it"];

/// Stop words per language used for majority voting.
const LANGUAGE_STOPWORDS: &[(&str, &[&str])] = &[
    ("en", &["the", "and", "you", "is", "are", "to", "of", "for", "please", "with"]),
    ("de", &["der", "die", "und", "ich", "sie", "nicht", "ist", "mit", "bitte", "für"]),
    ("fr", &["le", "la", "les", "et", "vous", "est", "pour", "avec", "merci", "une"]),
    ("es", &["el", "los", "las", "y", "usted", "es", "para", "con", "gracias", "por"]),
    ("it", &["il", "gli", "e", "che", "non", "sono", "per", "con", "grazie", "della"]),
    ("nl", &["de", "het", "een", "en", "ik", "niet", "is", "met", "voor", "bedankt"]),
];

/// Phrases that indicate the sender expects an answer.
const QUESTION_INDICATORS: &[&str] = &[
    // en
    "can you", "could you", "would you", "will you", "let me know", "please confirm",
    "please reply", "do you", "are you", "what do you think", "any update",
    // de
    "können sie", "könnten sie", "kannst du", "könntest du", "bitte um rückmeldung",
    "bitte bestätigen", "haben sie", "wann", "gibt es",
    // fr
    "pouvez-vous", "pourriez-vous", "peux-tu", "merci de confirmer", "merci de me",
    "est-ce que", "avez-vous",
    // es
    "¿", "puede", "podría", "podrías", "me confirma", "quedo atento",
    // it
    "può", "potrebbe", "potresti", "mi fai sapere", "attendo riscontro",
    // nl
    "kunt u", "kun je", "zou u", "laat me weten", "graag een reactie",
];

/// Keyword hints mapping content to well-known category names.
const CATEGORY_HINTS: &[(&str, &[&str])] = &[
    ("Finance", &["invoice", "payment", "receipt", "rechnung", "zahlung", "facture", "factura", "fattura", "factuur"]),
    ("Newsletters", &["newsletter", "unsubscribe", "abmelden", "désabonner", "darse de baja"]),
    ("Travel", &["flight", "booking", "boarding", "hotel", "reservation", "flug", "buchung", "vol", "vuelo"]),
    ("Work", &["meeting", "project", "contract", "proposal", "besprechung", "projekt", "vertrag", "réunion"]),
];

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}']+").expect("word regex is valid"));

/// A complete locally-produced classification.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackClassification {
    pub category: String,
    pub needs_response: bool,
    pub language: String,
    pub tone: Tone,
    pub reasoning: String,
}

/// Classify without the LLM.
///
/// `category_options` constrains the proposed category; `default_category`
/// is used when no hint matches an available option.
pub fn classify_locally(
    sender: &str,
    subject: &str,
    body: &str,
    category_options: &[String],
    default_category: &str,
    cause: &str,
) -> FallbackClassification {
    let text = format!("{subject}\n{body}");
    let language = detect_language(&text).to_string();
    let tone = infer_tone(sender);
    let needs_response = needs_reply(&text);
    let category = hint_category(&text, category_options).unwrap_or_else(|| {
        category_options
            .iter()
            .find(|c| c.eq_ignore_ascii_case(default_category))
            .cloned()
            .or_else(|| category_options.first().cloned())
            .unwrap_or_else(|| default_category.to_string())
    });

    FallbackClassification {
        category,
        needs_response,
        language,
        tone,
        reasoning: format!("Rule-based fallback classification ({cause})"),
    }
}

/// Detect a language code by stop-word voting. Defaults to "en".
pub fn detect_language(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    let words: Vec<&str> = WORD_RE.find_iter(&lower).map(|m| m.as_str()).collect();

    let mut best = ("en", 0usize);
    for (code, stopwords) in LANGUAGE_STOPWORDS {
        let hits = words.iter().filter(|w| stopwords.contains(w)).count();
        if hits > best.1 {
            best = (code, hits);
        }
    }
    best.0
}

/// Infer the tone to use from the sender's domain.
pub fn infer_tone(sender: &str) -> Tone {
    let address = normalize_address(sender);
    let Some(domain) = sender_domain(&address) else {
        return Tone::Professional;
    };

    let dotted = format!(".{domain}");
    if GOVERNMENT_MARKERS
        .iter()
        .any(|m| dotted.ends_with(m) || dotted.contains(&format!("{m}.")))
    {
        Tone::Formal
    } else if FREE_MAIL_DOMAINS.contains(&domain) {
        Tone::Casual
    } else {
        Tone::Professional
    }
}

/// Whether the text reads like it expects an answer.
pub fn needs_reply(text: &str) -> bool {
    if text.contains('?') {
        return true;
    }
    let lower = text.to_lowercase();
    QUESTION_INDICATORS.iter().any(|q| lower.contains(q))
}

fn hint_category(text: &str, options: &[String]) -> Option<String> {
    let lower = text.to_lowercase();
    CATEGORY_HINTS
        .iter()
        .filter(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .find_map(|(name, _)| options.iter().find(|o| o.eq_ignore_ascii_case(name)).cloned())
}

/// A neutral holding reply in the detected language.
pub fn template_reply(language: &str, tone: Tone) -> String {
    match (language, tone) {
        ("de", Tone::Casual) => "Danke für deine Nachricht! Ich melde mich bald bei dir.".into(),
        ("de", _) => "Vielen Dank für Ihre Nachricht. Ich werde mich in Kürze bei Ihnen melden.".into(),
        ("fr", Tone::Casual) => "Merci pour ton message ! Je te réponds très vite.".into(),
        ("fr", _) => "Merci pour votre message. Je reviendrai vers vous dans les plus brefs délais.".into(),
        ("es", _) => "Gracias por su mensaje. Le responderé lo antes posible.".into(),
        ("it", _) => "Grazie per il suo messaggio. Le risponderò al più presto.".into(),
        ("nl", _) => "Bedankt voor uw bericht. Ik kom zo snel mogelijk bij u terug.".into(),
        (_, Tone::Casual) => "Thanks for your message! I'll get back to you soon.".into(),
        _ => "Thank you for your message. I will get back to you shortly.".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> Vec<String> {
        ["Work", "Finance", "Personal", "Other"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn detects_german() {
        assert_eq!(
            detect_language("Sehr geehrte Damen und Herren, ich bitte um die Rechnung für den Monat."),
            "de"
        );
    }

    #[test]
    fn detects_french() {
        assert_eq!(
            detect_language("Bonjour, merci pour votre message et pour la réponse."),
            "fr"
        );
    }

    #[test]
    fn unknown_text_defaults_to_english() {
        assert_eq!(detect_language("12345 !!!"), "en");
    }

    #[test]
    fn tone_from_domain() {
        assert_eq!(infer_tone("office@finanzamt.bund.de"), Tone::Formal);
        assert_eq!(infer_tone("clerk@irs.gov"), Tone::Formal);
        assert_eq!(infer_tone("desk@agency.gov.uk"), Tone::Formal);
        assert_eq!(infer_tone("Friend <pal@gmail.com>"), Tone::Casual);
        assert_eq!(infer_tone("sales@acme.io"), Tone::Professional);
        assert_eq!(infer_tone("not-an-address"), Tone::Professional);
    }

    #[test]
    fn question_indicators_are_multilingual() {
        assert!(needs_reply("Is this ok?"));
        assert!(needs_reply("Können Sie mir den Vertrag schicken."));
        assert!(needs_reply("Pourriez-vous confirmer la date."));
        assert!(!needs_reply("FYI the build is green."));
    }

    #[test]
    fn category_from_hint_when_available() {
        let c = classify_locally("a@b.com", "Invoice 42", "Attached", &options(), "Other", "err");
        assert_eq!(c.category, "Finance");
    }

    #[test]
    fn category_falls_back_to_default_then_first() {
        let c = classify_locally("a@b.com", "Hi", "hello there", &options(), "other", "err");
        assert_eq!(c.category, "Other");

        let no_default = classify_locally("a@b.com", "Hi", "x", &options(), "Missing", "err");
        assert_eq!(no_default.category, "Work");

        let empty = classify_locally("a@b.com", "Hi", "x", &[], "Inbox", "err");
        assert_eq!(empty.category, "Inbox");
    }

    #[test]
    fn reasoning_mentions_cause() {
        let c = classify_locally("a@b.com", "s", "b", &options(), "Other", "invalid request: unsafe");
        assert!(c.reasoning.contains("invalid request: unsafe"));
    }

    #[test]
    fn template_reply_follows_language() {
        assert!(template_reply("de", Tone::Formal).contains("Ihre"));
        assert!(template_reply("en", Tone::Casual).starts_with("Thanks"));
        assert!(template_reply("xx", Tone::Professional).starts_with("Thank you"));
    }
}
