use crate::config::TemplateConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)[^\s<>]+").expect("valid url regex"));

/// Terms the provider routinely rejects in marketing templates.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "lottery",
    "jackpot",
    "casino",
    "bitcoin giveaway",
    "free money",
    "guaranteed income",
    "payday loan",
    "weight loss pills",
];

#[derive(Debug, Clone)]
pub struct TemplateRules {
    pub max_body_len: usize,
    pub max_urls: usize,
    pub denylist: Vec<String>,
}

impl Default for TemplateRules {
    fn default() -> Self {
        Self::from(&TemplateConfig::default())
    }
}

impl From<&TemplateConfig> for TemplateRules {
    fn from(cfg: &TemplateConfig) -> Self {
        let mut denylist: Vec<String> = DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect();
        denylist.extend(
            cfg.extra_denylist
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty()),
        );
        Self {
            max_body_len: cfg.max_body_len,
            max_urls: cfg.max_urls,
            denylist,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    Empty,
    TooLong { length: usize, max: usize },
    TooManyUrls { count: usize, max: usize },
    DeniedTerm { term: String },
    ControlCharacter { codepoint: u32 },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::Empty => write!(f, "text is empty"),
            Violation::TooLong { length, max } => {
                write!(f, "text length {length} exceeds the maximum of {max} characters")
            }
            Violation::TooManyUrls { count, max } => {
                write!(f, "text contains {count} URLs, at most {max} are allowed")
            }
            Violation::DeniedTerm { term } => {
                write!(f, "text contains the disallowed term \"{term}\"")
            }
            Violation::ControlCharacter { codepoint } => {
                write!(f, "text contains the control character U+{codepoint:04X}")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            is_valid: violations.is_empty(),
            errors: violations.iter().map(|v| v.to_string()).collect(),
            violations,
        }
    }
}

pub fn count_urls(text: &str) -> usize {
    URL_RE.find_iter(text).count()
}

fn contains_term(lowered: &str, term: &str) -> bool {
    let pattern = format!(r"\b{}\b", regex::escape(term));
    Regex::new(&pattern)
        .map(|re| re.is_match(lowered))
        .unwrap_or_else(|_| lowered.contains(term))
}

/// Checks template body text and reports every violation found.
pub fn validate_text(text: &str, rules: &TemplateRules) -> ValidationReport {
    let mut violations = Vec::new();

    if text.trim().is_empty() {
        violations.push(Violation::Empty);
        return ValidationReport::from_violations(violations);
    }

    let length = text.chars().count();
    if length > rules.max_body_len {
        violations.push(Violation::TooLong {
            length,
            max: rules.max_body_len,
        });
    }

    let urls = count_urls(text);
    if urls > rules.max_urls {
        violations.push(Violation::TooManyUrls {
            count: urls,
            max: rules.max_urls,
        });
    }

    let lowered = text.to_lowercase();
    for term in &rules.denylist {
        if contains_term(&lowered, term) {
            violations.push(Violation::DeniedTerm { term: term.clone() });
        }
    }

    let mut seen = Vec::new();
    for ch in text.chars() {
        if ch.is_control() && ch != '\n' && !seen.contains(&ch) {
            seen.push(ch);
            violations.push(Violation::ControlCharacter { codepoint: ch as u32 });
        }
    }

    ValidationReport::from_violations(violations)
}
