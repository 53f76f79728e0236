//! Free-text symptom classification.
//!
//! A symptom description is scanned for whole-word keywords grouped into five
//! categories. The result is reported back to the caller and lets the router
//! add fetchers a service health check alone would not choose.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymptomCategory {
    Infrastructure,
    Service,
    Task,
    Application,
    Network,
}

impl SymptomCategory {
    pub const ALL: [SymptomCategory; 5] = [
        SymptomCategory::Infrastructure,
        SymptomCategory::Service,
        SymptomCategory::Task,
        SymptomCategory::Application,
        SymptomCategory::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SymptomCategory::Infrastructure => "infrastructure",
            SymptomCategory::Service => "service",
            SymptomCategory::Task => "task",
            SymptomCategory::Application => "application",
            SymptomCategory::Network => "network",
        }
    }

    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            SymptomCategory::Infrastructure => &[
                "stack",
                "cloudformation",
                "deploy",
                "creation",
                "infrastructure",
                "rollback",
            ],
            SymptomCategory::Service => &["service", "deployment", "unstable", "events"],
            SymptomCategory::Task => &[
                "task", "container", "failing", "crash", "exit", "restart", "image", "pull",
            ],
            SymptomCategory::Application => {
                &["error", "exception", "log", "application", "code", "bug"]
            }
            SymptomCategory::Network => &[
                "network",
                "connection refused",
                "connection",
                "unreachable",
                "timeout",
                "timed out",
                "load balancer",
                "unhealthy",
            ],
        }
    }
}

impl std::fmt::Display for SymptomCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One keyword found in the symptom text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedSymptom {
    pub category: SymptomCategory,
    pub keyword: String,
}

/// Whole-word, case-insensitive matcher for `words`. Spaces inside a keyword
/// match any run of whitespace; `suffix` is an optional inflection group.
pub(crate) fn keyword_regex(words: &[&str], suffix: &str) -> Option<Regex> {
    let alternatives: Vec<String> = words
        .iter()
        .map(|w| {
            w.split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+")
        })
        .collect();
    Regex::new(&format!(r"(?i)\b(?:{}){suffix}\b", alternatives.join("|"))).ok()
}

struct KeywordRule {
    category: SymptomCategory,
    keyword: &'static str,
    regex: Regex,
}

fn rules() -> &'static [KeywordRule] {
    static RULES: OnceLock<Vec<KeywordRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        SymptomCategory::ALL
            .iter()
            .flat_map(|category| category.keywords().iter().map(move |k| (*category, *k)))
            .filter_map(|(category, keyword)| {
                keyword_regex(&[keyword], "(?:s|es|ed|ing)?").map(|regex| KeywordRule {
                    category,
                    keyword,
                    regex,
                })
            })
            .collect()
    })
}

/// Keywords found in `symptom`, in category order. A keyword contained in a
/// longer matched phrase of the same category ("connection" inside
/// "connection refused") is still reported.
pub fn detect(symptom: &str) -> Vec<DetectedSymptom> {
    if symptom.trim().is_empty() {
        return Vec::new();
    }
    rules()
        .iter()
        .filter(|rule| rule.regex.is_match(symptom))
        .map(|rule| DetectedSymptom {
            category: rule.category,
            keyword: rule.keyword.to_string(),
        })
        .collect()
}

/// Whether any detected keyword belongs to `category`.
pub fn mentions(detected: &[DetectedSymptom], category: SymptomCategory) -> bool {
    detected.iter().any(|d| d.category == category)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories(symptom: &str) -> Vec<SymptomCategory> {
        let mut found: Vec<SymptomCategory> =
            detect(symptom).iter().map(|d| d.category).collect();
        found.dedup();
        found
    }

    #[test]
    fn test_every_keyword_compiles() {
        let total: usize = SymptomCategory::ALL.iter().map(|c| c.keywords().len()).sum();
        assert_eq!(rules().len(), total);
    }

    #[test]
    fn test_categories_from_mixed_text() {
        assert_eq!(
            categories("Stack rollback, then containers crashed on exit"),
            vec![SymptomCategory::Infrastructure, SymptomCategory::Task]
        );
        assert_eq!(
            categories("connection refused, load  balancer marks targets unhealthy"),
            vec![SymptomCategory::Network]
        );
        let found = detect("requests timed out");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].keyword, "timed out");
    }

    #[test]
    fn test_keywords_match_whole_words_only() {
        // "log" in "catalog", "code" in "decoded", "exit" in "existing"
        assert!(detect("catalog page decoded for existing users").is_empty());
        assert!(detect("   ").is_empty());
        assert_eq!(detect("Restarting")[0].keyword, "restart");
    }
}
