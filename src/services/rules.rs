//! Event-type inference rules.
//!
//! A rule is an ordered list of term groups: every group must be satisfied,
//! and a group is satisfied when any of its terms appears in the post's
//! tag/scene vocabulary. Rules are evaluated in order; the first match wins.
//! Rules load from JSON so the set can grow without code changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strsim::jaro_winkler;

use super::merge::normalize_label;

/// Terms shorter than this only match exactly ("sea" must not match "seat").
const MIN_FUZZY_LEN: usize = 4;

// ── Built-in vocabulary ────────────────────────────────────────────────

const PEOPLE: &[&str] = &[
    "person", "people", "man", "woman", "child", "crowd", "group", "friends", "family",
];

const BEACH_SCENES: &[&str] = &["beach", "coast", "shore", "seaside", "ocean", "sand"];

const FOOD_OR_DRINK: &[&str] = &[
    "food", "drink", "beverage", "cocktail", "beer", "wine", "barbecue", "picnic", "snack",
];

const WEDDING: &[&str] = &["wedding", "bride", "groom", "wedding_dress", "wedding_cake"];

const BIRTHDAY: &[&str] = &["birthday", "birthday_cake", "balloon", "candles", "party_hat"];

const CONCERT_VENUES: &[&str] = &["concert", "stage", "festival", "live_music"];

const PERFORMANCE: &[&str] = &["crowd", "audience", "musician", "guitar", "microphone", "performer"];

const SPORTS_VENUES: &[&str] = &["stadium", "arena", "sports_field", "court", "pitch"];

const WORKPLACES: &[&str] = &[
    "office",
    "conference",
    "conference_room",
    "meeting_room",
    "boardroom",
    "workplace",
];

const DINING_VENUES: &[&str] = &["restaurant", "cafe", "dining_room", "bistro"];

const MEALS: &[&str] = &["food", "meal", "dish", "plate", "dinner", "lunch"];

const NATURE: &[&str] = &["mountain", "forest", "trail", "hiking", "lake", "campsite"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRule {
    pub event_type: String,
    /// All groups must match; a group matches when any of its terms does.
    pub requires: Vec<Vec<String>>,
    #[serde(default)]
    pub enhanced_tags: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Failed to read rule file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse rules: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid rule `{event_type}`: {reason}")]
    Invalid { event_type: String, reason: String },
}

/// Ordered, first-match-wins rule list.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<EventRule>,
    threshold: f64,
}

fn terms(list: &[&str]) -> Vec<String> {
    list.iter().map(|t| t.to_string()).collect()
}

fn rule(event_type: &str, requires: &[&[&str]], enhanced: &[&str]) -> EventRule {
    EventRule {
        event_type: event_type.to_string(),
        requires: requires.iter().map(|group| terms(group)).collect(),
        enhanced_tags: terms(enhanced),
    }
}

/// Default rules in priority order.
pub fn builtin_rules() -> Vec<EventRule> {
    vec![
        rule("wedding", &[WEDDING], &["celebration", "formal", "social_gathering"]),
        rule(
            "birthday_party",
            &[BIRTHDAY, PEOPLE],
            &["celebration", "social_gathering"],
        ),
        rule(
            "beach_party",
            &[BEACH_SCENES, PEOPLE, FOOD_OR_DRINK],
            &["outdoor", "social_gathering", "summer"],
        ),
        rule(
            "concert",
            &[CONCERT_VENUES, PERFORMANCE],
            &["entertainment", "music", "social_gathering"],
        ),
        rule("sports_event", &[SPORTS_VENUES, PEOPLE], &["competition", "sports"]),
        rule("meeting", &[WORKPLACES, PEOPLE], &["professional", "work"]),
        rule("dining", &[DINING_VENUES, MEALS], &["dining", "food"]),
        rule(
            "outdoor_adventure",
            &[NATURE, PEOPLE],
            &["adventure", "nature", "outdoor"],
        ),
    ]
}

impl RuleSet {
    /// Validate and normalize rules. Terms and enhanced tags go through the
    /// same normalization as stage labels.
    pub fn new(rules: Vec<EventRule>, threshold: f64) -> Result<Self, RuleError> {
        let rules = rules
            .into_iter()
            .map(|mut r| {
                let name = r.event_type.clone();
                let invalid = |reason: &str| RuleError::Invalid {
                    event_type: name.clone(),
                    reason: reason.to_string(),
                };
                r.event_type = normalize_label(&r.event_type);
                if r.event_type.is_empty() {
                    return Err(invalid("empty event type"));
                }
                if r.requires.is_empty() {
                    return Err(invalid("no term groups"));
                }
                for group in &mut r.requires {
                    *group = group
                        .iter()
                        .map(|t| normalize_label(t))
                        .filter(|t| !t.is_empty())
                        .collect();
                    if group.is_empty() {
                        return Err(invalid("empty term group"));
                    }
                }
                r.enhanced_tags = r
                    .enhanced_tags
                    .iter()
                    .map(|t| normalize_label(t))
                    .filter(|t| !t.is_empty())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                Ok(r)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules,
            threshold: threshold.clamp(0.0, 1.0),
        })
    }

    pub fn builtin(threshold: f64) -> Self {
        Self::new(builtin_rules(), threshold).expect("built-in rules are valid")
    }

    pub fn from_json(json: &str, threshold: f64) -> Result<Self, RuleError> {
        let rules: Vec<EventRule> = serde_json::from_str(json)?;
        Self::new(rules, threshold)
    }

    /// Load rules from `path`, or the built-in set when no path is given.
    pub fn load(path: Option<&str>, threshold: f64) -> Result<Self, RuleError> {
        match path {
            Some(path) => {
                let json = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
                    path: path.to_string(),
                    source,
                })?;
                Self::from_json(&json, threshold)
            }
            None => Ok(Self::builtin(threshold)),
        }
    }

    pub fn rules(&self) -> &[EventRule] {
        &self.rules
    }

    /// First rule whose every group is satisfied by `vocabulary`.
    pub fn infer(&self, vocabulary: &BTreeSet<String>) -> Option<&EventRule> {
        self.rules.iter().find(|rule| {
            rule.requires
                .iter()
                .all(|group| group.iter().any(|term| self.term_matches(term, vocabulary)))
        })
    }

    fn term_matches(&self, term: &str, vocabulary: &BTreeSet<String>) -> bool {
        if vocabulary.contains(term) {
            return true;
        }
        if self.threshold >= 1.0 || term.len() < MIN_FUZZY_LEN {
            return false;
        }
        vocabulary
            .iter()
            .filter(|label| label.len() >= MIN_FUZZY_LEN)
            .any(|label| jaro_winkler(term, label) >= self.threshold)
    }
}
