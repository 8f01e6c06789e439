//! Input and counter validation for mission phases.
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::catalog::{CounterSpec, PhaseAction};

/// How a free-text answer is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Trimmed input must equal the pattern.
    Exact,
    /// Pattern must be found somewhere in the trimmed input.
    Regex,
    /// Any non-blank input is accepted.
    Any,
}

/// Declared rule for an `input` phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(rename = "type")]
    pub kind: RuleKind,
    /// Required for `exact` and `regex`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pattern: String,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ValidationRule {
    #[must_use]
    pub fn any() -> Self {
        Self::new(RuleKind::Any, "")
    }

    #[must_use]
    pub fn exact(pattern: &str) -> Self {
        Self::new(RuleKind::Exact, pattern)
    }

    #[must_use]
    pub fn regex(pattern: &str) -> Self {
        Self::new(RuleKind::Regex, pattern)
    }

    fn new(kind: RuleKind, pattern: &str) -> Self {
        Self {
            kind,
            pattern: pattern.to_string(),
            case_sensitive: false,
            error_message: None,
        }
    }

    #[must_use]
    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    #[must_use]
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = Some(message.to_string());
        self
    }

    /// Whether the rule needs a non-empty pattern to be meaningful.
    #[must_use]
    pub const fn requires_pattern(&self) -> bool {
        matches!(self.kind, RuleKind::Exact | RuleKind::Regex)
    }

    fn failure_message(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| default_error(self.kind).to_string())
    }
}

/// Result of validating a phase submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationOutcome {
    #[must_use]
    pub const fn accepted() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(message.into()),
        }
    }
}

#[must_use]
pub const fn default_error(kind: RuleKind) -> &'static str {
    match kind {
        RuleKind::Any => "Please enter a response.",
        RuleKind::Exact => "That answer is not quite right.",
        RuleKind::Regex => "That answer does not match what we are looking for.",
    }
}

const ZONE_ERROR: &str = "Pick one of the highlighted zones.";

/// Validate raw `input` against an optional rule. No rule means always valid.
#[must_use]
pub fn validate(input: &str, rule: Option<&ValidationRule>) -> ValidationOutcome {
    let Some(rule) = rule else {
        return ValidationOutcome::accepted();
    };
    if matches_rule(input.trim(), rule) {
        ValidationOutcome::accepted()
    } else {
        ValidationOutcome::rejected(rule.failure_message())
    }
}

fn matches_rule(trimmed: &str, rule: &ValidationRule) -> bool {
    match rule.kind {
        RuleKind::Any => !trimmed.is_empty(),
        RuleKind::Exact => {
            if rule.case_sensitive {
                trimmed == rule.pattern
            } else {
                trimmed.to_lowercase() == rule.pattern.to_lowercase()
            }
        }
        RuleKind::Regex => {
            match RegexBuilder::new(&rule.pattern)
                .case_insensitive(!rule.case_sensitive)
                .build()
            {
                Ok(re) => re.is_match(trimmed),
                Err(err) => {
                    log::warn!("rejecting input: pattern {:?} does not compile: {err}", rule.pattern);
                    false
                }
            }
        }
    }
}

/// Valid once the counter has reached the cumulative target.
#[must_use]
pub fn check_counter(progress: i64, spec: &CounterSpec) -> ValidationOutcome {
    if progress >= spec.target {
        ValidationOutcome::accepted()
    } else {
        ValidationOutcome::rejected(format!(
            "Keep going: {progress}/{} {}",
            spec.target, spec.key
        ))
    }
}

fn check_zone(trimmed: &str, zones: &[String], error_message: Option<&str>) -> ValidationOutcome {
    let picked = trimmed.to_lowercase();
    if !picked.is_empty() && zones.iter().any(|zone| zone.to_lowercase() == picked) {
        ValidationOutcome::accepted()
    } else {
        ValidationOutcome::rejected(error_message.unwrap_or(ZONE_ERROR))
    }
}

/// Validate a submission for any phase action.
///
/// `counter` is only consulted for counter phases and receives the counter key.
pub fn validate_action<F>(action: &PhaseAction, input: &str, counter: F) -> ValidationOutcome
where
    F: FnOnce(&str) -> i64,
{
    match action {
        PhaseAction::Input { rule } => validate(input, rule.as_ref()),
        PhaseAction::Confirm => ValidationOutcome::accepted(),
        PhaseAction::Counter(spec) => check_counter(counter(&spec.key), spec),
        PhaseAction::SelectZone {
            zones,
            error_message,
        } => check_zone(input.trim(), zones, error_message.as_deref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_rule_is_always_valid() {
        assert!(validate("", None).valid);
    }

    #[test]
    fn any_rule_requires_visible_text() {
        let rule = ValidationRule::any();
        assert!(!validate("", Some(&rule)).valid);
        assert!(!validate("   \t", Some(&rule)).valid);
        assert!(validate(" x ", Some(&rule)).valid);
    }

    #[test]
    fn exact_rule_ignores_case_by_default() {
        let rule = ValidationRule::exact("roma");
        assert!(validate("Roma", Some(&rule)).valid);
        assert!(validate("  ROMA ", Some(&rule)).valid);
        assert!(!validate("Romania", Some(&rule)).valid);

        let strict = rule.case_sensitive(true);
        let outcome = validate("Roma", Some(&strict));
        assert!(!outcome.valid);
        assert_eq!(
            outcome.error.as_deref(),
            Some(default_error(RuleKind::Exact))
        );
    }

    #[test]
    fn regex_rule_searches_unanchored() {
        let rule = ValidationRule::regex("bar");
        assert!(validate("foobar", Some(&rule)).valid);
        assert!(validate("FOOBAR", Some(&rule)).valid);

        let anchored = ValidationRule::regex("^bar$");
        assert!(!validate("foobar", Some(&anchored)).valid);
        assert!(validate(" bar ", Some(&anchored)).valid);

        let strict = ValidationRule::regex("bar").case_sensitive(true);
        assert!(!validate("FOOBAR", Some(&strict)).valid);
    }

    #[test]
    fn malformed_regex_fails_closed() {
        let rule = ValidationRule::regex("([unclosed").with_error_message("Try again");
        let outcome = validate("([unclosed", Some(&rule));
        assert!(!outcome.valid);
        assert_eq!(outcome.error.as_deref(), Some("Try again"));
    }

    #[test]
    fn counter_check_uses_cumulative_target() {
        let spec = CounterSpec {
            key: "steps".to_string(),
            target: 10,
        };
        assert!(!check_counter(9, &spec).valid);
        assert!(check_counter(10, &spec).valid);
        assert!(check_counter(25, &spec).valid);
    }

    #[test]
    fn validate_action_dispatches_every_variant() {
        let confirm = PhaseAction::Confirm;
        assert!(validate_action(&confirm, "", |_| 0).valid);

        let input = PhaseAction::Input {
            rule: Some(ValidationRule::any()),
        };
        assert!(!validate_action(&input, " ", |_| 0).valid);

        let counter = PhaseAction::Counter(CounterSpec {
            key: "photos".to_string(),
            target: 3,
        });
        assert!(validate_action(&counter, "", |key| if key == "photos" { 3 } else { 0 }).valid);
        assert!(!validate_action(&counter, "", |_| 2).valid);

        let zone = PhaseAction::SelectZone {
            zones: vec!["north".to_string(), "harbour".to_string()],
            error_message: None,
        };
        assert!(validate_action(&zone, " Harbour ", |_| 0).valid);
        let miss = validate_action(&zone, "south", |_| 0);
        assert_eq!(miss.error.as_deref(), Some(ZONE_ERROR));
    }
}
