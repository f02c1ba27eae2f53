//! Rule matching for candidate emails.
//!
//! Runs before any AI call: the highest-priority enabled rule whose
//! sender and subject patterns both match picks the extraction template
//! for the email. No match means the email is skipped and recorded with
//! reason "no matching rule".

use tracing::debug;

use crate::store::ProcessingRule;

/// Select the rule for an email, or `None` to skip it.
///
/// A rule matches when its sender pattern is empty or a case-insensitive
/// substring of `sender`, and its subject pattern likewise of `subject`.
/// Disabled rules never match. The highest priority wins; ties keep the
/// order the rules arrived in.
pub fn match_rule<'a>(
    sender: &str,
    subject: &str,
    rules: &'a [ProcessingRule],
) -> Option<&'a ProcessingRule> {
    let mut candidates: Vec<&ProcessingRule> = rules.iter().filter(|r| r.enabled).collect();
    // Stable sort, so equal priorities stay in input order.
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

    let sender = sender.to_lowercase();
    let subject = subject.to_lowercase();
    let matched = candidates.into_iter().find(|rule| {
        pattern_matches(&rule.sender_pattern, &sender)
            && pattern_matches(&rule.subject_pattern, &subject)
    });

    match matched {
        Some(rule) => debug!(rule = %rule.name, priority = rule.priority, "Email matched rule"),
        None => debug!(%sender, "No rule matched email"),
    }
    matched
}

/// Empty patterns are wildcards. `haystack` must already be lowercased.
fn pattern_matches(pattern: &str, haystack: &str) -> bool {
    let pattern = pattern.trim();
    pattern.is_empty() || haystack.contains(&pattern.to_lowercase())
}
