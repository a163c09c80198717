//! Tag-based test segmentation against the active mode.
//!
//! Tests carry lightweight string markers (`@visual`, `@flaky`,
//! `@critical`, ...) embedded in their titles or supplied as explicit
//! metadata. Matching is a set-membership test, deliberately not a regex
//! engine, so there is no ordering ambiguity.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mode::TestModeConfig;

/// A normalized test tag: lowercase, no leading `@`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(
            raw.as_ref()
                .trim()
                .trim_start_matches('@')
                .to_ascii_lowercase(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn visual() -> Self {
        Tag::new("visual")
    }

    pub fn flaky() -> Self {
        Tag::new("flaky")
    }

    pub fn critical() -> Self {
        Tag::new("critical")
    }

    pub fn slow() -> Self {
        Tag::new("slow")
    }

    pub fn performance() -> Self {
        Tag::new("performance")
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl From<&str> for Tag {
    fn from(raw: &str) -> Self {
        Tag::new(raw)
    }
}

/// Extract `@tag` markers from a test title.
///
/// Tokens starting with `@` become tags; everything else is prose.
pub fn extract_tags(title: &str) -> BTreeSet<Tag> {
    title
        .split_whitespace()
        .filter(|token| token.starts_with('@') && token.len() > 1)
        .map(Tag::new)
        .collect()
}

/// Why a test was skipped under the active mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Tagged `@visual` while the active mode disables visual testing.
    VisualTestingDisabled,
    /// The mode's include set is non-empty and the test matches none of it.
    NotIncluded,
    /// The test matches a tag in the mode's exclude set.
    Excluded(Tag),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::VisualTestingDisabled => {
                write!(f, "visual testing disabled in active mode")
            }
            SkipReason::NotIncluded => write!(f, "no tag matches the mode's include set"),
            SkipReason::Excluded(tag) => write!(f, "tag {tag} is excluded by the active mode"),
        }
    }
}

/// Decide whether a test runs under the given mode config.
///
/// Skip iff: it is tagged visual while visual testing is off, or the
/// include set is non-empty with no match, or any tag is excluded.
/// Exclude wins over include membership.
pub fn skip_reason(tags: &BTreeSet<Tag>, config: &TestModeConfig) -> Option<SkipReason> {
    if !config.visual_testing_enabled && tags.contains(&Tag::visual()) {
        return Some(SkipReason::VisualTestingDisabled);
    }

    if !config.include_tags.is_empty() && tags.is_disjoint(&config.include_tags) {
        return Some(SkipReason::NotIncluded);
    }

    if let Some(tag) = tags.intersection(&config.exclude_tags).next() {
        return Some(SkipReason::Excluded(tag.clone()));
    }

    None
}

/// Convenience wrapper over [`skip_reason`] for title-based callers.
pub fn should_skip_title(title: &str, config: &TestModeConfig) -> bool {
    skip_reason(&extract_tags(title), config).is_some()
}

/// The three mode timeouts after per-test tag scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjustedTimeouts {
    pub test_timeout: Duration,
    pub action_timeout: Duration,
    pub navigation_timeout: Duration,
}

/// Scale the mode's timeouts for slow/critical tests.
///
/// `@slow` scales by 1.5, `@critical` by 1.2. The multipliers do not
/// compound; slow wins when both are present.
pub fn adjusted_timeouts(tags: &BTreeSet<Tag>, config: &TestModeConfig) -> AdjustedTimeouts {
    let multiplier = if tags.contains(&Tag::slow()) {
        1.5
    } else if tags.contains(&Tag::critical()) {
        1.2
    } else {
        1.0
    };

    AdjustedTimeouts {
        test_timeout: config.test_timeout.mul_f64(multiplier),
        action_timeout: config.action_timeout.mul_f64(multiplier),
        navigation_timeout: config.navigation_timeout.mul_f64(multiplier),
    }
}
