//! Deterministic complexity classification for `auto` mode.

use serde::{Deserialize, Serialize};

use crate::core::types::ResolvedMode;

/// Thresholds used by [`classify_task`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierThresholds {
    /// Prompts with at most this many words may run as `simple`.
    pub simple_max_words: usize,
    /// Prompts with more than this many words run as `full`.
    pub full_min_words: usize,
    /// More than this many target paths runs as `full`.
    pub full_min_targets: usize,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            simple_max_words: 25,
            full_min_words: 120,
            full_min_targets: 3,
        }
    }
}

const SMALL_CHANGE_HINTS: &[&str] = &[
    "typo", "rename", "comment", "docstring", "readme", "bump", "wording", "log message",
];

const BROAD_CHANGE_HINTS: &[&str] = &[
    "refactor",
    "migrate",
    "migration",
    "architecture",
    "redesign",
    "across",
    "concurren",
    "security",
    "validation",
    "endpoint",
    "test coverage",
    "authentication",
];

/// Classify a task into a concrete mode.
///
/// - `full` if the prompt is long, touches many targets, or names broad work.
/// - `simple` if the prompt is short, has a small-change hint and at most one target.
/// - `fast` otherwise.
pub fn classify_task(
    prompt: &str,
    target_paths: &[String],
    thresholds: &ClassifierThresholds,
) -> ResolvedMode {
    let lowered = prompt.to_lowercase();
    let words = lowered.split_whitespace().count();

    if words > thresholds.full_min_words
        || target_paths.len() > thresholds.full_min_targets
        || BROAD_CHANGE_HINTS.iter().any(|hint| lowered.contains(hint))
    {
        return ResolvedMode::Full;
    }

    if words <= thresholds.simple_max_words
        && target_paths.len() <= 1
        && SMALL_CHANGE_HINTS.iter().any(|hint| lowered.contains(hint))
    {
        return ResolvedMode::Simple;
    }

    ResolvedMode::Fast
}
