//! Orchestrator state machine and the bounded verify/fix loop.

use serde::{Deserialize, Serialize};

use crate::core::types::{ResolvedMode, Severity, VerifierResult};

/// Orchestrator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// `simple` mode: one call plans, implements and verifies.
    SinglePass,
    Planning,
    Implementing,
    Verifying,
    Fixing,
    Done,
    Failed,
}

pub fn first_phase(mode: ResolvedMode) -> Phase {
    match mode {
        ResolvedMode::Simple => Phase::SinglePass,
        ResolvedMode::Fast | ResolvedMode::Full => Phase::Planning,
    }
}

/// Unconditional edges. `Verifying` and `SinglePass` are decided by the verdict.
pub fn next_phase(mode: ResolvedMode, phase: Phase) -> Phase {
    match (mode, phase) {
        (_, Phase::Planning) => Phase::Implementing,
        (ResolvedMode::Full, Phase::Implementing) => Phase::Verifying,
        (_, Phase::Implementing) => Phase::Done,
        (_, Phase::Fixing) => Phase::Verifying,
        (_, other) => other,
    }
}

/// How the fix/verify loop decides to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Up to `max_fix_rounds` fix passes.
    Fixed,
    /// Like `Fixed`, but stop as soon as a round fails to reduce the blocking-bug count.
    DiminishingBugs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_fix_rounds: u32,
    pub strategy: RetryStrategy,
    /// Bugs below this severity do not block `Done` when tests passed.
    pub blocking_severity: Severity,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_fix_rounds: 2,
            strategy: RetryStrategy::Fixed,
            blocking_severity: Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail { blocking_bugs: usize },
}

/// Judge a verifier result.
///
/// A result fails when the verifier or its tests failed. The only relief is for a
/// `passed: false` whose tests passed and whose bugs all sit below `blocking`.
pub fn evaluate(result: &VerifierResult, blocking: Severity) -> Verdict {
    let blocking_bugs = result
        .bugs
        .iter()
        .filter(|bug| bug.severity >= blocking)
        .count();
    if !result.tests_passed {
        return Verdict::Fail { blocking_bugs };
    }
    if result.passed {
        return Verdict::Pass;
    }
    if !result.bugs.is_empty() && blocking_bugs == 0 {
        return Verdict::Pass;
    }
    Verdict::Fail { blocking_bugs }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopDecision {
    Done,
    Fix,
    Exhausted,
}

/// Bookkeeping for the verify/fix loop of one run.
#[derive(Debug, Clone)]
pub struct FixLoop {
    policy: RetryPolicy,
    rounds: u32,
    blocking_history: Vec<usize>,
}

impl FixLoop {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            rounds: 0,
            blocking_history: Vec::new(),
        }
    }

    /// Completed fix rounds.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn on_verified(&mut self, verdict: Verdict) -> LoopDecision {
        let blocking = match verdict {
            Verdict::Pass => return LoopDecision::Done,
            Verdict::Fail { blocking_bugs } => blocking_bugs,
        };
        self.blocking_history.push(blocking);

        if self.rounds >= self.policy.max_fix_rounds {
            return LoopDecision::Exhausted;
        }
        if self.policy.strategy == RetryStrategy::DiminishingBugs
            && let [.., previous, latest] = self.blocking_history.as_slice()
            && latest >= previous
        {
            return LoopDecision::Exhausted;
        }
        LoopDecision::Fix
    }

    pub fn on_fixed(&mut self) {
        self.rounds += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Bug;

    fn result(passed: bool, tests_passed: bool, severities: &[Severity]) -> VerifierResult {
        VerifierResult {
            passed,
            bugs: severities
                .iter()
                .enumerate()
                .map(|(i, severity)| Bug {
                    file: "x.ts".to_string(),
                    line: i as u32 + 1,
                    description: "bug".to_string(),
                    severity: *severity,
                })
                .collect(),
            test_results: Vec::new(),
            tests_written: Vec::new(),
            tests_passed,
        }
    }

    #[test]
    fn fast_mode_never_reaches_verifying() {
        let mut phase = first_phase(ResolvedMode::Fast);
        let mut seen = vec![phase];
        while phase != Phase::Done {
            phase = next_phase(ResolvedMode::Fast, phase);
            seen.push(phase);
        }
        assert_eq!(seen, vec![Phase::Planning, Phase::Implementing, Phase::Done]);
    }

    #[test]
    fn full_mode_implementing_leads_to_verifying_and_fix_back_to_verify() {
        assert_eq!(
            next_phase(ResolvedMode::Full, Phase::Implementing),
            Phase::Verifying
        );
        assert_eq!(next_phase(ResolvedMode::Full, Phase::Fixing), Phase::Verifying);
        assert_eq!(first_phase(ResolvedMode::Simple), Phase::SinglePass);
    }

    #[test]
    fn failing_tests_always_fail_the_verdict() {
        let verdict = evaluate(&result(true, false, &[]), Severity::Critical);
        assert_eq!(verdict, Verdict::Fail { blocking_bugs: 0 });
    }

    #[test]
    fn low_bugs_are_waived_only_above_the_default_threshold() {
        let r = result(false, true, &[Severity::Low, Severity::Medium]);
        assert_eq!(evaluate(&r, Severity::Low), Verdict::Fail { blocking_bugs: 2 });
        assert_eq!(evaluate(&r, Severity::High), Verdict::Pass);
        assert_eq!(
            evaluate(&result(false, true, &[]), Severity::High),
            Verdict::Fail { blocking_bugs: 0 }
        );
    }

    #[test]
    fn fixed_strategy_allows_exactly_max_rounds() {
        let mut fix_loop = FixLoop::new(RetryPolicy {
            max_fix_rounds: 2,
            ..RetryPolicy::default()
        });
        let fail = Verdict::Fail { blocking_bugs: 1 };
        assert_eq!(fix_loop.on_verified(fail), LoopDecision::Fix);
        fix_loop.on_fixed();
        assert_eq!(fix_loop.on_verified(fail), LoopDecision::Fix);
        fix_loop.on_fixed();
        assert_eq!(fix_loop.on_verified(fail), LoopDecision::Exhausted);
        assert_eq!(fix_loop.rounds(), 2);
    }

    #[test]
    fn diminishing_strategy_stops_when_bug_count_stalls() {
        let mut fix_loop = FixLoop::new(RetryPolicy {
            max_fix_rounds: 5,
            strategy: RetryStrategy::DiminishingBugs,
            blocking_severity: Severity::Low,
        });
        assert_eq!(
            fix_loop.on_verified(Verdict::Fail { blocking_bugs: 3 }),
            LoopDecision::Fix
        );
        fix_loop.on_fixed();
        assert_eq!(
            fix_loop.on_verified(Verdict::Fail { blocking_bugs: 1 }),
            LoopDecision::Fix
        );
        fix_loop.on_fixed();
        assert_eq!(
            fix_loop.on_verified(Verdict::Fail { blocking_bugs: 1 }),
            LoopDecision::Exhausted
        );
    }

    #[test]
    fn zero_rounds_fails_closed_on_first_failure() {
        let mut fix_loop = FixLoop::new(RetryPolicy {
            max_fix_rounds: 0,
            ..RetryPolicy::default()
        });
        assert_eq!(fix_loop.on_verified(Verdict::Pass), LoopDecision::Done);
        assert_eq!(
            fix_loop.on_verified(Verdict::Fail { blocking_bugs: 1 }),
            LoopDecision::Exhausted
        );
    }
}
