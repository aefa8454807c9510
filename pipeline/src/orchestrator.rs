//! Orchestration for a single pipeline run, and for batches of independent runs.
//!
//! A run resolves its mode, then walks the phase machine in
//! [`crate::core::transition`]: `Planning → Implementing → Verifying →
//! (Fixing → Verifying)* → Done | Failed`. Stages run strictly in sequence
//! against one [`PipelineState`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};
use std::thread;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, instrument, warn};

use crate::agents::StageRuntime;
use crate::agents::fixer::FixerAgent;
use crate::agents::implementer::ImplementerAgent;
use crate::agents::planner::PlannerAgent;
use crate::agents::simple::SimpleAgent;
use crate::agents::verifier::VerifierAgent;
use crate::core::cancel::CancelToken;
use crate::core::classifier::classify_task;
use crate::core::state::{PipelineState, PipelineTask, SessionId};
use crate::core::transition::{
    FixLoop, LoopDecision, Phase, Verdict, evaluate, first_phase, next_phase,
};
use crate::core::types::{ChangeRecord, PlanResult, ResolvedMode, StageName, VerifierResult};
use crate::error::{ErrorClass, PipelineError};
use crate::io::config::PipelineConfig;
use crate::io::gateway::Gateway;
use crate::io::probe::RepoProbe;
use crate::io::run_log::RunLog;

/// Terminal status of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    Failed { reason: FailureReason },
}

impl RunStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, RunStatus::Done)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// A stage call failed and was not (or no longer) retried.
    StageError {
        stage: Option<StageName>,
        class: ErrorClass,
        message: String,
    },
    /// The fix loop ran out of rounds. The last verifier result is in the outcome.
    RetryBudgetExhausted {
        fix_rounds: u32,
        remaining_bugs: usize,
    },
    /// `simple` mode's own verification failed.
    VerificationFailed { remaining_bugs: usize },
}

impl From<&PipelineError> for FailureReason {
    fn from(err: &PipelineError) -> Self {
        FailureReason::StageError {
            stage: err.stage(),
            class: err.class(),
            message: err.to_string(),
        }
    }
}

/// Everything a run hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub task_id: String,
    pub mode: ResolvedMode,
    pub status: RunStatus,
    pub changes: Vec<ChangeRecord>,
    /// Last verifier result, when the mode verifies and verification ran.
    pub verification: Option<VerifierResult>,
    pub session_ids: BTreeMap<StageName, SessionId>,
    pub plan: Option<PlanResult>,
    pub fix_rounds: u32,
    /// Phases entered, in order.
    pub phases: Vec<Phase>,
}

/// Pipeline bound to a gateway, probe and configuration.
#[derive(Debug, Clone)]
pub struct Pipeline<'a, G: ?Sized, P> {
    gateway: &'a G,
    probe: P,
    config: &'a PipelineConfig,
}

impl<'a, G: Gateway + ?Sized, P: RepoProbe + Clone> Pipeline<'a, G, P> {
    pub fn new(gateway: &'a G, probe: P, config: &'a PipelineConfig) -> Self {
        Self {
            gateway,
            probe,
            config,
        }
    }

    /// Mode a task will run in. `auto` is classified here, once, before the run.
    pub fn resolve_mode(&self, task: &PipelineTask) -> ResolvedMode {
        task.pipeline_mode.resolve(|| {
            classify_task(&task.original_prompt, &task.target_paths, &self.config.auto)
        })
    }

    /// Run one task to a terminal status.
    ///
    /// Stage failures are reported in [`RunOutcome::status`]. `Err` is reserved
    /// for an invalid task or failure to write run artifacts.
    #[instrument(skip_all, fields(task_id = %task.task_id))]
    pub fn run(&self, task: PipelineTask, cancel: CancelToken) -> Result<RunOutcome> {
        task.validate()?;
        if !task.workspace_path.is_dir() {
            bail!(
                "task {}: workspace {} is not a directory",
                task.task_id,
                task.workspace_path.display()
            );
        }

        let mode = self.resolve_mode(&task);
        info!(requested = ?task.pipeline_mode, resolved = mode.as_str(), "run started");

        let log = RunLog::create(&self.config.artifacts_root(&task.workspace_path), &task.task_id)?;
        let runtime = StageRuntime::new(self.config, Some(&log)).with_cancel(cancel);
        let mut state = PipelineState::new(task, mode);

        let mut drive = Drive::default();
        let status = self.drive(&runtime, &mut state, &mut drive);
        match &status {
            RunStatus::Done => info!(fix_rounds = drive.fix_rounds, "run done"),
            RunStatus::Failed { reason } => warn!(?reason, "run failed"),
        }

        let task_id = state.task_id().to_string();
        let (changes, session_ids) = state.into_parts();
        let outcome = RunOutcome {
            task_id,
            mode,
            status,
            changes,
            verification: drive.verification,
            session_ids,
            plan: drive.plan,
            fix_rounds: drive.fix_rounds,
            phases: drive.phases,
        };
        log.write_outcome(&outcome)?;
        Ok(outcome)
    }

    fn drive(
        &self,
        runtime: &StageRuntime<'_>,
        state: &mut PipelineState,
        drive: &mut Drive,
    ) -> RunStatus {
        let mode = state.resolved_mode();
        let blocking = self.config.retry.blocking_severity;
        let mut fix_loop = FixLoop::new(self.config.retry.policy());
        let mut phase = first_phase(mode);

        loop {
            drive.phases.push(phase);
            debug!(?phase, "entering phase");
            let step = match phase {
                Phase::SinglePass => self.single_pass(runtime, state, drive),
                Phase::Planning => PlannerAgent
                    .run(self.gateway, runtime, state)
                    .map(|plan| {
                        drive.plan = Some(plan);
                        Step::Next(next_phase(mode, phase))
                    }),
                Phase::Implementing => match drive.plan.as_ref() {
                    Some(plan) => ImplementerAgent
                        .run(self.gateway, runtime, state, plan)
                        .map(|_| Step::Next(next_phase(mode, phase))),
                    None => Err(PipelineError::Internal(anyhow!(
                        "implementing without a plan"
                    ))),
                },
                Phase::Verifying => VerifierAgent::new(self.probe.clone())
                    .run(self.gateway, runtime, state)
                    .map(|result| {
                        let verdict = evaluate(&result, blocking);
                        let decision = fix_loop.on_verified(verdict);
                        drive.verification = Some(result);
                        match decision {
                            LoopDecision::Done => Step::Next(Phase::Done),
                            LoopDecision::Fix => Step::Next(Phase::Fixing),
                            LoopDecision::Exhausted => {
                                Step::Stop(FailureReason::RetryBudgetExhausted {
                                    fix_rounds: fix_loop.rounds(),
                                    remaining_bugs: blocking_bugs(verdict),
                                })
                            }
                        }
                    }),
                Phase::Fixing => match drive.verification.as_ref() {
                    Some(verification) => FixerAgent
                        .run(self.gateway, runtime, state, verification)
                        .map(|_| {
                            fix_loop.on_fixed();
                            Step::Next(next_phase(mode, phase))
                        }),
                    None => Err(PipelineError::Internal(anyhow!(
                        "fixing without a verifier result"
                    ))),
                },
                Phase::Done | Phase::Failed => Err(PipelineError::Internal(anyhow!(
                    "no stage runs in terminal phase {phase:?}"
                ))),
            };

            drive.fix_rounds = fix_loop.rounds();
            match step {
                Ok(Step::Next(Phase::Done)) => {
                    drive.phases.push(Phase::Done);
                    return RunStatus::Done;
                }
                Ok(Step::Next(next)) => phase = next,
                Ok(Step::Stop(reason)) => {
                    drive.phases.push(Phase::Failed);
                    return RunStatus::Failed { reason };
                }
                Err(err) => {
                    warn!(?phase, err = %err, "stage failed");
                    drive.phases.push(Phase::Failed);
                    return RunStatus::Failed {
                        reason: FailureReason::from(&err),
                    };
                }
            }
        }
    }

    fn single_pass(
        &self,
        runtime: &StageRuntime<'_>,
        state: &mut PipelineState,
        drive: &mut Drive,
    ) -> Result<Step, PipelineError> {
        let result = SimpleAgent::new(self.probe.clone()).run(self.gateway, runtime, state)?;
        let verdict = evaluate(&result.verification, self.config.retry.blocking_severity);
        drive.verification = Some(result.verification);
        Ok(match verdict {
            Verdict::Pass => Step::Next(Phase::Done),
            Verdict::Fail { blocking_bugs } => Step::Stop(FailureReason::VerificationFailed {
                remaining_bugs: blocking_bugs,
            }),
        })
    }
}

impl<'a, G, P> Pipeline<'a, G, P>
where
    G: Gateway + Sync + ?Sized,
    P: RepoProbe + Clone + Sync,
{
    /// Run independent tasks concurrently on at most `max_concurrent_runs`
    /// worker threads.
    ///
    /// Results are returned in input order. Task ids must be unique since
    /// they name the artifact directories.
    pub fn run_batch(
        &self,
        tasks: Vec<PipelineTask>,
        cancel: &CancelToken,
    ) -> Result<Vec<Result<RunOutcome>>> {
        let mut seen = BTreeSet::new();
        for task in &tasks {
            if !seen.insert(task.task_id.as_str()) {
                bail!("duplicate task id '{}' in batch", task.task_id);
            }
        }

        let total = tasks.len();
        let workers = self.config.max_concurrent_runs.clamp(1, total.max(1));
        info!(tasks = total, workers, "starting batch");

        let queue = Mutex::new(tasks.into_iter().enumerate());
        let slots: Mutex<Vec<Option<Result<RunOutcome>>>> =
            Mutex::new((0..total).map(|_| None).collect());
        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let cancel = cancel.clone();
                    let queue = &queue;
                    let slots = &slots;
                    scope.spawn(move || {
                        loop {
                            let next = queue.lock().unwrap_or_else(PoisonError::into_inner).next();
                            let Some((index, task)) = next else { break };
                            let _span =
                                info_span!("batch_run", task_id = %task.task_id).entered();
                            let result = self.run(task, cancel.clone());
                            slots.lock().unwrap_or_else(PoisonError::into_inner)[index] =
                                Some(result);
                        }
                    })
                })
                .collect();
            for handle in handles {
                if handle.join().is_err() {
                    warn!("batch worker panicked");
                }
            }
        });

        let results = slots
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(anyhow!("run did not complete: worker panicked"))))
            .collect();
        Ok(results)
    }
}

/// Data gathered while driving the phase machine.
#[derive(Debug, Default)]
struct Drive {
    plan: Option<PlanResult>,
    verification: Option<VerifierResult>,
    fix_rounds: u32,
    phases: Vec<Phase>,
}

enum Step {
    Next(Phase),
    Stop(FailureReason),
}

fn blocking_bugs(verdict: Verdict) -> usize {
    match verdict {
        Verdict::Pass => 0,
        Verdict::Fail { blocking_bugs } => blocking_bugs,
    }
}
