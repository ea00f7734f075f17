use crate::adapter::TargetAdapter;
use crate::collector::{DEFAULT_FAILURE_SAMPLE_CAP, ResultCollector, RunSummary};
use crate::corpus::SeedCorpus;
use crate::input::Payload;
use crate::mutator::{MutationKind, Mutator, PayloadMutator};
use crate::outcome::{Outcome, ResponseDescriptor, Status};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that prevent a run from starting. Once running, a run always yields a summary.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RunError {
    #[error("Run controller is {0:?}, a run can only start from Idle")]
    NotIdle(RunState),
    #[error("Corpus is empty, nothing to mutate")]
    CorpusEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Finished,
}

/// Which mutation kinds are applied to each seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindSchedule {
    /// Every kind for every round.
    Sweep(Vec<MutationKind>),
    /// `draws` kinds picked from `pool` with the run's RNG for every round.
    Random { pool: Vec<MutationKind>, draws: usize },
    /// Exactly one kind.
    Forced(MutationKind),
}

impl KindSchedule {
    /// Number of sends each seed receives over `iterations` rounds, saturating at `u64::MAX`.
    pub fn sends_per_seed(&self, iterations: u64) -> u64 {
        let per_round = match self {
            KindSchedule::Sweep(kinds) => kinds.len() as u64,
            KindSchedule::Random { pool, draws } if !pool.is_empty() => *draws as u64,
            KindSchedule::Random { .. } => 0,
            KindSchedule::Forced(_) => 1,
        };
        per_round.saturating_mul(iterations)
    }

    /// The kinds one seed is mutated with, produced one send at a time: kind-major for a
    /// sweep, round-major for random draws.
    fn plan(&self, iterations: u64) -> KindPlan<'_> {
        KindPlan {
            schedule: self,
            iterations,
            slot: 0,
            round: 0,
        }
    }
}

/// Cursor over one seed's sends. Random draws use the run RNG as they are reached.
struct KindPlan<'a> {
    schedule: &'a KindSchedule,
    iterations: u64,
    /// Kind index for a sweep, draw index for random rounds.
    slot: usize,
    round: u64,
}

impl KindPlan<'_> {
    fn next_kind(&mut self, rng: &mut ChaCha8Rng) -> Option<MutationKind> {
        if self.round >= self.iterations {
            return None;
        }
        match self.schedule {
            KindSchedule::Sweep(kinds) => {
                let kind = *kinds.get(self.slot)?;
                self.round += 1;
                if self.round == self.iterations {
                    self.round = 0;
                    self.slot += 1;
                }
                Some(kind)
            }
            KindSchedule::Random { pool, draws } => {
                if *draws == 0 {
                    return None;
                }
                let kind = MutationKind::choose(pool, rng)?;
                self.slot += 1;
                if self.slot == *draws {
                    self.slot = 0;
                    self.round += 1;
                }
                Some(kind)
            }
            KindSchedule::Forced(kind) => {
                self.round += 1;
                Some(*kind)
            }
        }
    }
}

/// Shared stop flag checked between sends.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing flag, e.g. one owned by a signal handler.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub rng_seed: u64,
    pub failure_sample_cap: usize,
    /// Pause after every send.
    pub send_delay: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            rng_seed: 0,
            failure_sample_cap: DEFAULT_FAILURE_SAMPLE_CAP,
            send_delay: Duration::ZERO,
        }
    }
}

/// Drives seeds × kinds × iterations through one adapter into one collector.
pub struct RunController<M = PayloadMutator> {
    settings: RunSettings,
    mutator: M,
    cancel: CancelToken,
    state: RunState,
}

impl RunController<PayloadMutator> {
    pub fn new(settings: RunSettings) -> Self {
        Self::with_mutator(settings, PayloadMutator::default())
    }
}

impl<M: Mutator<ChaCha8Rng>> RunController<M> {
    pub fn with_mutator(settings: RunSettings, mutator: M) -> Self {
        Self {
            settings,
            mutator,
            cancel: CancelToken::new(),
            state: RunState::Idle,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Runs `iterations` rounds of the seed × kind matrix, or until cancelled, and returns the
    /// finalized summary.
    pub fn start<A: TargetAdapter + ?Sized>(
        &mut self,
        corpus: &SeedCorpus,
        schedule: &KindSchedule,
        iterations: u64,
        adapter: &mut A,
    ) -> Result<RunSummary, RunError> {
        if self.state != RunState::Idle {
            return Err(RunError::NotIdle(self.state));
        }
        if corpus.is_empty() {
            return Err(RunError::CorpusEmpty);
        }
        self.state = RunState::Running;

        let target = adapter.name();
        let mut rng = ChaCha8Rng::seed_from_u64(self.settings.rng_seed);
        let mut collector = ResultCollector::new(target, self.settings.failure_sample_cap);
        let planned = schedule
            .sends_per_seed(iterations)
            .saturating_mul(corpus.len() as u64);
        let progress_step = (planned / 10).max(1);
        let started = Instant::now();
        log::info!(
            "[{target}] Starting run: {} seeds, {planned} sends planned (rng seed {})",
            corpus.len(),
            self.settings.rng_seed
        );

        let mut cancelled = false;
        'seeds: for (seed_id, seed) in corpus.iter().enumerate() {
            let mut plan = schedule.plan(iterations);
            while let Some(kind) = plan.next_kind(&mut rng) {
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break 'seeds;
                }

                let mutation = self.mutator.mutate(seed, kind, &mut rng);
                log::debug!("[{target}] seed #{seed_id} {kind}: {}", mutation.payload);
                let outcome = send_guarded(adapter, kind, mutation.payload);
                let status = outcome.status;
                collector.record(outcome);

                if status == Status::TransportError {
                    if let Err(e) = adapter.recover() {
                        log::warn!("[{target}] Recovery after transport error failed: {e}");
                    }
                }

                let done = collector.total_attempts();
                if done % progress_step == 0 {
                    log::info!(
                        "[{target}] Progress: {done}/{planned} sends, {} failures, {:.1}s elapsed",
                        collector.failure_count(),
                        started.elapsed().as_secs_f64()
                    );
                }
                if !self.settings.send_delay.is_zero() {
                    std::thread::sleep(self.settings.send_delay);
                }
            }
        }

        if cancelled {
            log::warn!(
                "[{target}] Run cancelled after {} of {planned} sends",
                collector.total_attempts()
            );
        }
        self.state = RunState::Finished;
        let summary = collector.finalize(cancelled);
        log::info!(
            "[{target}] Run finished: {} attempts, {} successes, {} errors",
            summary.total_attempts(),
            summary.success_count(),
            summary.error_count()
        );
        Ok(summary)
    }
}

/// Sends through `adapter`, turning a panic into an `exception` outcome.
fn send_guarded<A: TargetAdapter + ?Sized>(
    adapter: &mut A,
    kind: MutationKind,
    payload: Payload,
) -> Outcome {
    let kept = payload.clone();
    match catch_unwind(AssertUnwindSafe(|| adapter.send(kind, payload))) {
        Ok(outcome) => outcome,
        Err(panic_payload) => {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic type".to_string()
            };
            Outcome::new(
                kind,
                kept,
                Status::Exception,
                ResponseDescriptor::Unavailable {
                    reason: format!("adapter panicked: {msg}"),
                },
            )
            .with_detail(msg)
        }
    }
}
