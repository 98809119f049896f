//! The search orchestrator.
//!
//! A single dispatcher owns the candidate source. For every candidate it
//! takes a worker permit, claims the configuration through the
//! [`DuplicateGuard`], appends a Pending trial and hands the trial to a
//! spawned worker. Workers evaluate, score and record the outcome; a failed
//! trial releases its claim. Per-trial errors end up in the ledger. Only
//! ledger I/O failures abort a run.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use sweep_client::{Evaluator, RetryingEvaluator};
use sweep_ledger::Ledger;
use sweep_types::{
    config_error, internal_error, ConfigKey, Configuration, EvaluationError, FailureKind,
    LedgerResult, SweepError, SweepResult, TrialFailure, TrialId, TrialState, TrialUpdate,
};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::guard::DuplicateGuard;
use crate::scorer::Scorer;
use crate::search::{CandidateSource, GridSource, RandomSource, SearchSpace, TpeSource};
use crate::study::{Strategy, StudyConfig, StudySummary};

/// Requests a running study to stop starting trials. In-flight evaluations
/// finish normally.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// What [`Orchestrator::resume`] found in the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeReport {
    /// Trials left running by a previous process, now failed.
    pub abandoned: usize,
    /// Trials left pending by a previous process, now pruned.
    pub pruned: usize,
    /// Configurations queued again ahead of the source.
    pub requeued: usize,
    /// Failed configurations left alone because retries are disabled.
    pub skipped: usize,
    /// Configurations that stay claimed.
    pub claimed: usize,
}

pub struct Orchestrator {
    config: StudyConfig,
    space: SearchSpace,
    ledger: Arc<Ledger>,
    guard: Arc<DuplicateGuard>,
    evaluator: Arc<dyn Evaluator>,
    scorer: Arc<dyn Scorer>,
    shutdown: ShutdownHandle,
    /// Dispatched before anything the source proposes.
    queue: VecDeque<Configuration>,
    /// Never dispatched again by this process.
    settled: HashSet<ConfigKey>,
    /// Points of the space known to be claimed or settled.
    covered: HashSet<ConfigKey>,
    resumed: bool,
}

impl Orchestrator {
    /// Validate `config` against `space` and wrap `evaluator` in the study's
    /// retry policy.
    pub fn new<E: Evaluator + 'static>(
        config: StudyConfig,
        space: SearchSpace,
        ledger: Ledger,
        evaluator: E,
    ) -> SweepResult<Self> {
        config.validate()?;
        if space.is_empty() {
            return Err(config_error!("search space has no parameters"));
        }
        if let Some(outside) = config.enqueue.iter().find(|c| !space.contains(c)) {
            return Err(config_error!(
                "enqueued configuration {{{}}} is not in the search space",
                outside
            ));
        }

        let scorer = config.scoring.scorer();
        let evaluator: Arc<dyn Evaluator> =
            Arc::new(RetryingEvaluator::new(evaluator, config.retry.clone()));

        Ok(Self {
            config,
            space,
            ledger: Arc::new(ledger),
            guard: Arc::new(DuplicateGuard::new()),
            evaluator,
            scorer,
            shutdown: ShutdownHandle::new(),
            queue: VecDeque::new(),
            settled: HashSet::new(),
            covered: HashSet::new(),
            resumed: false,
        })
    }

    /// Replace the scorer chosen by the study's scoring config.
    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &StudyConfig {
        &self.config
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn guard(&self) -> &DuplicateGuard {
        &self.guard
    }

    /// Reconcile the ledger with a fresh process.
    ///
    /// Running trials are closed as abandoned failures and pending ones as
    /// pruned, since no worker holds them anymore. The claimed set is then
    /// rebuilt, and configurations whose latest trial never produced a
    /// result are queued ahead of the source: abandoned and pruned ones
    /// always, failed ones when `retry_failed` is set. Called by
    /// [`Orchestrator::run`] if it has not been called before.
    pub fn resume(&mut self) -> SweepResult<ResumeReport> {
        let mut report = ResumeReport::default();

        for trial in self.ledger.all_trials() {
            match trial.state {
                TrialState::Running => {
                    self.ledger.update(
                        trial.id,
                        TrialUpdate::failed(TrialFailure::new(
                            FailureKind::Abandoned,
                            "process exited while the trial was running",
                        )),
                    )?;
                    report.abandoned += 1;
                }
                TrialState::Pending => {
                    self.ledger.update(trial.id, TrialUpdate::pruned())?;
                    report.pruned += 1;
                }
                _ => {}
            }
        }

        let trials = self.ledger.all_trials();
        let guard = DuplicateGuard::from_trials(&trials);

        let mut latest: HashMap<ConfigKey, usize> = HashMap::new();
        for (i, trial) in trials.iter().enumerate() {
            latest.insert(trial.configuration.key(), i);
        }
        let mut latest: Vec<(ConfigKey, usize)> = latest.into_iter().collect();
        latest.sort_by_key(|(_, i)| *i);

        for (key, i) in latest {
            let trial = &trials[i];
            let in_space = self.space.contains(&trial.configuration);
            if guard.is_claimed(&trial.configuration) {
                report.claimed += 1;
                if in_space {
                    self.covered.insert(key);
                }
                continue;
            }

            let interrupted = match (&trial.state, &trial.failure) {
                (TrialState::Pruned, _) => true,
                (TrialState::Failed, Some(f)) => f.kind == FailureKind::Abandoned,
                _ => false,
            };
            if interrupted || (trial.state == TrialState::Failed && self.config.retry_failed) {
                debug!(trial = trial.id, configuration = %trial.configuration, "re-enqueued");
                self.queue.push_back(trial.configuration.clone());
                report.requeued += 1;
            } else if trial.state == TrialState::Failed {
                self.settled.insert(key.clone());
                if in_space {
                    self.covered.insert(key);
                }
                report.skipped += 1;
            }
        }

        self.queue.extend(self.config.enqueue.iter().cloned());
        self.guard = Arc::new(guard);
        self.resumed = true;

        info!(
            study = %self.config.name,
            trials = trials.len(),
            abandoned = report.abandoned,
            pruned = report.pruned,
            requeued = report.requeued,
            skipped = report.skipped,
            claimed = report.claimed,
            "resumed study"
        );
        Ok(report)
    }

    /// Run until the source is exhausted, `max_trials` trials have been
    /// started, or the study is cancelled, then wait for every in-flight
    /// trial and summarise the ledger.
    pub async fn run(&mut self) -> SweepResult<StudySummary> {
        let clock = Instant::now();
        if !self.resumed {
            self.resume()?;
        }

        let mut source = self.source();
        info!(
            study = %self.config.name,
            strategy = source.name(),
            cardinality = self.space.cardinality(),
            concurrency = self.config.concurrency,
            queued = self.queue.len(),
            "starting search"
        );

        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut cancel = self.shutdown.tx.subscribe();
        let mut tasks: JoinSet<LedgerResult<TrialState>> = JoinSet::new();
        let mut started = 0usize;
        let mut fatal: Option<SweepError> = None;

        loop {
            if *cancel.borrow() {
                info!(in_flight = tasks.len(), "cancellation requested, draining");
                break;
            }
            if self.config.max_trials.is_some_and(|max| started >= max) {
                info!(started, "trial limit reached");
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.changed() => continue,
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = settle(joined) {
                        fatal = Some(e);
                        break;
                    }
                    continue;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        fatal = Some(internal_error!("worker pool closed"));
                        break;
                    }
                },
            };
            if *cancel.borrow() {
                continue;
            }

            let Some(candidate) = self.next_candidate(source.as_mut()) else {
                info!(started, "no candidates left");
                break;
            };

            let id = match self.ledger.append(&candidate) {
                Ok(id) => id,
                Err(e) => {
                    self.guard.release(&candidate);
                    fatal = Some(e.into());
                    break;
                }
            };
            started += 1;

            let key = candidate.key();
            if self.space.contains(&candidate) {
                self.covered.insert(key.clone());
            }
            self.settled.insert(key);

            let worker = TrialWorker {
                ledger: self.ledger.clone(),
                guard: self.guard.clone(),
                evaluator: self.evaluator.clone(),
                scorer: self.scorer.clone(),
                cancel: cancel.clone(),
            };
            tasks.spawn(async move {
                let _permit = permit;
                worker.run(id, candidate).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = settle(joined) {
                fatal.get_or_insert(e);
            }
        }
        if let Some(e) = fatal {
            error!(study = %self.config.name, error = %e, "study aborted");
            return Err(e);
        }

        let mut summary = StudySummary::from_trials(&self.config.name, &self.ledger.all_trials());
        summary.started = started;
        summary.elapsed = clock.elapsed();
        summary.cancelled = *cancel.borrow();
        info!(
            study = %self.config.name,
            started,
            succeeded = summary.succeeded,
            failed = summary.failed,
            best = ?summary.best_trial.as_ref().and_then(|t| t.objective),
            "search finished"
        );
        Ok(summary)
    }

    fn source(&self) -> Box<dyn CandidateSource> {
        match self.config.strategy {
            Strategy::Grid => Box::new(GridSource::new(&self.space)),
            Strategy::Random => Box::new(RandomSource::new(self.space.clone(), self.config.seed)),
            Strategy::Tpe => Box::new(TpeSource::new(self.space.clone(), self.config.seed)),
        }
    }

    /// The next claimed candidate: queued configurations first, then the
    /// source. A stochastic source is given up on once the space is covered
    /// or too many proposals in a row were duplicates.
    fn next_candidate(&mut self, source: &mut dyn CandidateSource) -> Option<Configuration> {
        while let Some(candidate) = self.queue.pop_front() {
            if self.try_claim(&candidate) {
                return Some(candidate);
            }
            debug!(configuration = %candidate, "queued configuration already claimed");
        }

        let history = if source.observes_history() {
            self.ledger.all_trials()
        } else {
            Vec::new()
        };
        let cardinality = self.space.cardinality();
        let mut refused = 0usize;

        loop {
            if !source.is_exhaustive() {
                if self.covered.len() >= cardinality {
                    debug!(cardinality, "every configuration is claimed");
                    return None;
                }
                if refused >= self.config.max_duplicate_proposals {
                    info!(refused, "too many duplicate proposals in a row");
                    return None;
                }
            }
            let candidate = source.propose(&history)?;
            if self.try_claim(&candidate) {
                return Some(candidate);
            }
            refused += 1;
        }
    }

    fn try_claim(&mut self, candidate: &Configuration) -> bool {
        let key = candidate.key();
        if self.settled.contains(&key) {
            return false;
        }
        if self.guard.claim(candidate) {
            return true;
        }
        if self.space.contains(candidate) {
            self.covered.insert(key);
        }
        false
    }
}

/// Everything a spawned trial needs, as shared handles.
struct TrialWorker {
    ledger: Arc<Ledger>,
    guard: Arc<DuplicateGuard>,
    evaluator: Arc<dyn Evaluator>,
    scorer: Arc<dyn Scorer>,
    cancel: watch::Receiver<bool>,
}

impl TrialWorker {
    async fn run(self, id: TrialId, configuration: Configuration) -> LedgerResult<TrialState> {
        if *self.cancel.borrow() {
            self.ledger.update(id, TrialUpdate::pruned())?;
            self.guard.release(&configuration);
            debug!(trial = id, "pruned before dispatch");
            return Ok(TrialState::Pruned);
        }

        self.ledger.update(id, TrialUpdate::running())?;
        info!(trial = id, configuration = %configuration, "trial started");

        let update = match self.evaluator.evaluate(&configuration).await {
            Ok(result) => match self.scorer.score(&result) {
                Ok(score) => TrialUpdate::succeeded(score.objective, score.metrics),
                Err(e) => TrialUpdate::failed(TrialFailure::new(
                    FailureKind::InvalidResult,
                    e.to_string(),
                )),
            },
            Err(EvaluationError::Transient { message, .. }) => {
                TrialUpdate::failed(TrialFailure::new(FailureKind::Transient, message))
            }
            Err(EvaluationError::Permanent { message }) => {
                TrialUpdate::failed(TrialFailure::new(FailureKind::Permanent, message))
            }
        };

        let state = update.state;
        match (&update.objective, &update.failure) {
            (Some(objective), _) => info!(trial = id, objective, "trial succeeded"),
            (_, Some(failure)) => warn!(trial = id, reason = %failure, "trial failed"),
            _ => {}
        }
        self.ledger.update(id, update)?;

        if state == TrialState::Failed {
            self.guard.release(&configuration);
        }
        Ok(state)
    }
}

/// Fold a finished worker into the run: ledger errors are fatal, a panicked
/// worker is logged and its trial left for the next resume.
fn settle(joined: Result<LedgerResult<TrialState>, JoinError>) -> SweepResult<()> {
    match joined {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => {
            error!(error = %e, "trial worker did not complete");
            Ok(())
        }
    }
}
