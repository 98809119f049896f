//! The durable trial ledger.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions, TryLockError};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use sweep_types::{
    Configuration, LedgerError, LedgerResult, Trial, TrialId, TrialState, TrialUpdate,
};
use tracing::{debug, info, warn};

use crate::journal::{self, JournalRecord};

/// Append-only, crash-recoverable record of every trial.
///
/// The journal file is held under an exclusive OS lock for the lifetime of
/// the ledger, so one process at a time assigns identities. Within the
/// process every mutation runs under a single mutex and is flushed to stable
/// storage before the call returns.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    inner: Mutex<LedgerInner>,
}

#[derive(Debug)]
struct LedgerInner {
    file: File,
    /// Bytes of intact journal; writes start here.
    len: u64,
    trials: Vec<Trial>,
    index: HashMap<TrialId, usize>,
    next_id: TrialId,
}

impl Ledger {
    /// Open the journal at `path`, replaying it if it exists, or create an
    /// empty one. A torn final record is cut off before any new write.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Err(LedgerError::Locked { path }),
            Err(TryLockError::Error(e)) => return Err(LedgerError::Io(e)),
        }

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let replay = journal::replay(&bytes)?;

        if replay.discarded_tail {
            warn!(
                path = %path.display(),
                kept_bytes = replay.valid_len,
                dropped_bytes = bytes.len() as u64 - replay.valid_len,
                "discarding torn final journal record"
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(replay.valid_len))?;

        let next_id = replay.next_id();
        let index = replay
            .trials
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();

        info!(
            path = %path.display(),
            trials = replay.trials.len(),
            "opened trial ledger"
        );

        Ok(Self {
            path,
            inner: Mutex::new(LedgerInner {
                file,
                len: replay.valid_len,
                trials: replay.trials,
                index,
                next_id,
            }),
        })
    }

    /// Durably record a new Pending trial for `configuration` and return its
    /// identity.
    pub fn append(&self, configuration: &Configuration) -> LedgerResult<TrialId> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        let at = Utc::now();
        let record = JournalRecord::Create {
            id,
            configuration: configuration.clone(),
            at,
        };
        inner.write(&record)?;

        let position = inner.trials.len();
        inner.trials.push(Trial::new(id, configuration.clone(), at));
        inner.index.insert(id, position);
        inner.next_id = id + 1;

        debug!(trial = id, configuration = %configuration, "trial appended");
        Ok(id)
    }

    /// Durably transition trial `id`. Fails without writing anything when
    /// the transition is not allowed from the trial's current state.
    pub fn update(&self, id: TrialId, update: TrialUpdate) -> LedgerResult<()> {
        let mut inner = self.inner.lock();
        let position = *inner
            .index
            .get(&id)
            .ok_or(LedgerError::UnknownTrial { id })?;
        inner.trials[position].validate(&update)?;

        let at = Utc::now();
        let state = update.state;
        let record = JournalRecord::Update {
            id,
            update: update.clone(),
            at,
        };
        inner.write(&record)?;
        inner.trials[position].apply(update, at)?;

        debug!(trial = id, state = %state, "trial updated");
        Ok(())
    }

    /// Every recorded trial, in append order.
    pub fn all_trials(&self) -> Vec<Trial> {
        self.inner.lock().trials.clone()
    }

    pub fn get(&self, id: TrialId) -> Option<Trial> {
        let inner = self.inner.lock();
        inner.index.get(&id).map(|i| inner.trials[*i].clone())
    }

    pub fn count_in_state(&self, state: TrialState) -> usize {
        self.inner
            .lock()
            .trials
            .iter()
            .filter(|t| t.state == state)
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerInner {
    fn write(&mut self, record: &JournalRecord) -> LedgerResult<()> {
        let line = record.encode()?;
        let result = self
            .file
            .write_all(&line)
            .and_then(|()| self.file.sync_data());

        match result {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Cut any partial line so the next record starts clean.
                if self.file.set_len(self.len).is_ok() {
                    let _ = self.file.seek(SeekFrom::Start(self.len));
                }
                Err(LedgerError::Io(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use sweep_types::{FailureKind, TrialFailure, TrialMetrics, NO_CHECKS};
    use tempfile::TempDir;

    fn config(universe: &str) -> Configuration {
        Configuration::new()
            .with("universe", universe)
            .with("delay", 1)
    }

    fn metrics() -> TrialMetrics {
        TrialMetrics {
            alpha_id: "abc".into(),
            sharpe: Some(1.0),
            fitness: Some(1.0),
            turnover: Some(0.1),
            returns: Some(0.1),
            drawdown: Some(0.05),
            passed_checks: NO_CHECKS.into(),
            failed_checks: NO_CHECKS.into(),
            warnings: NO_CHECKS.into(),
        }
    }

    #[test]
    fn append_assigns_increasing_ids() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::load_or_create(dir.path().join("study.log")).unwrap();

        let a = ledger.append(&config("TOP3000")).unwrap();
        let b = ledger.append(&config("TOP500")).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.get(a).unwrap().state, TrialState::Pending);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("studies").join("study.log");

        {
            let ledger = Ledger::load_or_create(&path).unwrap();
            let a = ledger.append(&config("TOP3000")).unwrap();
            let b = ledger.append(&config("TOP500")).unwrap();
            ledger.update(a, TrialUpdate::running()).unwrap();
            ledger
                .update(a, TrialUpdate::succeeded(-3.04, metrics()))
                .unwrap();
            ledger.update(b, TrialUpdate::running()).unwrap();
        }

        let ledger = Ledger::load_or_create(&path).unwrap();
        let trials = ledger.all_trials();
        assert_eq!(trials.len(), 2);
        assert_eq!(trials[0].state, TrialState::Succeeded);
        assert_eq!(trials[0].objective, Some(-3.04));
        assert_eq!(trials[1].state, TrialState::Running);

        assert_eq!(ledger.append(&config("TOP1000")).unwrap(), 2);
    }

    #[test]
    fn rejects_unreachable_transition_without_writing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("study.log");
        let ledger = Ledger::load_or_create(&path).unwrap();
        let id = ledger.append(&config("TOP3000")).unwrap();
        let before = std::fs::metadata(&path).unwrap().len();

        let err = ledger
            .update(id, TrialUpdate::succeeded(1.0, metrics()))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), before);

        assert!(matches!(
            ledger.update(99, TrialUpdate::running()),
            Err(LedgerError::UnknownTrial { id: 99 })
        ));
    }

    #[test]
    fn failed_trial_stays_after_retry() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::load_or_create(dir.path().join("study.log")).unwrap();
        let cfg = config("TOP3000");

        let first = ledger.append(&cfg).unwrap();
        ledger.update(first, TrialUpdate::running()).unwrap();
        let failure = TrialFailure::new(FailureKind::Permanent, "bad universe");
        ledger
            .update(first, TrialUpdate::failed(failure.clone()))
            .unwrap();

        let second = ledger.append(&cfg).unwrap();
        ledger.update(second, TrialUpdate::running()).unwrap();
        ledger
            .update(second, TrialUpdate::succeeded(2.0, metrics()))
            .unwrap();

        let old = ledger.get(first).unwrap();
        assert_eq!(old.state, TrialState::Failed);
        assert_eq!(old.failure, Some(failure));
        assert_eq!(ledger.count_in_state(TrialState::Succeeded), 1);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("study.log");
        {
            let ledger = Ledger::load_or_create(&path).unwrap();
            ledger.append(&config("TOP3000")).unwrap();
        }
        let intact = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(br#"{"op":"create","id":1,"configur"#).unwrap();
        }

        let ledger = Ledger::load_or_create(&path).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);

        assert_eq!(ledger.append(&config("TOP500")).unwrap(), 1);
        drop(ledger);
        let reopened = Ledger::load_or_create(&path).unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn second_opener_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("study.log");
        let _first = Ledger::load_or_create(&path).unwrap();
        assert!(matches!(
            Ledger::load_or_create(&path),
            Err(LedgerError::Locked { .. })
        ));
    }

    #[test]
    fn concurrent_appends_get_unique_ids() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::load_or_create(dir.path().join("study.log")).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    (0..10)
                        .map(|i| ledger.append(&config(&format!("U{t}_{i}"))).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<TrialId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..80).collect::<Vec<_>>());

        let trials = ledger.all_trials();
        assert!(trials.windows(2).all(|w| w[0].id < w[1].id));
    }
}
