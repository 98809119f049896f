//! Journal record framing and replay.
//!
//! The journal is a sequence of JSON objects, one per `\n`-terminated line.
//! Each record is either the creation of a trial or a state update of an
//! existing one; replaying every record in order rebuilds the full ledger.
//! A final line that is unterminated or unparseable is the residue of a
//! write interrupted by a crash and is discarded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use sweep_types::{Configuration, LedgerError, LedgerResult, Trial, TrialId, TrialUpdate};

/// One journalled ledger mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    Create {
        id: TrialId,
        configuration: Configuration,
        at: DateTime<Utc>,
    },
    Update {
        id: TrialId,
        update: TrialUpdate,
        at: DateTime<Utc>,
    },
}

impl JournalRecord {
    /// Encode as a single newline-terminated line.
    pub fn encode(&self) -> LedgerResult<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Ledger state rebuilt from a journal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replay {
    /// Trials in append (identity) order.
    pub trials: Vec<Trial>,
    /// Length in bytes of the intact prefix of the journal.
    pub valid_len: u64,
    /// Whether a torn final record was dropped.
    pub discarded_tail: bool,
}

impl Replay {
    pub fn next_id(&self) -> TrialId {
        self.trials.last().map_or(0, |t| t.id + 1)
    }
}

/// Rebuild ledger state from raw journal bytes.
///
/// Replay is a pure function of its input: replaying the same bytes always
/// yields the same state.
pub fn replay(bytes: &[u8]) -> LedgerResult<Replay> {
    let mut state = Replay::default();
    let mut index: HashMap<TrialId, usize> = HashMap::new();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        line_no += 1;
        let rest = &bytes[offset..];
        let (line, terminated) = match rest.iter().position(|b| *b == b'\n') {
            Some(pos) => (&rest[..pos], true),
            None => (rest, false),
        };
        let next_offset = offset + line.len() + usize::from(terminated);
        let is_last = next_offset >= bytes.len();

        if !terminated {
            state.discarded_tail = true;
            break;
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            offset = next_offset;
            state.valid_len = offset as u64;
            continue;
        }

        let record: JournalRecord = match serde_json::from_slice(line) {
            Ok(record) => record,
            Err(_) if is_last => {
                state.discarded_tail = true;
                break;
            }
            Err(e) => {
                return Err(LedgerError::Corrupt {
                    line: line_no,
                    message: e.to_string(),
                })
            }
        };
        apply_record(&mut state.trials, &mut index, record, line_no)?;

        offset = next_offset;
        state.valid_len = offset as u64;
    }

    Ok(state)
}

fn apply_record(
    trials: &mut Vec<Trial>,
    index: &mut HashMap<TrialId, usize>,
    record: JournalRecord,
    line: usize,
) -> LedgerResult<()> {
    match record {
        JournalRecord::Create {
            id,
            configuration,
            at,
        } => {
            if let Some(last) = trials.last() {
                if id <= last.id {
                    return Err(LedgerError::Corrupt {
                        line,
                        message: format!("trial id {id} does not follow {}", last.id),
                    });
                }
            }
            index.insert(id, trials.len());
            trials.push(Trial::new(id, configuration, at));
        }
        JournalRecord::Update { id, update, at } => {
            let trial = index
                .get(&id)
                .and_then(|i| trials.get_mut(*i))
                .ok_or_else(|| LedgerError::Corrupt {
                    line,
                    message: format!("update for unknown trial {id}"),
                })?;
            trial.apply(update, at).map_err(|e| LedgerError::Corrupt {
                line,
                message: e.to_string(),
            })?;
        }
    }
    Ok(())
}
