//! # sweep-optimizer
//!
//! Search orchestration for alpha-sweep.
//!
//! Provides search spaces and candidate sources (grid, random, TPE), the
//! region metadata that builds a settings space, the duplicate guard,
//! objective scorers, study configuration and the concurrent orchestrator
//! that ties them to the trial ledger and the evaluation backend.

mod guard;
mod metadata;
mod orchestrator;
mod scorer;
mod search;
mod study;

pub use guard::DuplicateGuard;
pub use metadata::{RegionDomains, RegionMetadata};
pub use orchestrator::{Orchestrator, ResumeReport, ShutdownHandle};
pub use scorer::{
    NetCalmarScorer, ObjectiveKind, Score, Scorer, ScoringConfig, SharpeFitnessScorer,
};
pub use search::{
    CandidateSource, Enumeration, GridSource, ParameterDef, RandomSource, SearchSpace, TpeSource,
};
pub use study::{Strategy, StudyConfig, StudySummary, MAX_CONCURRENCY};
