//! Collaborators of the search orchestrator: the evaluation backend seam,
//! its retry wrapper, the HTTP backend and its sessions, and expression
//! field extraction.

mod brain;
pub mod evaluator;
pub mod expression;
pub mod retry;
pub mod session;

pub use brain::BrainEvaluator;
pub use evaluator::Evaluator;
pub use expression::extract_fields;
pub use retry::{RetryPolicy, RetryingEvaluator};
pub use session::{
    AuthenticatedSession, BrainSessionProvider, CachedSession, Credentials, SessionError,
    SessionProvider, SessionResult, DEFAULT_API_URL,
};
