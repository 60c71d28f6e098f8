//! Timed, multi-participant skill challenges judged by an external
//! competitive-programming service.
//!
//! A challenge runs in phases: every participant acknowledges within 30
//! seconds, the engine reserves them (one active challenge per participant
//! per server), polls the judge for verdicts during the timed window, waits
//! out any submissions still in the judging queue, and finally applies a
//! rating delta per participant exactly once.
//!
//! ## Example usage
//! ```no_run
//! use std::sync::Arc;
//! use gauntlet::{ActionKind, HttpStatusClient, Problem, ProblemCatalog, SessionManager, SqliteStore};
//! use uuid::Uuid;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = Arc::new(SqliteStore::open("bot_data.db").unwrap());
//! let judge = Arc::new(HttpStatusClient::new("https://codeforces.com/api"));
//! let catalog = Arc::new(ProblemCatalog::from_problems([Problem {
//!     contest_id: 1000,
//!     index: "A".to_string(),
//!     name: "Theatre Square".to_string(),
//!     rating: 1500,
//! }]));
//! let manager = SessionManager::new(store.clone(), store.clone(), judge, catalog);
//!
//! let server = Uuid::new_v4();
//! let alice = Uuid::new_v4();
//! store.link_handle(server, alice, "alice_cf").unwrap();
//!
//! let (session_id, mut events) = manager
//!     .start_challenge(server, "1000A", &[alice], 60)
//!     .unwrap();
//! manager.submit_action(session_id, alice, ActionKind::Confirm).unwrap();
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```

pub mod confirmation;
pub mod grace;
pub mod judge;
pub mod manager;
pub mod poll;
pub mod problems;
pub mod rating;
pub mod registry;
pub mod session;
pub mod store;

#[cfg(feature = "server")]
pub mod server;

pub use confirmation::{GateOutcome, CONFIRM_WINDOW_SECS};
pub use grace::{GRACE_CHECK_SECS, GRACE_WAIT_SECS};
pub use judge::{
    HttpStatusClient, JudgeError, ServiceHealth, StatusClient, Submission, Verdict,
};
pub use manager::{
    ActionKind, ParticipantSnapshot, SessionEvent, SessionManager, SessionQueryError, SessionView,
    ValidationError,
};
pub use poll::{POLL_TICK_SECS, REFRESH_EVERY_SECS};
pub use problems::{Problem, ProblemCatalog};
pub use rating::predict;
pub use registry::{ActiveChallengeRegistry, ChallengeKey};
pub use session::{
    ChallengeSession, ParticipantStatus, SessionError, SessionPhase, ALLOWED_LENGTHS_MINUTES,
    MAX_PARTICIPANTS,
};
pub use store::{IdentityResolver, RatingStore, SqliteStore, StoreError, DEFAULT_RATING};
