use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use serde::{Serialize, Deserialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::confirmation::{ConfirmationGate, GateOutcome, CONFIRM_WINDOW_SECS};
use crate::grace::GraceQueueWaiter;
use crate::judge::{accepted_in_window, ServiceHealth, StatusClient, STATUS_QUERY_COUNT};
use crate::poll::PollScheduler;
use crate::problems::{Problem, ProblemCatalog};
use crate::rating::predict;
use crate::registry::ActiveChallengeRegistry;
use crate::session::{ChallengeSession, ParticipantStatus, SessionError, SessionPhase};
use crate::store::{IdentityResolver, RatingStore, StoreError};

/// Participant-initiated action, keyed by (session, participant, kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Acknowledge the challenge during confirmation.
    Confirm,
    /// Take back an acknowledgement before the confirmation deadline.
    Retract,
    /// Forfeit during the active window; the lose delta applies immediately.
    GiveUp,
    /// Leave without a rating change; only honored while the judge is degraded.
    Withdraw,
}

#[derive(Debug, Clone, Copy)]
pub struct ActionRequest {
    pub participant_id: Uuid,
    pub kind: ActionKind,
}

/// How a participant left the `Pending` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Solved,
    GaveUp,
    Withdrawn,
}

/// Why a challenge could not be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidLength,
    UnknownProblem,
    NoParticipants,
    TooManyParticipants,
    AlreadyInChallenge,
    HandleNotLinked,
    ProblemAlreadyDone,
    Internal(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValidationError::InvalidLength => {
                write!(f, "Invalid length. Valid lengths are 40, 60, and 80 minutes.")
            }
            ValidationError::UnknownProblem => write!(
                f,
                "Invalid problem. Make sure it is the concatenation of contest ID and problem index, for example 1000A."
            ),
            ValidationError::NoParticipants => write!(f, "A challenge needs at least one participant."),
            ValidationError::TooManyParticipants => write!(f, "Too many users (limit is 5)."),
            ValidationError::AlreadyInChallenge => {
                write!(f, "One or more users are already in a challenge.")
            }
            ValidationError::HandleNotLinked => {
                write!(f, "One or more users have not linked a handle.")
            }
            ValidationError::ProblemAlreadyDone => {
                write!(f, "One or more users have already done this problem.")
            }
            ValidationError::Internal(msg) => write!(f, "Something went wrong: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Errors from the action and query entry points.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionQueryError {
    SessionNotFound,
    LockError,
}

impl fmt::Display for SessionQueryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionQueryError::SessionNotFound => write!(f, "Challenge not found"),
            SessionQueryError::LockError => write!(f, "Internal lock error"),
        }
    }
}

impl std::error::Error for SessionQueryError {}

/// One participant's row in an event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub participant_id: Uuid,
    pub rating: i64,
    pub status: ParticipantStatus,
    /// Predicted deltas; present only while the participant is pending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lose_delta: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub win_delta: Option<i64>,
}

/// Events broadcast to session subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    ConfirmationRequested {
        session_id: Uuid,
        problem_id: String,
        length_minutes: u32,
        deadline_epoch_secs: u64,
        participants: Vec<ParticipantSnapshot>,
    },
    ConfirmationResult {
        session_id: Uuid,
        confirmed: bool,
    },
    StatusRefresh {
        session_id: Uuid,
        ends_at_epoch_secs: u64,
        service_degraded: bool,
        participants: Vec<ParticipantSnapshot>,
    },
    FinalResults {
        session_id: Uuid,
        problem_id: String,
        participants: Vec<ParticipantSnapshot>,
    },
    Aborted {
        session_id: Uuid,
        reason: String,
    },
}

/// Point-in-time view of a session, kept current for status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub server_id: Uuid,
    pub problem_id: String,
    pub length_minutes: u32,
    pub phase: SessionPhase,
    pub start_time_epoch_secs: Option<u64>,
    pub service_degraded: bool,
    pub participants: Vec<ParticipantSnapshot>,
}

/// Session-level failure that aborts the whole challenge.
#[derive(Debug)]
enum SessionFailure {
    ConfirmationTimeout,
    ConfirmationConflict,
    ReservationLost,
    Store(StoreError),
    Internal(SessionError),
}

impl SessionFailure {
    /// User-facing abort notice; mid-challenge failures stay generic.
    fn public_reason(&self) -> String {
        match self {
            SessionFailure::ConfirmationTimeout => "Confirmation failed".to_string(),
            SessionFailure::ConfirmationConflict | SessionFailure::ReservationLost => {
                "One or more users are already in a challenge.".to_string()
            }
            SessionFailure::Store(_) | SessionFailure::Internal(_) => {
                "Something went wrong, the challenge is stopped.".to_string()
            }
        }
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionFailure::ConfirmationTimeout => write!(f, "confirmation timed out"),
            SessionFailure::ConfirmationConflict => write!(f, "confirmation conflict"),
            SessionFailure::ReservationLost => write!(f, "registry reservation lost"),
            SessionFailure::Store(err) => write!(f, "store failure: {}", err),
            SessionFailure::Internal(err) => write!(f, "internal failure: {}", err),
        }
    }
}

fn epoch_secs_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Everything a running session needs to apply outcomes and talk to the world.
pub(crate) struct SessionDeps {
    pub(crate) store: Arc<dyn RatingStore>,
    pub(crate) judge: Arc<dyn StatusClient>,
    pub(crate) registry: ActiveChallengeRegistry,
    pub(crate) health: ServiceHealth,
    pub(crate) events: broadcast::Sender<SessionEvent>,
    pub(crate) view: Arc<RwLock<SessionView>>,
    pub(crate) problem: Problem,
    pub(crate) handles: Vec<String>,
}

impl SessionDeps {
    /// Resolves one participant exactly once: the registry release is the
    /// guard, the rating update (if any) follows in the same step.
    pub(crate) fn resolve(
        &self,
        session: &mut ChallengeSession,
        index: usize,
        outcome: Outcome,
    ) -> Result<(), StoreError> {
        let participant = session.participants()[index];
        let key = (participant, session.server_id());
        if !self.registry.release(key) {
            // Someone else already finalized this participant.
            return Ok(());
        }

        let status = match outcome {
            Outcome::Solved => ParticipantStatus::Solved,
            Outcome::GaveUp => ParticipantStatus::GaveUp,
            Outcome::Withdrawn => ParticipantStatus::WithdrawnNoChange,
        };
        if session.set_status(index, status).is_err() {
            return Ok(());
        }

        match outcome {
            Outcome::Solved | Outcome::GaveUp => {
                let rating = self.store.rating(session.server_id(), participant)?;
                let (lose, win) = predict(rating, self.problem.rating, session.length_minutes());
                let delta = if outcome == Outcome::Solved { win } else { lose };
                self.store.apply_rating_update(
                    session.server_id(),
                    participant,
                    rating + delta,
                    session.problem_id(),
                )?;
                log::info!(
                    "challenge {}: participant {} resolved {:?} ({} -> {})",
                    session.id(),
                    participant,
                    status,
                    rating,
                    rating + delta
                );
            }
            Outcome::Withdrawn => {
                log::info!(
                    "challenge {}: participant {} withdrew without rating change",
                    session.id(),
                    participant
                );
            }
        }

        self.emit_refresh(session)
    }

    /// Handles a give-up or withdrawal while the challenge is live.
    pub(crate) fn apply_action(
        &self,
        session: &mut ChallengeSession,
        action: ActionRequest,
    ) -> Result<(), StoreError> {
        let Some(index) = session.index_of(action.participant_id) else {
            return Ok(());
        };
        match action.kind {
            ActionKind::GiveUp => self.resolve(session, index, Outcome::GaveUp),
            ActionKind::Withdraw if self.health.is_degraded() => {
                self.resolve(session, index, Outcome::Withdrawn)
            }
            _ => Ok(()),
        }
    }

    fn snapshots(&self, session: &ChallengeSession) -> Result<Vec<ParticipantSnapshot>, StoreError> {
        session
            .participants()
            .iter()
            .enumerate()
            .map(|(index, &participant)| {
                let rating = self.store.rating(session.server_id(), participant)?;
                let status = session.statuses()[index];
                let (lose_delta, win_delta) = if status == ParticipantStatus::Pending {
                    let (lose, win) = predict(rating, self.problem.rating, session.length_minutes());
                    (Some(lose), Some(win))
                } else {
                    (None, None)
                };
                Ok(ParticipantSnapshot {
                    participant_id: participant,
                    rating,
                    status,
                    lose_delta,
                    win_delta,
                })
            })
            .collect()
    }

    fn sync_view(&self, session: &ChallengeSession, participants: &[ParticipantSnapshot]) {
        if let Ok(mut view) = self.view.write() {
            view.phase = session.phase();
            view.start_time_epoch_secs = session.start_time();
            view.service_degraded = self.health.is_degraded();
            view.participants = participants.to_vec();
        }
    }

    /// Emits a status refresh and keeps the queryable view current.
    pub(crate) fn emit_refresh(&self, session: &ChallengeSession) -> Result<(), StoreError> {
        let participants = self.snapshots(session)?;
        self.sync_view(session, &participants);
        let ends_at_epoch_secs = session.window().map(|(_, end)| end).unwrap_or_default();
        let _ = self.events.send(SessionEvent::StatusRefresh {
            session_id: session.id(),
            ends_at_epoch_secs,
            service_degraded: self.health.is_degraded(),
            participants,
        });
        Ok(())
    }

    fn emit_final(&self, session: &ChallengeSession) -> Result<(), StoreError> {
        let participants = self.snapshots(session)?;
        self.sync_view(session, &participants);
        let _ = self.events.send(SessionEvent::FinalResults {
            session_id: session.id(),
            problem_id: session.problem_id().to_string(),
            participants,
        });
        Ok(())
    }
}

struct SessionHandle {
    actions: mpsc::UnboundedSender<ActionRequest>,
    events: broadcast::Sender<SessionEvent>,
    view: Arc<RwLock<SessionView>>,
}

/// Manages concurrent challenge sessions.
///
/// One spawned task drives each session from confirmation through
/// finalization; the manager is the entry point for creating challenges,
/// submitting participant actions, and subscribing to lifecycle events.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn RatingStore>,
    identities: Arc<dyn IdentityResolver>,
    judge: Arc<dyn StatusClient>,
    catalog: Arc<ProblemCatalog>,
    registry: ActiveChallengeRegistry,
    health: ServiceHealth,
    sessions: Arc<RwLock<HashMap<Uuid, SessionHandle>>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn RatingStore>,
        identities: Arc<dyn IdentityResolver>,
        judge: Arc<dyn StatusClient>,
        catalog: Arc<ProblemCatalog>,
    ) -> Self {
        SessionManager {
            store,
            identities,
            judge,
            catalog,
            registry: ActiveChallengeRegistry::new(),
            health: ServiceHealth::new(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &ActiveChallengeRegistry {
        &self.registry
    }

    pub fn health(&self) -> &ServiceHealth {
        &self.health
    }

    /// Validates and launches a challenge. On success the session is awaiting
    /// confirmation and its driver task is running; the returned receiver
    /// sees every lifecycle event from `ConfirmationRequested` on.
    pub fn start_challenge(
        &self,
        server_id: Uuid,
        problem_id: &str,
        participants: &[Uuid],
        length_minutes: u32,
    ) -> Result<(Uuid, broadcast::Receiver<SessionEvent>), ValidationError> {
        let mut session = ChallengeSession::new(
            Uuid::new_v4(),
            server_id,
            problem_id,
            participants,
            length_minutes,
        )
        .map_err(|err| match err {
            SessionError::NoParticipants => ValidationError::NoParticipants,
            SessionError::TooManyParticipants => ValidationError::TooManyParticipants,
            _ => ValidationError::InvalidLength,
        })?;

        let problem = self
            .catalog
            .get(problem_id)
            .ok_or(ValidationError::UnknownProblem)?
            .clone();

        if session
            .registry_keys()
            .iter()
            .any(|&key| self.registry.is_registered(key))
        {
            return Err(ValidationError::AlreadyInChallenge);
        }

        let mut handles = Vec::with_capacity(session.participants().len());
        for &participant in session.participants() {
            match self
                .identities
                .linked_handle(server_id, participant)
                .map_err(|e| ValidationError::Internal(e.to_string()))?
            {
                Some(handle) => handles.push(handle),
                None => return Err(ValidationError::HandleNotLinked),
            }
        }

        for &participant in session.participants() {
            let history = self
                .store
                .solved_history(server_id, participant)
                .map_err(|e| ValidationError::Internal(e.to_string()))?;
            if history.contains(problem_id) {
                return Err(ValidationError::ProblemAlreadyDone);
            }
        }

        session
            .begin_confirmation()
            .map_err(|e| ValidationError::Internal(e.to_string()))?;

        let session_id = session.id();
        let (events_tx, events_rx) = broadcast::channel(64);
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let view = Arc::new(RwLock::new(SessionView {
            session_id,
            server_id,
            problem_id: problem_id.to_string(),
            length_minutes: session.length_minutes(),
            phase: session.phase(),
            start_time_epoch_secs: None,
            service_degraded: self.health.is_degraded(),
            participants: Vec::new(),
        }));

        let deps = SessionDeps {
            store: self.store.clone(),
            judge: self.judge.clone(),
            registry: self.registry.clone(),
            health: self.health.clone(),
            events: events_tx.clone(),
            view: view.clone(),
            problem,
            handles,
        };

        let initial = deps
            .snapshots(&session)
            .map_err(|e| ValidationError::Internal(e.to_string()))?;
        deps.sync_view(&session, &initial);

        {
            let mut sessions = self
                .sessions
                .write()
                .map_err(|_| ValidationError::Internal("lock poisoned".to_string()))?;
            sessions.insert(
                session_id,
                SessionHandle {
                    actions: actions_tx,
                    events: events_tx,
                    view,
                },
            );
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.drive_session(session, deps, actions_rx, initial).await;
        });

        log::info!("challenge {} created for {} participant(s)", session_id, participants.len());
        Ok((session_id, events_rx))
    }

    /// Entry point for participant actions, keyed by
    /// (session, participant, kind). Actions that do not apply to the
    /// session's current phase are ignored by the driver.
    pub fn submit_action(
        &self,
        session_id: Uuid,
        participant_id: Uuid,
        kind: ActionKind,
    ) -> Result<(), SessionQueryError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| SessionQueryError::LockError)?;
        let handle = sessions
            .get(&session_id)
            .ok_or(SessionQueryError::SessionNotFound)?;
        handle
            .actions
            .send(ActionRequest {
                participant_id,
                kind,
            })
            .map_err(|_| SessionQueryError::SessionNotFound)
    }

    /// Subscribe to a live session's lifecycle events.
    pub fn subscribe(&self, session_id: Uuid) -> Result<broadcast::Receiver<SessionEvent>, SessionQueryError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| SessionQueryError::LockError)?;
        let handle = sessions
            .get(&session_id)
            .ok_or(SessionQueryError::SessionNotFound)?;
        Ok(handle.events.subscribe())
    }

    pub fn session_view(&self, session_id: Uuid) -> Result<SessionView, SessionQueryError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| SessionQueryError::LockError)?;
        let handle = sessions
            .get(&session_id)
            .ok_or(SessionQueryError::SessionNotFound)?;
        handle
            .view
            .read()
            .map(|view| view.clone())
            .map_err(|_| SessionQueryError::LockError)
    }

    /// Sessions still live (confirming, active, or finalizing).
    pub fn list_sessions(&self) -> Vec<Uuid> {
        match self.sessions.read() {
            Ok(sessions) => sessions.keys().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn remove_session(&self, session_id: Uuid) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove(&session_id);
        }
    }

    async fn drive_session(
        self,
        mut session: ChallengeSession,
        deps: SessionDeps,
        mut actions: mpsc::UnboundedReceiver<ActionRequest>,
        initial: Vec<ParticipantSnapshot>,
    ) {
        let session_id = session.id();
        let result = self
            .run_phases(&mut session, &deps, &mut actions, initial)
            .await;

        if let Err(failure) = result {
            // Release anything still reserved; rating updates already applied
            // stay in place.
            for key in session.registry_keys() {
                deps.registry.release(key);
            }
            log::error!("challenge {} aborted: {}", session_id, failure);
            let _ = session.abort();
            if let Ok(mut view) = deps.view.write() {
                view.phase = SessionPhase::Aborted;
            }
            let _ = deps.events.send(SessionEvent::Aborted {
                session_id,
                reason: failure.public_reason(),
            });
        }

        self.remove_session(session_id);
    }

    async fn run_phases(
        &self,
        session: &mut ChallengeSession,
        deps: &SessionDeps,
        actions: &mut mpsc::UnboundedReceiver<ActionRequest>,
        initial: Vec<ParticipantSnapshot>,
    ) -> Result<(), SessionFailure> {
        let session_id = session.id();
        let deadline = Instant::now() + Duration::from_secs(CONFIRM_WINDOW_SECS);
        let _ = deps.events.send(SessionEvent::ConfirmationRequested {
            session_id,
            problem_id: session.problem_id().to_string(),
            length_minutes: session.length_minutes(),
            deadline_epoch_secs: epoch_secs_now() + CONFIRM_WINDOW_SECS,
            participants: initial,
        });

        let gate = ConfirmationGate::new(
            session.participants(),
            session.server_id(),
            &deps.registry,
            actions,
        );
        let outcome = gate.run(deadline).await;

        let failure = match outcome {
            GateOutcome::Confirmed => {
                if deps.registry.try_reserve(&session.registry_keys()) {
                    None
                } else {
                    Some(SessionFailure::ReservationLost)
                }
            }
            GateOutcome::TimedOut => Some(SessionFailure::ConfirmationTimeout),
            GateOutcome::Conflict => Some(SessionFailure::ConfirmationConflict),
        };
        if let Some(failure) = failure {
            let _ = deps.events.send(SessionEvent::ConfirmationResult {
                session_id,
                confirmed: false,
            });
            return Err(failure);
        }
        let _ = deps.events.send(SessionEvent::ConfirmationResult {
            session_id,
            confirmed: true,
        });

        session
            .activate(epoch_secs_now())
            .map_err(SessionFailure::Internal)?;
        let activated_at = Instant::now();

        PollScheduler::new(session, deps, actions)
            .run(activated_at)
            .await
            .map_err(SessionFailure::Store)?;

        if !session.all_resolved() {
            session.begin_grace().map_err(SessionFailure::Internal)?;
            GraceQueueWaiter::new(session, deps, actions)
                .run(Instant::now())
                .await
                .map_err(SessionFailure::Store)?;
        }

        session
            .begin_finalizing()
            .map_err(SessionFailure::Internal)?;
        self.finalize(session, deps)
            .await
            .map_err(SessionFailure::Store)?;

        session.close().map_err(SessionFailure::Internal)?;
        deps.emit_final(session).map_err(SessionFailure::Store)?;
        log::info!("challenge {} closed", session_id);
        Ok(())
    }

    /// One last verdict check for every unresolved participant; an
    /// unreachable judge counts as not solved.
    async fn finalize(
        &self,
        session: &mut ChallengeSession,
        deps: &SessionDeps,
    ) -> Result<(), StoreError> {
        let Some((start, end)) = session.window() else {
            return Ok(());
        };
        for index in session.pending_indices() {
            let handle = &deps.handles[index];
            let solved = match deps
                .judge
                .query_status(deps.problem.contest_id, handle, 1, STATUS_QUERY_COUNT)
                .await
            {
                Ok(submissions) => {
                    deps.health.mark_healthy();
                    accepted_in_window(&submissions, &deps.problem, start, end)
                }
                Err(err) => {
                    deps.health.mark_degraded();
                    log::warn!("final verdict check failed for {}: {}", handle, err);
                    false
                }
            };
            let outcome = if solved { Outcome::Solved } else { Outcome::GaveUp };
            deps.resolve(session, index, outcome)?;
        }
        Ok(())
    }
}
