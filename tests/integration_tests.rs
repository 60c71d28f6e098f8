//! End-to-end challenge runs against a scripted judge and an in-memory store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use gauntlet::{
    ActionKind, JudgeError, ParticipantStatus, Problem, ProblemCatalog, RatingStore, SessionEvent,
    SessionManager, SqliteStore, StatusClient, Submission, ValidationError, Verdict,
};

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Scripted judge: accepted handles solve on their first poll, everyone else
/// has no submissions; the whole service can be switched into failure.
struct ScriptedJudge {
    accepted_handles: Mutex<HashSet<String>>,
    failing: AtomicBool,
}

impl ScriptedJudge {
    fn new() -> Self {
        ScriptedJudge {
            accepted_handles: Mutex::new(HashSet::new()),
            failing: AtomicBool::new(false),
        }
    }

    fn accept(&self, handle: &str) {
        self.accepted_handles
            .lock()
            .unwrap()
            .insert(handle.to_string());
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatusClient for ScriptedJudge {
    async fn query_status(
        &self,
        contest_id: u32,
        handle: &str,
        _from: u32,
        _count: u32,
    ) -> Result<Vec<Submission>, JudgeError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(JudgeError::ServiceUnavailable("down".to_string()));
        }
        if self.accepted_handles.lock().unwrap().contains(handle) {
            Ok(vec![Submission {
                contest_id,
                problem_index: "A".to_string(),
                verdict: Verdict::Accepted,
                creation_time_secs: epoch_now(),
            }])
        } else {
            Ok(Vec::new())
        }
    }
}

struct Fixture {
    manager: SessionManager,
    store: Arc<SqliteStore>,
    judge: Arc<ScriptedJudge>,
    server_id: Uuid,
    participants: Vec<Uuid>,
}

fn fixture(participants: usize) -> Fixture {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let judge = Arc::new(ScriptedJudge::new());
    let server_id = Uuid::new_v4();
    let ids: Vec<Uuid> = (0..participants).map(|_| Uuid::new_v4()).collect();
    for (i, &id) in ids.iter().enumerate() {
        store
            .link_handle(server_id, id, &format!("handle_{}", i))
            .unwrap();
    }
    let catalog = Arc::new(ProblemCatalog::from_problems([
        Problem {
            contest_id: 1000,
            index: "A".to_string(),
            name: "Theatre Square".to_string(),
            rating: 1500,
        },
        Problem {
            contest_id: 2000,
            index: "A".to_string(),
            name: "Watermelon".to_string(),
            rating: 1500,
        },
    ]));
    let manager = SessionManager::new(store.clone(), store.clone(), judge.clone(), catalog);
    Fixture {
        manager,
        store,
        judge,
        server_id,
        participants: ids,
    }
}

/// Drains events until the session ends, tolerating broadcast lag.
async fn wait_for_end(mut events: broadcast::Receiver<SessionEvent>) -> SessionEvent {
    loop {
        match events.recv().await {
            Ok(event @ SessionEvent::FinalResults { .. })
            | Ok(event @ SessionEvent::Aborted { .. }) => return event,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("session ended without a result"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn solver_wins_quitter_loses() {
    let fx = fixture(2);
    fx.judge.accept("handle_0");

    let (session_id, events) = fx
        .manager
        .start_challenge(fx.server_id, "1000A", &fx.participants, 60)
        .unwrap();
    for &participant in &fx.participants {
        fx.manager
            .submit_action(session_id, participant, ActionKind::Confirm)
            .unwrap();
    }

    let SessionEvent::FinalResults { participants, .. } = wait_for_end(events).await else {
        panic!("expected final results");
    };
    assert_eq!(participants[0].status, ParticipantStatus::Solved);
    assert_eq!(participants[1].status, ParticipantStatus::GaveUp);

    // predict(1500, 1500, 60) = (-12, +15); each applied exactly once.
    assert_eq!(
        fx.store
            .rating_history(fx.server_id, fx.participants[0])
            .unwrap(),
        vec![1515]
    );
    assert_eq!(
        fx.store
            .rating_history(fx.server_id, fx.participants[1])
            .unwrap(),
        vec![1488]
    );
    // Both records gained the problem, win or lose.
    for &participant in &fx.participants {
        assert!(fx
            .store
            .solved_history(fx.server_id, participant)
            .unwrap()
            .contains("1000A"));
    }
    assert!(fx.manager.registry().is_empty());
    assert!(fx.manager.list_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn half_confirmed_challenge_aborts_without_side_effects() {
    let fx = fixture(2);
    let (session_id, events) = fx
        .manager
        .start_challenge(fx.server_id, "1000A", &fx.participants, 40)
        .unwrap();
    fx.manager
        .submit_action(session_id, fx.participants[0], ActionKind::Confirm)
        .unwrap();

    let SessionEvent::Aborted { reason, .. } = wait_for_end(events).await else {
        panic!("expected abort");
    };
    assert_eq!(reason, "Confirmation failed");
    assert!(fx.manager.registry().is_empty());
    for &participant in &fx.participants {
        assert!(fx
            .store
            .rating_history(fx.server_id, participant)
            .unwrap()
            .is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn retracted_acknowledgement_counts_as_missing() {
    let fx = fixture(2);
    let (session_id, events) = fx
        .manager
        .start_challenge(fx.server_id, "1000A", &fx.participants, 40)
        .unwrap();
    fx.manager
        .submit_action(session_id, fx.participants[0], ActionKind::Confirm)
        .unwrap();
    fx.manager
        .submit_action(session_id, fx.participants[0], ActionKind::Retract)
        .unwrap();
    fx.manager
        .submit_action(session_id, fx.participants[1], ActionKind::Confirm)
        .unwrap();

    let SessionEvent::Aborted { reason, .. } = wait_for_end(events).await else {
        panic!("expected abort");
    };
    assert_eq!(reason, "Confirmation failed");
    assert!(fx.manager.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn outage_withdrawal_skips_rating_and_flag_clears_later() {
    let fx = fixture(2);
    fx.judge.set_failing(true);

    let (session_id, mut events) = fx
        .manager
        .start_challenge(fx.server_id, "1000A", &fx.participants, 60)
        .unwrap();
    for &participant in &fx.participants {
        fx.manager
            .submit_action(session_id, participant, ActionKind::Confirm)
            .unwrap();
    }

    // Wait until the outage is visible, then participant 0 walks away free
    // while participant 1 rides the challenge out.
    loop {
        match events.recv().await {
            Ok(SessionEvent::StatusRefresh {
                service_degraded: true,
                ..
            }) => break,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(err) => panic!("never observed the degraded judge: {}", err),
        }
    }
    fx.manager
        .submit_action(session_id, fx.participants[0], ActionKind::Withdraw)
        .unwrap();

    let SessionEvent::FinalResults { participants, .. } = wait_for_end(events).await else {
        panic!("expected final results");
    };
    assert_eq!(participants[0].status, ParticipantStatus::WithdrawnNoChange);
    assert_eq!(participants[1].status, ParticipantStatus::GaveUp);
    assert!(fx
        .store
        .rating_history(fx.server_id, fx.participants[0])
        .unwrap()
        .is_empty());
    assert_eq!(
        fx.store
            .rating_history(fx.server_id, fx.participants[1])
            .unwrap(),
        vec![1488]
    );
    assert!(fx.manager.registry().is_empty());
    // The judge stayed down for the whole run.
    assert!(fx.manager.health().is_degraded());

    // A healthy challenge afterwards clears the flag on its first successful
    // query. Participant 0 withdrew without recording the problem, so they
    // are free to run it again.
    fx.judge.set_failing(false);
    fx.judge.accept("handle_0");
    let (session_id, events) = fx
        .manager
        .start_challenge(fx.server_id, "1000A", &fx.participants[..1], 60)
        .unwrap();
    fx.manager
        .submit_action(session_id, fx.participants[0], ActionKind::Confirm)
        .unwrap();
    let SessionEvent::FinalResults { participants, .. } = wait_for_end(events).await else {
        panic!("expected final results");
    };
    assert_eq!(participants[0].status, ParticipantStatus::Solved);
    assert!(!fx.manager.health().is_degraded());
}

#[tokio::test(start_paused = true)]
async fn overlapping_participants_cannot_run_twice() {
    let fx = fixture(3);
    let (first, _events) = fx
        .manager
        .start_challenge(fx.server_id, "1000A", &fx.participants[..2], 60)
        .unwrap();
    for &participant in &fx.participants[..2] {
        fx.manager
            .submit_action(first, participant, ActionKind::Confirm)
            .unwrap();
    }

    // Wait for the first session's reservation to land.
    let mut events = fx.manager.subscribe(first).unwrap();
    loop {
        match events.recv().await {
            Ok(SessionEvent::ConfirmationResult { confirmed, .. }) => {
                assert!(confirmed);
                break;
            }
            Ok(_) => continue,
            Err(err) => panic!("first session never confirmed: {}", err),
        }
    }
    assert_eq!(fx.manager.registry().len(), 2);

    let overlap = fx
        .manager
        .start_challenge(fx.server_id, "1000A", &fx.participants[1..], 60);
    assert_eq!(overlap.unwrap_err(), ValidationError::AlreadyInChallenge);
    // The losing request reserved nothing.
    assert_eq!(fx.manager.registry().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn single_participant_solo_run_solves() {
    let fx = fixture(1);
    fx.judge.accept("handle_0");

    let (session_id, events) = fx
        .manager
        .start_challenge(fx.server_id, "1000A", &fx.participants, 80)
        .unwrap();
    fx.manager
        .submit_action(session_id, fx.participants[0], ActionKind::Confirm)
        .unwrap();

    let SessionEvent::FinalResults { participants, .. } = wait_for_end(events).await else {
        panic!("expected final results");
    };
    assert_eq!(participants[0].status, ParticipantStatus::Solved);
    // predict(1500, 1500, 80) wins +12.
    assert_eq!(
        fx.store
            .rating_history(fx.server_id, fx.participants[0])
            .unwrap(),
        vec![1512]
    );
}
