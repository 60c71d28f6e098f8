use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::manager::{ActionKind, ActionRequest};
use crate::registry::{ActiveChallengeRegistry, ChallengeKey};

/// Seconds participants have to acknowledge a challenge.
pub const CONFIRM_WINDOW_SECS: u64 = 30;

/// Result of running the confirmation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Every participant was simultaneously ready before the deadline.
    Confirmed,
    TimedOut,
    /// A participant entered another challenge while this one was confirming.
    Conflict,
}

/// Collects an acknowledgement from every participant before a fixed
/// deadline. Acknowledgements can be retracted until the gate closes; the
/// gate succeeds the moment the ready set covers all participants.
pub(crate) struct ConfirmationGate<'a> {
    participants: &'a [Uuid],
    server_id: Uuid,
    registry: &'a ActiveChallengeRegistry,
    actions: &'a mut mpsc::UnboundedReceiver<ActionRequest>,
}

impl<'a> ConfirmationGate<'a> {
    pub(crate) fn new(
        participants: &'a [Uuid],
        server_id: Uuid,
        registry: &'a ActiveChallengeRegistry,
        actions: &'a mut mpsc::UnboundedReceiver<ActionRequest>,
    ) -> Self {
        ConfirmationGate {
            participants,
            server_id,
            registry,
            actions,
        }
    }

    pub(crate) async fn run(mut self, deadline: Instant) -> GateOutcome {
        let mut ready: HashSet<Uuid> = HashSet::new();
        loop {
            if ready.len() == self.participants.len() {
                // A concurrently confirming session may have claimed one of
                // these participants first; the caller must treat that as
                // failure.
                let keys: Vec<ChallengeKey> = self
                    .participants
                    .iter()
                    .map(|&participant| (participant, self.server_id))
                    .collect();
                return if self.registry.any_registered(&keys) {
                    GateOutcome::Conflict
                } else {
                    GateOutcome::Confirmed
                };
            }

            tokio::select! {
                _ = sleep_until(deadline) => return GateOutcome::TimedOut,
                action = self.actions.recv() => match action {
                    Some(action) if self.participants.contains(&action.participant_id) => {
                        match action.kind {
                            ActionKind::Confirm => {
                                ready.insert(action.participant_id);
                            }
                            ActionKind::Retract => {
                                ready.remove(&action.participant_id);
                            }
                            _ => {}
                        }
                    }
                    Some(_) => {}
                    // Channel gone: nobody can ever confirm.
                    None => return GateOutcome::TimedOut,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn setup(
        n: usize,
    ) -> (
        Vec<Uuid>,
        Uuid,
        ActiveChallengeRegistry,
        mpsc::UnboundedSender<ActionRequest>,
        mpsc::UnboundedReceiver<ActionRequest>,
    ) {
        let participants: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        let server_id = Uuid::new_v4();
        let registry = ActiveChallengeRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        (participants, server_id, registry, tx, rx)
    }

    fn confirm(participant_id: Uuid) -> ActionRequest {
        ActionRequest {
            participant_id,
            kind: ActionKind::Confirm,
        }
    }

    fn retract(participant_id: Uuid) -> ActionRequest {
        ActionRequest {
            participant_id,
            kind: ActionKind::Retract,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_confirm_succeeds() {
        let (participants, server_id, registry, tx, mut rx) = setup(2);
        tx.send(confirm(participants[0])).unwrap();
        tx.send(confirm(participants[1])).unwrap();

        let gate = ConfirmationGate::new(&participants, server_id, &registry, &mut rx);
        let outcome = gate.run(Instant::now() + Duration::from_secs(CONFIRM_WINDOW_SECS)).await;
        assert_eq!(outcome, GateOutcome::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_confirmation_times_out() {
        let (participants, server_id, registry, tx, mut rx) = setup(2);
        tx.send(confirm(participants[0])).unwrap();

        let gate = ConfirmationGate::new(&participants, server_id, &registry, &mut rx);
        let started = Instant::now();
        let outcome = gate.run(started + Duration::from_secs(CONFIRM_WINDOW_SECS)).await;
        assert_eq!(outcome, GateOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(CONFIRM_WINDOW_SECS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retraction_removes_from_ready_set() {
        let (participants, server_id, registry, tx, mut rx) = setup(2);
        tx.send(confirm(participants[0])).unwrap();
        tx.send(retract(participants[0])).unwrap();
        tx.send(confirm(participants[1])).unwrap();

        // The ready set is never simultaneously full, so the gate times out.
        let gate = ConfirmationGate::new(&participants, server_id, &registry, &mut rx);
        let outcome = gate.run(Instant::now() + Duration::from_secs(CONFIRM_WINDOW_SECS)).await;
        assert_eq!(outcome, GateOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfirm_after_retraction() {
        let (participants, server_id, registry, tx, mut rx) = setup(2);
        tx.send(confirm(participants[0])).unwrap();
        tx.send(retract(participants[0])).unwrap();
        tx.send(confirm(participants[0])).unwrap();
        tx.send(confirm(participants[1])).unwrap();

        let gate = ConfirmationGate::new(&participants, server_id, &registry, &mut rx);
        let outcome = gate.run(Instant::now() + Duration::from_secs(CONFIRM_WINDOW_SECS)).await;
        assert_eq!(outcome, GateOutcome::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_strangers_and_other_actions_ignored() {
        let (participants, server_id, registry, tx, mut rx) = setup(1);
        tx.send(confirm(Uuid::new_v4())).unwrap();
        tx.send(ActionRequest {
            participant_id: participants[0],
            kind: ActionKind::GiveUp,
        })
        .unwrap();
        tx.send(confirm(participants[0])).unwrap();

        let gate = ConfirmationGate::new(&participants, server_id, &registry, &mut rx);
        let outcome = gate.run(Instant::now() + Duration::from_secs(CONFIRM_WINDOW_SECS)).await;
        assert_eq!(outcome, GateOutcome::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_registration_reports_conflict() {
        let (participants, server_id, registry, tx, mut rx) = setup(2);
        // Another session claimed participant 0 while this gate was open.
        assert!(registry.try_reserve(&[(participants[0], server_id)]));
        tx.send(confirm(participants[0])).unwrap();
        tx.send(confirm(participants[1])).unwrap();

        let gate = ConfirmationGate::new(&participants, server_id, &registry, &mut rx);
        let outcome = gate.run(Instant::now() + Duration::from_secs(CONFIRM_WINDOW_SECS)).await;
        assert_eq!(outcome, GateOutcome::Conflict);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_times_out() {
        let (participants, server_id, registry, tx, mut rx) = setup(1);
        drop(tx);

        let gate = ConfirmationGate::new(&participants, server_id, &registry, &mut rx);
        let outcome = gate.run(Instant::now() + Duration::from_secs(CONFIRM_WINDOW_SECS)).await;
        assert_eq!(outcome, GateOutcome::TimedOut);
    }
}
