use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};

use crate::judge::{accepted_in_window, JudgeError, Submission, STATUS_QUERY_COUNT};
use crate::manager::{ActionRequest, Outcome, SessionDeps};
use crate::session::ChallengeSession;
use crate::store::StoreError;

/// Seconds between verdict-poll ticks.
pub const POLL_TICK_SECS: u64 = 10;

/// Longest interval between two status-refresh emissions.
pub const REFRESH_EVERY_SECS: u64 = 30;

/// Drives the active window: round-robin verdict polling over the pending
/// participants, at most one in-flight query per participant, give-up and
/// withdrawal handling, periodic refresh emission, and early exit once
/// everyone is resolved.
pub(crate) struct PollScheduler<'a> {
    session: &'a mut ChallengeSession,
    deps: &'a SessionDeps,
    actions: &'a mut mpsc::UnboundedReceiver<ActionRequest>,
}

impl<'a> PollScheduler<'a> {
    pub(crate) fn new(
        session: &'a mut ChallengeSession,
        deps: &'a SessionDeps,
        actions: &'a mut mpsc::UnboundedReceiver<ActionRequest>,
    ) -> Self {
        PollScheduler {
            session,
            deps,
            actions,
        }
    }

    pub(crate) async fn run(mut self, activated_at: Instant) -> Result<(), StoreError> {
        let Some((start, end)) = self.session.window() else {
            return Ok(());
        };
        let total_ticks = self.session.window_secs() / POLL_TICK_SECS;

        let (results_tx, mut results_rx) =
            mpsc::unbounded_channel::<(usize, Result<Vec<Submission>, JudgeError>)>();
        let mut in_flight: HashSet<usize> = HashSet::new();
        let mut turn = 0usize;

        for tick in 0..total_ticks {
            if self.session.all_resolved() {
                break;
            }

            let pending = self.session.pending_indices();
            if !pending.is_empty() {
                let index = pending[turn % pending.len()];
                turn += 1;
                // One query per participant at a time; a slot whose query is
                // still outstanding just skips its turn.
                if !in_flight.contains(&index) {
                    in_flight.insert(index);
                    let judge = self.deps.judge.clone();
                    let handle = self.deps.handles[index].clone();
                    let contest_id = self.deps.problem.contest_id;
                    let results = results_tx.clone();
                    tokio::spawn(async move {
                        let result = judge
                            .query_status(contest_id, &handle, 1, STATUS_QUERY_COUNT)
                            .await;
                        let _ = results.send((index, result));
                    });
                }
            }

            if (tick * POLL_TICK_SECS) % REFRESH_EVERY_SECS == 0 {
                self.deps.emit_refresh(self.session)?;
            }

            let next = activated_at + Duration::from_secs((tick + 1) * POLL_TICK_SECS);
            loop {
                if self.session.all_resolved() {
                    break;
                }
                tokio::select! {
                    _ = sleep_until(next) => break,
                    Some((index, result)) = results_rx.recv() => {
                        in_flight.remove(&index);
                        self.handle_result(index, result, start, end)?;
                    }
                    Some(action) = self.actions.recv() => {
                        self.deps.apply_action(self.session, action)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_result(
        &mut self,
        index: usize,
        result: Result<Vec<Submission>, JudgeError>,
        start: u64,
        end: u64,
    ) -> Result<(), StoreError> {
        match result {
            Ok(submissions) => {
                self.deps.health.mark_healthy();
                if accepted_in_window(&submissions, &self.deps.problem, start, end) {
                    self.deps.resolve(self.session, index, Outcome::Solved)?;
                }
            }
            Err(err) => {
                // Contained: the participant is retried on their next turn.
                self.deps.health.mark_degraded();
                log::warn!(
                    "verdict query failed for {}: {}",
                    self.deps.handles[index],
                    err
                );
            }
        }
        Ok(())
    }
}
