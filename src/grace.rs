use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};

use crate::judge::{queued_in_window, STATUS_QUERY_COUNT};
use crate::manager::{ActionRequest, SessionDeps};
use crate::session::ChallengeSession;
use crate::store::StoreError;

/// Ceiling on the post-deadline wait for queued submissions, in seconds.
pub const GRACE_WAIT_SECS: u64 = 300;

/// Seconds between queued-submission checks.
pub const GRACE_CHECK_SECS: u64 = 20;

/// After the active window closes, waits for submissions that were already
/// queued at the judge when the deadline hit.
///
/// Checks every unresolved participant once per increment and stops as soon
/// as nothing is queued. An unreachable judge counts as "still queued" so a
/// judging backlog is never cut short by an outage. Verdict resolution itself
/// happens later, in finalization.
pub(crate) struct GraceQueueWaiter<'a> {
    session: &'a mut ChallengeSession,
    deps: &'a SessionDeps,
    actions: &'a mut mpsc::UnboundedReceiver<ActionRequest>,
}

impl<'a> GraceQueueWaiter<'a> {
    pub(crate) fn new(
        session: &'a mut ChallengeSession,
        deps: &'a SessionDeps,
        actions: &'a mut mpsc::UnboundedReceiver<ActionRequest>,
    ) -> Self {
        GraceQueueWaiter {
            session,
            deps,
            actions,
        }
    }

    pub(crate) async fn run(mut self, grace_started: Instant) -> Result<(), StoreError> {
        let Some((start, end)) = self.session.window() else {
            return Ok(());
        };

        let mut increment = 0u64;
        loop {
            if self.session.all_resolved() {
                break;
            }

            let pending = self.session.pending_indices();
            let checks = pending.into_iter().map(|index| {
                let judge = self.deps.judge.clone();
                let handle = self.deps.handles[index].clone();
                let contest_id = self.deps.problem.contest_id;
                let problem = self.deps.problem.clone();
                async move {
                    match judge
                        .query_status(contest_id, &handle, 1, STATUS_QUERY_COUNT)
                        .await
                    {
                        Ok(submissions) => queued_in_window(&submissions, &problem, start, end),
                        Err(err) => {
                            // Conservative: keep waiting rather than cutting a
                            // queued submission short.
                            log::warn!("queue check failed for {}: {}", handle, err);
                            true
                        }
                    }
                }
            });
            let any_queued = join_all(checks).await.into_iter().any(|queued| queued);
            if !any_queued {
                break;
            }

            increment += 1;
            if increment * GRACE_CHECK_SECS >= GRACE_WAIT_SECS {
                break;
            }
            log::info!(
                "challenge {}: waiting for queued submissions to be judged",
                self.session.id()
            );

            // Sleep to the next increment, still honoring give-up and
            // withdrawal actions.
            let next = grace_started + Duration::from_secs(increment * GRACE_CHECK_SECS);
            loop {
                if self.session.all_resolved() {
                    break;
                }
                tokio::select! {
                    _ = sleep_until(next) => break,
                    Some(action) = self.actions.recv() => {
                        self.deps.apply_action(self.session, action)?;
                    }
                }
            }
        }
        Ok(())
    }
}
