use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use crate::problems::Problem;

/// Submissions fetched per verdict query.
pub const STATUS_QUERY_COUNT: u32 = 100;

/// Verdict reported by the judge for a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Accepted (`OK` on the wire).
    Accepted,
    /// Queued, not yet judged (`TESTING` on the wire).
    Testing,
    /// Anything else: wrong answer, compile error, hacked, ...
    Other,
}

impl Verdict {
    fn from_wire(raw: Option<&str>) -> Verdict {
        match raw {
            Some("OK") => Verdict::Accepted,
            Some("TESTING") => Verdict::Testing,
            _ => Verdict::Other,
        }
    }
}

/// A single submission returned by the judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub contest_id: u32,
    pub problem_index: String,
    pub verdict: Verdict,
    pub creation_time_secs: u64,
}

impl Submission {
    /// Whether this submission targets `problem` and was created inside
    /// `[start, end]` (epoch seconds, inclusive).
    pub fn matches_window(&self, problem: &Problem, start: u64, end: u64) -> bool {
        self.contest_id == problem.contest_id
            && self.problem_index == problem.index
            && self.creation_time_secs >= start
            && self.creation_time_secs <= end
    }
}

/// Whether any submission in the batch is an accepted solve of `problem`
/// created inside the challenge window.
pub fn accepted_in_window(submissions: &[Submission], problem: &Problem, start: u64, end: u64) -> bool {
    submissions
        .iter()
        .any(|s| s.verdict == Verdict::Accepted && s.matches_window(problem, start, end))
}

/// Whether any submission in the batch is still queued for judging and was
/// created inside the challenge window.
pub fn queued_in_window(submissions: &[Submission], problem: &Problem, start: u64, end: u64) -> bool {
    submissions
        .iter()
        .any(|s| s.verdict == Verdict::Testing && s.matches_window(problem, start, end))
}

#[derive(Debug)]
pub enum JudgeError {
    /// The judge could not be reached or returned a non-success envelope.
    ServiceUnavailable(String),
}

impl fmt::Display for JudgeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JudgeError::ServiceUnavailable(reason) => {
                write!(f, "Judge service unavailable: {}", reason)
            }
        }
    }
}

impl std::error::Error for JudgeError {}

/// Queries the judge for a handle's recent submissions.
#[async_trait]
pub trait StatusClient: Send + Sync {
    async fn query_status(
        &self,
        contest_id: u32,
        handle: &str,
        from: u32,
        count: u32,
    ) -> Result<Vec<Submission>, JudgeError>;
}

/// Shared judge-availability flag.
///
/// Set whenever a verdict query fails, cleared by the next success. While set,
/// participants may withdraw from a challenge without a rating change.
#[derive(Clone, Default)]
pub struct ServiceHealth {
    degraded: Arc<AtomicBool>,
}

impl ServiceHealth {
    pub fn new() -> Self {
        ServiceHealth::default()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
    }

    pub fn mark_healthy(&self) {
        self.degraded.store(false, Ordering::Relaxed);
    }
}

#[derive(Deserialize)]
struct StatusEnvelope {
    status: String,
    #[serde(default)]
    result: Vec<WireSubmission>,
}

#[derive(Deserialize)]
struct WireSubmission {
    problem: WireProblem,
    #[serde(default)]
    verdict: Option<String>,
    #[serde(rename = "creationTimeSeconds")]
    creation_time_seconds: u64,
}

#[derive(Deserialize)]
struct WireProblem {
    #[serde(rename = "contestId")]
    contest_id: u32,
    index: String,
}

/// HTTP client for a Codeforces-style `contest.status` endpoint.
pub struct HttpStatusClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatusClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpStatusClient {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl StatusClient for HttpStatusClient {
    async fn query_status(
        &self,
        contest_id: u32,
        handle: &str,
        from: u32,
        count: u32,
    ) -> Result<Vec<Submission>, JudgeError> {
        let url = format!("{}/contest.status", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[
                ("contestId", contest_id.to_string()),
                ("asManager", "false".to_string()),
                ("from", from.to_string()),
                ("count", count.to_string()),
                ("handle", handle.to_string()),
            ])
            .send()
            .await
            .map_err(|e| JudgeError::ServiceUnavailable(e.to_string()))?;

        let envelope: StatusEnvelope = response
            .json()
            .await
            .map_err(|e| JudgeError::ServiceUnavailable(e.to_string()))?;

        if envelope.status != "OK" {
            return Err(JudgeError::ServiceUnavailable(format!(
                "judge returned status {}",
                envelope.status
            )));
        }

        Ok(envelope
            .result
            .into_iter()
            .map(|wire| Submission {
                contest_id: wire.problem.contest_id,
                problem_index: wire.problem.index,
                verdict: Verdict::from_wire(wire.verdict.as_deref()),
                creation_time_secs: wire.creation_time_seconds,
            })
            .collect())
    }
}
