use std::collections::HashMap;
use serde::{Serialize, Deserialize};

/// Metadata for a single problem on the judge service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "contestId")]
    pub contest_id: u32,
    pub index: String,
    pub name: String,
    pub rating: i64,
}

impl Problem {
    /// Canonical problem id: contest id concatenated with the index, e.g. `1000A`.
    pub fn id(&self) -> String {
        format!("{}{}", self.contest_id, self.index)
    }
}

/// Read-only lookup of known problems, keyed by canonical id.
#[derive(Debug, Clone, Default)]
pub struct ProblemCatalog {
    problems: HashMap<String, Problem>,
}

impl ProblemCatalog {
    pub fn new() -> Self {
        ProblemCatalog {
            problems: HashMap::new(),
        }
    }

    pub fn from_problems(problems: impl IntoIterator<Item = Problem>) -> Self {
        let mut catalog = ProblemCatalog::new();
        for problem in problems {
            catalog.insert(problem);
        }
        catalog
    }

    pub fn insert(&mut self, problem: Problem) {
        self.problems.insert(problem.id(), problem);
    }

    pub fn get(&self, problem_id: &str) -> Option<&Problem> {
        self.problems.get(problem_id)
    }

    pub fn contains(&self, problem_id: &str) -> bool {
        self.problems.contains_key(problem_id)
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }
}
