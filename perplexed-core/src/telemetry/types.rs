use serde::{Deserialize, Serialize};

/// How a query's lifecycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Completed,
    Failed,
    Incomplete,
}

/// Structured log event emitted once per query, on its terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryLog {
    pub generation: u64,
    pub outcome: QueryOutcome,
    pub follow_up: bool,
    pub records: u64,
    pub stage: Option<String>,
    pub tokens_used: u64,
    pub documents: usize,
    pub answer_chars: usize,
    pub latency_ms: Option<u64>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl QueryLog {
    pub fn new(generation: u64, outcome: QueryOutcome) -> Self {
        Self {
            generation,
            outcome,
            follow_up: false,
            records: 0,
            stage: None,
            tokens_used: 0,
            documents: 0,
            answer_chars: 0,
            latency_ms: None,
            error_kind: None,
            error_message: None,
        }
    }
    pub fn follow_up(mut self, v: bool) -> Self { self.follow_up = v; self }
    pub fn records(mut self, v: u64) -> Self { self.records = v; self }
    pub fn stage_opt(mut self, v: Option<&str>) -> Self { self.stage = v.map(|s| s.to_string()); self }
    pub fn tokens_used(mut self, v: u64) -> Self { self.tokens_used = v; self }
    pub fn documents(mut self, v: usize) -> Self { self.documents = v; self }
    pub fn answer_chars(mut self, v: usize) -> Self { self.answer_chars = v; self }
    pub fn latency_ms(mut self, v: u64) -> Self { self.latency_ms = Some(v); self }
    pub fn error(mut self, kind: &str, message: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.to_string());
        self
    }
}
