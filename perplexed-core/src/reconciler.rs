//! Conversation state and the transitions that fold stream events into it.
//!
//! Lifecycle per query:
//!
//! ```text
//! Idle ──submit──▶ Streaming ──record(success, !RESULTS_READY)──▶ Streaming
//!                      │──record(success, RESULTS_READY)──▶ Completed (history += turn)
//!                      │──record(!success) / error──────────▶ Failed
//!                      └──done────────────────────────────────▶ Incomplete
//! ```
//!
//! Every event is tagged with the generation returned by [`Session::submit`].
//! Events from an older generation, or arriving after the query left
//! `Streaming`, are ignored.

use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, SearchError};
use crate::model::{ConversationTurn, Document, SearchRecord, SearchRequest, Stage};
use crate::normalizer::normalize_prompt;
use crate::stream::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Streaming,
    Completed,
    Failed,
    /// The body ended before a `RESULTS_READY` record arrived.
    Incomplete,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Incomplete)
    }
}

/// The in-progress view of the current query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CurrentResponse {
    pub success: bool,
    pub stage: Option<Stage>,
    pub num_tokens_used: u64,
    pub documents: Vec<Document>,
    pub answer: String,
    pub error_message: Option<String>,
}

impl CurrentResponse {
    /// The producer sends latest values, not deltas: every field is overwritten.
    fn merge(&mut self, rec: SearchRecord) {
        self.success = rec.success;
        self.stage = rec.stage;
        self.num_tokens_used = rec.num_tokens_used;
        self.documents = rec.documents;
        self.answer = rec.answer;
        self.error_message = None;
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            error_message: Some(message),
            ..Self::default()
        }
    }
}

/// Append-only list of finalized turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ConversationHistory {
    turns: Vec<ConversationTurn>,
}

impl ConversationHistory {
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn append(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    fn clear(&mut self) {
        self.turns.clear();
    }
}

/// What `Session::submit` hands to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub generation: u64,
    pub follow_up: bool,
    pub request: SearchRequest,
}

/// Result of applying one stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Event belonged to an old generation or a finished query; nothing changed.
    Stale,
    Updated,
    Completed(ConversationTurn),
    Failed {
        kind: &'static str,
        message: String,
    },
    Incomplete {
        discarded_bytes: usize,
    },
}

impl Transition {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed(_) | Self::Failed { .. } | Self::Incomplete { .. }
        )
    }

    pub fn changed_state(&self) -> bool {
        !matches!(self, Self::Stale)
    }
}

/// Snapshot republished to the presentation layer after every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionView {
    pub generation: u64,
    pub phase: Phase,
    pub user_prompt: String,
    pub follow_up: bool,
    /// The turn being streamed, with an empty response until it completes.
    pub pending: Option<ConversationTurn>,
    pub current: Option<CurrentResponse>,
    pub history: Vec<ConversationTurn>,
}

#[derive(Debug, Default)]
pub struct Session {
    generation: u64,
    phase: Phase,
    user_prompt: String,
    follow_up: bool,
    current: Option<CurrentResponse>,
    history: ConversationHistory,
    records: u64,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn user_prompt(&self) -> &str {
        &self.user_prompt
    }

    pub fn current(&self) -> Option<&CurrentResponse> {
        self.current.as_ref()
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn is_follow_up(&self) -> bool {
        self.follow_up
    }

    /// Records applied to the current query so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Start a new query. History is kept and sent along as context.
    pub fn submit(&mut self, prompt: &str) -> CoreResult<Submission> {
        if self.phase == Phase::Streaming {
            return Err(SearchError::QueryInFlight {
                generation: self.generation,
            });
        }
        let prompt = normalize_prompt(prompt)?;

        self.generation += 1;
        self.phase = Phase::Streaming;
        self.follow_up = !self.history.is_empty();
        self.user_prompt = prompt;
        self.current = Some(CurrentResponse::default());
        self.records = 0;

        Ok(Submission {
            generation: self.generation,
            follow_up: self.follow_up,
            request: SearchRequest {
                user_prompt: self.user_prompt.clone(),
                conversation_history: self.history.turns().to_vec(),
            },
        })
    }

    /// Fold one event of query `generation` into the session.
    pub fn apply(&mut self, generation: u64, event: StreamEvent) -> Transition {
        if generation != self.generation || self.phase != Phase::Streaming {
            return Transition::Stale;
        }
        match event {
            StreamEvent::Record(rec) => self.apply_record(rec),
            StreamEvent::Error(e) => self.fail(&e),
            StreamEvent::Done { discarded_bytes } => {
                self.phase = Phase::Incomplete;
                Transition::Incomplete { discarded_bytes }
            }
        }
    }

    fn apply_record(&mut self, rec: SearchRecord) -> Transition {
        self.records += 1;
        if !rec.success {
            return self.fail(&SearchError::Application {
                message: rec.error_message,
            });
        }

        let terminal = rec.is_terminal();
        let current = self.current.get_or_insert_with(CurrentResponse::default);
        current.merge(rec);
        if !terminal {
            return Transition::Updated;
        }

        let turn = ConversationTurn {
            user_prompt: self.user_prompt.clone(),
            assistant_response: current.answer.clone(),
        };
        self.history.append(turn.clone());
        self.phase = Phase::Completed;
        Transition::Completed(turn)
    }

    fn fail(&mut self, err: &SearchError) -> Transition {
        let message = err.user_message();
        self.current = Some(CurrentResponse::failed(message.clone()));
        self.phase = Phase::Failed;
        Transition::Failed {
            kind: err.kind(),
            message,
        }
    }

    /// Back to `Idle` with nothing retained. Late events of the old query become stale.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.phase = Phase::Idle;
        self.user_prompt.clear();
        self.follow_up = false;
        self.current = None;
        self.history.clear();
        self.records = 0;
    }

    pub fn view(&self) -> SessionView {
        let pending = (self.phase == Phase::Streaming).then(|| ConversationTurn {
            user_prompt: self.user_prompt.clone(),
            assistant_response: String::new(),
        });
        SessionView {
            generation: self.generation,
            phase: self.phase,
            user_prompt: self.user_prompt.clone(),
            follow_up: self.follow_up,
            pending,
            current: self.current.clone(),
            history: self.history.turns().to_vec(),
        }
    }
}
