//! Async front for a [`Session`].
//!
//! One driver task owns the session. Submissions, resets and decoded stream
//! events all travel through the same queue and are applied one at a time, so
//! a reset can never interleave with a half-applied record. After each change
//! the driver publishes a fresh [`SessionView`] on a watch channel.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::config::StreamCfg;
use crate::decoder::{RecordStream, StreamDecoder};
use crate::error::{CoreResult, SearchError};
use crate::http_client::RequestCtx;
use crate::model::SearchRequest;
use crate::reconciler::{Phase, Session, SessionView, Transition};
use crate::stream::StreamEvent;
use crate::telemetry::{self, QueryLog, QueryOutcome};
use crate::transport::SearchTransport;

enum Command {
    Submit {
        prompt: String,
        reply: oneshot::Sender<CoreResult<u64>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Event {
        generation: u64,
        event: StreamEvent,
    },
}

/// Cloneable handle to a running session driver.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
    views: watch::Receiver<SessionView>,
}

impl SessionHandle {
    /// Spawn a driver on the current tokio runtime.
    pub fn spawn(transport: Arc<dyn SearchTransport>, cfg: StreamCfg) -> Self {
        let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));
        let (view_tx, views) = watch::channel(SessionView::default());
        let driver = Driver {
            session: Session::new(),
            transport,
            cfg,
            events: tx.downgrade(),
            rx,
            views: view_tx,
            reader: None,
            started: None,
        };
        tokio::spawn(driver.run());
        Self { tx, views }
    }

    /// Start a query and return its generation. Fails with `QueryInFlight`
    /// while another query is streaming.
    pub async fn submit(&self, prompt: &str) -> CoreResult<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit {
            prompt: prompt.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SearchError::SessionClosed)?
    }

    /// Clear prompt, response and history. Events of the abandoned query are dropped.
    pub async fn reset(&self) -> CoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reset { reply }).await?;
        rx.await.map_err(|_| SearchError::SessionClosed)
    }

    pub fn view(&self) -> SessionView {
        self.views.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.views.clone()
    }

    /// Wait until query `generation` reaches a terminal phase or is superseded.
    pub async fn wait_for(&self, generation: u64) -> CoreResult<SessionView> {
        let mut rx = self.views.clone();
        let view = rx
            .wait_for(|v| v.generation != generation || v.phase.is_terminal())
            .await
            .map_err(|_| SearchError::SessionClosed)?;
        Ok(view.clone())
    }

    /// Submit and wait for the outcome.
    pub async fn ask(&self, prompt: &str) -> CoreResult<SessionView> {
        let generation = self.submit(prompt).await?;
        self.wait_for(generation).await
    }

    async fn send(&self, cmd: Command) -> CoreResult<()> {
        self.tx.send(cmd).await.map_err(|_| SearchError::SessionClosed)
    }
}

struct Driver {
    session: Session,
    transport: Arc<dyn SearchTransport>,
    cfg: StreamCfg,
    // Weak so the driver exits once every handle and reader is gone.
    events: mpsc::WeakSender<Command>,
    rx: mpsc::Receiver<Command>,
    views: watch::Sender<SessionView>,
    reader: Option<JoinHandle<()>>,
    started: Option<Instant>,
}

impl Driver {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Submit { prompt, reply } => {
                    let res = self.submit(&prompt);
                    let _ = reply.send(res);
                }
                Command::Reset { reply } => {
                    self.reset();
                    let _ = reply.send(());
                }
                Command::Event { generation, event } => self.on_event(generation, event),
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        tracing::debug!("session driver stopped");
    }

    fn submit(&mut self, prompt: &str) -> CoreResult<u64> {
        let tx = self.events.upgrade().ok_or(SearchError::SessionClosed)?;
        let sub = self.session.submit(prompt)?;
        let span = tracing::info_span!(
            "search.query",
            generation = sub.generation,
            follow_up = sub.follow_up,
            history_turns = sub.request.conversation_history.len(),
        );
        tracing::info!(parent: &span, prompt = %sub.request.user_prompt, "query submitted");

        let reader = pump(
            self.transport.clone(),
            sub.request,
            sub.generation,
            self.cfg.clone(),
            tx,
        )
        .instrument(span);
        if let Some(old) = self.reader.replace(tokio::spawn(reader)) {
            old.abort();
        }
        self.started = Some(Instant::now());
        self.publish();
        Ok(sub.generation)
    }

    fn reset(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.session.reset();
        self.started = None;
        tracing::info!(generation = self.session.generation(), "session reset");
        self.publish();
    }

    fn on_event(&mut self, generation: u64, event: StreamEvent) {
        let transition = self.session.apply(generation, event);
        match &transition {
            Transition::Stale => {
                tracing::trace!(generation, "dropped event of a finished or abandoned query");
                return;
            }
            Transition::Updated => {
                if let Some(cur) = self.session.current() {
                    tracing::debug!(
                        generation,
                        stage = cur.stage.as_ref().map(|s| s.as_str()),
                        tokens = cur.num_tokens_used,
                        documents = cur.documents.len(),
                        "record applied"
                    );
                }
            }
            Transition::Completed(turn) => {
                tracing::info!(
                    generation,
                    answer_chars = turn.assistant_response.len(),
                    history_turns = self.session.history().len(),
                    "query completed"
                );
            }
            Transition::Failed { kind, message } => {
                tracing::warn!(generation, kind, message = %message, "query failed");
            }
            Transition::Incomplete { discarded_bytes } => {
                tracing::warn!(
                    generation,
                    discarded_bytes,
                    "stream ended before results were ready"
                );
            }
        }
        if transition.is_terminal() {
            self.emit_log(&transition);
        }
        self.publish();
    }

    fn emit_log(&self, transition: &Transition) {
        let s = &self.session;
        let outcome = match s.phase() {
            Phase::Completed => QueryOutcome::Completed,
            Phase::Incomplete => QueryOutcome::Incomplete,
            _ => QueryOutcome::Failed,
        };
        let cur = s.current().cloned().unwrap_or_default();
        let mut log = QueryLog::new(s.generation(), outcome)
            .follow_up(s.is_follow_up())
            .records(s.records())
            .stage_opt(cur.stage.as_ref().map(|st| st.as_str()))
            .tokens_used(cur.num_tokens_used)
            .documents(cur.documents.len())
            .answer_chars(cur.answer.chars().count());
        if let Some(t0) = self.started {
            log = log.latency_ms(t0.elapsed().as_millis() as u64);
        }
        if let Transition::Failed { kind, message } = transition {
            log = log.error(kind, message);
        }
        telemetry::emit_query(log);
    }

    fn publish(&self) {
        self.views.send_replace(self.session.view());
    }
}

/// Read one query's body and forward decoded events until a terminal one.
async fn pump(
    transport: Arc<dyn SearchTransport>,
    request: SearchRequest,
    generation: u64,
    cfg: StreamCfg,
    tx: mpsc::Sender<Command>,
) {
    let request_id = format!("q-{generation}");
    let ctx = RequestCtx {
        request_id: Some(&request_id),
    };
    let body = match transport.open(&request, &ctx).await {
        Ok(body) => body,
        Err(e) => {
            let _ = tx
                .send(Command::Event {
                    generation,
                    event: StreamEvent::Error(e),
                })
                .await;
            return;
        }
    };

    let mut events = RecordStream::new(body, StreamDecoder::from_config(&cfg));
    while let Some(event) = events.next().await {
        let terminal = event.is_terminal();
        if tx.send(Command::Event { generation, event }).await.is_err() {
            break;
        }
        if terminal {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DEFAULT_ERROR_MESSAGE;
    use crate::model::ConversationTurn;
    use crate::transport::ScriptedTransport;

    const SEP: &str = "[/PERPLEXED-SEPARATOR]";

    fn cfg() -> StreamCfg {
        StreamCfg::default()
    }

    fn body(records: &[&str]) -> Vec<String> {
        records.iter().map(|r| format!("{r}{SEP}")).collect()
    }

    fn scenario_a() -> Vec<String> {
        body(&[
            r#"{"success":true,"stage":"SEARCHING","num_tokens_used":10,"websearch_docs":[],"answer":""}"#,
            r#"{"success":true,"stage":"RESULTS_READY","num_tokens_used":42,"websearch_docs":[{"id":1,"title":"T","url":"http://x.com","text":""}],"answer":"Answer text"}"#,
        ])
    }

    fn ready(answer: &str) -> Vec<String> {
        let rec = format!(
            r#"{{"success":true,"stage":"RESULTS_READY","num_tokens_used":1,"websearch_docs":[],"answer":"{answer}"}}"#
        );
        body(&[rec.as_str()])
    }

    #[tokio::test]
    async fn ask_completes_scenario_a() {
        let t = Arc::new(ScriptedTransport::new());
        t.push_body(scenario_a());
        let h = SessionHandle::spawn(t, cfg());

        let view = h.ask("P").await.unwrap();
        assert_eq!(view.phase, Phase::Completed);
        let cur = view.current.unwrap();
        assert_eq!(cur.answer, "Answer text");
        assert_eq!(cur.documents.len(), 1);
        assert_eq!(
            view.history,
            vec![ConversationTurn {
                user_prompt: "P".into(),
                assistant_response: "Answer text".into(),
            }]
        );
    }

    #[tokio::test]
    async fn record_split_across_many_chunks() {
        let t = Arc::new(ScriptedTransport::new());
        let joined = scenario_a().concat();
        let pieces: Vec<Vec<u8>> = joined.as_bytes().chunks(5).map(|c| c.to_vec()).collect();
        t.push_body(pieces);
        let h = SessionHandle::spawn(t, cfg());
        let view = h.ask("P").await.unwrap();
        assert_eq!(view.history.len(), 1);
        assert_eq!(view.history[0].assistant_response, "Answer text");
    }

    #[tokio::test]
    async fn application_error_is_surfaced() {
        let t = Arc::new(ScriptedTransport::new());
        t.push_body(body(&[r#"{"success":false,"message":"bad query"}"#]));
        let h = SessionHandle::spawn(t, cfg());
        let view = h.ask("P").await.unwrap();
        assert_eq!(view.phase, Phase::Failed);
        let cur = view.current.unwrap();
        assert!(!cur.success);
        assert_eq!(cur.error_message.as_deref(), Some("bad query"));
        assert!(view.history.is_empty());
    }

    #[tokio::test]
    async fn empty_separator_fails_the_query() {
        let t = Arc::new(ScriptedTransport::new());
        t.push_body(scenario_a());
        let cfg = StreamCfg {
            separator: String::new(),
            ..StreamCfg::default()
        };
        let h = SessionHandle::spawn(t, cfg);
        let view = h.ask("P").await.unwrap();
        assert_eq!(view.phase, Phase::Failed);
        assert_eq!(
            view.current.and_then(|c| c.error_message).as_deref(),
            Some("record separator must not be empty")
        );
        assert!(view.history.is_empty());
    }

    #[tokio::test]
    async fn malformed_record_fails_with_default_message() {
        let t = Arc::new(ScriptedTransport::new());
        t.push_body(body(&[r#"{"success":true"#]));
        let h = SessionHandle::spawn(t, cfg());
        let view = h.ask("P").await.unwrap();
        assert_eq!(view.phase, Phase::Failed);
        let cur = view.current.unwrap();
        assert_eq!(cur.error_message.as_deref(), Some(DEFAULT_ERROR_MESSAGE));
        assert!(cur.documents.is_empty());
    }

    #[tokio::test]
    async fn refused_request_fails_with_default_message() {
        let t = Arc::new(ScriptedTransport::new());
        t.push_refusal(503);
        let h = SessionHandle::spawn(t, cfg());
        let view = h.ask("P").await.unwrap();
        assert_eq!(view.phase, Phase::Failed);
        assert_eq!(
            view.current.unwrap().error_message.as_deref(),
            Some(DEFAULT_ERROR_MESSAGE)
        );
    }

    #[tokio::test]
    async fn sequential_queries_build_history_and_recover_from_errors() {
        let t = Arc::new(ScriptedTransport::new());
        t.push_body(ready("one"))
            .push_refusal(500)
            .push_body(ready("two"));
        let h = SessionHandle::spawn(t, cfg());

        assert_eq!(h.ask("first").await.unwrap().phase, Phase::Completed);
        assert_eq!(h.ask("second").await.unwrap().phase, Phase::Failed);
        let view = h.ask("third").await.unwrap();
        assert_eq!(view.phase, Phase::Completed);
        assert!(view.follow_up);
        let prompts: Vec<&str> = view.history.iter().map(|t| t.user_prompt.as_str()).collect();
        assert_eq!(prompts, ["first", "third"]);
    }

    #[tokio::test]
    async fn unterminated_body_is_incomplete() {
        let t = Arc::new(ScriptedTransport::new());
        t.push_body([r#"{"success":true,"stage":"QUERIED_LLM","num_tokens_used":3,"websearch_docs":[],"answer":"par"#]);
        let h = SessionHandle::spawn(t, cfg());
        let view = h.ask("P").await.unwrap();
        assert_eq!(view.phase, Phase::Incomplete);
        assert!(view.history.is_empty());
    }

    #[tokio::test]
    async fn reset_clears_state() {
        let t = Arc::new(ScriptedTransport::new());
        t.push_body(ready("one"));
        let h = SessionHandle::spawn(t, cfg());
        h.ask("first").await.unwrap();
        h.reset().await.unwrap();
        let view = h.view();
        assert_eq!(view.phase, Phase::Idle);
        assert!(view.history.is_empty());
        assert!(view.current.is_none());
        assert_eq!(view.user_prompt, "");
    }

    #[tokio::test]
    async fn blank_prompt_is_rejected_without_a_request() {
        let t = Arc::new(ScriptedTransport::new());
        let h = SessionHandle::spawn(t, cfg());
        let err = h.submit("  ").await.unwrap_err();
        assert!(matches!(err, SearchError::Validation(_)));
        assert_eq!(h.view().phase, Phase::Idle);
    }

    /// Transport whose body never produces a byte until the test says so.
    struct Stalled {
        gate: Arc<tokio::sync::Notify>,
        body: String,
    }

    #[async_trait::async_trait]
    impl SearchTransport for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn open(
            &self,
            _req: &SearchRequest,
            _ctx: &RequestCtx<'_>,
        ) -> CoreResult<crate::transport::ByteStream> {
            let gate = self.gate.clone();
            let body = bytes::Bytes::from(self.body.clone());
            Ok(Box::pin(futures_util::stream::once(async move {
                gate.notified().await;
                Ok(body)
            })))
        }
    }

    #[tokio::test]
    async fn second_submit_while_streaming_is_rejected() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let t = Arc::new(Stalled {
            gate: gate.clone(),
            body: ready("one").concat(),
        });
        let h = SessionHandle::spawn(t, cfg());
        let g = h.submit("first").await.unwrap();
        match h.submit("second").await {
            Err(SearchError::QueryInFlight { generation }) => assert_eq!(generation, g),
            other => panic!("expected QueryInFlight, got: {:?}", other),
        }
        gate.notify_one();
        let view = h.wait_for(g).await.unwrap();
        assert_eq!(view.phase, Phase::Completed);
        assert_eq!(view.history[0].user_prompt, "first");
    }

    #[tokio::test]
    async fn reset_during_stream_drops_late_records() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let t = Arc::new(Stalled {
            gate: gate.clone(),
            body: ready("late").concat(),
        });
        let h = SessionHandle::spawn(t, cfg());
        let g = h.submit("first").await.unwrap();
        h.reset().await.unwrap();
        gate.notify_one();

        let view = h.wait_for(g).await.unwrap();
        assert_eq!(view.phase, Phase::Idle);
        assert!(view.generation > g);
        tokio::task::yield_now().await;
        assert!(h.view().history.is_empty());
        assert!(h.view().current.is_none());
    }

    static QUERY_LOGS: once_cell::sync::Lazy<std::sync::Mutex<Vec<QueryLog>>> =
        once_cell::sync::Lazy::new(|| std::sync::Mutex::new(Vec::new()));

    struct LogSink;
    impl crate::telemetry::TelemetrySink for LogSink {
        fn record_query(&self, log: QueryLog) {
            QUERY_LOGS.lock().unwrap().push(log);
        }
    }

    #[tokio::test]
    async fn terminal_transitions_emit_query_logs() {
        let _ = crate::telemetry::set_telemetry_sink(Arc::new(LogSink));
        crate::telemetry::test_set_capture_enabled(true);
        QUERY_LOGS.lock().unwrap().clear();

        let t = Arc::new(ScriptedTransport::new());
        t.push_body(scenario_a())
            .push_body(body(&[r#"{"success":false,"message":"bad query"}"#]));
        let h = SessionHandle::spawn(t, cfg());
        h.ask("first").await.unwrap();
        h.ask("second").await.unwrap();
        crate::telemetry::test_set_capture_enabled(false);

        let logs = QUERY_LOGS.lock().unwrap().clone();
        assert_eq!(logs.len(), 2, "expected 2 query logs, got {:?}", logs);
        assert_eq!(logs[0].outcome, QueryOutcome::Completed);
        assert_eq!(logs[0].records, 2);
        assert_eq!(logs[0].tokens_used, 42);
        assert_eq!(logs[0].documents, 1);
        assert_eq!(logs[0].stage.as_deref(), Some("RESULTS_READY"));
        assert!(logs[0].latency_ms.is_some());
        assert_eq!(logs[1].outcome, QueryOutcome::Failed);
        assert!(logs[1].follow_up);
        assert_eq!(logs[1].error_kind.as_deref(), Some("application"));
        assert_eq!(logs[1].error_message.as_deref(), Some("bad query"));
    }

    #[tokio::test]
    async fn query_span_carries_generation() {
        let store = crate::telemetry::test_span::install_capture();
        let t = Arc::new(ScriptedTransport::new());
        t.push_body(ready("one"));
        let h = SessionHandle::spawn(t, cfg());
        let g = h.submit("first").await.unwrap();
        h.wait_for(g).await.unwrap();

        let span = store.find("search.query").expect("query span recorded");
        let fields = span.fields.lock().unwrap();
        assert_eq!(fields.get("generation").map(String::as_str), Some("1"));
        assert_eq!(fields.get("follow_up").map(String::as_str), Some("false"));
    }
}
