//! Turn runner backed by an OpenCode server.
//!
//! Each Discord thread maps to one OpenCode session, persisted in the
//! `thread_sessions` table. A turn subscribes to `/event`, posts the prompt
//! with `prompt_async` and follows the SSE stream until the session goes idle.
//! Every finished step is a checkpoint. An interrupted or dropped turn aborts
//! the session server-side; the abort of a dropped turn is awaited by
//! `teardown` before the thread's next prompt goes out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, anyhow, bail};
use futures::StreamExt;
use futures::future::BoxFuture;
use kimaki_core::ThreadMessage;
use kimaki_core::config::OpencodeConfig;
use kimaki_store::{Store, ThreadSession};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::thread_queue::{TurnContext, TurnRunner};

/// Posted when a turn ends without any assistant text, e.g. tool-only work.
pub const EMPTY_REPLY_NOTICE: &str = "✓ Done (no text reply)";

/// Abort requests still in flight for dropped turns, by thread id.
type PendingAborts = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

#[derive(Clone)]
pub struct OpencodeRunner {
    client: Client,
    base_url: String,
    directory: String,
    store: Store,
    pending_aborts: PendingAborts,
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OpencodeEvent {
    MessageUpdated {
        session_id: String,
        message_id: String,
        role: String,
    },
    TextPart {
        session_id: String,
        message_id: String,
        part_id: String,
        text: String,
    },
    StepFinished {
        session_id: String,
    },
    Idle {
        session_id: String,
    },
    Error {
        session_id: Option<String>,
        message: String,
    },
}

impl OpencodeRunner {
    pub fn new(config: &OpencodeConfig, store: Store) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            directory: config.directory.clone(),
            store,
            pending_aborts: PendingAborts::default(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn ensure_session(&self, thread_id: &str) -> anyhow::Result<String> {
        if let Some(existing) = self
            .store
            .get_thread_session_async(thread_id.to_string())
            .await?
        {
            return Ok(existing.session_id);
        }

        let response = self
            .client
            .post(self.url("/session"))
            .query(&[("directory", &self.directory)])
            .json(&json!({ "title": format!("Discord thread {thread_id}") }))
            .send()
            .await
            .context("failed to create OpenCode session")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("OpenCode session create failed with status {status}: {body}");
        }
        let created: CreatedSession = response
            .json()
            .await
            .context("failed to parse OpenCode session")?;

        self.store
            .set_thread_session_async(ThreadSession {
                thread_id: thread_id.to_string(),
                session_id: created.id.clone(),
                directory: Some(self.directory.clone()),
            })
            .await?;
        info!(thread_id, session_id = %created.id, "opencode session created");
        Ok(created.id)
    }

    async fn prompt(&self, thread_id: &str, session_id: &str, text: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/session/{session_id}/prompt_async")))
            .query(&[("directory", &self.directory)])
            .json(&json!({ "parts": [{ "type": "text", "text": text }] }))
            .send()
            .await
            .context("failed to send prompt to OpenCode")?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                // Session gone on the server; the next turn starts a new one.
                self.store
                    .delete_thread_session_async(thread_id.to_string())
                    .await?;
                bail!("OpenCode session {session_id} no longer exists, please resend");
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("OpenCode prompt failed with status {status}: {body}");
            }
        }
    }

    /// Wait for the abort a dropped turn of `thread_id` left running.
    async fn finish_pending_abort(&self, thread_id: &str) {
        let pending = self
            .pending_aborts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(thread_id);
        let Some(handle) = pending else {
            return;
        };
        debug!(thread_id, "waiting for abort of dropped turn");
        if let Err(err) = handle.await {
            warn!(thread_id, err = %err, "abort task ended abnormally");
        }
    }

    async fn run(&self, message: ThreadMessage, ctx: TurnContext) -> anyhow::Result<()> {
        let thread_id = ctx.thread_id().to_string();
        self.finish_pending_abort(&thread_id).await;
        let session_id = self.ensure_session(&thread_id).await?;
        ctx.checkpoint()?;

        let events = self
            .client
            .get(self.url("/event"))
            .query(&[("directory", &self.directory)])
            .send()
            .await
            .context("failed to subscribe to OpenCode events")?;
        if !events.status().is_success() {
            bail!("OpenCode event stream failed with status {}", events.status());
        }

        let mut abort = AbortOnDrop {
            client: self.client.clone(),
            url: self.url(&format!("/session/{session_id}/abort")),
            directory: self.directory.clone(),
            thread_id: thread_id.clone(),
            pending: self.pending_aborts.clone(),
            armed: true,
        };
        self.prompt(&thread_id, &session_id, &message.content).await?;
        debug!(thread_id = %thread_id, session_id = %session_id, "prompt sent");

        let mut reply = ReplyBuffer::default();
        let mut stream = events.bytes_stream();
        let mut line_buffer = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("OpenCode event stream read failed")?;
            line_buffer.extend_from_slice(&chunk);

            while let Some(newline) = line_buffer.iter().position(|byte| *byte == b'\n') {
                let line = line_buffer.drain(..=newline).collect::<Vec<_>>();
                let Some(event) = parse_event_line(&line) else {
                    continue;
                };

                match event {
                    OpencodeEvent::MessageUpdated {
                        session_id: sid,
                        message_id,
                        role,
                    } if sid == session_id && role == "assistant" => {
                        reply.assistant_messages.insert(message_id);
                    }
                    OpencodeEvent::TextPart {
                        session_id: sid,
                        message_id,
                        part_id,
                        text,
                    } if sid == session_id => {
                        if reply.assistant_messages.contains(&message_id) {
                            reply.upsert(part_id, text);
                        }
                    }
                    OpencodeEvent::StepFinished { session_id: sid } if sid == session_id => {
                        if let Err(interrupted) = ctx.checkpoint() {
                            abort.fire().await;
                            return Err(interrupted.into());
                        }
                    }
                    OpencodeEvent::Idle { session_id: sid } if sid == session_id => {
                        abort.armed = false;
                        let text = reply.text();
                        if text.is_empty() {
                            ctx.send(EMPTY_REPLY_NOTICE).await?;
                        } else {
                            ctx.send(&text).await?;
                        }
                        return Ok(());
                    }
                    OpencodeEvent::Error {
                        session_id: sid,
                        message,
                    } if sid.as_deref().is_none_or(|sid| sid == session_id) => {
                        abort.armed = false;
                        return Err(anyhow!("OpenCode error: {message}"));
                    }
                    _ => {}
                }
            }
        }

        Err(anyhow!(
            "OpenCode event stream ended before session {session_id} went idle"
        ))
    }
}

impl TurnRunner for OpencodeRunner {
    fn run_turn<'a>(
        &'a self,
        message: ThreadMessage,
        ctx: TurnContext,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.run(message, ctx))
    }

    fn teardown<'a>(&'a self, thread_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(self.finish_pending_abort(thread_id))
    }
}

/// Assistant text parts in arrival order. Parts are re-sent whole on every
/// update, so a known part id is replaced in place.
#[derive(Default)]
struct ReplyBuffer {
    assistant_messages: HashSet<String>,
    parts: Vec<(String, String)>,
}

impl ReplyBuffer {
    fn upsert(&mut self, part_id: String, text: String) {
        match self.parts.iter_mut().find(|(id, _)| *id == part_id) {
            Some((_, existing)) => *existing = text,
            None => self.parts.push((part_id, text)),
        }
    }

    fn text(&self) -> String {
        self.parts
            .iter()
            .map(|(_, text)| text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Aborts the OpenCode session unless disarmed, either explicitly via
/// `fire` or on drop when the turn future is discarded mid-flight. A drop
/// registers the abort task in `pending` so the next turn can wait for it.
struct AbortOnDrop {
    client: Client,
    url: String,
    directory: String,
    thread_id: String,
    pending: PendingAborts,
    armed: bool,
}

impl AbortOnDrop {
    async fn fire(&mut self) {
        self.armed = false;
        if let Err(err) = send_abort(&self.client, &self.url, &self.directory).await {
            warn!(url = %self.url, err = %err, "failed to abort opencode session");
        }
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.client.clone();
        let url = std::mem::take(&mut self.url);
        let directory = std::mem::take(&mut self.directory);
        let task = runtime.spawn(async move {
            if let Err(err) = send_abort(&client, &url, &directory).await {
                warn!(url = %url, err = %err, "failed to abort opencode session");
            }
        });
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(std::mem::take(&mut self.thread_id), task);
    }
}

async fn send_abort(client: &Client, url: &str, directory: &str) -> anyhow::Result<()> {
    let response = client
        .post(url)
        .query(&[("directory", directory)])
        .send()
        .await
        .context("abort request failed")?;
    if !response.status().is_success() {
        bail!("abort returned {}", response.status());
    }
    debug!(url, "opencode session aborted");
    Ok(())
}

fn parse_event_line(line: &[u8]) -> Option<OpencodeEvent> {
    let line = std::str::from_utf8(line).ok()?.trim();
    let data = line.strip_prefix("data:")?.trim();
    let value: Value = serde_json::from_str(data).ok()?;
    let properties = value.get("properties")?;
    let str_at = |value: &Value, pointer: &str| {
        value
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    match value.get("type")?.as_str()? {
        "message.updated" => Some(OpencodeEvent::MessageUpdated {
            session_id: str_at(properties, "/info/sessionID")?,
            message_id: str_at(properties, "/info/id")?,
            role: str_at(properties, "/info/role")?,
        }),
        "message.part.updated" => {
            let part = properties.get("part")?;
            let session_id = str_at(part, "/sessionID")?;
            match part.get("type")?.as_str()? {
                "text" => Some(OpencodeEvent::TextPart {
                    session_id,
                    message_id: str_at(part, "/messageID")?,
                    part_id: str_at(part, "/id")?,
                    text: str_at(part, "/text").unwrap_or_default(),
                }),
                "step-finish" => Some(OpencodeEvent::StepFinished { session_id }),
                _ => None,
            }
        }
        "session.idle" => Some(OpencodeEvent::Idle {
            session_id: str_at(properties, "/sessionID")?,
        }),
        "session.error" => Some(OpencodeEvent::Error {
            session_id: str_at(properties, "/sessionID"),
            message: str_at(properties, "/error/data/message")
                .or_else(|| str_at(properties, "/error/name"))
                .unwrap_or_else(|| "unknown error".to_string()),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::extract::{Path, State};
    use axum::http::StatusCode as HttpStatus;
    use axum::response::sse::{Event, Sse};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use futures::Stream;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::platform::testing::RecordingPlatform;
    use crate::thread_queue::{Interrupted, ThreadQueue, ThreadQueueConfig};

    #[test]
    fn parses_text_and_step_parts() {
        let line = br#"data: {"type":"message.part.updated","properties":{"part":{"id":"prt_1","sessionID":"ses_1","messageID":"msg_1","type":"text","text":"hi"}}}"#;
        assert_eq!(
            parse_event_line(line),
            Some(OpencodeEvent::TextPart {
                session_id: "ses_1".into(),
                message_id: "msg_1".into(),
                part_id: "prt_1".into(),
                text: "hi".into(),
            })
        );

        let line = br#"data: {"type":"message.part.updated","properties":{"part":{"id":"prt_2","sessionID":"ses_1","messageID":"msg_1","type":"step-finish"}}}"#;
        assert_eq!(
            parse_event_line(line),
            Some(OpencodeEvent::StepFinished {
                session_id: "ses_1".into()
            })
        );
    }

    #[test]
    fn parses_session_lifecycle_events() {
        assert_eq!(
            parse_event_line(br#"data: {"type":"session.idle","properties":{"sessionID":"ses_1"}}"#),
            Some(OpencodeEvent::Idle {
                session_id: "ses_1".into()
            })
        );
        assert_eq!(
            parse_event_line(
                br#"data: {"type":"session.error","properties":{"sessionID":"ses_1","error":{"name":"ProviderAuthError","data":{"message":"bad key"}}}}"#
            ),
            Some(OpencodeEvent::Error {
                session_id: Some("ses_1".into()),
                message: "bad key".into(),
            })
        );
    }

    #[test]
    fn ignores_comments_and_unrelated_events() {
        assert_eq!(parse_event_line(b": keep-alive"), None);
        assert_eq!(parse_event_line(b""), None);
        assert_eq!(parse_event_line(b"data: not json"), None);
        assert_eq!(
            parse_event_line(br#"data: {"type":"server.connected","properties":{}}"#),
            None
        );
    }

    #[test]
    fn reply_buffer_replaces_updated_parts() {
        let mut reply = ReplyBuffer::default();
        reply.upsert("p1".into(), "Hel".into());
        reply.upsert("p2".into(), "Second".into());
        reply.upsert("p1".into(), "Hello".into());
        assert_eq!(reply.text(), "Hello\n\nSecond");
    }

    struct FakeOpencode {
        events: broadcast::Sender<String>,
        script: Vec<(u64, Value)>,
        created: AtomicUsize,
        prompts: Mutex<Vec<Value>>,
        aborted: Mutex<Vec<String>>,
        abort_delay: Duration,
        /// Prompts and abort progress, in arrival order.
        log: Mutex<Vec<String>>,
    }

    async fn fake_create(State(fake): State<Arc<FakeOpencode>>) -> Json<Value> {
        fake.created.fetch_add(1, Ordering::SeqCst);
        Json(json!({ "id": "ses_fake" }))
    }

    async fn fake_events(
        State(fake): State<Arc<FakeOpencode>>,
    ) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
        let rx = fake.events.subscribe();
        Sse::new(futures::stream::unfold(rx, |mut rx| async move {
            let data = rx.recv().await.ok()?;
            Some((Ok::<_, Infallible>(Event::default().data(data)), rx))
        }))
    }

    async fn fake_prompt(
        State(fake): State<Arc<FakeOpencode>>,
        Path(_id): Path<String>,
        Json(body): Json<Value>,
    ) -> HttpStatus {
        let text = body["parts"][0]["text"].as_str().unwrap_or_default().to_string();
        fake.log.lock().unwrap().push(format!("prompt:{text}"));
        fake.prompts.lock().unwrap().push(body);
        let script = fake.script.clone();
        let events = fake.events.clone();
        tokio::spawn(async move {
            for (delay_ms, event) in script {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                let _ = events.send(event.to_string());
            }
        });
        HttpStatus::NO_CONTENT
    }

    async fn fake_abort(
        State(fake): State<Arc<FakeOpencode>>,
        Path(id): Path<String>,
    ) -> Json<Value> {
        fake.aborted.lock().unwrap().push(id);
        fake.log.lock().unwrap().push("abort-received".into());
        tokio::time::sleep(fake.abort_delay).await;
        fake.log.lock().unwrap().push("abort-done".into());
        Json(json!(true))
    }

    async fn spawn_fake_opencode(script: Vec<(u64, Value)>) -> (String, Arc<FakeOpencode>) {
        spawn_slow_abort_opencode(script, Duration::ZERO).await
    }

    async fn spawn_slow_abort_opencode(
        script: Vec<(u64, Value)>,
        abort_delay: Duration,
    ) -> (String, Arc<FakeOpencode>) {
        let (events, _) = broadcast::channel(64);
        let fake = Arc::new(FakeOpencode {
            events,
            script,
            created: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            abort_delay,
            log: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/session", post(fake_create))
            .route("/event", get(fake_events))
            .route("/session/{id}/prompt_async", post(fake_prompt))
            .route("/session/{id}/abort", post(fake_abort))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), fake)
    }

    fn message_updated(id: &str, role: &str) -> Value {
        json!({"type": "message.updated", "properties": {"info": {"id": id, "sessionID": "ses_fake", "role": role}}})
    }

    fn text_part(message_id: &str, part_id: &str, text: &str) -> Value {
        json!({"type": "message.part.updated", "properties": {"part": {
            "id": part_id, "sessionID": "ses_fake", "messageID": message_id, "type": "text", "text": text
        }}})
    }

    fn step_finish() -> Value {
        json!({"type": "message.part.updated", "properties": {"part": {
            "id": "prt_step", "sessionID": "ses_fake", "messageID": "msg_a", "type": "step-finish"
        }}})
    }

    fn idle() -> Value {
        json!({"type": "session.idle", "properties": {"sessionID": "ses_fake"}})
    }

    fn runner_for(base_url: &str, store: Store) -> OpencodeRunner {
        OpencodeRunner::new(
            &OpencodeConfig {
                base_url: base_url.to_string(),
                directory: "/repo".into(),
            },
            store,
        )
    }

    fn message(content: &str) -> ThreadMessage {
        ThreadMessage {
            thread_id: "t1".into(),
            message_id: "m1".into(),
            author: None,
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn turn_posts_assistant_reply_and_reuses_session() {
        let (base_url, fake) = spawn_fake_opencode(vec![
            (10, message_updated("msg_u", "user")),
            (0, text_part("msg_u", "prt_u", "fix the login bug")),
            (0, message_updated("msg_a", "assistant")),
            (0, text_part("msg_a", "prt_1", "Look")),
            (0, text_part("msg_a", "prt_1", "Looking at auth.rs now.")),
            (0, step_finish()),
            (0, idle()),
        ])
        .await;
        let store = Store::open_in_memory().unwrap();
        let runner = runner_for(&base_url, store.clone());
        let platform = Arc::new(RecordingPlatform::default());

        let ctx = TurnContext::new("t1", CancellationToken::new(), platform.clone());
        runner.run_turn(message("fix the login bug"), ctx).await.unwrap();

        assert_eq!(platform.texts(), vec!["Looking at auth.rs now."]);
        assert_eq!(
            store.get_thread_session("t1").unwrap().map(|s| s.session_id),
            Some("ses_fake".to_string())
        );
        assert_eq!(
            fake.prompts.lock().unwrap()[0]["parts"][0]["text"],
            "fix the login bug"
        );

        let ctx = TurnContext::new("t1", CancellationToken::new(), platform.clone());
        runner.run_turn(message("thanks"), ctx).await.unwrap();
        assert_eq!(fake.created.load(Ordering::SeqCst), 1);
        assert!(fake.aborted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn interrupt_stops_at_step_and_aborts_session() {
        let (base_url, fake) = spawn_fake_opencode(vec![
            (10, message_updated("msg_a", "assistant")),
            (0, text_part("msg_a", "prt_1", "partial answer")),
            (150, step_finish()),
            (0, idle()),
        ])
        .await;
        let runner = runner_for(&base_url, Store::open_in_memory().unwrap());
        let platform = Arc::new(RecordingPlatform::default());
        let token = CancellationToken::new();
        let ctx = TurnContext::new("t1", token.clone(), platform.clone());

        let turn = tokio::spawn(async move { runner.run_turn(message("long task"), ctx).await });
        while fake.prompts.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();

        let err = turn.await.unwrap().unwrap_err();
        assert!(err.is::<Interrupted>());
        assert_eq!(*fake.aborted.lock().unwrap(), vec!["ses_fake".to_string()]);
        assert!(platform.texts().is_empty());
    }

    #[tokio::test]
    async fn session_error_fails_the_turn() {
        let (base_url, _fake) = spawn_fake_opencode(vec![(
            10,
            json!({"type": "session.error", "properties": {"sessionID": "ses_fake", "error": {"name": "ProviderAuthError", "data": {"message": "invalid api key"}}}}),
        )])
        .await;
        let runner = runner_for(&base_url, Store::open_in_memory().unwrap());
        let platform = Arc::new(RecordingPlatform::default());
        let ctx = TurnContext::new("t1", CancellationToken::new(), platform);

        let err = runner.run_turn(message("hi"), ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "OpenCode error: invalid api key");
    }

    #[tokio::test]
    async fn turn_without_text_posts_completion_notice() {
        let (base_url, _fake) = spawn_fake_opencode(vec![
            (10, message_updated("msg_a", "assistant")),
            (0, step_finish()),
            (0, idle()),
        ])
        .await;
        let runner = runner_for(&base_url, Store::open_in_memory().unwrap());
        let platform = Arc::new(RecordingPlatform::default());
        let ctx = TurnContext::new("t1", CancellationToken::new(), platform.clone());

        runner.run_turn(message("run the tests"), ctx).await.unwrap();
        assert_eq!(platform.texts(), vec![EMPTY_REPLY_NOTICE]);
    }

    #[tokio::test]
    async fn force_aborted_turn_finishes_abort_before_next_prompt() {
        // The stream never reaches a step boundary, so only force-abort ends turn A.
        let (base_url, fake) =
            spawn_slow_abort_opencode(Vec::new(), Duration::from_millis(300)).await;
        let runner = Arc::new(runner_for(&base_url, Store::open_in_memory().unwrap()));
        let platform = Arc::new(RecordingPlatform::default());
        let queue = ThreadQueue::new(
            ThreadQueueConfig {
                force_abort_timeout: Duration::from_millis(200),
                idle_actor_ttl: Duration::from_secs(60),
                teardown_timeout: Duration::from_secs(5),
            },
            runner,
            platform,
        );
        let thread_message = |message_id: &str, content: &str| ThreadMessage {
            thread_id: "t1".into(),
            message_id: message_id.into(),
            author: None,
            content: content.into(),
        };
        let logged = |entry: &str| fake.log.lock().unwrap().iter().any(|e| e == entry);

        queue.enqueue(thread_message("m1", "A"));
        for _ in 0..200 {
            if logged("prompt:A") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(logged("prompt:A"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        queue.enqueue(thread_message("m2", "B"));
        for _ in 0..400 {
            if logged("prompt:B") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let log = fake.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec!["prompt:A", "abort-received", "abort-done", "prompt:B"],
            "{log:?}"
        );
        queue.shutdown();
    }
}
