//! Per-thread turn serializer with preemptive interrupt.
//!
//! Every Discord thread gets an actor task with its own mailbox. The actor
//! runs at most one turn at a time, so turns of one thread never overlap,
//! while different threads run fully in parallel.
//!
//! Key semantics:
//! - A message arriving during a turn interrupts it. The turn sees the
//!   interrupt at its next `checkpoint()`.
//! - A turn that ignores the interrupt is dropped after the force-abort
//!   timeout.
//! - While a turn is being interrupted only the newest message is kept;
//!   older queued ones are superseded.
//! - Output sent through an interrupted turn's context is discarded.
//! - A turn's teardown (see `TurnRunner::teardown`) finishes before the
//!   next turn of that thread starts.
//! - Turn failures are logged and posted to the thread.
//! - Idle actors exit after a TTL and are respawned on the next message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use kimaki_core::config::ThreadsConfig;
use kimaki_core::{ThreadMessage, ThreadState};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::platform::ChatPlatform;

/// Runs one turn: the full response to one user message.
pub trait TurnRunner: Send + Sync {
    fn run_turn<'a>(
        &'a self,
        message: ThreadMessage,
        ctx: TurnContext,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Resolves once work left behind by the last turn of `thread_id` has
    /// stopped, e.g. a server-side abort sent when the turn was dropped.
    fn teardown<'a>(&'a self, _thread_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// Returned from `TurnContext::checkpoint` once the turn must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("turn interrupted by a newer message")]
pub struct Interrupted;

/// Handle a turn uses to observe interrupts and post output.
#[derive(Clone)]
pub struct TurnContext {
    thread_id: String,
    interrupt: CancellationToken,
    platform: Arc<dyn ChatPlatform>,
}

impl TurnContext {
    pub(crate) fn new(
        thread_id: impl Into<String>,
        interrupt: CancellationToken,
        platform: Arc<dyn ChatPlatform>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            interrupt,
            platform,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Err once a newer message (or shutdown) wants this turn to stop.
    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        if self.interrupt.is_cancelled() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Post text to the thread. Dropped silently after an interrupt.
    pub async fn send(&self, text: &str) -> anyhow::Result<()> {
        if self.is_interrupted() {
            debug!(thread_id = %self.thread_id, "discarding output of interrupted turn");
            return Ok(());
        }
        self.platform.send_message(&self.thread_id, text).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    /// Stopped cooperatively after an interrupt.
    Interrupted,
    /// Dropped after ignoring an interrupt for the force-abort timeout.
    ForceAborted,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TurnReport {
    pub thread_id: String,
    pub message_id: String,
    pub outcome: TurnOutcome,
}

/// Turn outcome totals since startup.
#[derive(Default)]
pub struct TurnStats {
    completed: AtomicU64,
    interrupted: AtomicU64,
    force_aborted: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TurnTotals {
    pub completed: u64,
    pub interrupted: u64,
    pub force_aborted: u64,
    pub failed: u64,
}

impl TurnStats {
    /// Count every report `queue` publishes from now on.
    pub fn track(queue: &ThreadQueue) -> Arc<Self> {
        let stats = Arc::new(Self::default());
        let mut reports = queue.subscribe();
        let counter = stats.clone();
        tokio::spawn(async move {
            loop {
                match reports.recv().await {
                    Ok(report) => counter.record(&report),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "turn stats fell behind, reports lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        stats
    }

    fn record(&self, report: &TurnReport) {
        let counter = match report.outcome {
            TurnOutcome::Completed => &self.completed,
            TurnOutcome::Interrupted => &self.interrupted,
            TurnOutcome::ForceAborted => &self.force_aborted,
            TurnOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(
            thread_id = %report.thread_id,
            message_id = %report.message_id,
            outcome = ?report.outcome,
            "turn recorded"
        );
    }

    pub fn totals(&self) -> TurnTotals {
        TurnTotals {
            completed: self.completed.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            force_aborted: self.force_aborted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThreadQueueConfig {
    pub force_abort_timeout: Duration,
    pub idle_actor_ttl: Duration,
    /// Upper bound on waiting for `TurnRunner::teardown`.
    pub teardown_timeout: Duration,
}

impl Default for ThreadQueueConfig {
    fn default() -> Self {
        Self::from(&ThreadsConfig::default())
    }
}

impl From<&ThreadsConfig> for ThreadQueueConfig {
    fn from(config: &ThreadsConfig) -> Self {
        Self {
            force_abort_timeout: Duration::from_millis(config.force_abort_timeout_ms),
            idle_actor_ttl: Duration::from_millis(config.idle_actor_ttl_ms),
            teardown_timeout: Duration::from_millis(config.teardown_timeout_ms),
        }
    }
}

struct ThreadHandle {
    mailbox: mpsc::UnboundedSender<ThreadMessage>,
    state: watch::Receiver<ThreadState>,
}

struct Shared {
    config: ThreadQueueConfig,
    runner: Arc<dyn TurnRunner>,
    platform: Arc<dyn ChatPlatform>,
    /// Sends into a mailbox and actor exit both happen under this lock.
    threads: Mutex<HashMap<String, ThreadHandle>>,
    reports: broadcast::Sender<TurnReport>,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock_threads(&self) -> std::sync::MutexGuard<'_, HashMap<String, ThreadHandle>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct ThreadQueue {
    shared: Arc<Shared>,
}

impl ThreadQueue {
    pub fn new(
        config: ThreadQueueConfig,
        runner: Arc<dyn TurnRunner>,
        platform: Arc<dyn ChatPlatform>,
    ) -> Self {
        let (reports, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                config,
                runner,
                platform,
                threads: Mutex::new(HashMap::new()),
                reports,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Hand a message to its thread. Interrupts the running turn, if any.
    /// Returns false once the queue is shut down.
    pub fn enqueue(&self, message: ThreadMessage) -> bool {
        if self.shared.shutdown.is_cancelled() {
            warn!(thread_id = %message.thread_id, "thread queue shut down, message dropped");
            return false;
        }

        let mut threads = self.shared.lock_threads();
        let message = match threads.get(&message.thread_id) {
            Some(handle) => match handle.mailbox.send(message) {
                Ok(()) => return true,
                // Actor gone; respawn below.
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let thread_id = message.thread_id.clone();
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ThreadState::Idle);
        if mailbox_tx.send(message).is_err() {
            return false;
        }
        threads.insert(
            thread_id.clone(),
            ThreadHandle {
                mailbox: mailbox_tx,
                state: state_rx,
            },
        );
        debug!(thread_id = %thread_id, "thread actor spawned");
        tokio::spawn(run_thread_actor(
            self.shared.clone(),
            thread_id,
            mailbox_rx,
            state_tx,
        ));
        true
    }

    pub fn thread_state(&self, thread_id: &str) -> ThreadState {
        self.shared
            .lock_threads()
            .get(thread_id)
            .map(|handle| *handle.state.borrow())
            .unwrap_or_default()
    }

    /// Threads with a turn running or being interrupted.
    pub fn active_threads(&self) -> usize {
        self.shared
            .lock_threads()
            .values()
            .filter(|handle| *handle.state.borrow() != ThreadState::Idle)
            .count()
    }

    /// Threads that currently have an actor, busy or idle.
    pub fn tracked_threads(&self) -> usize {
        self.shared.lock_threads().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnReport> {
        self.shared.reports.subscribe()
    }

    /// Interrupt every running turn and stop accepting messages.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let dropped = {
            let mut threads = self.shared.lock_threads();
            let count = threads.len();
            threads.clear();
            count
        };
        info!(threads = dropped, "thread queue shut down");
    }
}

async fn run_thread_actor(
    shared: Arc<Shared>,
    thread_id: String,
    mut mailbox: mpsc::UnboundedReceiver<ThreadMessage>,
    state: watch::Sender<ThreadState>,
) {
    let mut next: Option<ThreadMessage> = None;
    loop {
        let message = match next.take() {
            Some(message) => message,
            None => match wait_for_message(&shared, &thread_id, &mut mailbox).await {
                Some(message) => message,
                None => break,
            },
        };
        if shared.shutdown.is_cancelled() {
            break;
        }

        let message_id = message.message_id.clone();
        let (outcome, superseding) =
            run_turn(&shared, &thread_id, message, &mut mailbox, &state).await;
        next = superseding;
        set_state(&state, &thread_id, ThreadState::Idle);
        report_outcome(&shared, &thread_id, &message_id, outcome).await;
    }
    debug!(thread_id = %thread_id, "thread actor exited");
}

/// Wait for the next message. None means the actor should exit: idle TTL
/// reached with an empty mailbox, or shutdown.
async fn wait_for_message(
    shared: &Shared,
    thread_id: &str,
    mailbox: &mut mpsc::UnboundedReceiver<ThreadMessage>,
) -> Option<ThreadMessage> {
    tokio::select! {
        received = mailbox.recv() => received,
        _ = tokio::time::sleep(shared.config.idle_actor_ttl) => {
            let mut threads = shared.lock_threads();
            // Senders hold the lock, so an empty mailbox here stays empty.
            match mailbox.try_recv() {
                Ok(message) => Some(message),
                Err(_) => {
                    if !shared.shutdown.is_cancelled() {
                        threads.remove(thread_id);
                    }
                    debug!(thread_id, "idle thread actor retiring");
                    None
                }
            }
        }
        _ = shared.shutdown.cancelled() => None,
    }
}

/// Drive one turn to its end. Returns the outcome and the message that
/// superseded it, if one arrived meanwhile.
async fn run_turn(
    shared: &Shared,
    thread_id: &str,
    message: ThreadMessage,
    mailbox: &mut mpsc::UnboundedReceiver<ThreadMessage>,
    state: &watch::Sender<ThreadState>,
) -> (TurnOutcome, Option<ThreadMessage>) {
    // Child of shutdown: stopping the queue interrupts every turn.
    let interrupt = shared.shutdown.child_token();
    let ctx = TurnContext::new(thread_id, interrupt.clone(), shared.platform.clone());
    let message_id = message.message_id.clone();

    set_state(state, thread_id, ThreadState::Running);
    debug!(thread_id, message_id = %message_id, "turn started");

    let mut turn = shared.runner.run_turn(message, ctx);
    let mut next: Option<ThreadMessage> = None;
    let mut deadline: Option<Instant> = None;
    let mut mailbox_open = true;

    let outcome = loop {
        tokio::select! {
            result = &mut turn => break classify(result, &interrupt),
            received = mailbox.recv(), if mailbox_open => match received {
                Some(newer) => {
                    if let Some(superseded) = next.replace(newer) {
                        info!(
                            thread_id,
                            superseded = %superseded.message_id,
                            "queued message superseded by a newer one"
                        );
                    }
                    interrupt.cancel();
                }
                None => mailbox_open = false,
            },
            _ = interrupt.cancelled(), if deadline.is_none() => {
                deadline = Some(Instant::now() + shared.config.force_abort_timeout);
                set_state(state, thread_id, ThreadState::Interrupted);
                debug!(thread_id, message_id = %message_id, "turn interrupt signalled");
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                warn!(
                    thread_id,
                    message_id = %message_id,
                    timeout_ms = shared.config.force_abort_timeout.as_millis() as u64,
                    "turn ignored interrupt, force-aborting"
                );
                break TurnOutcome::ForceAborted;
            }
        }
    };
    // Dropping the future aborts whatever the turn was awaiting.
    drop(turn);

    let teardown = shared.runner.teardown(thread_id);
    if tokio::time::timeout(shared.config.teardown_timeout, teardown)
        .await
        .is_err()
    {
        warn!(
            thread_id,
            message_id = %message_id,
            timeout_ms = shared.config.teardown_timeout.as_millis() as u64,
            "turn teardown timed out"
        );
    }
    (outcome, next)
}

fn set_state(state: &watch::Sender<ThreadState>, thread_id: &str, next: ThreadState) {
    if state.send_replace(next) != next {
        debug!(thread_id, state = next.as_str(), "thread state changed");
    }
}

fn classify(result: anyhow::Result<()>, interrupt: &CancellationToken) -> TurnOutcome {
    match result {
        Ok(()) => TurnOutcome::Completed,
        Err(err) if err.is::<Interrupted>() || interrupt.is_cancelled() => TurnOutcome::Interrupted,
        Err(err) => TurnOutcome::Failed(format!("{err:#}")),
    }
}

async fn report_outcome(shared: &Shared, thread_id: &str, message_id: &str, outcome: TurnOutcome) {
    match &outcome {
        TurnOutcome::Completed => debug!(thread_id, message_id, "turn completed"),
        TurnOutcome::Interrupted => info!(thread_id, message_id, "turn interrupted"),
        TurnOutcome::ForceAborted => info!(thread_id, message_id, "turn force-aborted"),
        TurnOutcome::Failed(err) => {
            error!(thread_id, message_id, err = %err, "turn failed");
            let notice = format!("✗ Error: {err}");
            if let Err(send_err) = shared.platform.send_message(thread_id, &notice).await {
                error!(thread_id, err = %send_err, "failed to post turn error to thread");
            }
        }
    }
    let _ = shared.reports.send(TurnReport {
        thread_id: thread_id.to_string(),
        message_id: message_id.to_string(),
        outcome,
    });
}
