//! IPC dispatcher: answers requests that worker processes insert into SQLite.
//!
//! A poller ticks on a fixed interval. Each tick optionally sweeps stale
//! `processing` rows, atomically claims every `pending` row and dispatches
//! the claimed requests one by one. Ticks never overlap; a tick that finds
//! the previous one still running is skipped.
//!
//! File uploads wait on a human, so their handler only starts the prompt and
//! hands the wait to a detached supervisor task. That task is the single
//! place the upload's terminal response is written.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use kimaki_core::config::IpcConfig;
use kimaki_core::{
    ActionButtonsPayload, FileUploadPayload, IpcRequest, IpcRequestKind, IpcResponse,
    normalize_buttons,
};
use kimaki_store::{IpcRequestStore, run_blocking};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::platform::{ActionButtonsRequest, ChatPlatform, FileUploadRequest};

pub const DEFAULT_UPLOAD_PROMPT: &str = "Please upload files";

#[derive(Debug, Clone)]
pub struct IpcDispatcherConfig {
    pub poll_interval: Duration,
    pub stale_check_interval: Duration,
    pub stale_ttl: Duration,
}

impl Default for IpcDispatcherConfig {
    fn default() -> Self {
        Self::from(&IpcConfig::default())
    }
}

impl From<&IpcConfig> for IpcDispatcherConfig {
    fn from(config: &IpcConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            stale_check_interval: config.stale_check_interval(),
            stale_ttl: config.stale_ttl(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The previous tick was still running; nothing was done.
    pub skipped: bool,
    pub stale_cancelled: usize,
    pub claimed: usize,
    /// Requests whose handler returned an error.
    pub failed: usize,
}

struct TickState {
    last_stale_check: Option<Instant>,
}

struct DispatcherInner {
    config: IpcDispatcherConfig,
    store: Arc<dyn IpcRequestStore>,
    platform: Arc<dyn ChatPlatform>,
    tick_state: tokio::sync::Mutex<TickState>,
}

struct Poller {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct IpcDispatcher {
    inner: Arc<DispatcherInner>,
    poller: Mutex<Option<Poller>>,
    /// Serializes `start` and `stop`.
    lifecycle: tokio::sync::Mutex<()>,
}

impl IpcDispatcher {
    pub fn new(
        config: IpcDispatcherConfig,
        store: Arc<dyn IpcRequestStore>,
        platform: Arc<dyn ChatPlatform>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                store,
                platform,
                tick_state: tokio::sync::Mutex::new(TickState {
                    last_stale_check: None,
                }),
            }),
            poller: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Cancel leftovers from a previous run, then start polling.
    ///
    /// Fails without starting if the leftovers cannot be cancelled. Calling
    /// `start` on a running dispatcher does nothing.
    pub async fn start(&self) -> anyhow::Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            debug!("IPC dispatcher already running");
            return Ok(());
        }

        run_blocking(&self.inner.store, |store| {
            store.cancel_all_pending_ipc_requests()
        })
        .await
        .context("failed to cancel IPC requests left by a previous run")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.inner.clone().run(shutdown_rx));
        *self.poller.lock().unwrap_or_else(PoisonError::into_inner) = Some(Poller {
            shutdown: shutdown_tx,
            task,
        });

        info!(
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            stale_ttl_secs = self.inner.config.stale_ttl.as_secs(),
            "IPC dispatcher started"
        );
        Ok(())
    }

    /// Stop polling. Waits for an in-flight tick to finish. Upload supervisors
    /// already spawned keep running. Safe to call more than once.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(poller) = poller else {
            return;
        };
        let _ = poller.shutdown.send(true);
        if let Err(err) = poller.task.await {
            error!(err = %err, "IPC poller task ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl DispatcherInner {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if !report.skipped && report.claimed + report.stale_cancelled > 0 {
                        debug!(
                            claimed = report.claimed,
                            failed = report.failed,
                            stale_cancelled = report.stale_cancelled,
                            "IPC tick"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("IPC dispatcher stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&self) -> TickReport {
        let Ok(mut state) = self.tick_state.try_lock() else {
            debug!("previous IPC tick still running, skipping");
            return TickReport {
                skipped: true,
                ..TickReport::default()
            };
        };
        let mut report = TickReport::default();

        let sweep_due = state
            .last_stale_check
            .is_none_or(|last| last.elapsed() >= self.config.stale_check_interval);
        if sweep_due {
            state.last_stale_check = Some(Instant::now());
            let ttl = self.config.stale_ttl;
            match run_blocking(&self.store, move |store| {
                store.cancel_stale_processing_requests(ttl)
            })
            .await
            {
                Ok(0) => {}
                Ok(cancelled) => {
                    report.stale_cancelled = cancelled;
                    warn!(
                        cancelled,
                        ttl_secs = self.config.stale_ttl.as_secs(),
                        "cancelled stale IPC requests"
                    );
                }
                Err(err) => error!(err = %err, "stale IPC sweep failed"),
            }
        }

        let claimed = match run_blocking(&self.store, |store| {
            store.claim_pending_ipc_requests()
        })
        .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                error!(err = %err, "failed to claim IPC requests");
                return report;
            }
        };
        report.claimed = claimed.len();

        for request in claimed {
            let request_id = request.id.clone();
            let request_type = request.request_type.clone();
            if let Err(err) = self.dispatch_request(request).await {
                report.failed += 1;
                error!(
                    request_id = %request_id,
                    request_type = %request_type,
                    err = %err,
                    "IPC handler failed"
                );
                let response = IpcResponse::error(format!("IPC handler failed: {err}"));
                if let Err(err) = complete(&self.store, &request_id, &response).await {
                    error!(request_id = %request_id, err = %err, "failed to record handler error");
                }
            }
        }

        report
    }

    async fn dispatch_request(&self, request: IpcRequest) -> anyhow::Result<()> {
        match request.kind() {
            IpcRequestKind::FileUpload => self.handle_file_upload(request).await,
            IpcRequestKind::ActionButtons => self.handle_action_buttons(request).await,
            IpcRequestKind::Unknown(kind) => {
                warn!(request_id = %request.id, request_type = %kind, "unknown IPC type");
                complete(
                    &self.store,
                    &request.id,
                    &IpcResponse::error(format!("Unknown IPC type: {kind}")),
                )
                .await?;
                Ok(())
            }
        }
    }

    async fn handle_file_upload(&self, request: IpcRequest) -> anyhow::Result<()> {
        let payload: FileUploadPayload = match serde_json::from_str(&request.payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(request_id = %request.id, err = %err, "invalid file_upload payload");
                let response = IpcResponse::error(format!("Invalid file_upload payload: {err}"));
                complete(&self.store, &request.id, &response).await?;
                return Ok(());
            }
        };

        let thread = match self.platform.resolve_thread(&request.thread_id).await {
            Ok(thread) => thread,
            Err(err) => {
                warn!(request_id = %request.id, thread_id = %request.thread_id, err = %err, "file_upload target unavailable");
                complete(&self.store, &request.id, &IpcResponse::error(err.to_string())).await?;
                return Ok(());
            }
        };

        debug!(thread_id = %thread.id, thread_name = ?thread.name, "upload target resolved");
        let upload = FileUploadRequest {
            upload_id: request.id,
            thread_id: thread.id,
            session_id: request.session_id,
            prompt: payload
                .prompt
                .clone()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_UPLOAD_PROMPT.to_string()),
            max_files: payload.max_files(),
            directory: payload.directory,
        };
        info!(
            request_id = %upload.upload_id,
            thread_id = %upload.thread_id,
            max_files = upload.max_files,
            "file upload prompt started"
        );
        tokio::spawn(supervise_upload(
            self.store.clone(),
            self.platform.clone(),
            upload,
        ));
        Ok(())
    }

    async fn handle_action_buttons(&self, request: IpcRequest) -> anyhow::Result<()> {
        let payload: ActionButtonsPayload = match serde_json::from_str(&request.payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(request_id = %request.id, err = %err, "invalid action_buttons payload");
                let response = IpcResponse::error(format!("Invalid action_buttons payload: {err}"));
                complete(&self.store, &request.id, &response).await?;
                return Ok(());
            }
        };

        let buttons = normalize_buttons(payload.buttons.as_ref());
        if buttons.is_empty() {
            complete(
                &self.store,
                &request.id,
                &IpcResponse::error("No valid buttons provided"),
            )
            .await?;
            return Ok(());
        }

        let thread = match self.platform.resolve_thread(&request.thread_id).await {
            Ok(thread) => thread,
            Err(err) => {
                warn!(request_id = %request.id, thread_id = %request.thread_id, err = %err, "action_buttons target unavailable");
                complete(&self.store, &request.id, &IpcResponse::error(err.to_string())).await?;
                return Ok(());
            }
        };

        debug!(thread_id = %thread.id, thread_name = ?thread.name, "buttons target resolved");
        let request_id = request.id.clone();
        let count = buttons.len();
        let enqueued = self
            .platform
            .enqueue_action_buttons(ActionButtonsRequest {
                request_id: request.id,
                thread_id: thread.id,
                session_id: request.session_id,
                directory: payload.directory,
                buttons,
            })
            .await;

        let response = match enqueued {
            Ok(()) => {
                info!(request_id = %request_id, count, "action buttons queued");
                IpcResponse::ack()
            }
            Err(err) => {
                warn!(request_id = %request_id, err = %err, "failed to show action buttons");
                IpcResponse::error(format!("Failed to show buttons: {err:#}"))
            }
        };
        complete(&self.store, &request_id, &response).await?;
        Ok(())
    }
}

/// Write a terminal response. A false return means the row was already
/// terminal, which happens when a stale sweep or shutdown won the race.
async fn complete(
    store: &Arc<dyn IpcRequestStore>,
    request_id: &str,
    response: &IpcResponse,
) -> anyhow::Result<bool> {
    let id = request_id.to_string();
    let json = response.to_json();
    let written = run_blocking(store, move |store| store.complete_ipc_request(&id, &json)).await?;
    if written {
        debug!(request_id, is_error = response.is_error(), "IPC request answered");
    } else {
        debug!(request_id, "IPC request already closed, response dropped");
    }
    Ok(written)
}

async fn supervise_upload(
    store: Arc<dyn IpcRequestStore>,
    platform: Arc<dyn ChatPlatform>,
    upload: FileUploadRequest,
) {
    let request_id = upload.upload_id.clone();
    let response = match platform.request_file_upload(upload).await {
        Ok(file_paths) => {
            info!(request_id = %request_id, files = file_paths.len(), "file upload finished");
            IpcResponse::files(file_paths)
        }
        Err(err) => {
            warn!(request_id = %request_id, err = %err, "file upload failed");
            IpcResponse::error(format!("File upload failed: {err:#}"))
        }
    };
    if let Err(err) = complete(&store, &request_id, &response).await {
        error!(request_id = %request_id, err = %err, "failed to record file upload result");
    }
}
