//! Chat platform seam used by the IPC dispatcher and the thread serializer.
//!
//! kimakid never talks to Discord directly from the core loops. Everything
//! goes through `ChatPlatform`, implemented by the Discord REST bridge and by
//! `LogOnlyPlatform` for standalone runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use futures::future::BoxFuture;
use kimaki_core::ActionButton;
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("thread {0} not found")]
    ThreadNotFound(String),
    #[error("channel {0} is not a thread")]
    NotAThread(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: String,
    pub name: Option<String>,
}

/// Ask the user to upload files into a thread.
#[derive(Debug, Clone)]
pub struct FileUploadRequest {
    /// Key in `PendingUploads`; the IPC request id.
    pub upload_id: String,
    pub thread_id: String,
    pub session_id: String,
    pub directory: Option<String>,
    pub prompt: String,
    pub max_files: u32,
}

#[derive(Debug, Clone)]
pub struct ActionButtonsRequest {
    pub request_id: String,
    pub thread_id: String,
    pub session_id: String,
    pub directory: Option<String>,
    pub buttons: Vec<ActionButton>,
}

pub trait ChatPlatform: Send + Sync {
    /// Look up a thread-like channel. Fails if absent or not a thread.
    fn resolve_thread<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> BoxFuture<'a, Result<ThreadInfo, PlatformError>>;

    fn send_message<'a>(&'a self, thread_id: &'a str, text: &'a str)
    -> BoxFuture<'a, anyhow::Result<()>>;

    /// Present an upload affordance and wait for the user to finish.
    /// Resolves with the saved file paths. May take minutes.
    fn request_file_upload(
        &self,
        request: FileUploadRequest,
    ) -> BoxFuture<'_, anyhow::Result<Vec<String>>>;

    /// Show quick-reply buttons. Returns once they are queued for rendering.
    fn enqueue_action_buttons(
        &self,
        request: ActionButtonsRequest,
    ) -> BoxFuture<'_, anyhow::Result<()>>;
}

// ---------------------------------------------------------------------------
// Pending uploads
// ---------------------------------------------------------------------------

/// Terminal user action for an upload prompt, posted back by the gateway side.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum UploadResolution {
    Files {
        #[serde(rename = "filePaths")]
        file_paths: Vec<String>,
    },
    Failed {
        error: String,
    },
}

/// Upload prompts waiting for the user, keyed by upload id.
#[derive(Clone, Default)]
pub struct PendingUploads {
    waiting: Arc<Mutex<HashMap<String, oneshot::Sender<UploadResolution>>>>,
}

impl PendingUploads {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, upload_id: &str) -> oneshot::Receiver<UploadResolution> {
        let (tx, rx) = oneshot::channel();
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        if waiting.insert(upload_id.to_string(), tx).is_some() {
            warn!(upload_id, "replacing an upload prompt that was still waiting");
        }
        rx
    }

    fn forget(&self, upload_id: &str) {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(upload_id);
    }

    /// Deliver the user's action. Returns false if nobody is waiting.
    pub fn resolve(&self, upload_id: &str, resolution: UploadResolution) -> bool {
        let sender = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(upload_id);
        match sender {
            Some(tx) => tx.send(resolution).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for `upload_id` to be resolved, up to `timeout`.
    pub async fn wait(&self, upload_id: &str, timeout: Duration) -> anyhow::Result<Vec<String>> {
        let rx = self.register(upload_id);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(UploadResolution::Files { file_paths })) => Ok(file_paths),
            Ok(Ok(UploadResolution::Failed { error })) => Err(anyhow!(error)),
            Ok(Err(_)) => Err(anyhow!("upload prompt was replaced before completion")),
            Err(_) => {
                self.forget(upload_id);
                Err(anyhow!(
                    "no files uploaded within {}s",
                    timeout.as_secs()
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Log-only platform
// ---------------------------------------------------------------------------

/// Platform used when no Discord token is configured. Logs outbound traffic
/// and treats every id as a thread.
pub struct LogOnlyPlatform {
    uploads: PendingUploads,
    upload_timeout: Duration,
}

impl LogOnlyPlatform {
    pub fn new(uploads: PendingUploads, upload_timeout: Duration) -> Self {
        Self {
            uploads,
            upload_timeout,
        }
    }
}

impl ChatPlatform for LogOnlyPlatform {
    fn resolve_thread<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> BoxFuture<'a, Result<ThreadInfo, PlatformError>> {
        Box::pin(async move {
            Ok(ThreadInfo {
                id: thread_id.to_string(),
                name: None,
            })
        })
    }

    fn send_message<'a>(
        &'a self,
        thread_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            info!(
                thread_id,
                text_len = text.len(),
                "thread message (no platform, logged only)"
            );
            Ok(())
        })
    }

    fn request_file_upload(
        &self,
        request: FileUploadRequest,
    ) -> BoxFuture<'_, anyhow::Result<Vec<String>>> {
        Box::pin(async move {
            info!(
                upload_id = %request.upload_id,
                thread_id = %request.thread_id,
                session_id = %request.session_id,
                directory = ?request.directory,
                max_files = request.max_files,
                "upload prompt (no platform, waiting for /v1/uploads)"
            );
            self.uploads
                .wait(&request.upload_id, self.upload_timeout)
                .await
        })
    }

    fn enqueue_action_buttons(
        &self,
        request: ActionButtonsRequest,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let labels: Vec<_> = request.buttons.iter().map(|b| b.label.as_str()).collect();
            info!(
                request_id = %request.request_id,
                thread_id = %request.thread_id,
                session_id = %request.session_id,
                directory = ?request.directory,
                ?labels,
                "action buttons (no platform, logged only)"
            );
            Ok(())
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_upload_resolves_with_files() {
        let uploads = PendingUploads::new();
        let waiter = {
            let uploads = uploads.clone();
            tokio::spawn(async move { uploads.wait("req-1", Duration::from_secs(5)).await })
        };
        while uploads.is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(uploads.resolve(
            "req-1",
            UploadResolution::Files {
                file_paths: vec!["/tmp/a.txt".into()]
            }
        ));
        let files = waiter.await.unwrap().unwrap();
        assert_eq!(files, vec!["/tmp/a.txt".to_string()]);
        assert!(uploads.is_empty());
    }

    #[tokio::test]
    async fn pending_upload_failure_and_timeout() {
        let uploads = PendingUploads::new();
        let err = uploads
            .wait("req-2", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no files uploaded"));
        assert!(uploads.is_empty());
        assert!(!uploads.resolve(
            "req-2",
            UploadResolution::Failed {
                error: "late".into()
            }
        ));
    }

    #[test]
    fn upload_resolution_parses_both_shapes() {
        let files: UploadResolution =
            serde_json::from_str(r#"{"filePaths":["/a","/b"]}"#).unwrap();
        assert_eq!(
            files,
            UploadResolution::Files {
                file_paths: vec!["/a".into(), "/b".into()]
            }
        );
        let failed: UploadResolution = serde_json::from_str(r#"{"error":"cancelled"}"#).unwrap();
        assert_eq!(
            failed,
            UploadResolution::Failed {
                error: "cancelled".into()
            }
        );
    }

    #[tokio::test]
    async fn log_only_platform_resolves_any_thread() {
        let platform = LogOnlyPlatform::new(PendingUploads::new(), Duration::from_secs(1));
        let thread = platform.resolve_thread("123").await.unwrap();
        assert_eq!(thread.id, "123");
        platform.send_message("123", "hello").await.unwrap();
    }
}
