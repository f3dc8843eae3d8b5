use std::time::Duration;

use anyhow::{Context, anyhow};
use futures::future::BoxFuture;
use kimaki_core::config::DiscordConfig;
use kimaki_core::{ActionButton, ButtonColor};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::platform::{
    ActionButtonsRequest, ChatPlatform, FileUploadRequest, PendingUploads, PlatformError,
    ThreadInfo,
};

pub const DISCORD_MAX_MESSAGE_CHARS: usize = 2000;

/// Announcement, public and private thread channel types.
const THREAD_CHANNEL_TYPES: [u8; 3] = [10, 11, 12];

const COMPONENT_ACTION_ROW: u8 = 1;
const COMPONENT_BUTTON: u8 = 2;

pub const UPLOAD_BUTTON_PREFIX: &str = "kimaki_upload:";
pub const ACTION_BUTTON_PREFIX: &str = "kimaki_action:";

/// Discord REST bridge. Outbound only; interactions are delivered back to
/// kimakid over HTTP by the gateway process.
#[derive(Clone)]
pub struct DiscordRest {
    client: Client,
    bot_token: Option<String>,
    api_base: String,
    uploads: PendingUploads,
    upload_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct DiscordChannel {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    name: Option<String>,
}

impl DiscordRest {
    pub fn new(config: &DiscordConfig, uploads: PendingUploads) -> Self {
        let bot_token = std::env::var("DISCORD_BOT_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Self::with_token(
            &config.api_base,
            bot_token,
            uploads,
            Duration::from_millis(config.upload_timeout_ms),
        )
    }

    pub fn with_token(
        api_base: &str,
        bot_token: Option<String>,
        uploads: PendingUploads,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            bot_token,
            api_base: api_base.trim_end_matches('/').to_string(),
            uploads,
            upload_timeout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bot_token.is_some()
    }

    fn auth_header(&self) -> anyhow::Result<String> {
        let token = self
            .bot_token
            .as_ref()
            .ok_or_else(|| anyhow!("DISCORD_BOT_TOKEN is not set for kimakid"))?;
        Ok(format!("Bot {token}"))
    }

    async fn fetch_channel(&self, channel_id: &str) -> Result<DiscordChannel, PlatformError> {
        let response = self
            .client
            .get(format!("{}/channels/{channel_id}", self.api_base))
            .header("Authorization", self.auth_header()?)
            .send()
            .await
            .context("failed to call Discord GET /channels")?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => {
                Err(PlatformError::ThreadNotFound(channel_id.to_string()))
            }
            status if !status.is_success() => Err(PlatformError::Other(anyhow!(
                "Discord GET /channels/{channel_id} returned {status}"
            ))),
            _ => Ok(response
                .json()
                .await
                .context("failed to parse Discord channel")?),
        }
    }

    async fn create_message(&self, channel_id: &str, body: Value) -> anyhow::Result<String> {
        let response = self
            .client
            .post(format!("{}/channels/{channel_id}/messages", self.api_base))
            .header("Authorization", self.auth_header()?)
            .json(&body)
            .send()
            .await
            .context("failed to call Discord create message")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("Discord create message returned {status}: {detail}"));
        }
        let created: Value = response
            .json()
            .await
            .context("failed to parse Discord create message response")?;
        Ok(created
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

impl ChatPlatform for DiscordRest {
    fn resolve_thread<'a>(
        &'a self,
        thread_id: &'a str,
    ) -> BoxFuture<'a, Result<ThreadInfo, PlatformError>> {
        Box::pin(async move {
            let channel = self.fetch_channel(thread_id).await?;
            if !THREAD_CHANNEL_TYPES.contains(&channel.kind) {
                return Err(PlatformError::NotAThread(thread_id.to_string()));
            }
            Ok(ThreadInfo {
                id: channel.id,
                name: channel.name,
            })
        })
    }

    fn send_message<'a>(
        &'a self,
        thread_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if text.trim().is_empty() {
                return Err(anyhow!("cannot send an empty Discord message"));
            }
            let chunks = split_for_discord(text, DISCORD_MAX_MESSAGE_CHARS);
            for chunk in &chunks {
                self.create_message(thread_id, json!({ "content": chunk }))
                    .await?;
            }
            debug!(thread_id, chunks = chunks.len(), "discord message sent");
            Ok(())
        })
    }

    fn request_file_upload(
        &self,
        request: FileUploadRequest,
    ) -> BoxFuture<'_, anyhow::Result<Vec<String>>> {
        Box::pin(async move {
            let noun = if request.max_files == 1 { "file" } else { "files" };
            let content = format!(
                "{}\n-# up to {} {noun}",
                request.prompt, request.max_files
            );
            let button = json!({
                "type": COMPONENT_BUTTON,
                "style": button_style(Some(ButtonColor::Blue)),
                "label": "Upload files",
                "custom_id": format!("{UPLOAD_BUTTON_PREFIX}{}", request.upload_id),
            });
            self.create_message(
                &request.thread_id,
                json!({
                    "content": content,
                    "components": [{ "type": COMPONENT_ACTION_ROW, "components": [button] }],
                }),
            )
            .await
            .context("failed to post upload prompt")?;

            info!(
                upload_id = %request.upload_id,
                thread_id = %request.thread_id,
                "upload prompt posted, waiting for user"
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
            let body = json!({
                "content": "-# Choose an action",
                "components": [action_row(&request.request_id, &request.buttons)],
            });
            self.create_message(&request.thread_id, body).await?;
            Ok(())
        })
    }
}

/// Discord button style for a requested color. White and missing colors
/// render as the neutral secondary style.
fn button_style(color: Option<ButtonColor>) -> u8 {
    match color {
        Some(ButtonColor::Blue) => 1,
        Some(ButtonColor::Green) => 3,
        Some(ButtonColor::Red) => 4,
        Some(ButtonColor::White) | None => 2,
    }
}

fn action_row(request_id: &str, buttons: &[ActionButton]) -> Value {
    let components: Vec<Value> = buttons
        .iter()
        .enumerate()
        .map(|(index, button)| {
            json!({
                "type": COMPONENT_BUTTON,
                "style": button_style(button.color),
                "label": button.label,
                "custom_id": format!("{ACTION_BUTTON_PREFIX}{request_id}:{index}"),
            })
        })
        .collect();
    json!({ "type": COMPONENT_ACTION_ROW, "components": components })
}

/// Split into chunks of at most `max_chars` characters, breaking after the
/// last newline in a window when there is one.
fn split_for_discord(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let Some((limit, _)) = rest.char_indices().nth(max_chars) else {
            chunks.push(rest.to_string());
            break;
        };
        let cut = rest[..limit]
            .rfind('\n')
            .filter(|&newline| newline > 0)
            .map_or(limit, |newline| newline + 1);
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    chunks
}
