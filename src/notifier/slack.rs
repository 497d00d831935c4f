//! Slack chat sink.
//!
//! Posts a short human-readable summary through `chat.postMessage`. The
//! operator label is re-read on every send since it can change while the
//! instance runs.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{NotificationEvent, NotificationSink};
use crate::config::NotifierConfig;
use crate::error::NotifyError;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    text: String,
    attachments: [Attachment<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Attachment<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Chat notifications for one instance.
pub struct SlackSink {
    client: reqwest::Client,
    api_url: String,
    token: SecretString,
    channel: String,
    agi_name: String,
    label_path: PathBuf,
    owner: String,
    sources: Vec<String>,
    hints: String,
}

impl std::fmt::Debug for SlackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackSink")
            .field("api_url", &self.api_url)
            .field("channel", &self.channel)
            .field("agi_name", &self.agi_name)
            .finish_non_exhaustive()
    }
}

impl SlackSink {
    pub fn new(
        api_url: &str,
        token: SecretString,
        channel: &str,
        agi_name: &str,
        label_path: PathBuf,
        owner: String,
        sources: Vec<String>,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(TIMEOUT)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| NotifyError::Client(e.to_string()))?;
        Ok(Self {
            client,
            api_url: api_url.to_string(),
            token,
            channel: channel.to_string(),
            agi_name: agi_name.to_string(),
            label_path,
            owner: owner.trim().to_string(),
            sources,
            hints: access_hints(agi_name),
        })
    }

    pub fn from_config(
        config: &NotifierConfig,
        agi_name: &str,
        label_path: PathBuf,
        owner: String,
        sources: Vec<String>,
    ) -> Result<Self, NotifyError> {
        let token = config
            .slack_token
            .clone()
            .ok_or_else(|| NotifyError::Client("slack token not configured".to_string()))?;
        let channel = config.slack_channel.as_deref().unwrap_or_default();
        Self::new(
            config.slack_api_url(),
            token,
            channel,
            agi_name,
            label_path,
            owner,
            sources,
        )
    }

    /// Current operator label, re-read on every send. Empty when unreadable.
    async fn read_label(&self) -> String {
        tokio::fs::read_to_string(&self.label_path)
            .await
            .unwrap_or_default()
    }

    fn message(
        &self,
        event: &NotificationEvent,
        label: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> String {
        let mut text = format!(
            "*{}* _@ {}_\n> *AGI Name*: {}\n> *AGI Label*: {}\n> *Owner*: {}",
            event.kind,
            now.format("%d %b %y %H:%M UTC"),
            self.agi_name,
            label.trim(),
            self.owner,
        );
        for source in &self.sources {
            text.push('\n');
            text.push_str(source);
        }
        text.push_str(&format!("\n> *{}*", event.kind.sentence()));
        text
    }
}

/// Operator commands for reaching or tearing down the instance.
fn access_hints(name: &str) -> String {
    format!(
        "Attach:\n  `aerolab agi attach -n {name}`\n\
         Get Web URL:\n  `aerolab agi list`\n\
         Get Detailed Status:\n  `aerolab agi status -n {name}`\n\
         Get auth token:\n  `aerolab agi add-auth-token -n {name}`\n\
         Change Label:\n  `aerolab agi change-label -n {name} -l \"new label\"`\n\
         Destroy:\n  `aerolab agi destroy -f -n {name}`\n\
         Destroy and remove volume (AWS EFS only):\n  `aerolab agi delete -f -n {name}`"
    )
}

#[async_trait]
impl NotificationSink for SlackSink {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let body = PostMessage {
            channel: &self.channel,
            text: self.message(event, &self.read_label().await, chrono::Utc::now()),
            attachments: [Attachment { text: &self.hints }],
        };
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(self.token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Request {
                sink: "slack",
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                sink: "slack",
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        // Slack reports API errors with HTTP 200 and `ok: false`.
        let reply: PostMessageResponse =
            response.json().await.map_err(|e| NotifyError::Request {
                sink: "slack",
                reason: format!("unreadable response: {e}"),
            })?;
        if reply.ok {
            Ok(())
        } else {
            Err(NotifyError::Rejected {
                sink: "slack",
                status: status.as_u16(),
                body: reply.error.unwrap_or_default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{Json, Router, extract::State, http::HeaderMap, routing::post};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::notifier::{EventKind, Notifier};
    use crate::status::StatusSnapshot;

    fn sink(api_url: &str, label_path: PathBuf) -> SlackSink {
        SlackSink::new(
            api_url,
            SecretString::from("xoxb-test".to_string()),
            "#agi",
            "agi-1",
            label_path,
            "alice\n".to_string(),
            vec!["> *S3 Source*: logs:2024/ .*".to_string()],
        )
        .expect("sink")
    }

    #[tokio::test]
    async fn message_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let label = dir.path().join("label");
        std::fs::write(&label, "prod incident\n").expect("write");
        let sink = sink("http://127.0.0.1:1/", label.clone());
        let event =
            Notifier::new("agi-1", true).event(EventKind::ServiceDown, StatusSnapshot::default(), None);
        let now = chrono::Utc
            .with_ymd_and_hms(2024, 3, 5, 14, 7, 0)
            .single()
            .expect("time");

        assert_eq!(
            sink.message(&event, &sink.read_label().await, now),
            "*SERVICE_DOWN* _@ 05 Mar 24 14:07 UTC_\n\
             > *AGI Name*: agi-1\n\
             > *AGI Label*: prod incident\n\
             > *Owner*: alice\n\
             > *S3 Source*: logs:2024/ .*\n\
             > *A required service has quit unexpectedly, check: aerolab agi status*"
        );

        std::fs::write(&label, "renamed").expect("write");
        let label = sink.read_label().await;
        assert!(sink.message(&event, &label, now).contains("> *AGI Label*: renamed\n"));

        std::fs::remove_file(dir.path().join("label")).expect("remove");
        let label = sink.read_label().await;
        assert!(sink.message(&event, &label, now).contains("> *AGI Label*: \n"));
    }

    #[test]
    fn hints_name_the_instance() {
        let hints = access_hints("agi-9");
        assert!(hints.contains("`aerolab agi attach -n agi-9`"));
        assert!(hints.contains("`aerolab agi delete -f -n agi-9`"));
    }

    type Captured = mpsc::UnboundedSender<(HeaderMap, serde_json::Value)>;

    async fn chat_api(
        State(tx): State<Arc<Captured>>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        let ok = body["channel"] == "#agi";
        let _ = tx.send((headers, body));
        if ok {
            Json(serde_json::json!({"ok": true}))
        } else {
            Json(serde_json::json!({"ok": false, "error": "channel_not_found"}))
        }
    }

    #[tokio::test]
    async fn posts_with_bearer_token_and_hints_attachment() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/api/chat.postMessage", post(chat_api))
            .with_state(Arc::new(tx));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("http://{addr}/api/chat.postMessage");
        let event = Notifier::new("agi-1", true).event(
            EventKind::MaxAgeShutdown,
            StatusSnapshot::default(),
            None,
        );

        sink(&url, dir.path().join("label"))
            .send(&event)
            .await
            .expect("sent");
        let (headers, body) = rx.recv().await.expect("captured");
        assert_eq!(headers["authorization"], "Bearer xoxb-test");
        assert!(
            body["text"]
                .as_str()
                .expect("text")
                .starts_with("*MAX_AGE_SHUTDOWN* _@ ")
        );
        assert!(
            body["attachments"][0]["text"]
                .as_str()
                .expect("attachment")
                .contains("aerolab agi status -n agi-1")
        );

        let mut wrong_channel = sink(&url, dir.path().join("label"));
        wrong_channel.channel = "#nowhere".to_string();
        let err = wrong_channel.send(&event).await.expect_err("rejected");
        assert!(
            matches!(err, NotifyError::Rejected { sink: "slack", ref body, .. } if body == "channel_not_found")
        );
    }
}
