//! HTTP webhook channel.
//!
//! POSTs the JSON envelope to a configured URL with the subject in the
//! `X-Event-Subject` header.

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::DomainEvent;
use crate::NotifyChannel;

/// Environment variable for the event webhook URL.
pub const ENV_EVENT_WEBHOOK_URL: &str = "EVENT_WEBHOOK_URL";

const SUBJECT_HEADER: &str = "X-Event-Subject";
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

pub struct WebhookChannel {
    url: Option<String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Create a webhook channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let url = std::env::var(ENV_EVENT_WEBHOOK_URL)
            .ok()
            .filter(|u| !u.trim().is_empty());

        if url.is_some() {
            debug!("Event webhook enabled");
        } else {
            debug!("Event webhook disabled (EVENT_WEBHOOK_URL not set)");
        }

        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a webhook channel posting to `url`.
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            url: Some(url),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn send(&self, event: &DomainEvent) -> Result<(), ChannelError> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_EVENT_WEBHOOK_URL.to_string()))?;

        debug!(channel = "webhook", subject = %event.subject(), "Sending event");

        let response = self
            .client
            .post(url)
            .header(SUBJECT_HEADER, event.subject())
            .json(event)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            channel = "webhook",
            status = %status,
            body = %body,
            "Event webhook request failed"
        );
        Err(ChannelError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> DomainEvent {
        DomainEvent::new(
            EventType::DeploySucceeded,
            "proj-1",
            "user-1",
            json!({"revision": "abc123"}),
        )
    }

    #[tokio::test]
    async fn posts_envelope_with_subject_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .and(header(SUBJECT_HEADER, "zcicd.deploy.succeeded"))
            .and(body_partial_json(json!({
                "event_type": "deploy.succeeded",
                "project_id": "proj-1",
                "payload": {"revision": "abc123"}
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let channel = WebhookChannel::new(format!("{}/events", server.uri()));
        channel.send(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn too_many_requests_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
            .mount(&server)
            .await;

        let channel = WebhookChannel::new(server.uri());
        let err = channel.send(&event()).await.unwrap_err();
        assert!(matches!(err, ChannelError::RateLimited { retry_after_secs: 12 }));
    }

    #[tokio::test]
    async fn server_error_is_rejected_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let channel = WebhookChannel::new(server.uri());
        match channel.send(&event()).await.unwrap_err() {
            ChannelError::Rejected { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unconfigured_channel_is_disabled() {
        let channel = WebhookChannel {
            url: None,
            client: reqwest::Client::new(),
        };
        assert!(!channel.enabled());
        assert!(matches!(
            channel.send(&event()).await,
            Err(ChannelError::NotConfigured(_))
        ));
    }
}
