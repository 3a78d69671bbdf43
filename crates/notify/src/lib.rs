//! Domain event dispatch for the CI/CD control plane.
//!
//! This crate provides fire-and-forget delivery of [`DomainEvent`]s to every
//! configured channel. Delivery is at-least-once from the caller's point of
//! view: failures are logged, never returned.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{DomainEvent, EventType, Notifier};
//!
//! # async fn run() {
//! let notifier = Notifier::from_env();
//! notifier.notify(DomainEvent::new(
//!     EventType::BuildStarted,
//!     "project-id",
//!     "user-id",
//!     serde_json::json!({"run_number": 1}),
//! ));
//! # }
//! ```
//!
//! # Configuration
//!
//! - `EVENT_WEBHOOK_URL`: enables the HTTP webhook channel
//! - `NOTIFY_DISABLED`: set to "true" to disable all channels
//!
//! The tracing [`LogChannel`] is always enabled unless notifications are
//! disabled.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::log::LogChannel;
pub use channels::webhook::WebhookChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{DomainEvent, EventType};

use std::sync::Arc;
use tracing::{debug, error, info};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Central event dispatcher.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    disabled: bool,
}

impl Notifier {
    /// Create a notifier from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if disabled {
            info!("Notifications disabled via NOTIFY_DISABLED");
            return Self::disabled();
        }

        let mut channels: Vec<Arc<dyn NotifyChannel>> = vec![Arc::new(LogChannel)];

        let webhook = WebhookChannel::from_env();
        if webhook.enabled() {
            info!("Event webhook channel enabled");
            channels.push(Arc::new(webhook));
        }

        info!(
            channel_count = channels.len(),
            "Event dispatch initialized"
        );

        Self {
            channels,
            disabled: false,
        }
    }

    /// Create a notifier with specific channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels,
            disabled: false,
        }
    }

    /// Create a disabled notifier.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: vec![],
            disabled: true,
        }
    }

    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.disabled && !self.channels.is_empty()
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.disabled {
            0
        } else {
            self.channels.len()
        }
    }

    /// Send an event to all enabled channels (fire-and-forget).
    ///
    /// Spawns one task per channel and returns immediately. Must be called
    /// from within a Tokio runtime.
    pub fn notify(&self, event: DomainEvent) {
        if !self.has_channels() {
            debug!(subject = %event.subject(), "No channels, skipping event");
            return;
        }

        let event = Arc::new(event);

        for channel in &self.channels {
            let channel = Arc::clone(channel);
            let event = Arc::clone(&event);

            tokio::spawn(async move {
                let channel_name = channel.name();

                if !channel.enabled() {
                    debug!(channel = channel_name, "Channel disabled, skipping");
                    return;
                }

                match channel.send(&event).await {
                    Ok(()) => {
                        debug!(channel = channel_name, subject = %event.subject(), "Event delivered");
                    }
                    Err(e) => {
                        error!(
                            channel = channel_name,
                            subject = %event.subject(),
                            error = %e,
                            "Failed to deliver event"
                        );
                    }
                }
            });
        }
    }

    /// Send an event and wait for every channel to finish.
    pub async fn notify_and_wait(
        &self,
        event: DomainEvent,
    ) -> Vec<(String, Result<(), ChannelError>)> {
        if !self.has_channels() {
            return vec![];
        }

        let mut results = vec![];

        for channel in &self.channels {
            if !channel.enabled() {
                continue;
            }
            let channel_name = channel.name().to_string();
            let result = channel.send(&event).await;
            results.push((channel_name, result));
        }

        results
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::from_env()
    }
}
