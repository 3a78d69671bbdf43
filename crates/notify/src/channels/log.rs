//! Tracing sink for domain events.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::ChannelError;
use crate::events::DomainEvent;
use crate::NotifyChannel;

/// Emits each event as a structured tracing record.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl NotifyChannel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, event: &DomainEvent) -> Result<(), ChannelError> {
        let payload = serde_json::to_string(&event.payload)?;
        if event.event_type.is_failure() {
            warn!(
                subject = %event.subject(),
                event_id = %event.event_id,
                project_id = %event.project_id,
                triggered_by = %event.triggered_by,
                payload = %payload,
                "Domain event"
            );
        } else {
            info!(
                subject = %event.subject(),
                event_id = %event.event_id,
                project_id = %event.project_id,
                triggered_by = %event.triggered_by,
                payload = %payload,
                "Domain event"
            );
        }
        Ok(())
    }
}
