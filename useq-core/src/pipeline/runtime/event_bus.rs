use async_trait::async_trait;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::Result;
use crate::pipeline::events::{PipelineEvent, PipelineEventPublisher};

/// In-process fan-out of pipeline events to observers inside the daemon.
///
/// Publishing never blocks; slow subscribers lag and lose the oldest events.
pub struct InProcPipelineEventBus {
    sender: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcPipelineEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcPipelineEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcPipelineEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcPipelineEventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl PipelineEventPublisher for InProcPipelineEventBus {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        debug!(
            target: "pipeline::events",
            run_id = %event.meta.run_id,
            correlation_id = %event.meta.correlation_id,
            payload = ?event.payload,
            "pipeline event"
        );
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

pub trait PipelineEventStream {
    fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent>;
}

impl PipelineEventStream for InProcPipelineEventBus {
    fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::events::PipelineEventPayload;
    use crate::types::ids::RunId;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = InProcPipelineEventBus::new(8);
        let mut rx = bus.subscribe_events();
        let run = RunId::new("R1").unwrap();

        bus.publish(PipelineEvent::new(
            run.clone(),
            None,
            PipelineEventPayload::Registered {
                path: "/runs/R1".into(),
            },
        ))
        .await
        .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), &run);
        assert!(matches!(
            event.payload,
            PipelineEventPayload::Registered { .. }
        ));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_succeeds() {
        let bus = InProcPipelineEventBus::default();
        let event = PipelineEvent::new(
            RunId::new("R1").unwrap(),
            None,
            PipelineEventPayload::Registered { path: "/x".into() },
        );
        assert!(bus.publish(event).await.is_ok());
    }
}
