use serde::Serialize;
use tokio::sync::broadcast;

/// Streaming progress events emitted as a pipeline run executes (`spec.md` §4.1,
/// §2 "emits streaming events"). External subscribers (the HTTP layer, outside
/// this crate's scope) receive these over a broadcast channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted { run_id: String, chat_id: String },
    AgentStarted { run_id: String, agent_name: String },
    AgentCompleted { run_id: String, agent_name: String },
    AgentFailed { run_id: String, agent_name: String, reason: String },
    RemediationStarted { run_id: String, agent_name: String, cycle: u32 },
    RunCompleted { run_id: String, status: String, summary: String },
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Events with no subscribers are dropped silently, same as the teacher's
    /// own streaming layers.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(PipelineEvent::RunStarted {
            run_id: "r1".into(),
            chat_id: "c1".into(),
        });
        let event = rx.recv().await.unwrap();
        matches!(event, PipelineEvent::RunStarted { .. });
    }
}
