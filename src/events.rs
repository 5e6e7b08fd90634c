//! Lifecycle and progress events.
//!
//! One `EventBus` is created per compiler run and handed to every component
//! that reports progress.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum CompilerEvent {
    #[serde(rename_all = "camelCase")]
    ClassAdded { classname: String },
    #[serde(rename_all = "camelCase")]
    ClassChanged { classname: String },
    #[serde(rename_all = "camelCase")]
    ClassRemoved { classname: String },
    #[serde(rename_all = "camelCase")]
    CompilingClass { classname: String, target: String },
    #[serde(rename_all = "camelCase")]
    CompiledClass { classname: String, target: String, transpiled: bool },
    #[serde(rename_all = "camelCase")]
    MakeStarted { target: String },
    #[serde(rename_all = "camelCase")]
    WritingApplication { application: String, target: String },
    #[serde(rename_all = "camelCase")]
    WrittenApplication { application: String, target: String },
    #[serde(rename_all = "camelCase")]
    MakeFinished { target: String, success: bool },
    #[serde(rename_all = "camelCase")]
    Worker { event: String, data: serde_json::Value },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CompilerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    pub fn emit(&self, event: CompilerEvent) {
        tracing::debug!(?event, "compiler event");
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CompilerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(CompilerEvent::MakeFinished {
            target: "source".into(),
            success: true,
        })
        .unwrap();
        assert_eq!(json["event"], "makeFinished");
        assert_eq!(json["data"]["success"], true);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(CompilerEvent::ClassAdded {
            classname: "app.Main".into(),
        });
        let got = rx.recv().await.unwrap();
        assert_eq!(
            got,
            CompilerEvent::ClassAdded {
                classname: "app.Main".into()
            }
        );
    }
}
