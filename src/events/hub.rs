// =============================================================================
// Event Hub — single-writer, many-reader broadcast actor
// =============================================================================
//
// One actor task owns the subscriber map; every other task only ever sends
// on its channels. Broadcasts are non-blocking per subscriber queue: a full
// queue evicts that subscriber rather than stalling the writer
// (backpressure-by-drop).
// =============================================================================

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bound on a subscriber's outgoing queue before it is evicted.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum HubEvent {
    #[serde(rename = "sys")]
    Sys { message: String },
    #[serde(rename = "decision")]
    Decision { trader_id: Uuid, payload: Value },
    #[serde(rename = "trade")]
    Trade { trader_id: Uuid, payload: Value },
    #[serde(rename = "message")]
    DebateMessage { session_id: Uuid, payload: Value },
    #[serde(rename = "consensus")]
    DebateConsensus { session_id: Uuid, payload: Value },
}

enum Command {
    Register { id: Uuid, tx: mpsc::Sender<HubEvent> },
    Unregister { id: Uuid },
    Broadcast { event: HubEvent },
}

/// Handle used by producers (Engine cycles, the Debate Orchestrator) to
/// publish events. Cloning is cheap — it's just an mpsc sender.
#[derive(Clone)]
pub struct EventHub {
    commands: mpsc::Sender<Command>,
}

/// A live subscription returned to an SSE handler. Holds the receiver and
/// unregisters itself from the hub when dropped (client disconnect).
pub struct Subscription {
    pub id: Uuid,
    pub rx: mpsc::Receiver<HubEvent>,
    hub: EventHub,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.hub.commands.try_send(Command::Unregister { id: self.id });
    }
}

impl EventHub {
    /// Spawn the actor task and return a handle to it.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(1024);
        let hub = Self { commands: tx };

        tokio::spawn(async move {
            let mut subscribers: std::collections::HashMap<Uuid, mpsc::Sender<HubEvent>> =
                std::collections::HashMap::new();

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Register { id, tx } => {
                        debug!(subscriber = %id, "event hub: subscriber registered");
                        subscribers.insert(id, tx);
                    }
                    Command::Unregister { id } => {
                        debug!(subscriber = %id, "event hub: subscriber unregistered");
                        subscribers.remove(&id);
                    }
                    Command::Broadcast { event } => {
                        let mut evicted = Vec::new();
                        for (id, tx) in subscribers.iter() {
                            if tx.try_send(event.clone()).is_err() {
                                warn!(subscriber = %id, "event hub: subscriber queue full, evicting");
                                evicted.push(*id);
                            }
                        }
                        for id in evicted {
                            subscribers.remove(&id);
                        }
                    }
                }
            }
        });

        hub
    }

    /// Register a new subscriber and return its queue. The SSE handler
    /// should emit `{"type":"sys","message":"connected"}` immediately after
    /// this call.
    pub async fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let _ = self.commands.send(Command::Register { id, tx }).await;
        Subscription {
            id,
            rx,
            hub: self.clone(),
        }
    }

    pub fn publish(&self, event: HubEvent) {
        if self.commands.try_send(Command::Broadcast { event }).is_err() {
            warn!("event hub: command channel full, dropping broadcast");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let hub = EventHub::spawn();
        let mut sub = hub.subscribe().await;

        hub.publish(HubEvent::Sys { message: "connected".to_string() });

        let received = tokio::time::timeout(std::time::Duration::from_secs(1), sub.rx.recv())
            .await
            .expect("should receive within timeout")
            .expect("channel should be open");

        match received {
            HubEvent::Sys { message } => assert_eq!(message, "connected"),
            _ => panic!("wrong event variant"),
        }
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters_it() {
        let hub = EventHub::spawn();
        let sub = hub.subscribe().await;
        drop(sub);
        // Give the actor a moment to process the unregister command; then a
        // broadcast with no subscribers left should simply be a no-op.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        hub.publish(HubEvent::Sys { message: "noop".to_string() });
    }
}
