//! Transition events and the sinks they are delivered to.
//!
//! The engine records every successful transition in the item journal as
//! part of the same transaction, and hands the events to a
//! [`NotificationSink`] once the transaction has committed. Delivery is
//! best-effort: a sink can never fail or roll back a transition.

use super::definition::{ActionId, CollectionId, StepId};
use super::models::{IdentityId, ItemId};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventKind {
    /// The item entered review at its first step.
    Submitted,
    Claimed,
    /// A claimed task went back to the pool.
    Released,
    Advanced,
    /// The item was sent to another step of its workflow.
    Returned,
    Archived,
    /// The item left review without being archived.
    Withdrawn,
    /// The item is waiting at a step whose role group has no members.
    Parked,
}

impl WorkflowEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowEventKind::Submitted => "submitted",
            WorkflowEventKind::Claimed => "claimed",
            WorkflowEventKind::Released => "released",
            WorkflowEventKind::Advanced => "advanced",
            WorkflowEventKind::Returned => "returned",
            WorkflowEventKind::Archived => "archived",
            WorkflowEventKind::Withdrawn => "withdrawn",
            WorkflowEventKind::Parked => "parked",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "submitted" => Some(WorkflowEventKind::Submitted),
            "claimed" => Some(WorkflowEventKind::Claimed),
            "released" => Some(WorkflowEventKind::Released),
            "advanced" => Some(WorkflowEventKind::Advanced),
            "returned" => Some(WorkflowEventKind::Returned),
            "archived" => Some(WorkflowEventKind::Archived),
            "withdrawn" => Some(WorkflowEventKind::Withdrawn),
            "parked" => Some(WorkflowEventKind::Parked),
            _ => None,
        }
    }
}

impl fmt::Display for WorkflowEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowEvent {
    pub item_id: ItemId,
    pub collection: CollectionId,
    pub kind: WorkflowEventKind,
    pub from_step: Option<StepId>,
    pub to_step: Option<StepId>,
    pub action: Option<ActionId>,
    /// None for administrative transitions.
    pub actor: Option<IdentityId>,
}

impl WorkflowEvent {
    pub fn new(item_id: ItemId, collection: CollectionId, kind: WorkflowEventKind) -> Self {
        WorkflowEvent {
            item_id,
            collection,
            kind,
            from_step: None,
            to_step: None,
            action: None,
            actor: None,
        }
    }

    pub fn from_step(mut self, step: Option<&StepId>) -> Self {
        self.from_step = step.cloned();
        self
    }

    pub fn to_step(mut self, step: Option<&StepId>) -> Self {
        self.to_step = step.cloned();
        self
    }

    pub fn action(mut self, action: &ActionId) -> Self {
        self.action = Some(action.clone());
        self
    }

    pub fn actor(mut self, actor: IdentityId) -> Self {
        self.actor = Some(actor);
        self
    }
}

#[cfg_attr(feature = "mock", mockall::automock)]
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: &WorkflowEvent);
}

impl<T: NotificationSink + ?Sized> NotificationSink for std::sync::Arc<T> {
    fn notify(&self, event: &WorkflowEvent) {
        (**self).notify(event)
    }
}

/// Logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, event: &WorkflowEvent) {
        let from = event.from_step.as_ref().map(StepId::as_str).unwrap_or("-");
        let to = event.to_step.as_ref().map(StepId::as_str).unwrap_or("-");
        if event.kind == WorkflowEventKind::Parked {
            warn!(
                item_id = event.item_id,
                collection = %event.collection,
                step = to,
                "Work item parked at a step with an empty role group"
            );
        } else {
            info!(
                item_id = event.item_id,
                collection = %event.collection,
                actor = ?event.actor,
                "Work item {}: {} -> {}",
                event.kind,
                from,
                to
            );
        }
    }
}

/// Fans events out to any number of subscribers.
pub struct BroadcastNotificationSink {
    event_tx: broadcast::Sender<WorkflowEvent>,
}

impl BroadcastNotificationSink {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for BroadcastNotificationSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationSink for BroadcastNotificationSink {
    fn notify(&self, event: &WorkflowEvent) {
        // Err only means nobody is listening
        let _ = self.event_tx.send(event.clone());
    }
}

/// Delivers each event to several sinks in order.
pub struct FanoutNotificationSink {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl FanoutNotificationSink {
    pub fn new(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

impl NotificationSink for FanoutNotificationSink {
    fn notify(&self, event: &WorkflowEvent) {
        for sink in &self.sinks {
            sink.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sample_event() -> WorkflowEvent {
        WorkflowEvent::new(1, CollectionId::from("c1"), WorkflowEventKind::Advanced)
            .from_step(Some(&StepId::from("reviewstep")))
            .to_step(Some(&StepId::from("editstep")))
            .action(&ActionId::from("approve"))
            .actor(2)
    }

    #[test]
    fn kind_string_conversion() {
        for kind in [
            WorkflowEventKind::Submitted,
            WorkflowEventKind::Claimed,
            WorkflowEventKind::Released,
            WorkflowEventKind::Advanced,
            WorkflowEventKind::Returned,
            WorkflowEventKind::Archived,
            WorkflowEventKind::Withdrawn,
            WorkflowEventKind::Parked,
        ] {
            assert_eq!(WorkflowEventKind::from_str(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn serializes_to_json() {
        let json = serde_json::to_value(sample_event()).unwrap();
        assert_eq!(json["kind"], "advanced");
        assert_eq!(json["from_step"], "reviewstep");
        assert_eq!(json["to_step"], "editstep");
        assert_eq!(json["actor"], 2);
    }

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastNotificationSink::new(8);
        let mut rx = sink.subscribe();

        sink.notify(&sample_event());

        let received = rx.recv().await.unwrap();
        assert_eq!(received, sample_event());
    }

    #[test]
    fn broadcast_sink_without_subscribers_is_silent() {
        let sink = BroadcastNotificationSink::default();
        sink.notify(&sample_event());
    }

    #[tokio::test]
    async fn fanout_reaches_every_sink() {
        let first = Arc::new(BroadcastNotificationSink::new(4));
        let second = Arc::new(BroadcastNotificationSink::new(4));
        let mut rx1 = first.subscribe();
        let mut rx2 = second.subscribe();

        let fanout = FanoutNotificationSink::new(vec![
            Box::new(TracingNotificationSink),
            Box::new(first.clone()),
            Box::new(second.clone()),
        ]);
        fanout.notify(&sample_event());

        assert_eq!(rx1.recv().await.unwrap().kind, WorkflowEventKind::Advanced);
        assert_eq!(rx2.recv().await.unwrap().kind, WorkflowEventKind::Advanced);
    }
}
