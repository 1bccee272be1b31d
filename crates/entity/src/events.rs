//! Change notifications.
//!
//! Every mutation publishes one [`ChangeEvent`] through the service's
//! [`ChangeNotifier`]. Subscribers (cache invalidation, domain events) live
//! outside this crate; events are not retained after publishing.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::field::Operation;

/// Kind of a published mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Replace,
    Remove,
    /// Every entity of the collection was removed.
    Clear,
}

impl From<Operation> for ChangeOperation {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::Create => ChangeOperation::Create,
            Operation::Update => ChangeOperation::Update,
            Operation::Replace => ChangeOperation::Replace,
            Operation::Remove => ChangeOperation::Remove,
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOperation::Clear => write!(f, "clear"),
            ChangeOperation::Create => write!(f, "create"),
            ChangeOperation::Update => write!(f, "update"),
            ChangeOperation::Replace => write!(f, "replace"),
            ChangeOperation::Remove => write!(f, "remove"),
        }
    }
}

/// Flags describing how a mutation was performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOptions {
    /// The mutation touched several entities at once.
    #[serde(default)]
    pub batch: bool,
    /// A remove was performed as a tombstone update.
    #[serde(default)]
    pub soft_delete: bool,
    /// Changes were passed to the backend as raw update operators.
    #[serde(default)]
    pub raw: bool,
}

impl ChangeOptions {
    /// Options of a batch mutation.
    pub fn batch() -> Self {
        Self {
            batch: true,
            ..Self::default()
        }
    }
}

/// A published mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Event type, `entity.changed` unless configured otherwise.
    pub event_type: String,
    /// Name of the service that performed the mutation.
    pub entity: String,
    pub operation: ChangeOperation,
    /// The entity after the mutation. Batch writes carry the list of
    /// entities; raw batch writes and `clear` carry a count.
    pub new_data: Value,
    /// The entity before the mutation, for update and replace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_data: Option<Value>,
    #[serde(default)]
    pub options: ChangeOptions,
    /// Tenant of the caller, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Creates an event stamped with the current time.
    pub fn new(
        event_type: impl Into<String>,
        entity: impl Into<String>,
        operation: impl Into<ChangeOperation>,
        new_data: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            entity: entity.into(),
            operation: operation.into(),
            new_data,
            old_data: None,
            options: ChangeOptions::default(),
            tenant_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Sets the previous state.
    pub fn with_old_data(mut self, old_data: Option<Value>) -> Self {
        self.old_data = old_data;
        self
    }

    /// Sets the mutation flags.
    pub fn with_options(mut self, options: ChangeOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the tenant.
    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }
}

/// Publishes change events.
#[async_trait]
pub trait ChangeNotifier: Send + Sync + fmt::Debug {
    /// Publishes an event. Delivery failures are the transport's concern and
    /// never fail the mutation.
    async fn notify(&self, event: ChangeEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl ChangeNotifier for NoopNotifier {
    async fn notify(&self, _event: ChangeEvent) {}
}

/// In-process fan-out over a tokio broadcast channel.
///
/// # Examples
///
/// ```
/// use helios_entity::events::{BroadcastNotifier, ChangeEvent, ChangeNotifier};
/// use helios_entity::field::Operation;
/// use serde_json::json;
///
/// tokio_test::block_on(async {
///     let notifier = BroadcastNotifier::new(16);
///     let mut rx = notifier.subscribe();
///     notifier
///         .notify(ChangeEvent::new("entity.changed", "posts", Operation::Create, json!({"id": 1})))
///         .await;
///     assert_eq!(rx.recv().await.unwrap().new_data, json!({"id": 1}));
/// });
/// ```
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<ChangeEvent>,
}

impl BroadcastNotifier {
    /// Creates a channel buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl ChangeNotifier for BroadcastNotifier {
    async fn notify(&self, event: ChangeEvent) {
        let operation = event.operation;
        if self.sender.send(event).is_err() {
            debug!(operation = %operation, "No subscribers for change event");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_broadcast_fans_out() {
        let notifier = BroadcastNotifier::new(4);
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();
        assert_eq!(notifier.receiver_count(), 2);

        let event = ChangeEvent::new("entity.changed", "users", Operation::Remove, json!({"id": 1}))
            .with_old_data(Some(json!({"id": 1, "name": "x"})))
            .with_options(ChangeOptions {
                soft_delete: true,
                ..ChangeOptions::default()
            });
        notifier.notify(event.clone()).await;

        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_notify_without_subscribers_is_silent() {
        BroadcastNotifier::default()
            .notify(ChangeEvent::new("entity.changed", "users", Operation::Create, json!({})))
            .await;
        NoopNotifier
            .notify(ChangeEvent::new("entity.changed", "users", Operation::Create, json!({})))
            .await;
    }

    #[test]
    fn test_operation_conversion() {
        assert_eq!(ChangeOperation::from(Operation::Replace), ChangeOperation::Replace);
        assert_eq!(ChangeOperation::Clear.to_string(), "clear");
    }

    #[test]
    fn test_event_serialization() {
        let event = ChangeEvent::new("entity.changed", "users", Operation::Update, json!({"id": 1}))
            .with_options(ChangeOptions::batch());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["operation"], json!("update"));
        assert_eq!(value["options"]["batch"], json!(true));
        assert!(value.get("old_data").is_none());
    }
}
