//! Typed event bus for change notification.
//!
//! Uses a tokio broadcast channel so the sync coordinator, the repository and
//! any front end stay decoupled. Subscribers that need to react to a store
//! replacement (reload their views) listen for [`AppEvent::StoreReplaced`].

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Application-level events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// The store was opened (or re-opened) at `path`.
    StoreOpened {
        path: String,
    },
    /// The store could not be opened or re-opened; it is unavailable.
    StoreFault {
        message: String,
    },
    /// The whole store was replaced by a newer remote snapshot.
    /// Anything read before this event is stale.
    StoreReplaced {
        remote_last_modified: i64,
    },
    /// Human-readable sync status changed.
    SyncStatusChanged {
        status: String,
        in_progress: bool,
    },
    /// A snapshot was uploaded.
    SnapshotPushed {
        blob_id: String,
        last_modified: i64,
    },
    /// A patient was created or updated.
    PatientSaved {
        id: i64,
    },
    /// A patient was deleted.
    PatientDeleted {
        id: i64,
    },
    /// Encryption at rest was switched on or off.
    EncryptionToggled {
        enabled: bool,
    },
}

/// Application-wide event bus backed by a tokio broadcast channel.
///
/// Every subscriber gets every event. Slow subscribers that fall behind
/// receive a `Lagged` error and miss events.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<AppEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: AppEvent) {
        let label = event_label(&event);
        match self.sender.send(event) {
            Ok(count) => debug!("event_bus: emitted {label} to {count} subscriber(s)"),
            Err(_) => debug!("event_bus: no subscribers for {label}"),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(pv_core::constants::EVENT_BUS_CAPACITY)
    }
}

fn event_label(event: &AppEvent) -> &'static str {
    match event {
        AppEvent::StoreOpened { .. } => "StoreOpened",
        AppEvent::StoreFault { .. } => "StoreFault",
        AppEvent::StoreReplaced { .. } => "StoreReplaced",
        AppEvent::SyncStatusChanged { .. } => "SyncStatusChanged",
        AppEvent::SnapshotPushed { .. } => "SnapshotPushed",
        AppEvent::PatientSaved { .. } => "PatientSaved",
        AppEvent::PatientDeleted { .. } => "PatientDeleted",
        AppEvent::EncryptionToggled { .. } => "EncryptionToggled",
    }
}
