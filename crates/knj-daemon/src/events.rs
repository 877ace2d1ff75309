// SPDX-License-Identifier: MIT OR Apache-2.0
//! Live pipeline event fan-out for the events WebSocket.

use knj_core::BookingStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// One pipeline event pushed to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Affected booking.
    pub booking_id: Uuid,
    /// Client the booking belongs to.
    pub client_id: String,
    /// Status after the event.
    pub status: BookingStatus,
}

/// Broadcasts [`PipelineEvent`]s to every connected events socket.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// A bus with the given buffer per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Lagging or absent subscribers are not an error.
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}
