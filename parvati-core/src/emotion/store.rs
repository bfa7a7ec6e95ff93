//! `EmotionStateStore` — latest accepted emotion plus change notifications.
//!
//! Only label changes are broadcast; a repeat of the current label refreshes
//! the stored confidence/timestamp silently, so downstream auto-responses
//! fire once per emotion.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::{ExpressionSample, CONFIDENCE_THRESHOLD};
use crate::ipc::events::EmotionChangedEvent;

const BROADCAST_CAP: usize = 64;

/// Result of [`EmotionStateStore::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Confidence at or below `CONFIDENCE_THRESHOLD`; nothing stored.
    Rejected,
    /// Same label as before; sample replaced without notification.
    Refreshed,
    /// New label stored and broadcast.
    Changed,
}

pub struct EmotionStateStore {
    current: Mutex<Option<ExpressionSample>>,
    tx: broadcast::Sender<EmotionChangedEvent>,
    seq: AtomicU64,
}

impl EmotionStateStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            current: Mutex::new(None),
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, sample: ExpressionSample) -> PublishOutcome {
        if !sample.confidence.is_finite() || sample.confidence <= CONFIDENCE_THRESHOLD {
            return PublishOutcome::Rejected;
        }

        let event = {
            let mut current = self.current.lock();
            let previous = current.as_ref().map(|s| s.label.clone());
            if previous.as_ref() == Some(&sample.label) {
                *current = Some(sample);
                return PublishOutcome::Refreshed;
            }
            *current = Some(sample.clone());
            EmotionChangedEvent {
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                previous,
                sample,
            }
        };

        debug!(
            label = %event.sample.label,
            confidence = event.sample.confidence,
            "emotion changed"
        );
        let _ = self.tx.send(event);
        PublishOutcome::Changed
    }

    /// Latest accepted sample.
    pub fn current(&self) -> Option<ExpressionSample> {
        self.current.lock().clone()
    }

    /// Forget the current sample (e.g. when the call screen goes away).
    pub fn clear(&self) {
        *self.current.lock() = None;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EmotionChangedEvent> {
        self.tx.subscribe()
    }
}

impl Default for EmotionStateStore {
    fn default() -> Self {
        Self::new()
    }
}
