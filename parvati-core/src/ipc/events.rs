//! Event types delivered to the UI shell.
//!
//! ## Channels
//!
//! | Event | Channel |
//! |-------|---------|
//! | `CallStateEvent` | `"state"` |
//! | `EmotionChangedEvent` | `"emotion"` |
//! | `DetectionStatusEvent` | `"detection"` |
//!
//! `SessionEvent` wraps all three for hosts that forward a single stream.

use serde::{Deserialize, Serialize};

use crate::emotion::{EmotionLabel, ExpressionSample};
use crate::media::{Device, TrackShape};

// ---------------------------------------------------------------------------
// Call state
// ---------------------------------------------------------------------------

/// The user-facing call flags.
///
/// `mic_requested` / `video_requested` only take effect while `call_active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallState {
    pub call_active: bool,
    pub mic_requested: bool,
    pub video_requested: bool,
}

impl CallState {
    /// State right after joining a call: everything on.
    pub fn joined() -> Self {
        Self {
            call_active: true,
            mic_requested: true,
            video_requested: true,
        }
    }

    pub fn requested(&self, device: Device) -> bool {
        match device {
            Device::Audio => self.mic_requested,
            Device::Video => self.video_requested,
        }
    }

    pub fn set_requested(&mut self, device: Device, on: bool) {
        match device {
            Device::Audio => self.mic_requested = on,
            Device::Video => self.video_requested = on,
        }
    }

    /// Tracks a live handle must carry for this state.
    pub fn effective_shape(&self) -> TrackShape {
        if !self.call_active {
            return TrackShape::NONE;
        }
        TrackShape::new(self.mic_requested, self.video_requested)
    }
}

/// Emitted on channel `"state"` after every intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStateEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub state: CallState,
    /// Shape of the live media handle once the intent settled.
    pub media: TrackShape,
    /// Optional human-readable detail (e.g. rollback reason).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Emotion events
// ---------------------------------------------------------------------------

/// Emitted on channel `"emotion"` only when the accepted label changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmotionChangedEvent {
    pub seq: u64,
    pub previous: Option<EmotionLabel>,
    pub sample: ExpressionSample,
}

// ---------------------------------------------------------------------------
// Detection status
// ---------------------------------------------------------------------------

/// State of an expression detection loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStatus {
    /// No model loaded.
    Idle,
    /// Model load in flight.
    ModelLoading,
    /// Model loaded, no cycle running.
    Ready,
    /// Per-frame cycle active.
    Running,
}

/// Emitted on channel `"detection"` when the loop changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStatusEvent {
    pub status: DetectionStatus,
    pub detail: Option<String>,
}

/// Single stream of everything the UI shell subscribes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", content = "payload", rename_all = "lowercase")]
pub enum SessionEvent {
    State(CallStateEvent),
    Emotion(EmotionChangedEvent),
    Detection(DetectionStatusEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emotion::Emotion;

    #[test]
    fn call_state_serializes_with_camel_case() {
        let json = serde_json::to_value(CallState::joined()).expect("serialize call state");
        assert_eq!(json["callActive"], true);
        assert_eq!(json["micRequested"], true);
        assert_eq!(json["videoRequested"], true);
    }

    #[test]
    fn effective_shape_is_empty_outside_a_call() {
        let mut state = CallState::default();
        state.set_requested(Device::Audio, true);
        assert_eq!(state.effective_shape(), TrackShape::NONE);

        state.call_active = true;
        assert_eq!(state.effective_shape(), TrackShape::new(true, false));
    }

    #[test]
    fn detection_status_uses_lowercase_names() {
        let event = DetectionStatusEvent {
            status: DetectionStatus::ModelLoading,
            detail: None,
        };
        let json = serde_json::to_value(&event).expect("serialize detection event");
        assert_eq!(json["status"], "modelloading");
    }

    #[test]
    fn session_event_is_tagged_by_channel() {
        let sample = ExpressionSample::new(EmotionLabel::Known(Emotion::Happy), 0.8);
        let event = SessionEvent::Emotion(EmotionChangedEvent {
            seq: 2,
            previous: Some(EmotionLabel::Other("contempt".into())),
            sample,
        });

        let json = serde_json::to_value(&event).expect("serialize session event");
        assert_eq!(json["channel"], "emotion");
        assert_eq!(json["payload"]["seq"], 2);
        assert_eq!(json["payload"]["previous"], "contempt");
        assert_eq!(json["payload"]["sample"]["label"], "happy");
    }

    #[test]
    fn state_event_round_trips() {
        let event = CallStateEvent {
            seq: 4,
            state: CallState::joined(),
            media: TrackShape::BOTH,
            detail: Some("video unavailable".into()),
        };
        let json = serde_json::to_string(&event).expect("serialize state event");
        let back: CallStateEvent = serde_json::from_str(&json).expect("deserialize state event");
        assert_eq!(back.state, CallState::joined());
        assert_eq!(back.media, TrackShape::BOTH);
        assert_eq!(back.detail.as_deref(), Some("video unavailable"));
    }
}
