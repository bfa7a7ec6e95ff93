//! # parvati-core
//!
//! Call-screen engine: media stream lifecycle plus live facial-expression
//! detection.
//!
//! ## Architecture
//!
//! ```text
//! UI intent → CallSession ──flags──► MediaStreamController ──► MediaHandle
//!                  │                                               │
//!                  │                                     VideoSource (read-only)
//!                  │                                               │
//!                  └──start/cancel──► DetectionLoop ◄──ticker──────┘
//!                                          │
//!                                 ExpressionModel::detect
//!                                          │
//!                                  EmotionStateStore
//!                                          │
//!                          broadcast::Sender<EmotionChangedEvent>
//! ```
//!
//! At most one media handle is live per session, and at most one
//! classification pass is in flight per loop.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod detect;
pub mod emotion;
pub mod error;
pub mod ipc;
pub mod media;
pub mod session;
pub mod widget;

// Convenience re-exports for downstream crates
pub use detect::{DetectionLoop, ExpressionModel, SharedModel};
pub use emotion::{Emotion, EmotionLabel, EmotionStateStore, ExpressionSample};
pub use error::{AcquireError, SessionError};
pub use ipc::events::{
    CallState, CallStateEvent, DetectionStatus, DetectionStatusEvent, EmotionChangedEvent,
    SessionEvent,
};
pub use media::{Device, MediaSource, MediaStreamController, TrackShape};
pub use session::{CallSession, SessionConfig};

#[cfg(feature = "audio-cpal")]
pub use media::host::HostMediaSource;
