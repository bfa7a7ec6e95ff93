//! `CallSession` — the call screen's intent controller.
//!
//! Owns the call flags, the media controller and the detection loop, and
//! keeps them consistent:
//!
//! ```text
//! intent ──► flags ──► MediaStreamController::reconcile ──► live handle
//!                              │ err                           │
//!                          roll back                    sync detection
//!                              └──────────► CallStateEvent ◄───┘
//! ```
//!
//! Intents are serialised through one async mutex, so a flag change and its
//! reconciliation land together before the next intent observes them. The
//! expression model loads outside that mutex: a pending load never holds up
//! `end_call`, and detection only starts if its stream is still the live one.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn, Instrument};

use crate::detect::{DetectionLoop, DiagnosticsSnapshot, SharedModel};
use crate::emotion::{EmotionStateStore, ExpressionSample};
use crate::error::{AcquireError, Result, SessionError};
use crate::ipc::events::{
    CallState, CallStateEvent, DetectionStatus, DetectionStatusEvent, EmotionChangedEvent,
};
use crate::media::{
    Device, MediaSource, MediaStats, MediaStreamController, TrackShape, VideoSource,
};

const BROADCAST_CAP: usize = 64;

/// Tunables for one call session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Period of the detection ticker.
    pub frame_interval: Duration,
    /// Consecutive classification failures before the loop stops itself.
    /// `0` disables the limit.
    pub max_consecutive_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(16),
            max_consecutive_failures: 60,
        }
    }
}

/// What set off a reconciliation; decides how a failure is rolled back.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    StartCall,
    Toggle { device: Device, prior: bool },
}

struct SessionInner {
    state: CallState,
    media: MediaStreamController,
}

#[derive(Debug, Clone, Copy, Default)]
struct Snapshot {
    state: CallState,
    media: TrackShape,
}

pub struct CallSession {
    inner: tokio::sync::Mutex<SessionInner>,
    snapshot: Mutex<Snapshot>,
    state_tx: broadcast::Sender<CallStateEvent>,
    seq: AtomicU64,
    source: Arc<dyn MediaSource>,
    detection: Arc<DetectionLoop>,
    /// Handle id detection should watch; `None` while no video is live.
    detection_target: Arc<Mutex<Option<u64>>>,
    emotions: Arc<EmotionStateStore>,
}

impl CallSession {
    pub fn new(
        config: SessionConfig,
        source: Arc<dyn MediaSource>,
        model: Arc<SharedModel>,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(BROADCAST_CAP);
        let emotions = Arc::new(EmotionStateStore::new());
        let detection = Arc::new(DetectionLoop::new(config, model, Arc::clone(&emotions)));
        Self {
            inner: tokio::sync::Mutex::new(SessionInner {
                state: CallState::default(),
                media: MediaStreamController::new(Arc::clone(&source)),
            }),
            snapshot: Mutex::new(Snapshot::default()),
            state_tx,
            seq: AtomicU64::new(0),
            source,
            detection,
            detection_target: Arc::new(Mutex::new(None)),
            emotions,
        }
    }

    // ── intents ────────────────────────────────────────────────────────────

    /// Join the call with microphone and camera on. No-op while in a call.
    ///
    /// # Errors
    /// `MediaAcquisitionFailed` if the stream cannot be acquired; both flags
    /// are off afterwards.
    pub async fn start_call(&self) -> Result<CallState> {
        let mut inner = self.inner.lock().await;
        if inner.state.call_active {
            debug!("start_call ignored: already in a call");
            return Ok(inner.state);
        }
        info!("starting call");
        inner.state = CallState::joined();
        self.apply(&mut inner, Trigger::StartCall).await
    }

    /// Leave the call: flags off, detection cancelled, every track stopped.
    pub async fn end_call(&self) -> CallState {
        let mut inner = self.inner.lock().await;
        let ended = CallState::default();
        let changed = inner.state != ended;
        inner.state = ended;
        self.stop_detection();
        let released = inner.media.release();
        if changed || released {
            info!("call ended");
            self.publish_state(&inner, None);
        }
        inner.state
    }

    /// Flip the microphone request.
    ///
    /// # Errors
    /// `PermissionDenied{audio}` if turning on is refused (state unchanged);
    /// `MediaAcquisitionFailed` if the new stream cannot be acquired.
    pub async fn toggle_mic(&self) -> Result<CallState> {
        self.toggle(Device::Audio).await
    }

    /// Flip the camera request. Errors mirror [`CallSession::toggle_mic`].
    pub async fn toggle_video(&self) -> Result<CallState> {
        self.toggle(Device::Video).await
    }

    /// Screen teardown: end the call and forget the last emotion.
    pub async fn shutdown(&self) {
        self.end_call().await;
        self.emotions.clear();
        info!("session shut down");
    }

    async fn toggle(&self, device: Device) -> Result<CallState> {
        let mut inner = self.inner.lock().await;
        let prior = inner.state.requested(device);

        if !prior {
            if let Err(e) = self.source.probe(device).await {
                warn!(%device, "capability probe failed: {e}");
                return Err(match e {
                    AcquireError::PermissionDenied { device } => {
                        SessionError::PermissionDenied { device }
                    }
                    other => SessionError::MediaAcquisitionFailed { reason: other },
                });
            }
        }

        inner.state.set_requested(device, !prior);
        debug!(%device, on = !prior, "toggled");
        self.apply(&mut inner, Trigger::Toggle { device, prior }).await
    }

    async fn apply(&self, inner: &mut SessionInner, trigger: Trigger) -> Result<CallState> {
        let state = inner.state;
        match inner.media.reconcile(&state).await {
            Ok(outcome) => {
                debug!(?outcome, "media reconciled");
                self.sync_detection(inner);
                self.publish_state(inner, None);
                Ok(inner.state)
            }
            Err(reason) => {
                self.roll_back(inner, trigger, &reason).await;
                self.sync_detection(inner);
                self.publish_state(inner, Some(reason.to_string()));
                Err(SessionError::MediaAcquisitionFailed { reason })
            }
        }
    }

    async fn roll_back(&self, inner: &mut SessionInner, trigger: Trigger, reason: &AcquireError) {
        warn!(?trigger, "acquisition failed, rolling back: {reason}");

        if let (false, Trigger::Toggle { device, prior }) = (reason.is_not_allowed(), trigger) {
            inner.state.set_requested(device, prior);
            let state = inner.state;
            match inner.media.reconcile(&state).await {
                Ok(_) => return,
                Err(e) => warn!("restoring the previous stream failed: {e}"),
            }
        }

        inner.state.mic_requested = false;
        inner.state.video_requested = false;
        // Nothing is requested, so this only releases.
        let state = inner.state;
        if let Err(e) = inner.media.reconcile(&state).await {
            warn!("release after rollback failed: {e}");
        }
    }

    /// Run detection on the live video track, or stop it if there is none.
    ///
    /// A model that is not loaded yet is loaded on a separate task, so the
    /// intent settles without waiting for it.
    fn sync_detection(&self, inner: &SessionInner) {
        let (Some(video), Some(handle)) = (inner.media.video_source(), inner.media.handle_id())
        else {
            self.stop_detection();
            return;
        };

        let mut target = self.detection_target.lock();
        *target = Some(handle);
        if self.detection.running_source() == Some(handle) {
            return;
        }
        self.detection.cancel();

        if self.detection.is_model_loaded() {
            start_detection(&self.detection, video, handle);
            return;
        }
        drop(target);

        let detection = Arc::clone(&self.detection);
        let target = Arc::clone(&self.detection_target);
        tokio::spawn(
            async move {
                if let Err(e) = detection.load_model().await {
                    warn!("expression detection unavailable: {e}");
                    return;
                }
                let target = target.lock();
                if *target != Some(handle) {
                    debug!(handle, "stream changed while the model loaded");
                    return;
                }
                if detection.running_source() != Some(handle) {
                    start_detection(&detection, video, handle);
                }
            }
            .in_current_span(),
        );
    }

    fn stop_detection(&self) {
        let mut target = self.detection_target.lock();
        *target = None;
        self.detection.cancel();
    }

    fn publish_state(&self, inner: &SessionInner, detail: Option<String>) {
        let media = inner.media.live_shape().unwrap_or(TrackShape::NONE);
        *self.snapshot.lock() = Snapshot {
            state: inner.state,
            media,
        };
        let event = CallStateEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            state: inner.state,
            media,
            detail,
        };
        let _ = self.state_tx.send(event);
    }

    // ── queries ────────────────────────────────────────────────────────────

    /// `true` while the session wants detection on a live video track, even
    /// if the model is still loading.
    pub fn detection_wanted(&self) -> bool {
        self.detection_target.lock().is_some()
    }

    pub fn state(&self) -> CallState {
        self.snapshot.lock().state
    }

    /// Shape of the live handle as of the last settled intent.
    pub fn live_shape(&self) -> TrackShape {
        self.snapshot.lock().media
    }

    pub async fn media_stats(&self) -> MediaStats {
        self.inner.lock().await.media.stats()
    }

    pub fn current_emotion(&self) -> Option<ExpressionSample> {
        self.emotions.current()
    }

    pub fn detection_status(&self) -> DetectionStatus {
        self.detection.status()
    }

    pub fn detection_diagnostics(&self) -> DiagnosticsSnapshot {
        self.detection.diagnostics_snapshot()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<CallStateEvent> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_emotions(&self) -> broadcast::Receiver<EmotionChangedEvent> {
        self.emotions.subscribe()
    }

    pub fn subscribe_detection(&self) -> broadcast::Receiver<DetectionStatusEvent> {
        self.detection.subscribe_status()
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        // A load still in flight must not start detection for a dead session.
        self.stop_detection();
    }
}

fn start_detection(detection: &DetectionLoop, video: Arc<dyn VideoSource>, handle: u64) {
    if let Err(e) = detection.start(video, handle) {
        warn!("expression detection did not start: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::stub::StubExpressionModel;
    use crate::media::stub::StubMediaSource;

    fn session() -> (CallSession, Arc<StubMediaSource>) {
        let media = Arc::new(StubMediaSource::new());
        let model = Arc::new(SharedModel::new(Arc::new(StubExpressionModel::new())));
        let config = SessionConfig {
            frame_interval: Duration::from_millis(5),
            ..SessionConfig::default()
        };
        (CallSession::new(config, media.clone(), model), media)
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = SessionConfig::default();
        assert_eq!(config.frame_interval, Duration::from_millis(16));
        assert_eq!(config.max_consecutive_failures, 60);
    }

    #[tokio::test]
    async fn start_call_is_idempotent() {
        let (session, media) = session();
        session.start_call().await.expect("start");
        session.start_call().await.expect("start again");
        assert_eq!(media.acquire_count(), 1);
        assert_eq!(session.live_shape(), TrackShape::BOTH);
        session.end_call().await;
    }

    #[tokio::test]
    async fn end_call_without_a_call_publishes_nothing() {
        let (session, _) = session();
        let mut rx = session.subscribe_state();
        assert_eq!(session.end_call().await, CallState::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn turning_a_device_off_never_probes() {
        let (session, media) = session();
        session.start_call().await.expect("start");
        session.toggle_mic().await.expect("mic off");
        assert_eq!(media.probe_count(), 0);
        session.toggle_mic().await.expect("mic on");
        assert_eq!(media.probe_count(), 1);
        session.end_call().await;
    }

    #[tokio::test]
    async fn toggles_outside_a_call_probe_but_never_acquire() {
        let (session, media) = session();
        let state = session.toggle_video().await.expect("toggle");
        assert!(state.video_requested);
        assert!(!state.call_active);
        assert_eq!(media.probe_count(), 1);
        assert_eq!(media.acquire_count(), 0);
        assert_eq!(session.live_shape(), TrackShape::NONE);
    }

    #[tokio::test]
    async fn state_events_carry_increasing_sequence_numbers() {
        let (session, _) = session();
        let mut rx = session.subscribe_state();
        session.start_call().await.expect("start");
        session.toggle_video().await.expect("video off");

        let a = rx.recv().await.expect("start event");
        let b = rx.recv().await.expect("toggle event");
        assert_eq!(a.seq + 1, b.seq);
        assert_eq!(a.media, TrackShape::BOTH);
        assert_eq!(b.media, TrackShape::only(Device::Audio));
        assert!(b.detail.is_none());
        session.end_call().await;
    }
}
