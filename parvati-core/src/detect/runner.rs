//! `DetectionLoop` — cancelable per-frame expression analysis.
//!
//! ## States
//!
//! ```text
//! Idle ──load_model()──► ModelLoading ──ok──► Ready ──start()──► Running
//!  ▲                          │                 ▲                  │
//!  └──────────err─────────────┘                 └─cancel()/ended/──┘
//!                                                 failure budget
//! ```
//!
//! ## Scheduling
//!
//! A ticker task fires every `frame_interval`. Each tick that finds the
//! source playing claims the loop-wide in-flight flag and spawns one pass;
//! ticks that find the flag taken are dropped, never queued. Cancelling
//! stops the ticker and marks the run cancelled: a pass already in flight
//! finishes, but its result is thrown away.

use std::ops::ControlFlow;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{ExpressionModel, SharedModel};
use crate::emotion::{
    select_dominant, EmotionStateStore, ExpressionSample, PublishOutcome, CONFIDENCE_THRESHOLD,
};
use crate::error::{Result, SessionError};
use crate::ipc::events::{DetectionStatus, DetectionStatusEvent};
use crate::media::{Frame, Readiness, VideoSource};
use crate::session::SessionConfig;

const BROADCAST_CAP: usize = 32;

#[derive(Default)]
pub struct LoopDiagnostics {
    pub ticks: AtomicUsize,
    pub ticks_not_ready: AtomicUsize,
    pub ticks_busy: AtomicUsize,
    pub passes: AtomicUsize,
    pub faces: AtomicUsize,
    pub samples_emitted: AtomicUsize,
    pub below_threshold: AtomicUsize,
    pub classification_failures: AtomicUsize,
    pub results_discarded: AtomicUsize,
    active_passes: AtomicUsize,
    pub max_concurrent_passes: AtomicUsize,
}

impl LoopDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            ticks_not_ready: self.ticks_not_ready.load(Ordering::Relaxed),
            ticks_busy: self.ticks_busy.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            faces: self.faces.load(Ordering::Relaxed),
            samples_emitted: self.samples_emitted.load(Ordering::Relaxed),
            below_threshold: self.below_threshold.load(Ordering::Relaxed),
            classification_failures: self.classification_failures.load(Ordering::Relaxed),
            results_discarded: self.results_discarded.load(Ordering::Relaxed),
            max_concurrent_passes: self.max_concurrent_passes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub ticks: usize,
    pub ticks_not_ready: usize,
    pub ticks_busy: usize,
    pub passes: usize,
    pub faces: usize,
    pub samples_emitted: usize,
    pub below_threshold: usize,
    pub classification_failures: usize,
    pub results_discarded: usize,
    pub max_concurrent_passes: usize,
}

/// State shared between the loop handle, its ticker and its passes.
///
/// Lock order: `active` before `publish_gate` and `status`.
struct Shared {
    status: Mutex<DetectionStatus>,
    status_tx: broadcast::Sender<DetectionStatusEvent>,
    active: Mutex<Option<ActiveRun>>,
    /// Loop-wide single in-flight guard; survives restarts so a pass from a
    /// cancelled run still blocks the next run's first pass.
    in_flight: Arc<AtomicBool>,
    /// Held by a pass from its last cancellation check through publishing;
    /// stopping a run waits on it so nothing lands after `cancel` returns.
    publish_gate: Mutex<()>,
    diagnostics: LoopDiagnostics,
}

impl Shared {
    fn set_status(&self, status: DetectionStatus, detail: Option<String>) {
        *self.status.lock() = status;
        let _ = self.status_tx.send(DetectionStatusEvent { status, detail });
    }

    /// Transition only when the current status satisfies `from`.
    fn set_status_if(
        &self,
        from: impl Fn(DetectionStatus) -> bool,
        status: DetectionStatus,
        detail: Option<String>,
    ) -> bool {
        let mut current = self.status.lock();
        if !from(*current) || *current == status {
            return false;
        }
        *current = status;
        drop(current);
        let _ = self.status_tx.send(DetectionStatusEvent { status, detail });
        true
    }
}

struct ActiveRun {
    id: u64,
    source_tag: u64,
    cancelled: Arc<AtomicBool>,
    wake: Arc<Notify>,
    ticker: JoinHandle<()>,
}

impl ActiveRun {
    fn stop(self, shared: &Shared) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        self.ticker.abort();
        drop(shared.publish_gate.lock());
    }
}

#[derive(Clone)]
struct RunContext {
    run_id: u64,
    source: Arc<dyn VideoSource>,
    model: Arc<dyn ExpressionModel>,
    store: Arc<EmotionStateStore>,
    shared: Arc<Shared>,
    cancelled: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
    consecutive_failures: Arc<AtomicU32>,
    wake: Arc<Notify>,
    max_consecutive_failures: u32,
}

impl RunContext {
    /// Self-stop from inside the ticker: back to `Ready` with a reason.
    fn finish(&self, reason: String) {
        self.cancelled.store(true, Ordering::SeqCst);
        let mut active = self.shared.active.lock();
        if active.as_ref().map(|run| run.id) == Some(self.run_id) {
            // Dropping our own JoinHandle detaches; the ticker returns next.
            active.take();
            info!(run_id = self.run_id, reason = %reason, "detection stopped");
            self.shared.set_status(DetectionStatus::Ready, Some(reason));
        }
    }
}

/// Frees the in-flight flag when a pass ends, however it ends.
struct PassSlot {
    shared: Arc<Shared>,
}

impl PassSlot {
    fn enter(shared: &Arc<Shared>) -> Self {
        let now = shared.diagnostics.active_passes.fetch_add(1, Ordering::SeqCst) + 1;
        shared
            .diagnostics
            .max_concurrent_passes
            .fetch_max(now, Ordering::SeqCst);
        Self {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for PassSlot {
    fn drop(&mut self) {
        self.shared
            .diagnostics
            .active_passes
            .fetch_sub(1, Ordering::SeqCst);
        self.shared.in_flight.store(false, Ordering::Release);
    }
}

/// Per-frame expression detection bound to one `EmotionStateStore`.
///
/// Must be used from within a tokio runtime: `start` spawns tasks.
pub struct DetectionLoop {
    config: SessionConfig,
    model: Arc<SharedModel>,
    store: Arc<EmotionStateStore>,
    shared: Arc<Shared>,
    next_run: AtomicU64,
}

impl DetectionLoop {
    pub fn new(
        config: SessionConfig,
        model: Arc<SharedModel>,
        store: Arc<EmotionStateStore>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let initial = if model.is_loaded() {
            DetectionStatus::Ready
        } else {
            DetectionStatus::Idle
        };
        Self {
            config,
            model,
            store,
            shared: Arc::new(Shared {
                status: Mutex::new(initial),
                status_tx,
                active: Mutex::new(None),
                in_flight: Arc::new(AtomicBool::new(false)),
                publish_gate: Mutex::new(()),
                diagnostics: LoopDiagnostics::default(),
            }),
            next_run: AtomicU64::new(0),
        }
    }

    /// Load (or join the in-flight load of) the shared model.
    ///
    /// # Errors
    /// `SessionError::ModelLoadFailed`; the loop is back in `Idle` and will
    /// not retry on its own.
    pub async fn load_model(&self) -> Result<()> {
        let not_loaded =
            |s: DetectionStatus| matches!(s, DetectionStatus::Idle | DetectionStatus::ModelLoading);

        if !self.model.is_loaded() {
            self.shared.set_status_if(
                |s| s == DetectionStatus::Idle,
                DetectionStatus::ModelLoading,
                None,
            );
            if let Err(e) = self.model.load().await {
                self.shared.set_status_if(
                    |s| s == DetectionStatus::ModelLoading,
                    DetectionStatus::Idle,
                    Some(e.to_string()),
                );
                return Err(e);
            }
        }

        self.shared
            .set_status_if(not_loaded, DetectionStatus::Ready, None);
        Ok(())
    }

    /// Begin the per-frame cycle on `source`, replacing any running cycle.
    ///
    /// `source_tag` identifies the stream (e.g. its handle id) so callers can
    /// tell whether a running cycle already watches it.
    ///
    /// # Errors
    /// `SessionError::ModelNotLoaded` unless `load_model` has succeeded.
    pub fn start(&self, source: Arc<dyn VideoSource>, source_tag: u64) -> Result<()> {
        if !self.model.is_loaded() {
            return Err(SessionError::ModelNotLoaded);
        }

        let mut active = self.shared.active.lock();
        if let Some(previous) = active.take() {
            debug!(run_id = previous.id, "replacing running detection cycle");
            previous.stop(&self.shared);
        }

        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let ctx = RunContext {
            run_id,
            source,
            model: self.model.backend(),
            store: Arc::clone(&self.store),
            shared: Arc::clone(&self.shared),
            cancelled: Arc::clone(&cancelled),
            degraded: Arc::new(AtomicBool::new(false)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            wake: Arc::clone(&wake),
            max_consecutive_failures: self.config.max_consecutive_failures,
        };

        let span = info_span!("detection_run", run_id, source = source_tag);
        let ticker = tokio::spawn(tick_loop(ctx, self.config.frame_interval).instrument(span));

        *active = Some(ActiveRun {
            id: run_id,
            source_tag,
            cancelled,
            wake,
            ticker,
        });
        self.shared.set_status(DetectionStatus::Running, None);
        info!(run_id, source = source_tag, "detection started");
        Ok(())
    }

    /// Stop the cycle. Safe to call repeatedly and from any state.
    pub fn cancel(&self) {
        let mut active = self.shared.active.lock();
        if let Some(run) = active.take() {
            let run_id = run.id;
            run.stop(&self.shared);
            self.shared.set_status(DetectionStatus::Ready, None);
            info!(run_id, "detection cancelled");
        }
    }

    pub fn status(&self) -> DetectionStatus {
        *self.shared.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.shared.active.lock().is_some()
    }

    /// Tag of the source the running cycle watches.
    pub fn running_source(&self) -> Option<u64> {
        self.shared.active.lock().as_ref().map(|run| run.source_tag)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<DetectionStatusEvent> {
        self.shared.status_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    /// `true` once the shared model has loaded, whichever loop loaded it.
    pub fn is_model_loaded(&self) -> bool {
        self.model.is_loaded()
    }
}

impl Drop for DetectionLoop {
    fn drop(&mut self) {
        let previous = self.shared.active.lock().take();
        if let Some(run) = previous {
            run.stop(&self.shared);
        }
    }
}

async fn tick_loop(ctx: RunContext, frame_interval: Duration) {
    let mut ticks = tokio::time::interval(frame_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let woken = tokio::select! {
            biased;
            _ = ctx.wake.notified() => true,
            _ = ticks.tick() => false,
        };

        if ctx.cancelled.load(Ordering::SeqCst) {
            break;
        }
        if ctx.degraded.load(Ordering::SeqCst) {
            let streak = ctx.consecutive_failures.load(Ordering::SeqCst);
            warn!(streak, "classification failure budget exhausted");
            ctx.finish(format!(
                "stopped after {streak} consecutive classification failures"
            ));
            break;
        }
        if woken {
            continue;
        }

        if let ControlFlow::Break(reason) = on_tick(&ctx) {
            ctx.finish(reason);
            break;
        }
    }
}

fn on_tick(ctx: &RunContext) -> ControlFlow<String> {
    let diag = &ctx.shared.diagnostics;
    diag.ticks.fetch_add(1, Ordering::Relaxed);

    match ctx.source.readiness() {
        Readiness::Playing => {}
        Readiness::Ended => return ControlFlow::Break("video source ended".into()),
        Readiness::Paused | Readiness::Buffering => {
            diag.ticks_not_ready.fetch_add(1, Ordering::Relaxed);
            return ControlFlow::Continue(());
        }
    }

    if ctx
        .shared
        .in_flight
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        diag.ticks_busy.fetch_add(1, Ordering::Relaxed);
        return ControlFlow::Continue(());
    }

    let Some(frame) = ctx.source.frame() else {
        ctx.shared.in_flight.store(false, Ordering::Release);
        diag.ticks_not_ready.fetch_add(1, Ordering::Relaxed);
        return ControlFlow::Continue(());
    };

    tokio::spawn(run_pass(ctx.clone(), frame).in_current_span());
    ControlFlow::Continue(())
}

async fn run_pass(ctx: RunContext, frame: Frame) {
    let _slot = PassSlot::enter(&ctx.shared);
    let diag = &ctx.shared.diagnostics;

    if ctx.cancelled.load(Ordering::SeqCst) {
        return;
    }
    diag.passes.fetch_add(1, Ordering::Relaxed);

    let result = ctx.model.detect(&frame).await;

    let _gate = ctx.shared.publish_gate.lock();
    if ctx.cancelled.load(Ordering::SeqCst) {
        diag.results_discarded.fetch_add(1, Ordering::Relaxed);
        debug!("pass finished after cancellation, result discarded");
        return;
    }

    let detection = match result {
        Ok(detection) => {
            ctx.consecutive_failures.store(0, Ordering::SeqCst);
            detection
        }
        Err(e) => {
            diag.classification_failures
                .fetch_add(1, Ordering::Relaxed);
            let streak = ctx.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(streak, "classification failed: {e}");
            if ctx.max_consecutive_failures > 0
                && streak >= ctx.max_consecutive_failures
                && !ctx.degraded.swap(true, Ordering::SeqCst)
            {
                ctx.wake.notify_one();
            }
            return;
        }
    };

    let Some(face) = detection else {
        debug!("no face in frame");
        return;
    };
    diag.faces.fetch_add(1, Ordering::Relaxed);

    match select_dominant(&face.expressions) {
        Some((label, score)) if score > CONFIDENCE_THRESHOLD => {
            diag.samples_emitted.fetch_add(1, Ordering::Relaxed);
            let sample = ExpressionSample::new(label, score);
            if ctx.store.publish(sample) == PublishOutcome::Changed {
                debug!("new dominant emotion published");
            }
        }
        _ => {
            diag.below_threshold.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::stub::{StubDetection, StubExpressionModel};
    use crate::emotion::{Emotion, EmotionLabel};
    use crate::media::stub::StubVideoSource;
    use std::time::Instant;

    fn config(max_failures: u32) -> SessionConfig {
        SessionConfig {
            frame_interval: Duration::from_millis(2),
            max_consecutive_failures: max_failures,
        }
    }

    fn build(
        backend: Arc<StubExpressionModel>,
        cfg: SessionConfig,
    ) -> (DetectionLoop, Arc<EmotionStateStore>) {
        let store = Arc::new(EmotionStateStore::new());
        let model = Arc::new(SharedModel::new(backend));
        (DetectionLoop::new(cfg, model, Arc::clone(&store)), store)
    }

    async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn start_requires_a_loaded_model() {
        let backend = Arc::new(StubExpressionModel::new());
        let (detection, _) = build(backend, config(0));
        let video = Arc::new(StubVideoSource::new());

        assert_eq!(detection.status(), DetectionStatus::Idle);
        assert!(matches!(
            detection.start(video, 1),
            Err(SessionError::ModelNotLoaded)
        ));
    }

    #[tokio::test]
    async fn load_failure_returns_to_idle() {
        let backend = Arc::new(StubExpressionModel::new());
        backend.fail_next_loads(1);
        let (detection, _) = build(Arc::clone(&backend), config(0));
        let mut status_rx = detection.subscribe_status();

        assert!(matches!(
            detection.load_model().await,
            Err(SessionError::ModelLoadFailed(_))
        ));
        assert_eq!(detection.status(), DetectionStatus::Idle);
        assert_eq!(
            status_rx.try_recv().expect("loading event").status,
            DetectionStatus::ModelLoading
        );
        let failed = status_rx.try_recv().expect("idle event");
        assert_eq!(failed.status, DetectionStatus::Idle);
        assert!(failed.detail.is_some());

        detection.load_model().await.expect("explicit reload");
        assert_eq!(detection.status(), DetectionStatus::Ready);
    }

    #[tokio::test]
    async fn running_loop_publishes_confident_samples() {
        let backend = Arc::new(StubExpressionModel::new());
        backend.set_default(StubDetection::single("happy", 0.8));
        let (detection, store) = build(Arc::clone(&backend), config(0));
        let video = Arc::new(StubVideoSource::new());

        detection.load_model().await.expect("load");
        detection.start(video, 7).expect("start");
        assert_eq!(detection.status(), DetectionStatus::Running);
        assert_eq!(detection.running_source(), Some(7));

        assert!(
            wait_until(Duration::from_secs(1), || store.current().is_some()).await,
            "no sample published"
        );
        assert_eq!(
            store.current().map(|s| s.label),
            Some(EmotionLabel::Known(Emotion::Happy))
        );
        detection.cancel();
        assert_eq!(detection.status(), DetectionStatus::Ready);
    }

    #[tokio::test]
    async fn sub_threshold_detections_are_discarded() {
        let backend = Arc::new(StubExpressionModel::new());
        backend.set_default(StubDetection::single("sad", 0.4));
        let (detection, store) = build(Arc::clone(&backend), config(0));

        detection.load_model().await.expect("load");
        detection
            .start(Arc::new(StubVideoSource::new()), 1)
            .expect("start");

        assert!(
            wait_until(Duration::from_secs(1), || {
                detection.diagnostics_snapshot().below_threshold >= 3
            })
            .await
        );
        detection.cancel();
        assert!(store.current().is_none());
        assert_eq!(detection.diagnostics_snapshot().samples_emitted, 0);
    }

    #[tokio::test]
    async fn slow_passes_never_overlap_and_busy_ticks_are_dropped() {
        let backend =
            Arc::new(StubExpressionModel::new().with_detect_delay(Duration::from_millis(15)));
        let (detection, _) = build(Arc::clone(&backend), config(0));

        detection.load_model().await.expect("load");
        detection
            .start(Arc::new(StubVideoSource::new()), 1)
            .expect("start");
        tokio::time::sleep(Duration::from_millis(120)).await;
        detection.cancel();

        let diag = detection.diagnostics_snapshot();
        assert!(diag.passes >= 2, "expected several passes, got {diag:?}");
        assert!(diag.ticks_busy > 0, "expected dropped ticks, got {diag:?}");
        assert_eq!(diag.max_concurrent_passes, 1);
        assert_eq!(backend.max_concurrent_detects(), 1);
    }

    #[tokio::test]
    async fn cancel_discards_in_flight_result_and_stops_ticking() {
        let backend =
            Arc::new(StubExpressionModel::new().with_detect_delay(Duration::from_millis(40)));
        backend.set_default(StubDetection::single("angry", 0.95));
        let (detection, store) = build(Arc::clone(&backend), config(0));

        detection.load_model().await.expect("load");
        detection
            .start(Arc::new(StubVideoSource::new()), 1)
            .expect("start");
        assert!(
            wait_until(Duration::from_secs(1), || backend.detect_count() == 1).await,
            "first pass never started"
        );

        detection.cancel();
        detection.cancel();
        let ticks_at_cancel = detection.diagnostics_snapshot().ticks;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let diag = detection.diagnostics_snapshot();
        assert_eq!(diag.ticks, ticks_at_cancel);
        assert_eq!(diag.results_discarded, 1);
        assert_eq!(backend.detect_count(), 1);
        assert!(store.current().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nothing_is_published_once_cancel_returns() {
        let backend =
            Arc::new(StubExpressionModel::new().with_detect_delay(Duration::from_millis(10)));
        backend.set_default(StubDetection::single("happy", 0.9));

        for _ in 0..10 {
            let (detection, store) = build(Arc::clone(&backend), config(0));
            detection.load_model().await.expect("load");
            detection
                .start(Arc::new(StubVideoSource::new()), 1)
                .expect("start");
            tokio::time::sleep(Duration::from_millis(9)).await;

            detection.cancel();
            let at_cancel = store.current().map(|s| s.timestamp);
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(store.current().map(|s| s.timestamp), at_cancel);
        }
    }

    #[tokio::test]
    async fn paused_source_skips_ticks_and_ended_source_stops_the_loop() {
        let backend = Arc::new(StubExpressionModel::new());
        let (detection, _) = build(Arc::clone(&backend), config(0));
        let video = Arc::new(StubVideoSource::new());
        video.set_readiness(Readiness::Paused);

        detection.load_model().await.expect("load");
        detection.start(video.clone(), 1).expect("start");
        assert!(
            wait_until(Duration::from_secs(1), || {
                detection.diagnostics_snapshot().ticks_not_ready >= 3
            })
            .await
        );
        assert_eq!(backend.detect_count(), 0);

        let mut status_rx = detection.subscribe_status();
        video.set_readiness(Readiness::Ended);
        assert!(wait_until(Duration::from_secs(1), || !detection.is_running()).await);
        assert_eq!(detection.status(), DetectionStatus::Ready);
        let event = status_rx.try_recv().expect("stop event");
        assert_eq!(event.detail.as_deref(), Some("video source ended"));
    }

    #[tokio::test]
    async fn classification_failures_are_swallowed_until_budget_runs_out() {
        let backend = Arc::new(StubExpressionModel::new());
        backend.push([
            StubDetection::Fail("blurry".into()),
            StubDetection::single("happy", 0.9),
        ]);
        backend.set_default(StubDetection::Fail("camera glitch".into()));
        let (detection, store) = build(Arc::clone(&backend), config(5));

        detection.load_model().await.expect("load");
        detection
            .start(Arc::new(StubVideoSource::new()), 1)
            .expect("start");

        assert!(wait_until(Duration::from_secs(2), || !detection.is_running()).await);
        assert_eq!(detection.status(), DetectionStatus::Ready);
        assert_eq!(
            store.current().map(|s| s.label),
            Some(EmotionLabel::Known(Emotion::Happy))
        );
        let diag = detection.diagnostics_snapshot();
        assert!(diag.classification_failures >= 6, "{diag:?}");
    }

    #[tokio::test]
    async fn restart_replaces_the_running_cycle() {
        let backend = Arc::new(StubExpressionModel::new());
        let (detection, _) = build(Arc::clone(&backend), config(0));

        detection.load_model().await.expect("load");
        detection
            .start(Arc::new(StubVideoSource::new()), 1)
            .expect("start first");
        detection
            .start(Arc::new(StubVideoSource::new()), 2)
            .expect("start second");
        assert_eq!(detection.running_source(), Some(2));
        detection.cancel();
        assert!(!detection.is_running());
    }
}
