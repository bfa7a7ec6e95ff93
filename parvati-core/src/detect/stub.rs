//! `StubExpressionModel` — scripted classifier with no real inference.
//!
//! Replays a queue of canned outcomes, then repeats a default one, so the
//! full session → loop → store path can be exercised end to end. It also
//! tracks how many `detect` calls overlap, which the loop tests rely on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{ExpressionModel, FaceBox, FaceDetection};
use crate::error::{Result, SessionError};
use crate::media::Frame;

/// One canned `detect` outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum StubDetection {
    Face(Vec<(String, f32)>),
    NoFace,
    Fail(String),
}

impl StubDetection {
    /// A face whose only non-trivial score is `label` at `score`.
    pub fn single(label: &str, score: f32) -> Self {
        StubDetection::Face(vec![
            ("neutral".to_string(), (1.0 - score).max(0.0) / 2.0),
            (label.to_string(), score),
        ])
    }
}

pub struct StubExpressionModel {
    load_delay: Duration,
    detect_delay: Duration,
    failing_loads: AtomicUsize,
    script: Mutex<VecDeque<StubDetection>>,
    fallback: Mutex<StubDetection>,
    loads: AtomicUsize,
    detections: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubExpressionModel {
    pub fn new() -> Self {
        Self {
            load_delay: Duration::ZERO,
            detect_delay: Duration::ZERO,
            failing_loads: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(StubDetection::single("neutral", 0.9)),
            loads: AtomicUsize::new(0),
            detections: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn with_detect_delay(mut self, delay: Duration) -> Self {
        self.detect_delay = delay;
        self
    }

    /// Make the next `n` loads fail.
    pub fn fail_next_loads(&self, n: usize) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }

    /// Queue outcomes to replay before falling back to the default.
    pub fn push(&self, outcomes: impl IntoIterator<Item = StubDetection>) {
        self.script.lock().extend(outcomes);
    }

    /// Outcome repeated once the script is exhausted.
    pub fn set_default(&self, outcome: StubDetection) {
        *self.fallback.lock() = outcome;
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn detect_count(&self) -> usize {
        self.detections.load(Ordering::SeqCst)
    }

    /// Highest number of `detect` calls observed running at once.
    pub fn max_concurrent_detects(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> StubDetection {
        match self.script.lock().pop_front() {
            Some(outcome) => outcome,
            None => self.fallback.lock().clone(),
        }
    }
}

impl Default for StubExpressionModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExpressionModel for StubExpressionModel {
    async fn load_models(&self) -> Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        let failing = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SessionError::ModelLoadFailed(
                "stub: weights unavailable".into(),
            ));
        }
        debug!("StubExpressionModel::load_models — ready");
        Ok(())
    }

    async fn detect(&self, frame: &Frame) -> Result<Option<FaceDetection>> {
        self.detections.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.detect_delay.is_zero() {
            tokio::time::sleep(self.detect_delay).await;
        }
        let outcome = self.next_outcome();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            StubDetection::Face(expressions) => Ok(Some(FaceDetection {
                face_box: FaceBox {
                    x: frame.width as f32 * 0.25,
                    y: frame.height as f32 * 0.2,
                    width: frame.width as f32 * 0.5,
                    height: frame.height as f32 * 0.6,
                },
                expressions,
            })),
            StubDetection::NoFace => Ok(None),
            StubDetection::Fail(msg) => Err(SessionError::ClassificationFailed(msg)),
        }
    }
}
