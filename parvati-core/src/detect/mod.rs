//! Facial-expression detection.
//!
//! The `ExpressionModel` trait decouples the loop from any specific
//! classifier backend (the stub used in tests and the host demo, an ONNX
//! face-localisation + expression pair, a remote service, ...).
//!
//! ```text
//! VideoSource ──frame──► ExpressionModel::detect ──scores──► select_dominant
//!                                                                 │
//!                                              confidence > threshold?
//!                                                                 │
//!                                                  EmotionStateStore::publish
//! ```

pub mod model;
pub mod runner;
pub mod stub;

pub use model::SharedModel;
pub use runner::{DetectionLoop, DiagnosticsSnapshot};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::media::Frame;

/// Face location in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One localised face with its expression scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceDetection {
    pub face_box: FaceBox,
    /// Raw classifier labels and scores, in the classifier's own order.
    pub expressions: Vec<(String, f32)>,
}

/// Contract for expression classification backends.
#[async_trait]
pub trait ExpressionModel: Send + Sync + 'static {
    /// Load the face-localisation and expression sub-models.
    ///
    /// Called through `SharedModel`, which guarantees a single in-flight load.
    ///
    /// # Errors
    /// `SessionError::ModelLoadFailed` if weights are missing or corrupt.
    async fn load_models(&self) -> Result<()>;

    /// Localise a single face in `frame` and score its expressions.
    ///
    /// Returns `Ok(None)` when no face is found.
    ///
    /// # Errors
    /// `SessionError::ClassificationFailed` for a failed pass.
    async fn detect(&self, frame: &Frame) -> Result<Option<FaceDetection>>;
}
