use thiserror::Error;

use crate::media::Device;

/// Failure reported by a `MediaSource` while acquiring or probing a device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// The user or host refused access ("not-allowed").
    #[error("{device} permission denied")]
    PermissionDenied { device: Device },

    /// Device busy, absent, or revoked mid-acquisition.
    #[error("{device} unavailable: {detail}")]
    DeviceUnavailable { device: Device, detail: String },
}

impl AcquireError {
    /// `true` for the permission class of failures.
    pub fn is_not_allowed(&self) -> bool {
        matches!(self, AcquireError::PermissionDenied { .. })
    }
}

/// All errors produced by parvati-core.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{device} permission denied")]
    PermissionDenied { device: Device },

    #[error("media acquisition failed: {reason}")]
    MediaAcquisitionFailed { reason: AcquireError },

    #[error("expression model failed to load: {0}")]
    ModelLoadFailed(String),

    #[error("classification failed: {0}")]
    ClassificationFailed(String),

    #[error("expression model is not loaded")]
    ModelNotLoaded,
}

impl From<AcquireError> for SessionError {
    fn from(reason: AcquireError) -> Self {
        SessionError::MediaAcquisitionFailed { reason }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
