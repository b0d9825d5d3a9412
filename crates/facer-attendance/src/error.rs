use crate::engine::EngineError;
use crate::location::LocationError;
use crate::store::StoreError;
use facer_core::{CodecError, GeofenceError, PreprocessError, RecognizerError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("invalid face region: {0}")]
    InvalidRegion(String),
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("embedding dimensions differ: stored {stored}, live {live}")]
    DimensionMismatch { stored: usize, live: usize },
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(#[from] GeofenceError),
    #[error("no enrolled face for user {0}")]
    NoEnrollment(String),
    #[error("no such session: {0}")]
    NoSession(String),
    #[error("stored template for {user} is unreadable: {source}")]
    CorruptEnrollment {
        user: String,
        #[source]
        source: CodecError,
    },
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("device location unavailable")]
    LocationUnavailable,
    #[error("location: {0}")]
    Location(#[from] LocationError),
    #[error("inference engine stopped")]
    EngineUnavailable,
}

impl AttendanceError {
    /// Whether re-capturing and trying again can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AttendanceError::NoEnrollment(_)
                | AttendanceError::NoSession(_)
                | AttendanceError::CorruptEnrollment { .. }
                | AttendanceError::DimensionMismatch { .. }
                | AttendanceError::InvalidCoordinate(_)
                | AttendanceError::Store(StoreError::Corrupt { .. })
        )
    }
}

impl From<EngineError> for AttendanceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Preprocess(PreprocessError::InvalidRegion(msg)) => {
                AttendanceError::InvalidRegion(msg)
            }
            EngineError::Recognizer(RecognizerError::ModelUnavailable(msg)) => {
                AttendanceError::ModelUnavailable(msg)
            }
            EngineError::Recognizer(RecognizerError::InferenceFailed(msg)) => {
                AttendanceError::InferenceFailed(msg)
            }
            EngineError::Spawn(_) | EngineError::ChannelClosed => AttendanceError::EngineUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_and_model_errors_are_retryable() {
        assert!(AttendanceError::InvalidRegion("empty".into()).is_retryable());
        assert!(AttendanceError::ModelUnavailable("missing".into()).is_retryable());
        assert!(AttendanceError::LocationUnavailable.is_retryable());
        assert!(AttendanceError::Store(StoreError::Backend("busy".into())).is_retryable());
    }

    #[test]
    fn test_bad_stored_data_is_not_retryable() {
        assert!(!AttendanceError::InvalidCoordinate(GeofenceError::InvalidRadius(-1.0)).is_retryable());
        assert!(!AttendanceError::Store(StoreError::Corrupt {
            key: "sessions/S1".into(),
            reason: "expected object".into(),
        })
        .is_retryable());
        assert!(!AttendanceError::DimensionMismatch { stored: 128, live: 512 }.is_retryable());
    }
}
