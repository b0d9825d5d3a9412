//! Device location boundary.

use async_trait::async_trait;
use facer_core::GeoPoint;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocationError {
    #[error("location provider failed: {0}")]
    Provider(String),
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Most recent fix, or `None` when the device has no location yet.
    async fn last_known_location(&self) -> Result<Option<GeoPoint>, LocationError>;
}

/// Provider that always reports the same position (or none).
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLocation(pub Option<GeoPoint>);

impl FixedLocation {
    pub fn at(lat: f64, lng: f64) -> Self {
        Self(Some(GeoPoint::new(lat, lng)))
    }

    pub fn unavailable() -> Self {
        Self(None)
    }
}

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn last_known_location(&self) -> Result<Option<GeoPoint>, LocationError> {
        Ok(self.0)
    }
}
