//! Great-circle distance and circular geofence checks.
//!
//! Spherical-earth haversine; accurate to well under a metre at the
//! tens-to-hundreds of metres radii sessions use.

use crate::types::GeoPoint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const DEFAULT_RADIUS_M: f64 = 150.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeofenceError {
    #[error("invalid coordinate: lat={lat}, lng={lng}")]
    InvalidCoordinate { lat: f64, lng: f64 },
    #[error("invalid geofence radius: {0} m")]
    InvalidRadius(f64),
}

impl GeoPoint {
    /// Reject NaN/inf and values outside ±90° latitude / ±180° longitude.
    pub fn validate(&self) -> Result<(), GeofenceError> {
        let ok = self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng);
        if ok {
            Ok(())
        } else {
            Err(GeofenceError::InvalidCoordinate {
                lat: self.lat,
                lng: self.lng,
            })
        }
    }
}

/// Haversine distance in metres between two points.
pub fn distance_meters(p1: &GeoPoint, p2: &GeoPoint) -> Result<f64, GeofenceError> {
    p1.validate()?;
    p2.validate()?;

    let d_lat = (p2.lat - p1.lat).to_radians();
    let d_lng = (p2.lng - p1.lng).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + p1.lat.to_radians().cos() * p2.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    // Rounding can push `a` a hair past 1 for antipodal points.
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    Ok(EARTH_RADIUS_M * c)
}

/// Closed-boundary membership test: exactly `radius_m` away counts as inside.
pub fn inside(current: &GeoPoint, center: &GeoPoint, radius_m: f64) -> Result<bool, GeofenceError> {
    Ok(distance_meters(current, center)? <= radius_m)
}

/// Circular region a session restricts attendance to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeofenceSpec {
    pub center: GeoPoint,
    pub radius_m: f64,
}

/// Outcome of checking a position against a [`GeofenceSpec`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeofenceVerdict {
    pub distance_m: f64,
    pub inside: bool,
}

impl GeofenceSpec {
    pub fn new(center: GeoPoint, radius_m: f64) -> Result<Self, GeofenceError> {
        let spec = Self { center, radius_m };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), GeofenceError> {
        self.center.validate()?;
        if !self.radius_m.is_finite() || self.radius_m <= 0.0 {
            return Err(GeofenceError::InvalidRadius(self.radius_m));
        }
        Ok(())
    }

    pub fn check(&self, current: &GeoPoint) -> Result<GeofenceVerdict, GeofenceError> {
        self.validate()?;
        let distance_m = distance_meters(current, &self.center)?;
        Ok(GeofenceVerdict {
            distance_m,
            inside: distance_m <= self.radius_m,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CENTER: GeoPoint = GeoPoint { lat: 4.3852, lng: 100.9675 };

    /// Point `meters` due north of `p` on the model sphere.
    fn north_of(p: &GeoPoint, meters: f64) -> GeoPoint {
        GeoPoint::new(p.lat + (meters / EARTH_RADIUS_M).to_degrees(), p.lng)
    }

    #[test]
    fn test_same_point_is_zero() {
        assert_eq!(distance_meters(&CENTER, &CENTER).unwrap(), 0.0);
        assert!(inside(&CENTER, &CENTER, 150.0).unwrap());
    }

    #[test]
    fn test_one_degree_latitude() {
        let d = distance_meters(&GeoPoint::new(0.0, 0.0), &GeoPoint::new(1.0, 0.0)).unwrap();
        let expected = EARTH_RADIUS_M * 1.0f64.to_radians();
        assert!((d - expected).abs() < 1e-6, "got {d}, expected {expected}");
    }

    #[test]
    fn test_known_city_pair() {
        // London → Paris ≈ 343.5 km on a 6371 km sphere
        let london = GeoPoint::new(51.5074, -0.1278);
        let paris = GeoPoint::new(48.8566, 2.3522);
        let d = distance_meters(&london, &paris).unwrap();
        assert!((d - 343_500.0).abs() < 1_000.0, "got {d}");
    }

    #[test]
    fn test_symmetric() {
        let p = GeoPoint::new(4.3900, 100.9600);
        assert_eq!(
            distance_meters(&p, &CENTER).unwrap(),
            distance_meters(&CENTER, &p).unwrap()
        );
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let p = north_of(&CENTER, 120.0);
        let d = distance_meters(&p, &CENTER).unwrap();
        assert!(inside(&p, &CENTER, d).unwrap());
        assert!(!inside(&p, &CENTER, d - 1e-6).unwrap());
    }

    #[test]
    fn test_500m_outside_150m_fence() {
        let p = north_of(&CENTER, 500.0);
        let spec = GeofenceSpec::new(CENTER, 150.0).unwrap();
        let verdict = spec.check(&p).unwrap();
        assert!((verdict.distance_m - 500.0).abs() < 0.01, "got {}", verdict.distance_m);
        assert!(!verdict.inside);
    }

    #[test]
    fn test_antipodal_points() {
        let d = distance_meters(&GeoPoint::new(0.0, 0.0), &GeoPoint::new(0.0, 180.0)).unwrap();
        assert!((d - EARTH_RADIUS_M * std::f64::consts::PI).abs() < 1e-3);
    }

    #[test]
    fn test_invalid_coordinates() {
        let bad = [
            GeoPoint::new(91.0, 0.0),
            GeoPoint::new(0.0, -180.5),
            GeoPoint::new(f64::NAN, 0.0),
            GeoPoint::new(0.0, f64::INFINITY),
        ];
        for p in bad {
            assert!(matches!(
                distance_meters(&p, &CENTER),
                Err(GeofenceError::InvalidCoordinate { .. })
            ));
            assert!(inside(&CENTER, &p, 150.0).is_err());
        }
    }

    #[test]
    fn test_invalid_radius() {
        assert_eq!(GeofenceSpec::new(CENTER, 0.0), Err(GeofenceError::InvalidRadius(0.0)));
        assert!(GeofenceSpec::new(CENTER, -5.0).is_err());
        assert!(GeofenceSpec::new(CENTER, f64::NAN).is_err());
    }
}
