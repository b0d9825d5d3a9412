//! Class session metadata: method and optional geofence.

use crate::store::{keys, DocumentStore, FieldValue, StoreError, Update};
use chrono::{DateTime, Utc};
use facer_core::{GeoPoint, GeofenceError, GeofenceSpec};
use serde::{Deserialize, Serialize};

pub const DEFAULT_METHOD: &str = "face";

fn default_method() -> String {
    DEFAULT_METHOD.to_string()
}

/// A session document at `sessions/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub course_id: String,
    #[serde(default)]
    pub title: String,
    /// Attendance method recorded on each attendance entry.
    #[serde(default = "default_method")]
    pub method: String,
    // Optional fields serialize as null so a re-save clears them.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub center: Option<GeoPoint>,
    #[serde(default)]
    pub radius_m: Option<f64>,
}

impl Session {
    pub fn new(id: impl Into<String>, course_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            course_id: course_id.into(),
            title: String::new(),
            method: default_method(),
            start_time: None,
            end_time: None,
            center: None,
            radius_m: None,
        }
    }

    pub fn with_geofence(mut self, center: GeoPoint, radius_m: f64) -> Self {
        self.center = Some(center);
        self.radius_m = Some(radius_m);
        self
    }

    /// The session's geofence, if it defines a center.
    ///
    /// A center without a radius uses `default_radius_m`.
    pub fn geofence(&self, default_radius_m: f64) -> Result<Option<GeofenceSpec>, GeofenceError> {
        self.center
            .map(|center| GeofenceSpec::new(center, self.radius_m.unwrap_or(default_radius_m)))
            .transpose()
    }
}

/// Write `session` to the store (merge-upsert).
pub async fn save_session(store: &dyn DocumentStore, session: &Session) -> Result<(), StoreError> {
    let key = keys::session(&session.id);
    let value = serde_json::to_value(session).map_err(|e| StoreError::Corrupt {
        key: key.clone(),
        reason: e.to_string(),
    })?;

    let update: Update = match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| (k, FieldValue::Value(v)))
            .collect(),
        other => {
            return Err(StoreError::Corrupt {
                key,
                reason: format!("session serialized to non-object {other}"),
            })
        }
    };

    store.merge_document(&key, update).await?;
    tracing::info!(session = %session.id, course = %session.course_id, "session saved");
    Ok(())
}

/// Read the session document, or `None` if it does not exist.
pub async fn load_session(
    store: &dyn DocumentStore,
    session_id: &str,
) -> Result<Option<Session>, StoreError> {
    let key = keys::session(session_id);
    let Some(fields) = store.get_document(&key).await? else {
        return Ok(None);
    };

    let mut session: Session = serde_json::from_value(serde_json::Value::Object(fields))
        .map_err(|e| StoreError::Corrupt {
            key,
            reason: e.to_string(),
        })?;
    session.id = session_id.to_string();
    Ok(Some(session))
}
