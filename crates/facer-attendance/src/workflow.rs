//! Enrollment and attendance verification.
//!
//! Verification runs strictly in order, each step gating the next:
//! fetch enrollment → load session → extract live embedding → score →
//! geofence check → commit. Only the final commit writes, and it is an
//! idempotent merge-upsert keyed by (session, user).

use crate::engine::FaceEmbedder;
use crate::error::AttendanceError;
use crate::location::LocationProvider;
use crate::session::{load_session, Session};
use crate::store::{keys, DocumentStore, FieldValue, Fields, Update};
use facer_core::geofence::DEFAULT_RADIUS_M;
use facer_core::types::DEFAULT_MATCH_THRESHOLD;
use facer_core::{is_match, Embedding, RawImageRegion, SimilarityError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const STATUS_PRESENT: &str = "present";

/// Tunables for match and presence decisions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkflowSettings {
    /// Minimum cosine similarity for an identity match (inclusive).
    pub threshold: f32,
    /// Radius used when a session has a center but no `radius_m`.
    pub default_radius_m: f64,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            default_radius_m: DEFAULT_RADIUS_M,
        }
    }
}

/// An attendance document at `sessions/{session}/attendance/{user}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    #[serde(rename = "uid")]
    pub user_id: String,
    pub session_id: String,
    pub status: String,
    pub method: String,
    /// Server-assigned RFC 3339 time of the last write.
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Terminal result of one verification attempt.
#[derive(Debug)]
pub enum AttendanceOutcome {
    /// Identity confirmed and presence satisfied; attendance recorded.
    MatchedAndPresent { similarity: f32 },
    /// Identity confirmed but the device is outside the session geofence.
    MatchedOutsideGeofence {
        similarity: f32,
        distance_m: f64,
        radius_m: f64,
    },
    NotMatched { similarity: f32 },
    NoEnrollment,
    NoSession,
    /// The attempt could not be decided; re-capture and retry.
    TransientFailure(AttendanceError),
}

impl AttendanceOutcome {
    pub fn is_present(&self) -> bool {
        matches!(self, AttendanceOutcome::MatchedAndPresent { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AttendanceOutcome::TransientFailure(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<AttendanceError> for AttendanceOutcome {
    fn from(e: AttendanceError) -> Self {
        match e {
            AttendanceError::NoEnrollment(_) => AttendanceOutcome::NoEnrollment,
            AttendanceError::NoSession(_) => AttendanceOutcome::NoSession,
            other => AttendanceOutcome::TransientFailure(other),
        }
    }
}

impl fmt::Display for AttendanceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttendanceOutcome::MatchedAndPresent { similarity } => {
                write!(f, "attendance recorded (similarity {similarity:.3})")
            }
            AttendanceOutcome::MatchedOutsideGeofence {
                similarity,
                distance_m,
                radius_m,
            } => write!(
                f,
                "face matched (similarity {similarity:.3}) but {distance_m:.0} m from session, limit {radius_m:.0} m"
            ),
            AttendanceOutcome::NotMatched { similarity } => {
                write!(f, "face not recognized (similarity {similarity:.3})")
            }
            AttendanceOutcome::NoEnrollment => write!(f, "no enrolled face; enroll first"),
            AttendanceOutcome::NoSession => write!(f, "session not found"),
            AttendanceOutcome::TransientFailure(e) => write!(f, "verification failed: {e}"),
        }
    }
}

/// Orchestrates enrollment and verification over injected collaborators.
pub struct AttendanceWorkflow {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<dyn FaceEmbedder>,
    location: Arc<dyn LocationProvider>,
    settings: WorkflowSettings,
}

impl AttendanceWorkflow {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn FaceEmbedder>,
        location: Arc<dyn LocationProvider>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            location,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// Extract an embedding from `region` and store it as `user_id`'s template,
    /// replacing any previous enrollment.
    pub async fn enroll(
        &self,
        user_id: &str,
        region: RawImageRegion,
    ) -> Result<Embedding, AttendanceError> {
        let embedding = self.embedder.embed(region).await?;

        self.store
            .put_blob(&keys::embedding(user_id), &embedding.to_le_bytes())
            .await?;

        let mut update = Update::new();
        update.insert("face_template".into(), true.into());
        update.insert("template_id".into(), uuid::Uuid::new_v4().to_string().into());
        update.insert("dim".into(), (embedding.dim() as i64).into());
        if let Some(version) = &embedding.model_version {
            update.insert("model_version".into(), version.as_str().into());
        }
        update.insert("enrolled_at".into(), FieldValue::ServerTimestamp);
        self.store.merge_document(&keys::user(user_id), update).await?;

        tracing::info!(user = user_id, dim = embedding.dim(), "face enrolled");
        Ok(embedding)
    }

    /// Read `user_id`'s stored template.
    pub async fn fetch_enrollment(&self, user_id: &str) -> Result<Embedding, AttendanceError> {
        let bytes = self
            .store
            .get_blob(&keys::embedding(user_id))
            .await?
            .ok_or_else(|| AttendanceError::NoEnrollment(user_id.to_string()))?;

        Embedding::from_le_bytes(&bytes).map_err(|source| AttendanceError::CorruptEnrollment {
            user: user_id.to_string(),
            source,
        })
    }

    /// Run one verification attempt for `user_id` in `session_id`.
    ///
    /// Never retries internally. Confident denials are outcomes, not errors.
    pub async fn verify(
        &self,
        user_id: &str,
        session_id: &str,
        region: RawImageRegion,
    ) -> AttendanceOutcome {
        let outcome = self
            .run_verify(user_id, session_id, region)
            .await
            .unwrap_or_else(AttendanceOutcome::from);

        match &outcome {
            AttendanceOutcome::TransientFailure(e) => {
                tracing::warn!(user = user_id, session = session_id, error = %e, "verify: transient failure")
            }
            other => {
                tracing::info!(user = user_id, session = session_id, outcome = %other, "verify: done")
            }
        }
        outcome
    }

    async fn run_verify(
        &self,
        user_id: &str,
        session_id: &str,
        region: RawImageRegion,
    ) -> Result<AttendanceOutcome, AttendanceError> {
        let stored = self.fetch_enrollment(user_id).await?;

        let session = load_session(self.store.as_ref(), session_id)
            .await?
            .ok_or_else(|| AttendanceError::NoSession(session_id.to_string()))?;

        let live = self.embedder.embed(region).await?;

        let similarity = stored.similarity(&live).map_err(|e| match e {
            SimilarityError::DimensionMismatch { left, right } => {
                AttendanceError::DimensionMismatch {
                    stored: left,
                    live: right,
                }
            }
        })?;
        tracing::debug!(user = user_id, similarity, threshold = self.settings.threshold, "verify: scored");

        if !is_match(similarity, self.settings.threshold) {
            return Ok(AttendanceOutcome::NotMatched { similarity });
        }

        if let Some(fence) = session.geofence(self.settings.default_radius_m)? {
            let current = self
                .location
                .last_known_location()
                .await?
                .ok_or(AttendanceError::LocationUnavailable)?;
            let verdict = fence.check(&current)?;
            tracing::debug!(
                distance_m = verdict.distance_m,
                radius_m = fence.radius_m,
                inside = verdict.inside,
                "verify: geofence"
            );
            if !verdict.inside {
                return Ok(AttendanceOutcome::MatchedOutsideGeofence {
                    similarity,
                    distance_m: verdict.distance_m,
                    radius_m: fence.radius_m,
                });
            }
        }

        self.commit(&session, user_id).await?;
        Ok(AttendanceOutcome::MatchedAndPresent { similarity })
    }

    /// Mark `user_id` present in `session`. Safe to repeat: the record is
    /// upserted in place and later writes win.
    pub async fn commit(&self, session: &Session, user_id: &str) -> Result<(), AttendanceError> {
        let mut update = Update::new();
        update.insert("uid".into(), user_id.into());
        update.insert("session_id".into(), session.id.as_str().into());
        update.insert("status".into(), STATUS_PRESENT.into());
        update.insert("method".into(), session.method.as_str().into());
        update.insert("timestamp".into(), FieldValue::ServerTimestamp);

        self.store
            .merge_document(&keys::attendance(&session.id, user_id), update)
            .await?;
        tracing::info!(user = user_id, session = %session.id, "attendance committed");
        Ok(())
    }

    pub async fn attendance_status(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<AttendanceRecord>, AttendanceError> {
        attendance_status(self.store.as_ref(), session_id, user_id).await
    }

    pub async fn roster(&self, session_id: &str) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        roster(self.store.as_ref(), session_id).await
    }
}

/// Read `user_id`'s attendance record in `session_id`, if any.
pub async fn attendance_status(
    store: &dyn DocumentStore,
    session_id: &str,
    user_id: &str,
) -> Result<Option<AttendanceRecord>, AttendanceError> {
    let key = keys::attendance(session_id, user_id);
    match store.get_document(&key).await? {
        Some(fields) => Ok(Some(parse_record(&key, fields)?)),
        None => Ok(None),
    }
}

/// Every attendance record in `session_id`, ordered by user id.
pub async fn roster(
    store: &dyn DocumentStore,
    session_id: &str,
) -> Result<Vec<AttendanceRecord>, AttendanceError> {
    let docs = store.list_documents(&keys::attendance_prefix(session_id)).await?;
    let mut records = docs
        .into_iter()
        .map(|(key, fields)| parse_record(&key, fields))
        .collect::<Result<Vec<_>, _>>()?;
    records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    Ok(records)
}

fn parse_record(key: &str, fields: Fields) -> Result<AttendanceRecord, AttendanceError> {
    serde_json::from_value(serde_json::Value::Object(fields)).map_err(|e| {
        AttendanceError::Store(crate::store::StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    })
}
