use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Guard added to norms so a degenerate all-zero vector never divides by zero.
pub const NORM_EPSILON: f32 = 1e-10;

/// Default cosine similarity threshold for a positive match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimilarityError {
    #[error("embedding dimensions differ: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("embedding blob is empty")]
    Empty,
    #[error("embedding blob length {0} is not a multiple of 4")]
    Misaligned(usize),
}

/// Axis-aligned face bounding box in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Face embedding vector (128-dimensional for the default FaceNet export).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "facenet_128").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Wrap raw model output, L2-normalizing it as `v / (‖v‖ + ε)`.
    pub fn from_raw(raw: Vec<f32>, model_version: Option<String>) -> Self {
        Self {
            values: l2_normalize(raw),
            model_version,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        norm(&self.values)
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Norms are recomputed
    /// on every call so the score is correct for non-normalized input too.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, SimilarityError> {
        if self.values.len() != other.values.len() {
            return Err(SimilarityError::DimensionMismatch {
                left: self.values.len(),
                right: other.values.len(),
            });
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let score = dot / (norm_a.sqrt() * norm_b.sqrt() + NORM_EPSILON);
        Ok(score.clamp(-1.0, 1.0))
    }

    /// Encode as concatenated little-endian `f32`s (`4 * dim` bytes).
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.values.len() * 4);
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Decode the little-endian blob written by [`to_le_bytes`](Self::to_le_bytes).
    ///
    /// Values are taken verbatim; a stored template is not re-normalized.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::Empty);
        }
        if bytes.len() % 4 != 0 {
            return Err(CodecError::Misaligned(bytes.len()));
        }

        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            values,
            model_version: None,
        })
    }
}

/// Match policy: a score at or above the threshold is a match.
pub fn is_match(score: f32, threshold: f32) -> bool {
    score >= threshold
}

fn norm(values: &[f32]) -> f32 {
    values.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// L2-normalize with an epsilon guard; an all-zero vector stays all-zero.
pub fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let denom = norm(&raw) + NORM_EPSILON;
    raw.into_iter().map(|x| x / denom).collect()
}

/// WGS-84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding { values, model_version: None }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(vec![1.0, 0.0, 0.0]);
        let b = emb(vec![1.0, 0.0, 0.0]);
        let score = a.similarity(&b).unwrap();
        assert!((score - 1.0).abs() < 1e-6);
        assert!(is_match(score, DEFAULT_MATCH_THRESHOLD));
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(vec![1.0, 0.0, 0.0]);
        let b = emb(vec![0.0, 1.0, 0.0]);
        let score = a.similarity(&b).unwrap();
        assert!(score.abs() < 1e-6);
        assert!(!is_match(score, DEFAULT_MATCH_THRESHOLD));
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![-1.0, 0.0]);
        assert!((a.similarity(&b).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![1.0, 0.0]);
        let score = a.similarity(&b).unwrap();
        assert_eq!(score, 0.0);
        assert!(!score.is_nan());
    }

    #[test]
    fn test_similarity_unnormalized_input() {
        // Same direction, different magnitudes
        let a = emb(vec![3.0, 4.0]);
        let b = emb(vec![0.6, 0.8]);
        assert!((a.similarity(&b).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_symmetric() {
        let a = emb(vec![0.2, -0.7, 0.4, 0.1]);
        let b = emb(vec![-0.3, 0.5, 0.9, 0.05]);
        assert_eq!(a.similarity(&b).unwrap(), b.similarity(&a).unwrap());
    }

    #[test]
    fn test_similarity_dimension_mismatch() {
        let a = emb(vec![1.0, 0.0, 0.0]);
        let b = emb(vec![1.0, 0.0]);
        assert_eq!(
            a.similarity(&b),
            Err(SimilarityError::DimensionMismatch { left: 3, right: 2 })
        );
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert!(is_match(0.5, 0.5));
        assert!(!is_match(0.4999, 0.5));
    }

    #[test]
    fn test_from_raw_is_unit_length() {
        let e = Embedding::from_raw(vec![3.0, 4.0, 12.0], None);
        assert!((e.norm() - 1.0).abs() < 1e-4);
        assert!((e.similarity(&e).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector_stays_finite() {
        let v = l2_normalize(vec![0.0; 4]);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_le_bytes_roundtrip_exact() {
        let e = Embedding::from_raw(vec![0.1, -2.5, 1e-7, 42.0], None);
        let bytes = e.to_le_bytes();
        assert_eq!(bytes.len(), 16);
        let back = Embedding::from_le_bytes(&bytes).unwrap();
        assert_eq!(
            back.values.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            e.values.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_le_bytes_layout() {
        let e = emb(vec![1.0]);
        assert_eq!(e.to_le_bytes(), vec![0x00, 0x00, 0x80, 0x3f]);
    }

    #[test]
    fn test_from_le_bytes_rejects_bad_length() {
        assert_eq!(Embedding::from_le_bytes(&[]).unwrap_err(), CodecError::Empty);
        assert_eq!(
            Embedding::from_le_bytes(&[0, 0, 0, 0, 0]).unwrap_err(),
            CodecError::Misaligned(5)
        );
    }

    #[test]
    fn test_geopoint_field_names() {
        let p: GeoPoint = serde_json::from_str(r#"{"lat": 4.3852, "lng": 100.9675}"#).unwrap();
        assert_eq!(p, GeoPoint::new(4.3852, 100.9675));
    }
}
