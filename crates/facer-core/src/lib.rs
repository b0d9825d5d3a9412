//! facer-core — Face embedding and presence primitives.
//!
//! Crops and normalizes detected faces, extracts L2-normalized embeddings
//! through ONNX Runtime, scores them by cosine similarity, and checks
//! GPS positions against circular geofences.

pub mod geofence;
pub mod preprocess;
pub mod recognizer;
pub mod types;

pub use geofence::{distance_meters, inside, GeofenceError, GeofenceSpec, GeofenceVerdict};
pub use preprocess::{preprocess, InputTensor, PreprocessError, PreprocessOptions, RawImageRegion};
pub use recognizer::{EmbeddingExtractor, InferenceRuntime, OnnxRuntime, RecognizerError};
pub use types::{is_match, BoundingBox, CodecError, Embedding, GeoPoint, SimilarityError};
