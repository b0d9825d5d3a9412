//! Face embedding extraction via ONNX Runtime.
//!
//! The model is a FaceNet-style export taking a `[1, 160, 160, 3]` float
//! tensor and producing one embedding row. Raw output is L2-normalized
//! exactly once, here.

use crate::preprocess::InputTensor;
use crate::types::Embedding;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_EMBEDDING_DIM: usize = 128;
pub const DEFAULT_MODEL_VERSION: &str = "facenet_128";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecognizerError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

impl From<ort::Error> for RecognizerError {
    fn from(e: ort::Error) -> Self {
        RecognizerError::InferenceFailed(format!("ort: {e}"))
    }
}

/// Single-input, single-output numeric model.
pub trait InferenceRuntime {
    fn infer(&mut self, input: &InputTensor) -> Result<Vec<f32>, RecognizerError>;
}

/// ONNX Runtime session over an embedding model file.
pub struct OnnxRuntime {
    session: Session,
}

impl OnnxRuntime {
    /// Load the embedding model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelUnavailable(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(intra_threads))
            .and_then(|b| b.commit_from_file(model_path))
            .map_err(|e| RecognizerError::ModelUnavailable(format!("{}: {e}", model_path.display())))?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session })
    }
}

impl InferenceRuntime for OnnxRuntime {
    fn infer(&mut self, input: &InputTensor) -> Result<Vec<f32>, RecognizerError> {
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.array().view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        Ok(raw.to_vec())
    }
}

type RuntimeLoader<R> = Box<dyn FnOnce() -> Result<R, RecognizerError> + Send>;

enum RuntimeState<R> {
    Pending(RuntimeLoader<R>),
    Ready(R),
    Failed(RecognizerError),
    /// Only observable if a loader panicked mid-initialisation.
    Poisoned,
}

/// Lazily-initialised embedding extractor.
///
/// The runtime is built on the first [`embed`](Self::embed) call and reused
/// afterwards. A failed initialisation is remembered: later calls return the
/// same error instead of retrying the load.
pub struct EmbeddingExtractor<R> {
    state: RuntimeState<R>,
    expected_dim: Option<usize>,
    model_version: String,
}

impl<R: InferenceRuntime> EmbeddingExtractor<R> {
    pub fn new<F>(loader: F) -> Self
    where
        F: FnOnce() -> Result<R, RecognizerError> + Send + 'static,
    {
        Self {
            state: RuntimeState::Pending(Box::new(loader)),
            expected_dim: Some(DEFAULT_EMBEDDING_DIM),
            model_version: DEFAULT_MODEL_VERSION.to_string(),
        }
    }

    /// Require the model to emit exactly `dim` values (`None` accepts any length).
    pub fn with_expected_dim(mut self, dim: Option<usize>) -> Self {
        self.expected_dim = dim;
        self
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = version.into();
        self
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, RuntimeState::Ready(_))
    }

    fn runtime(&mut self) -> Result<&mut R, RecognizerError> {
        if matches!(self.state, RuntimeState::Pending(_)) {
            self.state = match std::mem::replace(&mut self.state, RuntimeState::Poisoned) {
                RuntimeState::Pending(loader) => match loader() {
                    Ok(runtime) => {
                        tracing::debug!("embedding runtime initialised");
                        RuntimeState::Ready(runtime)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "embedding runtime initialisation failed");
                        RuntimeState::Failed(e)
                    }
                },
                other => other,
            };
        }

        match &mut self.state {
            RuntimeState::Ready(runtime) => Ok(runtime),
            RuntimeState::Failed(e) => Err(e.clone()),
            RuntimeState::Pending(_) | RuntimeState::Poisoned => Err(
                RecognizerError::ModelUnavailable("runtime initialisation did not complete".into()),
            ),
        }
    }

    /// Run the model on a prepared tensor and return a unit-length embedding.
    pub fn embed(&mut self, input: &InputTensor) -> Result<Embedding, RecognizerError> {
        let expected_dim = self.expected_dim;
        let raw = self.runtime()?.infer(input)?;

        if raw.is_empty() {
            return Err(RecognizerError::InferenceFailed("model returned an empty vector".into()));
        }
        if let Some(dim) = expected_dim {
            if raw.len() != dim {
                return Err(RecognizerError::InferenceFailed(format!(
                    "expected {dim}-dim embedding, got {}",
                    raw.len()
                )));
            }
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(RecognizerError::InferenceFailed("model output contains NaN/inf".into()));
        }
        // A zero vector would normalize to zero and must never stand in for a face.
        if raw.iter().all(|v| *v == 0.0) {
            return Err(RecognizerError::InferenceFailed("model returned an all-zero vector".into()));
        }

        Ok(Embedding::from_raw(raw, Some(self.model_version.clone())))
    }
}

impl EmbeddingExtractor<OnnxRuntime> {
    /// Extractor that loads `model_path` on first use.
    pub fn onnx(model_path: PathBuf, intra_threads: usize) -> Self {
        Self::new(move || OnnxRuntime::load(&model_path, intra_threads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::{preprocess, PreprocessOptions, RawImageRegion};
    use crate::types::BoundingBox;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Returns channel sums over a few pixels; enough to tell inputs apart.
    struct FakeRuntime {
        dim: usize,
    }

    impl InferenceRuntime for FakeRuntime {
        fn infer(&mut self, input: &InputTensor) -> Result<Vec<f32>, RecognizerError> {
            let data = input.as_slice();
            Ok((0..self.dim).map(|i| data[i % data.len()] + 1.5 + i as f32).collect())
        }
    }

    struct ConstRuntime(Vec<f32>);

    impl InferenceRuntime for ConstRuntime {
        fn infer(&mut self, _input: &InputTensor) -> Result<Vec<f32>, RecognizerError> {
            Ok(self.0.clone())
        }
    }

    fn tensor() -> InputTensor {
        let region = RawImageRegion::new(
            image::RgbImage::from_pixel(32, 32, image::Rgb([90, 140, 200])),
            BoundingBox { x: 4.0, y: 4.0, width: 24.0, height: 24.0 },
        );
        preprocess(&region, &PreprocessOptions { size: 16, pad_ratio: 0.25 }).unwrap()
    }

    #[test]
    fn test_embedding_is_unit_norm() {
        let mut ex = EmbeddingExtractor::new(|| Ok(FakeRuntime { dim: 128 }));
        let e = ex.embed(&tensor()).unwrap();
        assert_eq!(e.dim(), 128);
        assert!((e.norm() - 1.0).abs() < 1e-4);
        assert_eq!(e.model_version.as_deref(), Some(DEFAULT_MODEL_VERSION));
    }

    #[test]
    fn test_self_similarity() {
        let mut ex = EmbeddingExtractor::new(|| Ok(FakeRuntime { dim: 128 }));
        let a = ex.embed(&tensor()).unwrap();
        let b = ex.embed(&tensor()).unwrap();
        assert!((a.similarity(&b).unwrap() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_lazy_init_runs_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let mut ex = EmbeddingExtractor::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(FakeRuntime { dim: 128 })
        });
        assert!(!ex.is_initialized());
        assert_eq!(loads.load(Ordering::SeqCst), 0);

        ex.embed(&tensor()).unwrap();
        ex.embed(&tensor()).unwrap();
        assert!(ex.is_initialized());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_init_failure_is_cached() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let mut ex = EmbeddingExtractor::<FakeRuntime>::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(RecognizerError::ModelUnavailable("missing artifact".into()))
        });

        let first = ex.embed(&tensor()).unwrap_err();
        let second = ex.embed(&tensor()).unwrap_err();
        assert_eq!(first, RecognizerError::ModelUnavailable("missing artifact".into()));
        assert_eq!(first, second);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_model_file() {
        let mut ex = EmbeddingExtractor::onnx(PathBuf::from("/nonexistent/face_embedder.onnx"), 1);
        assert!(matches!(ex.embed(&tensor()), Err(RecognizerError::ModelUnavailable(_))));
    }

    #[test]
    fn test_wrong_dimension_rejected() {
        let mut ex = EmbeddingExtractor::new(|| Ok(FakeRuntime { dim: 64 }));
        assert!(matches!(ex.embed(&tensor()), Err(RecognizerError::InferenceFailed(_))));

        let mut ex = EmbeddingExtractor::new(|| Ok(FakeRuntime { dim: 64 })).with_expected_dim(None);
        assert_eq!(ex.embed(&tensor()).unwrap().dim(), 64);
    }

    #[test]
    fn test_zero_output_rejected() {
        let mut ex = EmbeddingExtractor::new(|| Ok(ConstRuntime(vec![0.0; 128])));
        assert!(matches!(ex.embed(&tensor()), Err(RecognizerError::InferenceFailed(_))));
    }

    #[test]
    fn test_nan_output_rejected() {
        let mut out = vec![0.5; 128];
        out[7] = f32::NAN;
        let mut ex = EmbeddingExtractor::new(move || Ok(ConstRuntime(out)));
        assert!(matches!(ex.embed(&tensor()), Err(RecognizerError::InferenceFailed(_))));
    }
}
